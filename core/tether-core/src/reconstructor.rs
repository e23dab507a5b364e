//! Reassembles streamed reply fragments into one markdown message.
//!
//! One reconstruction per remote session id. `header` and `section`
//! fragments open a titled section that following `text` fragments append
//! to; `code`, `list` and `divider` are self-contained.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tether_protocol::{CompletionMetadata, FragmentKind, StreamFragment};

use crate::types::{new_id, Message, MessageSessionMetadata, Sender, StreamingState};

#[derive(Debug, Clone, PartialEq)]
enum SectionKind {
    Text,
    Header { level: u8 },
    Section { level: u8 },
    Code { language: Option<String> },
    List,
    Divider,
}

#[derive(Debug, Clone)]
struct Section {
    kind: SectionKind,
    title: String,
    body: String,
}

impl Section {
    fn titled(kind: SectionKind, title: &str) -> Self {
        Self {
            kind,
            title: title.to_string(),
            body: String::new(),
        }
    }

    fn with_body(kind: SectionKind, body: &str) -> Self {
        Self {
            kind,
            title: String::new(),
            body: body.to_string(),
        }
    }

    fn append(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if !self.body.is_empty() {
            self.body.push_str("\n\n");
        }
        self.body.push_str(text);
    }

    fn render(&self) -> String {
        let heading = match &self.kind {
            SectionKind::Header { level } => {
                Some(format!("{} {}", "#".repeat(usize::from(*level)), self.title))
            }
            SectionKind::Section { level: 1 } => Some(format!("**{}**", self.title)),
            SectionKind::Section { .. } => Some(format!("*{}*", self.title)),
            SectionKind::Code { language } => {
                return format!(
                    "```{}\n{}\n```",
                    language.as_deref().unwrap_or_default(),
                    self.body
                );
            }
            SectionKind::Divider => return "---".to_string(),
            SectionKind::Text | SectionKind::List => None,
        };

        match heading {
            Some(heading) if self.body.is_empty() => heading,
            Some(heading) => format!("{heading}\n\n{}", self.body),
            None => self.body.clone(),
        }
    }

    fn is_divider(&self) -> bool {
        self.kind == SectionKind::Divider
    }
}

#[derive(Debug, Clone)]
struct ReconstructionSession {
    session_id: String,
    message_id: String,
    started_at: DateTime<Utc>,
    sections: Vec<Section>,
    open: Option<Section>,
}

impl ReconstructionSession {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            message_id: new_id(),
            started_at: Utc::now(),
            sections: Vec::new(),
            open: None,
        }
    }

    fn close_open(&mut self) {
        if let Some(section) = self.open.take() {
            self.sections.push(section);
        }
    }

    fn push(&mut self, fragment: &StreamFragment) {
        match fragment.kind {
            FragmentKind::Text => match self.open.as_mut() {
                Some(section) => section.append(&fragment.content),
                None if fragment.content.is_empty() => {}
                None => {
                    self.open = Some(Section::with_body(SectionKind::Text, &fragment.content));
                }
            },
            FragmentKind::Header => {
                self.close_open();
                self.open = Some(Section::titled(
                    SectionKind::Header {
                        level: fragment.level(),
                    },
                    &fragment.content,
                ));
            }
            FragmentKind::Section => {
                self.close_open();
                self.open = Some(Section::titled(
                    SectionKind::Section {
                        level: fragment.level(),
                    },
                    &fragment.content,
                ));
            }
            FragmentKind::Code => {
                self.close_open();
                self.sections.push(Section::with_body(
                    SectionKind::Code {
                        language: fragment.language().map(str::to_string),
                    },
                    &fragment.content,
                ));
            }
            FragmentKind::List => {
                self.close_open();
                self.sections
                    .push(Section::with_body(SectionKind::List, &fragment.content));
            }
            FragmentKind::Divider => {
                self.close_open();
                self.sections.push(Section::with_body(SectionKind::Divider, ""));
            }
        }
    }

    fn render(&self) -> String {
        let mut out = String::new();
        let mut previous_divider = None;
        for section in self.sections.iter().chain(self.open.iter()) {
            let rendered = section.render();
            if rendered.is_empty() {
                continue;
            }
            if let Some(prev_was_divider) = previous_divider {
                if prev_was_divider || section.is_divider() {
                    out.push('\n');
                } else {
                    out.push_str("\n\n");
                }
            }
            out.push_str(&rendered);
            previous_divider = Some(section.is_divider());
        }
        out
    }

    fn snapshot(&self, state: StreamingState) -> Message {
        Message {
            id: self.message_id.clone(),
            content: self.render(),
            sender: Sender::Assistant,
            timestamp: self.started_at,
            session_metadata: Some(MessageSessionMetadata {
                session_id: Some(self.session_id.clone()),
                ..MessageSessionMetadata::default()
            }),
            streaming_state: state,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconstructionUpdate {
    Streaming(Message),
    Completed(Message),
}

#[derive(Debug, Default)]
pub struct StreamReconstructor {
    sessions: HashMap<String, ReconstructionSession>,
}

impl StreamReconstructor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a reconstruction, or returns the in-flight one unchanged.
    pub fn start(&mut self, session_id: &str) -> Message {
        let state = if self.sessions.contains_key(session_id) {
            StreamingState::Streaming
        } else {
            StreamingState::Pending
        };
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| ReconstructionSession::new(session_id))
            .snapshot(state)
    }

    pub fn apply(&mut self, session_id: &str, fragment: &StreamFragment) -> ReconstructionUpdate {
        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| ReconstructionSession::new(session_id));
        session.push(fragment);

        if fragment.is_final {
            let message = self
                .finalize(session_id, None)
                .unwrap_or_else(|| Message::assistant_pending(session_id));
            return ReconstructionUpdate::Completed(message);
        }
        ReconstructionUpdate::Streaming(session.snapshot(StreamingState::Streaming))
    }

    /// Handles a `streamComplete` frame. Returns `None` when nothing was
    /// in flight for the session.
    pub fn complete(
        &mut self,
        session_id: &str,
        metadata: Option<CompletionMetadata>,
    ) -> Option<Message> {
        self.finalize(session_id, metadata)
    }

    pub fn cancel(&mut self, session_id: &str) -> Option<Message> {
        let session = self.sessions.remove(session_id)?;
        Some(session.snapshot(StreamingState::Cancelled))
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn has_active(&self) -> bool {
        !self.sessions.is_empty()
    }

    fn finalize(
        &mut self,
        session_id: &str,
        metadata: Option<CompletionMetadata>,
    ) -> Option<Message> {
        let mut session = self.sessions.remove(session_id)?;
        session.close_open();
        let mut message = session.snapshot(StreamingState::Completed);
        if let (Some(metadata), Some(session_metadata)) =
            (metadata, message.session_metadata.as_mut())
        {
            session_metadata.duration_ms = metadata.duration_ms;
            session_metadata.cost_usd = metadata.cost_usd;
            session_metadata.tools = metadata.tools;
        }
        Some(message)
    }
}
