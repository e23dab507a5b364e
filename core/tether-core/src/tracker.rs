//! Remote sessions this client cares about.
//!
//! The tracked set is what gets resubscribed after every handshake, so it
//! has to survive reconnects. Each session may be bound to the project its
//! messages persist under.

use std::collections::BTreeMap;

use tether_protocol::{Envelope, Payload, SessionRef, SubscribeRequest, UnsubscribeRequest};

use crate::types::ProjectDescriptor;

#[derive(Debug, Clone, Default)]
pub struct SessionTracker {
    sessions: BTreeMap<String, Option<ProjectDescriptor>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the session was newly added. Re-tracking with a
    /// project fills in a missing binding.
    pub fn track(&mut self, session_id: &str, project: Option<ProjectDescriptor>) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(existing) => {
                if existing.is_none() {
                    *existing = project;
                }
                false
            }
            None => {
                self.sessions.insert(session_id.to_string(), project);
                true
            }
        }
    }

    pub fn untrack(&mut self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    pub fn tracked(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    pub fn project_for(&self, session_id: &str) -> Option<&ProjectDescriptor> {
        self.sessions.get(session_id).and_then(Option::as_ref)
    }

    /// Builds a subscribe request. `None` means the whole tracked set, which
    /// is still sent when empty.
    pub fn subscribe_envelope(&self, session_ids: Option<Vec<String>>) -> Envelope {
        let ids = session_ids.unwrap_or_else(|| self.tracked());
        Envelope::new(Payload::Subscribe(SubscribeRequest::for_sessions(ids)))
    }

    pub fn unsubscribe_envelope(session_id: &str) -> Envelope {
        Envelope::new(Payload::Unsubscribe(UnsubscribeRequest {
            session_ids: vec![session_id.to_string()],
        }))
    }

    pub fn abort_envelope(session_id: &str) -> Envelope {
        Envelope::new(Payload::AbortSession(SessionRef {
            session_id: session_id.to_string(),
        }))
    }
}
