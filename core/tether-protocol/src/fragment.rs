//! Incremental reply fragments delivered inside `streamData` frames.

use serde::{Deserialize, Serialize};

pub const MAX_HEADER_LEVEL: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FragmentKind {
    Text,
    Header,
    Section,
    Code,
    List,
    Divider,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamFragment {
    #[serde(rename = "type")]
    pub kind: FragmentKind,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FragmentMetadata>,
}

impl StreamFragment {
    fn plain(kind: FragmentKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            is_final: false,
            metadata: None,
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::plain(FragmentKind::Text, content)
    }

    pub fn header(content: impl Into<String>, level: u8) -> Self {
        Self {
            metadata: Some(FragmentMetadata {
                language: None,
                level: Some(level),
            }),
            ..Self::plain(FragmentKind::Header, content)
        }
    }

    pub fn section(content: impl Into<String>, level: u8) -> Self {
        Self {
            metadata: Some(FragmentMetadata {
                language: None,
                level: Some(level),
            }),
            ..Self::plain(FragmentKind::Section, content)
        }
    }

    pub fn code(content: impl Into<String>, language: Option<&str>) -> Self {
        Self {
            metadata: language.map(|language| FragmentMetadata {
                language: Some(language.to_string()),
                level: None,
            }),
            ..Self::plain(FragmentKind::Code, content)
        }
    }

    pub fn list(content: impl Into<String>) -> Self {
        Self::plain(FragmentKind::List, content)
    }

    pub fn divider() -> Self {
        Self::plain(FragmentKind::Divider, "")
    }

    /// Marks this fragment as the terminal fragment of its reply.
    pub fn finished(mut self) -> Self {
        self.is_final = true;
        self
    }

    /// Heading level clamped to 1..=6; missing levels read as 1.
    pub fn level(&self) -> u8 {
        self.metadata
            .as_ref()
            .and_then(|metadata| metadata.level)
            .unwrap_or(1)
            .clamp(1, MAX_HEADER_LEVEL)
    }

    pub fn language(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|metadata| metadata.language.as_deref())
            .filter(|language| !language.trim().is_empty())
    }
}
