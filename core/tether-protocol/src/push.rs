//! Push-notification payloads handed to the engine by the host platform.

use std::collections::BTreeMap;

use crate::value::AnyValue;

/// Keys whose presence marks a payload as belonging to the app rather than
/// a generic OS notification.
pub const RELEVANT_KEYS: [&str; 5] = [
    "sessionId",
    "message",
    "projectPath",
    "requestId",
    "messageId",
];

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PushPayload {
    pub session_id: Option<String>,
    pub message: Option<String>,
    pub project_path: Option<String>,
    pub request_id: Option<String>,
    pub message_id: Option<String>,
    pub extra: BTreeMap<String, AnyValue>,
}

pub fn is_relevant(map: &BTreeMap<String, AnyValue>) -> bool {
    RELEVANT_KEYS
        .iter()
        .any(|key| map.get(*key).map(|value| !value.is_null()).unwrap_or(false))
}

impl PushPayload {
    /// Returns `None` for payloads that should be left to the OS.
    pub fn from_map(mut map: BTreeMap<String, AnyValue>) -> Option<Self> {
        if !is_relevant(&map) {
            return None;
        }

        let mut take = |key: &str| {
            map.remove(key)
                .and_then(|value| value.as_text())
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let session_id = take("sessionId");
        let message = take("message");
        let project_path = take("projectPath");
        let request_id = take("requestId");
        let message_id = take("messageId");

        Some(Self {
            session_id,
            message,
            project_path,
            request_id,
            message_id,
            extra: map,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, AnyValue)]) -> BTreeMap<String, AnyValue> {
        entries
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn generic_payload_is_not_relevant() {
        let payload = map(&[("aps", AnyValue::from("alert"))]);
        assert!(!is_relevant(&payload));
        assert!(PushPayload::from_map(payload).is_none());
    }

    #[test]
    fn any_single_key_marks_relevance() {
        for key in RELEVANT_KEYS {
            let payload = map(&[(key, AnyValue::from("x"))]);
            assert!(is_relevant(&payload), "{key} should be relevant");
        }
    }

    #[test]
    fn extracts_known_fields_and_keeps_extras() {
        let payload = PushPayload::from_map(map(&[
            ("sessionId", AnyValue::from("s-1")),
            ("messageId", AnyValue::Number(7.0)),
            ("message", AnyValue::from("  done  ")),
            ("badge", AnyValue::Number(1.0)),
        ]))
        .expect("relevant payload");

        assert_eq!(payload.session_id.as_deref(), Some("s-1"));
        assert_eq!(payload.message_id.as_deref(), Some("7"));
        assert_eq!(payload.message.as_deref(), Some("done"));
        assert_eq!(payload.project_path, None);
        assert!(payload.extra.contains_key("badge"));
    }
}
