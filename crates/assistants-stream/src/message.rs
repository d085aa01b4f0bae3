//! Structured chat messages produced by a JSON-mode assistant.
//!
//! Wire shape: an object with `id`, `speak` and exactly one of `text`,
//! `explanation` or `riddle` (+ `options`).

use serde::{Deserialize, Serialize};

use crate::errors::MessageDecodeError;

/// Kinds of `JsonMessage`, named after their discriminating field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    Explanation,
    Riddle,
}

/// Order in which variants are tried when an object carries several
/// discriminating fields.
pub const VARIANT_PRECEDENCE: [MessageKind; 3] =
    [MessageKind::Text, MessageKind::Explanation, MessageKind::Riddle];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMessage {
    pub id: Option<String>,
    pub speak: Option<String>,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplanationMessage {
    pub id: Option<String>,
    pub speak: Option<String>,
    pub explanation: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiddleMessage {
    pub id: Option<String>,
    pub speak: Option<String>,
    pub riddle: String,
    pub options: Vec<String>,
}

/// One structured message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum JsonMessage {
    Text(TextMessage),
    Explanation(ExplanationMessage),
    Riddle(RiddleMessage),
}

impl JsonMessage {
    /// Decodes one object, trying variants in `VARIANT_PRECEDENCE` order.
    ///
    /// A variant matches when all of its required fields are present with
    /// the right JSON type. `id` and `speak` are optional and only taken
    /// when they are strings.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, MessageDecodeError> {
        let object = value.as_object().ok_or(MessageDecodeError::NotAnObject)?;
        let id = object.get("id").and_then(|v| v.as_str()).map(ToOwned::to_owned);
        let speak = object
            .get("speak")
            .and_then(|v| v.as_str())
            .map(ToOwned::to_owned);
        let string_field = |key: &str| object.get(key).and_then(|v| v.as_str());

        for kind in VARIANT_PRECEDENCE {
            match kind {
                MessageKind::Text => {
                    if let Some(text) = string_field("text") {
                        return Ok(JsonMessage::Text(TextMessage {
                            id,
                            speak,
                            text: text.to_string(),
                        }));
                    }
                }
                MessageKind::Explanation => {
                    if let Some(explanation) = string_field("explanation") {
                        return Ok(JsonMessage::Explanation(ExplanationMessage {
                            id,
                            speak,
                            explanation: explanation.to_string(),
                        }));
                    }
                }
                MessageKind::Riddle => {
                    if let (Some(riddle), Some(options)) =
                        (string_field("riddle"), string_list(object.get("options")))
                    {
                        return Ok(JsonMessage::Riddle(RiddleMessage {
                            id,
                            speak,
                            riddle: riddle.to_string(),
                            options,
                        }));
                    }
                }
            }
        }

        let mut keys: Vec<String> = object.keys().cloned().collect();
        keys.sort();
        Err(MessageDecodeError::NoMatchingVariant { keys })
    }

    /// Parses and decodes one JSON object block.
    pub fn from_json_str(block: &str) -> Result<Self, MessageDecodeError> {
        let value: serde_json::Value = serde_json::from_str(block)?;
        Self::from_value(&value)
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            JsonMessage::Text(_) => MessageKind::Text,
            JsonMessage::Explanation(_) => MessageKind::Explanation,
            JsonMessage::Riddle(_) => MessageKind::Riddle,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            JsonMessage::Text(m) => m.id.as_deref(),
            JsonMessage::Explanation(m) => m.id.as_deref(),
            JsonMessage::Riddle(m) => m.id.as_deref(),
        }
    }

    /// Text meant for speech synthesis.
    pub fn speakable_text(&self) -> Option<&str> {
        match self {
            JsonMessage::Text(m) => m.speak.as_deref(),
            JsonMessage::Explanation(m) => m.speak.as_deref(),
            JsonMessage::Riddle(m) => m.speak.as_deref(),
        }
    }

    /// Text shown on screen.
    pub fn display_text(&self) -> String {
        match self {
            JsonMessage::Text(m) => m.text.clone(),
            JsonMessage::Explanation(m) => format!("💡 Explanation: {}", m.explanation),
            JsonMessage::Riddle(m) => {
                let mut out = format!("❓ {}", m.riddle);
                for (i, option) in m.options.iter().enumerate() {
                    out.push_str(&format!("\n{}. {}", i + 1, option));
                }
                out
            }
        }
    }
}

impl<'de> Deserialize<'de> for JsonMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        JsonMessage::from_value(&value).map_err(serde::de::Error::custom)
    }
}

fn string_list(value: Option<&serde_json::Value>) -> Option<Vec<String>> {
    value?
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(ToOwned::to_owned))
        .collect()
}

/// Full `{"messages": [...]}` document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDocument {
    pub messages: Vec<JsonMessage>,
}

/// Decodes a complete messages document in one go.
pub fn decode_document(text: &str) -> Result<Vec<JsonMessage>, MessageDecodeError> {
    let document: MessageDocument = serde_json::from_str(text)?;
    Ok(document.messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn precedence_is_text_then_explanation_then_riddle() {
        assert_eq!(
            VARIANT_PRECEDENCE,
            [MessageKind::Text, MessageKind::Explanation, MessageKind::Riddle]
        );
        let both = json!({"id": "1", "speak": "s", "text": "t", "explanation": "e"});
        assert_eq!(JsonMessage::from_value(&both).expect("decode").kind(), MessageKind::Text);
        let later = json!({"id": "2", "explanation": "e", "riddle": "r", "options": ["a"]});
        assert_eq!(
            JsonMessage::from_value(&later).expect("decode").kind(),
            MessageKind::Explanation
        );
    }

    #[test]
    fn riddle_requires_string_options() {
        let missing = json!({"id": "1", "speak": "s", "riddle": "r?"});
        assert!(matches!(
            JsonMessage::from_value(&missing),
            Err(MessageDecodeError::NoMatchingVariant { .. })
        ));
        let mixed = json!({"id": "1", "riddle": "r?", "options": ["a", 2]});
        assert!(JsonMessage::from_value(&mixed).is_err());
        let ok = json!({"id": "1", "speak": "x", "riddle": "r?", "options": ["a", "b"]});
        assert_eq!(JsonMessage::from_value(&ok).expect("riddle").kind(), MessageKind::Riddle);
    }

    #[test]
    fn unknown_shape_reports_sorted_keys() {
        let err = JsonMessage::from_value(&json!({"speak": "x", "id": "9"})).expect_err("no variant");
        assert_eq!(
            err,
            MessageDecodeError::NoMatchingVariant {
                keys: vec!["id".into(), "speak".into()]
            }
        );
        assert_eq!(
            JsonMessage::from_value(&json!(["a"])),
            Err(MessageDecodeError::NotAnObject)
        );
    }

    #[test]
    fn id_and_speak_are_optional() {
        let message = JsonMessage::from_json_str(r#"{"text": "hello"}"#).expect("text");
        assert_eq!(message.id(), None);
        assert_eq!(message.speakable_text(), None);
        assert_eq!(message.display_text(), "hello");
    }

    #[test]
    fn display_text_formats_each_kind() {
        let explanation =
            JsonMessage::from_json_str(r#"{"id":"1","speak":"s","explanation":"because"}"#)
                .expect("explanation");
        assert_eq!(explanation.display_text(), "💡 Explanation: because");
        let riddle = JsonMessage::from_json_str(
            r#"{"id":"2","speak":"s","riddle":"What am I?","options":["a map","a clock"]}"#,
        )
        .expect("riddle");
        assert_eq!(riddle.display_text(), "❓ What am I?\n1. a map\n2. a clock");
    }

    #[test]
    fn document_decodes_every_message() {
        let messages = decode_document(
            r#"{"messages":[{"id":"1","speak":"hi","text":"hi"},{"id":"2","speak":"x","explanation":"e"}]}"#,
        )
        .expect("document");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].id(), Some("2"));
    }
}
