//! Relay wire messages.
//!
//! Relay messages are JSON arrays like:
//! - `["EVENT", <sub_id>, <event>]`
//! - `["EOSE", <sub_id>]`
//! - `["OK", <event_id>, <accepted>, <message>]`
//! - `["NOTICE", <message>]`
//! - `["AUTH", <challenge>]`
//! - `["CLOSED", <sub_id>, <message>]`
//!
//! The transport hands us raw text; anything malformed becomes an error
//! value, never a panic.

use crate::error::MessageError;
use crate::event::Event;
use crate::filter::Filter;
use serde_json::Value;

/// Parsed relay-to-client message.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event {
        sub_id: String,
        event: Box<Event>,
    },
    /// End of stored events; live events follow.
    EndOfStoredEvents {
        sub_id: String,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Notice {
        message: String,
    },
    Auth {
        challenge: String,
    },
    Closed {
        sub_id: String,
        message: String,
    },
    /// Well-formed array with a label we do not handle.
    Unknown(String),
}

impl RelayMessage {
    pub fn from_json(text: &str) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, MessageError> {
        let Value::Array(mut items) = value else {
            return Err(MessageError::NotAnArray);
        };
        let label = match items.first() {
            Some(Value::String(label)) => label.clone(),
            _ => return Err(MessageError::NotAnArray),
        };

        let text = |items: &[Value], index: usize| -> Result<String, MessageError> {
            items
                .get(index)
                .and_then(Value::as_str)
                .map(String::from)
                .ok_or_else(|| MessageError::MissingField {
                    label: label.clone(),
                    index,
                })
        };
        let optional_text =
            |items: &[Value], index: usize| items.get(index).and_then(Value::as_str).unwrap_or("").to_string();

        match label.as_str() {
            "EVENT" => {
                let sub_id = text(&items, 1)?;
                if items.len() < 3 {
                    return Err(MessageError::MissingField { label, index: 2 });
                }
                let event: Event = serde_json::from_value(items.swap_remove(2))?;
                Ok(Self::Event {
                    sub_id,
                    event: Box::new(event),
                })
            }
            "EOSE" => Ok(Self::EndOfStoredEvents {
                sub_id: text(&items, 1)?,
            }),
            "OK" => Ok(Self::Ok {
                event_id: text(&items, 1)?,
                accepted: items.get(2).and_then(Value::as_bool).unwrap_or(false),
                message: optional_text(&items, 3),
            }),
            "NOTICE" => Ok(Self::Notice {
                message: optional_text(&items, 1),
            }),
            "AUTH" => Ok(Self::Auth {
                challenge: text(&items, 1)?,
            }),
            "CLOSED" => Ok(Self::Closed {
                sub_id: text(&items, 1)?,
                message: optional_text(&items, 2),
            }),
            _ => Ok(Self::Unknown(label)),
        }
    }
}

/// Client-to-relay messages the multiplexer emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Req {
        sub_id: String,
        filters: Vec<Filter>,
    },
    Close {
        sub_id: String,
    },
}

impl ClientMessage {
    pub fn to_json(&self) -> String {
        let value = match self {
            Self::Req { sub_id, filters } => {
                let mut items = vec![Value::from("REQ"), Value::from(sub_id.as_str())];
                items.extend(
                    filters
                        .iter()
                        .filter_map(|f| serde_json::to_value(f).ok()),
                );
                Value::Array(items)
            }
            Self::Close { sub_id } => {
                Value::Array(vec![Value::from("CLOSE"), Value::from(sub_id.as_str())])
            }
        };
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_json() -> String {
        format!(
            r#"{{"id":"{}","pubkey":"{}","created_at":1,"kind":1,"tags":[],"content":"hi","sig":""}}"#,
            "00".repeat(32),
            "ab".repeat(32)
        )
    }

    #[test]
    fn parse_event() {
        let msg = format!(r#"["EVENT","sub1",{}]"#, event_json());
        match RelayMessage::from_json(&msg).unwrap() {
            RelayMessage::Event { sub_id, event } => {
                assert_eq!(sub_id, "sub1");
                assert_eq!(event.content, "hi");
            }
            other => panic!("Expected Event, got {:?}", other),
        }
    }

    #[test]
    fn parse_eose_ok_notice_closed() {
        assert_eq!(
            RelayMessage::from_json(r#"["EOSE","sub1"]"#).unwrap(),
            RelayMessage::EndOfStoredEvents {
                sub_id: "sub1".into()
            }
        );
        match RelayMessage::from_json(r#"["OK","abc123",true,""]"#).unwrap() {
            RelayMessage::Ok {
                event_id, accepted, ..
            } => {
                assert_eq!(event_id, "abc123");
                assert!(accepted);
            }
            other => panic!("Expected Ok, got {:?}", other),
        }
        assert_eq!(
            RelayMessage::from_json(r#"["NOTICE"]"#).unwrap(),
            RelayMessage::Notice {
                message: String::new()
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["CLOSED","s","auth-required: x"]"#).unwrap(),
            RelayMessage::Closed {
                sub_id: "s".into(),
                message: "auth-required: x".into()
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["COUNT","s",{"count":1}]"#).unwrap(),
            RelayMessage::Unknown("COUNT".into())
        );
    }

    #[test]
    fn malformed_messages_are_errors() {
        assert!(RelayMessage::from_json("not json").is_err());
        assert!(RelayMessage::from_json("{}").is_err());
        assert!(RelayMessage::from_json("[]").is_err());
        assert!(RelayMessage::from_json("[1,2]").is_err());
        assert!(RelayMessage::from_json(r#"["EVENT","s"]"#).is_err());
        assert!(RelayMessage::from_json(r#"["EVENT","s",{"kind":"x"}]"#).is_err());
        assert!(RelayMessage::from_json(r#"["EOSE"]"#).is_err());
    }

    #[test]
    fn client_messages_serialize() {
        let req = ClientMessage::Req {
            sub_id: "abc".into(),
            filters: vec![Filter::new().kind(1).limit(10)],
        };
        assert_eq!(req.to_json(), r#"["REQ","abc",{"kinds":[1],"limit":10}]"#);
        let close = ClientMessage::Close { sub_id: "abc".into() };
        assert_eq!(close.to_json(), r#"["CLOSE","abc"]"#);
    }
}
