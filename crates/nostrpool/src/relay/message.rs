use crate::{Error, Note, NoteId, Result, SubId};
use serde_json::Value;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CommandResult {
    pub event_id: NoteId,
    pub status: bool,
    pub message: String,
}

/// Messages sent by relays, received by clients
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RelayMessage {
    OK(CommandResult),
    Eose(SubId),
    Closed(SubId, String),
    Event(SubId, Box<Note>),
    Notice(String),
}

fn str_at<'a>(items: &'a [Value], idx: usize, what: &str) -> Result<&'a str> {
    items
        .get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::DecodeFailed(format!("missing {what}")))
}

impl RelayMessage {
    pub fn eose(subid: impl Into<SubId>) -> Self {
        RelayMessage::Eose(subid.into())
    }

    pub fn closed(subid: impl Into<SubId>, reason: impl Into<String>) -> Self {
        RelayMessage::Closed(subid.into(), reason.into())
    }

    pub fn notice(msg: impl Into<String>) -> Self {
        RelayMessage::Notice(msg.into())
    }

    pub fn ok(event_id: NoteId, status: bool, message: impl Into<String>) -> Self {
        RelayMessage::OK(CommandResult {
            event_id,
            status,
            message: message.into(),
        })
    }

    pub fn event(sub_id: impl Into<SubId>, note: Note) -> Self {
        RelayMessage::Event(sub_id.into(), Box::new(note))
    }

    pub fn sub_id(&self) -> Option<&SubId> {
        match self {
            Self::Eose(sid) | Self::Closed(sid, _) | Self::Event(sid, _) => Some(sid),
            _ => None,
        }
    }

    /// Serialize in the relay wire format. Relays and test doubles use this.
    pub fn to_json(&self) -> Result<String> {
        let value = match self {
            Self::OK(res) => {
                serde_json::json!(["OK", res.event_id.hex(), res.status, res.message])
            }
            Self::Eose(sid) => serde_json::json!(["EOSE", sid.as_str()]),
            Self::Closed(sid, reason) => serde_json::json!(["CLOSED", sid.as_str(), reason]),
            Self::Event(sid, note) => {
                serde_json::json!(["EVENT", sid.as_str(), serde_json::to_value(note)?])
            }
            Self::Notice(msg) => serde_json::json!(["NOTICE", msg]),
        };
        Ok(value.to_string())
    }

    #[profiling::function]
    pub fn from_json(msg: &str) -> Result<RelayMessage> {
        if msg.is_empty() {
            return Err(Error::Empty);
        }

        let value: Value = serde_json::from_str(msg)
            .map_err(|e| Error::DecodeFailed(format!("invalid json: {e}")))?;
        let Some(items) = value.as_array() else {
            return Err(Error::DecodeFailed("message is not an array".into()));
        };
        let Some(tag) = items.first().and_then(Value::as_str) else {
            return Err(Error::DecodeFailed("missing message type".into()));
        };

        match tag {
            // ["NOTICE", <message>]
            "NOTICE" => Ok(Self::notice(str_at(items, 1, "notice message")?)),

            // ["EVENT", <subscription id>, <event JSON>]
            "EVENT" => {
                let sid = str_at(items, 1, "subscription id")?;
                let Some(note) = items.get(2) else {
                    return Err(Error::DecodeFailed("Invalid EVENT format".into()));
                };
                let note: Note = serde_json::from_value(note.clone())
                    .map_err(|e| Error::DecodeFailed(format!("invalid event: {e}")))?;
                Ok(Self::event(sid, note))
            }

            // ["EOSE", <subscription_id>]
            "EOSE" => Ok(Self::eose(str_at(items, 1, "subscription id")?)),

            // ["CLOSED", <subscription_id>, <reason>]
            "CLOSED" => {
                let sid = str_at(items, 1, "subscription id")?;
                let reason = items.get(2).and_then(Value::as_str).unwrap_or_default();
                Ok(Self::closed(sid, reason))
            }

            // ["OK", <event_id>, <true|false>, <message>]
            "OK" => {
                let event_id = NoteId::from_hex(str_at(items, 1, "event id")?)?;
                let Some(status) = items.get(2).and_then(Value::as_bool) else {
                    return Err(Error::DecodeFailed("bad boolean value".into()));
                };
                let message = items.get(3).and_then(Value::as_str).unwrap_or_default();
                Ok(Self::ok(event_id, status, message))
            }

            other => Err(Error::DecodeFailed(format!(
                "unrecognized message type: '{other}'"
            ))),
        }
    }
}
