use crate::{Error, Filter, Note, NoteId, SubId};
use serde_json::{json, Value};

/// Messages sent by clients, received by relays
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Event(Note),
    Req { sub_id: SubId, filters: Vec<Filter> },
    Close { sub_id: SubId },
    Raw(String),
}

impl ClientMessage {
    pub fn event(note: Note) -> Self {
        ClientMessage::Event(note)
    }

    pub fn raw(raw: String) -> Self {
        ClientMessage::Raw(raw)
    }

    pub fn req(sub_id: SubId, filters: Vec<Filter>) -> Self {
        ClientMessage::Req { sub_id, filters }
    }

    pub fn close(sub_id: SubId) -> Self {
        ClientMessage::Close { sub_id }
    }

    /// Id used to correlate an `OK` reply, if this message expects one.
    pub fn event_id(&self) -> Option<NoteId> {
        match self {
            Self::Event(note) => Some(note.id),
            _ => None,
        }
    }

    pub fn sub_id(&self) -> Option<&SubId> {
        match self {
            Self::Req { sub_id, .. } | Self::Close { sub_id } => Some(sub_id),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Event(_) => "EVENT",
            Self::Req { .. } => "REQ",
            Self::Close { .. } => "CLOSE",
            Self::Raw(_) => "RAW",
        }
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(match self {
            Self::Event(note) => format!("[\"EVENT\",{}]", note.to_json()?),
            Self::Raw(raw) => raw.clone(),
            Self::Req { sub_id, filters } => {
                let mut frame = vec![json!("REQ"), json!(sub_id.as_str())];
                if filters.is_empty() {
                    frame.push(json!({}));
                }
                for filter in filters {
                    frame.push(serde_json::to_value(filter)?);
                }
                Value::Array(frame).to_string()
            }
            Self::Close { sub_id } => json!(["CLOSE", sub_id.as_str()]).to_string(),
        })
    }

    /// Parse a client frame. Relays and test doubles use this to read what
    /// a client sent.
    pub fn from_json(msg: &str) -> Result<Self, Error> {
        let value: Value = serde_json::from_str(msg)?;
        let Some(items) = value.as_array() else {
            return Err(Error::DecodeFailed("client message is not an array".into()));
        };
        let Some(tag) = items.first().and_then(Value::as_str) else {
            return Err(Error::Empty);
        };

        let sub_id = || {
            items
                .get(1)
                .and_then(Value::as_str)
                .map(SubId::from)
                .ok_or_else(|| Error::DecodeFailed(format!("{tag} without subscription id")))
        };

        match tag {
            "EVENT" => {
                let note = items
                    .get(1)
                    .cloned()
                    .ok_or_else(|| Error::DecodeFailed("EVENT without note".into()))?;
                Ok(Self::Event(serde_json::from_value(note)?))
            }
            "REQ" => {
                let sub_id = sub_id()?;
                let filters = items[2..]
                    .iter()
                    .cloned()
                    .map(serde_json::from_value)
                    .collect::<Result<Vec<Filter>, _>>()?;
                Ok(Self::Req { sub_id, filters })
            }
            "CLOSE" => Ok(Self::Close { sub_id: sub_id()? }),
            _ => Ok(Self::Raw(msg.to_owned())),
        }
    }
}
