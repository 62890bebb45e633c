use serde::{Deserialize, Serialize};

/// Messages sent from the client to the queue broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        #[serde(rename = "turnipCode")]
        turnip_code: String,
        /// Always `null` on the wire; the broker assigns the identity.
        #[serde(rename = "visitorID")]
        visitor_id: Option<String>,
    },
}

impl ClientMessage {
    pub fn join(turnip_code: impl Into<String>) -> Self {
        ClientMessage::Join {
            turnip_code: turnip_code.into(),
            visitor_id: None,
        }
    }
}

/// Messages received from the queue broker. Anything other than `joined`
/// decodes to `Other` and is ignored by the handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ServerMessage {
    Joined { data: JoinedData },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinedData {
    #[serde(rename = "visitorID")]
    pub visitor_id: String,
}
