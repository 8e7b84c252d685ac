//! Wire types for the WebSocket protocol spoken with the client sidecar.

use serde::{Deserialize, Serialize};

use super::{ChatInfo, ClientEvent, InboundMessage};

/// Messages sent from the relay to the sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayMessage {
    /// First message on every connection: how the sidecar should launch.
    Init {
        #[serde(rename = "clientId")]
        client_id: String,
        headless: bool,
        #[serde(rename = "executablePath", skip_serializing_if = "Option::is_none")]
        executable_path: Option<String>,
    },
    GetChats {
        #[serde(rename = "requestId")]
        request_id: String,
    },
    SendText {
        #[serde(rename = "requestId")]
        request_id: String,
        to: String,
        text: String,
    },
}

/// Messages received from the sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SidecarMessage {
    Qr {
        qr: String,
    },
    Ready,
    AuthFailure {
        #[serde(default)]
        message: String,
    },
    Disconnected {
        #[serde(default)]
        reason: String,
    },
    Message {
        #[serde(rename = "fromMe", default)]
        from_me: bool,
        chat: ChatInfo,
        #[serde(default)]
        body: String,
    },
    Chats {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(default)]
        chats: Vec<ChatInfo>,
        error: Option<String>,
    },
    SendResult {
        #[serde(rename = "requestId")]
        request_id: String,
        success: bool,
        error: Option<String>,
    },
    Error {
        error: String,
    },
}

/// What a sidecar message means to the relay.
#[derive(Debug)]
pub enum Incoming {
    Event(ClientEvent),
    Reply { request_id: String, reply: Reply },
    Error(String),
}

/// Result of a correlated request.
#[derive(Debug)]
pub enum Reply {
    Chats(Result<Vec<ChatInfo>, String>),
    Sent(Result<(), String>),
}

impl From<SidecarMessage> for Incoming {
    fn from(msg: SidecarMessage) -> Self {
        match msg {
            SidecarMessage::Qr { qr } => Self::Event(ClientEvent::Qr(qr)),
            SidecarMessage::Ready => Self::Event(ClientEvent::Ready),
            SidecarMessage::AuthFailure { message } => Self::Event(ClientEvent::AuthFailure(message)),
            SidecarMessage::Disconnected { reason } => Self::Event(ClientEvent::Disconnected(reason)),
            SidecarMessage::Message { from_me, chat, body } => {
                Self::Event(ClientEvent::Message(InboundMessage { from_me, chat, body }))
            }
            SidecarMessage::Chats { request_id, chats, error } => Self::Reply {
                request_id,
                reply: Reply::Chats(match error {
                    Some(e) => Err(e),
                    None => Ok(chats),
                }),
            },
            SidecarMessage::SendResult { request_id, success, error } => Self::Reply {
                request_id,
                reply: Reply::Sent(if success {
                    Ok(())
                } else {
                    Err(error.unwrap_or_else(|| "send failed".to_string()))
                }),
            },
            SidecarMessage::Error { error } => Self::Error(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> Incoming {
        serde_json::from_value::<SidecarMessage>(value).unwrap().into()
    }

    #[test]
    fn test_init_serialization() {
        let msg = GatewayMessage::Init {
            client_id: "wa-relay".into(),
            headless: true,
            executable_path: None,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({ "type": "init", "clientId": "wa-relay", "headless": true })
        );
    }

    #[test]
    fn test_send_text_serialization() {
        let msg = GatewayMessage::SendText {
            request_id: "r1".into(),
            to: "g2".into(),
            text: "hi".into(),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({ "type": "send_text", "requestId": "r1", "to": "g2", "text": "hi" })
        );
    }

    #[test]
    fn test_inbound_message() {
        let incoming = parse(json!({
            "type": "message",
            "fromMe": true,
            "chat": { "id": "g1", "name": "Alerts", "isGroup": true },
            "body": "fire"
        }));
        match incoming {
            Incoming::Event(ClientEvent::Message(msg)) => {
                assert!(msg.from_me);
                assert!(msg.chat.is_group);
                assert_eq!(msg.chat.name, "Alerts");
                assert_eq!(msg.body, "fire");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_status_events() {
        assert!(matches!(parse(json!({ "type": "ready" })), Incoming::Event(ClientEvent::Ready)));
        match parse(json!({ "type": "disconnected", "reason": "LOGOUT" })) {
            Incoming::Event(ClientEvent::Disconnected(reason)) => assert_eq!(reason, "LOGOUT"),
            other => panic!("unexpected {other:?}"),
        }
        match parse(json!({ "type": "auth_failure" })) {
            Incoming::Event(ClientEvent::AuthFailure(msg)) => assert!(msg.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_replies() {
        match parse(json!({ "type": "chats", "requestId": "r1", "chats": [{ "id": "g1", "name": "A", "isGroup": true }] })) {
            Incoming::Reply { request_id, reply: Reply::Chats(Ok(chats)) } => {
                assert_eq!(request_id, "r1");
                assert_eq!(chats.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        match parse(json!({ "type": "send_result", "requestId": "r2", "success": false })) {
            Incoming::Reply { reply: Reply::Sent(Err(e)), .. } => assert_eq!(e, "send failed"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
