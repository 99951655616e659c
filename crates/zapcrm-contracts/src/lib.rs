use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const API_VERSION: &str = "1.0.0";

pub const EVENT_MESSAGE_RECEIVED: &str = "message-received";
pub const EVENT_MESSAGE_STATUS: &str = "message-status";
pub const EVENT_CONNECTION_STATUS_CHANGE: &str = "connection-status-change";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    In,
    Out,
}

impl MessageDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageDirection::In => "in",
            MessageDirection::Out => "out",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in" => Some(MessageDirection::In),
            "out" => Some(MessageDirection::Out),
            _ => None,
        }
    }
}

/// Local delivery status of a message. Only outbound messages carry one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sent" => Some(DeliveryStatus::Sent),
            "delivered" => Some(DeliveryStatus::Delivered),
            "read" => Some(DeliveryStatus::Read),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

/// How an event touches a contact: inbound traffic counts as unread,
/// outbound traffic only bumps the activity timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactActivity {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageReceivedEvent {
    #[serde(default)]
    pub message_id: Option<String>,
    pub phone: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub is_group: bool,
    #[serde(rename = "type", default = "default_message_type")]
    pub message_type: String,
    #[serde(default)]
    pub media_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageStatusEvent {
    pub id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatusEvent {
    pub connected: bool,
    #[serde(default)]
    pub smartphone_connected: bool,
}

/// A single webhook envelope, discriminated by its `event` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    MessageReceived(MessageReceivedEvent),
    MessageStatus(MessageStatusEvent),
    ConnectionStatusChange(ConnectionStatusEvent),
    Unknown { kind: Option<String> },
}

impl GatewayEvent {
    /// Kinds this service does not know about are returned as `Unknown`
    /// rather than rejected, so the gateway can add event kinds freely.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let kind = value
            .get("event")
            .and_then(Value::as_str)
            .map(|v| v.to_string());
        match kind.as_deref() {
            Some(EVENT_MESSAGE_RECEIVED) | Some("messages-received") => {
                serde_json::from_value(value).map(GatewayEvent::MessageReceived)
            }
            Some(EVENT_MESSAGE_STATUS) | Some("messages-status") => {
                serde_json::from_value(value).map(GatewayEvent::MessageStatus)
            }
            Some(EVENT_CONNECTION_STATUS_CHANGE) => {
                serde_json::from_value(value).map(GatewayEvent::ConnectionStatusChange)
            }
            _ => Ok(GatewayEvent::Unknown { kind }),
        }
    }

    pub fn kind_name(&self) -> &str {
        match self {
            GatewayEvent::MessageReceived(_) => EVENT_MESSAGE_RECEIVED,
            GatewayEvent::MessageStatus(_) => EVENT_MESSAGE_STATUS,
            GatewayEvent::ConnectionStatusChange(_) => EVENT_CONNECTION_STATUS_CHANGE,
            GatewayEvent::Unknown { kind } => kind.as_deref().unwrap_or("unknown"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookAck {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WebhookAck {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactRecord {
    pub id: String,
    pub tenant_id: String,
    pub phone: String,
    pub name: String,
    pub last_activity_at: String,
    pub unread_count: u32,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: String,
    pub tenant_id: String,
    pub contact_id: String,
    pub direction: MessageDirection,
    pub content: Option<String>,
    pub media_kind: Option<String>,
    pub media_url: Option<String>,
    pub gateway_message_id: Option<String>,
    pub status: Option<DeliveryStatus>,
    pub delivered_at: Option<String>,
    pub read_at: Option<String>,
    pub created_at: String,
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewayCredentials {
    pub instance_id: String,
    pub token: String,
    pub client_token: String,
}

impl fmt::Debug for GatewayCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayCredentials")
            .field("instance_id", &self.instance_id)
            .field("token", &"<redacted>")
            .field("client_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub tenant_id: String,
    pub credentials: GatewayCredentials,
    pub connected: bool,
    pub phone_number: Option<String>,
    pub qr_code: Option<String>,
    pub qr_code_updated_at: Option<String>,
    pub updated_at: String,
}

/// Connection config as exposed over the API. Credentials never leave the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewayConfigView {
    pub tenant_id: String,
    pub configured: bool,
    pub connected: bool,
    pub phone_number: Option<String>,
    pub qr_code: Option<String>,
    pub qr_code_updated_at: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Document,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Document => "document",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutboundMedia {
    pub url: String,
    pub kind: MediaKind,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub phone: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media: Option<OutboundMedia>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub success: bool,
    pub message: MessageRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterWebhooksRequest {
    pub webhook_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QrCodeResponse {
    pub image: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionStatusResponse {
    pub connected: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeTable {
    Contacts,
    Messages,
    GatewayConfigs,
}

/// Published after a mutation commits. Observers use it as a hint to re-read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeNotice {
    pub tenant_id: String,
    pub table: ChangeTable,
    pub record_id: String,
}

fn default_message_type() -> String {
    "chat".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_message_received_with_plural_alias() {
        let event = GatewayEvent::from_value(json!({
            "event": "messages-received",
            "messageId": "m-1",
            "phone": "5511999999999",
            "body": "hi",
            "fromMe": false,
            "isGroup": false,
            "type": "chat",
            "instanceId": "ignored-extra-field"
        }))
        .unwrap();
        match event {
            GatewayEvent::MessageReceived(m) => {
                assert_eq!(m.message_id.as_deref(), Some("m-1"));
                assert_eq!(m.phone, "5511999999999");
                assert_eq!(m.body.as_deref(), Some("hi"));
                assert_eq!(m.message_type, "chat");
                assert!(m.media_url.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn message_type_defaults_to_chat() {
        let event = GatewayEvent::from_value(json!({
            "event": "message-received",
            "phone": "551100000000"
        }))
        .unwrap();
        let GatewayEvent::MessageReceived(m) = event else {
            panic!("expected message-received");
        };
        assert_eq!(m.message_type, "chat");
        assert!(!m.from_me);
        assert!(m.message_id.is_none());
    }

    #[test]
    fn unknown_and_missing_kinds_are_not_errors() {
        let unknown = GatewayEvent::from_value(json!({"event": "presence-chat"})).unwrap();
        assert_eq!(
            unknown,
            GatewayEvent::Unknown {
                kind: Some("presence-chat".to_string())
            }
        );
        assert_eq!(unknown.kind_name(), "presence-chat");

        let missing = GatewayEvent::from_value(json!({"phone": "1"})).unwrap();
        assert_eq!(missing, GatewayEvent::Unknown { kind: None });
        assert_eq!(missing.kind_name(), "unknown");
    }

    #[test]
    fn known_kind_with_missing_fields_is_an_error() {
        assert!(GatewayEvent::from_value(json!({"event": "message-status", "id": "x"})).is_err());
        assert!(GatewayEvent::from_value(json!({"event": "message-received"})).is_err());
    }

    #[test]
    fn smartphone_flag_defaults_to_false() {
        let event = GatewayEvent::from_value(json!({
            "event": "connection-status-change",
            "connected": true
        }))
        .unwrap();
        assert_eq!(
            event,
            GatewayEvent::ConnectionStatusChange(ConnectionStatusEvent {
                connected: true,
                smartphone_connected: false,
            })
        );
    }

    #[test]
    fn credentials_debug_redacts_tokens() {
        let creds = GatewayCredentials {
            instance_id: "inst".to_string(),
            token: "secret-token".to_string(),
            client_token: "secret-client".to_string(),
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("inst"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn webhook_ack_omits_error_on_success() {
        assert_eq!(
            serde_json::to_value(WebhookAck::ok()).unwrap(),
            json!({"success": true})
        );
        assert_eq!(
            serde_json::to_value(WebhookAck::failure("boom")).unwrap(),
            json!({"success": false, "error": "boom"})
        );
    }
}
