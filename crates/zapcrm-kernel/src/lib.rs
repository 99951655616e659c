use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use zapcrm_contracts::{DeliveryStatus, MessageDirection, MessageReceivedEvent};

pub fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|v| v.with_timezone(&Utc))
}

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Gateway status vocabulary onto the local enum. The gateway reports
/// "sent" once the handset has the message, which is local "delivered".
pub fn map_gateway_status(status: &str) -> DeliveryStatus {
    let status = status.trim();
    if status.eq_ignore_ascii_case("sent") {
        DeliveryStatus::Delivered
    } else if status.eq_ignore_ascii_case("viewed") {
        DeliveryStatus::Read
    } else {
        DeliveryStatus::Sent
    }
}

/// States a record may be in for a move to `target` to be accepted.
pub fn status_predecessors(target: DeliveryStatus) -> &'static [DeliveryStatus] {
    match target {
        DeliveryStatus::Sent => &[],
        DeliveryStatus::Delivered => &[DeliveryStatus::Sent],
        DeliveryStatus::Read => &[DeliveryStatus::Sent, DeliveryStatus::Delivered],
        DeliveryStatus::Failed => &[DeliveryStatus::Sent],
    }
}

pub fn status_transition_allowed(from: DeliveryStatus, to: DeliveryStatus) -> bool {
    status_predecessors(to).contains(&from)
}

pub fn connection_flag(connected: bool, smartphone_connected: bool) -> bool {
    connected && smartphone_connected
}

/// Digits only for plain phone numbers; group and JID identifiers are kept verbatim.
pub fn normalize_phone(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.contains('@') || trimmed.ends_with("-group") {
        return trimmed.to_string();
    }
    trimmed.chars().filter(|c| c.is_ascii_digit()).collect()
}

pub fn media_kind(message_type: &str) -> Option<String> {
    let kind = message_type.trim();
    if kind.is_empty() || kind.eq_ignore_ascii_case("chat") {
        None
    } else {
        Some(kind.to_ascii_lowercase())
    }
}

pub fn inbound_direction(event: &MessageReceivedEvent) -> MessageDirection {
    if event.from_me {
        MessageDirection::Out
    } else {
        MessageDirection::In
    }
}

pub fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

pub fn jcs_sha256_hex(value: &Value) -> Result<String, String> {
    let canonical = serde_jcs::to_string(value)
        .map_err(|err| format!("failed to canonicalize JSON via JCS: {err}"))?;
    Ok(sha256_hex(canonical.as_bytes()))
}

/// Digest of a raw webhook body; JSON bodies hash their canonical form so
/// replays of reformatted payloads compare equal.
pub fn payload_digest(raw: &[u8]) -> String {
    serde_json::from_slice::<Value>(raw)
        .ok()
        .and_then(|v| jcs_sha256_hex(&v).ok())
        .unwrap_or_else(|| sha256_hex(raw))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
