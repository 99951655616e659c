use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use zapcrm_kernel::{format_ts, payload_digest};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    #[default]
    Text,
    Base64,
}

/// One webhook delivery that could not be processed, kept verbatim so it
/// can be fed back through the pipeline later.
///
/// `payload_sha256` always covers the bytes as received. Bodies that are not
/// valid UTF-8 are stored base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedEvent {
    pub failure_id: String,
    pub tenant_id: String,
    pub received_at: String,
    pub error: String,
    pub payload_sha256: String,
    #[serde(default)]
    pub payload_encoding: PayloadEncoding,
    pub payload: String,
}

impl FailedEvent {
    pub fn new(tenant_id: &str, error: &str, raw: &[u8]) -> Self {
        let (payload_encoding, payload) = match std::str::from_utf8(raw) {
            Ok(text) => (PayloadEncoding::Text, text.to_string()),
            Err(_) => (PayloadEncoding::Base64, STANDARD.encode(raw)),
        };
        Self {
            failure_id: format!("failure_{}", uuid::Uuid::new_v4().as_simple()),
            tenant_id: tenant_id.to_string(),
            received_at: format_ts(Utc::now()),
            error: error.to_string(),
            payload_sha256: payload_digest(raw),
            payload_encoding,
            payload,
        }
    }

    pub fn raw_payload(&self) -> Result<Vec<u8>, String> {
        match self.payload_encoding {
            PayloadEncoding::Text => Ok(self.payload.as_bytes().to_vec()),
            PayloadEncoding::Base64 => STANDARD
                .decode(&self.payload)
                .map_err(|e| format!("payload is not valid base64: {e}")),
        }
    }
}

pub struct FailureJournal {
    file: Arc<Mutex<tokio::fs::File>>,
}

impl FailureJournal {
    pub async fn open(path: &str) -> Result<Self, String> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| format!("open failed-event journal {path}: {e}"))?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub async fn append(&self, rec: &FailedEvent) -> Result<(), String> {
        let mut line = journal_line(rec)?;
        line.push('\n');
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| e.to_string())?;
        file.flush().await.map_err(|e| e.to_string())
    }
}

/// Reads every journaled failure, rejecting lines whose payload no longer
/// matches its recorded digest.
pub async fn read_journal(path: &str) -> Result<Vec<FailedEvent>, String> {
    load_journal(path).await.map(|(entries, _)| entries)
}

/// Like [`read_journal`], also returning how many bytes were consumed.
pub(crate) async fn load_journal(path: &str) -> Result<(Vec<FailedEvent>, usize), String> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("read failed-event journal {path}: {e}"))?;
    let mut out = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let rec: FailedEvent = serde_json::from_str(line)
            .map_err(|e| format!("line {} parse failed: {e}", idx + 1))?;
        let raw = rec
            .raw_payload()
            .map_err(|e| format!("line {} {e}", idx + 1))?;
        let expected = payload_digest(&raw);
        if rec.payload_sha256 != expected {
            return Err(format!(
                "line {} payload_sha256 mismatch: expected {}, got {}",
                idx + 1,
                expected,
                rec.payload_sha256
            ));
        }
        out.push(rec);
    }
    Ok((out, text.len()))
}

/// Rewrites the journal so it holds `retained` followed by whatever was
/// appended after the first `read_len` bytes were loaded.
pub(crate) async fn retain_failures(
    path: &str,
    read_len: usize,
    retained: &[FailedEvent],
) -> Result<(), String> {
    let current = tokio::fs::read(path)
        .await
        .map_err(|e| format!("read failed-event journal {path}: {e}"))?;
    let mut out = Vec::new();
    for rec in retained {
        out.extend_from_slice(journal_line(rec)?.as_bytes());
        out.push(b'\n');
    }
    if let Some(tail) = current.get(read_len..) {
        out.extend_from_slice(tail);
    }

    // Rewritten in place: a running server's append handle must keep
    // pointing at this file.
    tokio::fs::write(path, &out)
        .await
        .map_err(|e| format!("rewrite failed-event journal {path}: {e}"))
}

fn journal_line(rec: &FailedEvent) -> Result<String, String> {
    serde_json::to_string(rec).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};
    use zapcrm_kernel::sha256_hex;

    fn temp_path() -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        std::env::temp_dir()
            .join(format!("zapcrm-journal-{nanos}.jsonl"))
            .to_string_lossy()
            .to_string()
    }

    #[tokio::test]
    async fn appended_failures_read_back_in_order() {
        let path = temp_path();
        let journal = FailureJournal::open(&path).await.unwrap();
        journal
            .append(&FailedEvent::new("t1", "boom", br#"{"event":"message-received"}"#))
            .await
            .unwrap();
        journal
            .append(&FailedEvent::new("t2", "bad json", b"{not json"))
            .await
            .unwrap();

        let entries = read_journal(&path).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].tenant_id, "t1");
        assert_eq!(entries[0].payload, r#"{"event":"message-received"}"#);
        assert_eq!(entries[1].error, "bad json");
        assert_eq!(entries[1].payload, "{not json");
        assert_eq!(entries[1].payload_encoding, PayloadEncoding::Text);
    }

    #[tokio::test]
    async fn tampered_payload_is_rejected() {
        let path = temp_path();
        let mut rec = FailedEvent::new("t1", "boom", br#"{"a":1}"#);
        rec.payload = r#"{"a":2}"#.to_string();
        std::fs::write(&path, format!("{}\n", serde_json::to_string(&rec).unwrap())).unwrap();
        let err = read_journal(&path).await.unwrap_err();
        assert!(err.contains("line 1 payload_sha256 mismatch"));
    }

    #[tokio::test]
    async fn non_utf8_body_keeps_its_exact_bytes() {
        let raw: &[u8] = b"\xff\xfe{broken";
        let rec = FailedEvent::new("t1", "invalid JSON payload", raw);
        assert_eq!(rec.payload_encoding, PayloadEncoding::Base64);
        assert_eq!(rec.payload_sha256, sha256_hex(raw));
        assert_eq!(rec.raw_payload().unwrap(), raw);

        let path = temp_path();
        let journal = FailureJournal::open(&path).await.unwrap();
        journal.append(&rec).await.unwrap();
        let entries = read_journal(&path).await.unwrap();
        assert_eq!(entries, vec![rec]);
    }

    #[tokio::test]
    async fn lines_without_encoding_default_to_text() {
        let path = temp_path();
        let line = format!(
            r#"{{"failure_id":"f1","tenant_id":"t1","received_at":"2024-01-01T00:00:00.000Z","error":"e","payload_sha256":"{}","payload":"{{not json"}}"#,
            sha256_hex(b"{not json")
        );
        std::fs::write(&path, format!("{line}\n")).unwrap();
        let entries = read_journal(&path).await.unwrap();
        assert_eq!(entries[0].payload_encoding, PayloadEncoding::Text);
        assert_eq!(entries[0].raw_payload().unwrap(), b"{not json");
    }

    #[tokio::test]
    async fn retain_keeps_survivors_and_lines_appended_meanwhile() {
        let path = temp_path();
        let journal = FailureJournal::open(&path).await.unwrap();
        let kept = FailedEvent::new("t1", "still failing", b"{a");
        journal.append(&kept).await.unwrap();
        journal
            .append(&FailedEvent::new("t1", "recovered", br#"{"ok":true}"#))
            .await
            .unwrap();
        let (entries, read_len) = load_journal(&path).await.unwrap();
        assert_eq!(entries.len(), 2);

        let late = FailedEvent::new("t2", "arrived during replay", b"{b");
        journal.append(&late).await.unwrap();

        retain_failures(&path, read_len, std::slice::from_ref(&kept))
            .await
            .unwrap();
        let entries = read_journal(&path).await.unwrap();
        assert_eq!(entries, vec![kept, late]);
    }
}
