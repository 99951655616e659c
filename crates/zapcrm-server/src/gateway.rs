use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use zapcrm_contracts::{GatewayCredentials, MediaKind, OutboundMedia};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Transport(String),
    #[error("gateway returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("gateway response could not be decoded: {0}")]
    Decode(String),
}

/// Z-API client bound to one tenant's instance credentials.
pub struct ZApiClient {
    http: Client,
    instance_url: String,
    client_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub gateway_message_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub smartphone_connected: Option<bool>,
    #[serde(default, alias = "phone")]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Deserialize)]
struct SendResponse {
    #[serde(rename = "messageId", default)]
    message_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Deserialize)]
struct QrImage {
    #[serde(alias = "image")]
    value: String,
}

impl ZApiClient {
    pub fn new(http: Client, base_url: &str, credentials: &GatewayCredentials) -> Self {
        Self {
            http,
            instance_url: format!(
                "{}/instances/{}/token/{}",
                base_url.trim_end_matches('/'),
                credentials.instance_id,
                credentials.token
            ),
            client_token: credentials.client_token.clone(),
        }
    }

    pub async fn send_text(&self, phone: &str, message: &str) -> Result<SendReceipt, GatewayError> {
        let response: SendResponse = self
            .post_json("send-text", &json!({"phone": phone, "message": message}))
            .await?;
        Ok(response.into())
    }

    pub async fn send_media(
        &self,
        phone: &str,
        media: &OutboundMedia,
        caption: Option<&str>,
    ) -> Result<SendReceipt, GatewayError> {
        let caption = caption.unwrap_or_default();
        let (endpoint, body) = match media.kind {
            MediaKind::Image => (
                "send-image".to_string(),
                json!({"phone": phone, "image": media.url, "caption": caption}),
            ),
            MediaKind::Video => (
                "send-video".to_string(),
                json!({"phone": phone, "video": media.url, "caption": caption}),
            ),
            MediaKind::Document => {
                let file_name = media
                    .filename
                    .clone()
                    .unwrap_or_else(|| "document".to_string());
                (
                    format!("send-document/{}", document_extension(&file_name)),
                    json!({
                        "phone": phone,
                        "document": media.url,
                        "fileName": file_name,
                        "caption": caption
                    }),
                )
            }
        };
        let response: SendResponse = self.post_json(&endpoint, &body).await?;
        Ok(response.into())
    }

    pub async fn instance_status(&self) -> Result<InstanceStatus, GatewayError> {
        self.get_json("status").await
    }

    /// Base64 data URI of the pairing QR code.
    pub async fn qr_code(&self) -> Result<String, GatewayError> {
        let image: QrImage = self.get_json("qr-code/image").await?;
        if image.value.trim().is_empty() {
            return Err(GatewayError::Decode("empty qr code image".to_string()));
        }
        Ok(image.value)
    }

    pub async fn update_webhooks(&self, webhook_url: &str) -> Result<(), GatewayError> {
        let body = json!({
            "webhookUrl": webhook_url,
            "messageIn": true,
            "messageOut": true,
            "messageStatus": true,
            "qrCode": true,
            "disconnected": true,
            "connected": true
        });
        let _: Value = self.post_json("webhooks", &body).await?;
        Ok(())
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &Value,
    ) -> Result<T, GatewayError> {
        let response = self
            .http
            .post(self.url(endpoint))
            .header("Client-Token", &self.client_token)
            .json(body)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        decode(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, GatewayError> {
        let response = self
            .http
            .get(self.url(endpoint))
            .header("Client-Token", &self.client_token)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        decode(response).await
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.instance_url, endpoint)
    }
}

impl From<SendResponse> for SendReceipt {
    fn from(value: SendResponse) -> Self {
        Self {
            gateway_message_id: value
                .message_id
                .or(value.id)
                .filter(|v| !v.trim().is_empty()),
        }
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, GatewayError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(GatewayError::Status {
            status: status.as_u16(),
            body,
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|e| GatewayError::Decode(e.to_string()))
}

fn document_extension(file_name: &str) -> &str {
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext,
        _ => "pdf",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_url_embeds_credentials() {
        let client = ZApiClient::new(
            Client::new(),
            "https://api.z-api.io/",
            &GatewayCredentials {
                instance_id: "inst".to_string(),
                token: "tok".to_string(),
                client_token: "ct".to_string(),
            },
        );
        assert_eq!(
            client.url("send-text"),
            "https://api.z-api.io/instances/inst/token/tok/send-text"
        );
    }

    #[test]
    fn receipt_prefers_message_id() {
        let receipt: SendReceipt = SendResponse {
            message_id: Some("m".to_string()),
            id: Some("i".to_string()),
        }
        .into();
        assert_eq!(receipt.gateway_message_id.as_deref(), Some("m"));

        let fallback: SendReceipt = SendResponse {
            message_id: None,
            id: Some("i".to_string()),
        }
        .into();
        assert_eq!(fallback.gateway_message_id.as_deref(), Some("i"));
    }

    #[test]
    fn document_extension_falls_back_to_pdf() {
        assert_eq!(document_extension("report.xlsx"), "xlsx");
        assert_eq!(document_extension("report"), "pdf");
        assert_eq!(document_extension(".bashrc"), "pdf");
    }
}
