mod gateway;
mod journal;
mod store;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderName, Method, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};
use zapcrm_config::Config;
use zapcrm_contracts::{
    ChangeNotice, ChangeTable, ConnectionConfig, ConnectionStatusEvent, ConnectionStatusResponse,
    ContactRecord, GatewayConfigView, GatewayCredentials, GatewayEvent, MessageDirection,
    MessageReceivedEvent, MessageRecord, MessageStatusEvent, QrCodeResponse,
    RegisterWebhooksRequest, SendMessageRequest, SendMessageResponse, WebhookAck, API_VERSION,
};
use zapcrm_kernel::{
    connection_flag, format_ts, inbound_direction, map_gateway_status, media_kind, non_empty,
    normalize_phone, parse_rfc3339,
};

use crate::gateway::{GatewayError, ZApiClient};
use crate::journal::{load_journal, retain_failures, FailureJournal};
use crate::store::{
    MemoryStore, NewMessage, ReconcileOutcome, RecordOutcome, SqliteStore, StoreBackend,
    StoreError,
};

pub use crate::journal::{read_journal, FailedEvent, PayloadEncoding};

const CHANGE_FEED_CAPACITY: usize = 256;

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, version = API_VERSION, "zapcrm listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let state = AppState::new(cfg).await?;
    Ok(router(state))
}

fn router(state: AppState) -> Router {
    let webhook_cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-client-info"),
            HeaderName::from_static("apikey"),
        ]);

    let webhooks = Router::new()
        .route(
            "/webhooks/zapi",
            post(webhook_without_tenant).options(webhook_preflight),
        )
        .route(
            "/webhooks/zapi/",
            post(webhook_without_tenant).options(webhook_preflight),
        )
        .route(
            "/webhooks/zapi/{tenant_id}",
            post(webhook).options(webhook_preflight),
        )
        .layer(webhook_cors);

    Router::new()
        .route("/v1/healthz", get(healthz))
        .route(
            "/v1/tenants/{tenant_id}/gateway-config",
            get(get_gateway_config).put(put_gateway_config),
        )
        .route("/v1/tenants/{tenant_id}/gateway/qr-code", post(fetch_qr_code))
        .route(
            "/v1/tenants/{tenant_id}/gateway/status",
            post(poll_connection_status),
        )
        .route(
            "/v1/tenants/{tenant_id}/gateway/webhooks",
            post(register_webhooks),
        )
        .route("/v1/tenants/{tenant_id}/messages", post(send_message))
        .route("/v1/tenants/{tenant_id}/contacts", get(list_contacts))
        .route(
            "/v1/tenants/{tenant_id}/contacts/{contact_id}/messages",
            get(list_messages),
        )
        .route(
            "/v1/tenants/{tenant_id}/contacts/{contact_id}/read",
            post(mark_contact_read),
        )
        .route("/v1/tenants/{tenant_id}/changes", get(changes))
        .merge(webhooks)
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[derive(Clone)]
struct AppState {
    cfg: Arc<Config>,
    store: Arc<Mutex<StoreBackend>>,
    journal: Option<Arc<FailureJournal>>,
    http: Client,
    changes: broadcast::Sender<ChangeNotice>,
}

#[derive(Debug, Error)]
enum WebhookError {
    #[error("No tenant id provided in webhook URL")]
    MissingTenant,
    #[error("{0}")]
    ProcessingFailure(String),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match self {
            WebhookError::MissingTenant => StatusCode::BAD_REQUEST,
            WebhookError::ProcessingFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(WebhookAck::failure(self.to_string()))).into_response()
    }
}

#[derive(Debug, Error)]
enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("gateway is not configured for tenant {0}")]
    GatewayNotConfigured(String),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::GatewayNotConfigured(_) => {
                (StatusCode::PRECONDITION_FAILED, "gateway_not_configured")
            }
            ApiError::Gateway(_) => (StatusCode::BAD_GATEWAY, "gateway_error"),
            ApiError::Store(err) => {
                error!(error = %err, "store operation failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "store_error")
            }
        };
        (
            status,
            Json(json!({"error": {"code": code, "message": self.to_string()}})),
        )
            .into_response()
    }
}

/// What a webhook delivery did to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
enum HandlerOutcome {
    Recorded {
        message_id: String,
        contact_created: bool,
    },
    Duplicate {
        message_id: String,
    },
    Reconciled(ReconcileOutcome),
    ConnectionUpdated {
        connected: bool,
        applied: bool,
    },
    Ignored,
}

impl AppState {
    async fn new(cfg: Config) -> Result<Self, String> {
        let store = if cfg.store.kind == "sqlite" {
            let sqlite_path = cfg
                .store
                .sqlite_path
                .clone()
                .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
            StoreBackend::Sqlite(SqliteStore::new(&sqlite_path).map_err(|e| e.to_string())?)
        } else {
            StoreBackend::Memory(MemoryStore::default())
        };
        let journal = match cfg.journal.failed_events_path.as_deref() {
            Some(path) if !path.trim().is_empty() => {
                Some(Arc::new(FailureJournal::open(path).await?))
            }
            _ => None,
        };
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.gateway.timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self {
            cfg: Arc::new(cfg),
            store: Arc::new(Mutex::new(store)),
            journal,
            http,
            changes,
        })
    }

    async fn process_webhook(
        &self,
        tenant_id: Option<&str>,
        raw: &[u8],
    ) -> Result<HandlerOutcome, WebhookError> {
        let Some(tenant_id) = tenant_id.map(str::trim).filter(|v| !v.is_empty()) else {
            warn!("webhook rejected: no tenant id in path");
            return Err(WebhookError::MissingTenant);
        };

        match self.dispatch(tenant_id, raw).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                error!(
                    tenant_id,
                    error = %err,
                    payload = %String::from_utf8_lossy(raw),
                    "webhook processing failed"
                );
                self.journal_failure(tenant_id, &err, raw).await;
                Err(WebhookError::ProcessingFailure(err))
            }
        }
    }

    async fn dispatch(&self, tenant_id: &str, raw: &[u8]) -> Result<HandlerOutcome, String> {
        let value: serde_json::Value =
            serde_json::from_slice(raw).map_err(|e| format!("invalid JSON payload: {e}"))?;
        let event =
            GatewayEvent::from_value(value).map_err(|e| format!("invalid event payload: {e}"))?;
        debug!(tenant_id, kind = event.kind_name(), "webhook event received");

        match event {
            GatewayEvent::MessageReceived(input) => {
                self.handle_message_received(tenant_id, input).await
            }
            GatewayEvent::MessageStatus(input) => self.handle_message_status(tenant_id, input).await,
            GatewayEvent::ConnectionStatusChange(input) => {
                self.handle_connection_status(tenant_id, input).await
            }
            GatewayEvent::Unknown { kind } => {
                debug!(tenant_id, kind = ?kind, "ignoring unknown webhook event kind");
                Ok(HandlerOutcome::Ignored)
            }
        }
    }

    async fn handle_message_received(
        &self,
        tenant_id: &str,
        input: MessageReceivedEvent,
    ) -> Result<HandlerOutcome, String> {
        let phone = normalize_phone(&input.phone);
        if phone.is_empty() {
            return Err("message-received event has no usable phone".to_string());
        }
        let new = NewMessage {
            phone,
            direction: inbound_direction(&input),
            content: non_empty(input.body.as_deref()),
            media_kind: media_kind(&input.message_type),
            media_url: non_empty(input.media_url.as_deref()),
            gateway_message_id: non_empty(input.message_id.as_deref()),
        };
        let now = format_ts(Utc::now());
        let outcome = {
            let mut store = self.store.lock().await;
            store
                .record_message(tenant_id, new, &now)
                .map_err(|e| e.to_string())?
        };

        match outcome {
            RecordOutcome::Recorded {
                contact_id,
                contact_created,
                message,
            } => {
                info!(
                    tenant_id,
                    message_id = %message.id,
                    contact_id = %contact_id,
                    contact_created,
                    direction = message.direction.as_str(),
                    is_group = input.is_group,
                    "message recorded"
                );
                self.publish(tenant_id, ChangeTable::Contacts, &contact_id);
                self.publish(tenant_id, ChangeTable::Messages, &message.id);
                Ok(HandlerOutcome::Recorded {
                    message_id: message.id,
                    contact_created,
                })
            }
            RecordOutcome::Duplicate { message_id } => {
                info!(
                    tenant_id,
                    message_id = %message_id,
                    gateway_message_id = ?input.message_id,
                    "duplicate message delivery ignored"
                );
                Ok(HandlerOutcome::Duplicate { message_id })
            }
        }
    }

    async fn handle_message_status(
        &self,
        tenant_id: &str,
        input: MessageStatusEvent,
    ) -> Result<HandlerOutcome, String> {
        let target = map_gateway_status(&input.status);
        let now = format_ts(Utc::now());
        let outcome = {
            let mut store = self.store.lock().await;
            store
                .reconcile_status(tenant_id, input.id.trim(), target, &now)
                .map_err(|e| e.to_string())?
        };

        match &outcome {
            ReconcileOutcome::Applied {
                message_id,
                from,
                to,
            } => {
                info!(
                    tenant_id,
                    message_id = %message_id,
                    from = from.as_str(),
                    to = to.as_str(),
                    "message status reconciled"
                );
                self.publish(tenant_id, ChangeTable::Messages, message_id);
            }
            ReconcileOutcome::Unmatched => {
                debug!(
                    tenant_id,
                    gateway_message_id = %input.id,
                    status = %input.status,
                    "status event matched no message"
                );
            }
            ReconcileOutcome::Rejected {
                message_id,
                current,
                target,
            } => {
                debug!(
                    tenant_id,
                    message_id = %message_id,
                    current = ?current,
                    target = target.as_str(),
                    "stale status event ignored"
                );
            }
        }
        Ok(HandlerOutcome::Reconciled(outcome))
    }

    async fn handle_connection_status(
        &self,
        tenant_id: &str,
        input: ConnectionStatusEvent,
    ) -> Result<HandlerOutcome, String> {
        let connected = connection_flag(input.connected, input.smartphone_connected);
        let now = format_ts(Utc::now());
        let applied = {
            let mut store = self.store.lock().await;
            store
                .set_connected(tenant_id, connected, &now)
                .map_err(|e| e.to_string())?
        };
        if applied {
            info!(tenant_id, connected, "gateway connection state updated");
            self.publish(tenant_id, ChangeTable::GatewayConfigs, tenant_id);
        } else {
            debug!(tenant_id, connected, "connection event for unconfigured tenant ignored");
        }
        Ok(HandlerOutcome::ConnectionUpdated { connected, applied })
    }

    async fn journal_failure(&self, tenant_id: &str, err: &str, raw: &[u8]) {
        let Some(journal) = &self.journal else {
            return;
        };
        let rec = FailedEvent::new(tenant_id, err, raw);
        match journal.append(&rec).await {
            Ok(()) => info!(tenant_id, failure_id = %rec.failure_id, "failed webhook journaled"),
            Err(journal_err) => error!(
                tenant_id,
                error = %journal_err,
                "failed to journal webhook failure"
            ),
        }
    }

    fn publish(&self, tenant_id: &str, table: ChangeTable, record_id: &str) {
        // No subscribers is the common case.
        let _ = self.changes.send(ChangeNotice {
            tenant_id: tenant_id.to_string(),
            table,
            record_id: record_id.to_string(),
        });
    }

    async fn put_gateway_config(
        &self,
        tenant_id: &str,
        credentials: GatewayCredentials,
    ) -> Result<GatewayConfigView, ApiError> {
        for (field, value) in [
            ("instance_id", &credentials.instance_id),
            ("token", &credentials.token),
            ("client_token", &credentials.client_token),
        ] {
            if value.trim().is_empty() {
                return Err(ApiError::Validation(format!("{field} is required")));
            }
        }
        let now = format_ts(Utc::now());
        let cfg = {
            let mut store = self.store.lock().await;
            store.upsert_gateway_config(tenant_id, credentials, &now)?
        };
        info!(tenant_id, instance_id = %cfg.credentials.instance_id, "gateway config saved");
        self.publish(tenant_id, ChangeTable::GatewayConfigs, tenant_id);
        Ok(config_view(&cfg, self.cfg.gateway.qr_ttl_ms, Utc::now()))
    }

    async fn gateway_config_view(&self, tenant_id: &str) -> Result<GatewayConfigView, ApiError> {
        let cfg = self.store.lock().await.gateway_config(tenant_id)?;
        cfg.map(|cfg| config_view(&cfg, self.cfg.gateway.qr_ttl_ms, Utc::now()))
            .ok_or_else(|| ApiError::NotFound(format!("no gateway config for tenant {tenant_id}")))
    }

    async fn tenant_client(&self, tenant_id: &str) -> Result<ZApiClient, ApiError> {
        let cfg = self
            .store
            .lock()
            .await
            .gateway_config(tenant_id)?
            .ok_or_else(|| ApiError::GatewayNotConfigured(tenant_id.to_string()))?;
        Ok(ZApiClient::new(
            self.http.clone(),
            &self.cfg.gateway.base_url,
            &cfg.credentials,
        ))
    }

    async fn fetch_qr_code(&self, tenant_id: &str) -> Result<QrCodeResponse, ApiError> {
        let client = self.tenant_client(tenant_id).await?;
        let image = client.qr_code().await?;
        let now = format_ts(Utc::now());
        self.store
            .lock()
            .await
            .save_qr_code(tenant_id, &image, &now)?;
        self.publish(tenant_id, ChangeTable::GatewayConfigs, tenant_id);
        Ok(QrCodeResponse { image })
    }

    async fn poll_connection_status(
        &self,
        tenant_id: &str,
    ) -> Result<ConnectionStatusResponse, ApiError> {
        let client = self.tenant_client(tenant_id).await?;
        let status = client.instance_status().await?;
        let connected = connection_flag(
            status.connected,
            status.smartphone_connected.unwrap_or(status.connected),
        );
        if let Some(reason) = status.error.as_deref() {
            debug!(tenant_id, reason, "gateway reported instance error");
        }
        let now = format_ts(Utc::now());
        self.store.lock().await.save_polled_status(
            tenant_id,
            connected,
            status.phone_number.as_deref(),
            &now,
        )?;
        self.publish(tenant_id, ChangeTable::GatewayConfigs, tenant_id);
        Ok(ConnectionStatusResponse { connected })
    }

    async fn register_webhooks(
        &self,
        tenant_id: &str,
        input: RegisterWebhooksRequest,
    ) -> Result<(), ApiError> {
        let url = input.webhook_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ApiError::Validation(
                "webhook_url must be an http(s) URL".to_string(),
            ));
        }
        let client = self.tenant_client(tenant_id).await?;
        client.update_webhooks(url).await?;
        info!(tenant_id, webhook_url = url, "gateway webhooks registered");
        Ok(())
    }

    /// Records the outbound message first, then dispatches it. A dispatch
    /// failure leaves the record in place with status `failed`.
    async fn send_message(
        &self,
        tenant_id: &str,
        input: SendMessageRequest,
    ) -> Result<SendMessageResponse, ApiError> {
        let phone = normalize_phone(&input.phone);
        if phone.is_empty() {
            return Err(ApiError::Validation("phone is required".to_string()));
        }
        let text = non_empty(input.text.as_deref());
        if text.is_none() && input.media.is_none() {
            return Err(ApiError::Validation(
                "either text or media is required".to_string(),
            ));
        }
        if let Some(media) = &input.media {
            if media.url.trim().is_empty() {
                return Err(ApiError::Validation("media.url is required".to_string()));
            }
        }

        let client = self.tenant_client(tenant_id).await?;
        let caption = input
            .media
            .as_ref()
            .and_then(|m| non_empty(m.caption.as_deref()))
            .or_else(|| text.clone());
        let new = NewMessage {
            phone: phone.clone(),
            direction: MessageDirection::Out,
            content: caption.clone(),
            media_kind: input.media.as_ref().map(|m| m.kind.as_str().to_string()),
            media_url: input.media.as_ref().map(|m| m.url.trim().to_string()),
            gateway_message_id: None,
        };
        let now = format_ts(Utc::now());
        let recorded = self.store.lock().await.record_message(tenant_id, new, &now)?;
        let RecordOutcome::Recorded {
            contact_id,
            message,
            ..
        } = recorded
        else {
            return Err(ApiError::Store(StoreError::Corrupt(
                "outbound message without gateway id reported as duplicate".to_string(),
            )));
        };
        self.publish(tenant_id, ChangeTable::Contacts, &contact_id);
        self.publish(tenant_id, ChangeTable::Messages, &message.id);

        let dispatched = match &input.media {
            Some(media) => client.send_media(&phone, media, caption.as_deref()).await,
            None => {
                client
                    .send_text(&phone, text.as_deref().unwrap_or_default())
                    .await
            }
        };

        let error = match dispatched {
            Ok(receipt) => {
                if let Some(gid) = receipt.gateway_message_id.as_deref() {
                    let attached = self
                        .store
                        .lock()
                        .await
                        .attach_gateway_message_id(tenant_id, &message.id, gid)?;
                    if !attached {
                        warn!(
                            tenant_id,
                            message_id = %message.id,
                            gateway_message_id = gid,
                            "gateway message id already bound to another record"
                        );
                    }
                } else {
                    warn!(tenant_id, message_id = %message.id, "gateway returned no message id");
                }
                info!(tenant_id, message_id = %message.id, "message dispatched");
                None
            }
            Err(err) => {
                warn!(tenant_id, message_id = %message.id, error = %err, "message dispatch failed");
                let failed_at = format_ts(Utc::now());
                let outcome = self
                    .store
                    .lock()
                    .await
                    .mark_failed(tenant_id, &message.id, &failed_at)?;
                debug!(tenant_id, outcome = ?outcome, "failed status applied");
                Some(err.to_string())
            }
        };

        let message = self
            .store
            .lock()
            .await
            .message(tenant_id, &message.id)?
            .ok_or_else(|| ApiError::NotFound(format!("message {} vanished", message.id)))?;
        self.publish(tenant_id, ChangeTable::Messages, &message.id);
        Ok(SendMessageResponse {
            success: error.is_none(),
            message,
            error,
        })
    }

    async fn list_messages(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<Vec<MessageRecord>, ApiError> {
        let store = self.store.lock().await;
        if store.contact(tenant_id, contact_id)?.is_none() {
            return Err(ApiError::NotFound(format!("unknown contact {contact_id}")));
        }
        Ok(store.list_messages(tenant_id, contact_id)?)
    }

    async fn mark_contact_read(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<ContactRecord, ApiError> {
        let contact = {
            let mut store = self.store.lock().await;
            if !store.mark_contact_read(tenant_id, contact_id)? {
                return Err(ApiError::NotFound(format!("unknown contact {contact_id}")));
            }
            store.contact(tenant_id, contact_id)?
        }
        .ok_or_else(|| ApiError::NotFound(format!("unknown contact {contact_id}")))?;
        self.publish(tenant_id, ChangeTable::Contacts, contact_id);
        Ok(contact)
    }
}

fn config_view(cfg: &ConnectionConfig, qr_ttl_ms: u64, now: DateTime<Utc>) -> GatewayConfigView {
    let qr_fresh = cfg
        .qr_code_updated_at
        .as_deref()
        .and_then(parse_rfc3339)
        .map(|at| {
            now.signed_duration_since(at).num_milliseconds()
                < i64::try_from(qr_ttl_ms).unwrap_or(i64::MAX)
        })
        .unwrap_or(false);
    GatewayConfigView {
        tenant_id: cfg.tenant_id.clone(),
        configured: true,
        connected: cfg.connected,
        phone_number: cfg.phone_number.clone(),
        qr_code: cfg.qr_code.clone().filter(|_| qr_fresh),
        qr_code_updated_at: cfg.qr_code_updated_at.clone().filter(|_| qr_fresh),
        updated_at: cfg.updated_at.clone(),
    }
}

fn tenant_key(raw: &str) -> Result<&str, ApiError> {
    let tenant_id = raw.trim();
    if tenant_id.is_empty() {
        return Err(ApiError::Validation("tenant_id is required".to_string()));
    }
    Ok(tenant_id)
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn webhook(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    body: Bytes,
) -> Result<Json<WebhookAck>, WebhookError> {
    state
        .process_webhook(Some(&tenant_id), &body)
        .await
        .map(|_| Json(WebhookAck::ok()))
}

async fn webhook_without_tenant(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<WebhookAck>, WebhookError> {
    state
        .process_webhook(None, &body)
        .await
        .map(|_| Json(WebhookAck::ok()))
}

async fn webhook_preflight() -> StatusCode {
    StatusCode::OK
}

async fn put_gateway_config(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(input): Json<GatewayCredentials>,
) -> Result<Json<GatewayConfigView>, ApiError> {
    let tenant_id = tenant_key(&tenant_id)?;
    state.put_gateway_config(tenant_id, input).await.map(Json)
}

async fn get_gateway_config(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<GatewayConfigView>, ApiError> {
    let tenant_id = tenant_key(&tenant_id)?;
    state.gateway_config_view(tenant_id).await.map(Json)
}

async fn fetch_qr_code(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<QrCodeResponse>, ApiError> {
    let tenant_id = tenant_key(&tenant_id)?;
    state.fetch_qr_code(tenant_id).await.map(Json)
}

async fn poll_connection_status(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<ConnectionStatusResponse>, ApiError> {
    let tenant_id = tenant_key(&tenant_id)?;
    state.poll_connection_status(tenant_id).await.map(Json)
}

async fn register_webhooks(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(input): Json<RegisterWebhooksRequest>,
) -> Result<Json<WebhookAck>, ApiError> {
    let tenant_id = tenant_key(&tenant_id)?;
    state.register_webhooks(tenant_id, input).await?;
    Ok(Json(WebhookAck::ok()))
}

async fn send_message(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(input): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<SendMessageResponse>), ApiError> {
    let tenant_id = tenant_key(&tenant_id)?;
    let response = state.send_message(tenant_id, input).await?;
    let status = if response.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    Ok((status, Json(response)))
}

async fn list_contacts(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<Vec<ContactRecord>>, ApiError> {
    let tenant_id = tenant_key(&tenant_id)?;
    let contacts = state.store.lock().await.list_contacts(tenant_id)?;
    Ok(Json(contacts))
}

async fn list_messages(
    State(state): State<AppState>,
    Path((tenant_id, contact_id)): Path<(String, String)>,
) -> Result<Json<Vec<MessageRecord>>, ApiError> {
    let tenant_id = tenant_key(&tenant_id)?;
    state.list_messages(tenant_id, &contact_id).await.map(Json)
}

async fn mark_contact_read(
    State(state): State<AppState>,
    Path((tenant_id, contact_id)): Path<(String, String)>,
) -> Result<Json<ContactRecord>, ApiError> {
    let tenant_id = tenant_key(&tenant_id)?;
    state.mark_contact_read(tenant_id, &contact_id).await.map(Json)
}

async fn changes(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let tenant_id = tenant_id.trim().to_string();
    let stream =
        BroadcastStream::new(state.changes.subscribe()).filter_map(move |item| match item {
            Ok(notice) if notice.tenant_id == tenant_id => SseEvent::default()
                .event("change")
                .json_data(&notice)
                .ok()
                .map(Ok),
            Ok(_) => None,
            Err(err) => {
                warn!(error = %err, "change feed subscriber lagged");
                None
            }
        });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    pub replayed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Feeds every journaled failure back through the webhook pipeline, then
/// rewrites the journal so only the entries that failed again remain.
pub async fn replay_failed_events(
    mut cfg: Config,
    journal_path: &str,
) -> Result<ReplaySummary, String> {
    let (entries, read_len) = load_journal(journal_path).await?;
    // Failures are kept in memory and written back below, never appended.
    cfg.journal.failed_events_path = None;
    let state = AppState::new(cfg).await?;

    let mut summary = ReplaySummary::default();
    let mut still_failing = Vec::new();
    for entry in entries {
        summary.replayed += 1;
        let outcome = match entry.raw_payload() {
            Ok(raw) => state
                .process_webhook(Some(&entry.tenant_id), &raw)
                .await
                .map_err(|e| e.to_string()),
            Err(err) => Err(err),
        };
        match outcome {
            Ok(outcome) => {
                info!(failure_id = %entry.failure_id, outcome = ?outcome, "journaled event replayed");
                summary.succeeded += 1;
            }
            Err(err) => {
                warn!(failure_id = %entry.failure_id, error = %err, "journaled event failed again");
                summary.failed += 1;
                still_failing.push(entry);
            }
        }
    }
    retain_failures(journal_path, read_len, &still_failing).await?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use zapcrm_config::{Gateway, Journal, Logging, Server, Store};
    use zapcrm_contracts::DeliveryStatus;

    fn memory_config() -> Config {
        Config {
            server: Server {
                listen_addr: "127.0.0.1:0".to_string(),
            },
            store: Store {
                kind: "memory".to_string(),
                sqlite_path: None,
            },
            gateway: Gateway {
                base_url: "http://127.0.0.1:9".to_string(),
                timeout_ms: 1_000,
                qr_ttl_ms: 20_000,
            },
            journal: Journal::default(),
            logging: Logging::default(),
        }
    }

    fn connection(qr_age_ms: i64, now: DateTime<Utc>) -> ConnectionConfig {
        ConnectionConfig {
            tenant_id: "t1".to_string(),
            credentials: GatewayCredentials {
                instance_id: "i".to_string(),
                token: "t".to_string(),
                client_token: "c".to_string(),
            },
            connected: true,
            phone_number: None,
            qr_code: Some("data:image/png;base64,AAAA".to_string()),
            qr_code_updated_at: Some(format_ts(
                now - chrono::Duration::milliseconds(qr_age_ms),
            )),
            updated_at: format_ts(now),
        }
    }

    #[test]
    fn qr_code_is_hidden_once_expired() {
        let now = Utc::now();
        let fresh = config_view(&connection(1_000, now), 20_000, now);
        assert!(fresh.qr_code.is_some());
        assert!(fresh.configured);

        let stale = config_view(&connection(25_000, now), 20_000, now);
        assert!(stale.qr_code.is_none());
        assert!(stale.qr_code_updated_at.is_none());
    }

    #[tokio::test]
    async fn blank_tenant_is_missing_tenant() {
        let state = AppState::new(memory_config()).await.unwrap();
        let err = state
            .process_webhook(Some("   "), br#"{"event":"message-status"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::MissingTenant));
    }

    #[tokio::test]
    async fn recorded_message_publishes_contact_and_message_changes() {
        let state = AppState::new(memory_config()).await.unwrap();
        let mut feed = state.changes.subscribe();

        let outcome = state
            .process_webhook(
                Some("t1"),
                br#"{"event":"message-received","messageId":"m1","phone":"5511999999999","body":"hi"}"#,
            )
            .await
            .unwrap();
        let HandlerOutcome::Recorded {
            message_id,
            contact_created,
        } = outcome
        else {
            panic!("expected a recorded message");
        };
        assert!(contact_created);

        let first = feed.try_recv().unwrap();
        assert_eq!(first.table, ChangeTable::Contacts);
        assert_eq!(first.tenant_id, "t1");
        let second = feed.try_recv().unwrap();
        assert_eq!(second.table, ChangeTable::Messages);
        assert_eq!(second.record_id, message_id);
    }

    #[tokio::test]
    async fn duplicate_and_unmatched_events_publish_nothing() {
        let state = AppState::new(memory_config()).await.unwrap();
        let body = br#"{"event":"message-received","messageId":"m1","phone":"5511999999999"}"#;
        state.process_webhook(Some("t1"), body).await.unwrap();

        let mut feed = state.changes.subscribe();
        let again = state.process_webhook(Some("t1"), body).await.unwrap();
        assert!(matches!(again, HandlerOutcome::Duplicate { .. }));

        let unmatched = state
            .process_webhook(
                Some("t1"),
                br#"{"event":"message-status","id":"nope","status":"viewed"}"#,
            )
            .await
            .unwrap();
        assert_eq!(
            unmatched,
            HandlerOutcome::Reconciled(ReconcileOutcome::Unmatched)
        );
        assert!(feed.try_recv().is_err());
    }

    #[tokio::test]
    async fn from_me_event_records_outbound_sent_message() {
        let state = AppState::new(memory_config()).await.unwrap();
        state
            .process_webhook(
                Some("t1"),
                br#"{"event":"message-received","messageId":"zapi-42","phone":"5511999999999","body":"from phone","fromMe":true}"#,
            )
            .await
            .unwrap();

        let store = state.store.lock().await;
        let contacts = store.list_contacts("t1").unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].unread_count, 0);
        let messages = store.list_messages("t1", &contacts[0].id).unwrap();
        assert_eq!(messages[0].direction, MessageDirection::Out);
        assert_eq!(messages[0].status, Some(DeliveryStatus::Sent));
    }

    #[tokio::test]
    async fn connection_event_without_config_is_not_applied() {
        let state = AppState::new(memory_config()).await.unwrap();
        let outcome = state
            .process_webhook(
                Some("t1"),
                br#"{"event":"connection-status-change","connected":true,"smartphoneConnected":true}"#,
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            HandlerOutcome::ConnectionUpdated {
                connected: true,
                applied: false
            }
        );
    }

    #[tokio::test]
    async fn media_event_keeps_kind_and_url() {
        let state = AppState::new(memory_config()).await.unwrap();
        state
            .process_webhook(
                Some("t1"),
                br#"{"event":"message-received","phone":"5511999999999","type":"image","mediaUrl":"https://cdn.example/x.jpg"}"#,
            )
            .await
            .unwrap();
        let store = state.store.lock().await;
        let contact = &store.list_contacts("t1").unwrap()[0];
        let message = &store.list_messages("t1", &contact.id).unwrap()[0];
        assert_eq!(message.media_kind.as_deref(), Some("image"));
        assert_eq!(message.media_url.as_deref(), Some("https://cdn.example/x.jpg"));
        assert_eq!(message.content, None);
    }
}
