//! HTTP surface of the gateway.
//!
//! Media proxy/resolution endpoints, Evolution-backed chat endpoints,
//! Meta Cloud API passthroughs, CRM contact CRUD and server administration.

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::credentials::{CredentialResolver, ServerCredentials, DEFAULT_USER};
use crate::error::GatewayError;
use crate::evolution::normalize::to_jid;
use crate::evolution::{ApiVersion, EvolutionClient, Message, Operation, ProbeRequest};
use crate::media::{
    is_meta_media_host, CloudinaryUploader, FetchedMedia, MediaAuth, MediaCache, MediaFetcher, MediaKind,
    MediaResolver, MediaUploader,
};
use crate::meta::MetaClient;
use crate::storage::{CrmStore, StoredContact, StoredMessage};
use crate::webhook;

const DEFAULT_MESSAGE_LIMIT: usize = 50;
const MAX_MESSAGE_LIMIT: usize = 500;

/// Shared application state
pub struct AppState {
    pub store: CrmStore,
    pub credentials: CredentialResolver,
    pub evolution: EvolutionClient,
    pub resolver: MediaResolver,
    pub fetcher: MediaFetcher,
    pub meta: Option<MetaClient>,
    cloudinary_enabled: bool,
    /// Last connection state reported by webhooks (instance -> state)
    connection_states: RwLock<HashMap<String, String>>,
    /// Last QR code reported by webhooks (instance -> base64 data URL)
    qr_codes: RwLock<HashMap<String, String>>,
}

impl AppState {
    pub fn new(config: &Config, store: CrmStore) -> anyhow::Result<Arc<Self>> {
        let user_agent = concat!("whatsapp-crm-gateway/", env!("CARGO_PKG_VERSION"));
        let http = reqwest::Client::builder().user_agent(user_agent).build()?;
        let fetcher = MediaFetcher::new(
            MediaFetcher::client_builder()
                .user_agent(user_agent)
                .build()?,
        );

        let uploader: Option<Arc<dyn MediaUploader>> = config.cloudinary.clone().map(|c| {
            info!("Cloudinary uploads enabled (cloud: {})", c.cloud_name);
            Arc::new(CloudinaryUploader::new(c, http.clone(), fetcher.clone()))
                as Arc<dyn MediaUploader>
        });
        let resolver = MediaResolver::new(
            MediaCache::new(config.media_cache.ttl, config.media_cache.capacity),
            uploader,
            &config.public_base_url,
        );

        Ok(Arc::new(Self {
            credentials: CredentialResolver::new(store.clone(), config.evolution.clone()),
            store,
            evolution: EvolutionClient::new(crate::evolution::EndpointProber::new(http.clone())),
            resolver,
            fetcher,
            meta: config.meta.clone().map(|m| MetaClient::new(m, http)),
            cloudinary_enabled: config.cloudinary.is_some(),
            connection_states: RwLock::new(HashMap::new()),
            qr_codes: RwLock::new(HashMap::new()),
        }))
    }

    pub async fn set_connection_state(&self, instance: &str, state: &str) {
        self.connection_states
            .write()
            .await
            .insert(instance.to_string(), state.to_string());
        if state == "open" {
            self.qr_codes.write().await.remove(instance);
        }
    }

    pub async fn connection_state(&self, instance: &str) -> Option<String> {
        self.connection_states.read().await.get(instance).cloned()
    }

    pub async fn set_qr_code(&self, instance: &str, qr: String) {
        self.qr_codes.write().await.insert(instance.to_string(), qr);
    }

    pub async fn qr_code(&self, instance: &str) -> Option<String> {
        self.qr_codes.read().await.get(instance).cloned()
    }

    fn meta(&self) -> Result<&MetaClient, GatewayError> {
        self.meta.as_ref().ok_or(GatewayError::NotConfigured("meta cloud api"))
    }

    /// Download auth for a media URL on behalf of a user. Meta hosts get the
    /// Graph token; the Evolution token only reaches the Evolution server.
    fn media_auth(&self, user_id: &str, url: &str) -> MediaAuth {
        if is_meta_media_host(url) {
            return self
                .meta
                .as_ref()
                .map(MetaClient::media_auth)
                .unwrap_or_default();
        }
        match self.credentials.resolve(user_id) {
            Ok(creds) => MediaAuth::evolution(&creds),
            Err(_) => MediaAuth::none(),
        }
    }
}

/// Caller's user id, taken from `x-user-id`
#[derive(Debug, Clone)]
pub struct UserId(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for UserId {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_USER);
        Ok(UserId(user.to_string()))
    }
}

/// Create the router with all routes
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Media
        .route("/api/media-proxy", get(media_proxy))
        .route("/api/audio-proxy", get(audio_proxy))
        .route("/api/media/resolve", get(resolve_media))
        .route("/api/meta-media/:media_id", get(meta_media))
        // Evolution chat
        .route("/api/chat/contacts-fix", get(contacts_fix))
        .route("/api/chat/direct-contacts", get(direct_contacts))
        .route("/api/chat/messages/:jid", get(chat_messages))
        .route("/api/chat/send", post(chat_send))
        .route("/api/connection/state", get(connection_state))
        .route("/api/connection/qr", get(connection_qr))
        .route("/api/diagnostics/contacts", get(diagnose_contacts))
        // Meta Cloud API
        .route("/api/meta-direct-send", post(meta_send))
        .route("/api/meta-direct-templates", get(meta_templates))
        // CRM
        .route("/api/contacts", get(list_contacts).post(create_contact))
        .route(
            "/api/contacts/:id",
            get(get_contact).put(update_contact).delete(delete_contact),
        )
        // Admin
        .route("/api/servers", get(list_servers).post(add_server))
        .route("/api/servers/:id", axum::routing::patch(set_server_active))
        .route("/api/users/:user_id/servers", post(assign_server))
        // Webhooks
        .route("/api/evolution-webhook", post(webhook::receive))
        .route("/api/evolution-webhook/*event", post(webhook::receive_event))
        .route("/api/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the web server
pub async fn start_server(state: Arc<AppState>, host: &str, port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let router = create_router(state);

    info!("Gateway listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    Ok(())
}

fn decode_path(value: String) -> String {
    urlencoding::decode(&value)
        .map(|s| s.into_owned())
        .unwrap_or(value)
}

fn media_response(media: FetchedMedia) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, media.content_type),
            (header::CACHE_CONTROL, "public, max-age=86400".to_string()),
        ],
        media.bytes,
    )
        .into_response()
}

// Media handlers

#[derive(Debug, Deserialize)]
struct MediaQuery {
    url: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    mime: Option<String>,
}

impl MediaQuery {
    fn url(&self) -> Result<&str, GatewayError> {
        self.url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| GatewayError::InvalidRequest("url is required".to_string()))
    }

    fn kind(&self) -> Option<MediaKind> {
        self.kind.as_deref().and_then(|k| k.parse().ok())
    }
}

async fn media_proxy(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
    Query(query): Query<MediaQuery>,
) -> Result<Response, GatewayError> {
    let url = query.url()?;
    let auth = state.media_auth(&user_id, url);
    let media = state
        .fetcher
        .fetch(url, &auth, query.mime.as_deref(), query.kind())
        .await?;
    Ok(media_response(media))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AudioQuery {
    url: Option<String>,
    message_id: Option<String>,
}

async fn audio_proxy(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
    Query(query): Query<AudioQuery>,
) -> Result<Response, GatewayError> {
    // Evolution can decrypt the message itself, which beats fetching the .enc blob
    if let Some(message_id) = query.message_id.as_deref().filter(|id| !id.is_empty()) {
        if let Ok(creds) = state.credentials.resolve(&user_id) {
            match state.evolution.media_base64(&creds, message_id).await {
                Ok(decoded) => {
                    let content_type = decoded
                        .mime_type
                        .filter(|m| m.starts_with("audio/"))
                        .unwrap_or_else(|| "audio/ogg".to_string());
                    return Ok((
                        StatusCode::OK,
                        [(header::CONTENT_TYPE, content_type)],
                        decoded.bytes,
                    )
                        .into_response());
                }
                Err(e) => debug!("Base64 download failed for {}: {}", message_id, e),
            }
        }
    }

    let url = query
        .url
        .as_deref()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| GatewayError::InvalidRequest("url or messageId is required".to_string()))?;
    let auth = state.media_auth(&user_id, url);
    let mut media = state
        .fetcher
        .fetch(url, &auth, None, Some(MediaKind::Audio))
        .await?;
    if media.kind != MediaKind::Audio {
        media.content_type = "audio/ogg".to_string();
    }
    Ok(media_response(media))
}

async fn resolve_media(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
    Query(query): Query<MediaQuery>,
) -> Result<impl IntoResponse, GatewayError> {
    let url = query.url()?;
    let auth = state.media_auth(&user_id, url);
    let resolved = state
        .resolver
        .resolve(url, query.mime.as_deref(), query.kind(), &auth)
        .await?;
    Ok(Json(resolved))
}

async fn meta_media(
    State(state): State<Arc<AppState>>,
    Path(media_id): Path<String>,
) -> Result<Response, GatewayError> {
    let meta = state.meta()?;
    let info = meta.media_info(&media_id).await?;
    let media = state
        .fetcher
        .fetch(&info.url, &meta.media_auth(), info.mime_type.as_deref(), None)
        .await?;
    Ok(media_response(media))
}

// Evolution chat handlers

async fn contacts_fix(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
) -> Result<impl IntoResponse, GatewayError> {
    let creds = state.credentials.resolve(&user_id)?;
    let contacts = state.evolution.fetch_contacts(&creds).await?;

    for contact in &contacts {
        state
            .store
            .upsert_contact(&user_id, &StoredContact::from(contact))?;
    }

    Ok(Json(contacts))
}

async fn direct_contacts(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
) -> Result<impl IntoResponse, GatewayError> {
    let creds = state.credentials.resolve(&user_id)?;
    let contacts = state.evolution.fetch_chats(&creds).await?;
    Ok(Json(contacts))
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    limit: Option<usize>,
}

async fn chat_messages(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
    Path(jid): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<impl IntoResponse, GatewayError> {
    let jid = to_jid(&decode_path(jid));
    let limit = query
        .limit
        .unwrap_or(DEFAULT_MESSAGE_LIMIT)
        .clamp(1, MAX_MESSAGE_LIMIT);

    let creds = state.credentials.resolve(&user_id)?;
    let mut messages = state.evolution.fetch_messages(&creds, &jid, limit).await?;
    resolve_message_media(&state, &creds, &mut messages).await;

    Ok(Json(messages))
}

async fn resolve_message_media(state: &AppState, creds: &ServerCredentials, messages: &mut [Message]) {
    let auth = MediaAuth::evolution(creds);
    for message in messages.iter_mut() {
        let Some(media) = message.media.as_mut() else {
            continue;
        };
        let Some(url) = media.url.as_deref() else {
            continue;
        };
        match state
            .resolver
            .resolve(url, media.mime_type.as_deref(), Some(media.kind), &auth)
            .await
        {
            Ok(resolved) => media.resolved_url = Some(resolved.url),
            Err(e) => warn!("Could not resolve media of {}: {}", message.id, e),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendRequest {
    number: String,
    text: String,
}

async fn chat_send(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
    Json(req): Json<SendRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let creds = state.credentials.resolve(&user_id)?;
    let sent = state.evolution.send_text(&creds, &req.number, &req.text).await?;

    if let Some(id) = &sent.message_id {
        let now = chrono::Utc::now().timestamp();
        state.store.add_message(
            &user_id,
            &StoredMessage {
                id: id.clone(),
                contact_id: sent.remote_jid.clone(),
                from_me: true,
                timestamp: now,
                message_type: "conversation".to_string(),
                body: Some(req.text.clone()),
                media_url: None,
                media_mime: None,
            },
        )?;
    }

    Ok(Json(sent))
}

#[derive(Debug, Serialize)]
struct ConnectionStateResponse {
    instance: String,
    state: String,
    source: &'static str,
}

async fn connection_state(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
) -> Result<impl IntoResponse, GatewayError> {
    let creds = state.credentials.resolve(&user_id)?;
    let (current, source) = match state.evolution.connection_state(&creds).await {
        Ok(current) => {
            state.set_connection_state(&creds.instance_id, &current).await;
            (current, "live")
        }
        Err(e) => match state.connection_state(&creds.instance_id).await {
            Some(cached) => {
                warn!("Live connection state unavailable, using webhook state: {}", e);
                (cached, "webhook")
            }
            None => return Err(e),
        },
    };

    Ok(Json(ConnectionStateResponse {
        instance: creds.instance_id,
        state: current,
        source,
    }))
}

async fn connection_qr(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
) -> Result<impl IntoResponse, GatewayError> {
    let creds = state.credentials.resolve(&user_id)?;
    let qr = match state.evolution.qr_code(&creds).await? {
        Some(qr) => Some(qr),
        None => state.qr_code(&creds.instance_id).await,
    };
    Ok(Json(json!({ "instance": creds.instance_id, "qr": qr })))
}

async fn diagnose_contacts(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
) -> Result<impl IntoResponse, GatewayError> {
    let creds = state.credentials.resolve(&user_id)?;
    let reports = state
        .evolution
        .prober()
        .diagnose(&creds, &ProbeRequest::new(Operation::FetchContacts))
        .await;
    let working = reports.iter().filter(|r| r.ok).count();
    Ok(Json(json!({
        "instance": creds.instance_id,
        "apiUrl": creds.api_url,
        "working": working,
        "endpoints": reports,
    })))
}

// Meta handlers

#[derive(Debug, Deserialize)]
struct MetaSendRequest {
    to: String,
    template: Option<String>,
    language: Option<String>,
    components: Option<Value>,
    text: Option<String>,
}

async fn meta_send(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MetaSendRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let meta = state.meta()?;
    let message_id = match (req.template.as_deref(), req.text.as_deref()) {
        (Some(name), _) => {
            meta.send_template(
                &req.to,
                name,
                req.language.as_deref().unwrap_or_default(),
                req.components.clone(),
            )
            .await?
        }
        (None, Some(text)) => meta.send_text(&req.to, text).await?,
        (None, None) => {
            return Err(GatewayError::InvalidRequest(
                "either template or text is required".to_string(),
            ))
        }
    };
    Ok(Json(json!({ "messageId": message_id })))
}

async fn meta_templates(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, GatewayError> {
    let templates = state.meta()?.list_templates().await?;
    Ok(Json(templates))
}

// CRM contact handlers

async fn list_contacts(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
) -> Result<impl IntoResponse, GatewayError> {
    Ok(Json(state.store.get_contacts(&user_id)?))
}

#[derive(Debug, Deserialize)]
struct ContactRequest {
    id: Option<String>,
    name: Option<String>,
    phone: Option<String>,
    status: Option<String>,
}

async fn create_contact(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
    Json(req): Json<ContactRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let id = match (req.id.as_deref(), req.phone.as_deref()) {
        (Some(id), _) if !id.trim().is_empty() => id.trim().to_string(),
        (_, Some(phone)) if phone.chars().any(|c| c.is_ascii_digit()) => to_jid(phone),
        _ => {
            return Err(GatewayError::InvalidRequest(
                "id or phone is required".to_string(),
            ))
        }
    };

    let contact = StoredContact {
        id: id.clone(),
        name: req.name,
        phone: req.phone,
        last_message: None,
        last_message_time: 0,
        status: req.status,
        profile_pic_url: None,
    };
    state.store.upsert_contact(&user_id, &contact)?;
    let stored = state
        .store
        .get_contact(&user_id, &id)?
        .ok_or_else(|| GatewayError::NotFound(format!("contact {}", id)))?;

    Ok((StatusCode::CREATED, Json(stored)))
}

async fn get_contact(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    let id = decode_path(id);
    let contact = state
        .store
        .get_contact(&user_id, &id)?
        .ok_or_else(|| GatewayError::NotFound(format!("contact {}", id)))?;
    let messages = state.store.get_messages(&user_id, &id)?;
    Ok(Json(json!({ "contact": contact, "messages": messages })))
}

async fn update_contact(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
    Json(req): Json<ContactRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let id = decode_path(id);
    let updated = state.store.update_contact(
        &user_id,
        &id,
        req.name.as_deref(),
        req.phone.as_deref(),
        req.status.as_deref(),
    )?;
    if !updated {
        return Err(GatewayError::NotFound(format!("contact {}", id)));
    }
    let contact = state
        .store
        .get_contact(&user_id, &id)?
        .ok_or_else(|| GatewayError::NotFound(format!("contact {}", id)))?;
    Ok(Json(contact))
}

async fn delete_contact(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
) -> Result<StatusCode, GatewayError> {
    let id = decode_path(id);
    if state.store.delete_contact(&user_id, &id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(GatewayError::NotFound(format!("contact {}", id)))
    }
}

// Admin handlers

async fn list_servers(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, GatewayError> {
    Ok(Json(state.store.list_servers()?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddServerRequest {
    name: String,
    api_url: String,
    api_token: String,
    api_version: Option<String>,
}

async fn add_server(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddServerRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    if req.api_url.trim().is_empty() || req.api_token.trim().is_empty() {
        return Err(GatewayError::InvalidRequest(
            "apiUrl and apiToken are required".to_string(),
        ));
    }
    let api_version = req
        .api_version
        .as_deref()
        .filter(|v| !v.is_empty())
        .map(str::parse::<ApiVersion>)
        .transpose()
        .map_err(GatewayError::InvalidRequest)?;

    let id = state
        .store
        .add_server(&req.name, req.api_url.trim(), &req.api_token, api_version)?;
    info!("Registered Evolution server {} ({})", req.name, id);
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

#[derive(Debug, Deserialize)]
struct ServerActiveRequest {
    active: bool,
}

async fn set_server_active(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<ServerActiveRequest>,
) -> Result<StatusCode, GatewayError> {
    if state.store.set_server_active(id, req.active)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(GatewayError::NotFound(format!("server {}", id)))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignServerRequest {
    server_id: i64,
    instance_id: String,
}

async fn assign_server(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(req): Json<AssignServerRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    if req.instance_id.trim().is_empty() {
        return Err(GatewayError::InvalidRequest("instanceId is required".to_string()));
    }
    let user_id = decode_path(user_id);
    state
        .store
        .assign_server(&user_id, req.server_id, req.instance_id.trim())?;
    Ok(Json(json!({
        "userId": user_id,
        "serverId": req.server_id,
        "instanceId": req.instance_id.trim(),
    })))
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let evolution = state.credentials.resolve(DEFAULT_USER).is_ok();
    Json(json!({
        "status": "ok",
        "evolution": evolution,
        "cloudinary": state.cloudinary_enabled,
        "meta": state.meta.is_some(),
        "cachedMedia": state.resolver.cache().len().await,
    }))
}
