/**
 * AUTHORITY HTTP API - Registration handshake and fleet directory
 *
 * PUBLIC ROUTES:
 * - POST /reg    component registration, outcome carried in the JSON `code`
 * - GET  /about  authority metadata
 * - GET  /list   registry rows (`?enabled=1` for live rows only)
 * - GET  /health process, registry and bus status
 *
 * OPERATOR ROUTES (header x-api-key must equal the access key):
 * - POST /notice               broadcast a Notice
 * - POST /command/daemon       publish a DaemonCommand
 * - POST /command/bot/{snowID} publish a BotCommand on the bot's topic
 */

use axum::body::Bytes;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use ntcb_core::bus::{publish_json, BusHealth};
use ntcb_core::header::ComponentHeader;
use ntcb_core::lifecycle::ComponentContext;
use ntcb_core::messages::{BotCommand, BotCommandKey, DaemonCommand, DaemonCommandKey, Notice};
use ntcb_core::registration::{codes, RegisterResponse};
use ntcb_core::topics;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Instant;
use tracing::{error, info, warn};

use crate::registry::{Registry, RegistryEntry, SharedRegistry};

#[derive(Clone)]
pub struct AppState {
    pub registry: SharedRegistry,
    pub ctx: ComponentContext,
    pub bus_health: BusHealth,
    pub started: Instant,
}

impl AppState {
    pub fn new(registry: SharedRegistry, ctx: ComponentContext, bus_health: BusHealth) -> Self {
        Self { registry, ctx, bus_health, started: Instant::now() }
    }

    fn access_key(&self) -> &str {
        &self.ctx.header.access_key
    }
}

pub fn build_router(app_state: AppState) -> Router {
    let operator = Router::new()
        .route("/notice", post(post_notice))
        .route("/command/daemon", post(post_daemon_command))
        .route("/command/bot/{snow_id}", post(post_bot_command))
        .route_layer(middleware::from_fn_with_state(app_state.clone(), require_api_key));

    Router::new()
        .route("/health", get(get_health))
        .route("/about", get(get_about))
        .route("/list", get(get_list))
        .route("/reg", post(post_register))
        .merge(operator)
        .with_state(app_state)
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let expected = app.access_key();
    if expected.is_empty() {
        warn!("operator request refused: no access key configured");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!("operator request to {} refused: bad api key", req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

/// Validates one registration body and records it.
///
/// Never fails at the HTTP level: every outcome is a `RegisterResponse`.
pub async fn handle_registration(registry: &Registry, access_key: &str, body: &[u8]) -> RegisterResponse {
    if body.iter().all(u8::is_ascii_whitespace) {
        return RegisterResponse::new(codes::EMPTY_BODY, "empty request body");
    }
    let value: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            warn!("registration body is not JSON: {e}");
            return RegisterResponse::new(codes::NOT_JSON, "request body is not valid JSON");
        }
    };
    let header: ComponentHeader = match serde_json::from_value(value) {
        Ok(h) => h,
        Err(e) => {
            warn!("registration body is not a header: {e}");
            return RegisterResponse::new(codes::NOT_A_HEADER, "request body is not a component header");
        }
    };
    if !header.node_id_valid() {
        warn!("registration from {} with serverNodeID {} out of range", header.component_id, header.server_node_id);
        return RegisterResponse::new(codes::NOT_A_HEADER, "request body is not a component header");
    }

    if access_key.is_empty() || header.access_key != access_key {
        info!("registration denied for {} (snowID {})", header.component_id, header.snow_id);
        return RegisterResponse::access_denied();
    }

    match registry.register(&header).await {
        Ok(row) => {
            info!("registered {} (snowID {}) as row {}", header.component_id, header.snow_id, row.row_id);
            RegisterResponse::success()
        }
        Err(e) => {
            error!("failed to store registration of {}: {e}", header.component_id);
            RegisterResponse::new(codes::REGISTRY_UNAVAILABLE, "registry unavailable")
        }
    }
}

// POST /reg
async fn post_register(State(app): State<AppState>, body: Bytes) -> Json<RegisterResponse> {
    Json(handle_registration(&app.registry, app.access_key(), &body).await)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct About {
    pub version: String,
    pub intro: String,
    pub author: String,
    #[serde(rename = "startTime")]
    pub start_time: String,
}

// GET /about
async fn get_about(State(app): State<AppState>) -> Json<About> {
    let header = &app.ctx.header;
    Json(About {
        version: header.version.clone(),
        intro: header.intro.clone(),
        author: header.author.clone(),
        start_time: header.start_time.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    enabled: Option<String>,
}

// GET /list
async fn get_list(State(app): State<AppState>, Query(params): Query<ListParams>) -> Json<Vec<RegistryEntry>> {
    let enabled_only = matches!(params.enabled.as_deref(), Some("1") | Some("true"));
    Json(app.registry.list(enabled_only).await)
}

// GET /health
async fn get_health(State(app): State<AppState>) -> Json<Value> {
    let (rows, enabled) = app.registry.counts().await;
    Json(json!({
        "status": "ok",
        "uptimeSeconds": app.started.elapsed().as_secs(),
        "registryRows": rows,
        "enabledRows": enabled,
        "busConnected": app.bus_health.is_connected(),
        "busReconnects": app.bus_health.reconnects(),
    }))
}

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn bus_failure(e: ntcb_core::BusError) -> (StatusCode, Json<Value>) {
    error!("operator publish failed: {e}");
    (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": e.to_string() })))
}

#[derive(Debug, Deserialize)]
struct NoticeRequest {
    title: String,
    #[serde(default)]
    content: String,
}

// POST /notice
async fn post_notice(State(app): State<AppState>, Json(req): Json<NoticeRequest>) -> ApiResult {
    let notice = Notice {
        publisher_id: app.ctx.header.publisher_id.clone(),
        publish_time: Utc::now(),
        notice_id: uuid::Uuid::new_v4().to_string(),
        title: req.title,
        content: req.content,
    };
    publish_json(app.ctx.publisher.as_ref(), topics::NOTICE, &notice).await.map_err(bus_failure)?;
    info!("notice {} broadcast: {}", notice.notice_id, notice.title);
    Ok(Json(json!({ "noticeID": notice.notice_id })))
}

#[derive(Debug, Deserialize)]
struct DaemonCommandRequest {
    #[serde(rename = "daemonSnowID")]
    daemon_snow_id: i64,
    #[serde(rename = "commandKey", default = "default_daemon_key")]
    command_key: DaemonCommandKey,
    #[serde(rename = "botID", default)]
    bot_id: String,
    #[serde(rename = "commandString", default)]
    command_string: String,
    #[serde(rename = "commandArguments", default)]
    command_arguments: String,
}

fn default_daemon_key() -> DaemonCommandKey {
    DaemonCommandKey::StartBot
}

// POST /command/daemon
async fn post_daemon_command(State(app): State<AppState>, Json(req): Json<DaemonCommandRequest>) -> ApiResult {
    let cmd = DaemonCommand {
        publisher_id: app.ctx.header.publisher_id.clone(),
        publish_time: Utc::now(),
        command_id: uuid::Uuid::new_v4().to_string(),
        daemon_snow_id: req.daemon_snow_id,
        command_key: req.command_key,
        bot_id: req.bot_id,
        command_string: req.command_string,
        command_arguments: req.command_arguments,
    };
    publish_json(app.ctx.publisher.as_ref(), topics::DAEMON, &cmd).await.map_err(bus_failure)?;
    info!("daemon command {} sent to {}", cmd.command_id, cmd.daemon_snow_id);
    Ok(Json(json!({ "commandID": cmd.command_id })))
}

#[derive(Debug, Deserialize)]
struct BotCommandRequest {
    #[serde(rename = "commandKey", default = "default_bot_key")]
    command_key: BotCommandKey,
    #[serde(rename = "jobArguments", default)]
    job_arguments: String,
}

fn default_bot_key() -> BotCommandKey {
    BotCommandKey::StartJob
}

// POST /command/bot/{snowID}
async fn post_bot_command(
    State(app): State<AppState>,
    Path(snow_id): Path<i64>,
    Json(req): Json<BotCommandRequest>,
) -> ApiResult {
    let cmd = BotCommand {
        publisher_id: app.ctx.header.publisher_id.clone(),
        publish_time: Utc::now(),
        command_id: uuid::Uuid::new_v4().to_string(),
        bot_snow_id: snow_id,
        command_key: req.command_key,
        job_arguments: req.job_arguments,
    };
    publish_json(app.ctx.publisher.as_ref(), &topics::bot(snow_id), &cmd).await.map_err(bus_failure)?;
    info!("bot command {} sent to {snow_id}", cmd.command_id);
    Ok(Json(json!({ "commandID": cmd.command_id })))
}
