use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use server_api::{auth::AuthConfig, ApiContext};
use shared::{
    domain::{FileId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{Credentials, LoginResponse},
};
use storage::Storage;
use tower_http::{limit::RequestBodyLimitLayer, services::ServeDir};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod hub;
mod ws;

use app_state::AppState;
use config::{load_settings, prepare_database_url, DEV_JWT_SECRET};
use hub::Hub;

/// Headroom for multipart boundaries and part headers on top of the file itself.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
struct GuestRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
    id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    if settings.jwt_secret == DEV_JWT_SECRET {
        warn!("using the built-in development JWT secret; set APP__JWT_SECRET in production");
    }
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = AppState {
        api: ApiContext {
            storage,
            auth: AuthConfig {
                jwt_secret: settings.jwt_secret,
                token_ttl_seconds: settings.token_ttl_seconds,
            },
            allow_guests: settings.allow_guests,
        },
        hub: Hub::new(),
        max_upload_bytes: settings.max_upload_bytes,
        static_dir: settings.static_dir,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, allow_guests = settings.allow_guests, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    let upload_limit = state.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD_BYTES);
    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/guest", post(guest))
        .route(
            "/upload",
            post(upload)
                .layer::<_, Infallible>(DefaultBodyLimit::disable())
                .layer(RequestBodyLimitLayer::new(upload_limit)),
        )
        .route("/files/:file_id", get(download_file))
        .route("/ws", get(ws_handler));

    let router = match &state.static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router,
    };
    router.with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(error: ApiError) -> (StatusCode, Json<ApiError>) {
    (status_for(error.code), Json(error))
}

async fn healthz(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    match state.api.storage.health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(error) => {
            error!(%error, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    }
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<Credentials>,
) -> ApiResult<StatusCode> {
    server_api::register(&state.api, &req)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::CREATED)
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<Credentials>,
) -> ApiResult<Json<LoginResponse>> {
    let session = server_api::login(&state.api, &req)
        .await
        .map_err(api_error)?;
    Ok(Json(session))
}

async fn guest(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GuestRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let session = server_api::guest_login(&state.api, &req.name)
        .await
        .map_err(api_error)?;
    Ok(Json(session))
}

/// Accepts a multipart form with a `file` field and answers with the plain
/// URL of the stored file.
async fn upload(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> ApiResult<String> {
    let multipart_error = |e: axum::extract::multipart::MultipartError| {
        let code = if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ErrorCode::PayloadTooLarge
        } else {
            ErrorCode::Validation
        };
        api_error(ApiError::new(code, e.body_text()))
    };

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().map(str::to_owned);
        let mime_type = field.content_type().map(str::to_owned);
        let body = field.bytes().await.map_err(multipart_error)?;
        if body.len() > state.max_upload_bytes {
            return Err(api_error(ApiError::new(
                ErrorCode::PayloadTooLarge,
                format!("upload exceeds {} bytes", state.max_upload_bytes),
            )));
        }
        return server_api::store_upload(
            &state.api,
            filename.as_deref(),
            mime_type.as_deref(),
            &body,
        )
        .await
        .map_err(api_error);
    }

    Err(api_error(ApiError::new(
        ErrorCode::Validation,
        "multipart form has no 'file' field",
    )))
}

async fn download_file(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let file = server_api::load_upload(&state.api, FileId(file_id))
        .await
        .map_err(api_error)?;
    debug!(file_id = file.file_id.0, size_bytes = file.size_bytes, "serving upload");

    let mut headers = HeaderMap::new();
    let content_type = file
        .mime_type
        .as_deref()
        .unwrap_or("application/octet-stream");
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    if let Some(filename) = file.filename {
        if let Ok(value) = HeaderValue::from_str(&format!("inline; filename=\"{filename}\"")) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }

    Ok((StatusCode::OK, headers, file.body))
}

/// The token (or guest name) is checked before the upgrade so that rejected
/// clients see a plain HTTP 401.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> Response {
    let user_id = match authenticate_socket(&state, &q).await {
        Ok(user_id) => user_id,
        Err(error) => {
            warn!(code = ?error.code, message = %error.message, "websocket handshake rejected");
            return api_error(error).into_response();
        }
    };
    ws.on_upgrade(move |socket| ws::ws_connection(state, socket, user_id))
}

async fn authenticate_socket(state: &AppState, q: &WsQuery) -> Result<UserId, ApiError> {
    match (q.token.as_deref(), q.id.as_deref()) {
        (Some(token), _) => server_api::authenticate_token(&state.api, token).await,
        (None, Some(guest)) => server_api::authenticate_guest(&state.api, guest).await,
        (None, None) => Err(ApiError::new(
            ErrorCode::Unauthorized,
            "missing token",
        )),
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;

#[cfg(test)]
#[path = "tests/ws_tests.rs"]
mod ws_tests;
