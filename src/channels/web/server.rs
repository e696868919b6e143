//! Axum HTTP server for the board API.
//!
//! Board reads, refreshes and drag events sit behind the bearer token; the
//! health check and the Teamleader OAuth round trip are public.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Query, State},
    http::{StatusCode, header},
    middleware,
    response::{IntoResponse, Redirect},
    routing::{get, post},
};
use tokio::sync::oneshot;
use tower_http::cors::{AllowHeaders, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::channels::web::auth::{AuthState, auth_middleware};
use crate::channels::web::types::*;
use crate::error::{ChannelError, CrmError, SyncError};
use crate::mail::{BugReport, BugReportMailer};
use crate::oauth::CrmOAuth;
use crate::pipeline::board::BoardSnapshot;
use crate::pipeline::reconciler::Notification;
use crate::pipeline::service::{BoardService, DragReport, RefreshSummary};

/// Sliding-window rate limiter shared by all callers of one endpoint.
pub struct RateLimiter {
    remaining: AtomicU64,
    /// Epoch second when the current window started.
    window_start: AtomicU64,
    max_requests: u64,
    window_secs: u64,
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl RateLimiter {
    pub fn new(max_requests: u64, window_secs: u64) -> Self {
        Self {
            remaining: AtomicU64::new(max_requests),
            window_start: AtomicU64::new(epoch_secs()),
            max_requests,
            window_secs,
        }
    }

    /// Consume one request. Returns `false` when the window is exhausted.
    pub fn check(&self) -> bool {
        let now = epoch_secs();
        let window = self.window_start.load(Ordering::Relaxed);
        if now.saturating_sub(window) >= self.window_secs {
            self.window_start.store(now, Ordering::Relaxed);
            self.remaining
                .store(self.max_requests.saturating_sub(1), Ordering::Relaxed);
            return self.max_requests > 0;
        }

        loop {
            let current = self.remaining.load(Ordering::Relaxed);
            if current == 0 {
                return false;
            }
            if self
                .remaining
                .compare_exchange_weak(current, current - 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }
}

/// Shared state for all gateway handlers.
pub struct GatewayState {
    pub service: Arc<BoardService>,
    /// Teamleader OAuth session; `None` disables the login routes.
    pub oauth: Option<Arc<CrmOAuth>>,
    /// `None` when SMTP is not configured.
    pub mailer: Option<Arc<dyn BugReportMailer>>,
    pub bug_report_limiter: RateLimiter,
    pub shutdown_tx: tokio::sync::RwLock<Option<oneshot::Sender<()>>>,
    pub startup_time: std::time::Instant,
}

/// Start the gateway HTTP server.
///
/// Returns the actual bound `SocketAddr` (useful when binding to port 0).
pub async fn start_server(
    addr: SocketAddr,
    state: Arc<GatewayState>,
    auth_token: String,
) -> Result<SocketAddr, ChannelError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ChannelError::StartupFailed {
            name: "gateway".to_string(),
            reason: format!("Failed to bind to {}: {}", addr, e),
        })?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| ChannelError::StartupFailed {
            name: "gateway".to_string(),
            reason: format!("Failed to get local addr: {}", e),
        })?;

    let public = Router::new()
        .route("/api/health", get(health_handler))
        .route("/auth/teamleader/login", get(oauth_login_handler))
        .route("/auth/teamleader/callback", get(oauth_callback_handler));

    let auth_state = AuthState { token: auth_token };
    let protected = Router::new()
        .route("/api/board", get(board_handler))
        .route("/api/deals/refresh", post(deals_refresh_handler))
        .route("/api/employees/refresh", post(employees_refresh_handler))
        .route("/api/drag", post(drag_handler))
        .route("/api/bug-report", post(bug_report_handler))
        .route_layer(middleware::from_fn_with_state(auth_state, auth_middleware));

    let origin = |raw: String| {
        raw.parse::<header::HeaderValue>()
            .map_err(|e| ChannelError::StartupFailed {
                name: "gateway".to_string(),
                reason: format!("Invalid CORS origin {}: {}", raw, e),
            })
    };
    let cors = CorsLayer::new()
        .allow_origin([
            origin(format!("http://{}:{}", bound_addr.ip(), bound_addr.port()))?,
            origin(format!("http://localhost:{}", bound_addr.port()))?,
        ])
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(AllowHeaders::list([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
        ]));

    let app = Router::new()
        .merge(public)
        .merge(protected)
        .layer(DefaultBodyLimit::max(256 * 1024))
        .layer(cors)
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            header::HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            header::HeaderValue::from_static("DENY"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    *state.shutdown_tx.write().await = Some(shutdown_tx);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Web gateway shutting down");
            })
            .await
        {
            tracing::error!("Web gateway server error: {}", e);
        }
    });

    tracing::info!("Web gateway listening on {}", bound_addr);
    Ok(bound_addr)
}

// --- Error mapping ---

fn sync_error_status(e: &SyncError) -> StatusCode {
    match e {
        SyncError::Crm(CrmError::Unauthorized(_)) => StatusCode::UNAUTHORIZED,
        e if e.is_upstream() => StatusCode::BAD_GATEWAY,
        SyncError::StaleVersion(_) => StatusCode::CONFLICT,
        SyncError::MissingGroup(_) | SyncError::UnmappedPhase(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        SyncError::CoordinatorClosed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// What the user gets to see. Details stay in the log.
fn sync_error_message(e: &SyncError) -> String {
    match e {
        SyncError::Crm(CrmError::Unauthorized(_)) => {
            "CRM session expired, sign in to Teamleader again".to_string()
        }
        e if e.is_upstream() => "Could not reach the CRM or directory, please retry".to_string(),
        SyncError::StaleVersion(_) => {
            "The board changed in the meantime and was reloaded, please retry".to_string()
        }
        SyncError::MissingGroup(_) | SyncError::UnmappedPhase(_) => {
            "This opportunity cannot be synced to the CRM".to_string()
        }
        _ => "Something went wrong, please retry".to_string(),
    }
}

fn sync_failure(e: SyncError) -> (StatusCode, String) {
    tracing::warn!("Board request failed: {}", e);
    (sync_error_status(&e), sync_error_message(&e))
}

// --- Handlers ---

async fn health_handler(State(state): State<Arc<GatewayState>>) -> Json<HealthResponse> {
    let crm_connected = match &state.oauth {
        Some(oauth) => oauth.tokens().get().await.is_some(),
        None => false,
    };
    Json(HealthResponse {
        status: "healthy",
        channel: "gateway",
        uptime_secs: state.startup_time.elapsed().as_secs(),
        crm_connected,
    })
}

async fn board_handler(
    State(state): State<Arc<GatewayState>>,
) -> Result<Json<BoardSnapshot>, (StatusCode, String)> {
    state.service.snapshot().await.map(Json).map_err(sync_failure)
}

async fn deals_refresh_handler(
    State(state): State<Arc<GatewayState>>,
) -> Result<Json<RefreshSummary>, (StatusCode, String)> {
    state.service.refresh_deals().await.map(Json).map_err(sync_failure)
}

async fn employees_refresh_handler(
    State(state): State<Arc<GatewayState>>,
) -> Result<Json<RefreshSummary>, (StatusCode, String)> {
    state
        .service
        .refresh_employees()
        .await
        .map(Json)
        .map_err(sync_failure)
}

/// Illegal drops are a normal 200 carrying a `move_not_allowed`
/// notification; only failed write-throughs are errors.
async fn drag_handler(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<DragRequest>,
) -> Result<Json<DragReport>, (StatusCode, Json<DragFailure>)> {
    if req.client_id.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(DragFailure {
                status: "invalid",
                notification: Notification::SyncFailed {
                    message: "client_id is required".to_string(),
                },
            }),
        ));
    }
    match state.service.drag(&req.client_id, req.event).await {
        Ok(report) => Ok(Json(report)),
        Err(e) => {
            let (status, message) = sync_failure(e);
            Err((
                status,
                Json(DragFailure {
                    status: "failed",
                    notification: Notification::SyncFailed { message },
                }),
            ))
        }
    }
}

async fn bug_report_handler(
    State(state): State<Arc<GatewayState>>,
    Json(report): Json<BugReport>,
) -> Result<Json<BugReportResponse>, (StatusCode, String)> {
    if !state.bug_report_limiter.check() {
        return Err((
            StatusCode::TOO_MANY_REQUESTS,
            "Too many bug reports, try again later".to_string(),
        ));
    }
    report
        .validate()
        .map_err(|msg| (StatusCode::BAD_REQUEST, msg))?;
    let mailer = state.mailer.as_ref().ok_or((
        StatusCode::SERVICE_UNAVAILABLE,
        "Bug reports are not configured".to_string(),
    ))?;
    mailer.send(&report).await.map_err(|e| {
        tracing::error!("Bug report relay failed: {}", e);
        (
            StatusCode::BAD_GATEWAY,
            "Could not send the bug report".to_string(),
        )
    })?;
    Ok(Json(BugReportResponse { status: "sent" }))
}

async fn oauth_login_handler(
    State(state): State<Arc<GatewayState>>,
) -> Result<Redirect, (StatusCode, String)> {
    let oauth = state.oauth.as_ref().ok_or((
        StatusCode::SERVICE_UNAVAILABLE,
        "CRM login is not configured".to_string(),
    ))?;
    Ok(Redirect::to(&oauth.begin_login().await))
}

async fn oauth_callback_handler(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<OAuthCallbackQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let oauth = state.oauth.as_ref().ok_or((
        StatusCode::SERVICE_UNAVAILABLE,
        "CRM login is not configured".to_string(),
    ))?;
    if let Some(error) = query.error {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("Teamleader refused the login: {}", error),
        ));
    }
    let (Some(code), Some(login_state)) = (query.code, query.state) else {
        return Err((
            StatusCode::BAD_REQUEST,
            "Missing code or state".to_string(),
        ));
    };
    oauth
        .complete_login(&code, &login_state)
        .await
        .map_err(|e| sync_failure(SyncError::Crm(e)))?;

    if let Err(e) = state.service.refresh_deals().await {
        tracing::warn!("Initial deal load after login failed: {}", e);
    }
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        "Teamleader connected. You can close this tab.",
    ))
}
