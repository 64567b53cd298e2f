//! dbvault Web Server
//!
//! Axum-based REST API over the backup engine.
//!
//! Security model:
//! - Bearer-token authentication (secure by default, use --no-auth for local
//!   dev); tokens are compared in constant time
//! - Each token carries a set of roles; every endpoint declares the role it
//!   requires
//! - Sanitized error responses: engine error kinds map to stable
//!   `{code, message}` bodies, internals are logged server-side only

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use dbvault_core::engine::Engine;
use dbvault_core::{Error as CoreError, ErrorKind};

mod handlers;

#[cfg(test)]
mod tests;

/// Environment variable holding `token=role,role;token=...` entries.
pub const API_TOKENS_ENV: &str = "DBVAULT_API_TOKENS";

/// Maximum pagination limit
pub const MAX_PAGE_LIMIT: i64 = 1000;

/// Roles consumed from the auth collaborator. `Admin` implies everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Read,
    Create,
    Run,
    Configure,
    Restore,
    Delete,
    Admin,
}

impl Role {
    pub fn parse(s: &str) -> Option<Role> {
        match s.trim() {
            "backup:read" => Some(Role::Read),
            "backup:create" => Some(Role::Create),
            "backup:run" => Some(Role::Run),
            "backup:configure" => Some(Role::Configure),
            "backup:restore" => Some(Role::Restore),
            "backup:delete" => Some(Role::Delete),
            "backup:admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// One accepted bearer token and the roles it grants.
#[derive(Debug, Clone)]
pub struct ApiToken {
    pub token: String,
    pub roles: HashSet<Role>,
}

/// Parse the `DBVAULT_API_TOKENS` format: entries separated by `;`, each
/// `token=role,role`. Unknown roles are dropped with a warning.
pub fn parse_api_tokens(input: &str) -> Vec<ApiToken> {
    let mut tokens = Vec::new();
    for entry in input.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let Some((token, roles_str)) = entry.split_once('=') else {
            warn!("Ignoring malformed API token entry (expected token=roles)");
            continue;
        };
        let roles: HashSet<Role> = roles_str
            .split(',')
            .filter_map(|r| {
                let role = Role::parse(r);
                if role.is_none() && !r.trim().is_empty() {
                    warn!(role = r.trim(), "Unknown role in API token entry");
                }
                role
            })
            .collect();
        if token.is_empty() || roles.is_empty() {
            warn!("Ignoring API token entry with no usable roles");
            continue;
        }
        tokens.push(ApiToken {
            token: token.to_string(),
            roles,
        });
    }
    tokens
}

/// Server configuration
#[derive(Clone, Default)]
pub struct ServerConfig {
    /// Whether authentication is required (secure by default)
    pub require_auth: bool,
    /// Accepted bearer tokens
    pub tokens: Vec<ApiToken>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let tokens = std::env::var(API_TOKENS_ENV)
            .map(|raw| parse_api_tokens(&raw))
            .unwrap_or_default();
        Self {
            require_auth: true,
            tokens,
        }
    }
}

/// Authenticated caller context, attached by the middleware.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub roles: HashSet<Role>,
}

impl AuthContext {
    fn admin() -> Self {
        Self {
            roles: HashSet::from([Role::Admin]),
        }
    }

    /// Role gate used at the top of every handler.
    pub fn require(&self, role: Role) -> Result<(), AppError> {
        if self.roles.contains(&Role::Admin) || self.roles.contains(&role) {
            Ok(())
        } else {
            Err(AppError::forbidden("Insufficient role for this operation"))
        }
    }
}

/// Shared application state
pub struct AppState {
    pub engine: Arc<Engine>,
    pub config: ServerConfig,
}

/// Bearer-token authentication middleware.
///
/// Tokens are compared with constant-time equality to prevent timing
/// attacks. On success the caller's roles ride along as a request extension.
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    if !state.config.require_auth {
        request.extensions_mut().insert(AuthContext::admin());
        return next.run(request).await;
    }

    let presented = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "));

    if let Some(presented) = presented {
        if let Some(api_token) = lookup_token(presented, &state.config.tokens) {
            request.extensions_mut().insert(AuthContext {
                roles: api_token.roles.clone(),
            });
            return next.run(request).await;
        }
        warn!(path = %request.uri().path(), "Rejected request with invalid bearer token");
    } else {
        warn!(path = %request.uri().path(), "Rejected unauthenticated request");
    }

    AppError::unauthorized("Authentication required").into_response()
}

/// Find a configured token matching `presented`, in constant time per
/// comparison.
fn lookup_token<'a>(presented: &str, tokens: &'a [ApiToken]) -> Option<&'a ApiToken> {
    use subtle::ConstantTimeEq;

    let presented_bytes = presented.as_bytes();
    tokens.iter().find(|t| {
        let token_bytes = t.token.as_bytes();
        presented_bytes.len() == token_bytes.len()
            && bool::from(presented_bytes.ct_eq(token_bytes))
    })
}

/// Success response
#[derive(Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Create the application router
pub fn create_router(engine: Arc<Engine>, config: ServerConfig) -> Router {
    let state = Arc::new(AppState { engine, config });

    let automation = Router::new()
        // Targets
        .route(
            "/targets",
            get(handlers::list_targets).post(handlers::create_target),
        )
        .route(
            "/targets/test-connection",
            post(handlers::test_target_connection),
        )
        .route(
            "/targets/:id",
            get(handlers::get_target)
                .put(handlers::update_target)
                .delete(handlers::delete_target),
        )
        // Destinations
        .route(
            "/destinations",
            get(handlers::list_destinations).post(handlers::create_destination),
        )
        .route(
            "/destinations/test-connection",
            post(handlers::test_destination_connection),
        )
        .route(
            "/destinations/:id",
            get(handlers::get_destination)
                .put(handlers::update_destination)
                .delete(handlers::delete_destination),
        )
        .route("/destinations/:id/backups", get(handlers::list_backups))
        .route(
            "/destinations/:id/backups/download",
            get(handlers::download_backup),
        )
        .route(
            "/destinations/:id/backups/delete",
            delete(handlers::delete_backup),
        )
        // Schedules
        .route(
            "/schedules",
            get(handlers::list_schedules).post(handlers::create_schedule),
        )
        .route(
            "/schedules/run-enabled-now",
            post(handlers::run_enabled_now),
        )
        .route(
            "/schedules/:id",
            get(handlers::get_schedule)
                .put(handlers::update_schedule)
                .delete(handlers::delete_schedule),
        )
        .route("/schedules/:id/run-now", post(handlers::run_schedule_now))
        // Imperative operations
        .route("/backup-now", post(handlers::backup_now))
        .route("/restore-now", post(handlers::restore_now))
        // Audit history
        .route("/audit", get(handlers::list_runs))
        .route("/audit/:id", get(handlers::get_run));

    // Built-in local destination, kept at its legacy mount
    let local_backup = Router::new()
        .route(
            "/list",
            get(handlers::local_list_backups).post(handlers::local_list_backups),
        )
        .route("/download/:filename", get(handlers::local_download_backup))
        .route("/delete/:filename", delete(handlers::local_delete_backup));

    let authenticated = Router::new()
        .nest("/automation", automation)
        .nest("/backup", local_backup)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(authenticated)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the server with the given configuration
///
/// Runs crash recovery and the scheduler loop, binds the listener, and
/// serves until SIGINT; shutdown cancels in-flight runs.
pub async fn serve(
    engine: Arc<Engine>,
    host: &str,
    port: u16,
    config: ServerConfig,
) -> anyhow::Result<()> {
    if !config.require_auth {
        warn!("⚠️  Authentication disabled - do not expose to network!");
    }

    // Abandoned-run sweep, next-run recomputation, decision loop
    engine.start();

    let app = create_router(engine.clone(), config);
    let addr = format!("{}:{}", host, port);
    info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let shutdown_engine = engine.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
            shutdown_engine.shutdown();
        })
        .await?;

    Ok(())
}

// ============================================================================
// Error Handling
// ============================================================================

/// Application error with a stable wire code and proper HTTP status
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    retry_after: Option<u64>,
}

impl AppError {
    pub fn bad_request(msg: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "VALIDATION",
            message: msg.to_string(),
            retry_after: None,
        }
    }

    pub fn not_found(msg: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "NOT_FOUND",
            message: msg.to_string(),
            retry_after: None,
        }
    }

    pub fn unauthorized(msg: &str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "AUTH",
            message: msg.to_string(),
            retry_after: None,
        }
    }

    pub fn forbidden(msg: &str) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            code: "AUTH",
            message: msg.to_string(),
            retry_after: None,
        }
    }

    pub fn internal(msg: &str) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL",
            message: msg.to_string(),
            retry_after: None,
        }
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        let kind = err.kind();
        let status = match kind {
            ErrorKind::Validation
            | ErrorKind::ConfirmationRequired
            | ErrorKind::EncryptionPasswordRequired
            | ErrorKind::IncompatibleBackup
            | ErrorKind::DecryptFailed => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict | ErrorKind::Busy => StatusCode::CONFLICT,
            ErrorKind::Auth => StatusCode::FORBIDDEN,
            ErrorKind::Transient | ErrorKind::Permanent | ErrorKind::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let retry_after = match &err {
            CoreError::Busy { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };
        // Internal detail stays in the server log
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "Internal error");
            "An internal error occurred".to_string()
        } else {
            err.to_string()
        };
        Self {
            status,
            code: kind.code(),
            message,
            retry_after,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(secs) = self.retry_after {
            body["retry_after"] = serde_json::json!(secs);
        }
        (self.status, Json(body)).into_response()
    }
}
