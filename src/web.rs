//! HTTP surface of the factory.
//!
//! Management routes sit behind HTTP basic auth; the package listing, the
//! profile API, finished-task logs and the apt repository itself are
//! public. Webhook firing is public but HMAC-verified per target.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, HeaderMap, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Redirect, Response},
    routing::{get, post},
    Form, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::app::{FactoryContext, CONFIGS_HOOK_TARGET};
use crate::recipes::BuildConfig;
use crate::signature::verify_hub_signature;

const AUTH_REALM: &str = "TorigoyaFactory";
const LIVE_TAIL_TIMEOUT: Duration = Duration::from_secs(60);
const LIVE_TAIL_POLL: Duration = Duration::from_secs(1);

/// Basic-auth credentials for the management routes.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub user: String,
    pub password: String,
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<FactoryContext>,
    pub auth: Arc<AuthConfig>,
}

/// Assemble the full route table.
pub fn router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/build/:name/:version", get(start_build))
        .route("/queue/:name/:version", get(queue_build))
        .route("/live_status/:id", get(live_status))
        .route("/abort_task/:id", get(abort_task))
        .route("/remove_package/:name/:version", get(remove_package))
        .route("/webhooks", get(list_webhooks))
        .route("/webhooks/append", post(append_webhook))
        .route("/webhooks/update/:id", post(update_webhook))
        .route("/webhooks/delete/:id", post(delete_webhook))
        .route("/daily_tasks", get(list_daily_tasks))
        .route("/daily_tasks/append", post(append_daily_task))
        .route("/daily_tasks/update/:id", post(update_daily_task))
        .route("/daily_tasks/delete/:id", post(delete_daily_task))
        .route("/update_proc_config_sets", get(update_proc_config_sets))
        .route("/regenerate_profiles", get(regenerate_profiles))
        .route("/system_logs", get(system_logs))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/", get(index))
        .route("/status/:id", get(task_status))
        .route("/packages", get(show_packages))
        .route("/information", get(information))
        .route("/api/profiles", get(api_profiles))
        .route("/webhooks/fire/:name", post(fire_webhook))
        .nest_service("/apt", ServeDir::new(state.ctx.apt.base_dir()))
        .merge(authed)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Check an `Authorization: Basic …` header against the configured
/// credentials.
fn check_basic_auth(header_value: &str, user: &str, password: &str) -> bool {
    let Some(encoded) = header_value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    match decoded.split_once(':') {
        Some((u, p)) => u == user && p == password,
        None => false,
    }
}

async fn require_auth(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| check_basic_auth(value, &state.auth.user, &state.auth.password))
        .unwrap_or(false);

    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            [(
                header::WWW_AUTHENTICATE,
                format!("Basic realm=\"{}\"", AUTH_REALM),
            )],
            "authentication required",
        )
            .into_response();
    }

    next.run(request).await
}

fn internal_error(message: impl ToString) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, message.to_string()).into_response()
}

/// Optional dependency pin on the build/queue routes.
#[derive(Debug, Default, Deserialize)]
struct DepQuery {
    dep_name: Option<String>,
    dep_version: Option<String>,
}

impl DepQuery {
    fn pin(&self) -> Option<(&str, &str)> {
        match (self.dep_name.as_deref(), self.dep_version.as_deref()) {
            (Some(name), Some(version)) if !name.is_empty() => Some((name, version)),
            _ => None,
        }
    }
}

async fn index(State(state): State<AppState>) -> Response {
    let ctx = &state.ctx;

    let queued: Vec<_> = ctx
        .queued_tasks()
        .iter()
        .map(|task| {
            json!({
                "name": task.config.name(),
                "version": task.config.version(),
                "dep_name": task.config.dep_name(),
                "dep_version": task.config.dep_version(),
            })
        })
        .collect();

    let config_sets: Vec<_> = ctx
        .recipes
        .map()
        .values()
        .map(|set| {
            json!({
                "name": set.name,
                "versions": set.versions,
                "type": set.kind,
                "languages": set.languages.keys().collect::<Vec<_>>(),
            })
        })
        .collect();

    Json(json!({
        "config_sets": config_sets,
        "tasks": ctx.tasks.display_tasks(),
        "queued_tasks": queued,
    }))
    .into_response()
}

async fn start_build(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
    Query(dep): Query<DepQuery>,
) -> Response {
    info!("build name => {} version => {}", name, version);
    let ctx = &state.ctx;

    let config = match build_config_for(ctx, &name, &version, &dep) {
        Ok(config) => config,
        Err(response) => return response,
    };

    let task_id = FactoryContext::build_async(ctx, config);
    Redirect::to(&format!("/live_status/{}", task_id)).into_response()
}

async fn queue_build(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
    Query(dep): Query<DepQuery>,
) -> Response {
    info!("queue name => {} version => {}", name, version);
    let ctx = &state.ctx;

    if let Some((dep_name, dep_version)) = dep.pin() {
        match ctx
            .recipes
            .find_with_dep(&name, &version, dep_name, dep_version, &ctx.packages)
        {
            Ok(config) => ctx.queue(config).await,
            Err(err) => return internal_error(err),
        }
    } else if let Err(err) = ctx.queue_with_fanout(&name, &version).await {
        return internal_error(err);
    }

    Redirect::to("/").into_response()
}

fn build_config_for(
    ctx: &Arc<FactoryContext>,
    name: &str,
    version: &str,
    dep: &DepQuery,
) -> Result<BuildConfig, Response> {
    match dep.pin() {
        Some((dep_name, dep_version)) => ctx
            .recipes
            .find_with_dep(name, version, dep_name, dep_version, &ctx.packages)
            .map_err(internal_error),
        None => ctx
            .recipes
            .find(name, version)
            .map(BuildConfig::Bare)
            .map_err(internal_error),
    }
}

async fn live_status(State(state): State<AppState>, Path(id): Path<usize>) -> Response {
    let ctx = state.ctx.clone();

    let Some(task) = ctx.tasks.get(id) else {
        return internal_error("task is nil");
    };

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::convert::Infallible>>(16);
    tokio::spawn(async move {
        let deadline = Instant::now() + LIVE_TAIL_TIMEOUT;

        let Ok(mut file) = tokio::fs::File::open(&task.log_file_path).await else {
            let _ = tx.send(Ok(Bytes::from("failed to open the log file\n"))).await;
            return;
        };

        let mut buffer = vec![0u8; 4096];
        loop {
            match file.read(&mut buffer).await {
                Ok(0) => {
                    let active = ctx
                        .tasks
                        .get(id)
                        .map(|task| task.is_active())
                        .unwrap_or(false);
                    if !active || Instant::now() >= deadline {
                        break;
                    }
                    tokio::time::sleep(LIVE_TAIL_POLL).await;
                }
                Ok(n) => {
                    if tx.send(Ok(Bytes::copy_from_slice(&buffer[..n]))).await.is_err() {
                        return;
                    }
                }
                Err(_) => break,
            }

            if Instant::now() >= deadline {
                break;
            }
        }

        let status = ctx
            .tasks
            .get(id)
            .map(|task| task.status.to_string())
            .unwrap_or_default();
        let _ = tx
            .send(Ok(Bytes::from(format!("Current Status => {}\n", status))))
            .await;
        info!("live tail for task {} finished", id);
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header("X-Content-Type-Options", "nosniff")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| internal_error("failed to build response"))
}

async fn task_status(State(state): State<AppState>, Path(id): Path<usize>) -> Response {
    let Some(task) = state.ctx.tasks.get(id) else {
        return internal_error("task is nil");
    };

    if task.is_active() {
        return internal_error("task is now active");
    }

    let log = match tokio::fs::read_to_string(&task.log_file_path).await {
        Ok(log) => log,
        Err(_) => return internal_error("Failed to read logfile"),
    };

    Json(json!({ "task": task, "log": log })).into_response()
}

async fn abort_task(State(state): State<AppState>, Path(id): Path<usize>) -> Response {
    match state.ctx.tasks.abort(id).await {
        Ok(()) => Redirect::to("/").into_response(),
        Err(err) => {
            warn!("failed to abort task {}: {}", id, err);
            internal_error(err)
        }
    }
}

async fn show_packages(State(state): State<AppState>) -> Response {
    let ctx = &state.ctx;
    Json(json!({
        "last_updated": ctx.packages.last_updated(),
        "packages": ctx.packages.snapshot(),
    }))
    .into_response()
}

async fn remove_package(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
    Query(dep): Query<DepQuery>,
) -> Response {
    let result = match dep.pin() {
        Some((dep_name, dep_version)) => {
            state
                .ctx
                .remove_package_dep(&name, &version, dep_name, dep_version)
                .await
        }
        None => state.ctx.remove_package(&name, &version).await,
    };

    match result {
        Ok(()) => Redirect::to("/packages").into_response(),
        Err(err) => internal_error(err),
    }
}

// Webhook called from other services.
async fn fire_webhook(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ctx = &state.ctx;

    info!("webhook name => {}", name);
    ctx.minilog
        .succeeded(&format!("Webhook name => {}", name))
        .await;

    let hook = match ctx.webhooks.get_by_target(&name).await {
        Ok(Some(hook)) => hook,
        Ok(None) => {
            let msg = format!("Failed to get the webhook task. {}", name);
            ctx.minilog.failed("webhook", &msg).await;
            return internal_error(msg);
        }
        Err(err) => {
            let msg = format!("Failed to get the webhook task. {}", err);
            ctx.minilog.failed("webhook", &msg).await;
            return internal_error(msg);
        }
    };

    if hook.secret.is_empty() {
        ctx.minilog.succeeded("webhook: do nothing").await;
        return StatusCode::OK.into_response();
    }

    let signature = headers
        .get("X-Hub-Signature")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    if !verify_hub_signature(&hook.secret, &body, signature) {
        warn!("webhook {}: invalid signature", name);
        ctx.minilog.failed("webhook", "Invalid signature").await;
        return internal_error("Invalid signature");
    }

    if name == CONFIGS_HOOK_TARGET {
        if let Err(err) = ctx.refresh_recipe_tree().await {
            return internal_error(err);
        }
        return StatusCode::OK.into_response();
    }

    let config = match ctx.recipes.find(&hook.proc_name, &hook.version) {
        Ok(recipe) => BuildConfig::Bare(recipe),
        Err(err) => {
            ctx.minilog.failed("webhook", &err.to_string()).await;
            return internal_error(err);
        }
    };
    ctx.queue(config).await;

    ctx.minilog.succeeded("webhook").await;
    StatusCode::OK.into_response()
}

#[derive(Debug, Deserialize)]
struct WebhookForm {
    #[serde(default)]
    target: String,
    #[serde(default)]
    secret: String,
    #[serde(default)]
    proc_name: String,
    #[serde(default)]
    version: String,
}

impl WebhookForm {
    fn validate(&self) -> Result<(), Response> {
        for (value, label) in [
            (&self.target, "target"),
            (&self.secret, "secret"),
            (&self.proc_name, "proc_name"),
            (&self.version, "version"),
        ] {
            if value.is_empty() {
                return Err(internal_error(format!("{} is empty", label)));
            }
        }
        Ok(())
    }
}

async fn list_webhooks(State(state): State<AppState>) -> Response {
    match state.ctx.webhooks.list().await {
        Ok(hooks) => Json(hooks).into_response(),
        Err(err) => internal_error(err),
    }
}

async fn append_webhook(
    State(state): State<AppState>,
    Form(form): Form<WebhookForm>,
) -> Response {
    if let Err(response) = form.validate() {
        return response;
    }

    match state
        .ctx
        .webhooks
        .append(&form.target, &form.secret, &form.proc_name, &form.version)
        .await
    {
        Ok(_) => Redirect::to("/webhooks").into_response(),
        Err(err) => internal_error(err),
    }
}

async fn update_webhook(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Form(form): Form<WebhookForm>,
) -> Response {
    if let Err(response) = form.validate() {
        return response;
    }

    match state
        .ctx
        .webhooks
        .update(id, &form.target, &form.secret, &form.proc_name, &form.version)
        .await
    {
        Ok(()) => Redirect::to("/webhooks").into_response(),
        Err(err) => internal_error(err),
    }
}

async fn delete_webhook(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.ctx.webhooks.delete(id).await {
        Ok(()) => Redirect::to("/webhooks").into_response(),
        Err(err) => internal_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct DailyTaskForm {
    #[serde(default)]
    proc_name: String,
    #[serde(default)]
    version: String,
}

impl DailyTaskForm {
    fn validate(&self) -> Result<(), Response> {
        if self.proc_name.is_empty() {
            return Err(internal_error("proc_name is empty"));
        }
        if self.version.is_empty() {
            return Err(internal_error("version is empty"));
        }
        Ok(())
    }
}

async fn list_daily_tasks(State(state): State<AppState>) -> Response {
    let ctx = &state.ctx;
    match ctx.daily_tasks.list().await {
        Ok(tasks) => Json(json!({
            "tasks": tasks,
            "point": { "hour": ctx.cron.hour, "minute": ctx.cron.minute },
        }))
        .into_response(),
        Err(err) => internal_error(err),
    }
}

async fn append_daily_task(
    State(state): State<AppState>,
    Form(form): Form<DailyTaskForm>,
) -> Response {
    if let Err(response) = form.validate() {
        return response;
    }

    match state
        .ctx
        .daily_tasks
        .append(&form.proc_name, &form.version)
        .await
    {
        Ok(_) => Redirect::to("/daily_tasks").into_response(),
        Err(err) => internal_error(err),
    }
}

async fn update_daily_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Form(form): Form<DailyTaskForm>,
) -> Response {
    if let Err(response) = form.validate() {
        return response;
    }

    match state
        .ctx
        .daily_tasks
        .update(id, &form.proc_name, &form.version)
        .await
    {
        Ok(()) => Redirect::to("/daily_tasks").into_response(),
        Err(err) => internal_error(err),
    }
}

async fn delete_daily_task(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.ctx.daily_tasks.delete(id).await {
        Ok(()) => Redirect::to("/daily_tasks").into_response(),
        Err(err) => internal_error(err),
    }
}

async fn update_proc_config_sets(State(state): State<AppState>) -> Response {
    match state.ctx.refresh_recipe_tree().await {
        Ok(()) => Redirect::to("/").into_response(),
        Err(err) => internal_error(err),
    }
}

async fn regenerate_profiles(State(state): State<AppState>) -> Response {
    match state.ctx.update_profiles_with_notification().await {
        Ok(()) => Redirect::to("/").into_response(),
        Err(err) => internal_error(err),
    }
}

async fn system_logs(State(state): State<AppState>) -> Response {
    match state.ctx.minilog.latest(50).await {
        Ok(logs) => Json(logs).into_response(),
        Err(err) => internal_error(err),
    }
}

async fn information() -> Response {
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

async fn api_profiles(State(state): State<AppState>) -> Response {
    Json(state.ctx.profiles.list()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_accepts_exact_credentials() {
        let encoded = BASE64.encode("admin:hunter2");
        assert!(check_basic_auth(
            &format!("Basic {}", encoded),
            "admin",
            "hunter2"
        ));
    }

    #[test]
    fn basic_auth_rejects_wrong_password() {
        let encoded = BASE64.encode("admin:wrong");
        assert!(!check_basic_auth(
            &format!("Basic {}", encoded),
            "admin",
            "hunter2"
        ));
    }

    #[test]
    fn basic_auth_rejects_other_schemes() {
        assert!(!check_basic_auth("Bearer token", "admin", "hunter2"));
        assert!(!check_basic_auth("garbage", "admin", "hunter2"));
    }

    #[test]
    fn basic_auth_rejects_unparseable_payloads() {
        assert!(!check_basic_auth("Basic !!!", "admin", "hunter2"));
        let encoded = BASE64.encode("no-colon");
        assert!(!check_basic_auth(
            &format!("Basic {}", encoded),
            "admin",
            "hunter2"
        ));
    }

    #[test]
    fn dep_query_requires_both_fields() {
        let query = DepQuery {
            dep_name: Some("boost".to_owned()),
            dep_version: None,
        };
        assert!(query.pin().is_none());

        let query = DepQuery {
            dep_name: Some("boost".to_owned()),
            dep_version: Some("1.66".to_owned()),
        };
        assert_eq!(query.pin(), Some(("boost", "1.66")));

        assert!(DepQuery::default().pin().is_none());
    }
}
