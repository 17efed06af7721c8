use crate::config::WardenConfig;

#[cfg(feature = "serve")]
use crate::{data_dir::DataDir, pidfile::PidFile, status::WorkerStatus};

#[cfg(feature = "serve")]
#[derive(Clone)]
struct AppState {
    pid_file: PidFile,
    started_at: chrono::DateTime<chrono::Local>,
    started: std::time::Instant,
}

#[cfg(feature = "serve")]
fn router(state: AppState) -> axum::Router {
    use axum::{routing::get, Router};
    use tower_http::cors::CorsLayer;

    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/uptime", get(uptime))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Serve health and status endpoints until the process is killed.
///
/// Read-only: the server never touches the pid marker, so it can run next
/// to a `warden monitor` without disturbing it.
#[cfg(feature = "serve")]
pub async fn run(config: &WardenConfig) -> Result<(), Box<dyn std::error::Error>> {
    let dd = DataDir::new(&config.storage.data_dir);
    let state = AppState {
        pid_file: PidFile::new(dd.pid_file()),
        started_at: chrono::Local::now(),
        started: std::time::Instant::now(),
    };

    let addr = format!("{}:{}", config.serve.bind, config.serve.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!("serve listening on {local_addr}");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(not(feature = "serve"))]
pub async fn run(_config: &WardenConfig) -> Result<(), Box<dyn std::error::Error>> {
    Err("warden was built without the `serve` feature".into())
}

#[cfg(feature = "serve")]
async fn health(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "service": "warden",
        "timestamp": chrono::Local::now().to_rfc3339(),
        "uptime_seconds": state.started.elapsed().as_secs_f64(),
    }))
}

#[cfg(feature = "serve")]
async fn status(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::Json<WorkerStatus> {
    let pid_file = state.pid_file.clone();
    // `ps` and the marker read are blocking
    let status = tokio::task::spawn_blocking(move || WorkerStatus::probe(&pid_file))
        .await
        .unwrap_or_else(|_| WorkerStatus::for_pid(None));
    axum::Json(status)
}

#[cfg(feature = "serve")]
async fn uptime(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::Json<serde_json::Value> {
    let secs = state.started.elapsed().as_secs();
    axum::Json(serde_json::json!({
        "start_time": state.started_at.to_rfc3339(),
        "uptime_seconds": secs,
        "uptime_formatted": crate::status::format_duration(secs),
    }))
}

#[cfg(all(test, feature = "serve"))]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn state(dir: &std::path::Path) -> AppState {
        AppState {
            pid_file: PidFile::new(dir.join("worker.pid")),
            started_at: chrono::Local::now(),
            started: std::time::Instant::now(),
        }
    }

    async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        for uri in ["/", "/health"] {
            let (code, body) = get_json(router(state(dir.path())), uri).await;
            assert_eq!(code, StatusCode::OK);
            assert_eq!(body["status"], "healthy");
            assert!(body["uptime_seconds"].is_number());
        }
    }

    #[tokio::test]
    async fn test_status_without_worker() {
        let dir = tempfile::tempdir().unwrap();
        let (code, body) = get_json(router(state(dir.path())), "/status").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["running"], false);
        assert!(body["pid"].is_null());
    }

    #[tokio::test]
    async fn test_status_with_live_pid() {
        let dir = tempfile::tempdir().unwrap();
        let st = state(dir.path());
        st.pid_file.write(std::process::id()).unwrap();

        let (_, body) = get_json(router(st), "/status").await;
        assert_eq!(body["running"], true);
        assert_eq!(body["pid"], std::process::id());
    }

    #[tokio::test]
    async fn test_uptime() {
        let dir = tempfile::tempdir().unwrap();
        let (code, body) = get_json(router(state(dir.path())), "/uptime").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["uptime_formatted"], "0s");
        assert!(body["start_time"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let response = router(state(dir.path()))
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
