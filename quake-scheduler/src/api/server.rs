//! API server setup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use super::routes;
use crate::metrics::PrometheusExporter;
use crate::scheduler::Scheduler;
use crate::{Error, Result};

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    /// Server start time for uptime calculation
    pub start_time: Instant,
    pub scheduler: Arc<Scheduler>,
    pub exporter: Arc<PrometheusExporter>,
}

impl ApiState {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        let exporter = Arc::new(PrometheusExporter::new(scheduler.metrics().clone()));
        Self {
            start_time: Instant::now(),
            scheduler,
            exporter,
        }
    }
}

pub fn build_router(state: ApiState) -> Router {
    routes::router()
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind the observer's listener. A failure here is a startup error.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::config(format!("cannot bind http address {addr}: {e}")))?;
    tracing::info!("HTTP observer listening on http://{}", listener.local_addr()?);
    Ok(listener)
}

/// Serve on a bound listener until `cancel` fires.
pub async fn serve(listener: TcpListener, state: ApiState, cancel: CancellationToken) -> Result<()> {
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            tracing::info!("HTTP observer shutting down");
        })
        .await
        .map_err(|e| Error::Other(format!("http server error: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ScheduleConfig;
    use crate::executor::Execution;
    use crate::task::{FnRunner, TaskError, TaskOutput, TaskSpec};
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    fn scheduler(max_executions: u64) -> Arc<Scheduler> {
        let config = ScheduleConfig {
            interval: Duration::from_secs(5),
            max_executions: Some(max_executions),
            ..Default::default()
        };
        let runner = Arc::new(FnRunner::new(|_spec: TaskSpec| async {
            Ok::<_, TaskError>(TaskOutput::with_items(4))
        }));
        Arc::new(
            Scheduler::builder(config, runner)
                .clock(ManualClock::shared())
                .build()
                .unwrap(),
        )
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_status_and_readiness_before_start() {
        let router = build_router(ApiState::new(scheduler(1)));

        let (code, body) = get(router.clone(), "/status").await;
        assert_eq!(code, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["state"], "idle");
        assert_eq!(json["executions"], 0);

        let (code, _) = get(router.clone(), "/health/ready").await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);

        let (code, body) = get(router, "/health/live").await;
        assert_eq!(code, StatusCode::OK);
        assert!(String::from_utf8_lossy(&body).contains("alive"));
    }

    #[tokio::test]
    async fn test_executions_and_metrics_after_run() {
        let scheduler = scheduler(3);
        scheduler
            .start(TaskSpec::new("fetch-usgs", ["--min-magnitude", "2.5"]))
            .await
            .unwrap();
        let router = build_router(ApiState::new(scheduler));

        let (code, body) = get(router.clone(), "/executions?limit=2").await;
        assert_eq!(code, StatusCode::OK);
        let executions: Vec<Execution> = serde_json::from_slice(&body).unwrap();
        let sequences: Vec<_> = executions.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![2, 3]);

        let (code, body) = get(router.clone(), "/metrics").await;
        assert_eq!(code, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("quake_scheduler_executions_total 3"));
        assert!(text.contains("quake_scheduler_items_produced_total 12"));

        let (code, body) = get(router, "/health").await;
        assert_eq!(code, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["components"]["scheduler"].is_object());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_a_config_error() {
        let taken = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = taken.local_addr().unwrap();

        let err = bind(addr).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(err.exit_code(), 78);
    }

    #[tokio::test]
    async fn test_serve_stops_on_cancel() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(
            listener,
            ApiState::new(scheduler(1)),
            cancel.clone(),
        ));

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
