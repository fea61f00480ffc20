use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::Arc,
};

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json,
    Router,
};
use config::schema::BackpressureConfig;
use dispatcher::DispatcherHandle;
use runtime::Runtime;
use serde::Serialize;
use sources::{
    ContainerMonitor,
    FileMonitor,
};

struct AdminState<RT: Runtime> {
    dispatcher: DispatcherHandle,
    file_monitor: Option<Arc<FileMonitor<RT>>>,
    container_monitor: Option<Arc<ContainerMonitor<RT>>>,
    dlq_stores: Vec<(String, Arc<dlq::FileDlqStore>)>,
    backpressure: BackpressureConfig,
}

#[derive(Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Status {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Serialize)]
struct HealthResponse {
    status: Status,
    components: Components,
    queue_utilization: f64,
    dlq_depth: u64,
    open_fds: Option<u64>,
}

#[derive(Serialize)]
struct Components {
    dispatcher: ComponentStatus,
    file_monitor: Option<FileMonitorStatus>,
    container_monitor: Option<ContainerMonitorStatus>,
    sinks: BTreeMap<String, SinkStatus>,
}

#[derive(Serialize)]
struct ComponentStatus {
    status: Status,
    queue_depth: usize,
    queue_capacity: usize,
}

#[derive(Serialize)]
struct FileMonitorStatus {
    status: Status,
    tracked_files: usize,
}

#[derive(Serialize)]
struct ContainerMonitorStatus {
    status: Status,
    tracked_containers: usize,
    self_excluded: usize,
}

#[derive(Serialize)]
struct SinkStatus {
    status: Status,
    circuit_open: bool,
}

/// Serves `/health` (the JSON status contract below) and `/metrics`
/// (Prometheus text exposition). Binds in the background; callers hold the
/// returned handle only to decide when to stop waiting on it, since there's
/// nothing to gracefully drain here.
///
/// `/health` status is `healthy` when every enabled component reports
/// healthy, `degraded` when a sink's circuit is open or queue utilization
/// has crossed the soft backpressure threshold, and `unhealthy` when the
/// dispatcher has crossed the hard threshold and can no longer accept
/// records.
pub async fn serve<RT: Runtime>(
    bind_addr: SocketAddr,
    dispatcher: DispatcherHandle,
    file_monitor: Option<Arc<FileMonitor<RT>>>,
    container_monitor: Option<Arc<ContainerMonitor<RT>>>,
    dlq_stores: Vec<(String, Arc<dlq::FileDlqStore>)>,
    backpressure: BackpressureConfig,
) -> anyhow::Result<()> {
    let state = Arc::new(AdminState {
        dispatcher,
        file_monitor,
        container_monitor,
        dlq_stores,
        backpressure,
    });
    let app = Router::new()
        .route("/health", get(health::<RT>))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "admin server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health<RT: Runtime>(State(state): State<Arc<AdminState<RT>>>) -> impl IntoResponse {
    let queue_depth = state.dispatcher.queue_depth();
    let queue_capacity = state.dispatcher.queue_capacity().max(1);
    let queue_utilization = queue_depth as f64 / queue_capacity as f64;

    let dispatcher_status = if queue_utilization >= state.backpressure.hard {
        Status::Unhealthy
    } else if queue_utilization >= state.backpressure.soft {
        Status::Degraded
    } else {
        Status::Healthy
    };

    let sinks: BTreeMap<String, SinkStatus> = state
        .dispatcher
        .sinks()
        .into_iter()
        .map(|(name, sink)| {
            let healthy = sink.healthy();
            (
                name,
                SinkStatus {
                    status: if healthy { Status::Healthy } else { Status::Degraded },
                    circuit_open: !healthy,
                },
            )
        })
        .collect();

    let file_monitor = state.file_monitor.as_ref().map(|m| FileMonitorStatus {
        status: Status::Healthy,
        tracked_files: m.tracked_count(),
    });
    let container_monitor = state.container_monitor.as_ref().map(|m| ContainerMonitorStatus {
        status: Status::Healthy,
        tracked_containers: m.tracked_count(),
        self_excluded: m.self_excluded_count(),
    });

    let overall = if dispatcher_status == Status::Unhealthy {
        Status::Unhealthy
    } else if dispatcher_status == Status::Degraded || sinks.values().any(|s| s.status != Status::Healthy) {
        Status::Degraded
    } else {
        Status::Healthy
    };

    let dlq_depth = state.dlq_stores.iter().filter_map(|(_, store)| store.depth().ok()).sum();

    let response = HealthResponse {
        status: overall,
        components: Components {
            dispatcher: ComponentStatus {
                status: dispatcher_status,
                queue_depth,
                queue_capacity,
            },
            file_monitor,
            container_monitor,
            sinks,
        },
        queue_utilization,
        dlq_depth,
        open_fds: open_fd_count(),
    };

    let http_status = if overall == Status::Unhealthy { StatusCode::SERVICE_UNAVAILABLE } else { StatusCode::OK };
    (http_status, Json(response))
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::gather() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("failed to gather metrics: {e}")),
    }
}

#[cfg(target_os = "linux")]
fn open_fd_count() -> Option<u64> {
    std::fs::read_dir("/proc/self/fd").ok().map(|entries| entries.count() as u64)
}

#[cfg(not(target_os = "linux"))]
fn open_fd_count() -> Option<u64> {
    None
}
