use std::{
    collections::{
        HashMap,
        HashSet,
    },
    sync::Arc,
    time::Duration,
};

use bollard::{
    container::ListContainersOptions,
    system::EventsOptions,
    Docker,
};
use chrono::Utc;
use config::schema::ContainerMonitorConfig;
use core_types::SourceKind;
use dispatcher::{
    DispatcherHandle,
    HandleOutcome,
};
use futures::StreamExt;
use parking_lot::Mutex;
use runtime::{
    Runtime,
    SpawnHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    container_stream::{
        ManagedStream,
        StreamItem,
    },
    self_monitor::SelfMonitor,
};

/// Containers whose stream+heartbeat pair are live. Each entry owns its own
/// child cancellation token so one container can be torn down (died,
/// excluded by name filters) without touching any other.
const SOURCE_KIND_LABEL: &str = "container";

struct MonitoredContainer {
    cancellation: CancellationToken,
    stream_handle: Box<dyn SpawnHandle>,
    heartbeat_handle: Box<dyn SpawnHandle>,
}

/// Tracks running containers via `bollard`'s event stream plus a periodic
/// reconciliation scan (events can be missed across a daemon restart), and
/// tails each matching container's combined stdout/stderr log.
///
/// Every container gets two independent tasks: a stream loop that reads log
/// chunks, and a heartbeat that polls whether the container is still alive.
/// They run on separate task handles so a stuck read never blocks detection
/// of the container exiting, and vice versa.
pub struct ContainerMonitor<RT: Runtime> {
    runtime: RT,
    config: ContainerMonitorConfig,
    dispatcher: DispatcherHandle,
    docker: Arc<Docker>,
    self_monitor: Arc<SelfMonitor>,
    cancellation: CancellationToken,
    containers: Mutex<HashMap<String, MonitoredContainer>>,
    event_loop_handle: Mutex<Option<Box<dyn SpawnHandle>>>,
    reconcile_handle: Mutex<Option<Box<dyn SpawnHandle>>>,
}

impl<RT: Runtime> ContainerMonitor<RT> {
    pub fn start(runtime: RT, config: ContainerMonitorConfig, dispatcher: DispatcherHandle, docker: Arc<Docker>) -> Arc<Self> {
        let self_monitor = Arc::new(SelfMonitor::new(Duration::from_secs(config.self_monitor_window_secs), config.self_monitor_threshold));

        let monitor = Arc::new(Self {
            runtime: runtime.clone(),
            config,
            dispatcher,
            docker,
            self_monitor,
            cancellation: CancellationToken::new(),
            containers: Mutex::new(HashMap::new()),
            event_loop_handle: Mutex::new(None),
            reconcile_handle: Mutex::new(None),
        });

        monitor.reconcile();

        let event_monitor = monitor.clone();
        let event_cancellation = monitor.cancellation.clone();
        let event_handle = runtime.spawn("container_monitor_events", async move {
            run_event_loop(event_monitor, event_cancellation).await;
        });
        *monitor.event_loop_handle.lock() = Some(event_handle);

        let reconcile_monitor = monitor.clone();
        let reconcile_cancellation = monitor.cancellation.clone();
        let reconcile_handle = runtime.spawn("container_monitor_reconcile", async move {
            loop {
                tokio::select! {
                    biased;
                    () = reconcile_cancellation.cancelled() => break,
                    () = tokio::time::sleep(Duration::from_secs(30)) => {
                        reconcile_monitor.reconcile();
                    },
                }
            }
        });
        *monitor.reconcile_handle.lock() = Some(reconcile_handle);

        monitor
    }

    /// Cancels every container's tasks and waits up to 10 seconds for them
    /// to wind down; a container stuck mid-read past that is logged and
    /// left to be reaped by process exit rather than blocking shutdown.
    pub async fn stop(&self) {
        self.cancellation.cancel();
        if let Some(mut handle) = self.event_loop_handle.lock().take() {
            handle.shutdown();
            let _ = handle.join().await;
        }
        if let Some(mut handle) = self.reconcile_handle.lock().take() {
            let _ = handle.join().await;
        }

        let containers = std::mem::take(&mut *self.containers.lock());
        for (id, container) in containers {
            container.cancellation.cancel();
            let wait = tokio::time::timeout(Duration::from_secs(10), join_pair(container));
            if wait.await.is_err() {
                tracing::warn!(container_id = %id, "container tasks did not stop within the shutdown timeout");
            }
        }
    }

    /// Number of containers currently being tailed. Used by the admin
    /// health endpoint.
    pub fn tracked_count(&self) -> usize {
        self.containers.lock().len()
    }

    /// Number of currently tracked containers the self-monitor has excluded
    /// for dominating recent traffic.
    pub fn self_excluded_count(&self) -> usize {
        self.containers.lock().keys().filter(|id| self.self_monitor.is_excluded(id)).count()
    }

    fn matches_filters(&self, name: &str) -> bool {
        let included = self.config.include.is_empty() || self.config.include.iter().any(|p| glob_matches(p, name));
        let excluded = self.config.exclude.iter().any(|p| glob_matches(p, name));
        included && !excluded
    }

    fn reconcile(self: &Arc<Self>) {
        let runtime = self.runtime.clone();
        let monitor = self.clone();
        runtime.spawn("container_monitor_reconcile_once", async move {
            monitor.reconcile_once().await;
        });
    }

    async fn reconcile_once(self: &Arc<Self>) {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let summaries = match self.docker.list_containers(Some(options)).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list containers during reconciliation");
                return;
            },
        };

        let mut live_ids = HashSet::new();
        for summary in summaries {
            let Some(id) = summary.id.clone() else { continue };
            let name = summary
                .names
                .as_ref()
                .and_then(|names| names.first())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_else(|| id.clone());
            if !self.matches_filters(&name) {
                continue;
            }
            live_ids.insert(id.clone());
            self.ensure_monitored(&id);
        }

        let stale: Vec<String> = {
            let containers = self.containers.lock();
            containers.keys().filter(|id| !live_ids.contains(*id)).cloned().collect()
        };
        for id in stale {
            self.remove_container(&id).await;
        }
    }

    fn ensure_monitored(self: &Arc<Self>, container_id: &str) {
        if self.containers.lock().contains_key(container_id) {
            return;
        }
        let child_cancellation = self.cancellation.child_token();

        let stream_runtime = self.runtime.clone();
        let stream_monitor = self.clone();
        let stream_container_id = container_id.to_string();
        let stream_cancellation = child_cancellation.clone();
        let stream_handle = self.runtime.spawn(
            "container_monitor_stream",
            run_stream_loop(stream_runtime, stream_monitor, stream_container_id, stream_cancellation),
        );

        let heartbeat_monitor = self.clone();
        let heartbeat_container_id = container_id.to_string();
        let heartbeat_cancellation = child_cancellation.clone();
        let heartbeat_handle = self.runtime.spawn(
            "container_monitor_heartbeat",
            run_heartbeat(heartbeat_monitor, heartbeat_container_id, heartbeat_cancellation),
        );

        let mut containers = self.containers.lock();
        containers.insert(
            container_id.to_string(),
            MonitoredContainer {
                cancellation: child_cancellation,
                stream_handle,
                heartbeat_handle,
            },
        );
        crate::metrics::set_containers_tracked(containers.len());
    }

    async fn remove_container(&self, container_id: &str) {
        let container = {
            let mut containers = self.containers.lock();
            let removed = containers.remove(container_id);
            crate::metrics::set_containers_tracked(containers.len());
            removed
        };
        if let Some(container) = container {
            container.cancellation.cancel();
            let _ = tokio::time::timeout(Duration::from_secs(10), join_pair(container)).await;
        }
    }
}

async fn join_pair(container: MonitoredContainer) {
    let MonitoredContainer { mut stream_handle, mut heartbeat_handle, .. } = container;
    let _ = stream_handle.join().await;
    let _ = heartbeat_handle.join().await;
}

fn glob_matches(pattern: &str, name: &str) -> bool {
    glob::Pattern::new(pattern).map(|p| p.matches(name)).unwrap_or(false)
}

async fn run_event_loop<RT: Runtime>(monitor: Arc<ContainerMonitor<RT>>, cancellation: CancellationToken) {
    let options = EventsOptions::<String> {
        filters: HashMap::from([("type".to_string(), vec!["container".to_string()])]),
        ..Default::default()
    };
    let mut events = monitor.docker.events(Some(options));

    loop {
        tokio::select! {
            biased;
            () = cancellation.cancelled() => return,
            event = events.next() => {
                match event {
                    None => {
                        tracing::warn!("container event stream ended, relying on periodic reconciliation");
                        return;
                    },
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "error reading container event stream");
                    },
                    Some(Ok(_)) => {
                        // Any container lifecycle event is a cue to re-scan rather than
                        // hand-parsing action strings; list_containers is the source of truth.
                        monitor.reconcile();
                    },
                }
            },
        }
    }
}

async fn run_heartbeat<RT: Runtime>(monitor: Arc<ContainerMonitor<RT>>, container_id: String, cancellation: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            () = cancellation.cancelled() => return,
            () = tokio::time::sleep(Duration::from_secs(10)) => {},
        }
        match monitor.docker.inspect_container(&container_id, None).await {
            Ok(inspect) => {
                let running = inspect.state.and_then(|s| s.running).unwrap_or(false);
                if !running {
                    monitor.remove_container(&container_id).await;
                    return;
                }
            },
            Err(_) => {
                monitor.remove_container(&container_id).await;
                return;
            },
        }
    }
}

async fn run_stream_loop<RT: Runtime>(runtime: RT, monitor: Arc<ContainerMonitor<RT>>, container_id: String, cancellation: CancellationToken) {
    let rotation_interval = Duration::from_secs(monitor.config.stream_rotation_interval_secs.min(300));
    let read_deadline = monitor.config.read_deadline();

    'rotation: loop {
        if cancellation.is_cancelled() {
            return;
        }
        let mut stream = ManagedStream::open(&monitor.docker, &container_id, read_deadline);
        let deadline = runtime.wait(rotation_interval);
        tokio::pin!(deadline);
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            tokio::select! {
                biased;
                () = cancellation.cancelled() => return,
                () = &mut deadline => continue 'rotation,
                item = stream.next() => {
                    match item {
                        None => continue 'rotation,
                        Some(Err(e)) => {
                            tracing::warn!(container_id = %container_id, error = %e, "container log stream error, reconnecting");
                            continue 'rotation;
                        },
                        Some(Ok(StreamItem::Timeout)) => continue,
                        Some(Ok(StreamItem::Chunk(bytes))) => {
                            buffer.extend_from_slice(&bytes);
                            emit_complete_lines(&monitor, &container_id, &mut buffer);
                        },
                    }
                },
            }
        }
    }
}

fn emit_complete_lines<RT: Runtime>(monitor: &Arc<ContainerMonitor<RT>>, container_id: &str, buffer: &mut Vec<u8>) {
    loop {
        let Some(newline_pos) = buffer.iter().position(|b| *b == b'\n') else { break };
        let mut line: Vec<u8> = buffer.drain(..=newline_pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        monitor.self_monitor.record_emitted(container_id);
        if monitor.self_monitor.is_excluded(container_id) {
            tracing::debug!(container_id = %container_id, "container excluded by self-monitor, dropping line");
            continue;
        }

        crate::metrics::record_read(SOURCE_KIND_LABEL);
        let now = Utc::now();
        let outcome = monitor.dispatcher.handle(SourceKind::Container, container_id, line, HashMap::new(), now, now);
        if matches!(outcome, HandleOutcome::Full) {
            tracing::debug!(container_id = %container_id, "dispatcher at capacity, dropping container log line");
        }
    }
}
