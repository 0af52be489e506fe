//! Live view multiplexer
//!
//! Fans out process lifecycle and output events to every websocket client
//! watching a workspace's process list. There is no push channel from the
//! launcher into this process: a background tick reconciles against the
//! filesystem the same way the supervisor does, and only the *delta* since
//! the last tick is broadcast. A slow viewer never blocks this loop — its
//! outbound queue is bounded and frames are dropped, not buffered, when full.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::warn;

use crate::process::dir::ProcessInfo;
use crate::supervisor::Supervisor;

const TICK_INTERVAL: Duration = Duration::from_secs(2);
const OUTPUT_RATE_LIMIT: Duration = Duration::from_millis(500);
const CLIENT_QUEUE_CAPACITY: usize = 100;

/// Wire format for the process-updates websocket: `{"type": "...", "data":
/// ...}`, with `type` one of the five variants below, matching exactly.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ProcessEvent {
    /// Sent once per currently-running process immediately on connect.
    ReconcileRunning { process: ProcessInfo },
    /// Sent once, after every `ReconcileRunning`, to end the initial burst.
    ReconcileDone,
    ProcessStarted { process: ProcessInfo },
    ProcessOutput { process_id: String, stdout_tail: String },
    ProcessFinished { process: ProcessInfo },
}

struct ViewerClient {
    id: u64,
    workspace_id: String,
    sender: mpsc::Sender<ProcessEvent>,
}

/// Tracks one multiplexer instance per running server. Cheap to clone: the
/// shared state lives behind `Arc`s internally.
#[derive(Clone)]
pub struct LiveViewMultiplexer {
    inner: Arc<Inner>,
}

struct Inner {
    supervisor: Supervisor,
    clients: DashMap<u64, ViewerClient>,
    next_client_id: std::sync::atomic::AtomicU64,
    known: DashMap<String, KnownProcess>,
    output_rate_limiter: DashMap<String, Instant>,
    emitted_stdout_len: DashMap<String, usize>,
}

#[derive(Clone)]
struct KnownProcess {
    completed: bool,
}

impl LiveViewMultiplexer {
    pub fn new(supervisor: Supervisor) -> Self {
        Self {
            inner: Arc::new(Inner {
                supervisor,
                clients: DashMap::new(),
                next_client_id: std::sync::atomic::AtomicU64::new(1),
                known: DashMap::new(),
                output_rate_limiter: DashMap::new(),
                emitted_stdout_len: DashMap::new(),
            }),
        }
    }

    /// Register a new viewer and immediately reconcile it: one
    /// `ReconcileRunning` per process currently running in the workspace,
    /// followed by a single `ReconcileDone` sentinel.
    pub fn subscribe(&self, workspace_id: &str) -> (u64, mpsc::Receiver<ProcessEvent>) {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        let id = self
            .inner
            .next_client_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        self.inner.clients.insert(
            id,
            ViewerClient {
                id,
                workspace_id: workspace_id.to_string(),
                sender: tx.clone(),
            },
        );

        if let Ok(processes) = self.inner.supervisor.list_processes(workspace_id) {
            for process in processes {
                if !process.completed {
                    let _ = tx.try_send(ProcessEvent::ReconcileRunning { process });
                }
            }
        }
        let _ = tx.try_send(ProcessEvent::ReconcileDone);

        (id, rx)
    }

    pub fn unsubscribe(&self, client_id: u64) {
        self.inner.clients.remove(&client_id);
    }

    /// Run forever, ticking every [`TICK_INTERVAL`]. Intended to be spawned
    /// once per server lifetime via `tokio::spawn`.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            interval.tick().await;
            self.tick();
        }
    }

    fn tick(&self) {
        let Ok(workspaces) = self.inner.supervisor.workspaces().list() else {
            return;
        };

        for workspace in workspaces {
            let Ok(processes) = self.inner.supervisor.list_processes(&workspace.id) else {
                continue;
            };

            for process in processes {
                self.reconcile_process(&workspace.id, process);
            }
        }

        self.gc_output_rate_limiter();
    }

    fn reconcile_process(&self, workspace_id: &str, process: ProcessInfo) {
        let previously_known = self.inner.known.get(&process.id).map(|k| k.completed);

        match previously_known {
            None => {
                self.broadcast(workspace_id, ProcessEvent::ProcessStarted { process: process.clone() });
                self.inner.known.insert(
                    process.id.clone(),
                    KnownProcess {
                        completed: process.completed,
                    },
                );
            }
            Some(false) if process.completed => {
                self.broadcast(workspace_id, ProcessEvent::ProcessFinished { process: process.clone() });
                self.inner.known.insert(process.id.clone(), KnownProcess { completed: true });
            }
            _ => {}
        }

        if !process.completed && self.should_emit_output(&process.id) {
            self.emit_new_stdout(workspace_id, &process.id);
        }
    }

    /// Broadcast only the stdout bytes produced since the last emission for
    /// this process, so repeated ticks don't resend the same output. Tracked
    /// against the log's *total* length, not a windowed read, so a process
    /// whose stdout grows past the per-tick cap keeps emitting new output
    /// instead of appearing to go silent once the cap is reached.
    fn emit_new_stdout(&self, workspace_id: &str, process_id: &str) {
        const MAX_NEW_BYTES_PER_TICK: usize = 64 * 1024;
        let already_emitted = self
            .inner
            .emitted_stdout_len
            .get(process_id)
            .map(|v| *v)
            .unwrap_or(0);

        let Ok((new_bytes, total)) = self.inner.supervisor.read_stdout_since(
            workspace_id,
            process_id,
            already_emitted,
            MAX_NEW_BYTES_PER_TICK,
        ) else {
            return;
        };

        if new_bytes.is_empty() {
            return;
        }

        self.inner.emitted_stdout_len.insert(process_id.to_string(), total);

        self.broadcast(
            workspace_id,
            ProcessEvent::ProcessOutput {
                process_id: process_id.to_string(),
                stdout_tail: String::from_utf8_lossy(&new_bytes).into_owned(),
            },
        );
    }

    fn should_emit_output(&self, process_id: &str) -> bool {
        let now = Instant::now();
        let mut entry = self
            .inner
            .output_rate_limiter
            .entry(process_id.to_string())
            .or_insert(now - OUTPUT_RATE_LIMIT);
        if now.duration_since(*entry) >= OUTPUT_RATE_LIMIT {
            *entry = now;
            true
        } else {
            false
        }
    }

    fn gc_output_rate_limiter(&self) {
        let known_ids: std::collections::HashSet<String> =
            self.inner.known.iter().map(|e| e.key().clone()).collect();
        self.inner
            .output_rate_limiter
            .retain(|id, _| known_ids.contains(id));
        self.inner
            .emitted_stdout_len
            .retain(|id, _| known_ids.contains(id));
    }

    fn broadcast(&self, workspace_id: &str, event: ProcessEvent) {
        for client in self.inner.clients.iter() {
            if client.workspace_id != workspace_id {
                continue;
            }
            if client.sender.try_send(event.clone()).is_err() {
                warn!(client_id = client.id, "dropping live-view frame for slow client");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::WorkspaceRegistry;
    use tempfile::TempDir;

    #[tokio::test]
    async fn subscribe_with_no_running_processes_sends_only_reconcile_done() {
        let dir = TempDir::new().unwrap();
        let registry = WorkspaceRegistry::new(dir.path());
        let workspace = registry
            .create("ws", dir.path().to_path_buf(), None, None)
            .unwrap();
        let supervisor = Supervisor::new(registry);
        let mux = LiveViewMultiplexer::new(supervisor);

        let (_id, mut rx) = mux.subscribe(&workspace.id);
        assert!(matches!(rx.try_recv().unwrap(), ProcessEvent::ReconcileDone));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscribe_reconciles_a_running_process_before_reconcile_done() {
        let dir = TempDir::new().unwrap();
        let registry = WorkspaceRegistry::new(dir.path());
        let workspace = registry
            .create("ws", dir.path().to_path_buf(), None, None)
            .unwrap();

        let pd = crate::process::dir::ProcessDir::new(registry.workspace_dir(&workspace.id), &workspace.id, "proc1");
        pd.create("sleep 100").unwrap();
        pd.write_pid(std::process::id()).unwrap();

        let supervisor = Supervisor::new(registry);
        let mux = LiveViewMultiplexer::new(supervisor);

        let (_id, mut rx) = mux.subscribe(&workspace.id);
        match rx.try_recv().unwrap() {
            ProcessEvent::ReconcileRunning { process } => assert_eq!(process.id, "proc1"),
            other => panic!("expected ReconcileRunning, got {other:?}"),
        }
        assert!(matches!(rx.try_recv().unwrap(), ProcessEvent::ReconcileDone));
    }

    #[test]
    fn output_rate_limiter_allows_first_emission_immediately() {
        let dir = TempDir::new().unwrap();
        let registry = WorkspaceRegistry::new(dir.path());
        let supervisor = Supervisor::new(registry);
        let mux = LiveViewMultiplexer::new(supervisor);

        assert!(mux.should_emit_output("proc1"));
        assert!(!mux.should_emit_output("proc1"));
    }

    /// A process whose stdout has already grown past the per-tick cap must
    /// keep emitting subsequent output rather than appearing to stall: the
    /// "have I seen this before" comparison is against the log's total
    /// length, not the length of a single capped read.
    #[tokio::test]
    async fn emits_new_output_even_after_stdout_exceeds_the_per_tick_cap() {
        use crate::process::log::{LogWriter, Stream};

        let dir = TempDir::new().unwrap();
        let registry = WorkspaceRegistry::new(dir.path());
        let workspace = registry.create("ws", dir.path().to_path_buf(), None, None).unwrap();

        let pd = crate::process::dir::ProcessDir::new(registry.workspace_dir(&workspace.id), &workspace.id, "proc1");
        pd.create("yes").unwrap();
        pd.write_pid(std::process::id()).unwrap();

        {
            let mut writer = LogWriter::open(pd.output_log_path()).unwrap();
            // Comfortably larger than the 64KiB per-tick cap.
            let chunk = vec![b'a'; 80 * 1024];
            writer.append(Stream::Stdout, &chunk).unwrap();
            writer.flush().unwrap();
        }

        let supervisor = Supervisor::new(registry);
        let mux = LiveViewMultiplexer::new(supervisor);

        mux.emit_new_stdout(&workspace.id, "proc1");
        let first_total = *mux.inner.emitted_stdout_len.get("proc1").unwrap();
        assert_eq!(first_total, 80 * 1024, "recorded length must be the full log, not the capped read");

        {
            let mut writer = LogWriter::open(pd.output_log_path()).unwrap();
            writer.append(Stream::Stdout, b"more-output").unwrap();
            writer.flush().unwrap();
        }

        let (_id, mut rx) = mux.subscribe(&workspace.id);
        // Drain the reconcile burst (ReconcileRunning for the still-running
        // process, then ReconcileDone) before looking for the output frame.
        while !matches!(rx.try_recv(), Ok(ProcessEvent::ReconcileDone)) {}

        mux.emit_new_stdout(&workspace.id, "proc1");
        match rx.try_recv() {
            Ok(ProcessEvent::ProcessOutput { stdout_tail, .. }) => {
                assert_eq!(stdout_tail, "more-output");
            }
            other => panic!("expected ProcessOutput with the newly appended bytes, got {other:?}"),
        }
    }
}
