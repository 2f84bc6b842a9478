//! Worker supervisor backed by local OS processes.

use crate::worker::{AgentConfig, SupervisorEvent, WorkerHandle, WorkerSupervisor};
use async_trait::async_trait;
use overseer_core::{OverseerError, OverseerResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct RunningChild {
    kill: oneshot::Sender<()>,
    reaped: oneshot::Receiver<()>,
}

struct WorkerSlot {
    config: AgentConfig,
    workdir: PathBuf,
    /// Bumped on every launch. A reaper whose launch is no longer current stays quiet.
    launch: u64,
    child: Option<RunningChild>,
}

impl WorkerSlot {
    fn is_running(&self) -> bool {
        self.child.as_ref().is_some_and(|c| !c.kill.is_closed())
    }
}

type Workers = Arc<Mutex<HashMap<Uuid, WorkerSlot>>>;

/// Launches each agent as `command args... --agent-id <id> --server-url <url>`
/// inside `<workdir_root>/<agent_id>`.
///
/// Output lines are forwarded to `tracing`. Stop and terminate both kill the
/// child; the exit is reported once the process has been reaped. Starting an
/// agent whose previous process is still alive kills and reaps that process
/// first, and its exit is not reported.
pub struct ProcessSupervisor {
    server_url: String,
    workdir_root: PathBuf,
    workers: Workers,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl ProcessSupervisor {
    /// Create a supervisor and the event stream the engine should pump.
    pub fn new(
        server_url: impl Into<String>,
        workdir_root: impl Into<PathBuf>,
    ) -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            server_url: server_url.into(),
            workdir_root: workdir_root.into(),
            workers: Arc::new(Mutex::new(HashMap::new())),
            events,
        };
        (supervisor, rx)
    }

    /// Whether a worker process is alive for `agent_id`.
    pub fn is_running(&self, agent_id: Uuid) -> bool {
        self.workers
            .lock()
            .get(&agent_id)
            .is_some_and(WorkerSlot::is_running)
    }

    /// Number of agents this supervisor holds a prepared worker for.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    fn report_exit(&self, agent_id: Uuid, normal: bool) {
        let _ = self.events.send(SupervisorEvent::Exited { agent_id, normal });
    }

    /// Kill the child if one is running. Returns false when there was none.
    fn kill(&self, agent_id: Uuid) -> bool {
        let child = self
            .workers
            .lock()
            .get_mut(&agent_id)
            .and_then(|slot| slot.child.take());
        match child {
            Some(child) => child.kill.send(()).is_ok(),
            None => false,
        }
    }
}

fn forward_lines<R>(agent_id: Uuid, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match stream {
                    "stderr" => warn!(agent_id = %agent_id, stream, "{line}"),
                    _ => info!(agent_id = %agent_id, stream, "{line}"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(agent_id = %agent_id, stream, error = %e, "Worker output unreadable");
                    break;
                }
            }
        }
    });
}

#[async_trait]
impl WorkerSupervisor for ProcessSupervisor {
    async fn spawn(&self, agent_id: Uuid, config: &AgentConfig) -> OverseerResult<WorkerHandle> {
        let workdir = self.workdir_root.join(agent_id.to_string());
        tokio::fs::create_dir_all(&workdir).await.map_err(|e| {
            OverseerError::Worker(format!(
                "Failed to create worker directory '{}': {e}",
                workdir.display()
            ))
        })?;
        self.workers.lock().insert(
            agent_id,
            WorkerSlot {
                config: config.clone(),
                workdir,
                launch: 0,
                child: None,
            },
        );
        info!(agent_id = %agent_id, config = %config.name, "Worker prepared");
        Ok(WorkerHandle { agent_id })
    }

    async fn signal_start(&self, handle: &WorkerHandle) -> OverseerResult<()> {
        let agent_id = handle.agent_id;
        let (config, workdir, launch, previous) = {
            let mut workers = self.workers.lock();
            let slot = workers
                .get_mut(&agent_id)
                .ok_or_else(|| OverseerError::Worker(format!("no worker prepared for {agent_id}")))?;
            let previous = slot.child.take().filter(|c| !c.kill.is_closed());
            slot.launch += 1;
            (slot.config.clone(), slot.workdir.clone(), slot.launch, previous)
        };

        if let Some(previous) = previous {
            warn!(agent_id = %agent_id, "Replacing a worker that is still running");
            let _ = previous.kill.send(());
            let _ = previous.reaped.await;
        }

        let mut child = Command::new(&config.command)
            .args(&config.args)
            .arg("--agent-id")
            .arg(agent_id.to_string())
            .arg("--server-url")
            .arg(&self.server_url)
            .envs(&config.env)
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                OverseerError::Worker(format!("Failed to launch '{}': {e}", config.command))
            })?;

        let (kill_tx, kill_rx) = oneshot::channel();
        let (reaped_tx, reaped_rx) = oneshot::channel();
        {
            let mut workers = self.workers.lock();
            match workers.get_mut(&agent_id) {
                Some(slot) if slot.launch == launch => {
                    slot.child = Some(RunningChild {
                        kill: kill_tx,
                        reaped: reaped_rx,
                    });
                }
                // Released or relaunched meanwhile; dropping the child kills it.
                _ => {
                    return Err(OverseerError::Worker(format!(
                        "launch of worker for {agent_id} was superseded"
                    )))
                }
            }
        }

        if let Some(stdout) = child.stdout.take() {
            forward_lines(agent_id, "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(agent_id, "stderr", stderr);
        }
        info!(agent_id = %agent_id, pid = child.id(), command = %config.command, "Worker launched");

        let workers = Arc::clone(&self.workers);
        let events = self.events.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(agent_id = %agent_id, error = %e, "Failed to kill worker");
                    }
                    child.wait().await
                }
            };
            let normal = match &status {
                Ok(status) => status.success(),
                Err(e) => {
                    error!(agent_id = %agent_id, error = %e, "Failed to reap worker");
                    false
                }
            };
            let superseded = workers
                .lock()
                .get(&agent_id)
                .is_some_and(|slot| slot.launch != launch);
            let _ = reaped_tx.send(());
            if superseded {
                debug!(agent_id = %agent_id, normal, "Replaced worker reaped");
                return;
            }
            info!(agent_id = %agent_id, normal, "Worker exited");
            let _ = events.send(SupervisorEvent::Exited { agent_id, normal });
        });
        Ok(())
    }

    async fn signal_stop(&self, handle: &WorkerHandle) -> OverseerResult<()> {
        if !self.kill(handle.agent_id) {
            self.report_exit(handle.agent_id, true);
        }
        Ok(())
    }

    async fn signal_terminate(&self, handle: &WorkerHandle) -> OverseerResult<()> {
        if !self.kill(handle.agent_id) {
            self.report_exit(handle.agent_id, true);
        }
        self.workers.lock().remove(&handle.agent_id);
        Ok(())
    }

    async fn release(&self, handle: &WorkerHandle) -> OverseerResult<()> {
        let slot = self.workers.lock().remove(&handle.agent_id);
        if let Some(child) = slot.and_then(|slot| slot.child) {
            let _ = child.kill.send(());
        }
        debug!(agent_id = %handle.agent_id, "Worker released");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn config(command: &str, args: &[&str]) -> AgentConfig {
        AgentConfig {
            name: "test".into(),
            command: command.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: BTreeMap::new(),
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SupervisorEvent>) -> SupervisorEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for supervisor event")
            .expect("event stream closed")
    }

    #[tokio::test]
    async fn test_spawn_creates_workdir() {
        let tmp = tempfile::tempdir().unwrap();
        let (supervisor, _rx) = ProcessSupervisor::new("ws://localhost:1", tmp.path());
        let agent_id = Uuid::new_v4();
        let handle = supervisor
            .spawn(agent_id, &config("true", &[]))
            .await
            .unwrap();
        assert_eq!(handle.agent_id, agent_id);
        assert!(tmp.path().join(agent_id.to_string()).is_dir());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_status_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let (supervisor, mut rx) = ProcessSupervisor::new("ws://localhost:1", tmp.path());

        let ok = Uuid::new_v4();
        let handle = supervisor.spawn(ok, &config("sh", &["-c", "exit 0", "sh"])).await.unwrap();
        supervisor.signal_start(&handle).await.unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            SupervisorEvent::Exited {
                agent_id: ok,
                normal: true
            }
        );

        let bad = Uuid::new_v4();
        let handle = supervisor.spawn(bad, &config("sh", &["-c", "exit 3", "sh"])).await.unwrap();
        supervisor.signal_start(&handle).await.unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            SupervisorEvent::Exited {
                agent_id: bad,
                normal: false
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_kills_running_worker() {
        let tmp = tempfile::tempdir().unwrap();
        let (supervisor, mut rx) = ProcessSupervisor::new("ws://localhost:1", tmp.path());
        let agent_id = Uuid::new_v4();
        let handle = supervisor
            .spawn(agent_id, &config("sh", &["-c", "exec sleep 30", "sh"]))
            .await
            .unwrap();
        supervisor.signal_start(&handle).await.unwrap();
        assert!(supervisor.is_running(agent_id));

        supervisor.signal_terminate(&handle).await.unwrap();
        match next_event(&mut rx).await {
            SupervisorEvent::Exited { agent_id: id, .. } => assert_eq!(id, agent_id),
        }
        assert_eq!(supervisor.worker_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_replaces_live_worker_quietly() {
        let tmp = tempfile::tempdir().unwrap();
        let (supervisor, mut rx) = ProcessSupervisor::new("ws://localhost:1", tmp.path());
        let agent_id = Uuid::new_v4();
        let handle = supervisor
            .spawn(agent_id, &config("sh", &["-c", "exec sleep 30", "sh"]))
            .await
            .unwrap();
        supervisor.signal_start(&handle).await.unwrap();
        supervisor.signal_start(&handle).await.unwrap();
        assert!(supervisor.is_running(agent_id));

        // The replaced process is reaped without an exit report.
        let quiet = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(quiet.is_err(), "unexpected event: {quiet:?}");

        supervisor.signal_stop(&handle).await.unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            SupervisorEvent::Exited {
                agent_id,
                normal: false
            }
        );
        assert!(!supervisor.is_running(agent_id));
    }

    #[tokio::test]
    async fn test_release_forgets_worker() {
        let tmp = tempfile::tempdir().unwrap();
        let (supervisor, _rx) = ProcessSupervisor::new("ws://localhost:1", tmp.path());
        let handle = supervisor
            .spawn(Uuid::new_v4(), &config("true", &[]))
            .await
            .unwrap();
        assert_eq!(supervisor.worker_count(), 1);
        supervisor.release(&handle).await.unwrap();
        assert_eq!(supervisor.worker_count(), 0);
        assert!(supervisor.signal_start(&handle).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_without_child_reports_clean_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let (supervisor, mut rx) = ProcessSupervisor::new("ws://localhost:1", tmp.path());
        let agent_id = Uuid::new_v4();
        let handle = supervisor
            .spawn(agent_id, &config("true", &[]))
            .await
            .unwrap();
        supervisor.signal_stop(&handle).await.unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            SupervisorEvent::Exited {
                agent_id,
                normal: true
            }
        );
    }

    #[tokio::test]
    async fn test_launch_failure_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let (supervisor, _rx) = ProcessSupervisor::new("ws://localhost:1", tmp.path());
        let handle = supervisor
            .spawn(Uuid::new_v4(), &config("/definitely/not/a/binary", &[]))
            .await
            .unwrap();
        let err = supervisor.signal_start(&handle).await.unwrap_err();
        assert!(matches!(err, OverseerError::Worker(_)));
    }
}
