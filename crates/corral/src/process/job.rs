//! A single tracked job.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use bytes::Bytes;
use corral_common::{CorralError, CorralResult};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use super::dispatch::Dispatcher;
use super::{ProcessStream, StreamSource, UNKNOWN_EXIT_STATUS, send_signal};

const CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    NotStarted,
    InProgress,
    Completed(u32),
}

#[derive(Debug, Default)]
struct Linker {
    pid: Option<u32>,
    unlinked: bool,
}

/// Readiness signals of a spawn.
///
/// `ready` resolves once the spawner has registered the command, `active`
/// once the command runs. Each carries the error that prevented it.
#[derive(Debug)]
pub struct SpawnSignals {
    /// Command registered in its job directory.
    pub ready: oneshot::Receiver<CorralResult<()>>,
    /// Command executing.
    pub active: oneshot::Receiver<CorralResult<()>>,
}

impl SpawnSignals {
    fn failed(err: CorralError) -> Self {
        let (ready_tx, ready) = oneshot::channel();
        let (_, active) = oneshot::channel();
        let _ = ready_tx.send(Err(err));
        Self { ready, active }
    }

    /// Wait for one of the signals.
    ///
    /// # Errors
    ///
    /// Returns the signalled error, or an error if the spawner went away
    /// without signalling.
    pub async fn wait(signal: oneshot::Receiver<CorralResult<()>>) -> CorralResult<()> {
        signal.await.map_err(|_| CorralError::Launch {
            message: "spawner exited without signalling".to_string(),
        })?
    }
}

/// A job in a container: its exit status and its live output subscribers.
#[derive(Debug)]
pub struct Process {
    id: u32,
    container_path: PathBuf,
    state: Mutex<LinkState>,
    exit: watch::Sender<Option<u32>>,
    linker: Mutex<Linker>,
    dispatcher: Dispatcher,
}

impl Process {
    /// Create a job handle. Must be called within a tokio runtime.
    #[must_use]
    pub fn new(id: u32, container_path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            container_path: container_path.into(),
            state: Mutex::new(LinkState::NotStarted),
            exit: watch::Sender::new(None),
            linker: Mutex::new(Linker::default()),
            dispatcher: Dispatcher::spawn(),
        }
    }

    /// Job id.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Job directory.
    #[must_use]
    pub fn job_dir(&self) -> PathBuf {
        self.container_path.join("jobs").join(self.id.to_string())
    }

    fn bin(&self, name: &str) -> PathBuf {
        self.container_path.join("bin").join(name)
    }

    /// Whether the job has exited.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(*self.state.lock(), LinkState::Completed(_))
    }

    /// Exit status, once the job has exited.
    #[must_use]
    pub fn exit_status(&self) -> Option<u32> {
        match *self.state.lock() {
            LinkState::Completed(status) => Some(status),
            _ => None,
        }
    }

    /// Start `argv` through the container's spawner.
    pub async fn spawn(&self, argv: &[String], env: &[(String, String)]) -> SpawnSignals {
        let job_dir = self.job_dir();
        if let Err(e) = tokio::fs::create_dir_all(&job_dir).await {
            return SpawnSignals::failed(e.into());
        }

        let mut spawner = Command::new(self.bin("iomux-spawn"));
        spawner
            .arg(&job_dir)
            .args(argv)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0);

        let mut child = match spawner.spawn() {
            Ok(child) => child,
            Err(e) => return SpawnSignals::failed(e.into()),
        };
        let Some(stdout) = child.stdout.take() else {
            return SpawnSignals::failed(CorralError::Internal {
                message: "spawner stdout not captured".to_string(),
            });
        };

        debug!(job_id = self.id, job_dir = %job_dir.display(), "Spawning job");

        let (ready_tx, ready) = oneshot::channel();
        let (active_tx, active) = oneshot::channel();
        let id = self.id;

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let _ = ready_tx.send(marker(lines.next_line().await, "ready"));
            let _ = active_tx.send(marker(lines.next_line().await, "active"));
            if let Err(e) = child.wait().await {
                warn!(job_id = id, error = %e, "Failed to reap spawner");
            }
        });

        SpawnSignals { ready, active }
    }

    /// Wait for the job to exit and return its status.
    ///
    /// The linker runs at most once per process; every caller, however
    /// many and whenever they arrive, gets the same status.
    ///
    /// # Errors
    ///
    /// Returns an error if the process is dropped before completing.
    pub async fn link(self: &Arc<Self>) -> CorralResult<u32> {
        let mut exit = self.exit.subscribe();

        let start = {
            let mut state = self.state.lock();
            match *state {
                LinkState::Completed(status) => return Ok(status),
                LinkState::InProgress => false,
                LinkState::NotStarted => {
                    *state = LinkState::InProgress;
                    true
                }
            }
        };

        if start {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run_linker().await });
        }

        let status = *exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| CorralError::Internal {
                message: format!("process {} dropped while linking", self.id),
            })?;

        status.ok_or_else(|| CorralError::Internal {
            message: format!("process {} completed without status", self.id),
        })
    }

    /// Interrupt a running linker without touching the job itself.
    ///
    /// Waiters stay blocked; a later [`link`](Self::link) on a fresh
    /// process after restart picks the job up again.
    ///
    /// # Errors
    ///
    /// Returns an error if the linker cannot be signalled.
    pub fn unlink(&self) -> CorralResult<()> {
        let mut linker = self.linker.lock();
        linker.unlinked = true;
        if let Some(pid) = linker.pid {
            debug!(job_id = self.id, pid, "Interrupting linker");
            send_signal(pid, libc::SIGINT)?;
        }
        Ok(())
    }

    /// Subscribe to the job's output and exit status.
    ///
    /// Returns `None` if the job has already completed.
    #[must_use]
    pub fn stream(&self) -> Option<tokio::sync::mpsc::UnboundedReceiver<ProcessStream>> {
        if self.is_completed() {
            return None;
        }
        self.dispatcher.subscribe()
    }

    async fn run_linker(self: Arc<Self>) {
        let job_dir = self.job_dir();
        let mut cmd = Command::new(self.bin("iomux-link"));
        cmd.arg("-w")
            .arg(job_dir.join("cursors"))
            .arg(&job_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let status = match cmd.spawn() {
            Ok(mut child) => {
                {
                    let mut linker = self.linker.lock();
                    linker.pid = child.id();
                    if linker.unlinked {
                        if let Some(pid) = linker.pid {
                            let _ = send_signal(pid, libc::SIGINT);
                        }
                    }
                }
                debug!(job_id = self.id, pid = ?child.id(), "Linker started");

                let stdout = child
                    .stdout
                    .take()
                    .map(|out| tokio::spawn(pump(out, StreamSource::Stdout, self.dispatcher.clone())));
                let stderr = child
                    .stderr
                    .take()
                    .map(|err| tokio::spawn(pump(err, StreamSource::Stderr, self.dispatcher.clone())));
                for pump in [stdout, stderr].into_iter().flatten() {
                    let _ = pump.await;
                }

                match child.wait().await {
                    Ok(status) => status
                        .code()
                        .and_then(|code| u32::try_from(code).ok())
                        .unwrap_or(UNKNOWN_EXIT_STATUS),
                    Err(e) => {
                        warn!(job_id = self.id, error = %e, "Failed to wait for linker");
                        UNKNOWN_EXIT_STATUS
                    }
                }
            }
            Err(e) => {
                warn!(job_id = self.id, error = %e, "Failed to start linker");
                UNKNOWN_EXIT_STATUS
            }
        };

        if self.linker.lock().unlinked {
            debug!(job_id = self.id, "Linker interrupted, job keeps running");
            return;
        }

        if self.complete(status) {
            info!(job_id = self.id, exit_status = status, "Job completed");
        }
    }

    /// Give up on a job whose container is going away.
    ///
    /// The linker is interrupted and, unless the job already exited, every
    /// stream ends with [`UNKNOWN_EXIT_STATUS`] and every
    /// [`link`](Self::link) returns it.
    pub fn abandon(&self) {
        if let Err(e) = self.unlink() {
            debug!(job_id = self.id, error = %e, "Linker already gone");
        }
        if self.complete(UNKNOWN_EXIT_STATUS) {
            info!(job_id = self.id, "Job abandoned");
        }
    }

    /// Record the exit status and release every waiter. Only the first
    /// call takes effect.
    fn complete(&self, status: u32) -> bool {
        {
            let mut state = self.state.lock();
            if matches!(*state, LinkState::Completed(_)) {
                return false;
            }
            *state = LinkState::Completed(status);
        }
        self.dispatcher.publish(ProcessStream::Exit { status });
        self.dispatcher.close();
        self.exit.send_replace(Some(status));
        true
    }
}

fn marker(line: std::io::Result<Option<String>>, name: &str) -> CorralResult<()> {
    match line {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(CorralError::Launch {
            message: format!("spawner exited before {name}"),
        }),
        Err(e) => Err(e.into()),
    }
}

async fn pump(mut source: impl AsyncRead + Unpin, origin: StreamSource, dispatcher: Dispatcher) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match source.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => dispatcher.publish(ProcessStream::Output {
                source: origin,
                data: Bytes::copy_from_slice(&buf[..n]),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{eventually, link_count, sh, stub_container, write_script};
    use std::time::Duration;

    async fn spawned(process: &Process, script: &str) {
        let signals = process.spawn(&sh(script), &[]).await;
        SpawnSignals::wait(signals.ready).await.unwrap();
        SpawnSignals::wait(signals.active).await.unwrap();
    }

    async fn collect(mut rx: tokio::sync::mpsc::UnboundedReceiver<ProcessStream>) -> (Vec<u8>, Vec<u8>, Option<u32>) {
        let (mut out, mut err, mut status) = (Vec::new(), Vec::new(), None);
        while let Some(event) = rx.recv().await {
            match event {
                ProcessStream::Output { source: StreamSource::Stdout, data } => out.extend_from_slice(&data),
                ProcessStream::Output { source: StreamSource::Stderr, data } => err.extend_from_slice(&data),
                ProcessStream::Exit { status: s } => status = Some(s),
            }
        }
        (out, err, status)
    }

    #[tokio::test]
    async fn link_returns_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let process = Arc::new(Process::new(0, stub_container(dir.path())));

        spawned(&process, "exit 3").await;
        assert_eq!(process.link().await.unwrap(), 3);
        assert!(process.is_completed());
        assert_eq!(process.exit_status(), Some(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_links_run_linker_once() {
        let dir = tempfile::tempdir().unwrap();
        let container = stub_container(dir.path());
        let process = Arc::new(Process::new(7, &container));
        spawned(&process, "sleep 0.3; exit 42").await;

        let links: Vec<_> = (0..10)
            .map(|_| {
                let process = Arc::clone(&process);
                tokio::spawn(async move { process.link().await.unwrap() })
            })
            .collect();
        for link in links {
            assert_eq!(link.await.unwrap(), 42);
        }

        assert_eq!(process.link().await.unwrap(), 42);
        assert_eq!(link_count(&container, 7), 1);
    }

    #[tokio::test]
    async fn stream_delivers_output_then_exit() {
        let dir = tempfile::tempdir().unwrap();
        let process = Arc::new(Process::new(1, stub_container(dir.path())));
        let stream = process.stream().unwrap();

        spawned(&process, "echo hello; echo oops >&2; exit 1").await;
        let linker = {
            let process = Arc::clone(&process);
            tokio::spawn(async move { process.link().await })
        };

        let (out, err, status) = collect(stream).await;
        assert_eq!(out, b"hello\n");
        assert_eq!(err, b"oops\n");
        assert_eq!(status, Some(1));
        assert_eq!(linker.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn stream_after_completion_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let process = Arc::new(Process::new(2, stub_container(dir.path())));
        spawned(&process, "true").await;
        process.link().await.unwrap();

        assert!(process.stream().is_none());
    }

    #[tokio::test]
    async fn missing_spawner_fails_ready() {
        let dir = tempfile::tempdir().unwrap();
        let process = Process::new(0, dir.path());

        let signals = process.spawn(&sh("true"), &[]).await;
        assert!(SpawnSignals::wait(signals.ready).await.is_err());
    }

    #[tokio::test]
    async fn spawner_without_active_marker_fails_active() {
        let dir = tempfile::tempdir().unwrap();
        write_script(&dir.path().join("bin").join("iomux-spawn"), "#!/bin/sh\necho ready\n");
        let process = Process::new(0, dir.path());

        let signals = process.spawn(&sh("true"), &[]).await;
        SpawnSignals::wait(signals.ready).await.unwrap();
        let err = SpawnSignals::wait(signals.active).await.unwrap_err();
        assert!(err.to_string().contains("before active"));
    }

    #[tokio::test]
    async fn unlink_leaves_job_running_for_relink() {
        let dir = tempfile::tempdir().unwrap();
        let container = stub_container(dir.path());
        let process = Arc::new(Process::new(5, &container));
        spawned(&process, "sleep 0.5; echo done").await;

        let pending = {
            let process = Arc::clone(&process);
            tokio::spawn(async move { process.link().await })
        };
        assert!(eventually(|| link_count(&container, 5) == 1).await);
        assert!(eventually(|| process.linker.lock().pid.is_some()).await);

        process.unlink().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!pending.is_finished());
        assert!(!process.is_completed());
        pending.abort();

        let relinked = Arc::new(Process::new(5, &container));
        assert_eq!(relinked.link().await.unwrap(), 0);
        assert_eq!(link_count(&container, 5), 2);
    }

    #[tokio::test]
    async fn abandon_releases_streams_and_links() {
        let dir = tempfile::tempdir().unwrap();
        let container = stub_container(dir.path());
        let process = Arc::new(Process::new(6, &container));
        let stream = process.stream().unwrap();
        spawned(&process, "echo started; sleep 3").await;

        let pending = {
            let process = Arc::clone(&process);
            tokio::spawn(async move { process.link().await })
        };
        assert!(eventually(|| process.linker.lock().pid.is_some()).await);
        tokio::time::sleep(Duration::from_millis(300)).await;

        process.abandon();
        let (_, _, status) = tokio::time::timeout(Duration::from_secs(2), collect(stream))
            .await
            .unwrap();
        assert_eq!(status, Some(UNKNOWN_EXIT_STATUS));
        let linked = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(linked, UNKNOWN_EXIT_STATUS);
        assert_eq!(process.link().await.unwrap(), UNKNOWN_EXIT_STATUS);
        assert!(process.stream().is_none());
    }

    #[tokio::test]
    async fn abandon_keeps_a_known_status() {
        let dir = tempfile::tempdir().unwrap();
        let process = Arc::new(Process::new(8, stub_container(dir.path())));
        spawned(&process, "exit 5").await;
        assert_eq!(process.link().await.unwrap(), 5);

        process.abandon();
        assert_eq!(process.exit_status(), Some(5));
    }
}
