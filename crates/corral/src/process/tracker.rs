//! Per-container job registry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use corral_common::{CorralError, CorralResult};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

use super::{Process, ProcessStream, SpawnSignals};

/// How a client attaches to a job.
#[derive(Debug)]
pub enum Attachment {
    /// Live output, ending with the exit status.
    Live(UnboundedReceiver<ProcessStream>),
    /// The job had already exited with this status.
    Completed(u32),
}

#[derive(Debug)]
struct Jobs {
    next_id: u32,
    processes: BTreeMap<u32, Arc<Process>>,
}

/// Owns every job of one container.
///
/// Job ids increase monotonically and are never reused, also across
/// restarts since the next id is part of the container snapshot.
#[derive(Debug)]
pub struct ProcessTracker {
    container_path: PathBuf,
    jobs: Mutex<Jobs>,
}

impl ProcessTracker {
    /// Create a tracker for the container at `container_path`.
    #[must_use]
    pub fn new(container_path: impl Into<PathBuf>, next_id: u32) -> Self {
        Self {
            container_path: container_path.into(),
            jobs: Mutex::new(Jobs {
                next_id,
                processes: BTreeMap::new(),
            }),
        }
    }

    /// Container directory.
    #[must_use]
    pub fn container_path(&self) -> &Path {
        &self.container_path
    }

    /// Id the next job will get.
    #[must_use]
    pub fn next_id(&self) -> u32 {
        self.jobs.lock().next_id
    }

    /// Run a job, returning its id and a subscription to its output.
    ///
    /// Returns once the spawner has registered the job; the linker starts
    /// in the background once it runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the spawner fails before registering the job.
    pub async fn run(
        &self,
        argv: &[String],
        env: &[(String, String)],
    ) -> CorralResult<(u32, UnboundedReceiver<ProcessStream>)> {
        let process = {
            let mut jobs = self.jobs.lock();
            let id = jobs.next_id;
            jobs.next_id += 1;
            let process = Arc::new(Process::new(id, &self.container_path));
            jobs.processes.insert(id, Arc::clone(&process));
            process
        };
        let id = process.id();

        let stream = process.stream().ok_or_else(|| CorralError::Internal {
            message: format!("new process {id} has no stream"),
        })?;

        let signals = process.spawn(argv, env).await;
        if let Err(e) = SpawnSignals::wait(signals.ready).await {
            self.jobs.lock().processes.remove(&id);
            return Err(e);
        }
        debug!(job_id = id, "Job registered");

        tokio::spawn(async move {
            if let Err(e) = SpawnSignals::wait(signals.active).await {
                warn!(job_id = id, error = %e, "Job did not become active");
            }
            if let Err(e) = process.link().await {
                warn!(job_id = id, error = %e, "Failed to link job");
            }
        });

        Ok((id, stream))
    }

    /// Track a job that was running before a restart and link to it again.
    pub fn restore(&self, id: u32) {
        let process = {
            let mut jobs = self.jobs.lock();
            jobs.next_id = jobs.next_id.max(id.saturating_add(1));
            if jobs.processes.contains_key(&id) {
                return;
            }
            let process = Arc::new(Process::new(id, &self.container_path));
            jobs.processes.insert(id, Arc::clone(&process));
            process
        };

        debug!(job_id = id, "Restored job");
        tokio::spawn(async move {
            if let Err(e) = process.link().await {
                warn!(job_id = id, error = %e, "Failed to relink job");
            }
        });
    }

    /// Look up a job.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::ProcessNotFound`] for unknown ids.
    pub fn get(&self, id: u32) -> CorralResult<Arc<Process>> {
        self.jobs
            .lock()
            .processes
            .get(&id)
            .cloned()
            .ok_or(CorralError::ProcessNotFound { id })
    }

    /// Wait for a job to exit.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown ids.
    pub async fn link(&self, id: u32) -> CorralResult<u32> {
        self.get(id)?.link().await
    }

    /// Attach to a job's output, or get its status if it already exited.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown ids.
    pub async fn attach(&self, id: u32) -> CorralResult<Attachment> {
        let process = self.get(id)?;
        match process.stream() {
            Some(stream) => {
                let linker = Arc::clone(&process);
                tokio::spawn(async move {
                    let _ = linker.link().await;
                });
                Ok(Attachment::Live(stream))
            }
            None => Ok(Attachment::Completed(process.link().await?)),
        }
    }

    /// Interrupt every running linker, leaving jobs running.
    pub fn unlink_all(&self) {
        let processes: Vec<_> = self.jobs.lock().processes.values().cloned().collect();
        for process in processes {
            if let Err(e) = process.unlink() {
                warn!(job_id = process.id(), error = %e, "Failed to unlink job");
            }
        }
    }

    /// Release every waiter of every job that has not exited, for a
    /// container being destroyed.
    pub fn abandon_all(&self) {
        let processes: Vec<_> = self.jobs.lock().processes.values().cloned().collect();
        for process in processes {
            process.abandon();
        }
    }

    /// Ids of jobs that have not exited.
    #[must_use]
    pub fn active_ids(&self) -> Vec<u32> {
        self.jobs
            .lock()
            .processes
            .values()
            .filter(|process| !process.is_completed())
            .map(|process| process.id())
            .collect()
    }

    /// Ids of every known job.
    #[must_use]
    pub fn ids(&self) -> Vec<u32> {
        self.jobs.lock().processes.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{eventually, link_count, sh, stub_container};

    async fn output(mut rx: UnboundedReceiver<ProcessStream>) -> (String, Option<u32>) {
        let (mut out, mut status) = (Vec::new(), None);
        while let Some(event) = rx.recv().await {
            match event {
                ProcessStream::Output { data, .. } => out.extend_from_slice(&data),
                ProcessStream::Exit { status: s } => status = Some(s),
            }
        }
        (String::from_utf8(out).unwrap(), status)
    }

    #[tokio::test]
    async fn ids_are_sequential_and_never_reused() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ProcessTracker::new(stub_container(dir.path()), 3);

        let (a, stream_a) = tracker.run(&sh("echo a"), &[]).await.unwrap();
        let (b, stream_b) = tracker.run(&sh("echo b"), &[]).await.unwrap();
        assert_eq!((a, b), (3, 4));

        assert_eq!(output(stream_a).await, ("a\n".to_string(), Some(0)));
        assert_eq!(output(stream_b).await, ("b\n".to_string(), Some(0)));
        assert_eq!(tracker.next_id(), 5);
        assert!(tracker.active_ids().is_empty());
        assert_eq!(tracker.ids(), vec![3, 4]);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_and_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ProcessTracker::new(dir.path(), 0);

        assert!(tracker.run(&sh("true"), &[]).await.is_err());
        assert!(tracker.ids().is_empty());
        assert_eq!(tracker.next_id(), 1);
    }

    #[tokio::test]
    async fn attach_to_running_and_completed_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ProcessTracker::new(stub_container(dir.path()), 0);

        let (id, first) = tracker
            .run(&sh("sleep 0.2; echo late; exit 4"), &[])
            .await
            .unwrap();
        let Attachment::Live(second) = tracker.attach(id).await.unwrap() else {
            panic!("expected a live attachment");
        };

        assert_eq!(output(first).await, ("late\n".to_string(), Some(4)));
        assert_eq!(output(second).await, ("late\n".to_string(), Some(4)));

        assert!(matches!(
            tracker.attach(id).await.unwrap(),
            Attachment::Completed(4)
        ));
        assert_eq!(tracker.link(id).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn unknown_job() {
        let tracker = ProcessTracker::new("/nonexistent", 0);
        assert!(matches!(
            tracker.attach(9).await,
            Err(CorralError::ProcessNotFound { id: 9 })
        ));
    }

    #[tokio::test]
    async fn restore_relinks_and_bumps_next_id() {
        let dir = tempfile::tempdir().unwrap();
        let container = stub_container(dir.path());

        let before = ProcessTracker::new(&container, 0);
        let (id, _stream) = before.run(&sh("sleep 0.3; echo resumed"), &[]).await.unwrap();
        assert!(eventually(|| link_count(&container, id) == 1).await);
        before.unlink_all();

        let after = ProcessTracker::new(&container, 0);
        after.restore(id);
        after.restore(id);
        assert_eq!(after.next_id(), id + 1);

        let Attachment::Live(stream) = after.attach(id).await.unwrap() else {
            panic!("restored job should still be running");
        };
        let (out, status) = output(stream).await;
        assert_eq!(out, "resumed\n");
        assert_eq!(status, Some(0));
        assert_eq!(link_count(&container, id), 2);
    }

    #[tokio::test]
    async fn abandon_all_ends_running_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ProcessTracker::new(stub_container(dir.path()), 0);

        let (done, finished) = tracker.run(&sh("exit 2"), &[]).await.unwrap();
        assert_eq!(output(finished).await.1, Some(2));
        let (id, running) = tracker.run(&sh("sleep 3"), &[]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        tracker.abandon_all();
        let (_, status) = tokio::time::timeout(std::time::Duration::from_secs(2), output(running))
            .await
            .unwrap();
        assert_eq!(status, Some(crate::process::UNKNOWN_EXIT_STATUS));
        assert_eq!(tracker.link(done).await.unwrap(), 2);
        assert_eq!(tracker.link(id).await.unwrap(), crate::process::UNKNOWN_EXIT_STATUS);
        assert!(tracker.active_ids().is_empty());
    }
}
