//! A running container and its operations.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use corral_common::{ContainerHandle, ContainerId, CorralError, CorralResult};
use corral_network::{BandwidthLimit, NetIn, NetOut, NetworkController};
use parking_lot::Mutex;
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::BackendConfig;
use super::events::{self, EventBus, RuntimeEvent};
use super::pools::{Pools, Resources};
use super::snapshot::{
    ContainerSnapshot, ContainerState, DiskLimits, Limits, SNAPSHOT_VERSION, SnapshotStore,
};
use crate::cgroup::CgroupManager;
use crate::process::{Attachment, ProcessStream, ProcessTracker};

/// Event recorded when the kernel OOM-kills a process of the container.
pub const OUT_OF_MEMORY: &str = "out of memory";

/// Minimum time between snapshot writes caused by [`Container::touch`].
pub const TOUCH_SAVE_INTERVAL: Duration = Duration::from_secs(1);

/// State shared by the backend and every container it owns.
pub(crate) struct Host {
    pub config: BackendConfig,
    pub pools: Pools,
    pub network: Arc<dyn NetworkController>,
    pub events: EventBus,
    pub snapshots: SnapshotStore,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("config", &self.config)
            .field("pools", &self.pools)
            .finish_non_exhaustive()
    }
}

/// A command to run in a container.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    /// Shell script passed to `/bin/sh -c`.
    pub script: String,
    /// Run as root instead of the container's user.
    pub privileged: bool,
    /// Extra environment.
    pub env: Vec<(String, String)>,
}

/// What `Info` reports about a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Lifecycle state.
    pub state: ContainerState,
    /// Event log.
    pub events: Vec<String>,
    /// Host side of the container's network.
    pub host_ip: String,
    /// Container side of the container's network.
    pub container_ip: String,
    /// Depot directory.
    pub container_path: PathBuf,
    /// Jobs that have not exited.
    pub process_ids: Vec<u32>,
    /// Applied limits.
    pub limits: Limits,
    /// Inbound port mappings.
    pub mapped_ports: Vec<NetIn>,
}

#[derive(Debug)]
struct Record {
    state: ContainerState,
    events: Vec<String>,
    limits: Limits,
    resources: Resources,
    net_ins: Vec<NetIn>,
    net_outs: Vec<NetOut>,
    last_active: DateTime<Utc>,
    saved_active: DateTime<Utc>,
}

/// One container.
#[derive(Debug)]
pub struct Container {
    id: ContainerId,
    handle: ContainerHandle,
    path: PathBuf,
    grace_time: Duration,
    record: Mutex<Record>,
    tracker: ProcessTracker,
    host: Arc<Host>,
    persist: Mutex<()>,
    oom_watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Container {
    pub(crate) fn new(
        id: ContainerId,
        handle: ContainerHandle,
        grace_time: Duration,
        resources: Resources,
        host: Arc<Host>,
    ) -> Self {
        let path = host.config.paths.container(id.as_str());
        let now = Utc::now();
        Self {
            tracker: ProcessTracker::new(&path, 1),
            id,
            handle,
            path,
            grace_time,
            record: Mutex::new(Record {
                state: ContainerState::Active,
                events: Vec::new(),
                limits: Limits::default(),
                resources,
                net_ins: Vec::new(),
                net_outs: Vec::new(),
                last_active: now,
                saved_active: now,
            }),
            host,
            persist: Mutex::new(()),
            oom_watcher: Mutex::new(None),
        }
    }

    /// Rebuild a container from its snapshot and relink its jobs.
    pub(crate) fn restore(snapshot: ContainerSnapshot, host: Arc<Host>) -> CorralResult<Self> {
        let id = ContainerId::new_unchecked(snapshot.id);
        let handle = ContainerHandle::new(snapshot.handle)?;
        let path = host.config.paths.container(id.as_str());
        let tracker = ProcessTracker::new(&path, snapshot.next_job_id);
        for job in &snapshot.processes {
            tracker.restore(*job);
        }

        Ok(Self {
            id,
            handle,
            path,
            grace_time: snapshot.grace_time,
            record: Mutex::new(Record {
                state: snapshot.state,
                events: snapshot.events,
                limits: snapshot.limits,
                resources: snapshot.resources,
                net_ins: snapshot.net_ins,
                net_outs: snapshot.net_outs,
                last_active: snapshot.last_active,
                saved_active: snapshot.last_active,
            }),
            tracker,
            host,
            persist: Mutex::new(()),
            oom_watcher: Mutex::new(None),
        })
    }

    /// Internal id.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Client-visible handle.
    #[must_use]
    pub const fn handle(&self) -> &ContainerHandle {
        &self.handle
    }

    /// Depot directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Idle time tolerated before the container is reaped. Zero never
    /// reaps.
    #[must_use]
    pub const fn grace_time(&self) -> Duration {
        self.grace_time
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContainerState {
        self.record.lock().state
    }

    /// Leases held by the container.
    #[must_use]
    pub fn resources(&self) -> Resources {
        self.record.lock().resources.clone()
    }

    /// When the container was last used.
    #[must_use]
    pub fn last_active(&self) -> DateTime<Utc> {
        self.record.lock().last_active
    }

    /// How long the container has been idle.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        (Utc::now() - self.last_active()).to_std().unwrap_or_default()
    }

    /// Record that the container was used just now. The snapshot is
    /// rewritten at most once per [`TOUCH_SAVE_INTERVAL`].
    pub fn touch(&self) {
        let due = {
            let mut record = self.record.lock();
            let now = Utc::now();
            record.last_active = now;
            record.state != ContainerState::Destroyed
                && (now - record.saved_active).to_std().unwrap_or_default() >= TOUCH_SAVE_INTERVAL
        };
        if due {
            self.save_or_warn();
        }
    }

    /// The container's job tracker.
    #[must_use]
    pub const fn tracker(&self) -> &ProcessTracker {
        &self.tracker
    }

    /// Current durable record.
    #[must_use]
    pub fn snapshot(&self) -> ContainerSnapshot {
        let record = self.record.lock();
        ContainerSnapshot {
            version: SNAPSHOT_VERSION,
            id: self.id.as_str().to_string(),
            handle: self.handle.as_str().to_string(),
            grace_time: self.grace_time,
            state: record.state,
            events: record.events.clone(),
            limits: record.limits,
            resources: record.resources.clone(),
            processes: self.tracker.active_ids(),
            next_job_id: self.tracker.next_id(),
            net_ins: record.net_ins.clone(),
            net_outs: record.net_outs.clone(),
            last_active: record.last_active,
        }
    }

    /// Persist the snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn save(&self) -> CorralResult<()> {
        let _guard = self.persist.lock();
        let snapshot = self.snapshot();
        self.host.snapshots.save(&snapshot)?;
        self.record.lock().saved_active = snapshot.last_active;
        Ok(())
    }

    fn save_or_warn(&self) {
        if let Err(e) = self.save() {
            warn!(handle = %self.handle, error = %e, "Failed to save snapshot");
        }
    }

    fn ensure_alive(&self) -> CorralResult<()> {
        if self.state() == ContainerState::Destroyed {
            return Err(CorralError::ContainerNotFound {
                handle: self.handle.to_string(),
            });
        }
        Ok(())
    }

    fn cgroup(&self) -> Option<CgroupManager> {
        self.host
            .config
            .cgroup_root
            .as_deref()
            .map(|root| CgroupManager::new(root, self.id.as_str()))
    }

    fn require_cgroup(&self, feature: &str) -> CorralResult<CgroupManager> {
        self.cgroup().ok_or_else(|| CorralError::Unsupported {
            feature: format!("{feature} without a cgroup root"),
        })
    }

    /// Pid of the container's init, as written by the launcher.
    #[must_use]
    pub fn init_pid(&self) -> Option<u32> {
        let pid = std::fs::read_to_string(self.path.join("run").join("pid")).ok()?;
        pid.trim().parse().ok()
    }

    /// Command line running `argv` inside the container through the
    /// control socket.
    fn exec_argv(&self, uid: Option<u32>, env: &[(String, String)], argv: &[String]) -> Vec<String> {
        let mut args = vec![
            self.host.config.launcher.display().to_string(),
            "exec".to_string(),
            "--socket".to_string(),
            self.path.join("run").join("ctl.sock").display().to_string(),
        ];
        if let Some(uid) = uid {
            args.push("--uid".to_string());
            args.push(uid.to_string());
        }
        for (key, value) in env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push("--".to_string());
        args.extend(argv.iter().cloned());
        args
    }

    fn user(&self, privileged: bool) -> Option<u32> {
        (!privileged).then(|| self.record.lock().resources.uid)
    }

    fn exec_command(&self, privileged: bool, argv: &[String]) -> Command {
        let args = self.exec_argv(self.user(privileged), &[], argv);
        let mut command = Command::new(&args[0]);
        command.args(&args[1..]);
        command
    }

    /// Run a job, returning its id and its output stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is destroyed or the job cannot be
    /// spawned.
    pub async fn run(&self, spec: &RunSpec) -> CorralResult<(u32, UnboundedReceiver<ProcessStream>)> {
        self.ensure_alive()?;
        let argv = self.exec_argv(
            self.user(spec.privileged),
            &spec.env,
            &[
                "/bin/sh".to_string(),
                "-c".to_string(),
                spec.script.clone(),
            ],
        );

        let (job_id, stream) = self.tracker.run(&argv, &[]).await?;
        info!(handle = %self.handle, job_id, "Running job");
        self.save_or_warn();
        Ok((job_id, stream))
    }

    /// Attach to a job.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown jobs.
    pub async fn attach(&self, job_id: u32) -> CorralResult<Attachment> {
        self.tracker.attach(job_id).await
    }

    /// Stop the container's processes. With `kill` they are not given time
    /// to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the stop script fails or the container is not
    /// active.
    pub async fn stop(&self, kill: bool) -> CorralResult<()> {
        let state = self.state();
        if state == ContainerState::Stopped {
            return Ok(());
        }
        if !state.can_become(ContainerState::Stopped) {
            return Err(CorralError::ContainerNotFound {
                handle: self.handle.to_string(),
            });
        }

        let script = self.path.join("bin").join("stop");
        if script.exists() {
            let mut command = Command::new(&script);
            command.current_dir(&self.path);
            if kill {
                command.args(["-w", "0"]);
            }
            let output = command.stdin(Stdio::null()).output().await?;
            if !output.status.success() {
                return Err(CorralError::Internal {
                    message: format!(
                        "stop script failed: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                });
            }
        } else {
            debug!(handle = %self.handle, "No stop script");
        }

        self.record.lock().state = ContainerState::Stopped;
        self.save_or_warn();
        info!(handle = %self.handle, kill, "Container stopped");
        self.host.events.publish(RuntimeEvent::ContainerStopped {
            handle: self.handle.to_string(),
            timestamp: events::now(),
        });
        Ok(())
    }

    /// Copy a host path into the container. A source ending in `/` copies
    /// the directory's contents rather than the directory itself.
    ///
    /// # Errors
    ///
    /// Returns an error if either side of the copy fails.
    pub async fn copy_in(&self, src: &str, dst: &str) -> CorralResult<()> {
        self.ensure_alive()?;
        let mut source = Command::new("tar");
        source.args(tar_create_args(src)).stdin(Stdio::null());

        let sink = self.exec_command(
            false,
            &[
                "/bin/sh".to_string(),
                "-c".to_string(),
                "mkdir -p \"$0\" && exec tar -C \"$0\" -xf -".to_string(),
                dst.to_string(),
            ],
        );

        debug!(handle = %self.handle, src, dst, "Copying in");
        pipe(source, sink).await
    }

    /// Copy a path out of the container to the host, optionally handing
    /// the result to `owner`.
    ///
    /// # Errors
    ///
    /// Returns an error if either side of the copy fails.
    pub async fn copy_out(&self, src: &str, dst: &str, owner: Option<&str>) -> CorralResult<()> {
        self.ensure_alive()?;
        let mut argv = vec!["tar".to_string()];
        argv.extend(tar_create_args(src));
        let source = self.exec_command(false, &argv);

        tokio::fs::create_dir_all(dst).await?;
        let mut sink = Command::new("tar");
        sink.args(["-C", dst, "-xf", "-"]);

        debug!(handle = %self.handle, src, dst, "Copying out");
        pipe(source, sink).await?;

        if let Some(owner) = owner {
            let output = Command::new("chown")
                .args(["-R", owner, dst])
                .output()
                .await?;
            if !output.status.success() {
                return Err(CorralError::Internal {
                    message: format!(
                        "chown {owner} {dst} failed: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                });
            }
        }
        Ok(())
    }

    /// Set the memory limit, or only report it when `limit` is `None`.
    ///
    /// # Errors
    ///
    /// Returns an error without a cgroup root or if the limit cannot be
    /// written.
    pub fn limit_memory(&self, limit: Option<u64>) -> CorralResult<Option<u64>> {
        self.ensure_alive()?;
        let cgroup = self.require_cgroup("memory limits")?;
        if let Some(bytes) = limit {
            cgroup.set_memory_limit(bytes)?;
            self.record.lock().limits.memory = Some(bytes);
            self.save_or_warn();
        }
        cgroup.memory_limit()
    }

    /// Set the CPU weight, or only report it when `weight` is `None`.
    ///
    /// # Errors
    ///
    /// Returns an error without a cgroup root or if the weight cannot be
    /// written.
    pub fn limit_cpu(&self, weight: Option<u64>) -> CorralResult<Option<u64>> {
        self.ensure_alive()?;
        let cgroup = self.require_cgroup("cpu limits")?;
        if let Some(weight) = weight {
            cgroup.set_cpu_weight(weight)?;
            self.record.lock().limits.cpu = cgroup.cpu_weight()?;
            self.save_or_warn();
        }
        cgroup.cpu_weight()
    }

    /// Record disk limits, or only report them when `limits` is `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is destroyed.
    pub fn limit_disk(&self, limits: Option<DiskLimits>) -> CorralResult<Option<DiskLimits>> {
        self.ensure_alive()?;
        if let Some(limits) = limits {
            self.record.lock().limits.disk = Some(limits);
            self.save_or_warn();
        }
        Ok(self.record.lock().limits.disk)
    }

    /// Shape bandwidth on the container's host interface.
    ///
    /// # Errors
    ///
    /// Returns an error if the shaping rule cannot be applied.
    pub async fn limit_bandwidth(&self, limit: BandwidthLimit) -> CorralResult<BandwidthLimit> {
        self.ensure_alive()?;
        self.host
            .network
            .limit_bandwidth(self.id.as_str(), &limit)
            .await?;
        self.record.lock().limits.bandwidth = Some(limit);
        self.save_or_warn();
        Ok(limit)
    }

    /// Map a host port to a container port. Without a host port one is
    /// leased from the port pool; without a container port the host port
    /// is used.
    ///
    /// # Errors
    ///
    /// Returns an error if the port pool is exhausted or the rule cannot
    /// be installed.
    pub async fn net_in(
        &self,
        host_port: Option<u16>,
        container_port: Option<u16>,
    ) -> CorralResult<NetIn> {
        self.ensure_alive()?;
        let (host_port, leased) = match host_port.filter(|port| *port != 0) {
            Some(port) => (port, false),
            None => (self.host.pools.port.acquire()?, true),
        };
        let mapping = NetIn::new(
            host_port,
            container_port.filter(|port| *port != 0).unwrap_or(host_port),
        );

        let network = self.record.lock().resources.network;
        if let Err(e) = self
            .host
            .network
            .net_in(self.id.as_str(), &network, &mapping)
            .await
        {
            if leased {
                if let Err(release) = self.host.pools.port.release(host_port) {
                    warn!(port = host_port, error = %release, "Failed to release port");
                }
            }
            return Err(e);
        }

        {
            let mut record = self.record.lock();
            if leased {
                record.resources.ports.push(host_port);
            }
            record.net_ins.push(mapping);
        }
        self.save_or_warn();
        Ok(mapping)
    }

    /// Allow egress to a network and port.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule cannot be installed.
    pub async fn net_out(&self, allow: NetOut) -> CorralResult<()> {
        self.ensure_alive()?;
        let network = self.record.lock().resources.network;
        self.host
            .network
            .net_out(self.id.as_str(), &network, &allow)
            .await?;
        self.record.lock().net_outs.push(allow);
        self.save_or_warn();
        Ok(())
    }

    /// Describe the container.
    #[must_use]
    pub fn info(&self) -> ContainerInfo {
        let record = self.record.lock();
        ContainerInfo {
            state: record.state,
            events: record.events.clone(),
            host_ip: record.resources.network.host_ip.to_string(),
            container_ip: record.resources.network.container_ip.to_string(),
            container_path: self.path.clone(),
            process_ids: self.tracker.active_ids(),
            limits: record.limits,
            mapped_ports: record.net_ins.clone(),
        }
    }

    /// Append an event to the log and persist it.
    pub fn record_event(&self, event: &str) {
        self.record.lock().events.push(event.to_string());
        self.save_or_warn();
    }

    fn out_of_memory(&self) {
        warn!(handle = %self.handle, "Container ran out of memory");
        self.record_event(OUT_OF_MEMORY);
        self.host.events.publish(RuntimeEvent::OutOfMemory {
            handle: self.handle.to_string(),
            timestamp: events::now(),
        });
    }

    /// Poll the cgroup's OOM counter in the background.
    pub(crate) fn watch_oom(self: &Arc<Self>) {
        let Some(cgroup) = self.cgroup() else {
            return;
        };
        let container: Weak<Self> = Arc::downgrade(self);
        let interval = self.host.config.oom_poll_interval;

        let task = tokio::spawn(async move {
            let mut seen = cgroup.oom_kills().unwrap_or(0);
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(container) = container.upgrade() else {
                    break;
                };
                if let Ok(kills) = cgroup.oom_kills() {
                    if kills > seen {
                        seen = kills;
                        container.out_of_memory();
                    }
                }
            }
        });
        if let Some(previous) = self.oom_watcher.lock().replace(task) {
            previous.abort();
        }
    }

    /// Interrupt background work without touching the container: linkers
    /// are unlinked so a restarted supervisor can relink.
    pub(crate) fn detach(&self) {
        self.stop_watching();
        self.tracker.unlink_all();
    }

    fn stop_watching(&self) {
        if let Some(task) = self.oom_watcher.lock().take() {
            task.abort();
        }
    }

    /// Tear the container down and release its leases. Streams and
    /// links of jobs still running end with the unknown exit status.
    pub(crate) async fn destroy(&self) {
        self.stop_watching();

        if let Some(pid) = self.init_pid() {
            if let Err(e) = crate::process::send_signal(pid, libc::SIGKILL) {
                debug!(handle = %self.handle, pid, error = %e, "Init already gone");
            }
        }
        self.tracker.abandon_all();

        if let Some(cgroup) = self.cgroup().filter(CgroupManager::exists) {
            if let Err(e) = cgroup.kill_all() {
                warn!(handle = %self.handle, error = %e, "Failed to kill cgroup");
            }
            if let Err(e) = delete_cgroup(&cgroup).await {
                warn!(handle = %self.handle, error = %e, "Failed to delete cgroup");
            }
        }

        let (resources, net_ins, net_outs) = {
            let mut record = self.record.lock();
            record.state = ContainerState::Destroyed;
            (
                record.resources.clone(),
                std::mem::take(&mut record.net_ins),
                std::mem::take(&mut record.net_outs),
            )
        };

        if let Err(e) = self
            .host
            .network
            .teardown(self.id.as_str(), &resources.network, &net_ins, &net_outs)
            .await
        {
            warn!(handle = %self.handle, error = %e, "Failed to remove network rules");
        }

        if let Err(e) = tokio::fs::remove_dir_all(&self.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(handle = %self.handle, path = %self.path.display(), error = %e, "Failed to remove container directory");
            }
        }

        self.host.pools.release(&resources);
    }
}

/// `tar` arguments archiving `src` to stdout.
fn tar_create_args(src: &str) -> Vec<String> {
    let path = Path::new(src);
    if src.ends_with('/') {
        return vec!["-C".into(), src.into(), "-cf".into(), "-".into(), ".".into()];
    }
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map_or_else(|| ".".to_string(), |n| n.to_string_lossy().into_owned());
    vec![
        "-C".into(),
        parent.display().to_string(),
        "-cf".into(),
        "-".into(),
        name,
    ]
}

/// Run `source | sink`, failing if either side fails.
async fn pipe(mut source: Command, mut sink: Command) -> CorralResult<()> {
    source.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut producer = source.spawn()?;
    let stdout = producer.stdout.take().ok_or_else(|| CorralError::Internal {
        message: "copy source stdout not captured".to_string(),
    })?;
    let stdin: Stdio = stdout.try_into()?;

    sink.stdin(stdin).stdout(Stdio::null()).stderr(Stdio::piped());
    let consumer = sink.spawn()?;
    drop(sink);

    let (produced, consumed) = tokio::join!(producer.wait_with_output(), consumer.wait_with_output());
    for (side, output) in [("source", produced?), ("destination", consumed?)] {
        if !output.status.success() {
            return Err(CorralError::Internal {
                message: format!(
                    "copy {side} failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
    }
    Ok(())
}

/// Remove a cgroup once its processes are gone.
async fn delete_cgroup(cgroup: &CgroupManager) -> CorralResult<()> {
    let mut attempts = 0;
    loop {
        match cgroup.delete() {
            Ok(()) => return Ok(()),
            Err(e) if attempts >= 50 => return Err(e),
            Err(_) => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tar_arguments() {
        assert_eq!(tar_create_args("/data/app"), ["-C", "/data", "-cf", "-", "app"]);
        assert_eq!(tar_create_args("/data/app/"), ["-C", "/data/app/", "-cf", "-", "."]);
        assert_eq!(tar_create_args("app"), ["-C", ".", "-cf", "-", "app"]);
    }

    #[tokio::test]
    async fn pipe_reports_failing_side() {
        let mut source = Command::new("sh");
        source.args(["-c", "echo hello"]);
        let mut sink = Command::new("sh");
        sink.args(["-c", "cat > /dev/null; echo nope >&2; exit 3"]);

        let err = pipe(source, sink).await.unwrap_err();
        assert!(err.to_string().contains("copy destination failed: nope"));
    }

    #[tokio::test]
    async fn pipe_moves_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");

        let mut source = Command::new("sh");
        source.args(["-c", "printf 'a\\nb\\n'"]);
        let mut sink = Command::new("sh");
        sink.args(["-c", "cat > \"$0\"", out.to_str().unwrap()]);

        pipe(source, sink).await.unwrap();
        assert_eq!(std::fs::read_to_string(out).unwrap(), "a\nb\n");
    }
}
