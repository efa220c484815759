//! Container orchestration.

use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use corral_common::{ContainerHandle, ContainerId, CorralError, CorralResult};
use corral_network::NetworkController;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::config::BackendConfig;
use super::container::{Container, Host};
use super::events::{self, EventBus, RuntimeEvent};
use super::pools::{Pools, Resources};
use super::snapshot::{ContainerState, SnapshotStore};
use crate::cgroup::CgroupManager;

/// What a client asks for when creating a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Handle; the generated id is used when absent.
    pub handle: Option<String>,
    /// Grace time; the backend default when absent.
    pub grace_time: Option<Duration>,
    /// Base root filesystem; the backend default when absent.
    pub rootfs: Option<std::path::PathBuf>,
}

/// The collaborator the protocol layer drives.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Load every snapshot and resume supervising the containers.
    async fn start(&self) -> CorralResult<()>;

    /// Detach from every container, leaving them running, and persist
    /// their snapshots.
    async fn stop(&self);

    /// Create a container.
    async fn create(&self, spec: ContainerSpec) -> CorralResult<Arc<Container>>;

    /// Destroy a container and release its leases.
    async fn destroy(&self, handle: &str) -> CorralResult<()>;

    /// Every container.
    fn containers(&self) -> Vec<Arc<Container>>;

    /// Find a container by handle.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::ContainerNotFound`] for unknown handles.
    fn lookup(&self, handle: &str) -> CorralResult<Arc<Container>>;
}

/// Backend running containers in Linux namespaces through the launcher.
#[derive(Debug)]
pub struct LinuxBackend {
    host: Arc<Host>,
    containers: DashMap<String, Arc<Container>>,
    creating: Mutex<HashSet<String>>,
}

impl LinuxBackend {
    /// Create a backend, opening the resource pools.
    ///
    /// # Errors
    ///
    /// Returns an error if a pool is misconfigured or its persisted state
    /// is unreadable.
    pub fn new(config: BackendConfig, network: Arc<dyn NetworkController>) -> CorralResult<Self> {
        let pools = Pools::open(&config.pools, &config.paths)?;
        let snapshots = SnapshotStore::new(config.paths.snapshots.clone());
        Ok(Self {
            host: Arc::new(Host {
                config,
                pools,
                network,
                events: EventBus::new(),
                snapshots,
            }),
            containers: DashMap::new(),
            creating: Mutex::new(HashSet::new()),
        })
    }

    /// Backend configuration.
    #[must_use]
    pub fn config(&self) -> &BackendConfig {
        &self.host.config
    }

    /// Container lifecycle events.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.host.events
    }

    /// Resource pools.
    #[must_use]
    pub fn pools(&self) -> &Pools {
        &self.host.pools
    }

    fn claim(&self, handle: &ContainerHandle) -> CorralResult<()> {
        let mut creating = self.creating.lock();
        if self.containers.contains_key(handle.as_str()) || !creating.insert(handle.to_string()) {
            return Err(CorralError::HandleInUse {
                handle: handle.to_string(),
            });
        }
        Ok(())
    }

    async fn build(
        &self,
        id: ContainerId,
        handle: ContainerHandle,
        spec: ContainerSpec,
    ) -> CorralResult<Arc<Container>> {
        let resources = self.host.pools.acquire()?;
        let path = self.host.config.paths.container(id.as_str());

        if let Err(e) = self.launch(&id, &handle, &resources, &spec).await {
            warn!(%handle, error = %e, "Container creation failed, rolling back");
            self.host.pools.release(&resources);
            if let Some(cgroup) = self.cgroup(&id) {
                let _ = cgroup.delete();
            }
            if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                debug!(path = %path.display(), error = %e, "Nothing to remove");
            }
            return Err(e);
        }

        let grace_time = spec.grace_time.unwrap_or(self.host.config.grace_time);
        let container = Arc::new(Container::new(
            id,
            handle,
            grace_time,
            resources,
            Arc::clone(&self.host),
        ));
        if let Err(e) = container.save() {
            container.destroy().await;
            return Err(e);
        }
        container.watch_oom();
        Ok(container)
    }

    fn cgroup(&self, id: &ContainerId) -> Option<CgroupManager> {
        self.host
            .config
            .cgroup_root
            .as_deref()
            .map(|root| CgroupManager::new(root, id.as_str()))
    }

    async fn launch(
        &self,
        id: &ContainerId,
        handle: &ContainerHandle,
        resources: &Resources,
        spec: &ContainerSpec,
    ) -> CorralResult<()> {
        let config = &self.host.config;
        let path = config.paths.container(id.as_str());

        let skeleton = config.skeleton.clone();
        let target = path.clone();
        tokio::task::spawn_blocking(move || copy_tree(&skeleton, &target))
            .await
            .map_err(|e| CorralError::Internal {
                message: format!("skeleton copy panicked: {e}"),
            })??;

        let run = config.paths.container_run(id.as_str());
        tokio::fs::create_dir_all(&run).await?;
        tokio::fs::create_dir_all(config.paths.jobs(id.as_str())).await?;

        let rootfs = spec.rootfs.as_ref().unwrap_or(&config.rootfs);
        let network = &resources.network;
        debug!(%handle, id = %id, path = %path.display(), "Launching container");

        let output = Command::new(&config.launcher)
            .arg("launch")
            .arg("--run")
            .arg(&run)
            .arg("--root")
            .arg(config.paths.container_rootfs(id.as_str()))
            .arg("--lib")
            .arg(config.paths.container_lib(id.as_str()))
            .arg("--title")
            .arg(format!("corral {handle}"))
            .env("CONTAINER_ID", id.as_str())
            .env("CONTAINER_HANDLE", handle.as_str())
            .env("CONTAINER_PATH", &path)
            .env("CONTAINER_UID", resources.uid.to_string())
            .env("ROOTFS_BASE", rootfs)
            .env("NETWORK_HOST_IP", network.host_ip.to_string())
            .env("NETWORK_CONTAINER_IP", network.container_ip.to_string())
            .env("NETWORK_CIDR", network.cidr())
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| CorralError::Launch {
                message: format!("failed to run {}: {e}", config.launcher.display()),
            })?;

        if !output.status.success() {
            return Err(CorralError::Launch {
                message: format!(
                    "launcher exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        if let Some(cgroup) = self.cgroup(id) {
            let pid = std::fs::read_to_string(config.paths.container_pid(id.as_str()))?;
            let pid = pid.trim().parse().map_err(|_| CorralError::Launch {
                message: format!("launcher wrote an invalid pid: {pid:?}"),
            })?;
            cgroup.create()?;
            cgroup.add_process(pid)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for LinuxBackend {
    async fn start(&self) -> CorralResult<()> {
        self.host.config.paths.create_dirs()?;

        for (path, snapshot) in self.host.snapshots.load_all()? {
            let snapshot = match snapshot {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable snapshot");
                    continue;
                }
            };
            let handle = snapshot.handle.clone();

            if snapshot.state == ContainerState::Destroyed {
                if let Err(e) = self.host.snapshots.delete(&handle) {
                    warn!(%handle, error = %e, "Failed to remove stale snapshot");
                }
                continue;
            }

            if let Err(e) = self.host.pools.reserve(&snapshot.resources) {
                warn!(%handle, error = %e, "Skipping snapshot with conflicting leases");
                continue;
            }

            match Container::restore(snapshot, Arc::clone(&self.host)) {
                Ok(container) => {
                    let container = Arc::new(container);
                    container.watch_oom();
                    info!(%handle, jobs = ?container.tracker().ids(), "Restored container");
                    self.containers.insert(handle, container);
                }
                Err(e) => warn!(%handle, error = %e, "Failed to restore container"),
            }
        }

        info!(containers = self.containers.len(), "Backend started");
        Ok(())
    }

    async fn stop(&self) {
        for container in self.containers() {
            container.detach();
            if let Err(e) = container.save() {
                warn!(handle = %container.handle(), error = %e, "Failed to save snapshot");
            }
        }
        info!("Backend stopped");
    }

    async fn create(&self, spec: ContainerSpec) -> CorralResult<Arc<Container>> {
        let id = ContainerId::generate();
        let handle = match &spec.handle {
            Some(handle) => ContainerHandle::new(handle.clone())?,
            None => ContainerHandle::from_id(&id),
        };

        self.claim(&handle)?;
        let result = self.build(id, handle.clone(), spec).await;
        if let Ok(container) = &result {
            self.containers
                .insert(handle.to_string(), Arc::clone(container));
        }
        self.creating.lock().remove(handle.as_str());

        let container = result?;
        info!(%handle, id = %container.id(), "Container created");
        self.host.events.publish(RuntimeEvent::ContainerCreated {
            handle: handle.to_string(),
            timestamp: events::now(),
        });
        Ok(container)
    }

    async fn destroy(&self, handle: &str) -> CorralResult<()> {
        let (_, container) =
            self.containers
                .remove(handle)
                .ok_or_else(|| CorralError::ContainerNotFound {
                    handle: handle.to_string(),
                })?;

        container.destroy().await;
        if let Err(e) = self.host.snapshots.delete(handle) {
            warn!(handle, error = %e, "Failed to remove snapshot");
        }

        info!(handle, "Container destroyed");
        self.host.events.publish(RuntimeEvent::ContainerDestroyed {
            handle: handle.to_string(),
            timestamp: events::now(),
        });
        Ok(())
    }

    fn containers(&self) -> Vec<Arc<Container>> {
        self.containers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn lookup(&self, handle: &str) -> CorralResult<Arc<Container>> {
        self.containers
            .get(handle)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CorralError::ContainerNotFound {
                handle: handle.to_string(),
            })
    }
}

/// Copy a directory tree, keeping permissions and symlinks.
fn copy_tree(from: &Path, to: &Path) -> CorralResult<()> {
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(|e| CorralError::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| CorralError::Internal {
                message: e.to_string(),
            })?;
        let target = to.join(relative);
        let kind = entry.file_type();

        if kind.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if kind.is_symlink() {
            std::os::unix::fs::symlink(std::fs::read_link(entry.path())?, &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
