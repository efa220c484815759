//! Control socket server.
//!
//! Each connection carries a sequence of requests, one JSON line each.
//! Every request gets exactly one response line, except `Run` and `Attach`
//! which stream `ProcessPayload` lines ending with the exit status. Once the
//! server stops, open streams end without a status and the connection
//! closes; the job keeps running and can be attached to after restart.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use corral::Container;
use corral::process::{Attachment, ProcessStream, StreamSource};
use corral::runtime::{Backend, ContainerInfo, ContainerSpec, DiskLimits, RunSpec};
use corral_common::{CorralError, CorralResult};
use corral_network::{BandwidthLimit, NetOut};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bomberman::Bomberman;
use crate::drain::{Drain, DrainGuard};
use crate::protocol::{LimitsInfo, PortMapping, ProcessPayload, Request, Response, Source};

/// Where the server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listen {
    /// Unix socket path.
    Unix(PathBuf),
    /// TCP `host:port`.
    Tcp(String),
}

trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Connection for T {}

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    async fn bind(listen: &Listen) -> io::Result<Self> {
        match listen {
            Listen::Unix(path) => {
                let listener = UnixListener::bind(path)?;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))?;
                Ok(Self::Unix(listener))
            }
            Listen::Tcp(addr) => Ok(Self::Tcp(TcpListener::bind(addr).await?)),
        }
    }

    async fn accept(&self) -> io::Result<Box<dyn Connection>> {
        match self {
            Self::Unix(listener) => Ok(Box::new(listener.accept().await?.0)),
            Self::Tcp(listener) => Ok(Box::new(listener.accept().await?.0)),
        }
    }
}

/// The daemon's request server.
pub struct Server {
    backend: Arc<dyn Backend>,
    listen: Listen,
    drain: Drain,
    bomberman: Bomberman,
    stopping: watch::Sender<bool>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listen", &self.listen)
            .field("drain", &self.drain)
            .field("bomberman", &self.bomberman)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Create a server for `backend`. Idle containers are destroyed
    /// through the backend.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, listen: Listen) -> Arc<Self> {
        let reaper = Arc::clone(&backend);
        let bomberman = Bomberman::new(Arc::new(move |handle: String| {
            let backend = Arc::clone(&reaper);
            async move {
                match backend.destroy(&handle).await {
                    Ok(()) => info!(%handle, "Destroyed idle container"),
                    Err(CorralError::ContainerNotFound { .. }) => {}
                    Err(e) => warn!(%handle, error = %e, "Failed to destroy idle container"),
                }
            }
            .boxed()
        }));

        Arc::new(Self {
            backend,
            listen,
            drain: Drain::new(),
            bomberman,
            stopping: watch::Sender::new(false),
            acceptor: Mutex::new(None),
        })
    }

    /// Whether [`Server::stop`] has begun.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        *self.stopping.borrow()
    }

    /// Requests currently being handled.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.drain.count()
    }

    /// Restore the backend, bind the socket and start accepting.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot start or the socket cannot
    /// be bound.
    pub async fn start(self: &Arc<Self>) -> CorralResult<()> {
        if let Listen::Unix(path) = &self.listen {
            remove_socket(path)?;
        }

        self.backend.start().await?;
        let listener = Listener::bind(&self.listen).await?;

        for container in self.backend.containers() {
            self.bomberman.strap(
                container.handle().as_str(),
                container.grace_time(),
                container.idle_for(),
            );
        }

        let server = Arc::clone(self);
        let acceptor = tokio::spawn(async move { server.accept(listener).await });
        *self.acceptor.lock() = Some(acceptor);

        info!(listen = ?self.listen, "Listening");
        Ok(())
    }

    /// Stop accepting, wait for in-flight requests, then detach from every
    /// container. Containers keep running.
    pub async fn stop(&self) {
        info!(in_flight = self.in_flight(), "Stopping");
        self.stopping.send_replace(true);

        let acceptor = self.acceptor.lock().take();
        if let Some(acceptor) = acceptor {
            if let Err(e) = acceptor.await {
                warn!(error = %e, "Accept loop failed");
            }
        }

        self.drain.wait().await;
        self.bomberman.shutdown();
        self.backend.stop().await;

        if let Listen::Unix(path) = &self.listen {
            if let Err(e) = remove_socket(path) {
                warn!(error = %e, "Failed to remove socket");
            }
        }
        info!("Stopped");
    }

    async fn accept(self: Arc<Self>, listener: Listener) {
        let mut stopping = self.stopping.subscribe();
        loop {
            tokio::select! {
                () = stopped(&mut stopping) => break,
                conn = listener.accept() => match conn {
                    Ok(conn) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move { server.serve(conn).await });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        debug!("Accept loop finished");
    }

    async fn serve(self: Arc<Self>, conn: Box<dyn Connection>) {
        let (reader, mut writer) = tokio::io::split(conn);
        let mut lines = BufReader::new(reader).lines();
        let mut stopping = self.stopping.subscribe();

        loop {
            if self.is_stopping() {
                break;
            }
            let line = tokio::select! {
                line = lines.next_line() => line,
                () = stopped(&mut stopping) => break,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Failed to read request");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            // A request read after shutdown began is dropped.
            if self.is_stopping() {
                break;
            }

            let guard = self.drain.enter();
            if let Err(e) = self.dispatch(&line, &mut writer, guard).await {
                debug!(error = %e, "Connection closed");
                break;
            }
        }
    }

    async fn dispatch<W: AsyncWrite + Unpin>(
        &self,
        line: &str,
        writer: &mut W,
        guard: DrainGuard,
    ) -> io::Result<()> {
        let request = match Request::decode(line) {
            Ok(request) => request,
            Err(message) => return send(writer, &Response::Error { message }).await,
        };
        if let Some(handle) = request.handle() {
            self.touch(handle);
        }

        match request {
            Request::Run {
                handle,
                script,
                privileged,
                env,
            } => {
                let spec = RunSpec {
                    script,
                    privileged,
                    env: env.into_iter().map(|var| (var.key, var.value)).collect(),
                };
                self.run(writer, guard, &handle, &spec).await
            }
            Request::Attach { handle, job_id } => {
                self.attach(writer, guard, &handle, job_id).await
            }
            request => {
                let response = self.respond(request).await.unwrap_or_else(Response::error);
                let result = send(writer, &response).await;
                drop(guard);
                result
            }
        }
    }

    fn touch(&self, handle: &str) {
        if let Ok(container) = self.backend.lookup(handle) {
            container.touch();
            self.bomberman.reset(handle);
        }
    }

    async fn respond(&self, request: Request) -> CorralResult<Response> {
        let response = match request {
            Request::Ping {} => Response::Ping {},
            Request::Echo { message } => Response::Echo { message },
            Request::Create {
                handle,
                grace_time,
                rootfs,
            } => {
                let container = self
                    .backend
                    .create(ContainerSpec {
                        handle,
                        grace_time: grace_time.map(Duration::from_secs),
                        rootfs: rootfs.map(PathBuf::from),
                    })
                    .await?;
                let handle = container.handle().to_string();
                self.bomberman
                    .strap(&handle, container.grace_time(), Duration::ZERO);
                Response::Create { handle }
            }
            Request::Destroy { handle } => {
                self.bomberman.defuse(&handle);
                self.backend.destroy(&handle).await?;
                Response::Destroy {}
            }
            Request::List {} => {
                let mut handles: Vec<String> = self
                    .backend
                    .containers()
                    .iter()
                    .map(|container| container.handle().to_string())
                    .collect();
                handles.sort();
                Response::List { handles }
            }
            Request::Stop {
                handle,
                kill,
                background,
            } => {
                let container = self.backend.lookup(&handle)?;
                if background {
                    tokio::spawn(async move {
                        if let Err(e) = container.stop(kill).await {
                            warn!(%handle, error = %e, "Background stop failed");
                        }
                    });
                } else {
                    container.stop(kill).await?;
                }
                Response::Stop {}
            }
            Request::CopyIn {
                handle,
                src_path,
                dst_path,
            } => {
                self.backend
                    .lookup(&handle)?
                    .copy_in(&src_path, &dst_path)
                    .await?;
                Response::CopyIn {}
            }
            Request::CopyOut {
                handle,
                src_path,
                dst_path,
                owner,
            } => {
                self.backend
                    .lookup(&handle)?
                    .copy_out(&src_path, &dst_path, owner.as_deref())
                    .await?;
                Response::CopyOut {}
            }
            Request::LimitBandwidth {
                handle,
                rate,
                burst,
            } => {
                let limit = self
                    .backend
                    .lookup(&handle)?
                    .limit_bandwidth(BandwidthLimit { rate, burst })
                    .await?;
                Response::LimitBandwidth {
                    rate: limit.rate,
                    burst: limit.burst,
                }
            }
            Request::LimitMemory {
                handle,
                limit_in_bytes,
            } => {
                let limit = self
                    .backend
                    .lookup(&handle)?
                    .limit_memory(limit_in_bytes.filter(|limit| *limit > 0))?;
                Response::LimitMemory {
                    limit_in_bytes: limit,
                }
            }
            Request::LimitDisk {
                handle,
                byte_limit,
                inode_limit,
            } => {
                let requested = (byte_limit.is_some() || inode_limit.is_some()).then(|| {
                    DiskLimits {
                        byte_limit: byte_limit.unwrap_or(0),
                        inode_limit: inode_limit.unwrap_or(0),
                    }
                });
                let limits = self.backend.lookup(&handle)?.limit_disk(requested)?;
                Response::LimitDisk {
                    byte_limit: limits.map(|limits| limits.byte_limit),
                    inode_limit: limits.map(|limits| limits.inode_limit),
                }
            }
            Request::LimitCpu {
                handle,
                limit_in_shares,
            } => {
                let shares = self
                    .backend
                    .lookup(&handle)?
                    .limit_cpu(limit_in_shares.filter(|shares| *shares > 0))?;
                Response::LimitCpu {
                    limit_in_shares: shares,
                }
            }
            Request::NetIn {
                handle,
                host_port,
                container_port,
            } => {
                let mapping = self
                    .backend
                    .lookup(&handle)?
                    .net_in(host_port, container_port)
                    .await?;
                Response::NetIn {
                    host_port: mapping.host_port,
                    container_port: mapping.container_port,
                }
            }
            Request::NetOut {
                handle,
                network,
                port,
            } => {
                self.backend
                    .lookup(&handle)?
                    .net_out(NetOut { network, port })
                    .await?;
                Response::NetOut {}
            }
            Request::Info { handle } => info_response(self.backend.lookup(&handle)?.info()),
            Request::Run { .. } | Request::Attach { .. } => {
                return Err(CorralError::Internal {
                    message: "streaming request dispatched as a single response".to_string(),
                });
            }
        };
        Ok(response)
    }

    async fn run<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        guard: DrainGuard,
        handle: &str,
        spec: &RunSpec,
    ) -> io::Result<()> {
        let container = match self.backend.lookup(handle) {
            Ok(container) => container,
            Err(e) => return send(writer, &Response::error(e)).await,
        };
        let (job_id, events) = match container.run(spec).await {
            Ok(job) => job,
            Err(e) => return send(writer, &Response::error(e)).await,
        };
        send(
            writer,
            &Response::ProcessPayload(ProcessPayload::started(job_id)),
        )
        .await?;

        drop(guard);
        self.stream(writer, &container, job_id, Attachment::Live(events))
            .await
    }

    async fn attach<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        guard: DrainGuard,
        handle: &str,
        job_id: u32,
    ) -> io::Result<()> {
        let container = match self.backend.lookup(handle) {
            Ok(container) => container,
            Err(e) => return send(writer, &Response::error(e)).await,
        };
        let attachment = match container.attach(job_id).await {
            Ok(attachment) => attachment,
            Err(e) => return send(writer, &Response::error(e)).await,
        };

        drop(guard);
        self.stream(writer, &container, job_id, attachment).await
    }

    /// Forward a job's output. The drain does not count the request while
    /// it waits on the job, only while it writes the final status.
    async fn stream<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        container: &Container,
        job_id: u32,
        attachment: Attachment,
    ) -> io::Result<()> {
        let handle = container.handle().as_str();
        self.bomberman.pause(handle);
        let result = self.forward(writer, container, job_id, attachment).await;
        container.touch();
        self.bomberman.unpause(handle);
        result
    }

    async fn forward<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        container: &Container,
        job_id: u32,
        attachment: Attachment,
    ) -> io::Result<()> {
        let mut events = match attachment {
            Attachment::Completed(status) => return self.finish(writer, Ok(status)).await,
            Attachment::Live(events) => events,
        };
        let mut stopping = self.stopping.subscribe();

        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                () = stopped(&mut stopping) => {
                    debug!(job_id, "Server stopping, ending stream");
                    return Ok(());
                }
            };
            let Some(event) = event else {
                break;
            };
            match event {
                ProcessStream::Output { source, data } => {
                    let source = match source {
                        StreamSource::Stdout => Source::Stdout,
                        StreamSource::Stderr => Source::Stderr,
                    };
                    send(
                        writer,
                        &Response::ProcessPayload(ProcessPayload::output(source, &data)),
                    )
                    .await?;
                }
                ProcessStream::Exit { status } => return self.finish(writer, Ok(status)).await,
            }
        }

        // The stream closed before the exit status arrived; link again.
        let status = tokio::select! {
            status = container.tracker().link(job_id) => status,
            () = stopped(&mut stopping) => return Ok(()),
        };
        self.finish(writer, status).await
    }

    async fn finish<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        status: CorralResult<u32>,
    ) -> io::Result<()> {
        let _guard = self.drain.enter();
        let response = match status {
            Ok(status) => Response::ProcessPayload(ProcessPayload::exited(status)),
            Err(e) => Response::error(e),
        };
        send(writer, &response).await
    }
}

fn info_response(info: ContainerInfo) -> Response {
    let limits = info.limits;
    Response::Info {
        state: info.state.to_string(),
        events: info.events,
        host_ip: info.host_ip,
        container_ip: info.container_ip,
        container_path: info.container_path.display().to_string(),
        process_ids: info.process_ids,
        limits: LimitsInfo {
            memory: limits.memory,
            disk_bytes: limits.disk.map(|disk| disk.byte_limit),
            disk_inodes: limits.disk.map(|disk| disk.inode_limit),
            bandwidth_rate: limits.bandwidth.map(|bandwidth| bandwidth.rate),
            bandwidth_burst: limits.bandwidth.map(|bandwidth| bandwidth.burst),
            cpu_shares: limits.cpu,
        },
        mapped_ports: info
            .mapped_ports
            .iter()
            .map(|mapping| PortMapping {
                host_port: mapping.host_port,
                container_port: mapping.container_port,
            })
            .collect(),
    }
}

async fn stopped(stopping: &mut watch::Receiver<bool>) {
    let _ = stopping.wait_for(|stopping| *stopping).await;
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, response: &Response) -> io::Result<()> {
    writer.write_all(&response.encode()).await?;
    writer.flush().await
}

fn remove_socket(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
