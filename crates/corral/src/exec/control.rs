//! In-container control daemon.
//!
//! The resident init binds a unix socket inside the container's run
//! directory and executes commands on behalf of [`client`](super::client)
//! connections. Each connection carries one command:
//!
//! 1. the client sends an [`ExecRequest`] as one JSON line,
//! 2. every further byte from the client is fed to the command's stdin,
//!    until the client half-closes,
//! 3. the daemon answers with [`ExecFrame`] JSON lines, ending with
//!    [`ExecFrame::Exit`] or [`ExecFrame::Error`].

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use corral_common::{CorralError, CorralResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const CHUNK_SIZE: usize = 32 * 1024;

/// A command to execute inside the container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Program and arguments.
    pub argv: Vec<String>,
    /// Environment; `PATH` defaults to the standard search path.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// User (and group) id to run as.
    #[serde(default)]
    pub uid: Option<u32>,
}

/// A frame sent back to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ExecFrame {
    /// Base64-encoded stdout bytes.
    Stdout {
        /// Encoded bytes.
        data: String,
    },
    /// Base64-encoded stderr bytes.
    Stderr {
        /// Encoded bytes.
        data: String,
    },
    /// The command exited.
    Exit {
        /// Exit code, or 128 + signal number.
        status: i32,
    },
    /// The command could not be run.
    Error {
        /// What went wrong.
        message: String,
    },
}

impl ExecFrame {
    /// Encode an output chunk.
    #[must_use]
    pub fn stdout(bytes: &[u8]) -> Self {
        Self::Stdout {
            data: STANDARD.encode(bytes),
        }
    }

    /// Encode an error-output chunk.
    #[must_use]
    pub fn stderr(bytes: &[u8]) -> Self {
        Self::Stderr {
            data: STANDARD.encode(bytes),
        }
    }
}

/// Convert an exit status to the shell convention.
#[must_use]
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(255)
}

/// The control daemon's listening socket.
#[derive(Debug)]
pub struct ControlDaemon {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlDaemon {
    /// Bind the control socket, replacing a stale one.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub fn bind(path: impl Into<PathBuf>) -> CorralResult<Self> {
        let path = path.into();
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(&path)?;
        tracing::debug!(path = %path.display(), "Control socket bound");
        Ok(Self { listener, path })
    }

    /// Socket path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve connections on a background thread, one thread per connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the accept thread cannot be started.
    pub fn start(self) -> CorralResult<thread::JoinHandle<()>> {
        let handle = thread::Builder::new()
            .name("corral-control".to_string())
            .spawn(move || {
                for stream in self.listener.incoming() {
                    match stream {
                        Ok(stream) => {
                            let spawned = thread::Builder::new()
                                .name("corral-exec".to_string())
                                .spawn(move || {
                                    if let Err(e) = handle_connection(stream) {
                                        tracing::warn!(error = %e, "Control connection failed");
                                    }
                                });
                            if let Err(e) = spawned {
                                tracing::warn!(error = %e, "Failed to start connection handler");
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Failed to accept control connection"),
                    }
                }
            })?;
        Ok(handle)
    }
}

type SharedWriter = Arc<Mutex<UnixStream>>;

fn send(writer: &SharedWriter, frame: &ExecFrame) -> CorralResult<()> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    let mut stream = writer.lock();
    stream.write_all(&line)?;
    stream.flush()?;
    Ok(())
}

fn handle_connection(stream: UnixStream) -> CorralResult<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let writer: SharedWriter = Arc::new(Mutex::new(stream));

    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(());
    }
    let request: ExecRequest = serde_json::from_str(&line)?;

    let mut child = match command(&request).and_then(|mut cmd| Ok(cmd.spawn()?)) {
        Ok(child) => child,
        Err(e) => {
            return send(
                &writer,
                &ExecFrame::Error {
                    message: e.to_string(),
                },
            );
        }
    };
    tracing::debug!(argv = ?request.argv, pid = child.id(), "Executing command");

    if let Some(mut stdin) = child.stdin.take() {
        thread::spawn(move || {
            let _ = std::io::copy(&mut reader, &mut stdin);
        });
    }

    let pumps: Vec<_> = [
        child
            .stdout
            .take()
            .map(|out| pump(out, Arc::clone(&writer), ExecFrame::stdout)),
        child
            .stderr
            .take()
            .map(|err| pump(err, Arc::clone(&writer), ExecFrame::stderr)),
    ]
    .into_iter()
    .flatten()
    .collect();

    for pump in pumps {
        let _ = pump.join();
    }

    let status = exit_code(child.wait()?);
    send(&writer, &ExecFrame::Exit { status })
}

fn command(request: &ExecRequest) -> CorralResult<Command> {
    let (program, args) = request
        .argv
        .split_first()
        .ok_or_else(|| CorralError::Config {
            message: "no command specified".to_string(),
        })?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .env_clear()
        .env("PATH", DEFAULT_PATH)
        .envs(&request.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(dir) = &request.dir {
        cmd.current_dir(dir);
    }
    if let Some(uid) = request.uid {
        cmd.uid(uid).gid(uid);
    }

    Ok(cmd)
}

fn pump(
    mut source: impl Read + Send + 'static,
    writer: SharedWriter,
    frame: fn(&[u8]) -> ExecFrame,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            match source.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if send(&writer, &frame(&buf[..n])).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_wire_format() {
        let frame = ExecFrame::stdout(b"hi\n");
        assert_eq!(
            serde_json::to_string(&frame).unwrap(),
            r#"{"frame":"stdout","data":"aGkK"}"#
        );
        assert_eq!(
            serde_json::to_string(&ExecFrame::Exit { status: 3 }).unwrap(),
            r#"{"frame":"exit","status":3}"#
        );
    }

    #[test]
    fn request_defaults() {
        let request: ExecRequest = serde_json::from_str(r#"{"argv":["ls"]}"#).unwrap();
        assert_eq!(request.argv, vec!["ls"]);
        assert!(request.env.is_empty());
        assert_eq!(request.uid, None);
    }

    #[test]
    fn empty_argv_rejected() {
        assert!(command(&ExecRequest::default()).is_err());
    }

    #[test]
    fn exit_code_from_signal() {
        let status = ExitStatus::from_raw(9);
        assert_eq!(exit_code(status), 137);
        let status = ExitStatus::from_raw(2 << 8);
        assert_eq!(exit_code(status), 2);
    }
}
