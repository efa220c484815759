//! Client side of the control socket.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use corral_common::{CorralError, CorralResult};

use super::control::{ExecFrame, ExecRequest};

/// Run a command through the control socket at `socket`.
///
/// `stdin` is streamed to the command on a background thread; output is
/// written to `stdout` and `stderr` as it arrives. Returns the command's
/// exit status.
///
/// # Errors
///
/// Returns an error if the socket cannot be reached, the daemon reports
/// that the command could not be run, or the connection ends before an
/// exit status arrives.
pub fn exec(
    socket: &Path,
    request: &ExecRequest,
    mut stdin: impl Read + Send + 'static,
    stdout: &mut impl Write,
    stderr: &mut impl Write,
) -> CorralResult<i32> {
    let mut stream = UnixStream::connect(socket)?;

    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');
    stream.write_all(&line)?;

    let mut input = stream.try_clone()?;
    thread::spawn(move || {
        let _ = std::io::copy(&mut stdin, &mut input);
        let _ = input.shutdown(Shutdown::Write);
    });

    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<ExecFrame>(&line)? {
            ExecFrame::Stdout { data } => {
                stdout.write_all(&decode(&data)?)?;
                stdout.flush()?;
            }
            ExecFrame::Stderr { data } => {
                stderr.write_all(&decode(&data)?)?;
                stderr.flush()?;
            }
            ExecFrame::Exit { status } => return Ok(status),
            ExecFrame::Error { message } => return Err(CorralError::Launch { message }),
        }
    }

    Err(CorralError::Internal {
        message: "control connection closed before exit status".to_string(),
    })
}

fn decode(data: &str) -> CorralResult<Vec<u8>> {
    STANDARD
        .decode(data)
        .map_err(|e| CorralError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::control::ControlDaemon;

    fn daemon() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ctl.sock");
        ControlDaemon::bind(&socket).unwrap().start().unwrap();
        (dir, socket)
    }

    fn sh(script: &str) -> ExecRequest {
        ExecRequest {
            argv: vec!["/bin/sh".into(), "-c".into(), script.into()],
            ..ExecRequest::default()
        }
    }

    #[test]
    fn relays_output_and_status() {
        let (_dir, socket) = daemon();
        let (mut out, mut err) = (Vec::new(), Vec::new());

        let status = exec(
            &socket,
            &sh("echo out; echo err >&2; exit 3"),
            std::io::empty(),
            &mut out,
            &mut err,
        )
        .unwrap();

        assert_eq!(status, 3);
        assert_eq!(out, b"out\n");
        assert_eq!(err, b"err\n");
    }

    #[test]
    fn streams_stdin() {
        let (_dir, socket) = daemon();
        let mut out = Vec::new();

        let status = exec(
            &socket,
            &sh("cat"),
            std::io::Cursor::new(b"piped input".to_vec()),
            &mut out,
            &mut std::io::sink(),
        )
        .unwrap();

        assert_eq!(status, 0);
        assert_eq!(out, b"piped input");
    }

    #[test]
    fn passes_environment_and_dir() {
        let (dir, socket) = daemon();
        let mut out = Vec::new();
        let mut request = sh("echo \"$GREETING\"; pwd");
        request.env.insert("GREETING".into(), "hello".into());
        request.dir = Some(dir.path().to_path_buf());

        exec(&socket, &request, std::io::empty(), &mut out, &mut std::io::sink()).unwrap();

        let expected = format!("hello\n{}\n", dir.path().canonicalize().unwrap().display());
        assert_eq!(String::from_utf8(out).unwrap(), expected);
    }

    #[test]
    fn missing_program_is_an_error() {
        let (_dir, socket) = daemon();
        let request = ExecRequest {
            argv: vec!["/does/not/exist".into()],
            ..ExecRequest::default()
        };

        let err = exec(
            &socket,
            &request,
            std::io::empty(),
            &mut std::io::sink(),
            &mut std::io::sink(),
        )
        .unwrap_err();
        assert!(matches!(err, CorralError::Launch { .. }));
    }
}
