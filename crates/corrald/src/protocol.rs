//! Control protocol messages and their line codec.
//!
//! Every message is one JSON object per line of the form
//! `{"type": "<Kind>", "body": {...}}`. Binary output is base64 encoded.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

/// An environment variable of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    /// Name.
    pub key: String,
    /// Value.
    pub value: String,
}

/// A client request.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum Request {
    Ping {},
    Echo {
        message: String,
    },
    Create {
        #[serde(default)]
        handle: Option<String>,
        /// Seconds; the daemon default when absent.
        #[serde(default)]
        grace_time: Option<u64>,
        #[serde(default)]
        rootfs: Option<String>,
    },
    Destroy {
        handle: String,
    },
    List {},
    Stop {
        handle: String,
        #[serde(default)]
        kill: bool,
        #[serde(default)]
        background: bool,
    },
    CopyIn {
        handle: String,
        src_path: String,
        dst_path: String,
    },
    CopyOut {
        handle: String,
        src_path: String,
        dst_path: String,
        #[serde(default)]
        owner: Option<String>,
    },
    Run {
        handle: String,
        script: String,
        #[serde(default)]
        privileged: bool,
        #[serde(default)]
        env: Vec<EnvVar>,
    },
    Attach {
        handle: String,
        job_id: u32,
    },
    LimitBandwidth {
        handle: String,
        rate: u64,
        burst: u64,
    },
    LimitMemory {
        handle: String,
        #[serde(default)]
        limit_in_bytes: Option<u64>,
    },
    LimitDisk {
        handle: String,
        #[serde(default)]
        byte_limit: Option<u64>,
        #[serde(default)]
        inode_limit: Option<u64>,
    },
    LimitCpu {
        handle: String,
        #[serde(default)]
        limit_in_shares: Option<u64>,
    },
    NetIn {
        handle: String,
        #[serde(default)]
        host_port: Option<u16>,
        #[serde(default)]
        container_port: Option<u16>,
    },
    NetOut {
        handle: String,
        #[serde(default)]
        network: Option<String>,
        #[serde(default)]
        port: Option<u16>,
    },
    Info {
        handle: String,
    },
}

impl Request {
    /// Every request kind the daemon handles.
    pub const KINDS: [&'static str; 17] = [
        "Ping",
        "Echo",
        "Create",
        "Destroy",
        "List",
        "Stop",
        "CopyIn",
        "CopyOut",
        "Run",
        "Attach",
        "LimitBandwidth",
        "LimitMemory",
        "LimitDisk",
        "LimitCpu",
        "NetIn",
        "NetOut",
        "Info",
    ];

    /// Handle of the container the request is about.
    #[must_use]
    pub fn handle(&self) -> Option<&str> {
        match self {
            Self::Ping {} | Self::Echo { .. } | Self::Create { .. } | Self::List {} => None,
            Self::Destroy { handle }
            | Self::Stop { handle, .. }
            | Self::CopyIn { handle, .. }
            | Self::CopyOut { handle, .. }
            | Self::Run { handle, .. }
            | Self::Attach { handle, .. }
            | Self::LimitBandwidth { handle, .. }
            | Self::LimitMemory { handle, .. }
            | Self::LimitDisk { handle, .. }
            | Self::LimitCpu { handle, .. }
            | Self::NetIn { handle, .. }
            | Self::NetOut { handle, .. }
            | Self::Info { handle } => Some(handle),
        }
    }

    /// Decode one line.
    ///
    /// # Errors
    ///
    /// Returns the error message to send back: `unhandled request type`
    /// for kinds the daemon does not know, or a description of what is
    /// wrong with a known kind.
    pub fn decode(line: &str) -> Result<Self, String> {
        let value: serde_json::Value =
            serde_json::from_str(line).map_err(|e| format!("malformed request: {e}"))?;
        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| "malformed request: missing type".to_string())?
            .to_string();
        if !Self::KINDS.contains(&kind.as_str()) {
            return Err(format!("unhandled request type: {kind}"));
        }
        serde_json::from_value(value).map_err(|e| format!("invalid {kind} request: {e}"))
    }
}

/// Which stream a chunk of job output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// One message of a Run or Attach response stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessPayload {
    /// Job id; set on the first payload of a Run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    /// Stream of `data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    /// Base64 output chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Exit status; set on the last payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<u32>,
}

impl ProcessPayload {
    /// Payload announcing a new job.
    #[must_use]
    pub fn started(process_id: u32) -> Self {
        Self {
            process_id: Some(process_id),
            ..Self::default()
        }
    }

    /// Payload carrying output.
    #[must_use]
    pub fn output(source: Source, data: &[u8]) -> Self {
        Self {
            source: Some(source),
            data: Some(STANDARD.encode(data)),
            ..Self::default()
        }
    }

    /// Payload carrying the exit status.
    #[must_use]
    pub fn exited(status: u32) -> Self {
        Self {
            exit_status: Some(status),
            ..Self::default()
        }
    }

    /// Decoded output bytes.
    #[cfg(test)]
    #[must_use]
    pub fn bytes(&self) -> Option<Vec<u8>> {
        self.data.as_ref().and_then(|data| STANDARD.decode(data).ok())
    }
}

/// A mapped port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host port.
    pub host_port: u16,
    /// Container port.
    pub container_port: u16,
}

/// Applied limits as reported by Info.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsInfo {
    /// Memory limit in bytes.
    pub memory: Option<u64>,
    /// Disk byte limit.
    pub disk_bytes: Option<u64>,
    /// Disk inode limit.
    pub disk_inodes: Option<u64>,
    /// Bandwidth rate in bytes per second.
    pub bandwidth_rate: Option<u64>,
    /// Bandwidth burst in bytes.
    pub bandwidth_burst: Option<u64>,
    /// CPU weight.
    pub cpu_shares: Option<u64>,
}

/// A daemon response.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum Response {
    Ping {},
    Echo {
        message: String,
    },
    Create {
        handle: String,
    },
    Destroy {},
    List {
        handles: Vec<String>,
    },
    Stop {},
    CopyIn {},
    CopyOut {},
    ProcessPayload(ProcessPayload),
    LimitBandwidth {
        rate: u64,
        burst: u64,
    },
    LimitMemory {
        limit_in_bytes: Option<u64>,
    },
    LimitDisk {
        byte_limit: Option<u64>,
        inode_limit: Option<u64>,
    },
    LimitCpu {
        limit_in_shares: Option<u64>,
    },
    NetIn {
        host_port: u16,
        container_port: u16,
    },
    NetOut {},
    Info {
        state: String,
        events: Vec<String>,
        host_ip: String,
        container_ip: String,
        container_path: String,
        process_ids: Vec<u32>,
        limits: LimitsInfo,
        mapped_ports: Vec<PortMapping>,
    },
    Error {
        message: String,
    },
}

impl Response {
    /// An error response.
    #[must_use]
    pub fn error(message: impl std::fmt::Display) -> Self {
        Self::Error {
            message: message.to_string(),
        }
    }

    /// Encode as one line, newline included.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut line = serde_json::to_vec(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"Error","body":{{"message":"unencodable response: {e}"}}}}"#)
                .into_bytes()
        });
        line.push(b'\n');
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_known_kinds() {
        assert_eq!(Request::decode(r#"{"type":"Ping","body":{}}"#), Ok(Request::Ping {}));
        assert_eq!(
            Request::decode(r#"{"type":"Run","body":{"handle":"web","script":"ls"}}"#),
            Ok(Request::Run {
                handle: "web".to_string(),
                script: "ls".to_string(),
                privileged: false,
                env: Vec::new(),
            })
        );
        assert_eq!(
            Request::decode(r#"{"type":"Create","body":{"grace_time":5}}"#)
                .unwrap()
                .handle(),
            None
        );
    }

    #[test]
    fn unknown_kinds_are_unhandled() {
        assert_eq!(
            Request::decode(r#"{"type":"Teleport","body":{}}"#),
            Err("unhandled request type: Teleport".to_string())
        );
    }

    #[test]
    fn malformed_requests_explain_themselves() {
        let err = Request::decode(r#"{"type":"Destroy","body":{}}"#).unwrap_err();
        assert!(err.starts_with("invalid Destroy request"), "{err}");
        assert!(Request::decode("not json").unwrap_err().starts_with("malformed request"));
        assert!(Request::decode(r#"{"body":{}}"#).is_err());
    }

    #[test]
    fn every_kind_is_listed() {
        let samples = [
            r#"{"type":"Ping","body":{}}"#,
            r#"{"type":"Echo","body":{"message":"hi"}}"#,
            r#"{"type":"Create","body":{}}"#,
            r#"{"type":"Destroy","body":{"handle":"h"}}"#,
            r#"{"type":"List","body":{}}"#,
            r#"{"type":"Stop","body":{"handle":"h"}}"#,
            r#"{"type":"CopyIn","body":{"handle":"h","src_path":"a","dst_path":"b"}}"#,
            r#"{"type":"CopyOut","body":{"handle":"h","src_path":"a","dst_path":"b"}}"#,
            r#"{"type":"Run","body":{"handle":"h","script":"s"}}"#,
            r#"{"type":"Attach","body":{"handle":"h","job_id":1}}"#,
            r#"{"type":"LimitBandwidth","body":{"handle":"h","rate":1,"burst":1}}"#,
            r#"{"type":"LimitMemory","body":{"handle":"h"}}"#,
            r#"{"type":"LimitDisk","body":{"handle":"h"}}"#,
            r#"{"type":"LimitCpu","body":{"handle":"h"}}"#,
            r#"{"type":"NetIn","body":{"handle":"h"}}"#,
            r#"{"type":"NetOut","body":{"handle":"h"}}"#,
            r#"{"type":"Info","body":{"handle":"h"}}"#,
        ];
        for sample in samples {
            assert!(Request::decode(sample).is_ok(), "{sample}");
        }
        assert_eq!(samples.len(), Request::KINDS.len());
    }

    #[test]
    fn payload_encoding() {
        let line = Response::ProcessPayload(ProcessPayload::output(Source::Stderr, b"\xffoops"))
            .encode();
        let text = std::str::from_utf8(&line).unwrap();
        assert!(text.ends_with('\n'));
        assert!(text.contains(r#""type":"ProcessPayload""#));
        assert!(!text.contains("process_id"));

        let Response::ProcessPayload(payload) = serde_json::from_str(text.trim()).unwrap() else {
            panic!("expected a payload");
        };
        assert_eq!(payload.bytes().unwrap(), b"\xffoops");
        assert_eq!(payload.source, Some(Source::Stderr));
    }
}
