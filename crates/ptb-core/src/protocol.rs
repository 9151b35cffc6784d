use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::Application;

/// Maximum size of a single frame; guards against a runaway peer.
const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// A complete, self-delimiting JSON object terminated by `\n`. Concatenated
/// frames look like `{...}\n{...}\n` on the wire — the boundary between two
/// frames is the `}\n{` the spec describes; scanning for the terminating
/// `\n` finds exactly that boundary without needing a length prefix.
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder { buf: Vec::new() }
    }

    /// Buffer newly read bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame, if the buffer holds one. Leaves any
    /// remainder (a partial frame, or further complete frames) buffered.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buf.len() > MAX_FRAME_SIZE {
            anyhow::bail!("frame buffer exceeded {} bytes without a terminator", MAX_FRAME_SIZE);
        }
        match self.buf.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let frame = self.buf[..pos].to_vec();
                self.buf.drain(..=pos);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

/// Read one complete frame from an async byte stream, feeding the decoder
/// until a terminator appears. Returns `Ok(None)` on clean EOF between frames.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
) -> Result<Option<Vec<u8>>> {
    loop {
        if let Some(frame) = decoder.next_frame()? {
            return Ok(Some(frame));
        }
        let mut chunk = [0u8; 4096];
        let n = reader
            .read(&mut chunk)
            .await
            .context("reading control protocol frame")?;
        if n == 0 {
            return Ok(None);
        }
        decoder.feed(&chunk[..n]);
    }
}

/// Write one frame (a JSON object followed by `\n`) to an async byte stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
    writer.write_all(data).await.context("writing frame body")?;
    writer.write_all(b"\n").await.context("writing frame terminator")?;
    writer.flush().await.context("flushing frame")?;
    Ok(())
}

/// Reported terminal state of a single Application, carried in
/// `apps_extended_status`. Distinct from the Instance lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppExecutionState {
    ExecutionStarted,
    ExecutionFinished,
    ExecutionFailed,
    NeverStarted,
}

/// Downstream (Agent → Controller) message kinds (§4.4). `name` is always
/// present on the wire; it is carried in the enclosing [`Downstream`] envelope
/// rather than duplicated into every variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DownstreamMessage {
    Started,
    Initialized,
    AppsInstalled,
    AppsDone,
    AppsFailed,
    AppsExtendedStatus {
        app_name: String,
        state: AppExecutionState,
    },
    DataPoint {
        measurement: String,
        #[serde(default)]
        tags: HashMap<String, String>,
        points: serde_json::Value,
    },
    MsgInfo {
        message: String,
    },
    MsgSuccess {
        message: String,
    },
    MsgWarning {
        message: String,
    },
    MsgError {
        message: String,
    },
    MsgDebug {
        message: String,
    },
    CopiedFile {
        proc_id: String,
    },
    Finished,
    Failed {
        reason: String,
    },
}

/// Full downstream envelope: every message carries the Instance's FQDN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Downstream {
    pub name: String,
    #[serde(flatten)]
    pub message: DownstreamMessage,
}

/// Upstream (Controller → Agent) message kinds (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpstreamMessage {
    Initialize {
        #[serde(default)]
        script: Option<String>,
        #[serde(default)]
        environment: HashMap<String, String>,
        #[serde(default)]
        snapshot_requested: bool,
    },
    InstallApps {
        applications: Vec<Application>,
    },
    RunApps {
        t0: String,
        tcurrent: String,
    },
    ApplicationStatus {
        app_name: String,
        at: crate::config::DependencyAt,
    },
    Copy {
        source: String,
        target: String,
        proc_id: String,
        #[serde(default)]
        rename: Option<String>,
    },
    Finish {
        #[serde(default)]
        preserve_files: Vec<String>,
        #[serde(default = "default_true")]
        do_preserve: bool,
    },
    Null,
}

fn default_true() -> bool {
    true
}

/// Full upstream envelope: every message carries the target Instance's FQDN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upstream {
    pub name: String,
    #[serde(flatten)]
    pub message: UpstreamMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_downstream(msg: DownstreamMessage) -> Downstream {
        let env = Downstream {
            name: "alice".to_string(),
            message: msg,
        };
        let json = serde_json::to_string(&env).unwrap();
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn test_downstream_started_roundtrip() {
        let env = roundtrip_downstream(DownstreamMessage::Started);
        assert_eq!(env.name, "alice");
        assert!(matches!(env.message, DownstreamMessage::Started));
    }

    #[test]
    fn test_downstream_data_point_roundtrip() {
        let msg = DownstreamMessage::DataPoint {
            measurement: "ping".to_string(),
            tags: HashMap::new(),
            points: serde_json::json!({"rtt": 1.2, "icmp_seq": 3}),
        };
        let env = roundtrip_downstream(msg);
        match env.message {
            DownstreamMessage::DataPoint { measurement, .. } => assert_eq!(measurement, "ping"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_downstream_apps_extended_status_roundtrip() {
        let msg = DownstreamMessage::AppsExtendedStatus {
            app_name: "ping1".to_string(),
            state: AppExecutionState::ExecutionFinished,
        };
        let env = roundtrip_downstream(msg);
        match env.message {
            DownstreamMessage::AppsExtendedStatus { app_name, state } => {
                assert_eq!(app_name, "ping1");
                assert_eq!(state, AppExecutionState::ExecutionFinished);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_downstream_wire_tag_is_snake_case() {
        let env = Downstream {
            name: "alice".to_string(),
            message: DownstreamMessage::AppsInstalled,
        };
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"status\":\"apps_installed\""));
        assert!(json.contains("\"name\":\"alice\""));
    }

    fn roundtrip_upstream(msg: UpstreamMessage) -> Upstream {
        let env = Upstream {
            name: "alice".to_string(),
            message: msg,
        };
        let json = serde_json::to_string(&env).unwrap();
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn test_upstream_initialize_roundtrip() {
        let msg = UpstreamMessage::Initialize {
            script: Some("setup.sh".to_string()),
            environment: HashMap::new(),
            snapshot_requested: true,
        };
        let env = roundtrip_upstream(msg);
        match env.message {
            UpstreamMessage::Initialize {
                script,
                snapshot_requested,
                ..
            } => {
                assert_eq!(script.as_deref(), Some("setup.sh"));
                assert!(snapshot_requested);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_upstream_finish_default_do_preserve() {
        let json = r#"{"name":"alice","status":"finish"}"#;
        let env: Upstream = serde_json::from_str(json).unwrap();
        match env.message {
            UpstreamMessage::Finish {
                do_preserve,
                preserve_files,
            } => {
                assert!(do_preserve);
                assert!(preserve_files.is_empty());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_upstream_install_apps_tag() {
        let msg = UpstreamMessage::InstallApps {
            applications: vec![],
        };
        let json = serde_json::to_string(&Upstream {
            name: "alice".to_string(),
            message: msg,
        })
        .unwrap();
        assert!(json.contains("\"status\":\"install_apps\""));
    }

    #[test]
    fn test_upstream_null_liveness_probe() {
        let env = roundtrip_upstream(UpstreamMessage::Null);
        assert!(matches!(env.message, UpstreamMessage::Null));
    }

    #[tokio::test]
    async fn test_frame_roundtrip_single() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"{\"a\":1}").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let mut decoder = FrameDecoder::new();
        let frame = read_frame(&mut cursor, &mut decoder).await.unwrap().unwrap();
        assert_eq!(frame, b"{\"a\":1}");
    }

    #[tokio::test]
    async fn test_frame_roundtrip_multiple_concatenated() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"{\"a\":1}").await.unwrap();
        write_frame(&mut buf, b"{\"b\":2}").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let mut decoder = FrameDecoder::new();
        let first = read_frame(&mut cursor, &mut decoder).await.unwrap().unwrap();
        let second = read_frame(&mut cursor, &mut decoder).await.unwrap().unwrap();
        assert_eq!(first, b"{\"a\":1}");
        assert_eq!(second, b"{\"b\":2}");
    }

    #[test]
    fn test_decoder_tolerates_partial_feed() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"{\"a\":");
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.feed(b"1}\n");
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame, b"{\"a\":1}");
    }
}
