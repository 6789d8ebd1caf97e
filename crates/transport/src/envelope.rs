//! Wire envelopes for the streaming driver.
//!
//! Frames are length-delimited JSON objects tagged with a `type` field; the
//! tag plays the role of a protobuf oneof discriminator. Unknown inbound
//! types are surfaced as [`DecodedFrame::Unknown`] so the driver can log and
//! drop them without tearing the stream down.

use std::io::{Read, Write};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use drover_core::models::{
    ControlMessage, Heartbeat, LogEntry, OsInfo, TaskDispatch, TaskResult, TaskStatusUpdate,
};

/// Log batches whose serialized size exceeds this are gzip-packed.
pub const COMPRESS_THRESHOLD: usize = 1024;

/// Frames the node sends to the Master.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeFrame {
    /// Registration handshake, first frame on every connection.
    Register {
        /// Node identity.
        node_id: String,
        /// API key.
        api_key: String,
        /// Stable machine identity.
        machine_code: String,
        /// Host description.
        os_info: OsInfo,
    },
    /// Liveness heartbeat.
    Heartbeat {
        /// The heartbeat payload.
        heartbeat: Heartbeat,
    },
    /// A batch of log lines; `packed` carries base64(gzip(json)) when
    /// `compressed` is set, and `entries` is empty in that case.
    LogBatch {
        /// Plain entries (empty when compressed).
        #[serde(default)]
        entries: Vec<LogEntry>,
        /// Whether `packed` is in use.
        #[serde(default)]
        compressed: bool,
        /// Opaque compressed payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        packed: Option<String>,
    },
    /// Run status update.
    TaskStatus {
        /// The status payload.
        status: TaskStatusUpdate,
    },
    /// Terminal report for a run.
    TaskResult {
        /// The report payload.
        result: TaskResult,
    },
    /// Dispatch acknowledgement.
    TaskAck {
        /// Task being acknowledged.
        task_id: String,
        /// Whether the node accepted it.
        accepted: bool,
        /// Rejection reason, when not accepted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Cancel acknowledgement.
    CancelAck {
        /// Task being acknowledged.
        task_id: String,
        /// Whether the cancel took effect.
        ok: bool,
        /// Failure reason, when it did not.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Claim acknowledgement for a polled task receipt.
    ReceiptAck {
        /// The receipt being consumed.
        receipt: String,
        /// Whether the task was accepted.
        accepted: bool,
    },
    /// Consumption acknowledgement for a control receipt.
    ControlAck {
        /// The receipt being consumed.
        receipt: String,
    },
    /// Answer to a runtime-manage request.
    ControlResult {
        /// Request being answered.
        request_id: String,
        /// Reply stream named by the request.
        reply_stream: String,
        /// Whether the action succeeded.
        success: bool,
        /// Action result on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        /// Error description on failure.
        #[serde(default)]
        error: String,
    },
    /// Reply to a Master ping.
    Pong,
}

/// Frames the Master sends to the node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MasterFrame {
    /// Registration accepted.
    RegisterAck {
        /// Whether registration succeeded.
        ok: bool,
        /// Heartbeat cadence the Master wants, in seconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        heartbeat_interval: Option<u64>,
        /// Rejection reason.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// A task to run.
    TaskDispatch {
        /// The task message.
        task: TaskDispatch,
    },
    /// Cancel a running or queued task.
    TaskCancel {
        /// Task to cancel.
        task_id: String,
        /// Run to cancel, when the Master knows it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
        /// Operator-supplied reason.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Resource/concurrency configuration change.
    ConfigUpdate {
        /// Recognized keys: `max_concurrent_tasks`, `task_memory_limit_mb`,
        /// `task_cpu_time_limit_sec`.
        payload: serde_json::Value,
    },
    /// Generic control message (runtime-manage and friends).
    Control {
        /// The control payload.
        control: ControlMessage,
    },
    /// Liveness probe; the node answers with [`NodeFrame::Pong`].
    Ping,
}

/// Result of decoding one inbound frame.
#[derive(Debug)]
pub enum DecodedFrame {
    /// A recognized frame.
    Frame(MasterFrame),
    /// Valid JSON with an unrecognized `type`; log and drop.
    Unknown(String),
}

/// Encode a node frame to its wire bytes.
pub fn encode_node_frame(frame: &NodeFrame) -> Vec<u8> {
    // Frames are plain data; serialization cannot fail on them.
    serde_json::to_vec(frame).unwrap_or_default()
}

/// Decode an inbound frame, distinguishing unknown types from garbage.
pub fn decode_master_frame(bytes: &[u8]) -> Result<DecodedFrame, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    match serde_json::from_value::<MasterFrame>(value.clone()) {
        Ok(frame) => Ok(DecodedFrame::Frame(frame)),
        Err(err) => {
            let kind = value
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("<missing>")
                .to_string();
            match kind.as_str() {
                // A known tag that failed to parse is a real error.
                "register_ack" | "task_dispatch" | "task_cancel" | "config_update" | "control"
                | "ping" => Err(err),
                _ => Ok(DecodedFrame::Unknown(kind)),
            }
        }
    }
}

/// Build a log-batch frame, gzip-packing it above [`COMPRESS_THRESHOLD`].
pub fn log_batch_frame(entries: Vec<LogEntry>) -> NodeFrame {
    let serialized = serde_json::to_vec(&entries).unwrap_or_default();
    if serialized.len() <= COMPRESS_THRESHOLD {
        return NodeFrame::LogBatch {
            entries,
            compressed: false,
            packed: None,
        };
    }

    match gzip(&serialized) {
        Ok(packed) => NodeFrame::LogBatch {
            entries: Vec::new(),
            compressed: true,
            packed: Some(B64.encode(packed)),
        },
        Err(_) => NodeFrame::LogBatch {
            entries,
            compressed: false,
            packed: None,
        },
    }
}

/// Recover the entries of a log-batch frame, unpacking when compressed.
pub fn unpack_log_batch(frame: &NodeFrame) -> Option<Vec<LogEntry>> {
    let NodeFrame::LogBatch {
        entries,
        compressed,
        packed,
    } = frame
    else {
        return None;
    };

    if !compressed {
        return Some(entries.clone());
    }
    let packed = packed.as_deref()?;
    let raw = B64.decode(packed).ok()?;
    let json = gunzip(&raw).ok()?;
    serde_json::from_slice(&json).ok()
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::models::LogKind;

    fn entries(n: usize, content: &str) -> Vec<LogEntry> {
        (0..n)
            .map(|_| LogEntry::new("r1", LogKind::Stdout, content))
            .collect()
    }

    #[test]
    fn frames_round_trip() {
        let frame = NodeFrame::TaskAck {
            task_id: "t1".to_string(),
            accepted: true,
            reason: None,
        };
        let bytes = encode_node_frame(&frame);
        let parsed: NodeFrame = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn small_batches_stay_plain() {
        let frame = log_batch_frame(entries(1, "hi"));
        match &frame {
            NodeFrame::LogBatch {
                entries,
                compressed,
                packed,
            } => {
                assert_eq!(entries.len(), 1);
                assert!(!compressed);
                assert!(packed.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(unpack_log_batch(&frame).unwrap().len(), 1);
    }

    #[test]
    fn large_batches_are_packed_and_recoverable() {
        let original = entries(100, &"x".repeat(200));
        let frame = log_batch_frame(original.clone());
        match &frame {
            NodeFrame::LogBatch {
                entries,
                compressed,
                packed,
            } => {
                assert!(entries.is_empty());
                assert!(compressed);
                assert!(packed.is_some());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(unpack_log_batch(&frame).unwrap(), original);
    }

    #[test]
    fn unknown_types_are_reported_not_fatal() {
        let decoded = decode_master_frame(br#"{"type":"telemetry_probe","x":1}"#).unwrap();
        match decoded {
            DecodedFrame::Unknown(kind) => assert_eq!(kind, "telemetry_probe"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(decode_master_frame(b"not json").is_err());
    }

    #[test]
    fn known_type_with_bad_body_is_an_error() {
        assert!(decode_master_frame(br#"{"type":"task_dispatch"}"#).is_err());
    }
}
