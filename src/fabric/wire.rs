//! JSON wire envelope for the five-channel fabric.
//!
//! Every frame is a single JSON document. The shapes are fixed by the
//! protocol and are not uniform (heartbeats are single-purpose objects,
//! file lists are arrays of single-key maps), so decoding is shape-directed
//! rather than a blanket enum derive. A frame is only accepted on a channel
//! that can carry its variant; anything else is an "invalid context"
//! protocol error.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{GridError, Result};

/// Pseudo-key under which the file service hands out the shared grading
/// harness directory.
pub const COMMON_KEY: &str = "common";

/// Which logical channel a frame was read from.
///
/// Publisher/subscriber carry heartbeats, pusher/puller carry test specs,
/// the request direction of every responder carries worker requests, and
/// the reply direction carries file lists (also used as the empty ACK).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Heartbeat,
    Work,
    Request,
    Reply,
}

impl Channel {
    fn name(self) -> &'static str {
        match self {
            Channel::Heartbeat => "heartbeat",
            Channel::Work => "work",
            Channel::Request => "request",
            Channel::Reply => "reply",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Commander -> workers broadcast: current POSIX time and the
    /// termination flag.
    Heartbeat { time: f64, done: bool },
    /// Worker -> commander: self-reported public IP.
    HeartbeatResp { ip: String },
    /// Commander -> one worker: one assignment to execute.
    TestSpec {
        key: String,
        timeout: u32,
        commands: Vec<String>,
    },
    /// Worker -> commander: request the files for `key`, or for the shared
    /// harness under the pseudo-key "common".
    FileReq { key: String },
    /// Commander -> worker reply: ordered `(relative path, base64)` pairs.
    /// An empty list doubles as the generic ACK.
    Files { entries: Vec<(String, String)> },
    /// Worker -> commander: base64 transcript for a finished assignment.
    TestCompletion { key: String, results: String },
}

#[derive(Serialize, Deserialize)]
struct HeartbeatWire {
    heartbeat: f64,
    done: bool,
}

#[derive(Serialize, Deserialize)]
struct HeartbeatRespWire {
    heartbeat_resp: String,
}

#[derive(Serialize, Deserialize)]
struct TestSpecWire {
    key: String,
    timeout: u32,
    commands: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct FileReqWire {
    files: String,
}

#[derive(Serialize, Deserialize)]
struct TestCompletionWire {
    netid: String,
    results: String,
}

impl Message {
    /// The empty `Files` list used as the ACK on every reply channel.
    pub fn ack() -> Self {
        Message::Files {
            entries: Vec::new(),
        }
    }

    fn variant_name(&self) -> &'static str {
        match self {
            Message::Heartbeat { .. } => "Heartbeat",
            Message::HeartbeatResp { .. } => "HeartbeatResp",
            Message::TestSpec { .. } => "TestSpec",
            Message::FileReq { .. } => "FileReq",
            Message::Files { .. } => "Files",
            Message::TestCompletion { .. } => "TestCompletion",
        }
    }

    fn carried_on(&self, channel: Channel) -> bool {
        match self {
            Message::Heartbeat { .. } => channel == Channel::Heartbeat,
            Message::TestSpec { .. } => channel == Channel::Work,
            Message::HeartbeatResp { .. }
            | Message::FileReq { .. }
            | Message::TestCompletion { .. } => channel == Channel::Request,
            Message::Files { .. } => channel == Channel::Reply,
        }
    }

    pub fn encode(&self) -> Value {
        match self {
            Message::Heartbeat { time, done } => json!({ "heartbeat": time, "done": done }),
            Message::HeartbeatResp { ip } => json!({ "heartbeat_resp": ip }),
            Message::TestSpec {
                key,
                timeout,
                commands,
            } => json!({ "key": key, "timeout": timeout, "commands": commands }),
            Message::FileReq { key } => json!({ "files": key }),
            Message::Files { entries } => Value::Array(
                entries
                    .iter()
                    .map(|(path, payload)| {
                        let mut entry = Map::new();
                        entry.insert(path.clone(), Value::String(payload.clone()));
                        Value::Object(entry)
                    })
                    .collect(),
            ),
            Message::TestCompletion { key, results } => {
                json!({ "netid": key, "results": results })
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // The envelope shapes above always serialize.
        serde_json::to_vec(&self.encode()).unwrap_or_default()
    }

    /// Decode a frame read from `channel`. Fails with a protocol error when
    /// the bytes are not a recognized envelope, or when the variant cannot
    /// travel on that channel.
    pub fn decode(bytes: &[u8], channel: Channel) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| GridError::Protocol(format!("malformed frame: {e}")))?;
        let message = Self::from_value(value)?;
        if !message.carried_on(channel) {
            return Err(GridError::invalid_context(
                message.variant_name(),
                channel.name(),
            ));
        }
        Ok(message)
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Array(items) => {
                let mut entries = Vec::with_capacity(items.len());
                for item in items {
                    let Value::Object(map) = item else {
                        return Err(GridError::Protocol(
                            "file list entry is not an object".to_string(),
                        ));
                    };
                    entries.push(file_entry(map)?);
                }
                Ok(Message::Files { entries })
            }
            Value::Object(map) => {
                if map.contains_key("heartbeat") {
                    let wire: HeartbeatWire = from_map(map)?;
                    Ok(Message::Heartbeat {
                        time: wire.heartbeat,
                        done: wire.done,
                    })
                } else if map.contains_key("heartbeat_resp") {
                    let wire: HeartbeatRespWire = from_map(map)?;
                    Ok(Message::HeartbeatResp {
                        ip: wire.heartbeat_resp,
                    })
                } else if map.contains_key("files") {
                    let wire: FileReqWire = from_map(map)?;
                    Ok(Message::FileReq { key: wire.files })
                } else if map.contains_key("netid") {
                    let wire: TestCompletionWire = from_map(map)?;
                    Ok(Message::TestCompletion {
                        key: wire.netid,
                        results: wire.results,
                    })
                } else if map.contains_key("key") {
                    let wire: TestSpecWire = from_map(map)?;
                    Ok(Message::TestSpec {
                        key: wire.key,
                        timeout: wire.timeout,
                        commands: wire.commands,
                    })
                } else {
                    Err(GridError::Protocol(
                        "unrecognized message variant".to_string(),
                    ))
                }
            }
            _ => Err(GridError::Protocol(
                "frame is neither object nor array".to_string(),
            )),
        }
    }
}

fn file_entry(map: Map<String, Value>) -> Result<(String, String)> {
    if map.len() != 1 {
        return Err(GridError::Protocol(
            "file list entry must have exactly one key".to_string(),
        ));
    }
    let (path, payload) = map.into_iter().next().unwrap_or_default();
    let Value::String(payload) = payload else {
        return Err(GridError::Protocol(
            "file payload is not a base64 string".to_string(),
        ));
    };
    Ok((path, payload))
}

fn from_map<T: serde::de::DeserializeOwned>(map: Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(map))
        .map_err(|e| GridError::Protocol(format!("bad envelope: {e}")))
}
