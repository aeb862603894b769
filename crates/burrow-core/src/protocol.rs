//! Request and response bodies
//!
//! These travel as JSON in the encoded segment of a frame (see
//! [`crate::codec`]). File contents never go through JSON; they ride in the
//! binary segment.

use serde::{Deserialize, Serialize};

use crate::types::{DirEntry, FileStat};

/// File-system operations an editor client can request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum FsRequest {
    Stat {
        uri: String,
    },
    ReadDirectory {
        uri: String,
    },
    ReadFile {
        uri: String,
    },
    /// Contents are carried in the frame's binary segment
    WriteFile {
        uri: String,
        #[serde(default = "default_true")]
        create: bool,
        #[serde(default = "default_true")]
        overwrite: bool,
    },
    /// Create an empty file
    Create {
        uri: String,
        #[serde(default)]
        overwrite: bool,
    },
    Delete {
        uri: String,
        #[serde(default)]
        recursive: bool,
    },
    Rename {
        from: String,
        to: String,
        #[serde(default)]
        overwrite: bool,
    },
    Mkdir {
        uri: String,
    },
}

fn default_true() -> bool {
    true
}

impl FsRequest {
    /// Operation name, for logging
    pub fn op_name(&self) -> &'static str {
        match self {
            FsRequest::Stat { .. } => "stat",
            FsRequest::ReadDirectory { .. } => "readDirectory",
            FsRequest::ReadFile { .. } => "readFile",
            FsRequest::WriteFile { .. } => "writeFile",
            FsRequest::Create { .. } => "create",
            FsRequest::Delete { .. } => "delete",
            FsRequest::Rename { .. } => "rename",
            FsRequest::Mkdir { .. } => "mkdir",
        }
    }

    /// Whether the request expects file contents in the binary segment
    pub fn expects_binary(&self) -> bool {
        matches!(self, FsRequest::WriteFile { .. })
    }
}

/// Successful result bodies
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum FsResponse {
    Stat { stat: FileStat },
    Entries { entries: Vec<DirEntry> },
    /// File contents follow in the binary segment
    Content { size: u64 },
    Done,
}

/// Control-channel messages (frame type `control`)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "control", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    Hello {
        protocol_version: u32,
        #[serde(default)]
        client_name: Option<String>,
    },
    Ping {
        timestamp: u64,
    },
}

/// Reply bodies for control messages
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "control", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ControlReply {
    Hello(ServerInfo),
    Pong {
        client_timestamp: u64,
        server_timestamp: u64,
    },
}

/// Handshake information returned for `hello`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub protocol_version: u32,
    pub host_name: String,
    pub capabilities: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_json_shape() {
        let req = FsRequest::WriteFile {
            uri: "burrow://t/a.txt".into(),
            create: true,
            overwrite: false,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["op"], "writeFile");
        assert_eq!(json["overwrite"], false);
    }

    #[test]
    fn test_write_flags_default_to_true() {
        let req: FsRequest =
            serde_json::from_str(r#"{"op":"writeFile","uri":"burrow://t/a"}"#).unwrap();
        assert_eq!(
            req,
            FsRequest::WriteFile {
                uri: "burrow://t/a".into(),
                create: true,
                overwrite: true
            }
        );
        assert!(req.expects_binary());
    }

    #[test]
    fn test_unknown_op_is_rejected() {
        assert!(serde_json::from_str::<FsRequest>(r#"{"op":"chmod","uri":"x"}"#).is_err());
    }

    #[test]
    fn test_control_hello_parses() {
        let msg: ControlMessage =
            serde_json::from_str(r#"{"control":"hello","protocolVersion":1}"#).unwrap();
        assert_eq!(
            msg,
            ControlMessage::Hello {
                protocol_version: 1,
                client_name: None
            }
        );
    }
}
