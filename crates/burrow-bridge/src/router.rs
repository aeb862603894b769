//! Message dispatch
//!
//! [`Dispatcher`] turns request frames into exactly one response frame each.
//! [`Correlator`] matches response frames to requests this side sent.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use burrow_core::codec::{Frame, MessageType, OperationId, Payload, UNSOLICITED};
use burrow_core::{
    ControlMessage, ControlReply, ErrorCode, FsError, FsRequest, FsResponse, ProtocolError,
    ServerInfo, PROTOCOL_VERSION,
};

use crate::backend::FsBackend;
use crate::mount::MountRegistry;

/// Capabilities advertised in the hello reply
pub const CAPABILITIES: &[&str] = &[
    "stat",
    "readDirectory",
    "readFile",
    "writeFile",
    "create",
    "delete",
    "rename",
    "mkdir",
];

/// Errors seen by the side issuing a request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("remote error: {0}")]
    Remote(FsError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl CallError {
    /// Error code if the peer answered with an error frame
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            CallError::Remote(e) => Some(e.code),
            _ => None,
        }
    }
}

/// Outstanding outbound requests keyed by operation id
pub struct Correlator {
    next_id: AtomicU32,
    pending: DashMap<OperationId, oneshot::Sender<Frame>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            pending: DashMap::new(),
        }
    }

    /// Allocate an operation id and a slot for its response
    pub fn register(&self) -> (OperationId, oneshot::Receiver<Frame>) {
        let (tx, rx) = oneshot::channel();
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id == UNSOLICITED {
                continue;
            }
            if let dashmap::mapref::entry::Entry::Vacant(slot) = self.pending.entry(id) {
                slot.insert(tx);
                return (id, rx);
            }
        }
    }

    /// Deliver a response frame to whoever is waiting on its reference id
    pub fn resolve(&self, frame: Frame) -> bool {
        let reference = frame.header.reference_id;
        match self.pending.remove(&reference) {
            Some((_, tx)) => tx.send(frame).is_ok(),
            None => {
                debug!(
                    "Dropping unmatched {} frame for op {}",
                    frame.header.message_type.name(),
                    reference
                );
                false
            }
        }
    }

    /// Forget a request whose caller gave up
    pub fn cancel(&self, id: OperationId) {
        self.pending.remove(&id);
    }

    /// Fail every outstanding request; their receivers see a closed channel
    pub fn fail_all(&self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a response frame into a typed body plus binary segment
pub fn decode_response(frame: &Frame) -> Result<(FsResponse, Option<Bytes>), CallError> {
    match frame.header.message_type {
        MessageType::ResponseOk => {
            let body: FsResponse = frame.payload.parse_json()?;
            Ok((body, frame.payload.binary.clone()))
        }
        MessageType::ResponseError => Err(CallError::Remote(frame.payload.parse_json()?)),
        other => Err(CallError::UnexpectedResponse(other.name().into())),
    }
}

/// Decode the answer to a control message
pub fn decode_control_reply(frame: &Frame) -> Result<ControlReply, CallError> {
    match frame.header.message_type {
        MessageType::Control => Ok(frame.payload.parse_json()?),
        MessageType::ResponseError => Err(CallError::Remote(frame.payload.parse_json()?)),
        other => Err(CallError::UnexpectedResponse(other.name().into())),
    }
}

/// Serves inbound requests against a registry and backend
pub struct Dispatcher {
    registry: Arc<MountRegistry>,
    backend: Arc<dyn FsBackend>,
    info: ServerInfo,
}

impl Dispatcher {
    pub fn new(registry: Arc<MountRegistry>, backend: Arc<dyn FsBackend>) -> Self {
        let host_name = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".into());

        Self {
            registry,
            backend,
            info: ServerInfo {
                protocol_version: PROTOCOL_VERSION,
                host_name,
                capabilities: CAPABILITIES.iter().map(|c| c.to_string()).collect(),
            },
        }
    }

    pub fn registry(&self) -> &Arc<MountRegistry> {
        &self.registry
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.info
    }

    /// Answer a request frame. Always produces exactly one response whose
    /// reference id is the request's operation id.
    pub async fn handle_request(&self, frame: &Frame) -> Frame {
        let reference = frame.header.operation_id;

        let result = if reference == UNSOLICITED {
            Err(FsError::new(
                ErrorCode::ProtocolError,
                "operation id 0 is reserved",
            ))
        } else {
            self.execute(frame).await
        };

        match result.and_then(|(body, binary)| Ok(Payload::json(&body, binary)?)) {
            Ok(payload) => Frame::response_ok(reference, payload),
            Err(e) => {
                debug!("op {} failed: {}", reference, e);
                Frame::response_error(reference, &e)
            }
        }
    }

    async fn execute(&self, frame: &Frame) -> Result<(FsResponse, Option<Bytes>), FsError> {
        let request: FsRequest = frame.payload.parse_json()?;
        debug!(op = request.op_name(), id = frame.header.operation_id, "request");

        let binary = frame.payload.binary.clone();
        if binary.is_some() && !request.expects_binary() {
            return Err(ProtocolError::UnexpectedBinary(request.op_name()).into());
        }

        let backend = &self.backend;
        match request {
            FsRequest::Stat { uri } => {
                let path = self.registry.resolve_uri(&uri)?;
                let stat = backend.stat(&path).await?;
                Ok((FsResponse::Stat { stat }, None))
            }
            FsRequest::ReadDirectory { uri } => {
                let path = self.registry.resolve_uri(&uri)?;
                let entries = backend.read_directory(&path).await?;
                Ok((FsResponse::Entries { entries }, None))
            }
            FsRequest::ReadFile { uri } => {
                let path = self.registry.resolve_uri(&uri)?;
                let contents = backend.read_file(&path).await?;
                let size = contents.len() as u64;
                Ok((FsResponse::Content { size }, Some(contents)))
            }
            FsRequest::WriteFile {
                uri,
                create,
                overwrite,
            } => {
                let path = self.registry.resolve_new_entry(&uri)?;
                backend
                    .write_file(&path, binary.unwrap_or_default(), create, overwrite)
                    .await?;
                Ok((FsResponse::Done, None))
            }
            FsRequest::Create { uri, overwrite } => {
                let path = self.registry.resolve_new_entry(&uri)?;
                backend.create(&path, overwrite).await?;
                Ok((FsResponse::Done, None))
            }
            FsRequest::Delete { uri, recursive } => {
                let path = self.registry.resolve_entry(&uri)?;
                backend.delete(&path, recursive).await?;
                Ok((FsResponse::Done, None))
            }
            FsRequest::Rename {
                from,
                to,
                overwrite,
            } => {
                let from = self.registry.resolve_entry(&from)?;
                let to = self.registry.resolve_new_entry(&to)?;
                backend.rename(&from, &to, overwrite).await?;
                Ok((FsResponse::Done, None))
            }
            FsRequest::Mkdir { uri } => {
                let path = self.registry.resolve_new_entry(&uri)?;
                backend.mkdir(&path).await?;
                Ok((FsResponse::Done, None))
            }
        }
    }

    /// Answer a control frame (`hello`, `ping`)
    pub fn handle_control(&self, frame: &Frame) -> Frame {
        let reference = frame.header.operation_id;

        let reply = frame
            .payload
            .parse_json::<ControlMessage>()
            .map_err(FsError::from)
            .and_then(|msg| self.control_reply(msg));

        match reply.and_then(|r| Ok(Payload::json(&r, None)?)) {
            Ok(payload) => Frame::control(UNSOLICITED, reference, payload),
            Err(e) => {
                warn!("Rejected control message {}: {}", reference, e);
                Frame::response_error(reference, &e)
            }
        }
    }

    fn control_reply(&self, msg: ControlMessage) -> Result<ControlReply, FsError> {
        match msg {
            ControlMessage::Hello {
                protocol_version,
                client_name,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(FsError::new(
                        ErrorCode::ProtocolError,
                        format!(
                            "protocol version mismatch: expected {}, got {}",
                            PROTOCOL_VERSION, protocol_version
                        ),
                    ));
                }
                debug!("Hello from {}", client_name.as_deref().unwrap_or("anonymous"));
                Ok(ControlReply::Hello(self.info.clone()))
            }
            ControlMessage::Ping { timestamp } => Ok(ControlReply::Pong {
                client_timestamp: timestamp,
                server_timestamp: burrow_core::now_ms(),
            }),
        }
    }
}
