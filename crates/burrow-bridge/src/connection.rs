//! One WebSocket peer
//!
//! Each connection runs a reader loop and a writer task joined by a bounded
//! queue. Inbound requests are handed to the [`Dispatcher`] on their own
//! tasks, so a slow request never holds up the ones behind it; responses
//! find their way back purely by reference id.
//!
//! Control frames with a zero reference id are requests, anything else
//! answers a control message this side sent.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use burrow_core::codec::{Frame, MessageType, OperationId, Payload, UNSOLICITED};
use burrow_core::{ControlMessage, ControlReply, FsError, FsRequest, FsResponse, ProtocolError};

use crate::router::{decode_control_reply, decode_response, CallError, Correlator, Dispatcher};

/// Frames queued for the writer before senders wait
const OUTBOUND_QUEUE: usize = 256;

/// How long a closing connection waits for in-flight requests to answer
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Reasons a connection ended abnormally
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("text messages are not part of the protocol")]
    UnexpectedText,

    #[error("tls error: {0}")]
    Tls(std::io::Error),

    #[error("handshake with {0} timed out")]
    HandshakeTimeout(std::net::SocketAddr),
}

/// Handle for issuing requests to the peer and closing the connection
#[derive(Clone)]
pub struct PeerHandle {
    outbound: mpsc::Sender<Frame>,
    correlator: Arc<Correlator>,
    closed: CancellationToken,
}

impl PeerHandle {
    /// Send a frame built around a freshly allocated operation id and wait
    /// for the frame that answers it
    pub async fn call<F>(&self, build: F) -> Result<Frame, CallError>
    where
        F: FnOnce(OperationId) -> Frame,
    {
        if self.closed.is_cancelled() {
            return Err(CallError::ConnectionClosed);
        }

        let (id, rx) = self.correlator.register();
        if self.outbound.send(build(id)).await.is_err() {
            self.correlator.cancel(id);
            return Err(CallError::ConnectionClosed);
        }

        tokio::select! {
            reply = rx => reply.map_err(|_| CallError::ConnectionClosed),
            _ = self.closed.cancelled() => {
                self.correlator.cancel(id);
                Err(CallError::ConnectionClosed)
            }
        }
    }

    /// Issue a file-system request
    pub async fn request(
        &self,
        request: &FsRequest,
        binary: Option<Bytes>,
    ) -> Result<(FsResponse, Option<Bytes>), CallError> {
        let payload = Payload::json(request, binary)?;
        let frame = self.call(|id| Frame::request(id, payload)).await?;
        decode_response(&frame)
    }

    /// Issue a control message
    pub async fn control(&self, message: &ControlMessage) -> Result<ControlReply, CallError> {
        let payload = Payload::json(message, None)?;
        let frame = self
            .call(|id| Frame::control(id, UNSOLICITED, payload))
            .await?;
        decode_control_reply(&frame)
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has ended
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Outbound requests still waiting for an answer
    pub fn pending(&self) -> usize {
        self.correlator.pending()
    }
}

/// Start the reader and writer for an upgraded WebSocket.
///
/// Without a dispatcher, inbound requests are answered with
/// `not_implemented`. The returned task finishes when the connection ends,
/// which also happens when `shutdown` is cancelled.
pub fn spawn_peer<S>(
    ws: WebSocketStream<S>,
    dispatcher: Option<Arc<Dispatcher>>,
    max_frame_size: usize,
    shutdown: CancellationToken,
) -> (PeerHandle, JoinHandle<Result<(), ConnectionError>>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
    let correlator = Arc::new(Correlator::new());
    let closed = shutdown.child_token();

    let handle = PeerHandle {
        outbound: tx.clone(),
        correlator: correlator.clone(),
        closed: closed.clone(),
    };

    let writer = tokio::spawn(write_loop(sink, rx, closed.clone(), shutdown.clone()));

    let task = tokio::spawn(async move {
        let in_flight = TaskTracker::new();
        let result = read_loop(
            stream,
            tx,
            dispatcher,
            correlator.clone(),
            max_frame_size,
            &closed,
            &in_flight,
        )
        .await;

        in_flight.close();
        if !shutdown.is_cancelled()
            && time::timeout(DRAIN_GRACE, in_flight.wait()).await.is_err()
        {
            debug!("Dropping {} unanswered request(s) on close", in_flight.len());
        }

        closed.cancel();
        let failed = correlator.fail_all();
        if failed > 0 {
            debug!("Connection closed with {} request(s) outstanding", failed);
        }

        match writer.await {
            Ok(Err(e)) if result.is_ok() => return Err(e),
            Err(e) => warn!("Writer task panicked: {}", e),
            _ => {}
        }
        result
    });

    (handle, task)
}

async fn read_loop<R>(
    mut stream: R,
    tx: mpsc::Sender<Frame>,
    dispatcher: Option<Arc<Dispatcher>>,
    correlator: Arc<Correlator>,
    max_frame_size: usize,
    closed: &CancellationToken,
    in_flight: &TaskTracker,
) -> Result<(), ConnectionError>
where
    R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let message = tokio::select! {
            _ = closed.cancelled() => return Ok(()),
            message = stream.next() => message,
        };

        let data = match message {
            None => return Ok(()),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(_))) => return Ok(()),
            Some(Ok(Message::Text(_))) => return Err(ConnectionError::UnexpectedText),
            Some(Ok(_)) => continue,
        };

        let frame = Frame::decode(Bytes::from(data), max_frame_size)?;
        trace!(
            "recv {} op={} ref={}",
            frame.header.message_type.name(),
            frame.header.operation_id,
            frame.header.reference_id
        );

        match frame.header.message_type {
            MessageType::ResponseOk | MessageType::ResponseError => {
                correlator.resolve(frame);
            }
            MessageType::Control if frame.header.reference_id != UNSOLICITED => {
                correlator.resolve(frame);
            }
            MessageType::Control => {
                let reply = match &dispatcher {
                    Some(d) => d.handle_control(&frame),
                    None => Frame::response_error(
                        frame.header.operation_id,
                        &FsError::not_implemented("control messages not served here"),
                    ),
                };
                if tx.send(reply).await.is_err() {
                    return Ok(());
                }
            }
            MessageType::RequestWithPayload | MessageType::RequestWithBinary => {
                let tx = tx.clone();
                let dispatcher = dispatcher.clone();
                in_flight.spawn(async move {
                    let reply = match dispatcher {
                        Some(d) => d.handle_request(&frame).await,
                        None => Frame::response_error(
                            frame.header.operation_id,
                            &FsError::not_implemented("requests not served here"),
                        ),
                    };
                    let _ = tx.send(reply).await;
                });
            }
        }
    }
}

async fn write_loop<W>(
    mut sink: W,
    mut rx: mpsc::Receiver<Frame>,
    closed: CancellationToken,
    shutdown: CancellationToken,
) -> Result<(), ConnectionError>
where
    W: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let result = loop {
        let frame = tokio::select! {
            biased;
            _ = closed.cancelled() => break Ok(()),
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break Ok(()),
            },
        };

        if let Err(e) = send_frame(&mut sink, &frame).await {
            closed.cancel();
            break Err(e.into());
        }
    };

    // A local close still delivers what was already queued; shutdown does not wait
    if result.is_ok() && !shutdown.is_cancelled() {
        let mut flushed = 0usize;
        while let Ok(frame) = rx.try_recv() {
            if send_frame(&mut sink, &frame).await.is_err() {
                break;
            }
            flushed += 1;
        }
        if flushed > 0 {
            debug!("Flushed {} queued frame(s) before close", flushed);
        }
    }

    let _ = sink.close().await;
    result
}

async fn send_frame<W>(sink: &mut W, frame: &Frame) -> Result<(), tokio_tungstenite::tungstenite::Error>
where
    W: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    trace!(
        "send {} op={} ref={}",
        frame.header.message_type.name(),
        frame.header.operation_id,
        frame.header.reference_id
    );
    sink.send(Message::Binary(frame.encode().to_vec())).await
}
