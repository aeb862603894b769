//! Editor-side bridge client
//!
//! Thin typed layer over a [`PeerHandle`]. Calls may run concurrently on
//! one connection; each is matched to its answer by operation id.

use std::net::SocketAddr;

use bytes::Bytes;
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use burrow_core::codec::DEFAULT_MAX_FRAME_SIZE;
use burrow_core::{
    ControlMessage, ControlReply, DirEntry, FileStat, FsRequest, FsResponse, ServerInfo,
    PROTOCOL_VERSION,
};

use crate::connection::{spawn_peer, PeerHandle};
use crate::router::CallError;
use crate::tls::pinned_connector;

pub struct BridgeClient {
    peer: PeerHandle,
}

impl BridgeClient {
    /// Connect to a plain `ws://` bridge
    pub async fn connect(url: &str) -> Result<Self, CallError> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| CallError::Transport(e.to_string()))?;
        debug!("Connected to bridge at {}", url);
        Ok(Self::from_ws(ws))
    }

    /// Connect over TLS, trusting only `certificate`
    pub async fn connect_tls(
        addr: SocketAddr,
        server_name: &str,
        certificate: CertificateDer<'static>,
    ) -> Result<Self, CallError> {
        let connector =
            pinned_connector(certificate).map_err(|e| CallError::Transport(e.to_string()))?;
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| CallError::Transport(e.to_string()))?;

        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| CallError::Transport(e.to_string()))?;
        let tls = connector
            .connect(name, tcp)
            .await
            .map_err(|e| CallError::Transport(e.to_string()))?;

        Self::over_stream(&format!("wss://{}", addr), tls).await
    }

    /// Run the WebSocket handshake over an already established stream
    /// (an SSH forward, for instance)
    pub async fn over_stream<S>(url: &str, stream: S) -> Result<Self, CallError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (ws, _) = tokio_tungstenite::client_async(url, stream)
            .await
            .map_err(|e| CallError::Transport(e.to_string()))?;
        Ok(Self::from_ws(ws))
    }

    fn from_ws<S>(ws: tokio_tungstenite::WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (peer, _task) = spawn_peer(ws, None, DEFAULT_MAX_FRAME_SIZE, CancellationToken::new());
        Self { peer }
    }

    pub fn peer(&self) -> &PeerHandle {
        &self.peer
    }

    /// Raw request, for operations without a typed helper
    pub async fn request(
        &self,
        request: &FsRequest,
        binary: Option<Bytes>,
    ) -> Result<(FsResponse, Option<Bytes>), CallError> {
        self.peer.request(request, binary).await
    }

    async fn expect_done(&self, request: FsRequest, binary: Option<Bytes>) -> Result<(), CallError> {
        match self.request(&request, binary).await? {
            (FsResponse::Done, _) => Ok(()),
            (other, _) => Err(unexpected(&other)),
        }
    }

    pub async fn stat(&self, uri: &str) -> Result<FileStat, CallError> {
        match self.request(&FsRequest::Stat { uri: uri.into() }, None).await? {
            (FsResponse::Stat { stat }, _) => Ok(stat),
            (other, _) => Err(unexpected(&other)),
        }
    }

    pub async fn read_directory(&self, uri: &str) -> Result<Vec<DirEntry>, CallError> {
        match self
            .request(&FsRequest::ReadDirectory { uri: uri.into() }, None)
            .await?
        {
            (FsResponse::Entries { entries }, _) => Ok(entries),
            (other, _) => Err(unexpected(&other)),
        }
    }

    pub async fn read_file(&self, uri: &str) -> Result<Bytes, CallError> {
        match self
            .request(&FsRequest::ReadFile { uri: uri.into() }, None)
            .await?
        {
            (FsResponse::Content { .. }, binary) => Ok(binary.unwrap_or_default()),
            (other, _) => Err(unexpected(&other)),
        }
    }

    pub async fn write_file(
        &self,
        uri: &str,
        contents: impl Into<Bytes>,
        create: bool,
        overwrite: bool,
    ) -> Result<(), CallError> {
        let contents = contents.into();
        let binary = (!contents.is_empty()).then_some(contents);
        self.expect_done(
            FsRequest::WriteFile {
                uri: uri.into(),
                create,
                overwrite,
            },
            binary,
        )
        .await
    }

    pub async fn create(&self, uri: &str, overwrite: bool) -> Result<(), CallError> {
        self.expect_done(
            FsRequest::Create {
                uri: uri.into(),
                overwrite,
            },
            None,
        )
        .await
    }

    pub async fn delete(&self, uri: &str, recursive: bool) -> Result<(), CallError> {
        self.expect_done(
            FsRequest::Delete {
                uri: uri.into(),
                recursive,
            },
            None,
        )
        .await
    }

    pub async fn rename(&self, from: &str, to: &str, overwrite: bool) -> Result<(), CallError> {
        self.expect_done(
            FsRequest::Rename {
                from: from.into(),
                to: to.into(),
                overwrite,
            },
            None,
        )
        .await
    }

    pub async fn mkdir(&self, uri: &str) -> Result<(), CallError> {
        self.expect_done(FsRequest::Mkdir { uri: uri.into() }, None)
            .await
    }

    /// Exchange protocol versions
    pub async fn hello(&self, client_name: Option<&str>) -> Result<ServerInfo, CallError> {
        let message = ControlMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            client_name: client_name.map(str::to_string),
        };
        match self.peer.control(&message).await? {
            ControlReply::Hello(info) => Ok(info),
            other => Err(CallError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// Round trip a ping, returning the server's timestamp
    pub async fn ping(&self) -> Result<u64, CallError> {
        let message = ControlMessage::Ping {
            timestamp: burrow_core::now_ms(),
        };
        match self.peer.control(&message).await? {
            ControlReply::Pong {
                server_timestamp, ..
            } => Ok(server_timestamp),
            other => Err(CallError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    pub fn close(&self) {
        self.peer.close();
    }

    pub async fn closed(&self) {
        self.peer.closed().await
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.peer.close();
    }
}

fn unexpected(response: &FsResponse) -> CallError {
    CallError::UnexpectedResponse(format!("{:?}", response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::mount::MountRegistry;
    use crate::server::BridgeServer;
    use burrow_core::{BridgeConfig, ErrorCode, FileKind};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    async fn serve() -> (tempfile::TempDir, Arc<BridgeServer>, String) {
        let temp = tempfile::tempdir().unwrap();
        let config = BridgeConfig {
            port: 0,
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..BridgeConfig::default()
        };
        let registry = Arc::new(MountRegistry::new());
        let token = registry.register("ws", temp.path()).unwrap();
        let server = Arc::new(
            BridgeServer::bind(&config, registry, Arc::new(LocalBackend))
                .await
                .unwrap(),
        );
        let serving = server.clone();
        tokio::spawn(async move { serving.serve().await });
        (temp, server, token)
    }

    #[tokio::test]
    async fn test_full_editing_session() {
        let (temp, server, token) = serve().await;
        let client = BridgeClient::connect(&server.url()).await.unwrap();
        let uri = |p: &str| format!("burrow://{}/{}", token, p);

        let info = client.hello(Some("test-editor")).await.unwrap();
        assert_eq!(info.protocol_version, PROTOCOL_VERSION);

        client.mkdir(&uri("src")).await.unwrap();
        client
            .write_file(&uri("src/main.rs"), "fn main() {}", true, false)
            .await
            .unwrap();
        client.create(&uri("src/empty.rs"), false).await.unwrap();

        let entries = client.read_directory(&uri("src")).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["empty.rs", "main.rs"]);

        client
            .rename(&uri("src/main.rs"), &uri("src/lib.rs"), false)
            .await
            .unwrap();
        assert_eq!(
            client.read_file(&uri("src/lib.rs")).await.unwrap(),
            &b"fn main() {}"[..]
        );

        let stat = client.stat(&uri("src")).await.unwrap();
        assert_eq!(stat.kind, FileKind::Directory);

        let err = client.delete(&uri("src"), false).await.unwrap_err();
        assert!(err.code().is_some());
        client.delete(&uri("src"), true).await.unwrap();
        assert!(!temp.path().join("src").exists());

        let err = client.stat(&uri("src")).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::FileNotFound));
    }

    #[tokio::test]
    async fn test_concurrent_stat_and_write() {
        let (temp, server, token) = serve().await;
        std::fs::write(temp.path().join("big.bin"), vec![7u8; 1 << 20]).unwrap();
        let client = BridgeClient::connect(&server.url()).await.unwrap();

        let stat_uri = format!("burrow://{}/big.bin", token);
        let write_uri = format!("burrow://{}/out.txt", token);
        let calls = (0..16).map(|i| {
            let client = &client;
            let stat_uri = stat_uri.clone();
            let write_uri = format!("{}{}", write_uri, i);
            async move {
                let (stat, write) = tokio::join!(
                    client.stat(&stat_uri),
                    client.write_file(&write_uri, format!("file {}", i), true, true)
                );
                (stat.unwrap().size, write)
            }
        });

        for (size, write) in futures_util::future::join_all(calls).await {
            assert_eq!(size, 1 << 20);
            write.unwrap();
        }
        assert_eq!(
            std::fs::read_to_string(temp.path().join("out.txt3")).unwrap(),
            "file 3"
        );
        assert_eq!(client.peer().pending(), 0);
    }

    #[tokio::test]
    async fn test_empty_write_truncates() {
        let (temp, server, token) = serve().await;
        std::fs::write(temp.path().join("f"), b"old").unwrap();
        let client = BridgeClient::connect(&server.url()).await.unwrap();

        client
            .write_file(&format!("burrow://{}/f", token), Bytes::new(), false, true)
            .await
            .unwrap();
        assert_eq!(std::fs::read(temp.path().join("f")).unwrap().len(), 0);
    }
}
