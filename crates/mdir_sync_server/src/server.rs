//! Main sync server.

use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::handler::{Flow, HandlerContext, RequestHandler, Session};
use crate::policy::{CreationPolicy, MergeByName};
use bytes::BytesMut;
use mdir_core::{DirectoryFolderStorage, FolderRegistry, FolderStorage, JournalConfig, MemoryFolderStorage};
use mdir_protocol::{MessageDecoder, Request, ServerMessage, WireMessage};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// User name of TCP sessions, which carry no credentials.
pub const ANONYMOUS_USER: &str = "anonymous";

/// The sync server.
///
/// Sessions reach the server either over TCP ([`serve`](Self::serve)) or
/// in-process ([`connect_local`](Self::connect_local)); both speak the same
/// command set against one shared [`HandlerContext`].
///
/// # Example
///
/// ```
/// use mdir_sync_server::{ServerConfig, SyncServer};
///
/// let server = SyncServer::new(ServerConfig::default()).unwrap();
/// assert_eq!(server.session_count(), 0);
/// ```
#[derive(Debug)]
pub struct SyncServer {
    handler: RequestHandler,
    sessions: AtomicUsize,
}

impl SyncServer {
    /// Creates a new sync server merging concurrent creations by name.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        Self::with_policy(config, Box::new(MergeByName))
    }

    /// Creates a sync server with a custom creation policy.
    pub fn with_policy(config: ServerConfig, policy: Box<dyn CreationPolicy>) -> ServerResult<Self> {
        let storage: Arc<dyn FolderStorage> = match &config.storage_root {
            Some(root) => Arc::new(DirectoryFolderStorage::new(root)),
            None => Arc::new(MemoryFolderStorage::new()),
        };
        let journal = JournalConfig::new()
            .with_sync_on_append(config.sync_on_append)
            .with_max_document_size(config.max_document_size);
        let registry = FolderRegistry::with_capacity(storage, journal, config.folder_cache_capacity)?;
        let context = HandlerContext::with_policy(config, registry, policy)?;
        Ok(Self {
            handler: RequestHandler::new(Arc::new(context)),
            sessions: AtomicUsize::new(0),
        })
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.handler.context().config
    }

    /// State shared by every session.
    pub fn context(&self) -> &Arc<HandlerContext> {
        self.handler.context()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Opens an in-process session for `user`.
    ///
    /// The returned receiver yields `None` once the session ends, either
    /// after QUIT or when the request sender is dropped.
    pub fn connect_local(
        self: &Arc<Self>,
        user: impl Into<String>,
    ) -> (UnboundedSender<Request>, UnboundedReceiver<ServerMessage>) {
        let (requests, mut incoming) = mpsc::unbounded_channel::<Request>();
        let (sender, messages) = mpsc::unbounded_channel();
        let session = self.start_session(user, sender);
        let server = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(request) = incoming.recv().await {
                if server.handler.handle(&session, request) == Flow::Quit {
                    break;
                }
            }
            server.finish_session(&session);
        });
        (requests, messages)
    }

    /// Binds the configured address and serves until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> ServerResult<()> {
        let listener = TcpListener::bind(self.config().bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Accepts TCP sessions on `listener` until `shutdown` fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> ServerResult<()> {
        info!(addr = %listener.local_addr()?, "sync server listening");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        let token = shutdown.child_token();
                        tokio::spawn(async move { server.serve_connection(stream, peer, token).await });
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                },
            }
        }
        info!("sync server stopped");
        Ok(())
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr, shutdown: CancellationToken) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "nodelay not set");
        }
        let (mut read_half, mut write_half) = stream.into_split();
        let (sender, mut messages) = mpsc::unbounded_channel::<ServerMessage>();
        let session = self.start_session(ANONYMOUS_USER, sender);
        debug!(%peer, session = session.id, "connection accepted");

        let writer = tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                let line = match message.encode() {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "message not encodable");
                        continue;
                    }
                };
                if let Err(e) = write_half.write_all(line.as_bytes()).await {
                    debug!(error = %e, "connection write failed");
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let mut decoder = MessageDecoder::<Request>::new();
        let mut buf = BytesMut::with_capacity(8 * 1024);
        'session: loop {
            let read = tokio::select! {
                () = shutdown.cancelled() => break,
                read = read_half.read_buf(&mut buf) => read,
            };
            match read {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(%peer, error = %e, "connection read failed");
                    break;
                }
            }
            loop {
                match decoder.decode(&mut buf) {
                    Ok(Some(request)) => {
                        if self.handler.handle(&session, request) == Flow::Quit {
                            break 'session;
                        }
                    }
                    Ok(None) => break,
                    Err(e) if e.is_stream_fatal() => {
                        warn!(%peer, error = %e, "closing unreadable connection");
                        break 'session;
                    }
                    Err(e) => warn!(%peer, error = %e, "dropping malformed request"),
                }
            }
        }

        self.finish_session(&session);
        drop(session);
        let _ = writer.await;
        debug!(%peer, "connection closed");
    }

    fn start_session(&self, user: impl Into<String>, sender: UnboundedSender<ServerMessage>) -> Session {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        self.context().open_session(user, sender)
    }

    fn finish_session(&self, session: &Session) {
        self.context().end_session(session);
        self.sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdir_codec::Header;
    use mdir_protocol::Response;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::timeout;

    async fn next(messages: &mut UnboundedReceiver<ServerMessage>) -> Option<ServerMessage> {
        timeout(Duration::from_secs(5), messages.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn local_session_lifecycle() {
        let server = Arc::new(SyncServer::new(ServerConfig::default()).unwrap());
        let (requests, mut messages) = server.connect_local("alice");
        assert_eq!(server.session_count(), 1);

        requests
            .send(Request::Sub {
                seq: 1,
                dir_id: "root".into(),
                from_version: 0,
            })
            .unwrap();
        assert_eq!(next(&mut messages).await, Some(Response::ok(1).into()));

        requests.send(Request::Quit { seq: 2 }).unwrap();
        assert_eq!(next(&mut messages).await, Some(Response::ok(2).into()));
        assert_eq!(next(&mut messages).await, None);
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn patches_reach_other_sessions() {
        let server = Arc::new(SyncServer::new(ServerConfig::default()).unwrap());
        let (alice, mut alice_messages) = server.connect_local("alice");
        let (bob, mut bob_messages) = server.connect_local("bob");

        bob.send(Request::Sub {
            seq: 1,
            dir_id: "root".into(),
            from_version: 0,
        })
        .unwrap();
        assert_eq!(next(&mut bob_messages).await, Some(Response::ok(1).into()));

        alice
            .send(Request::Put {
                seq: 1,
                dir_id: "root".into(),
                header: Header::new().with("subject", "hello"),
            })
            .unwrap();
        assert_eq!(next(&mut alice_messages).await, Some(Response::ok_with(1, "1").into()));
        assert!(matches!(
            next(&mut bob_messages).await,
            Some(ServerMessage::Patch { patch, .. }) if patch.new_version == 1
        ));
    }

    #[tokio::test]
    async fn journals_survive_restart() {
        let dir = tempdir().unwrap();
        let config = ServerConfig::default().with_storage_root(dir.path());
        let child = {
            let server = Arc::new(SyncServer::new(config.clone()).unwrap());
            let (requests, mut messages) = server.connect_local("alice");
            requests
                .send(Request::Put {
                    seq: 1,
                    dir_id: "root".into(),
                    header: Header::directory("docs"),
                })
                .unwrap();
            let Some(ServerMessage::Response(response)) = next(&mut messages).await else {
                panic!("no response");
            };
            response.put_ack().unwrap().dir_id.unwrap()
        };

        let server = Arc::new(SyncServer::new(config).unwrap());
        let (requests, mut messages) = server.connect_local("alice");
        requests
            .send(Request::Sub {
                seq: 1,
                dir_id: "root".into(),
                from_version: 0,
            })
            .unwrap();
        let Some(ServerMessage::Patch { patch, .. }) = next(&mut messages).await else {
            panic!("no catch-up");
        };
        assert_eq!(patch.header.dir_id(), Some(child.as_str()));
        assert_eq!(next(&mut messages).await, Some(Response::ok(1).into()));

        // the reopened server keeps allocating past existing identifiers
        requests
            .send(Request::Put {
                seq: 2,
                dir_id: "root".into(),
                header: Header::directory("more"),
            })
            .unwrap();
        let _patch = next(&mut messages).await;
        let Some(ServerMessage::Response(response)) = next(&mut messages).await else {
            panic!("no response");
        };
        assert_ne!(response.put_ack().unwrap().dir_id, Some(child));
    }

    #[tokio::test]
    async fn tcp_session() {
        let server = Arc::new(SyncServer::new(ServerConfig::default()).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let serving = tokio::spawn(Arc::clone(&server).serve(listener, shutdown.clone()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"1 PUT root 1\nsubject: hi\ngarbage\n2 QUIT\n")
            .await
            .unwrap();
        let mut reply = String::new();
        timeout(Duration::from_secs(5), stream.read_to_string(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, "RESP 1 200 1\nRESP 2 200\n");

        shutdown.cancel();
        serving.await.unwrap().unwrap();
    }
}
