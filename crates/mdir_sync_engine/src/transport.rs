//! Transport layer.
//!
//! A transport produces a [`Connection`]: a pair of channels carrying
//! requests to the server and the multiplexed stream of responses and patch
//! announcements back. The connection is lost when `incoming` yields `None`.

use crate::error::{SyncError, SyncResult};
use bytes::BytesMut;
use mdir_protocol::{MessageDecoder, Request, ServerMessage, WireMessage};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One live connection to a server.
#[derive(Debug)]
pub struct Connection {
    /// Requests to the server.
    pub outgoing: mpsc::UnboundedSender<Request>,
    /// Responses and patches from the server.
    pub incoming: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Connection {
    /// Bundles a channel pair.
    pub fn new(
        outgoing: mpsc::UnboundedSender<Request>,
        incoming: mpsc::UnboundedReceiver<ServerMessage>,
    ) -> Self {
        Self { outgoing, incoming }
    }
}

/// Opens connections to a server.
pub trait Transport: Send + Sync + 'static {
    /// Connects. Failures worth retrying are reported as retryable.
    fn connect(&self) -> impl Future<Output = SyncResult<Connection>> + Send;
}

/// Line protocol over TCP.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    addr: String,
}

impl TcpTransport {
    /// A transport connecting to `addr` (`host:port`).
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Transport for TcpTransport {
    async fn connect(&self) -> SyncResult<Connection> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| SyncError::transport_retryable(format!("connect {}: {e}", self.addr)))?;
        stream.set_nodelay(true)?;
        let (mut read_half, mut write_half) = stream.into_split();

        let (outgoing, mut requests) = mpsc::unbounded_channel::<Request>();
        let (messages, incoming) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let line = match request.encode() {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(seq = request.seq(), error = %e, "request not encodable");
                        continue;
                    }
                };
                if let Err(e) = write_half.write_all(line.as_bytes()).await {
                    debug!(error = %e, "connection write failed");
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut decoder = MessageDecoder::<ServerMessage>::new();
            let mut buf = BytesMut::with_capacity(8 * 1024);
            loop {
                match read_half.read_buf(&mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "connection read failed");
                        break;
                    }
                }
                loop {
                    match decoder.decode(&mut buf) {
                        Ok(Some(message)) => {
                            if messages.send(message).is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) if e.is_stream_fatal() => {
                            warn!(error = %e, "closing unreadable connection");
                            return;
                        }
                        Err(e) => warn!(error = %e, "dropping malformed message"),
                    }
                }
            }
        });

        debug!(addr = %self.addr, "connected");
        Ok(Connection::new(outgoing, incoming))
    }
}

/// In-process transport over a connection factory, with a switch to take
/// it offline. Going offline drops the live connection.
pub struct ChannelTransport<F> {
    factory: F,
    online: AtomicBool,
    generation: Mutex<CancellationToken>,
}

impl<F> ChannelTransport<F>
where
    F: Fn() -> SyncResult<Connection> + Send + Sync + 'static,
{
    /// Creates an online transport.
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            online: AtomicBool::new(true),
            generation: Mutex::new(CancellationToken::new()),
        }
    }

    /// Creates a transport that refuses to connect until brought online.
    pub fn offline(factory: F) -> Self {
        let transport = Self::new(factory);
        transport.online.store(false, Ordering::SeqCst);
        transport
    }

    /// Switches connectivity. Going offline severs the live connection.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if !online {
            let mut generation = self.generation.lock();
            generation.cancel();
            *generation = CancellationToken::new();
        }
    }

    /// Returns true if connections are allowed.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

impl<F> Transport for ChannelTransport<F>
where
    F: Fn() -> SyncResult<Connection> + Send + Sync + 'static,
{
    async fn connect(&self) -> SyncResult<Connection> {
        if !self.is_online() {
            return Err(SyncError::transport_retryable("offline"));
        }
        let Connection {
            outgoing: to_server,
            incoming: mut from_server,
        } = (self.factory)()?;
        let token = self.generation.lock().clone();

        let (outgoing, mut requests) = mpsc::unbounded_channel::<Request>();
        let (messages, incoming) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    request = requests.recv() => {
                        let Some(request) = request else { break };
                        if to_server.send(request).is_err() {
                            break;
                        }
                    }
                    message = from_server.recv() => {
                        let Some(message) = message else { break };
                        if messages.send(message).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(Connection::new(outgoing, incoming))
    }
}

impl<F> std::fmt::Debug for ChannelTransport<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("online", &self.online.load(Ordering::SeqCst))
            .finish()
    }
}

impl<T: Transport> Transport for Arc<T> {
    fn connect(&self) -> impl Future<Output = SyncResult<Connection>> + Send {
        (**self).connect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdir_protocol::Response;

    fn echo_factory() -> impl Fn() -> SyncResult<Connection> + Send + Sync + 'static {
        || {
            let (outgoing, mut requests) = mpsc::unbounded_channel::<Request>();
            let (messages, incoming) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                while let Some(request) = requests.recv().await {
                    if messages.send(Response::ok(request.seq()).into()).is_err() {
                        break;
                    }
                }
            });
            Ok(Connection::new(outgoing, incoming))
        }
    }

    #[tokio::test]
    async fn channel_round_trip() {
        let transport = ChannelTransport::new(echo_factory());
        let mut connection = transport.connect().await.unwrap();
        connection.outgoing.send(Request::Quit { seq: 3 }).unwrap();
        assert_eq!(
            connection.incoming.recv().await,
            Some(ServerMessage::Response(Response::ok(3)))
        );
    }

    #[tokio::test]
    async fn offline_refuses_and_severs() {
        let transport = ChannelTransport::offline(echo_factory());
        let err = transport.connect().await.unwrap_err();
        assert!(err.is_retryable());

        transport.set_online(true);
        let mut connection = transport.connect().await.unwrap();
        transport.set_online(false);
        assert_eq!(connection.incoming.recv().await, None);
    }

    #[tokio::test]
    async fn tcp_refused_is_retryable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = TcpTransport::new(addr.to_string()).connect().await.unwrap_err();
        assert!(err.is_retryable());
    }
}
