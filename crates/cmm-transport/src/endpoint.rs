use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch, Mutex};

use crate::config::TransportConfig;
use crate::header::{FRAME_MTU, HEADER_SIZE};
use crate::TransportError;

/// Turns messages into bytes on a channel and back.
///
/// The endpoint owns sockets and tasks; the codec owns the wire format.
/// The same endpoint carries the native frame codec and the legacy one.
#[async_trait]
pub trait FrameCodec: Send + Sync + 'static {
    type Message: Send + Sync + 'static;
    type Error: std::error::Error + From<TransportError> + Send + Sync + 'static;

    /// Read exactly one frame. Called once the channel has bytes pending.
    async fn read_message(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<Self::Message, Self::Error>;

    /// Write exactly one frame.
    async fn write_message(
        &self,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        msg: &Self::Message,
    ) -> Result<(), Self::Error>;

    /// True when `err` rejects one frame but leaves the channel usable.
    fn is_frame_error(&self, err: &Self::Error) -> bool;

    /// True when the rejected frame's length is unknown, so the channel can
    /// no longer find the next frame boundary.
    fn loses_framing(&self, _err: &Self::Error) -> bool {
        false
    }

    async fn decode_datagram(&self, datagram: &[u8]) -> Result<Self::Message, Self::Error> {
        let mut reader = datagram;
        self.read_message(&mut reader).await
    }

    async fn encode_datagram(&self, msg: &Self::Message) -> Result<Vec<u8>, Self::Error> {
        let mut out = Vec::with_capacity(HEADER_SIZE);
        self.write_message(&mut out, msg).await?;
        Ok(out)
    }
}

/// A decoded frame and the socket address it arrived from.
#[derive(Debug, Clone)]
pub struct Incoming<M> {
    pub from: SocketAddr,
    pub message: M,
}

type Writer = Arc<Mutex<OwnedWriteHalf>>;

struct Inner<C: FrameCodec> {
    codec: C,
    config: TransportConfig,
    local_addr: SocketAddr,
    udp: Option<Arc<UdpSocket>>,
    incoming_tx: mpsc::Sender<Incoming<C::Message>>,
    /// Open channels keyed by remote address, outbound and accepted alike.
    peers: Mutex<HashMap<SocketAddr, Writer>>,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

/// A bound CMM endpoint: TCP listener, optional UDP broadcast socket and a
/// cache of open channels.
///
/// Cloning is cheap; clones share sockets and tasks.
pub struct Endpoint<C: FrameCodec> {
    inner: Arc<Inner<C>>,
}

impl<C: FrameCodec> Clone for Endpoint<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: FrameCodec> std::fmt::Debug for Endpoint<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("local_addr", &self.inner.local_addr)
            .field("broadcast", &self.inner.config.broadcast_addr)
            .finish()
    }
}

impl<C: FrameCodec> Endpoint<C> {
    /// Bind the listener (and the broadcast socket, if configured) and start
    /// accepting channels.
    pub async fn bind(
        config: TransportConfig,
        codec: C,
    ) -> Result<(Self, mpsc::Receiver<Incoming<C::Message>>), TransportError> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: config.listen_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let udp = match config.broadcast_addr {
            Some(target) => Some(Arc::new(bind_broadcast(target).await?)),
            None => None,
        };

        let (incoming_tx, incoming_rx) = mpsc::channel(config.recv_buffer);
        let (shutdown_tx, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            codec,
            config,
            local_addr,
            udp,
            incoming_tx,
            peers: Mutex::new(HashMap::new()),
            shutdown_tx,
            closed: AtomicBool::new(false),
        });

        tokio::spawn(accept_loop(Arc::clone(&inner), listener));
        if let Some(socket) = inner.udp.clone() {
            tokio::spawn(datagram_loop(Arc::clone(&inner), socket));
        }

        tracing::debug!(%local_addr, broadcast = ?inner.config.broadcast_addr, "endpoint bound");
        Ok((Self { inner }, incoming_rx))
    }

    /// Address the TCP listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn codec(&self) -> &C {
        &self.inner.codec
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Send one frame to `addr`.
    ///
    /// Reuses an open channel when there is one, otherwise connects. A
    /// channel that fails mid-write is dropped and the frame is retried once
    /// on a fresh connection.
    pub async fn send_to(&self, addr: SocketAddr, msg: &C::Message) -> Result<(), C::Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::Shutdown.into());
        }

        let (writer, reused) = match self.inner.cached_writer(addr).await {
            Some(writer) => (writer, true),
            None => (self.inner.connect(addr).await?, false),
        };

        match self.inner.write_on(&writer, msg).await {
            Ok(()) => Ok(()),
            Err(e) if self.inner.codec.is_frame_error(&e) => Err(e),
            Err(e) => {
                self.inner.forget(addr, &writer).await;
                if !reused {
                    return Err(e);
                }
                tracing::debug!(%addr, error = %e, "stale channel, reconnecting");
                let writer = self.inner.connect(addr).await?;
                let result = self.inner.write_on(&writer, msg).await;
                if result.is_err() {
                    self.inner.forget(addr, &writer).await;
                }
                result
            }
        }
    }

    /// Send one frame to every node.
    ///
    /// With a broadcast address configured this is a single UDP datagram;
    /// otherwise the frame goes over TCP to each address in `fanout`.
    /// Returns how many sends succeeded.
    pub async fn broadcast(&self, msg: &C::Message, fanout: &[SocketAddr]) -> usize {
        if self.inner.closed.load(Ordering::Acquire) {
            return 0;
        }

        if let (Some(socket), Some(target)) = (&self.inner.udp, self.inner.config.broadcast_addr) {
            let datagram = match self.inner.codec.encode_datagram(msg).await {
                Ok(datagram) => datagram,
                Err(e) => {
                    tracing::warn!(error = %e, "broadcast encode failed");
                    return 0;
                }
            };
            return match socket.send_to(&datagram, target).await {
                Ok(_) => 1,
                Err(e) => {
                    tracing::warn!(%target, error = %e, "broadcast datagram failed");
                    0
                }
            };
        }

        let mut delivered = 0;
        for addr in fanout {
            match self.send_to(*addr, msg).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!(%addr, error = %e, "broadcast fan-out send failed"),
            }
        }
        delivered
    }

    /// Drop the cached channel to `addr`, if any.
    pub async fn disconnect(&self, addr: SocketAddr) {
        self.inner.peers.lock().await.remove(&addr);
    }

    /// Remote addresses with an open channel.
    pub async fn connected_peers(&self) -> Vec<SocketAddr> {
        self.inner.peers.lock().await.keys().copied().collect()
    }

    /// Stop accepting, close every channel and end all endpoint tasks.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.peers.lock().await.clear();
        tracing::debug!(local_addr = %self.inner.local_addr, "endpoint shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl<C: FrameCodec> Inner<C> {
    async fn cached_writer(&self, addr: SocketAddr) -> Option<Writer> {
        self.peers.lock().await.get(&addr).cloned()
    }

    async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<Writer, TransportError> {
        let stream = match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(TransportError::Connect { addr, source }),
            Err(_) => {
                return Err(TransportError::Connect {
                    addr,
                    source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
                })
            }
        };
        tracing::trace!(%addr, "channel opened");
        Ok(self.register(stream, addr).await)
    }

    /// Cache the write half and start reading the other half.
    async fn register(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Writer {
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        let writer = Arc::new(Mutex::new(write));
        self.peers.lock().await.insert(addr, Arc::clone(&writer));
        tokio::spawn(read_loop(Arc::clone(self), read, addr, Arc::downgrade(&writer)));
        writer
    }

    async fn write_on(&self, writer: &Writer, msg: &C::Message) -> Result<(), C::Error> {
        let mut guard = writer.lock().await;
        self.codec.write_message(&mut *guard, msg).await
    }

    /// Remove `writer` from the cache unless it was already replaced.
    async fn forget(&self, addr: SocketAddr, writer: &Writer) {
        self.forget_weak(addr, &Arc::downgrade(writer)).await;
    }

    async fn forget_weak(&self, addr: SocketAddr, writer: &Weak<Mutex<OwnedWriteHalf>>) {
        let mut peers = self.peers.lock().await;
        if peers
            .get(&addr)
            .is_some_and(|w| Weak::ptr_eq(&Arc::downgrade(w), writer))
        {
            peers.remove(&addr);
        }
    }

    async fn deliver(&self, from: SocketAddr, message: C::Message) -> bool {
        self.incoming_tx.send(Incoming { from, message }).await.is_ok()
    }
}

async fn bind_broadcast(target: SocketAddr) -> Result<UdpSocket, TransportError> {
    let bind_addr = SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), target.port());
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|source| TransportError::Bind {
            addr: bind_addr,
            source,
        })?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

async fn accept_loop<C: FrameCodec>(inner: Arc<Inner<C>>, listener: TcpListener) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                tracing::trace!(%addr, "channel accepted");
                inner.register(stream, addr).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
}

async fn read_loop<C: FrameCodec>(
    inner: Arc<Inner<C>>,
    read: OwnedReadHalf,
    peer: SocketAddr,
    writer: Weak<Mutex<OwnedWriteHalf>>,
) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    let mut reader = BufReader::new(read);
    let mut frame_errors = 0u32;

    loop {
        // Idle channels wait here without a deadline; the read retry policy
        // only applies once a frame has started.
        let pending = tokio::select! {
            _ = shutdown.changed() => break,
            filled = reader.fill_buf() => filled.map(|bytes| !bytes.is_empty()),
        };
        match pending {
            Ok(true) => {}
            Ok(false) => {
                tracing::trace!(%peer, "channel closed by peer");
                break;
            }
            Err(e) => {
                tracing::debug!(%peer, error = %e, "channel read failed");
                break;
            }
        }

        match inner.codec.read_message(&mut reader).await {
            Ok(message) => {
                frame_errors = 0;
                if !inner.deliver(peer, message).await {
                    break;
                }
            }
            Err(e) if inner.codec.loses_framing(&e) => {
                tracing::warn!(%peer, error = %e, "rejected frame header, dropping channel");
                break;
            }
            Err(e) if inner.codec.is_frame_error(&e) => {
                frame_errors += 1;
                tracing::warn!(%peer, error = %e, frame_errors, "rejected frame");
                if frame_errors > inner.config.max_frame_errors {
                    tracing::warn!(%peer, "too many bad frames, dropping channel");
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(%peer, error = %e, "channel failed");
                break;
            }
        }
    }

    // A reconnect may already have replaced this channel's entry.
    inner.forget_weak(peer, &writer).await;
}

async fn datagram_loop<C: FrameCodec>(inner: Arc<Inner<C>>, socket: Arc<UdpSocket>) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    let mut buf = vec![0u8; HEADER_SIZE + FRAME_MTU];
    loop {
        let received = tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        let (len, from) = match received {
            Ok(pair) => pair,
            Err(e) => {
                tracing::debug!(error = %e, "datagram receive failed");
                continue;
            }
        };
        match inner.codec.decode_datagram(&buf[..len]).await {
            Ok(message) => {
                if !inner.deliver(from, message).await {
                    break;
                }
            }
            Err(e) => tracing::warn!(%from, error = %e, "rejected datagram"),
        }
    }
}
