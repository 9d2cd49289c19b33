//! Current frame codec: 32-byte header plus typed payload.
//!
//! Both directions borrow a buffer from the shared pool for the duration of
//! one frame; the guard returns it on every path, errors included.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};

use cmm_transport::{
    read_fully, skip_bytes, write_fully, BufferPool, FrameCodec, FrameHeader, ReadPolicy,
    TransportConfig, FRAME_MTU, FRAME_VERSION, HEADER_SIZE,
};

use crate::error::{ErrorKind, ProtocolError};
use crate::message::Message;
use crate::payload::PayloadReader;
use crate::registry;

#[derive(Debug, Clone)]
pub struct MessageCodec {
    pool: Arc<BufferPool>,
    read_policy: ReadPolicy,
    write_timeout: Duration,
}

impl MessageCodec {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            read_policy: ReadPolicy::default(),
            write_timeout: Duration::from_secs(2),
        }
    }

    pub fn from_config(pool: Arc<BufferPool>, config: &TransportConfig) -> Self {
        Self {
            pool,
            read_policy: config.read_policy(),
            write_timeout: config.get_write_timeout(),
        }
    }

    pub fn with_read_policy(mut self, policy: ReadPolicy) -> Self {
        self.read_policy = policy;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Serialize `msg` into `buf` as one complete frame.
    ///
    /// The payload is written after the header region first, then the header
    /// is back-filled with the final size.
    pub fn encode(&self, msg: &Message, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.clear();
        buf.resize(HEADER_SIZE, 0);
        msg.payload.copy_into(buf)?;

        let size = buf.len() - HEADER_SIZE;
        if size > FRAME_MTU {
            return Err(ProtocolError::PayloadTooLarge {
                size,
                max: FRAME_MTU,
            });
        }

        let header = FrameHeader {
            version: FRAME_VERSION,
            frame_id: msg.frame_id,
            frame_type: msg.frame_type().code(),
            size: size as u32,
            source: msg.source,
            destination: msg.destination,
            request_id: msg.request_id,
            from_network: msg.from_network,
        };
        header.encode_into(&mut buf[..HEADER_SIZE]);
        Ok(())
    }

    /// Write one frame to `channel`.
    pub async fn send<W>(&self, msg: &Message, channel: &mut W) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let mut buf = self.pool.checkout().await?;
        self.encode(msg, &mut buf)?;
        write_fully(channel, &buf, self.write_timeout).await?;
        tracing::trace!(frame_id = msg.frame_id, size = buf.len() - HEADER_SIZE, "sent {}", msg.label());
        Ok(())
    }

    /// Read one frame from `channel`, retrying stalled reads `retries` times.
    ///
    /// The header is validated before anything else is read: a bad version
    /// or an oversized declared size fails without touching the payload.
    pub async fn receive<R>(&self, channel: &mut R, retries: u32) -> Result<Message, ProtocolError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let policy = self.read_policy.with_retries(retries);
        let mut buf = self.pool.checkout().await?;
        buf.resize(HEADER_SIZE, 0);
        read_fully(channel, &mut buf[..HEADER_SIZE], policy).await?;
        let header = FrameHeader::decode(&buf[..HEADER_SIZE])?;
        let size = header.payload_len();

        let mut payload = match registry::create_payload(header.frame_type) {
            Ok(payload) => payload,
            Err(e) => {
                // Keep the channel on a frame boundary before rejecting.
                skip_bytes(channel, size, policy).await?;
                return Err(e);
            }
        };

        buf.resize(HEADER_SIZE + size, 0);
        read_fully(channel, &mut buf[HEADER_SIZE..], policy).await?;

        let mut reader = PayloadReader::new(&buf[HEADER_SIZE..], payload.label());
        payload.copy_from(&mut reader)?;
        if reader.remaining() != 0 {
            return Err(reader.invalid(format!("{} trailing bytes", reader.remaining())));
        }

        let mut msg = Message::new(header.frame_id, header.source, header.destination, payload);
        msg.request_id = header.request_id;
        msg.from_network = header.from_network;
        tracing::trace!(frame_id = msg.frame_id, source = %msg.source, "received {}", msg.label());
        Ok(msg)
    }

    /// Decode a complete frame held in memory (a datagram, a test vector).
    pub async fn decode(&self, mut frame: &[u8]) -> Result<Message, ProtocolError> {
        let retries = self.read_policy.retries;
        let msg = self.receive(&mut frame, retries).await?;
        if !frame.is_empty() {
            return Err(ProtocolError::malformed(
                msg.label(),
                format!("{} bytes after frame end", frame.len()),
            ));
        }
        Ok(msg)
    }
}

#[async_trait]
impl FrameCodec for MessageCodec {
    type Message = Message;
    type Error = ProtocolError;

    async fn read_message(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<Message, ProtocolError> {
        self.receive(reader, self.read_policy.retries).await
    }

    async fn write_message(
        &self,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        msg: &Message,
    ) -> Result<(), ProtocolError> {
        self.send(msg, writer).await
    }

    fn is_frame_error(&self, err: &ProtocolError) -> bool {
        err.kind() == ErrorKind::Protocol
    }

    fn loses_framing(&self, err: &ProtocolError) -> bool {
        err.is_header_rejection()
    }

    async fn decode_datagram(&self, datagram: &[u8]) -> Result<Message, ProtocolError> {
        self.decode(datagram).await
    }
}
