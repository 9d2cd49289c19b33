//! Endpoint behaviour over real localhost sockets.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use cmm_transport::{
    read_fully, write_fully, Endpoint, FrameCodec, FrameHeader, Incoming, NodeId, ReadPolicy,
    TransportConfig, TransportError, FRAME_VERSION, HEADER_SIZE,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Header plus raw bytes; enough to exercise the endpoint.
struct RawCodec;

#[derive(Debug, Clone, PartialEq)]
struct Raw {
    source: i32,
    body: Vec<u8>,
}

fn header_for(source: i32, size: usize) -> FrameHeader {
    FrameHeader {
        version: FRAME_VERSION,
        frame_id: 1,
        frame_type: 99,
        size: size as u32,
        source: NodeId::new(source),
        destination: NodeId::PEER,
        request_id: 0,
        from_network: false,
    }
}

#[async_trait]
impl FrameCodec for RawCodec {
    type Message = Raw;
    type Error = TransportError;

    async fn read_message(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<Raw, TransportError> {
        let policy = ReadPolicy::default();
        let mut head = [0u8; HEADER_SIZE];
        read_fully(reader, &mut head, policy).await?;
        let header = FrameHeader::decode(&head)?;
        let mut body = vec![0u8; header.payload_len()];
        read_fully(reader, &mut body, policy).await?;
        Ok(Raw {
            source: header.source.get(),
            body,
        })
    }

    async fn write_message(
        &self,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        msg: &Raw,
    ) -> Result<(), TransportError> {
        let mut frame = header_for(msg.source, msg.body.len()).encode().to_vec();
        frame.extend_from_slice(&msg.body);
        write_fully(writer, &frame, Duration::from_secs(2)).await
    }

    fn is_frame_error(&self, err: &TransportError) -> bool {
        err.is_frame_violation()
    }

    fn loses_framing(&self, err: &TransportError) -> bool {
        err.is_frame_violation()
    }
}

fn local_config() -> TransportConfig {
    TransportConfig::new().listen_addr("127.0.0.1:0".parse().unwrap())
}

async fn bind() -> (Endpoint<RawCodec>, mpsc::Receiver<Incoming<Raw>>) {
    Endpoint::bind(local_config(), RawCodec).await.unwrap()
}

async fn next(rx: &mut mpsc::Receiver<Incoming<Raw>>) -> Incoming<Raw> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("frame within 5s")
        .expect("endpoint still open")
}

fn raw(source: i32, body: &[u8]) -> Raw {
    Raw {
        source,
        body: body.to_vec(),
    }
}

#[tokio::test]
async fn send_and_reply_on_same_channel() {
    let (a, mut a_rx) = bind().await;
    let (b, mut b_rx) = bind().await;

    a.send_to(b.local_addr(), &raw(1, b"ping")).await.unwrap();
    let got = next(&mut b_rx).await;
    assert_eq!(got.message, raw(1, b"ping"));

    // `from` is a's ephemeral side of the accepted channel; replying to it
    // reuses that channel.
    b.send_to(got.from, &raw(2, b"pong")).await.unwrap();
    let reply = next(&mut a_rx).await;
    assert_eq!(reply.message, raw(2, b"pong"));
    assert_eq!(reply.from, b.local_addr());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn fan_out_counts_successes() {
    let (a, _a_rx) = bind().await;
    let (b, mut b_rx) = bind().await;
    let (c, mut c_rx) = bind().await;

    // Nothing listens on port 1 on localhost.
    let dead: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let delivered = a
        .broadcast(&raw(1, b"hello"), &[b.local_addr(), c.local_addr(), dead])
        .await;
    assert_eq!(delivered, 2);
    assert_eq!(next(&mut b_rx).await.message.body, b"hello");
    assert_eq!(next(&mut c_rx).await.message.body, b"hello");
}

#[tokio::test]
async fn connect_failure_is_reported() {
    let (a, _rx) = bind().await;
    let err = a
        .send_to("127.0.0.1:1".parse().unwrap(), &raw(1, b"x"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Connect { .. }));
}

#[tokio::test]
async fn bad_header_drops_the_channel() {
    let (b, mut b_rx) = bind().await;
    let mut stream = tokio::net::TcpStream::connect(b.local_addr()).await.unwrap();

    let mut corrupt = header_for(7, 0).encode();
    corrupt[0] = 0xFF;
    stream.write_all(&corrupt).await.unwrap();
    // Whatever follows a refused header is never parsed.
    let mut good = header_for(7, 3).encode().to_vec();
    good.extend_from_slice(b"abc");
    let _ = stream.write_all(&good).await;

    let mut byte = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut byte))
        .await
        .expect("channel closed within 5s");
    assert_eq!(read.unwrap_or(0), 0, "endpoint hung up");
    assert!(
        tokio::time::timeout(Duration::from_millis(200), b_rx.recv())
            .await
            .is_err(),
        "nothing delivered from a desynchronised channel"
    );

    // A fresh channel still works.
    let mut fresh = tokio::net::TcpStream::connect(b.local_addr()).await.unwrap();
    fresh.write_all(&good).await.unwrap();
    assert_eq!(next(&mut b_rx).await.message, raw(7, b"abc"));
}

#[tokio::test]
async fn send_after_shutdown_fails() {
    let (a, _rx) = bind().await;
    let (b, _b_rx) = bind().await;
    a.shutdown().await;
    assert!(a.is_shutdown());
    let err = a.send_to(b.local_addr(), &raw(1, b"x")).await.unwrap_err();
    assert!(matches!(err, TransportError::Shutdown));
    assert_eq!(a.broadcast(&raw(1, b"x"), &[b.local_addr()]).await, 0);
}

#[tokio::test]
async fn channel_closed_by_peer_is_forgotten() {
    let (a, _a_rx) = bind().await;
    let (b, mut b_rx) = bind().await;

    a.send_to(b.local_addr(), &raw(1, b"one")).await.unwrap();
    next(&mut b_rx).await;
    assert_eq!(a.connected_peers().await, vec![b.local_addr()]);

    b.shutdown().await;
    drop(b_rx);

    // a's read half sees EOF once b drops its side and clears the entry.
    let mut cleared = false;
    for _ in 0..50 {
        if a.connected_peers().await.is_empty() {
            cleared = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(cleared, "closed channel should leave the cache");
}
