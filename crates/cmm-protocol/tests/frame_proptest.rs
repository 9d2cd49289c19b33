use proptest::prelude::*;

use cmm_protocol::legacy::{LegacyFrame, LegacyType, LEGACY_HEADER_SIZE};
use cmm_protocol::{ConfigUpdate, Data, Message, MessageCodec, NodeId, ProtocolError};
use cmm_transport::{BufferPool, FrameHeader, FRAME_MTU, FRAME_VERSION, HEADER_SIZE};

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

fn codec() -> MessageCodec {
    MessageCodec::new(BufferPool::new(2))
}

fn encode(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = bytes::BytesMut::new();
    codec().encode(msg, &mut buf)?;
    Ok(buf.to_vec())
}

fn arb_node() -> impl Strategy<Value = NodeId> {
    prop_oneof![
        (0..1000i32).prop_map(NodeId::new),
        Just(NodeId::BROADCAST),
        Just(NodeId::PEER),
    ]
}

proptest! {
    /// Arbitrary bytes never panic the decoder.
    #[test]
    fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = block_on(codec().decode(&bytes));
    }

    /// A valid header in front of garbage decodes to its own type or fails.
    #[test]
    fn garbage_payload_never_panics(
        frame_type in 1..=14u32,
        payload in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let header = FrameHeader {
            version: FRAME_VERSION,
            frame_id: 1,
            frame_type,
            size: payload.len() as u32,
            source: NodeId::new(1),
            destination: NodeId::new(2),
            request_id: 0,
            from_network: true,
        };
        let mut frame = header.encode().to_vec();
        frame.extend_from_slice(&payload);

        if let Ok(msg) = block_on(codec().decode(&frame)) {
            prop_assert_eq!(msg.frame_type().code(), frame_type);
            prop_assert!(msg.from_network);
        }
    }

    #[test]
    fn data_frames_keep_every_field(
        frame_id in any::<u32>(),
        source in arb_node(),
        destination in arb_node(),
        request_id in any::<i32>(),
        topic in any::<u16>(),
        body in prop::collection::vec(any::<u8>(), 0..(FRAME_MTU - 6)),
    ) {
        let msg = Message::new(frame_id, source, destination, Data { topic, body })
            .with_request_id(request_id);
        let bytes = encode(&msg).unwrap();
        prop_assert!(bytes.len() <= HEADER_SIZE + FRAME_MTU);

        let decoded = block_on(codec().decode(&bytes)).unwrap();
        prop_assert_eq!(decoded.frame_id, frame_id);
        prop_assert_eq!(decoded.source, source);
        prop_assert_eq!(decoded.destination, destination);
        prop_assert_eq!(decoded.request_id, request_id);
        prop_assert_eq!(decoded.payload, msg.payload);
    }

    #[test]
    fn config_entries_survive(
        version in any::<u64>(),
        entries in prop::collection::btree_map("[a-z.]{1,12}", "[ -~]{0,24}", 0..16),
    ) {
        let msg = Message::new(9, NodeId::new(1), NodeId::new(2), ConfigUpdate { version, entries });
        let decoded = block_on(codec().decode(&encode(&msg).unwrap())).unwrap();
        prop_assert_eq!(decoded.payload, msg.payload);
    }

    /// Oversized bodies fail at encode time, never on the wire.
    #[test]
    fn oversized_data_is_refused(extra in 1..512usize) {
        let body = vec![0u8; FRAME_MTU - 6 + extra];
        let msg = Message::new(1, NodeId::new(1), NodeId::new(2), Data { topic: 0, body });
        let is_too_large = matches!(encode(&msg), Err(ProtocolError::PayloadTooLarge { .. }));
        prop_assert!(is_too_large);
    }

    /// Every well-formed legacy frame re-encodes to its exact bytes.
    #[test]
    fn legacy_bytes_are_stable(
        source in any::<u8>(),
        destination in any::<u8>(),
        kind in 1..=6u8,
        extra in prop::collection::vec(any::<u8>(), 12),
    ) {
        let Some(legacy_type) = LegacyType::from_code(kind) else {
            return Ok(());
        };
        let header: [u8; LEGACY_HEADER_SIZE] = [source, destination, kind];
        let extra = &extra[..legacy_type.extra_len()];

        let frame = LegacyFrame::decode(header, extra).unwrap();
        let mut expected = header.to_vec();
        expected.extend_from_slice(extra);
        prop_assert_eq!(frame.encode(), expected);
    }

    #[test]
    fn legacy_length_mismatch_is_malformed(
        kind in 1..=6u8,
        len in 0..16usize,
    ) {
        let legacy_type = LegacyType::from_code(kind).unwrap();
        prop_assume!(len != legacy_type.extra_len());
        let extra = vec![0u8; len];
        let is_malformed = matches!(
            LegacyFrame::decode([1, 2, kind], &extra),
            Err(ProtocolError::Malformed { .. })
        );
        prop_assert!(is_malformed);
    }
}
