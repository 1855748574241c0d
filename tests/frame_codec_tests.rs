use camlink::frame::{
    CommandOp, Frame, FrameError, StatusCode, CHUNK_HEADER_LEN, FRAME_MARKER, MAX_STATUS_DETAIL,
    MIN_TRANSACTION_SIZE,
};
use camlink::packet::DataChunk;

const TRANSACTION: usize = 256;

#[test]
fn test_command_frame_round_trip() {
    let frame = Frame::command(CommandOp::Capture, 0xDEAD_BEEF_0042);
    let encoded = frame.encode(TRANSACTION).unwrap();

    assert_eq!(encoded.len(), TRANSACTION);
    assert_eq!(encoded[0], FRAME_MARKER);
    // Everything past the header is zero padding.
    assert!(encoded[13..].iter().all(|&b| b == 0));

    assert_eq!(Frame::decode(&encoded).unwrap(), frame);
}

#[test]
fn test_chunk_request_carries_index() {
    let frame = Frame::command(CommandOp::RequestChunk { index: 1638 }, 7);
    let encoded = frame.encode(TRANSACTION).unwrap();

    match Frame::decode(&encoded).unwrap() {
        Frame::Command {
            op: CommandOp::RequestChunk { index },
            session_id,
        } => {
            assert_eq!(index, 1638);
            assert_eq!(session_id, 7);
        }
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[test]
fn test_status_frame_round_trip() {
    let frame = Frame::status(StatusCode::CaptureFailed, "sensor fault");
    let encoded = frame.encode(MIN_TRANSACTION_SIZE).unwrap();

    match Frame::decode(&encoded).unwrap() {
        Frame::Status { code, detail } => {
            assert_eq!(code, StatusCode::CaptureFailed);
            assert_eq!(detail.as_str(), "sensor fault");
        }
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[test]
fn test_status_detail_truncates_to_capacity() {
    let long = "a very long diagnostic message that cannot possibly fit";
    let frame = Frame::status(StatusCode::Rejected, long);

    match frame {
        Frame::Status { detail, .. } => {
            assert_eq!(detail.len(), MAX_STATUS_DETAIL);
            assert!(long.starts_with(detail.as_str()));
        }
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[test]
fn test_chunk_frame_round_trip() {
    let chunk = DataChunk {
        index: 3,
        total: 9,
        payload: vec![0x11; 200],
    };
    let encoded = Frame::Chunk(chunk.clone()).encode(TRANSACTION).unwrap();

    assert_eq!(Frame::decode(&encoded).unwrap(), Frame::Chunk(chunk));
}

#[test]
fn test_short_final_chunk_survives_padding() {
    // The frame is padded to the transaction width; the length field must
    // keep the payload's true size.
    let chunk = DataChunk {
        index: 8,
        total: 9,
        payload: vec![0xAB; 60],
    };
    let encoded = Frame::Chunk(chunk.clone()).encode(TRANSACTION).unwrap();
    assert_eq!(encoded.len(), TRANSACTION);

    match Frame::decode(&encoded).unwrap() {
        Frame::Chunk(decoded) => assert_eq!(decoded.payload, chunk.payload),
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[test]
fn test_decode_rejects_missing_marker() {
    let mut encoded = Frame::command(CommandOp::Capture, 1).encode(TRANSACTION).unwrap();
    encoded[0] = 0x00;
    assert!(matches!(Frame::decode(&encoded), Err(FrameError::Malformed(_))));
}

#[test]
fn test_decode_rejects_idle_bus_noise() {
    assert!(Frame::decode(&vec![0u8; TRANSACTION]).is_err());
    assert!(Frame::decode(&[]).is_err());
    assert!(Frame::decode(&[FRAME_MARKER; 8]).is_err());
}

#[test]
fn test_decode_rejects_unknown_tag_and_opcode() {
    let mut encoded = Frame::command(CommandOp::Capture, 1).encode(TRANSACTION).unwrap();
    encoded[1] = 0x7F;
    assert!(Frame::decode(&encoded).is_err());

    let mut encoded = Frame::command(CommandOp::Capture, 1).encode(TRANSACTION).unwrap();
    encoded[2] = 0x7F;
    assert!(Frame::decode(&encoded).is_err());
}

#[test]
fn test_decode_rejects_total_count_corruption() {
    let chunk = DataChunk {
        index: 0,
        total: 4,
        payload: vec![1, 2, 3],
    };
    let mut encoded = Frame::Chunk(chunk).encode(TRANSACTION).unwrap();
    // Flip one byte of the redundant copy of the total-count.
    encoded[6] ^= 0xFF;

    assert_eq!(
        Frame::decode(&encoded),
        Err(FrameError::Malformed("redundant total-count mismatch"))
    );
}

#[test]
fn test_decode_rejects_inconsistent_chunk_header() {
    // Index at or past the total-count.
    let mut encoded = vec![0u8; TRANSACTION];
    encoded[0] = FRAME_MARKER;
    encoded[1] = 0x03;
    encoded[2..4].copy_from_slice(&5u16.to_le_bytes());
    encoded[4..6].copy_from_slice(&5u16.to_le_bytes());
    encoded[6..8].copy_from_slice(&5u16.to_le_bytes());
    assert!(Frame::decode(&encoded).is_err());

    // Zero total-count.
    encoded[2..4].copy_from_slice(&0u16.to_le_bytes());
    encoded[4..6].copy_from_slice(&0u16.to_le_bytes());
    encoded[6..8].copy_from_slice(&0u16.to_le_bytes());
    assert!(Frame::decode(&encoded).is_err());
}

#[test]
fn test_decode_rejects_payload_length_overrun() {
    let chunk = DataChunk {
        index: 0,
        total: 1,
        payload: vec![7; 10],
    };
    let mut encoded = Frame::Chunk(chunk).encode(TRANSACTION).unwrap();
    let bogus = (TRANSACTION as u16) + 1;
    encoded[8..10].copy_from_slice(&bogus.to_le_bytes());

    assert!(Frame::decode(&encoded).is_err());
}

#[test]
fn test_encode_enforces_transaction_bounds() {
    let frame = Frame::command(CommandOp::Capture, 1);
    assert!(frame.encode(MIN_TRANSACTION_SIZE - 1).is_err());
    assert!(frame.encode(MIN_TRANSACTION_SIZE).is_ok());

    let oversize = Frame::Chunk(DataChunk {
        index: 0,
        total: 1,
        payload: vec![0; TRANSACTION],
    });
    assert!(oversize.encode(TRANSACTION).is_err());

    let exact = Frame::Chunk(DataChunk {
        index: 0,
        total: 1,
        payload: vec![0; TRANSACTION - CHUNK_HEADER_LEN],
    });
    assert!(exact.encode(TRANSACTION).is_ok());
}
