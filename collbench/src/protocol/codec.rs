use crate::error::{BenchError, Result};
use crate::protocol::header::{HEADER_SIZE, Header};
use crate::protocol::message::BenchMessage;
use crate::types::Priority;

/// Encode a `BenchMessage` into a framed byte buffer: `[header][rkyv payload]`.
pub fn encode_message(msg: &BenchMessage, priority: Priority) -> Result<Vec<u8>> {
    let payload = rkyv::to_bytes::<rkyv::rancor::Error>(msg)
        .map_err(|e| BenchError::EncodeFailed(e.to_string()))?;

    if payload.len() > u32::MAX as usize {
        return Err(BenchError::EncodeFailed(format!(
            "payload too large for framed header: {} bytes exceeds u32::MAX",
            payload.len()
        )));
    }

    let header = Header {
        payload_length: payload.len() as u32,
        priority: priority as u8,
        message_type: msg.message_type(),
    };

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a framed byte buffer back into a `(Header, BenchMessage)`.
pub fn decode_message(buf: &[u8]) -> Result<(Header, BenchMessage)> {
    if buf.len() < HEADER_SIZE {
        return Err(BenchError::DecodeFailed(format!(
            "buffer too short: {} < {HEADER_SIZE}",
            buf.len()
        )));
    }

    let header_bytes: &[u8; HEADER_SIZE] = buf[..HEADER_SIZE]
        .try_into()
        .map_err(|_| BenchError::DecodeFailed("header slice length mismatch".into()))?;

    let header = Header::decode(header_bytes)
        .ok_or_else(|| BenchError::DecodeFailed("invalid header: unknown message type".into()))?;

    let payload_end = HEADER_SIZE + header.payload_length as usize;
    if buf.len() < payload_end {
        return Err(BenchError::DecodeFailed(format!(
            "buffer too short for payload: {} < {payload_end}",
            buf.len()
        )));
    }

    let msg = rkyv::from_bytes::<BenchMessage, rkyv::rancor::Error>(&buf[HEADER_SIZE..payload_end])
        .map_err(|e| BenchError::DecodeFailed(e.to_string()))?;

    if msg.message_type() != header.message_type {
        return Err(BenchError::DecodeFailed(format!(
            "header says {:?} but payload is {:?}",
            header.message_type,
            msg.message_type()
        )));
    }

    Ok((header, msg))
}

/// Read one `[header][payload]` frame from a bidirectional handshake stream.
pub async fn read_framed(recv: &mut quinn::RecvStream, what: &str) -> Result<BenchMessage> {
    let mut header_buf = [0u8; HEADER_SIZE];
    recv.read_exact(&mut header_buf)
        .await
        .map_err(|e| BenchError::transport_with_source(format!("read {what} header"), e))?;
    let payload_len =
        u32::from_le_bytes([header_buf[0], header_buf[1], header_buf[2], header_buf[3]]) as usize;

    let mut full_buf = vec![0u8; HEADER_SIZE + payload_len];
    full_buf[..HEADER_SIZE].copy_from_slice(&header_buf);
    recv.read_exact(&mut full_buf[HEADER_SIZE..])
        .await
        .map_err(|e| BenchError::transport_with_source(format!("read {what} payload"), e))?;

    let (_, msg) = decode_message(&full_buf)?;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::header::MessageType;
    use crate::protocol::message::MemoryDescriptor;

    #[test]
    fn test_encode_sets_header_fields() {
        let msg = BenchMessage::Hello {
            protocol_version: 1,
            requested_rank: Some(2),
            mesh_port: 4000,
            hostname: "node-a".into(),
            cluster_token: b"secret".to_vec(),
        };
        let buf = encode_message(&msg, Priority::Critical).unwrap();
        let (header, decoded) = decode_message(&buf).unwrap();
        assert_eq!(header.priority, Priority::Critical as u8);
        assert_eq!(header.message_type, MessageType::Bootstrap);
        assert_eq!(header.payload_length as usize, buf.len() - HEADER_SIZE);
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_memory_descriptor_message() {
        let msg = BenchMessage::Memory {
            tag: 0,
            descriptor: MemoryDescriptor {
                id: 7,
                owner: 1,
                base: 0x7f00_0000_0000,
                len: 1 << 20,
                transports: 0b11,
            },
        };
        let buf = encode_message(&msg, Priority::Realtime).unwrap();
        let (header, decoded) = decode_message(&buf).unwrap();
        assert_eq!(header.message_type, MessageType::Setup);
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_buffer_too_short() {
        let err = decode_message(&[0u8; 4]).unwrap_err().to_string();
        assert!(err.contains("too short"), "got: {err}");
    }

    #[test]
    fn test_decode_truncated_payload() {
        let msg = BenchMessage::Barrier { epoch: 1 };
        let mut buf = encode_message(&msg, Priority::Critical).unwrap();
        buf.truncate(HEADER_SIZE + 2);
        assert!(decode_message(&buf).is_err());
    }

    #[test]
    fn test_decode_rejects_mislabelled_type() {
        let msg = BenchMessage::Barrier { epoch: 9 };
        let mut buf = encode_message(&msg, Priority::Critical).unwrap();
        buf[5] = MessageType::Setup as u8;
        assert!(decode_message(&buf).is_err());
    }
}
