//! Length-prefixed JSON framing.
//!
//! Each packet on the wire is a 4-byte big-endian length header followed by
//! the JSON body.

use crate::packet::Packet;
use crate::WireError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Encode a packet to bytes (4-byte big-endian length + JSON).
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(packet)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a packet.
pub fn decode_packet(body: &[u8]) -> Result<Packet, serde_json::Error> {
    serde_json::from_slice(body)
}

/// Write one framed packet and flush.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = encode_packet(packet)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed packet.
///
/// A clean EOF before the header maps to [`WireError::ConnectionClosed`].
pub async fn read_packet<R>(reader: &mut R, max_frame_size: u32) -> Result<Packet, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > max_frame_size {
        return Err(WireError::FrameTooLarge {
            size: len,
            max: max_frame_size,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    Ok(decode_packet(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Action;
    use netron_types::PeerStatus;
    use serde_json::json;

    #[test]
    fn test_length_prefix() {
        let packet = Packet::request(Action::Ping, PeerStatus::Online, 1, json!(null));
        let bytes = encode_packet(&packet).unwrap();
        let len = decode_length(&[bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);
        assert_eq!(decode_packet(&bytes[4..]).unwrap(), packet);
    }

    #[tokio::test]
    async fn test_stream_framing() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let first = Packet::request(Action::Get, PeerStatus::Online, 1, json!({"def_id": 1}));
        let second = first.reply(PeerStatus::Online, json!(42));

        write_packet(&mut client, &first).await.unwrap();
        write_packet(&mut client, &second).await.unwrap();

        assert_eq!(read_packet(&mut server, 1024).await.unwrap(), first);
        assert_eq!(read_packet(&mut server, 1024).await.unwrap(), second);

        drop(client);
        assert!(matches!(
            read_packet(&mut server, 1024).await,
            Err(WireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let packet = Packet::request(Action::Ping, PeerStatus::Online, 1, json!("x".repeat(64)));
        write_packet(&mut client, &packet).await.unwrap();

        match read_packet(&mut server, 16).await {
            Err(WireError::FrameTooLarge { max, .. }) => assert_eq!(max, 16),
            other => panic!("Expected FrameTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_garbage_body_is_json_error() {
        use tokio::io::AsyncWriteExt;
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(&4u32.to_be_bytes()).await.unwrap();
        client.write_all(b"nope").await.unwrap();

        assert!(matches!(
            read_packet(&mut server, 1024).await,
            Err(WireError::Json(_))
        ));
    }
}
