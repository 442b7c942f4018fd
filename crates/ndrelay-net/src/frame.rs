//! Wire framing: the fixed 10-byte header plus NUL-delimited argument payload.
//!
//! ```text
//! offset  width  field
//! 0       2      payloadLen (big-endian, = total packet size - 2)
//! 2       1      protocolNumber (must be 1)
//! 3       1      requestCode (must be 10)
//! 4       4      forwardIp (big-endian)
//! 8       2      forwardPort (big-endian)
//! 10      ..     payload: NUL-delimited argument tokens
//! ```

use crate::error::NetError;

/// Bytes in the fixed header that precedes every packet's payload.
pub const HEADER_SIZE: usize = 10;
/// Bytes of the length-prefix + protocol + request-code, read before the
/// forward address is known to be present.
pub const PREFIX_SIZE: usize = 4;
pub const PROTOCOL_NUMBER: u8 = 1;
pub const REQUEST_CODE: u8 = 10;
/// Size of each [`crate::connection::Connection`] receive buffer.
pub const RECV_BUF_SIZE: usize = 8192;
/// Largest total packet size accepted on the wire (8 KiB - 1).
pub const MAX_PACKET_SIZE: usize = RECV_BUF_SIZE - 1;

/// The fixed header, already validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub payload_len: u16,
    pub forward_ip: u32,
    pub forward_port: u16,
}

impl Header {
    /// Total size of the packet this header describes, including the
    /// 2-byte length prefix itself (`payloadLen` is "total size - 2").
    #[must_use]
    pub const fn total_len(&self) -> usize {
        self.payload_len as usize + 2
    }

    /// Number of bytes still to be read after the 10-byte header.
    #[must_use]
    pub const fn remaining_after_header(&self) -> usize {
        self.total_len() - HEADER_SIZE
    }

    /// Parses the 4-byte length/protocol/request prefix. Returns `Err` if
    /// the protocol or request code is wrong; the caller must close the
    /// connection in that case.
    pub fn parse_prefix(buf: &[u8; PREFIX_SIZE]) -> Result<u16, NetError> {
        let payload_len = u16::from_be_bytes([buf[0], buf[1]]);
        let protocol = buf[2];
        let request = buf[3];
        if protocol != PROTOCOL_NUMBER {
            return Err(NetError::BadProtocol(protocol));
        }
        if request != REQUEST_CODE {
            return Err(NetError::BadRequestCode(request));
        }
        Ok(payload_len)
    }

    /// Parses the full 10-byte header once `HEADER_SIZE` bytes are available.
    pub fn parse(buf: &[u8; HEADER_SIZE]) -> Result<Self, NetError> {
        let prefix: [u8; PREFIX_SIZE] = buf[..PREFIX_SIZE].try_into().unwrap();
        let payload_len = Self::parse_prefix(&prefix)?;
        let forward_ip = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let forward_port = u16::from_be_bytes(buf[8..10].try_into().unwrap());
        Ok(Self { payload_len, forward_ip, forward_port })
    }
}

/// Splits a NUL-delimited payload into its argument tokens.
///
/// Consecutive NULs (an empty token) are preserved as empty strings, matching
/// the original parser which never collapses empty arguments. A payload with
/// no trailing NUL still yields its final token.
#[must_use]
pub fn parse_args(payload: &[u8]) -> Vec<String> {
    if payload.is_empty() {
        return Vec::new();
    }
    let trimmed =
        if payload.last() == Some(&0) { &payload[..payload.len() - 1] } else { payload };
    if trimmed.is_empty() {
        return vec![String::new()];
    }
    trimmed.split(|&b| b == 0).map(|tok| String::from_utf8_lossy(tok).into_owned()).collect()
}

/// Builds a full outbound packet: header (with `total-2` patched in at the
/// end) followed by every argument NUL-terminated, in order.
#[must_use]
pub fn encode_packet(forward_ip: u32, forward_port: u16, args: &[&str]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + args.iter().map(|a| a.len() + 1).sum::<usize>());
    buf.extend_from_slice(&[0, 0]); // payload length, patched below
    buf.push(PROTOCOL_NUMBER);
    buf.push(REQUEST_CODE);
    buf.extend_from_slice(&forward_ip.to_be_bytes());
    buf.extend_from_slice(&forward_port.to_be_bytes());
    for arg in args {
        buf.extend_from_slice(arg.as_bytes());
        buf.push(0);
    }
    let payload_len = (buf.len() - 2) as u16;
    buf[0..2].copy_from_slice(&payload_len.to_be_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_args_preserves_empty_tokens() {
        let payload = b"RQ\0\0100\0";
        let args = parse_args(payload);
        assert_eq!(args, vec!["RQ", "", "100"]);
    }

    #[test]
    fn parse_args_empty_payload() {
        assert!(parse_args(b"").is_empty());
    }

    #[test]
    fn encode_then_parse_roundtrips_payload() {
        let args = ["RQ", "100", "aaaaaaa0", "ENTER", "NNM", "Alice"];
        let packet = encode_packet(0x7f000001, 9000, &args);
        let header = Header::parse(&packet[..HEADER_SIZE].try_into().unwrap()).unwrap();
        assert_eq!(header.forward_ip, 0x7f00_0001);
        assert_eq!(header.forward_port, 9000);
        assert_eq!(header.total_len(), packet.len());
        let payload = &packet[HEADER_SIZE..];
        assert_eq!(parse_args(payload), args);
    }

    #[test]
    fn rejects_bad_protocol() {
        let mut packet = encode_packet(0, 0, &["x"]);
        packet[2] = 2;
        let header = Header::parse(&packet[..HEADER_SIZE].try_into().unwrap());
        assert!(matches!(header, Err(NetError::BadProtocol(2))));
    }

    #[test]
    fn rejects_bad_request_code() {
        let mut packet = encode_packet(0, 0, &["x"]);
        packet[3] = 11;
        let header = Header::parse(&packet[..HEADER_SIZE].try_into().unwrap());
        assert!(matches!(header, Err(NetError::BadRequestCode(11))));
    }
}
