//! A single live TCP session: receive assembly, send residue, scene
//! membership and idle timing.

use std::{
    io::{self, Read, Write},
    net::SocketAddr,
    time::Instant,
};

use mio::{Token, net::TcpStream as MioTcpStream};
use tracing::trace;

use crate::{
    error::NetError,
    frame::{self, HEADER_SIZE, Header, PREFIX_SIZE, RECV_BUF_SIZE},
};

/// Idle-probe period: PING after `T/4` of silence, close after `T`.
pub const IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(180);
pub const PING_AFTER: std::time::Duration = std::time::Duration::from_secs(180 / 4);

/// Bytes of an outbound frame a non-blocking send couldn't accept yet.
/// Invariant: present iff `start < len`.
struct SendResidue {
    buf: Vec<u8>,
    start: usize,
    len: usize,
}

/// Outcome of [`Connection::try_read`].
pub enum ReadOutcome {
    /// A complete packet sits in the receive buffer; its header has already
    /// been validated and the forward address recorded. The caller must
    /// consume it via [`Connection::take_payload`] before reading again.
    Packet,
    /// No complete packet is ready yet; try again on the next readiness
    /// notification.
    WouldBlock,
}

/// Outcome of [`Connection::send`].
#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// The packet was accepted: either written fully, or queued as the new
    /// send residue.
    Accepted,
    /// A residue was already pending, so this packet was dropped to
    /// preserve FIFO order of the residue (loss-tolerant bus semantics).
    Dropped,
}

pub struct Connection {
    pub id: String,
    pub token: Token,
    stream: MioTcpStream,
    peer_addr: SocketAddr,

    pub client_id: Option<String>,
    pub nickname: Option<String>,
    pub scene_name: Option<String>,
    pub scene_url: Option<String>,

    forward_ip: u32,
    forward_port: u16,

    pub start_time: Instant,
    pub last_receive_time: Instant,
    pub last_send_time: Instant,

    recv_buf: Box<[u8; RECV_BUF_SIZE]>,
    bytes_read: usize,
    bytes_expected: usize,

    send_residue: Option<SendResidue>,
    /// Mirrors whether WRITABLE interest is currently registered for this
    /// socket. Invariant: `writable_armed == has_send_residue()`, enforced
    /// by the event loop's per-turn resync rather than on every send.
    writable_armed: bool,

    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
}

impl Connection {
    pub fn new(id: String, token: Token, stream: MioTcpStream, peer_addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id,
            token,
            stream,
            peer_addr,
            client_id: None,
            nickname: None,
            scene_name: None,
            scene_url: None,
            forward_ip: 0,
            forward_port: 0,
            start_time: now,
            last_receive_time: now,
            last_send_time: now,
            recv_buf: Box::new([0; RECV_BUF_SIZE]),
            bytes_read: 0,
            bytes_expected: 0,
            send_residue: None,
            writable_armed: false,
            packets_received: 0,
            bytes_received: 0,
            packets_sent: 0,
            bytes_sent: 0,
        }
    }

    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[must_use]
    pub const fn forward_ip(&self) -> u32 {
        self.forward_ip
    }

    #[must_use]
    pub const fn forward_port(&self) -> u16 {
        self.forward_port
    }

    /// Clears SCU and the forward address so a later ENTER can rebind, per
    /// the BYE handler.
    pub fn clear_scene_binding(&mut self) {
        self.scene_url = None;
        self.forward_ip = 0;
        self.forward_port = 0;
    }

    /// `0 <= bytes_read <= bytes_expected < RECV_BUF_SIZE` at every turn
    /// boundary (P4); before the header is parsed `bytes_expected` is still
    /// 0 and only bounded by the 4-byte prefix read. Exposed for tests.
    #[must_use]
    pub fn invariant_holds(&self) -> bool {
        self.bytes_read < RECV_BUF_SIZE
            && (self.bytes_expected == 0 || self.bytes_read <= self.bytes_expected)
    }

    /// `true` iff a send residue is queued (P3's positive half).
    #[must_use]
    pub fn has_send_residue(&self) -> bool {
        self.send_residue.is_some()
    }

    #[must_use]
    pub const fn is_writable_armed(&self) -> bool {
        self.writable_armed
    }

    pub fn set_writable_armed(&mut self, armed: bool) {
        self.writable_armed = armed;
    }

    #[must_use]
    pub fn mio_stream(&mut self) -> &mut MioTcpStream {
        &mut self.stream
    }

    /// Reads as much as is available, non-blocking, assembling one complete
    /// packet. Mirrors the original's tri-state return: a validated header
    /// (`ReadOutcome::Packet`), would-block, or a fatal [`NetError`] the
    /// caller must translate into a close.
    pub fn try_read(&mut self) -> Result<ReadOutcome, NetError> {
        loop {
            let read_to = if self.bytes_expected == 0 { RECV_BUF_SIZE - 1 } else { self.bytes_expected };
            if self.bytes_read >= read_to {
                return Ok(ReadOutcome::Packet);
            }
            match self.stream.read(&mut self.recv_buf[self.bytes_read..read_to]) {
                Ok(0) => return Err(NetError::PeerClosed),
                Ok(n) => {
                    self.bytes_read += n;

                    if self.bytes_expected == 0 && self.bytes_read >= PREFIX_SIZE {
                        let prefix: [u8; PREFIX_SIZE] =
                            self.recv_buf[..PREFIX_SIZE].try_into().unwrap();
                        let payload_len = Header::parse_prefix(&prefix)?;
                        let expected = payload_len as usize + 2;
                        if expected > frame::MAX_PACKET_SIZE || expected < HEADER_SIZE {
                            return Err(NetError::FrameTooLarge(expected));
                        }
                        self.bytes_expected = expected;
                    }

                    if self.bytes_expected != 0 && self.bytes_read >= self.bytes_expected {
                        let header: [u8; HEADER_SIZE] =
                            self.recv_buf[..HEADER_SIZE].try_into().unwrap();
                        let header = Header::parse(&header)?;
                        self.forward_ip = header.forward_ip;
                        self.forward_port = header.forward_port;
                        self.recv_buf[self.bytes_read] = 0;
                        self.packets_received += 1;
                        self.bytes_received += self.bytes_read as u64;
                        return Ok(ReadOutcome::Packet);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::WouldBlock),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(NetError::Io(e)),
            }
        }
    }

    /// Returns the NUL-delimited payload of the assembled packet (offset
    /// `HEADER_SIZE..bytes_read`) and the packet's total wire length
    /// (header included), then resets the receive counters to 0/0 so the
    /// next `try_read` starts a fresh frame. The wire length is what
    /// feeds the statistics ring — not the summed length of the parsed
    /// argument strings, which drops the header and every NUL delimiter.
    pub fn take_payload(&mut self) -> (Vec<String>, u64) {
        let args = frame::parse_args(&self.recv_buf[HEADER_SIZE..self.bytes_read]);
        let wire_len = self.bytes_read as u64;
        self.bytes_read = 0;
        self.bytes_expected = 0;
        (args, wire_len)
    }

    /// Sends `buf`, following the loss-tolerant residue-first discipline
    /// from the framing spec: a pending residue is flushed first and the
    /// new packet is always dropped in that turn; only with no residue does
    /// a fresh packet get written (possibly becoming the new residue on a
    /// partial write).
    pub fn send(&mut self, buf: &[u8]) -> Result<SendOutcome, NetError> {
        if self.send_residue.is_some() {
            return self.flush_residue();
        }
        self.send_fresh(buf)
    }

    fn flush_residue(&mut self) -> Result<SendOutcome, NetError> {
        let residue = self.send_residue.as_mut().expect("flush_residue called without residue");
        match self.stream.write(&residue.buf[residue.start..residue.len]) {
            Ok(0) => Err(NetError::Io(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"))),
            Ok(n) => {
                residue.start += n;
                if residue.start >= residue.len {
                    self.send_residue = None;
                }
                Ok(SendOutcome::Dropped)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(SendOutcome::Dropped),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => self.flush_residue(),
            Err(e) => Err(NetError::Io(e)),
        }
    }

    fn send_fresh(&mut self, buf: &[u8]) -> Result<SendOutcome, NetError> {
        match self.stream.write(buf) {
            Ok(n) if n == buf.len() => {
                self.packets_sent += 1;
                self.bytes_sent += n as u64;
                Ok(SendOutcome::Accepted)
            }
            Ok(n) => {
                trace!(conn_id = %self.id, sent = n, total = buf.len(), "partial write, queueing residue");
                self.send_residue =
                    Some(SendResidue { buf: buf[n..].to_vec(), start: 0, len: buf.len() - n });
                self.packets_sent += 1;
                self.bytes_sent += buf.len() as u64;
                Ok(SendOutcome::Accepted)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.send_residue = Some(SendResidue { buf: buf.to_vec(), start: 0, len: buf.len() });
                self.packets_sent += 1;
                self.bytes_sent += buf.len() as u64;
                Ok(SendOutcome::Accepted)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => self.send_fresh(buf),
            Err(e) => Err(NetError::Io(e)),
        }
    }

    /// Builds and sends an argument-list packet, echoing this connection's
    /// recorded forward address — the `sendArguments` helper from the
    /// original, specialised to this connection.
    pub fn send_arguments(&mut self, args: &[&str]) -> Result<SendOutcome, NetError> {
        let packet = frame::encode_packet(self.forward_ip, self.forward_port, args);
        self.send(&packet)
    }

    #[must_use]
    pub fn idle_past_ping_threshold(&self, now: Instant) -> bool {
        now.duration_since(self.last_receive_time) > PING_AFTER
            && now.duration_since(self.last_send_time) > PING_AFTER
    }

    #[must_use]
    pub fn idle_past_timeout(&self, now: Instant) -> bool {
        now.duration_since(self.last_receive_time) > IDLE_TIMEOUT
    }

    /// Closes the socket: sets `SO_LINGER(0)` so the kernel drops any
    /// unsent bytes immediately rather than lingering on `close()`, then
    /// shuts down both directions.
    pub fn shutdown(&mut self) {
        set_linger_zero(&self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// Sets `SO_LINGER` to `{on: 1, linger: 0}` so closing this socket drops
/// unsent data immediately instead of lingering in the background.
fn set_linger_zero(stream: &MioTcpStream) {
    use std::os::fd::AsRawFd;
    let linger = libc::linger { l_onoff: 1, l_linger: 0 };
    let fd = stream.as_raw_fd();
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            (&raw const linger).cast::<libc::c_void>(),
            core::mem::size_of::<libc::linger>() as libc::socklen_t,
        );
    }
}

#[cfg(test)]
mod tests {
    use std::net::{TcpListener, TcpStream as StdTcpStream};

    use super::*;

    fn connected_pair() -> (MioTcpStream, StdTcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (MioTcpStream::from_std(server), client)
    }

    fn test_connection() -> (Connection, StdTcpStream) {
        let (server, client) = connected_pair();
        let peer = client.local_addr().unwrap();
        let conn = Connection::new("00010001".into(), Token(0), server, peer);
        (conn, client)
    }

    #[test]
    fn fresh_connection_has_no_residue_and_satisfies_invariant() {
        let (conn, _client) = test_connection();
        assert!(!conn.has_send_residue());
        assert!(conn.invariant_holds());
    }

    #[test]
    fn clear_scene_binding_resets_scu_and_forward_address() {
        let (mut conn, _client) = test_connection();
        conn.scene_url = Some("rid://r1".to_string());
        conn.clear_scene_binding();
        assert!(conn.scene_url.is_none());
        assert_eq!(conn.forward_ip(), 0);
        assert_eq!(conn.forward_port(), 0);
    }

    #[test]
    fn read_assembles_a_complete_packet() {
        use std::io::Write as _;
        let (mut conn, mut client) = test_connection();
        let packet = frame::encode_packet(0x7f000001, 4000, &["RQ", "1", "aaaaaaa0", "PING"]);
        client.write_all(&packet).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let outcome = loop {
            match conn.try_read().unwrap() {
                ReadOutcome::Packet => break ReadOutcome::Packet,
                ReadOutcome::WouldBlock => std::thread::sleep(std::time::Duration::from_millis(5)),
            }
        };
        assert!(matches!(outcome, ReadOutcome::Packet));
        let (args, wire_len) = conn.take_payload();
        assert_eq!(args, vec!["RQ", "1", "aaaaaaa0", "PING"]);
        assert_eq!(wire_len, packet.len() as u64);
        assert_eq!(conn.forward_ip(), 0x7f00_0001);
        assert_eq!(conn.forward_port(), 4000);
        assert!(conn.invariant_holds());
    }

    #[test]
    fn bad_protocol_number_is_rejected() {
        use std::io::Write as _;
        let (mut conn, mut client) = test_connection();
        let mut packet = frame::encode_packet(0, 0, &["x"]);
        packet[2] = 2;
        client.write_all(&packet).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let err = loop {
            match conn.try_read() {
                Ok(ReadOutcome::WouldBlock) => std::thread::sleep(std::time::Duration::from_millis(5)),
                Ok(ReadOutcome::Packet) => panic!("should not assemble a packet"),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, NetError::BadProtocol(2)));
    }

    #[test]
    fn idle_ping_then_timeout_thresholds() {
        let (mut conn, _client) = test_connection();
        let now = Instant::now();

        assert!(!conn.idle_past_ping_threshold(now));
        assert!(!conn.idle_past_timeout(now));

        conn.last_receive_time = now - std::time::Duration::from_secs(46);
        conn.last_send_time = now - std::time::Duration::from_secs(46);
        assert!(conn.idle_past_ping_threshold(now));
        assert!(!conn.idle_past_timeout(now));

        conn.last_receive_time = now - std::time::Duration::from_secs(181);
        assert!(conn.idle_past_timeout(now));
    }

    #[test]
    fn partial_write_queues_residue_and_drains_on_flush() {
        use std::io::Read as _;

        let (mut conn, mut client) = test_connection();
        shrink_send_buffer(&mut conn);

        // A payload comfortably larger than the shrunk kernel buffer, so the
        // first send can only land part of it.
        let payload = vec![7_u8; 64 * 1024];
        let outcome = conn.send(&payload).unwrap();
        assert_eq!(outcome, SendOutcome::Accepted);
        assert!(conn.has_send_residue());

        // A second send while residue is pending is dropped outright.
        let dropped = conn.send(b"second packet").unwrap();
        assert_eq!(dropped, SendOutcome::Dropped);

        let mut received = vec![0_u8; payload.len()];
        let mut total = 0;
        while total < received.len() {
            conn.send(&[]).unwrap();
            match client.read(&mut received[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => panic!("unexpected read error: {e}"),
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert_eq!(total, payload.len());
        assert_eq!(&received[..], &payload[..]);

        // Flushing an already-drained residue clears the flag.
        conn.send(&[]).unwrap();
        assert!(!conn.has_send_residue());
    }

    fn shrink_send_buffer(conn: &mut Connection) {
        use std::os::fd::AsRawFd;
        let fd = conn.mio_stream().as_raw_fd();
        let size: libc::c_int = 512;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                (&raw const size).cast::<libc::c_void>(),
                core::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }
}
