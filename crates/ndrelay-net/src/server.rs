//! The event loop: readiness multiplexing over the listen socket and every
//! live connection, periodic idle-probe/timeout sweeps and statistics.

use std::{
    io,
    net::SocketAddr,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use mio::{Events, Interest, Poll, Token, net::TcpListener};
use tracing::{debug, error, info, warn};

use crate::{
    connection::Connection,
    dispatch::{DispatchError, Dispatcher, Outcome},
    ids::HexIdGen,
    registry::{ConnectionRegistry, SceneRegistry},
    stats::StatsRing,
};

const LISTENER: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const PERIODIC_INTERVAL: Duration = Duration::from_secs(60);

/// Non-blocking, single-threaded relay server. Owns the listen socket,
/// every accepted [`Connection`], the [`SceneRegistry`] and the id/stats
/// counters — all accessed only from inside [`RelayServer::run`]/`turn`.
pub struct RelayServer {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    connections: ConnectionRegistry,
    scenes: SceneRegistry,
    conn_ids: HexIdGen,
    scene_ids: HexIdGen,
    request_ids: HexIdGen,
    stats: StatsRing,
    next_token: usize,
    last_periodic: Instant,
}

impl RelayServer {
    /// Binds a TCP listener on `0.0.0.0:port` with `SO_REUSEADDR` and a
    /// backlog of 511, and registers it with a fresh `mio::Poll`.
    pub fn bind(port: u16) -> io::Result<Self> {
        let mut listener = TcpListener::from_std(create_listen_socket(port)?);
        let poll = Poll::new()?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            listener,
            connections: ConnectionRegistry::new(),
            scenes: SceneRegistry::new(),
            conn_ids: HexIdGen::new(),
            scene_ids: HexIdGen::new(),
            request_ids: HexIdGen::new(),
            stats: StatsRing::new(),
            next_token: 1,
            last_periodic: Instant::now(),
        })
    }

    /// The listener's bound address, e.g. to discover the ephemeral port
    /// chosen when binding to port 0 in tests.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn scene_count(&self) -> usize {
        self.scenes.size()
    }

    /// Drives the loop until `should_stop` returns `true`. Checked once per
    /// turn, right after the readiness wait, matching the original's
    /// per-turn `doWork` flag check.
    pub fn run<F: FnMut() -> bool>(&mut self, mut should_stop: F) -> io::Result<()> {
        while !should_stop() {
            self.turn()?;
        }
        self.shutdown_all();
        Ok(())
    }

    /// One iteration of the loop: periodic pass, readiness wait, accept,
    /// writable flushes, readable reads + dispatch.
    pub fn turn(&mut self) -> io::Result<()> {
        if self.last_periodic.elapsed() >= PERIODIC_INTERVAL {
            self.run_periodic();
        }

        match self.poll.poll(&mut self.events, Some(POLL_TIMEOUT)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let ready: Vec<(Token, bool, bool)> =
            self.events.iter().map(|e| (e.token(), e.is_readable(), e.is_writable())).collect();

        for (token, readable, writable) in ready {
            if token == LISTENER {
                self.accept_all();
                continue;
            }
            if writable {
                self.handle_writable(token);
            }
            if readable {
                self.handle_readable(token);
            }
        }

        self.sync_all_writable_interest();
        Ok(())
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => self.accept_one(stream, peer_addr),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(%e, "accept failed");
                    return;
                }
            }
        }
    }

    fn accept_one(&mut self, stream: std::net::TcpStream, peer_addr: SocketAddr) {
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(%e, "couldn't set accepted socket non-blocking, dropping");
            return;
        }
        let mut mio_stream = mio::net::TcpStream::from_std(stream);
        let token = Token(self.next_token);
        self.next_token += 1;
        if let Err(e) = self.poll.registry().register(&mut mio_stream, token, Interest::READABLE) {
            warn!(%e, "couldn't register accepted socket");
            return;
        }
        let id = self.conn_ids.next();
        info!(conn_id = %id, %peer_addr, "client connected");
        let conn = Connection::new(id, token, mio_stream, peer_addr);
        self.connections.insert(conn);
    }

    fn handle_readable(&mut self, token: Token) {
        loop {
            let Some(conn) = self.connections.get_mut(token) else { return };
            conn.last_receive_time = Instant::now();
            match conn.try_read() {
                Ok(crate::connection::ReadOutcome::WouldBlock) => return,
                Ok(crate::connection::ReadOutcome::Packet) => {
                    let (args, wire_len) = conn.take_payload();
                    let now_secs = wall_clock_secs();
                    self.stats.record(now_secs, 1, wire_len);
                    self.dispatch_and_handle_errors(token, &args);
                    if self.connections.get(token).is_none() {
                        return;
                    }
                }
                Err(err) => {
                    warn!(?token, %err, "closing connection after read error");
                    self.close_connection(token);
                    return;
                }
            }
        }
    }

    fn dispatch_and_handle_errors(&mut self, token: Token, args: &[String]) {
        let mut dispatcher = Dispatcher {
            connections: &mut self.connections,
            scenes: &mut self.scenes,
            scene_ids: &mut self.scene_ids,
            request_ids: &mut self.request_ids,
        };
        match dispatcher.dispatch(token, args) {
            Ok(Outcome::Continue) => {}
            Err(DispatchError::Malformed(reason)) => {
                warn!(?token, reason, "closing connection: malformed packet");
                self.close_connection(token);
            }
            Err(DispatchError::Net(err)) => {
                warn!(?token, %err, "closing connection after dispatch send error");
                self.close_connection(token);
            }
            Err(DispatchError::FanOutMemberFailed { member, source }) => {
                warn!(?member, %source, "closing scene member after fatal fan-out send error");
                self.close_connection(member);
                warn!(?token, "also closing originating connection per fan-out-failure open question");
                self.close_connection(token);
            }
        }
    }

    fn handle_writable(&mut self, token: Token) {
        let result = {
            let Some(conn) = self.connections.get_mut(token) else { return };
            conn.send(&[])
        };
        if let Err(err) = result {
            warn!(?token, %err, "closing connection after write error");
            self.close_connection(token);
        }
    }

    /// Runs the idle-probe/timeout sweep and logs the periodic summary
    /// line plus 1s/10s/60s throughput.
    fn run_periodic(&mut self) {
        self.last_periodic = Instant::now();
        let now_secs = wall_clock_secs();
        let (p1, b1) = self.stats.last_1s(now_secs);
        let (p10, b10) = self.stats.last_10s(now_secs);
        let (p60, b60) = self.stats.last_60s(now_secs);
        info!(
            connections = self.connections.len(),
            scenes = self.scenes.size(),
            packets_1s = p1,
            bytes_1s = b1,
            packets_10s = p10,
            bytes_10s = b10,
            packets_60s = p60,
            bytes_60s = b60,
            "periodic tick"
        );
        self.sweep_idle_connections();
    }

    /// Per §4.4, PING emission and idle-timeout close are two independent
    /// checks evaluated for every connection on each tick, not an if/else —
    /// once a connection is fully idle (past `T`) it is also always past
    /// `T/4`, so both conditions hold at once and the PING is still sent
    /// before the close.
    fn sweep_idle_connections(&mut self) {
        let now = Instant::now();
        let tokens = self.connections.tokens();
        for token in tokens {
            let Some(conn) = self.connections.get_mut(token) else { continue };
            if conn.idle_past_ping_threshold(now) {
                let request_id = self.request_ids.next();
                let Some(conn) = self.connections.get_mut(token) else { continue };
                let conn_id = conn.id.clone();
                if let Err(err) = conn.send_arguments(&["RQ", &request_id, &conn_id, "PING"]) {
                    warn!(?token, %err, "closing connection after ping send error");
                    self.close_connection(token);
                    continue;
                }
                conn.last_send_time = now;
            }

            let Some(conn) = self.connections.get_mut(token) else { continue };
            if conn.idle_past_timeout(now) {
                debug!(?token, conn_id = %conn.id, "idle timeout, closing");
                self.close_connection(token);
            }
        }
    }

    /// Closes one connection: detaches it from its scene (destroying the
    /// scene if that empties it), deregisters and shuts down the socket,
    /// and removes it from the connection registry.
    fn close_connection(&mut self, token: Token) {
        let Some(mut conn) = self.connections.remove(token) else { return };
        if let Some(scene_url) = conn.scene_url.take() {
            if let Some(scene) = self.scenes.find_by_url_mut(&scene_url) {
                scene.remove_member(token);
                if scene.is_empty() {
                    self.scenes.destroy_by_url(&scene_url);
                }
            }
        }
        let _ = self.poll.registry().deregister(conn.mio_stream());
        conn.shutdown();
    }

    /// Closes every connection, then (as a consequence, since every scene
    /// becomes empty) every scene — the shutdown drain from §5.
    fn shutdown_all(&mut self) {
        let tokens = self.connections.tokens();
        for token in tokens {
            self.close_connection(token);
        }
        debug_assert_eq!(self.scenes.size(), 0, "all scenes should be empty once every connection is closed");
    }

    /// Re-synchronises WRITABLE interest for every connection against
    /// whether it currently carries a send residue. Done once per turn
    /// rather than per-packet because a single dispatch (a SET fan-out) can
    /// leave residue on connections other than the one that triggered it.
    fn sync_all_writable_interest(&mut self) {
        let tokens = self.connections.tokens();
        for token in tokens {
            let Some(conn) = self.connections.get_mut(token) else { continue };
            let needs_writable = conn.has_send_residue();
            if needs_writable == conn.is_writable_armed() {
                continue;
            }
            let interest = if needs_writable {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            match self.poll.registry().reregister(conn.mio_stream(), token, interest) {
                Ok(()) => conn.set_writable_armed(needs_writable),
                Err(err) => {
                    error!(?token, %err, "failed to reregister writable interest");
                }
            }
        }
    }
}

fn wall_clock_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Creates a non-blocking IPv4 listen socket bound to `INADDR_ANY:port` with
/// `SO_REUSEADDR` and a backlog of 511. `mio::net::TcpListener::bind` alone
/// doesn't expose backlog control, so this goes through `libc` directly —
/// the same low-level socket-option pattern used elsewhere in this codebase
/// for kernel buffer sizing.
fn create_listen_socket(port: u16) -> io::Result<std::net::TcpListener> {
    use std::os::fd::FromRawFd;

    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let reuse: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            (&raw const reuse).cast::<libc::c_void>(),
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );

        let mut addr: libc::sockaddr_in = core::mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = libc::INADDR_ANY;

        let bind_rc = libc::bind(
            fd,
            (&raw const addr).cast::<libc::sockaddr>(),
            core::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        if bind_rc != 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, 511) != 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);

        Ok(std::net::TcpListener::from_raw_fd(fd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_to_ephemeral_port_succeeds() {
        let server = RelayServer::bind(0).expect("bind should succeed on an ephemeral port");
        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.scene_count(), 0);
    }
}
