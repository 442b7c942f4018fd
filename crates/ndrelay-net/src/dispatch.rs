//! Request dispatcher: parses a packet's arguments and branches on its
//! command tag, mutating [`Connection`]/[`Scene`] state and emitting
//! replies.

use mio::Token;
use thiserror::Error;
use tracing::{debug, trace};

use crate::{error::NetError, ids::HexIdGen, registry::{ConnectionRegistry, SceneRegistry}};

/// Result of a successfully handled command: the connection stays open.
/// Validation failures are *not* represented here — they're logged and
/// also resolve to `Continue`, since a command-level validation failure is
/// explicitly non-fatal (§7). Only [`DispatchError`] closes the connection.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Continue,
}

/// Connection-fatal dispatch failures. The event loop closes the
/// connection that produced one of these.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Net(#[from] NetError),
    /// A SET fan-out's send to `member` (not the sender) failed fatally.
    /// Per §4.1 case 3, a fatal send error closes whichever connection
    /// `send()` was called on — here that's `member`, not the sender. The
    /// event loop closes both `member` and the dispatching sender: the
    /// latter to preserve the documented open-question behavior (a
    /// fan-out fault still aborts the originator's handler), the former so
    /// the broken socket doesn't linger registered (P1).
    #[error("fatal send error to scene member {member:?} during SET fan-out: {source}")]
    FanOutMemberFailed { member: Token, source: NetError },
}

/// Borrowed view over everything a single dispatch call may need to touch.
/// Built fresh by the event loop for each packet; never stored.
pub struct Dispatcher<'a> {
    pub connections: &'a mut ConnectionRegistry,
    pub scenes: &'a mut SceneRegistry,
    pub scene_ids: &'a mut HexIdGen,
    pub request_ids: &'a mut HexIdGen,
}

impl Dispatcher<'_> {
    /// Parses `args` and dispatches to the matching handler.
    ///
    /// `sender` must already be present in `connections` — the event loop
    /// only calls this after a successful read on a registered connection.
    pub fn dispatch(&mut self, sender: Token, args: &[String]) -> Result<Outcome, DispatchError> {
        if args.len() < 4 {
            return Err(DispatchError::Malformed("fewer than 4 arguments"));
        }
        let tag0 = args[0].as_str();
        let packet_id = args[1].as_str();
        let conn_id = args[2].as_str();
        let command = args[3].as_str();

        if packet_id.is_empty() || conn_id.is_empty() || command.is_empty() {
            return Err(DispatchError::Malformed("empty packetId/connId/command"));
        }

        if tag0 == "AN" {
            trace!(?sender, "ignoring AN (self-echoed acknowledgement)");
            return Ok(Outcome::Continue);
        }
        if tag0 != "RQ" {
            debug!(?sender, tag0, "ignoring packet with unrecognised tag");
            return Ok(Outcome::Continue);
        }

        let sub_args = &args[4..];
        match command {
            "ENTER" => self.handle_enter(sender, packet_id, sub_args),
            "SET" => self.handle_set(sender, packet_id, conn_id, sub_args),
            "PING" => self.handle_ping(sender, packet_id, conn_id),
            "BYE" => self.handle_bye(sender, packet_id, conn_id, sub_args),
            other => {
                debug!(?sender, command = other, "ignoring unknown command");
                Ok(Outcome::Continue)
            }
        }
    }

    fn handle_enter(
        &mut self,
        sender: Token,
        packet_id: &str,
        args: &[String],
    ) -> Result<Outcome, DispatchError> {
        let sender_conn_id = self.connections.get(sender).expect("sender is registered").id.clone();
        let already_joined = self.connections.get(sender).expect("sender is registered").scene_url.is_some();
        if already_joined {
            debug!(conn_id = %sender_conn_id, "ENTER ignored, already joined a scene");
            return Ok(Outcome::Continue);
        }

        let (Some(nnm), Some(scn), Some(scu)) =
            (extract_kv(args, "NNM"), extract_kv(args, "SCN"), extract_kv(args, "SCU"))
        else {
            return Err(DispatchError::Malformed("ENTER missing NNM/SCN/SCU"));
        };
        for value in [nnm, scn, scu] {
            if !value.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
                return Err(DispatchError::Malformed("ENTER value must start with an ASCII letter"));
            }
        }

        let client_id = crate::ids::random_client_id();

        let scene_id = match self.scenes.find_by_url(scu) {
            Some(scene) => scene.id.clone(),
            None => {
                let id = self.scene_ids.next();
                self.scenes.create(id.clone(), scu.to_string(), scn.to_string());
                id
            }
        };
        if let Some(scene) = self.scenes.find_by_url_mut(scu) {
            scene.insert_member(sender);
        }

        let conn = self.connections.get_mut(sender).expect("sender is registered");
        conn.client_id = Some(client_id.clone());
        conn.nickname = Some(nnm.to_string());
        conn.scene_name = Some(scn.to_string());
        conn.scene_url = Some(scu.to_string());
        conn.send_arguments(&[
            "AN",
            packet_id,
            &sender_conn_id,
            "HI",
            "CLID",
            &client_id,
            "SCID",
            &scene_id,
            "NNM",
            nnm,
        ])?;
        Ok(Outcome::Continue)
    }

    fn handle_set(
        &mut self,
        sender: Token,
        packet_id: &str,
        sender_conn_id: &str,
        args: &[String],
    ) -> Result<Outcome, DispatchError> {
        let scene_url = self.connections.get(sender).expect("sender is registered").scene_url.clone();
        let Some(scene_url) = scene_url else {
            debug!(conn_id = %sender_conn_id, "SET before joining a scene, ignoring");
            return Ok(Outcome::Continue);
        };
        let Some(scene) = self.scenes.find_by_url(&scene_url) else {
            debug!(conn_id = %sender_conn_id, %scene_url, "SET references an unknown scene, ignoring");
            return Ok(Outcome::Continue);
        };
        let scene_id = scene.id.clone();
        let members: Vec<Token> = scene.members().collect();

        let (scid, kv) = scan_set_args(args);
        let Some(scid) = scid else {
            debug!(conn_id = %sender_conn_id, "SET missing SCID, ignoring");
            return Ok(Outcome::Continue);
        };
        if scid != scene_id {
            debug!(conn_id = %sender_conn_id, %scid, %scene_id, "SET SCID mismatch, ignoring");
            return Ok(Outcome::Continue);
        }
        let Some((key, value)) = kv else {
            debug!(conn_id = %sender_conn_id, "SET missing key/value, ignoring");
            return Ok(Outcome::Continue);
        };
        if key.is_empty() {
            debug!(conn_id = %sender_conn_id, "SET key empty, ignoring");
            return Ok(Outcome::Continue);
        }

        if let Some(conn) = self.connections.get_mut(sender) {
            conn.send_arguments(&["AN", packet_id, sender_conn_id, "OK"])?;
        }

        // Fan-out includes the originator. Per the original's documented open
        // question: a fatal send to any *other* recipient aborts the whole
        // fan-out and propagates up, closing the *originating* connection
        // even though the fault was on a different socket. Preserved as-is,
        // but the member whose send actually failed is also reported so the
        // caller closes that socket too (§4.1 case 3: a fatal send error
        // closes whichever connection `send()` was called on).
        for member_token in members {
            let Some(member) = self.connections.get_mut(member_token) else { continue };
            let request_id = self.request_ids.next();
            let member_conn_id = member.id.clone();
            if let Err(source) = member.send_arguments(&[
                "RQ",
                &request_id,
                &member_conn_id,
                "SET",
                "SCID",
                &scid,
                key,
                value,
            ]) {
                return Err(DispatchError::FanOutMemberFailed { member: member_token, source });
            }
        }

        Ok(Outcome::Continue)
    }

    fn handle_ping(
        &mut self,
        sender: Token,
        packet_id: &str,
        conn_id: &str,
    ) -> Result<Outcome, DispatchError> {
        let conn = self.connections.get_mut(sender).expect("sender is registered");
        conn.send_arguments(&["AN", packet_id, conn_id, "PONG"])?;
        Ok(Outcome::Continue)
    }

    fn handle_bye(
        &mut self,
        sender: Token,
        packet_id: &str,
        conn_id: &str,
        args: &[String],
    ) -> Result<Outcome, DispatchError> {
        let Some(clid) = extract_kv(args, "CLID") else {
            debug!(%conn_id, "BYE missing CLID, ignoring");
            return Ok(Outcome::Continue);
        };
        let clid = clid.to_string();
        let matches_client = self.connections.get(sender).expect("sender is registered").client_id.as_deref()
            == Some(clid.as_str());
        if !matches_client {
            debug!(%conn_id, "BYE CLID mismatch, ignoring");
            return Ok(Outcome::Continue);
        }

        let conn = self.connections.get_mut(sender).expect("sender is registered");
        conn.send_arguments(&["AN", packet_id, conn_id])?;
        let scene_url = conn.scene_url.take();
        conn.clear_scene_binding();

        // Not explicit in the BYE handler's original description, but
        // required to uphold the scene invariant that every member resolves
        // to a Connection whose SCU equals the scene's URL: since BYE
        // clears SCU, it must also detach from the scene's member set (and
        // destroy the scene if that empties it), same cascade as a close.
        if let Some(scene_url) = scene_url {
            if let Some(scene) = self.scenes.find_by_url_mut(&scene_url) {
                scene.remove_member(sender);
                if scene.is_empty() {
                    self.scenes.destroy_by_url(&scene_url);
                }
            }
        }

        Ok(Outcome::Continue)
    }
}

/// Finds the value following the first occurrence of `key` in a flat
/// pairwise argument list.
fn extract_kv<'a>(args: &'a [String], key: &str) -> Option<&'a str> {
    let mut i = 0;
    while i + 1 < args.len() {
        if args[i] == key {
            return Some(args[i + 1].as_str());
        }
        i += 2;
    }
    None
}

/// Scans a SET's sub-arguments pairwise, pulling out the distinguished
/// `SCID` attribute and the first `(key, value)` pair. A `CHID` pair is
/// consumed and discarded.
fn scan_set_args(args: &[String]) -> (Option<&str>, Option<(&str, &str)>) {
    let mut i = 0;
    let mut scid = None;
    let mut kv = None;
    while i < args.len() {
        let key = args[i].as_str();
        match key {
            "SCID" => {
                if i + 1 < args.len() {
                    scid = Some(args[i + 1].as_str());
                }
            }
            "CHID" => {}
            _ => {
                if kv.is_none() && i + 1 < args.len() {
                    kv = Some((key, args[i + 1].as_str()));
                }
            }
        }
        i += 2;
    }
    (scid, kv)
}

#[cfg(test)]
mod tests {
    use std::net::{TcpListener, TcpStream as StdTcpStream};

    use mio::net::TcpStream as MioTcpStream;

    use super::*;
    use crate::connection::Connection;

    fn connected_pair() -> MioTcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = StdTcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        MioTcpStream::from_std(server)
    }

    /// Reproduces the bug fixed alongside this test: a fatal send error to a
    /// *non-originator* scene member during SET fan-out used to be reported
    /// only as the originator's error, leaving the broken member connection
    /// registered forever (violating P1). `dispatch` must now name the
    /// failed member so the caller can close it too.
    #[test]
    fn set_fan_out_reports_the_member_whose_send_failed() {
        let peer = "127.0.0.1:1".parse().unwrap();
        let sender_token = Token(1);
        let member_token = Token(2);

        let mut sender_conn = Connection::new("00010001".into(), sender_token, connected_pair(), peer);
        sender_conn.scene_url = Some("rid://r1".to_string());

        let mut member_conn = Connection::new("00010002".into(), member_token, connected_pair(), peer);
        member_conn.scene_url = Some("rid://r1".to_string());
        // Force the member's next send to fail fatally, simulating a peer
        // that vanished mid-fan-out.
        member_conn.shutdown();

        let mut connections = ConnectionRegistry::new();
        connections.insert(sender_conn);
        connections.insert(member_conn);

        let mut scenes = SceneRegistry::new();
        scenes.create("00020001".into(), "rid://r1".into(), "Room".into());
        let scene = scenes.find_by_url_mut("rid://r1").unwrap();
        scene.insert_member(sender_token);
        scene.insert_member(member_token);

        let mut scene_ids = HexIdGen::new();
        let mut request_ids = HexIdGen::new();
        let mut dispatcher = Dispatcher {
            connections: &mut connections,
            scenes: &mut scenes,
            scene_ids: &mut scene_ids,
            request_ids: &mut request_ids,
        };

        let args: Vec<String> = ["RQ", "1", "00010001", "SET", "SCID", "00020001", "color", "red"]
            .into_iter()
            .map(String::from)
            .collect();

        let err = dispatcher.dispatch(sender_token, &args).unwrap_err();
        match err {
            DispatchError::FanOutMemberFailed { member, .. } => assert_eq!(member, member_token),
            other => panic!("expected FanOutMemberFailed, got {other:?}"),
        }
    }

    #[test]
    fn extract_kv_finds_value() {
        let args = vec!["NNM".to_string(), "Alice".to_string(), "SCN".to_string(), "Room".to_string()];
        assert_eq!(extract_kv(&args, "NNM"), Some("Alice"));
        assert_eq!(extract_kv(&args, "SCN"), Some("Room"));
        assert_eq!(extract_kv(&args, "SCU"), None);
    }

    #[test]
    fn scan_set_args_skips_chid_and_picks_first_kv() {
        let args = vec![
            "CHID".to_string(),
            "ignored".to_string(),
            "SCID".to_string(),
            "00010001".to_string(),
            "color".to_string(),
            "red".to_string(),
        ];
        let (scid, kv) = scan_set_args(&args);
        assert_eq!(scid, Some("00010001"));
        assert_eq!(kv, Some(("color", "red")));
    }
}
