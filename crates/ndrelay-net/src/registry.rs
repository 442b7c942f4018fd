//! Process-wide connection and scene bookkeeping.
//!
//! Both registries are owned exclusively by the event loop (§5's
//! single-threaded cooperative model) — no locking, no interior mutability.

use indexmap::IndexMap;
use mio::Token;
use tracing::debug;

use crate::{connection::Connection, scene::Scene};

/// `Token -> Connection`. Values are exclusively owned; keys are `mio`
/// tokens standing in for the original's raw socket handles.
#[derive(Default)]
pub struct ConnectionRegistry {
    conns: IndexMap<Token, Connection>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `conn`. If `conn.token` already names a live connection, the
    /// previous occupant is shut down before being dropped — a duplicate
    /// key closes the previous Connection rather than leaking it.
    pub fn insert(&mut self, conn: Connection) {
        let token = conn.token;
        if let Some(mut prev) = self.conns.insert(token, conn) {
            debug!(?token, "duplicate token insert, closing previous occupant");
            prev.shutdown();
        }
    }

    pub fn remove(&mut self, token: Token) -> Option<Connection> {
        self.conns.shift_remove(&token)
    }

    #[must_use]
    pub fn get(&self, token: Token) -> Option<&Connection> {
        self.conns.get(&token)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Connection> {
        self.conns.get_mut(&token)
    }

    /// Number of live connections (P1: equals the count of still-registered
    /// tokens at all times).
    #[must_use]
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Token, &mut Connection)> {
        self.conns.iter_mut()
    }

    #[must_use]
    pub fn tokens(&self) -> Vec<Token> {
        self.conns.keys().copied().collect()
    }
}

/// `sceneUrl -> Scene` and `sceneId -> Scene`, collapsed in this rewrite
/// into a single owning map keyed by id plus a url->id index — Rust has no
/// cheap way to have two maps jointly own the same value without `Rc`, and
/// the original's invariant ("registered in both or in neither") is upheld
/// for free by construction: every mutation goes through `create`/`destroy`,
/// which touch both indexes atomically.
#[derive(Default)]
pub struct SceneRegistry {
    by_id: IndexMap<String, Scene>,
    url_to_id: IndexMap<String, String>,
}

impl SceneRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn find_by_url(&self, url: &str) -> Option<&Scene> {
        self.url_to_id.get(url).and_then(|id| self.by_id.get(id))
    }

    pub fn find_by_url_mut(&mut self, url: &str) -> Option<&mut Scene> {
        let id = self.url_to_id.get(url)?;
        self.by_id.get_mut(id)
    }

    #[must_use]
    pub fn find_by_id(&self, id: &str) -> Option<&Scene> {
        self.by_id.get(id)
    }

    /// Creates and registers a new scene. Panics if `url` is already
    /// registered — callers must check `find_by_url` first (ENTER always
    /// does: find-or-create).
    pub fn create(&mut self, id: String, url: String, name: String) -> &mut Scene {
        assert!(!self.url_to_id.contains_key(&url), "scene url already registered");
        self.url_to_id.insert(url.clone(), id.clone());
        self.by_id.insert(id.clone(), Scene::new(id.clone(), url, name));
        self.by_id.get_mut(&id).expect("just inserted")
    }

    /// Destroys the scene at `url`, removing it from both indexes.
    pub fn destroy_by_url(&mut self, url: &str) -> Option<Scene> {
        let id = self.url_to_id.shift_remove(url)?;
        self.by_id.shift_remove(&id)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.by_id.len()
    }
}
