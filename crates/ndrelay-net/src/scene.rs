//! A scene: a shared topic connections join by URL and fan out SETs within.

use indexmap::IndexSet;
use mio::Token;

/// A pub/sub topic. `members` holds weak references (socket tokens) resolved
/// back through the [`crate::registry::ConnectionRegistry`] — no `Scene`
/// owns a `Connection` and vice versa, avoiding a reference cycle.
#[derive(Debug)]
pub struct Scene {
    pub id: String,
    pub url: String,
    pub name: String,
    members: IndexSet<Token>,
}

impl Scene {
    #[must_use]
    pub fn new(id: String, url: String, name: String) -> Self {
        Self { id, url, name, members: IndexSet::new() }
    }

    pub fn insert_member(&mut self, token: Token) -> bool {
        self.members.insert(token)
    }

    pub fn remove_member(&mut self, token: Token) -> bool {
        self.members.shift_remove(&token)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    #[must_use]
    pub fn members(&self) -> impl Iterator<Item = Token> + '_ {
        self.members.iter().copied()
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_after_last_member_removed() {
        let mut scene = Scene::new("00010001".into(), "rid://r1".into(), "Room".into());
        let tok = Token(5);
        assert!(scene.insert_member(tok));
        assert!(!scene.is_empty());
        assert!(scene.remove_member(tok));
        assert!(scene.is_empty());
    }

    #[test]
    fn duplicate_insert_is_idempotent() {
        let mut scene = Scene::new("00010001".into(), "rid://r1".into(), "Room".into());
        let tok = Token(5);
        assert!(scene.insert_member(tok));
        assert!(!scene.insert_member(tok));
        assert_eq!(scene.member_count(), 1);
    }
}
