//! Hex identifier generation.
//!
//! Connection ids, scene ids and request ids are each a monotonic counter
//! in its own numbering space, starting at `0x1_0001`, formatted as 8
//! lowercase hex characters. Client ids are random rather than sequential,
//! assigned fresh on every ENTER.

use rand::Rng;

const START: u32 = 0x1_0001;

/// A process-wide monotonic counter rendering its value as 8 lowercase hex
/// chars. One instance each is owned by the event loop for connection ids,
/// scene ids and request ids — three independent numbering spaces, matching
/// the original's three distinct counters.
#[derive(Debug)]
pub struct HexIdGen {
    next: u32,
}

impl Default for HexIdGen {
    fn default() -> Self {
        Self { next: START }
    }
}

impl HexIdGen {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next id in the sequence, advancing it.
    pub fn next(&mut self) -> String {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        format!("{id:08x}")
    }
}

/// Draws a fresh random client id: 8 lowercase hex characters from an RNG,
/// not tied to any counter.
#[must_use]
pub fn random_client_id() -> String {
    let mut rng = rand::rng();
    let value: u32 = rng.random();
    format!("{value:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_ids_are_eight_chars_and_monotonic() {
        let mut gen = HexIdGen::new();
        let a = gen.next();
        let b = gen.next();
        assert_eq!(a.len(), 8);
        assert_eq!(b.len(), 8);
        assert_eq!(a, "00010001");
        assert_eq!(b, "00010002");
    }

    #[test]
    fn random_client_id_is_eight_hex_chars() {
        let id = random_client_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
