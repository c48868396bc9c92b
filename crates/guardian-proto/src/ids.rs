use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

const PREFIX_LEN: usize = 8;
const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Correlation id allocator: a random per-instance prefix plus a counter, so
/// ids stay distinct across reconnects and across independent namespaces.
#[derive(Debug)]
pub struct RequestIds {
    prefix: String,
    counter: AtomicU64,
}

impl RequestIds {
    pub fn new() -> Self {
        Self::with_prefix(random_prefix())
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.prefix)
    }
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}

fn random_prefix() -> String {
    let mut rng = rand::thread_rng();
    (0..PREFIX_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn ids_are_prefixed_and_sequential() {
        let ids = RequestIds::with_prefix("k3x9");
        assert_eq!(ids.next_id(), "k3x9-0");
        assert_eq!(ids.next_id(), "k3x9-1");
        assert_eq!(ids.next_id(), "k3x9-2");
    }

    #[test_timeout::timeout]
    fn random_prefixes_are_base36() {
        let ids = RequestIds::new();
        assert_eq!(ids.prefix().len(), PREFIX_LEN);
        assert!(ids
            .prefix()
            .bytes()
            .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase()));
    }
}
