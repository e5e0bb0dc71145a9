//! Base62 instance identifiers.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

use crate::task::kinds::InstanceId;

const ALPHABET: &[u8; 62] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Render `value` in base 62. Zero and negative values render as `""`.
pub fn render_base62(value: i64) -> String {
    let mut n = value;
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(ALPHABET[(n % 62) as usize]);
        n /= 62;
    }
    digits.reverse();
    // Alphabet is ASCII.
    String::from_utf8(digits).unwrap_or_default()
}

/// Generates instance ids from a strictly increasing nanosecond seed.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: AtomicI64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> InstanceId {
        InstanceId::new(render_base62(self.next_seed()))
    }

    fn next_seed(&self) -> i64 {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX).max(1);
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let seed = now.max(last.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(last, seed, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return seed,
                Err(current) => last = current,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn base62_rendering() {
        assert_eq!(render_base62(0), "");
        assert_eq!(render_base62(-1), "");
        assert_eq!(render_base62(1), "1");
        assert_eq!(render_base62(10), "a");
        assert_eq!(render_base62(35), "z");
        assert_eq!(render_base62(36), "A");
        assert_eq!(render_base62(61), "Z");
        assert_eq!(render_base62(62), "10");
        assert_eq!(render_base62(123), "1Z");
    }

    #[test]
    fn consecutive_ids_are_distinct() {
        let generator = IdGenerator::new();
        let ids: HashSet<InstanceId> = (0..100).map(|_| generator.next_id()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn ids_are_distinct_across_threads() {
        let generator = std::sync::Arc::new(IdGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let generator = generator.clone();
                std::thread::spawn(move || (0..250).map(|_| generator.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut ids = HashSet::new();
        for handle in handles {
            ids.extend(handle.join().unwrap());
        }
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn ids_are_never_empty() {
        let generator = IdGenerator::new();
        assert!(!generator.next_id().as_str().is_empty());
    }
}
