//! Credential rotation across N explorer or model keys.

use std::sync::Mutex;

use rand::Rng;

/// Round-robin / random key selection. The starting index is randomized so
/// parallel runs do not hammer the same key first.
#[derive(Debug)]
pub struct KeyRotator {
    keys: Vec<String>,
    current: Mutex<usize>,
}

impl KeyRotator {
    /// Builds a rotator from candidate keys plus a fallback, dropping
    /// blanks and duplicates. Returns `None` when no usable key remains.
    pub fn new(candidates: &[String], fallback: &str) -> Option<Self> {
        let mut keys: Vec<String> = Vec::new();
        for key in candidates {
            let key = key.trim();
            if !key.is_empty() && !keys.iter().any(|k| k == key) {
                keys.push(key.to_string());
            }
        }
        if keys.is_empty() {
            let fallback = fallback.trim();
            if !fallback.is_empty() {
                keys.push(fallback.to_string());
            }
        }
        if keys.is_empty() {
            return None;
        }
        let start = rand::thread_rng().gen_range(0..keys.len());
        Some(Self {
            keys,
            current: Mutex::new(start),
        })
    }

    /// Current key without advancing.
    pub fn get(&self) -> String {
        let idx = *self.current.lock().unwrap_or_else(|e| e.into_inner());
        self.keys[idx].clone()
    }

    /// Advances round-robin and returns the new key.
    pub fn get_next(&self) -> String {
        let mut idx = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *idx = (*idx + 1) % self.keys.len();
        self.keys[*idx].clone()
    }

    pub fn get_random(&self) -> String {
        let idx = rand::thread_rng().gen_range(0..self.keys.len());
        self.keys[idx].clone()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_and_duplicate_filtering() {
        let rotator = KeyRotator::new(
            &["a".to_string(), "".to_string(), " a ".to_string(), "b".to_string()],
            "",
        )
        .unwrap();
        assert_eq!(rotator.len(), 2);
    }

    #[test]
    fn test_fallback_used_when_candidates_empty() {
        let rotator = KeyRotator::new(&[], "fallback").unwrap();
        assert_eq!(rotator.get(), "fallback");
        assert_eq!(rotator.get_next(), "fallback");
    }

    #[test]
    fn test_no_keys_yields_none() {
        assert!(KeyRotator::new(&["  ".to_string()], "").is_none());
    }

    #[test]
    fn test_round_robin_cycles_all_keys() {
        let keys: Vec<String> = ["k1", "k2", "k3"].iter().map(|s| s.to_string()).collect();
        let rotator = KeyRotator::new(&keys, "").unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            seen.insert(rotator.get_next());
        }
        assert_eq!(seen.len(), 3);
    }
}
