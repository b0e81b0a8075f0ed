//! Deterministic, length-preserving identifier generation.
//!
//! Every dot-separated segment of an identifier is replaced by a string of
//! the same byte length drawn from `[a-z0-9]`. The characters come from a
//! SHA-256 keystream seeded with the segment and the new team ID, so the
//! same input always yields the same output across runs and machines.

use sha2::{Digest, Sha256};
use std::collections::HashMap;

const ALPHABET: &[u8; 36] = b"abcdefghijklmnopqrstuvwxyz0123456789";

// Largest multiple of the alphabet size that fits in a byte.
const REJECT_AT: u8 = 252;

/// Pseudo-random segment of `len` characters seeded by `seed`.
///
/// Pure function of its inputs.
pub fn deterministic_segment(seed: &str, len: usize) -> String {
    let mut out = String::with_capacity(len);
    let mut counter: u64 = 0;

    while out.len() < len {
        let mut hasher = Sha256::new();
        hasher.update(seed.as_bytes());
        hasher.update(counter.to_be_bytes());
        let block = hasher.finalize();

        for &byte in block.iter() {
            if byte >= REJECT_AT {
                continue;
            }
            out.push(ALPHABET[(byte % ALPHABET.len() as u8) as usize] as char);
            if out.len() == len {
                break;
            }
        }
        counter += 1;
    }

    out
}

/// Segment-wise identifier generator with a per-run memo.
#[derive(Debug)]
pub struct IdGenerator {
    randomize: bool,
    memo: HashMap<(String, String), String>,
}

impl IdGenerator {
    /// Create a generator. With `randomize` off, [`generate_id`](Self::generate_id)
    /// returns its input.
    pub fn new(randomize: bool) -> Self {
        Self {
            randomize,
            memo: HashMap::new(),
        }
    }

    /// Replace each segment of `original` with a same-length segment keyed on
    /// `team_id`. Dots and the segment count are preserved.
    pub fn generate_id(&mut self, original: &str, team_id: &str) -> String {
        if !self.randomize {
            return original.to_string();
        }

        let mut out = String::with_capacity(original.len());
        for (i, segment) in original.split('.').enumerate() {
            if i > 0 {
                out.push('.');
            }
            out.push_str(&self.segment(segment, team_id));
        }
        out
    }

    fn segment(&mut self, segment: &str, team_id: &str) -> String {
        self.memo
            .entry((segment.to_string(), team_id.to_string()))
            .or_insert_with(|| deterministic_segment(&format!("{segment}{team_id}"), segment.len()))
            .clone()
    }
}
