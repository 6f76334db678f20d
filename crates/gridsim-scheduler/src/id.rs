//! Short node id generation.
//!
//! Ids are sampled from a fixed lowercase alphanumeric alphabet and
//! rejected if they collide with a live id. After repeated collisions the
//! token grows by one character so generation always terminates.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Collisions tolerated before the token length grows.
const ATTEMPTS_PER_LENGTH: usize = 32;

/// Random token generator for node ids.
pub struct IdGenerator {
    rng: StdRng,
    length: usize,
}

impl IdGenerator {
    /// Generator seeded from the operating system.
    pub fn new(length: usize) -> Self {
        Self {
            rng: StdRng::from_os_rng(),
            length: length.max(1),
        }
    }

    /// Deterministic generator, for tests and reproducible simulations.
    pub fn seeded(length: usize, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            length: length.max(1),
        }
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Produce a token for which `is_taken` returns false.
    pub fn generate(&mut self, is_taken: impl Fn(&str) -> bool) -> String {
        let mut attempt = 0;
        loop {
            let length = self.length + attempt / ATTEMPTS_PER_LENGTH;
            let candidate: String = (0..length)
                .map(|_| ALPHABET[self.rng.random_range(0..ALPHABET.len())] as char)
                .collect();
            if !is_taken(&candidate) {
                return candidate;
            }
            attempt += 1;
        }
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(6)
    }
}
