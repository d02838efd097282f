//! Seeded RNG for the random logic pattern.
//!
//! A fixed seed makes the "random" pattern reproducible, which tests and
//! regression captures rely on.

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

pub struct DemoRng {
    inner: ChaCha8Rng,
    seed: Option<u64>,
}

impl DemoRng {
    /// `None` seeds from the OS.
    pub fn new(seed: Option<u64>) -> Self {
        let inner = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self { inner, seed }
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn fill_bytes(&mut self, buf: &mut [u8]) {
        self.inner.fill_bytes(buf);
    }

    pub fn next_u64(&mut self) -> u64 {
        self.inner.gen()
    }
}

impl Default for DemoRng {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for DemoRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DemoRng")
            .field("inner", &"<ChaCha8Rng>")
            .field("seed", &self.seed)
            .finish()
    }
}
