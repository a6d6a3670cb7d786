// Context — Explicit handle to backend state
//
// The numeric backend needs a little process-wide state: a random generator
// for weight initialisation and a device identity for diagnostics. Instead
// of hiding it behind global accessors, a Context is created once at start-up
// and passed by reference to every call that needs it. Two contexts never
// share state, so two networks can be initialised reproducibly side by side.

use rand::rngs::StdRng;
use rand::SeedableRng;

/// Backend handle: owns the random generator used for initialisation.
#[derive(Debug)]
pub struct Context {
    rng: StdRng,
    seed: Option<u64>,
    device: String,
}

impl Context {
    /// Create a context seeded from system entropy.
    pub fn new() -> Self {
        Context {
            rng: StdRng::from_entropy(),
            seed: None,
            device: "cpu".to_string(),
        }
    }

    /// Create a context with a fixed seed (reproducible initialisation).
    pub fn seeded(seed: u64) -> Self {
        Context {
            rng: StdRng::seed_from_u64(seed),
            seed: Some(seed),
            device: "cpu".to_string(),
        }
    }

    /// The seed this context was created with, if any.
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Human-readable device name.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// The random generator backing `init_normal`/`init_uniform`.
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
