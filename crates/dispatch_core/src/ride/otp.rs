//! One-time codes that gate the start and the end of a ride.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub trait OtpGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Exact-match comparison against the code issued for the transition.
pub trait OtpVerifier: Send + Sync {
    fn verify(&self, expected: &str, submitted: &str) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ExactMatchVerifier;

impl OtpVerifier for ExactMatchVerifier {
    fn verify(&self, expected: &str, submitted: &str) -> bool {
        expected == submitted
    }
}

/// Uniform numeric codes with leading zeros kept.
#[derive(Debug)]
pub struct RandomOtpGenerator {
    digits: u8,
    rng: Mutex<StdRng>,
}

impl RandomOtpGenerator {
    pub fn new(digits: u8) -> Self {
        Self {
            digits,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Reproducible codes, for replays.
    pub fn with_seed(digits: u8, seed: u64) -> Self {
        Self {
            digits,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl OtpGenerator for RandomOtpGenerator {
    fn generate(&self) -> String {
        let upper = 10u64.pow(u32::from(self.digits));
        let code = self.rng.lock().gen_range(0..upper);
        format!("{:0width$}", code, width = usize::from(self.digits))
    }
}
