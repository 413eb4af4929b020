use std::f64::consts::PI;

/// Seedable xorshift64* stream. The same seed yields the same sequence on
/// every platform.
#[derive(Debug, Clone)]
pub struct Rng {
    state: u64,
}

impl Rng {
    pub fn new(seed: u32) -> Self {
        Self::from_state(splitmix64(seed as u64))
    }

    /// Independent stream for one trial, used when trials do not share a
    /// single stream.
    pub fn for_trial(seed: u32, trial: u32) -> Self {
        Self::from_state(derive_seed(seed, trial))
    }

    fn from_state(state: u64) -> Self {
        let state = if state == 0 {
            0xA5A5_A5A5_A5A5_A5A5
        } else {
            state
        };
        Self { state }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    /// Uniform in `[0, 1)`.
    pub fn next_uniform(&mut self) -> f64 {
        unit_from_bits(self.next_u64())
    }

    /// Box-Muller deviate. Every call consumes exactly two uniforms; the
    /// sine branch is discarded rather than cached.
    pub fn standard_normal(&mut self) -> f64 {
        let u1 = self.next_uniform().max(f64::MIN_POSITIVE);
        let u2 = self.next_uniform();
        let r = (-2.0 * u1.ln()).sqrt();
        r * (2.0 * PI * u2).cos()
    }
}

/// Top 53 bits as an exact multiple of `2^-53`; the largest value is
/// `1 - 2^-53`.
fn unit_from_bits(bits: u64) -> f64 {
    const DENOM: f64 = (1_u64 << 53) as f64;
    (bits >> 11) as f64 / DENOM
}

fn derive_seed(seed: u32, trial: u32) -> u64 {
    splitmix64(((seed as u64) << 32) | trial as u64)
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}
