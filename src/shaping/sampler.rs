/// Independent uniform sampling of exchanges.
#[derive(Debug, Clone)]
pub struct Sampler {
    rate: f64,
    rng: fastrand::Rng,
}

impl Sampler {
    pub fn new(rate: f64) -> Self {
        Self::with_rng(rate, fastrand::Rng::new())
    }

    /// Reproducible sampling, for tests.
    pub fn seeded(rate: f64, seed: u64) -> Self {
        Self::with_rng(rate, fastrand::Rng::with_seed(seed))
    }

    fn with_rng(rate: f64, rng: fastrand::Rng) -> Self {
        Self {
            rate: rate.clamp(0.0, 1.0),
            rng,
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn sample(&mut self) -> bool {
        if self.rate >= 1.0 {
            return true;
        }
        if self.rate <= 0.0 {
            return false;
        }
        self.rng.f64() < self.rate
    }
}
