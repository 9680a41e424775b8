use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum ProbeFault {
    #[default]
    None,
    Stuck { value: f64 },
    Bias { value: f64 },
    /// Offset grows with simulated time.
    Drift { per_s: f64 },
    /// Every `n`th read returns nothing.
    DropoutEvery { n: u64 },
}

/// NTC thermistor with Gaussian noise and an optional fault.
#[derive(Clone, Debug)]
pub struct Probe {
    pub noise_std: f64,
    pub fault: ProbeFault,
    rng: StdRng,
    reads: u64,
}

impl Probe {
    pub fn new(seed: u64, noise_std: f64) -> Self {
        Self {
            noise_std,
            fault: ProbeFault::None,
            rng: StdRng::seed_from_u64(seed),
            reads: 0,
        }
    }

    /// `None` is a dropout.
    pub fn read(&mut self, true_temp: f64, elapsed_s: f64) -> Option<f64> {
        self.reads += 1;

        let mut v = match self.fault {
            ProbeFault::None => true_temp,
            ProbeFault::Stuck { value } => return Some(value),
            ProbeFault::Bias { value } => true_temp + value,
            ProbeFault::Drift { per_s } => true_temp + per_s * elapsed_s,
            ProbeFault::DropoutEvery { n } => {
                if n > 0 && self.reads % n == 0 {
                    return None;
                }
                true_temp
            }
        };

        if self.noise_std > 0.0 {
            if let Ok(normal) = Normal::new(0.0, self.noise_std) {
                v += normal.sample(&mut self.rng);
            }
        }
        Some(v)
    }
}
