//! Inter-arrival gap models for paced load.

use std::fmt::{self, Display};
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use rand_distr::{Distribution, Exp, Poisson};

use crate::ConfigurationError;

/// Statistical model used to space out request arrivals at a target mean rate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum ArrivalModel {
    /// Exponentially distributed gaps with mean `1/rate`, i.e. a Poisson arrival process.
    #[default]
    Exponential,

    /// Gaps of `1/n` seconds where `n` is drawn from a Poisson distribution with mean `rate`.
    ///
    /// This inverts a per-second count into a delay. It approximates a Poisson process but
    /// produces far less dispersed gaps than [`Exponential`][Self::Exponential]. Kept for
    /// comparison with historical measurements. A draw of zero is treated as one.
    PoissonCount,

    /// Every gap is exactly `1/rate`.
    Constant,
}

impl Display for ArrivalModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Exponential => "exponential",
            Self::PoissonCount => "poisson-count",
            Self::Constant => "constant",
        })
    }
}

impl FromStr for ArrivalModel {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exponential" => Ok(Self::Exponential),
            "poisson-count" => Ok(Self::PoissonCount),
            "constant" => Ok(Self::Constant),
            _ => Err(ConfigurationError::InvalidChoice {
                option: "--arrivals",
                value: s.to_string(),
                expected: "exponential, poisson-count, constant",
            }),
        }
    }
}

#[derive(Clone, Debug)]
enum Sampler {
    Exponential(Exp<f64>),
    PoissonCount(Poisson<f64>),
    Constant(Duration),
}

/// Draws successive inter-arrival gaps for one arrival model and rate.
#[derive(Clone, Debug)]
pub struct ArrivalProcess {
    model: ArrivalModel,
    rate: f64,
    sampler: Sampler,
}

impl ArrivalProcess {
    /// Creates a process producing on average `rate` arrivals per second.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidRate`] unless `rate` is finite and positive.
    pub fn new(model: ArrivalModel, rate: f64) -> Result<Self, ConfigurationError> {
        let invalid = || ConfigurationError::InvalidRate { rate };

        if !rate.is_finite() || rate <= 0.0 {
            return Err(invalid());
        }

        let sampler = match model {
            ArrivalModel::Exponential => {
                Sampler::Exponential(Exp::new(rate).map_err(|_rejected| invalid())?)
            }
            ArrivalModel::PoissonCount => {
                Sampler::PoissonCount(Poisson::new(rate).map_err(|_rejected| invalid())?)
            }
            ArrivalModel::Constant => Sampler::Constant(seconds_to_duration(rate.recip())),
        };

        Ok(Self {
            model,
            rate,
            sampler,
        })
    }

    /// The model gaps are drawn from.
    #[must_use]
    pub fn model(&self) -> ArrivalModel {
        self.model
    }

    /// Target mean arrival rate, in requests per second.
    #[must_use]
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Draws the time between the previous arrival and the next one.
    pub fn next_gap<R>(&self, rng: &mut R) -> Duration
    where
        R: Rng + ?Sized,
    {
        match &self.sampler {
            Sampler::Exponential(exp) => seconds_to_duration(exp.sample(rng)),
            Sampler::PoissonCount(poisson) => {
                let count = poisson.sample(rng).max(1.0);
                seconds_to_duration(count.recip())
            }
            Sampler::Constant(gap) => *gap,
        }
    }
}

fn seconds_to_duration(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
}
