use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::Rng;

use super::LoadShedding;
use crate::{Record, Value};

/// Admits every candidate, tables without a policy behave this way
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl LoadShedding for AcceptAll {
    fn decide(&mut self, _: &Record, _: Option<&Record>) -> bool {
        true
    }
}

/// Drops every candidate
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectAll;

impl LoadShedding for RejectAll {
    fn decide(&mut self, _: &Record, _: Option<&Record>) -> bool {
        false
    }
}

/// Admits each candidate independently with a fixed probability
#[derive(Debug)]
pub struct RandomSample {
    probability: f64,
    rng: StdRng,
}

impl RandomSample {
    pub fn new(probability: f64) -> Self {
        Self::build(probability, None)
    }

    pub fn seeded(probability: f64, seed: u64) -> Self {
        Self::build(probability, Some(seed))
    }

    fn build(probability: f64, seed: Option<u64>) -> Self {
        Self {
            probability: clamp(probability),
            rng: super::rng(seed),
        }
    }
}

impl LoadShedding for RandomSample {
    fn decide(&mut self, _: &Record, _: Option<&Record>) -> bool {
        self.rng.gen_bool(self.probability)
    }
}

/// Admits candidates with a per-key probability loaded from a side table
///
/// Keys missing from the map use the default probability
#[derive(Debug)]
pub struct WeightedSample {
    probabilities: HashMap<Value, f64>,
    default: f64,
    rng: StdRng,
}

impl WeightedSample {
    pub fn new<I>(probabilities: I, default: f64, seed: Option<u64>) -> Self
    where
        I: IntoIterator<Item = (Value, f64)>,
    {
        Self {
            probabilities: probabilities
                .into_iter()
                .map(|(key, p)| (key, clamp(p)))
                .collect(),
            default: clamp(default),
            rng: super::rng(seed),
        }
    }

    pub fn probability(&self, key: &Value) -> f64 {
        self.probabilities.get(key).copied().unwrap_or(self.default)
    }
}

/// NaN counts as never
fn clamp(probability: f64) -> f64 {
    if probability.is_nan() {
        0.0
    } else {
        probability.clamp(0.0, 1.0)
    }
}

impl LoadShedding for WeightedSample {
    fn decide(&mut self, candidate: &Record, _: Option<&Record>) -> bool {
        let p = self.probability(candidate.key());
        self.rng.gen_bool(p)
    }
}
