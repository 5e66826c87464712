use std::collections::HashMap;

use rand::distributions::WeightedIndex;
use rand::rngs::StdRng;
use rand::Rng;

use super::{EmptyCandidateSet, Prioritization};
use crate::Value;

/// Processes the oldest pending key first. Tables without a policy behave
/// this way
#[derive(Debug, Default, Clone, Copy)]
pub struct Fifo;

impl Prioritization for Fifo {
    fn choose(&mut self, pending: &[Value]) -> Result<Value, EmptyCandidateSet> {
        pending.first().cloned().ok_or(EmptyCandidateSet)
    }
}

/// Picks any pending key with equal probability
#[derive(Debug)]
pub struct UniformRandom {
    rng: StdRng,
}

impl UniformRandom {
    pub fn new() -> Self {
        Self { rng: super::rng(None) }
    }

    pub fn seeded(seed: u64) -> Self {
        Self { rng: super::rng(Some(seed)) }
    }
}

impl Default for UniformRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl Prioritization for UniformRandom {
    fn choose(&mut self, pending: &[Value]) -> Result<Value, EmptyCandidateSet> {
        if pending.is_empty() {
            return Err(EmptyCandidateSet);
        }
        let index = self.rng.gen_range(0..pending.len());
        Ok(pending[index].clone())
    }
}

/// Lottery scheduling: each pending key holds tickets in proportion to an
/// external activity weight, keys without a weight hold the default number
///
/// When no pending key holds a ticket the first key in arrival order wins,
/// so selection stays deterministic for a fixed seed
#[derive(Debug)]
pub struct WeightedLottery {
    weights: HashMap<Value, f64>,
    default: f64,
    rng: StdRng,
}

impl WeightedLottery {
    pub fn new<I>(weights: I, default: f64, seed: Option<u64>) -> Self
    where
        I: IntoIterator<Item = (Value, f64)>,
    {
        Self {
            weights: weights
                .into_iter()
                .map(|(key, w)| (key, sanitize(w)))
                .collect(),
            default: sanitize(default),
            rng: super::rng(seed),
        }
    }

    pub fn weight(&self, key: &Value) -> f64 {
        self.weights.get(key).copied().unwrap_or(self.default)
    }
}

fn sanitize(weight: f64) -> f64 {
    if weight.is_finite() && weight > 0.0 {
        weight
    } else {
        0.0
    }
}

impl Prioritization for WeightedLottery {
    fn choose(&mut self, pending: &[Value]) -> Result<Value, EmptyCandidateSet> {
        let first = pending.first().ok_or(EmptyCandidateSet)?;
        let mut tickets: Vec<f64> = pending.iter().map(|key| self.weight(key)).collect();

        // scaled into (0, 1] so the running total can't overflow
        let most = tickets.iter().copied().fold(0.0, f64::max);
        if most > 0.0 {
            tickets.iter_mut().for_each(|ticket| *ticket /= most);
        }

        match WeightedIndex::new(&tickets) {
            Ok(lottery) => Ok(pending[self.rng.sample(&lottery)].clone()),
            Err(_) => Ok(first.clone()),
        }
    }
}
