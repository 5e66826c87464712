//! Policies
//!
//! This module holds the two scheduling hooks every table carries
//!
//! A [LoadShedding] policy is asked whether a pending update should be
//! processed at all, it trades freshness for throughput under bursts. A
//! [Prioritization] policy picks which of the pending keys a table processes
//! next, it is the sole place cross-key fairness is decided

pub mod priority;
pub mod shedding;

pub use priority::{Fifo, UniformRandom, WeightedLottery};
pub use shedding::{AcceptAll, RandomSample, RejectAll, WeightedSample};

use rand::rngs::StdRng;
use rand::SeedableRng;

use thiserror::Error;

use crate::{Record, Value};

/// Admission filter invoked once for a pending candidate, before the operator
/// runs. Returning `false` drops the candidate for good, the table's current
/// value for the key is left unchanged
pub trait LoadShedding: Send + 'static {
    fn decide(&mut self, candidate: &Record, current: Option<&Record>) -> bool;
}

/// Chooses the next key to process among the pending keys of a table
///
/// `pending` is never empty when called by the scheduler and is ordered by
/// first arrival, implementations must return one of its members. Calling
/// with an empty slice is a programming error and fails with [EmptyCandidateSet]
pub trait Prioritization: Send + 'static {
    fn choose(&mut self, pending: &[Value]) -> Result<Value, EmptyCandidateSet>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no pending keys to choose from")]
pub struct EmptyCandidateSet;

impl<F> Prioritization for F
where
    F: FnMut(&[Value]) -> Result<Value, EmptyCandidateSet> + Send + 'static,
{
    fn choose(&mut self, pending: &[Value]) -> Result<Value, EmptyCandidateSet> {
        self(pending)
    }
}

impl<F> LoadShedding for F
where
    F: FnMut(&Record, Option<&Record>) -> bool + Send + 'static,
{
    fn decide(&mut self, candidate: &Record, current: Option<&Record>) -> bool {
        self(candidate, current)
    }
}

/// Seeded policies are reproducible, unseeded ones draw from OS entropy
pub(crate) fn rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}
