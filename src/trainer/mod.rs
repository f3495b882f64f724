//! Concurrent hill-climbing trainers.
//!
//! Every round, each worker clones the elite, mutates it twice, profiles it,
//! specializes it from the profile and scores it again. The main thread keeps
//! the best candidate: `+inf` ends training, a strictly better score replaces
//! the elite.

pub mod scalar;
pub mod turing;

use std::fmt;

use float_ord::FloatOrd;
use itertools::Itertools;
use log::warn;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::error::EvoError;
use crate::worker::TaskHandle;
use crate::EvoResult;

pub use scalar::{ScalarConfig, ScalarTrainer};
pub use turing::{TuringConfig, TuringTrainer};

/// Scores one scalar program output. Must return `-inf` for non-finite
/// outputs and `+inf` for an exact solution; otherwise higher is better.
pub trait RewardFunction: Send + Sync {
    fn score(&self, inputs: &[f64], output: f64) -> f64;
}

/// Produces the inputs of one trial.
pub trait DataSource: Send + Sync {
    fn arguments(&self) -> usize;
    fn fill(&self, buffer: &mut [f64], rng: &mut dyn RngCore);
}

/// Runs a Turing program through one trial and scores it, with the same sign
/// contract as `RewardFunction`. `action` maps inputs to outputs.
pub trait TestingEnvironment: Send + Sync {
    fn score(&self, action: &mut dyn FnMut(&[f64], &mut [f64]), rng: &mut dyn RngCore) -> f64;
}

/// Round structure shared by both trainers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingSchedule {
    pub iterations: u64,
    pub profiling_runs: usize,
    pub heavy_runs: usize,
    /// Trial scores dropped from each end before summing.
    pub remove_outliers: usize,
    pub threads: usize,
    /// Branches whose cold side was taken at most this many times during
    /// profiling are speculated away behind a guard. 0 disables speculation.
    pub speculation_threshold: u64,
    pub seed: Option<u64>,
}

impl Default for TrainingSchedule {
    fn default() -> Self {
        Self {
            iterations: 1_000,
            profiling_runs: 16,
            heavy_runs: 16,
            remove_outliers: 2,
            threads: 4,
            speculation_threshold: 0,
            seed: None,
        }
    }
}

impl TrainingSchedule {
    pub fn total_runs(&self) -> usize {
        self.profiling_runs + self.heavy_runs
    }

    pub fn validate(&self) -> EvoResult<()> {
        if self.threads == 0 {
            return Err(EvoError::InvalidConfig {
                message: "at least one worker thread is required".to_string(),
            });
        }
        if self.total_runs() == 0 {
            return Err(EvoError::InvalidConfig {
                message: "at least one trial per round is required".to_string(),
            });
        }
        if 2 * self.remove_outliers >= self.total_runs() {
            return Err(EvoError::InvalidConfig {
                message: format!(
                    "removing {} outlier(s) from each end leaves nothing of {} trial(s)",
                    self.remove_outliers,
                    self.total_runs()
                ),
            });
        }
        Ok(())
    }

    /// The random stream of one (round, stream) pair. Seeded schedules are
    /// fully reproducible; unseeded ones draw from entropy.
    pub fn rng_for(&self, round: u64, stream: u64) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(
                seed.wrapping_add(round.wrapping_mul(0x9E37_79B9_7F4A_7C15))
                    .wrapping_add(stream.wrapping_mul(0xBF58_476D_1CE4_E5B9)),
            ),
            None => StdRng::from_entropy(),
        }
    }
}

/// Sum of trial scores after dropping `remove` entries from each end of the
/// sorted list. NaN counts as `-inf`. Any `+inf` trial makes the result
/// `+inf`; a `-inf` left inside the window makes it `-inf`.
pub fn trimmed_sum(scores: &[f64], remove: usize) -> f64 {
    if scores.iter().any(|score| *score == f64::INFINITY) {
        return f64::INFINITY;
    }
    if 2 * remove >= scores.len() {
        return f64::NEG_INFINITY;
    }

    let window = scores.len() - 2 * remove;
    let mut total = 0.0;
    for FloatOrd(score) in scores
        .iter()
        .map(|&score| FloatOrd(if score.is_nan() { f64::NEG_INFINITY } else { score }))
        .sorted()
        .skip(remove)
        .take(window)
    {
        if score == f64::NEG_INFINITY {
            return f64::NEG_INFINITY;
        }
        total += score;
    }

    total
}

/// A scored program.
#[derive(Debug, Clone)]
pub struct Candidate<P> {
    pub program: P,
    pub score: f64,
}

/// Result of a training run.
#[derive(Debug, Clone)]
pub struct TrainingOutcome<P> {
    pub program: P,
    pub score: f64,
    pub rounds: u64,
    pub improvements: u64,
}

impl<P> TrainingOutcome<P> {
    pub fn is_solved(&self) -> bool {
        self.score == f64::INFINITY
    }
}

impl<P> fmt::Display for TrainingOutcome<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "score {} after {} round(s), {} improvement(s){}",
            self.score,
            self.rounds,
            self.improvements,
            if self.is_solved() { " (solved)" } else { "" }
        )
    }
}

/// Join one round of worker tasks. A panicked or cancelled task contributes
/// nothing; a fatal error from any task aborts training.
fn join_round<P>(handles: Vec<TaskHandle<EvoResult<Candidate<P>>>>) -> EvoResult<Vec<Candidate<P>>> {
    let mut candidates = Vec::with_capacity(handles.len());
    for (worker, handle) in handles.into_iter().enumerate() {
        match handle.wait() {
            Ok(result) => candidates.push(result?),
            Err(err) => warn!("Worker {} produced no candidate: {}", worker, err),
        }
    }
    Ok(candidates)
}

/// Highest-scoring candidate of a round.
fn best_of<P>(candidates: Vec<Candidate<P>>) -> Option<Candidate<P>> {
    candidates
        .into_iter()
        .filter(|candidate| !candidate.score.is_nan())
        .max_by_key(|candidate| FloatOrd(candidate.score))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trimmed_sum_drops_extremes() {
        let scores = [5.0, -100.0, 1.0, 2.0, 100.0, 3.0];
        assert_eq!(trimmed_sum(&scores, 1), 11.0);
        assert_eq!(trimmed_sum(&scores, 0), 11.0);
    }

    #[test]
    fn test_positive_infinity_short_circuits() {
        let scores = [f64::NEG_INFINITY, 1.0, f64::INFINITY, f64::NAN];
        assert_eq!(trimmed_sum(&scores, 1), f64::INFINITY);
    }

    #[test]
    fn test_negative_infinity_inside_window() {
        let scores = [f64::NEG_INFINITY, f64::NEG_INFINITY, 1.0, 2.0];
        assert_eq!(trimmed_sum(&scores, 1), f64::NEG_INFINITY);

        let scores = [f64::NEG_INFINITY, 1.0, 2.0, 3.0];
        assert_eq!(trimmed_sum(&scores, 1), 3.0);
    }

    #[test]
    fn test_nan_counts_as_negative_infinity() {
        assert_eq!(trimmed_sum(&[f64::NAN, 1.0], 0), f64::NEG_INFINITY);
        assert_eq!(trimmed_sum(&[f64::NAN, 1.0, 2.0], 1), 1.0);
    }

    #[test]
    fn test_schedule_validation() {
        let schedule = TrainingSchedule {
            profiling_runs: 2,
            heavy_runs: 2,
            remove_outliers: 2,
            ..TrainingSchedule::default()
        };
        assert!(matches!(schedule.validate(), Err(EvoError::InvalidConfig { .. })));

        let schedule = TrainingSchedule {
            threads: 0,
            ..TrainingSchedule::default()
        };
        assert!(schedule.validate().is_err());
        assert!(TrainingSchedule::default().validate().is_ok());
    }

    #[test]
    fn test_seeded_streams_are_reproducible() {
        let schedule = TrainingSchedule {
            seed: Some(99),
            ..TrainingSchedule::default()
        };

        let a = schedule.rng_for(3, 1).next_u64();
        let b = schedule.rng_for(3, 1).next_u64();
        let c = schedule.rng_for(3, 2).next_u64();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_best_of_prefers_highest_score() {
        let candidates = vec![
            Candidate { program: 'a', score: f64::NEG_INFINITY },
            Candidate { program: 'b', score: 4.0 },
            Candidate { program: 'c', score: -2.0 },
        ];
        assert_eq!(best_of(candidates).map(|c| c.program), Some('b'));
    }
}
