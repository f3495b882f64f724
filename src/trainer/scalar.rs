use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, info, trace, warn};
use rand::rngs::StdRng;
use rand::Rng;

use crate::error::{EvoError, Signal};
use crate::jit::profiler::{BranchCounter, BranchLivenessProfiler, BranchObserver};
use crate::ssa::compiler::{compile, compile_tiered, CompiledProgram};
use crate::ssa::generator::{generate_initial, random_mutate, randomize, strip_static_invalid_values};
use crate::ssa::node::{validate, Node};
use crate::ssa::optimize::optimize_all;
use crate::worker::WorkerThread;
use crate::EvoResult;

use super::{best_of, join_round, trimmed_sum, Candidate, DataSource, RewardFunction, TrainingOutcome, TrainingSchedule};

/// Scalar programs take `arguments` inputs and produce one output in their
/// last slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalarConfig {
    pub schedule: TrainingSchedule,
    pub arguments: usize,
    pub complexity: usize,
    /// Targeted repairs allowed per candidate before it is scored `-inf`.
    pub max_repairs: usize,
}

impl Default for ScalarConfig {
    fn default() -> Self {
        Self {
            schedule: TrainingSchedule::default(),
            arguments: 2,
            complexity: 16,
            max_repairs: 64,
        }
    }
}

impl ScalarConfig {
    pub fn validate(&self) -> EvoResult<()> {
        self.schedule.validate()?;
        if self.arguments == 0 {
            return Err(EvoError::NoArguments);
        }
        if self.complexity <= self.arguments {
            return Err(EvoError::ComplexityTooLow {
                complexity: self.complexity,
                arguments: self.arguments,
            });
        }
        Ok(())
    }
}

/// Branch observations of one candidate. Counts are only kept when the
/// schedule speculates; committing needs nothing but the observed sides.
enum Observations {
    Liveness(BranchLivenessProfiler),
    Counts(BranchCounter),
}

impl Observations {
    fn new(threshold: u64) -> Self {
        if threshold > 0 {
            Observations::Counts(BranchCounter::new())
        } else {
            Observations::Liveness(BranchLivenessProfiler::new())
        }
    }

    fn observer(&mut self) -> &mut dyn BranchObserver {
        match self {
            Observations::Liveness(profiler) => profiler,
            Observations::Counts(counter) => counter,
        }
    }

    /// Commit every conditional seen going one way only.
    fn commit(&self, nodes: &mut [Option<Node>], offset: usize) -> usize {
        match self {
            Observations::Liveness(profiler) => profiler.strip(nodes, 0, offset),
            Observations::Counts(counter) => counter.strip(nodes, 0, offset, 0, false),
        }
    }

    /// Guard every conditional whose cold side stayed within `threshold`.
    fn speculate(&self, nodes: &mut [Option<Node>], offset: usize, threshold: u64) -> usize {
        match self {
            Observations::Liveness(_) => 0,
            Observations::Counts(counter) => counter.strip(nodes, 0, offset, threshold, true),
        }
    }
}

/// Per-candidate evaluation pipeline, shared with the workers.
struct Evaluator {
    config: ScalarConfig,
    reward: Arc<dyn RewardFunction>,
    data: Arc<dyn DataSource>,
}

impl Evaluator {
    fn outputs_start(&self) -> usize {
        self.config.complexity - 1
    }

    fn propose(&self, mut nodes: Vec<Option<Node>>, mut rng: StdRng) -> EvoResult<Candidate<Vec<Option<Node>>>> {
        random_mutate(&mut nodes, self.config.arguments, &mut rng);
        random_mutate(&mut nodes, self.config.arguments, &mut rng);
        self.evaluate(nodes, &mut rng)
    }

    /// Clean up, profile with repairs, specialize and score a program.
    fn evaluate(&self, mut nodes: Vec<Option<Node>>, rng: &mut StdRng) -> EvoResult<Candidate<Vec<Option<Node>>>> {
        let schedule = &self.config.schedule;
        let outputs_start = self.outputs_start();
        let mut scores = Vec::with_capacity(schedule.total_runs());
        let mut repairs = 0;

        strip_static_invalid_values(&mut nodes, outputs_start, rng);

        let threshold = schedule.speculation_threshold;
        let observations = loop {
            let program = compile(&nodes, 1, true, Some(0))?;
            let mut observations = Observations::new(threshold);
            scores.clear();

            match self.profile(&program, observations.observer(), &mut scores, rng) {
                Ok(()) => break observations,
                Err(Signal::InvalidOperation(index)) => {
                    repairs += 1;
                    if repairs > self.config.max_repairs {
                        warn!("Candidate still invalid after {} repair(s)", self.config.max_repairs);
                        return Ok(Candidate {
                            program: nodes,
                            score: f64::NEG_INFINITY,
                        });
                    }

                    trace!("Repairing node {}", index);
                    randomize(&mut nodes, VecDeque::from([index as usize]), rng);
                    strip_static_invalid_values(&mut nodes, outputs_start, rng);
                }
                Err(signal) => {
                    trace!("Profiling aborted by {}", signal);
                    return Ok(Candidate {
                        program: nodes,
                        score: f64::NEG_INFINITY,
                    });
                }
            }
        };

        let arguments = self.config.arguments;
        let committed = observations.commit(&mut nodes, arguments);
        optimize_all(&mut nodes, outputs_start);

        let speculative = if threshold > 0 {
            let mut speculative = nodes.clone();
            let pruned = observations.speculate(&mut speculative, arguments, threshold);
            (pruned > 0).then_some(speculative)
        } else {
            None
        };

        let tiered = compile_tiered(speculative.as_deref(), &nodes, 1)?;
        let mut inputs = vec![0.0; self.data.arguments()];
        let mut output = [0.0];
        for _ in 0..schedule.heavy_runs {
            self.data.fill(&mut inputs, rng);
            let score = match tiered.invoke(&inputs, &mut output) {
                Ok(()) => self.reward.score(&inputs, output[0]),
                Err(signal) => {
                    trace!("Heavy run aborted by {}", signal);
                    f64::NEG_INFINITY
                }
            };
            scores.push(score);
        }

        match &observations {
            Observations::Counts(counter) => debug!("{} committed, {}", committed, counter.stats()),
            Observations::Liveness(_) => debug!("{} branch(es) committed", committed),
        }
        Ok(Candidate {
            program: nodes,
            score: trimmed_sum(&scores, schedule.remove_outliers),
        })
    }

    fn profile(
        &self,
        program: &CompiledProgram,
        observer: &mut dyn BranchObserver,
        scores: &mut Vec<f64>,
        rng: &mut StdRng,
    ) -> Result<(), Signal> {
        let mut inputs = vec![0.0; self.data.arguments()];
        let mut output = [0.0];

        for _ in 0..self.config.schedule.profiling_runs {
            self.data.fill(&mut inputs, rng);
            program.invoke(&inputs, &mut output, Some(&mut *observer))?;
            scores.push(self.reward.score(&inputs, output[0]));
        }

        Ok(())
    }
}

/// Evolves scalar programs against a reward function.
pub struct ScalarTrainer {
    evaluator: Arc<Evaluator>,
    workers: Vec<WorkerThread>,
}

impl ScalarTrainer {
    pub fn new(config: ScalarConfig, reward: Arc<dyn RewardFunction>, data: Arc<dyn DataSource>) -> EvoResult<Self> {
        config.validate()?;
        if data.arguments() < config.arguments {
            return Err(EvoError::InvalidConfig {
                message: format!(
                    "data source provides {} argument(s), programs read {}",
                    data.arguments(),
                    config.arguments
                ),
            });
        }

        Ok(Self {
            evaluator: Arc::new(Evaluator { config, reward, data }),
            workers: WorkerThread::spawn_pool(config.schedule.threads)?,
        })
    }

    pub fn config(&self) -> &ScalarConfig {
        &self.evaluator.config
    }

    /// A fresh random program of the configured shape.
    pub fn initial<R: Rng + ?Sized>(&self, rng: &mut R) -> EvoResult<Vec<Option<Node>>> {
        let config = &self.evaluator.config;
        let mut nodes = generate_initial(config.arguments, config.complexity, rng)?;
        strip_static_invalid_values(&mut nodes, config.complexity - 1, rng);
        Ok(nodes)
    }

    /// Train from `initial` (or a random program) until the iteration budget
    /// runs out or a candidate scores `+inf`. The starting program is scored
    /// first and is only replaced by a strictly better candidate.
    pub fn train(&self, initial: Option<Vec<Option<Node>>>) -> EvoResult<TrainingOutcome<Vec<Option<Node>>>> {
        let schedule = self.evaluator.config.schedule;
        let threads = self.workers.len() as u64;

        let mut rng = schedule.rng_for(0, u64::MAX);
        let start = match initial {
            Some(nodes) => {
                if nodes.len() != self.evaluator.config.complexity {
                    return Err(EvoError::InvalidConfig {
                        message: format!(
                            "initial program has {} slot(s), expected {}",
                            nodes.len(),
                            self.evaluator.config.complexity
                        ),
                    });
                }
                validate(&nodes)?;
                nodes
            }
            None => self.initial(&mut rng)?,
        };
        let Candidate {
            program: mut elite,
            score: mut elite_score,
        } = self.evaluator.evaluate(start, &mut rng)?;
        let mut improvements = 0;
        debug!("Starting elite scores {}", elite_score);

        if elite_score == f64::INFINITY {
            return Ok(TrainingOutcome {
                program: elite,
                score: elite_score,
                rounds: 0,
                improvements,
            });
        }

        for round in 0..schedule.iterations {
            let handles = self
                .workers
                .iter()
                .zip(0..threads)
                .map(|(worker, stream)| {
                    let evaluator = Arc::clone(&self.evaluator);
                    let nodes = elite.clone();
                    let rng = schedule.rng_for(round, stream);
                    worker.enqueue(move || evaluator.propose(nodes, rng))
                })
                .collect();

            let Some(best) = best_of(join_round(handles)?) else {
                continue;
            };

            if best.score == f64::INFINITY {
                info!("Solved in round {}", round);
                return Ok(TrainingOutcome {
                    program: best.program,
                    score: best.score,
                    rounds: round + 1,
                    improvements: improvements + 1,
                });
            }

            if best.score > elite_score {
                info!("Round {}: elite improved from {} to {}", round, elite_score, best.score);
                elite = best.program;
                elite_score = best.score;
                improvements += 1;
            } else {
                debug!("Round {}: best candidate {} did not beat {}", round, best.score, elite_score);
            }
        }

        info!("Iteration budget exhausted at score {}", elite_score);
        Ok(TrainingOutcome {
            program: elite,
            score: elite_score,
            rounds: schedule.iterations,
            improvements,
        })
    }
}
