use std::sync::Arc;

use log::{debug, info, warn};
use rand::rngs::StdRng;

use crate::error::EvoError;
use crate::turing::compiler::{compile, MachineConfig};
use crate::turing::node::TuringNode;
use crate::turing::profile::{commit_branches, speculate_branches, strip_dead_loops, TuringProfile};
use crate::turing::transform::{MutationOdds, RandomTransformer};
use crate::worker::WorkerThread;
use crate::EvoResult;

use super::{best_of, join_round, trimmed_sum, Candidate, TestingEnvironment, TrainingOutcome, TrainingSchedule};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuringConfig {
    pub schedule: TrainingSchedule,
    pub variables: usize,
    pub arguments: usize,
    /// Slots per embedded basic block; must exceed `variables`.
    pub block_complexity: usize,
    pub loop_budget: u64,
    pub max_pages: usize,
    pub odds: MutationOdds,
    /// Re-mutate each basic block of a new elite on its own.
    pub refine_blocks: bool,
}

impl Default for TuringConfig {
    fn default() -> Self {
        Self {
            schedule: TrainingSchedule::default(),
            variables: 4,
            arguments: 2,
            block_complexity: 12,
            loop_budget: 10_000,
            max_pages: 16,
            odds: MutationOdds::default(),
            refine_blocks: true,
        }
    }
}

impl TuringConfig {
    pub fn machine(&self) -> MachineConfig {
        MachineConfig {
            variables: self.variables,
            arguments: self.arguments,
            loop_budget: self.loop_budget,
            max_pages: self.max_pages,
        }
    }

    pub fn validate(&self) -> EvoResult<()> {
        self.schedule.validate()?;
        self.machine().validate()?;
        if self.block_complexity <= self.variables {
            return Err(EvoError::ComplexityTooLow {
                complexity: self.block_complexity,
                arguments: self.variables,
            });
        }
        self.odds.validate()
    }
}

struct Evaluator {
    config: TuringConfig,
    environment: Arc<dyn TestingEnvironment>,
    transformer: RandomTransformer,
}

impl Evaluator {
    fn propose(&self, mut tree: TuringNode, mut rng: StdRng) -> EvoResult<Candidate<TuringNode>> {
        self.transformer.mutate(&mut tree, &mut rng)?;
        self.transformer.mutate(&mut tree, &mut rng)?;
        self.test(tree, true, &mut rng)
    }

    /// Profile, specialize and score a tree. The returned tree carries the
    /// committed branches and has its dead loops removed.
    fn test(&self, mut tree: TuringNode, strip_specialized: bool, rng: &mut StdRng) -> EvoResult<Candidate<TuringNode>> {
        let schedule = &self.config.schedule;
        let machine = self.config.machine();
        let offset = self.config.variables;
        let mut scores = Vec::with_capacity(schedule.total_runs());

        let program = compile(&tree, machine, true)?;
        let mut profile = TuringProfile::new();
        for _ in 0..schedule.profiling_runs {
            let score = self.environment.score(
                &mut |inputs: &[f64], outputs: &mut [f64]| {
                    program.run(inputs, outputs, Some(&mut profile))
                },
                rng,
            );
            scores.push(score);
        }

        commit_branches(&mut tree, &profile, offset);
        if schedule.speculation_threshold > 0 {
            speculate_branches(&mut tree, &profile, offset, schedule.speculation_threshold);
        }
        let (mut tree, _) = strip_dead_loops(tree, &profile);
        debug!(
            "{} block(s) reached, {}",
            profile.reached_count(),
            profile.branches.stats()
        );

        let program = compile(&tree, machine, false)?;
        if strip_specialized {
            tree.clear_specialized();
        }

        for _ in 0..schedule.heavy_runs {
            let score = self
                .environment
                .score(&mut |inputs: &[f64], outputs: &mut [f64]| program.run(inputs, outputs, None), rng);
            scores.push(score);
        }

        Ok(Candidate {
            program: tree,
            score: trimmed_sum(&scores, schedule.remove_outliers),
        })
    }

    /// Mutate each listed basic block of `elite` on its own and report the
    /// mutations that beat `elite_score`.
    fn refine(
        &self,
        elite: &TuringNode,
        ordinals: &[usize],
        elite_score: f64,
        rng: &mut StdRng,
    ) -> EvoResult<Vec<(usize, TuringNode)>> {
        let mut improved = Vec::new();

        for &ordinal in ordinals {
            let mut tree = elite.clone();
            let Some(block) = tree.basic_block_mut(ordinal) else {
                continue;
            };

            let mut mutated = TuringNode::BasicBlock(block.clone());
            self.transformer.mutate(&mut mutated, rng)?;
            if let TuringNode::BasicBlock(replacement) = &mutated {
                *block = replacement.clone();
            }

            let candidate = self.test(tree, false, rng)?;
            if candidate.score > elite_score {
                improved.push((ordinal, mutated));
            }
        }

        Ok(improved)
    }
}

/// Evolves Turing trees against a testing environment.
pub struct TuringTrainer {
    evaluator: Arc<Evaluator>,
    workers: Vec<WorkerThread>,
}

impl TuringTrainer {
    pub fn new(config: TuringConfig, environment: Arc<dyn TestingEnvironment>) -> EvoResult<Self> {
        config.validate()?;
        let transformer = RandomTransformer::new(config.variables, config.block_complexity, config.odds)?;

        Ok(Self {
            evaluator: Arc::new(Evaluator {
                config,
                environment,
                transformer,
            }),
            workers: WorkerThread::spawn_pool(config.schedule.threads)?,
        })
    }

    pub fn config(&self) -> &TuringConfig {
        &self.evaluator.config
    }

    /// Train from `initial` (or an empty block) until the iteration budget
    /// runs out or a candidate scores `+inf`. The starting tree is scored
    /// first and is only replaced by a strictly better candidate.
    pub fn train(&self, initial: Option<TuringNode>) -> EvoResult<TrainingOutcome<TuringNode>> {
        let config = self.evaluator.config;
        let schedule = config.schedule;
        let threads = self.workers.len() as u64;

        let start = initial.unwrap_or_else(TuringNode::empty);
        let Candidate {
            program: mut elite,
            score: mut elite_score,
        } = self.evaluator.test(start, true, &mut schedule.rng_for(0, u64::MAX))?;
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
                    let tree = elite.clone();
                    let rng = schedule.rng_for(round, stream);
                    worker.enqueue(move || evaluator.propose(tree, rng))
                })
                .collect();

            if let Some(best) = best_of(join_round(handles)?) {
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
                    info!(
                        "Round {}: elite improved from {} to {} ({} node(s))",
                        round,
                        elite_score,
                        best.score,
                        best.program.size()
                    );
                    elite = best.program;
                    elite_score = best.score;
                    improvements += 1;
                }
            }

            if !config.refine_blocks {
                continue;
            }

            let Some(refined) = self.refine(&elite, elite_score, round)? else {
                continue;
            };
            if refined.score == f64::INFINITY {
                info!("Solved by block refinement in round {}", round);
                return Ok(TrainingOutcome {
                    program: refined.program,
                    score: refined.score,
                    rounds: round + 1,
                    improvements: improvements + 1,
                });
            }
            if refined.score > elite_score {
                info!("Round {}: refinement improved elite from {} to {}", round, elite_score, refined.score);
                elite = refined.program;
                elite_score = refined.score;
                improvements += 1;
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

    /// Refine every basic block of `elite` in parallel, one batch per worker,
    /// merge the improving mutations and score the merged tree.
    fn refine(&self, elite: &TuringNode, elite_score: f64, round: u64) -> EvoResult<Option<Candidate<TuringNode>>> {
        let blocks = elite.basic_blocks().len();
        if blocks == 0 {
            return Ok(None);
        }

        let schedule = self.evaluator.config.schedule;
        let threads = self.workers.len();
        let handles: Vec<_> = self
            .workers
            .iter()
            .enumerate()
            .filter(|(worker, _)| *worker < blocks)
            .map(|(worker, thread)| {
                let evaluator = Arc::clone(&self.evaluator);
                let tree = elite.clone();
                let ordinals: Vec<usize> = (worker..blocks).step_by(threads).collect();
                let mut rng = schedule.rng_for(round, (threads + worker) as u64);
                thread.enqueue(move || evaluator.refine(&tree, &ordinals, elite_score, &mut rng))
            })
            .collect();

        let mut merged = elite.clone();
        let mut changed = 0;
        for handle in handles {
            let improved = match handle.wait() {
                Ok(result) => result?,
                Err(err) => {
                    warn!("Block refinement produced nothing: {}", err);
                    continue;
                }
            };

            for (ordinal, replacement) in improved {
                if let (Some(block), TuringNode::BasicBlock(replacement)) =
                    (merged.basic_block_mut(ordinal), replacement)
                {
                    *block = replacement;
                    changed += 1;
                }
            }
        }

        if changed == 0 {
            return Ok(None);
        }

        debug!("Merged {} refined block(s)", changed);
        let mut rng = schedule.rng_for(round, 2 * threads as u64);
        self.evaluator.test(merged, true, &mut rng).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use rand::{RngCore, SeedableRng};

    use super::*;
    use crate::ssa::node::Node;
    use crate::turing::node::ScalarBasicBlock;

    /// Rewards copying the first input into the second variable.
    struct Echo;

    impl TestingEnvironment for Echo {
        fn score(&self, action: &mut dyn FnMut(&[f64], &mut [f64]), _rng: &mut dyn RngCore) -> f64 {
            let inputs = [5.0, 0.0];
            let mut outputs = [0.0; 2];
            action(&inputs, &mut outputs);
            if !outputs[1].is_finite() {
                f64::NEG_INFINITY
            } else if outputs[1] == 5.0 {
                f64::INFINITY
            } else {
                -(outputs[1] - 5.0).abs()
            }
        }
    }

    fn config() -> TuringConfig {
        TuringConfig {
            schedule: TrainingSchedule {
                iterations: 1,
                profiling_runs: 2,
                heavy_runs: 2,
                remove_outliers: 0,
                threads: 2,
                speculation_threshold: 1,
                seed: Some(17),
            },
            variables: 2,
            arguments: 2,
            block_complexity: 4,
            loop_budget: 100,
            max_pages: 2,
            odds: MutationOdds::default(),
            refine_blocks: true,
        }
    }

    fn evaluator() -> Evaluator {
        let config = config();
        Evaluator {
            config,
            environment: Arc::new(Echo),
            transformer: RandomTransformer::new(config.variables, config.block_complexity, config.odds).unwrap(),
        }
    }

    #[test]
    fn test_exact_program_scores_positive_infinity() {
        // v0, v1 = v0, v0
        let tree = TuringNode::Block(vec![TuringNode::BasicBlock(ScalarBasicBlock::new(vec![
            Some(Node::Argument { parameter: 0 }),
            Some(Node::Argument { parameter: 1 }),
            Some(Node::Argument { parameter: 0 }),
            Some(Node::Argument { parameter: 0 }),
        ]))]);

        let mut rng = StdRng::seed_from_u64(1);
        let candidate = evaluator().test(tree, true, &mut rng).unwrap();
        assert_eq!(candidate.score, f64::INFINITY);
    }

    #[test]
    fn test_runaway_loop_scores_negative_infinity() {
        let tree = TuringNode::Block(vec![TuringNode::WhileLoop {
            condition: 0,
            body: Box::new(TuringNode::Block(vec![])),
        }]);

        let mut rng = StdRng::seed_from_u64(1);
        let candidate = evaluator().test(tree, true, &mut rng).unwrap();
        assert_eq!(candidate.score, f64::NEG_INFINITY);
    }

    #[test]
    fn test_unreached_loop_is_stripped() {
        let tree = TuringNode::Block(vec![TuringNode::WhileLoop {
            condition: 1,
            body: Box::new(TuringNode::Block(vec![TuringNode::MemoryRead { target: 1 }])),
        }]);

        let mut rng = StdRng::seed_from_u64(1);
        let candidate = evaluator().test(tree, true, &mut rng).unwrap();
        assert_eq!(candidate.program, TuringNode::Block(vec![]));
        assert_eq!(candidate.score, -20.0);
    }

    fn single_block(nodes: Vec<Option<Node>>) -> TuringNode {
        TuringNode::Block(vec![TuringNode::BasicBlock(ScalarBasicBlock::new(nodes))])
    }

    /// v0, v1 = v0, v1: scores -5 per trial.
    fn identity_block() -> TuringNode {
        single_block(vec![
            Some(Node::Argument { parameter: 0 }),
            Some(Node::Argument { parameter: 1 }),
            Some(Node::Argument { parameter: 0 }),
            Some(Node::Argument { parameter: 1 }),
        ])
    }

    #[test]
    fn test_refine_reports_only_improving_mutations() {
        let evaluator = evaluator();
        let elite = identity_block();
        let mut rng = StdRng::seed_from_u64(23);
        let elite_score = evaluator.test(elite.clone(), true, &mut rng).unwrap().score;
        assert_eq!(elite_score, -20.0);

        let improved = evaluator.refine(&elite, &[0; 64], elite_score, &mut rng).unwrap();
        assert!(!improved.is_empty());

        for (ordinal, replacement) in improved {
            assert_eq!(ordinal, 0);
            let TuringNode::BasicBlock(block) = replacement else {
                panic!("refinement must yield a basic block");
            };

            let mut tree = elite.clone();
            *tree.basic_block_mut(0).unwrap() = block;
            let score = evaluator.test(tree, true, &mut rng).unwrap().score;
            assert!(score > elite_score, "{} does not beat {}", score, elite_score);
        }
    }

    #[test]
    fn test_refine_keeps_optimal_elite() {
        let evaluator = evaluator();
        let elite = single_block(vec![
            Some(Node::Argument { parameter: 0 }),
            Some(Node::Argument { parameter: 1 }),
            Some(Node::Argument { parameter: 0 }),
            Some(Node::Argument { parameter: 0 }),
        ]);
        let mut rng = StdRng::seed_from_u64(29);

        let improved = evaluator.refine(&elite, &[0; 16], f64::INFINITY, &mut rng).unwrap();
        assert!(improved.is_empty());

        let trainer = TuringTrainer::new(config(), Arc::new(Echo)).unwrap();
        let before = elite.clone();
        assert!(trainer.refine(&elite, f64::INFINITY, 0).unwrap().is_none());
        assert_eq!(elite, before);
    }

    #[test]
    fn test_training_never_loses_the_incumbent() {
        let config = TuringConfig {
            schedule: TrainingSchedule {
                iterations: 10,
                ..config().schedule
            },
            ..config()
        };
        let trainer = TuringTrainer::new(config, Arc::new(Echo)).unwrap();
        let mut rng = StdRng::seed_from_u64(31);
        let incumbent = trainer.evaluator.test(identity_block(), true, &mut rng).unwrap();

        let outcome = trainer.train(Some(identity_block())).unwrap();

        let mut rng = StdRng::seed_from_u64(37);
        let rescored = trainer.evaluator.test(outcome.program.clone(), true, &mut rng).unwrap();
        assert_eq!(rescored.score, outcome.score);
        assert!(outcome.score >= incumbent.score, "{} < {}", outcome.score, incumbent.score);
    }

    #[test]
    fn test_training_round_runs() {
        let trainer = TuringTrainer::new(config(), Arc::new(Echo)).unwrap();
        let outcome = trainer.train(None).unwrap();
        assert!(outcome.rounds >= 1);
    }
}
