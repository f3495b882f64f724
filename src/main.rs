use std::fs;
use std::panic;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser as ClapParser, Subcommand};
use log::{info, LevelFilter};
use rand::{Rng, RngCore};
use simplelog::SimpleLogger;

use evojit::error::EvoError;
use evojit::serialize::{nodes_to_json, tree_to_json};
use evojit::trainer::{
    DataSource, RewardFunction, ScalarConfig, ScalarTrainer, TestingEnvironment, TrainingSchedule, TuringConfig,
    TuringTrainer,
};
use evojit::EvoResult;

#[cfg(not(feature = "dhat-heap"))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

// profile heap usage with dhat
#[cfg(feature = "dhat-heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

#[derive(ClapParser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    search: Search,

    #[clap(short = 'd', long = "debug", help = "Enable debug mode")]
    debug: bool,

    #[clap(short = 's', long = "seed", help = "Seed every random stream for a reproducible run")]
    seed: Option<u64>,

    #[clap(short = 't', long = "threads", default_value_t = 4, help = "Worker thread count")]
    threads: usize,

    #[clap(short = 'n', long = "iterations", default_value_t = 1000, help = "Training round budget")]
    iterations: u64,

    #[clap(long = "speculate", default_value_t = 0, help = "Cold-branch threshold for speculation (0 disables)")]
    speculate: u64,

    #[clap(long = "save", help = "Write the trained program as JSON")]
    save: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Search {
    /// Evolve a scalar program computing x + y
    Scalar,
    /// Evolve a Turing program summing 1..=n
    Turing,
}

fn main() {
    panic::set_hook(Box::new(|err| {
        eprintln!(
            "{}",
            EvoError::UnknownError {
                message: err.to_string(),
            }
        );
    }));

    #[cfg(feature = "dhat-heap")]
    let _profiler = dhat::Profiler::new_heap();

    if let Err(err) = try_main() {
        eprintln!();
        eprintln!("[ERROR] Fatal exception during execution -> {}", err);
        eprintln!();
    }
}

fn try_main() -> EvoResult<()> {
    let args = Args::parse();
    setup_logger(args.debug)?;

    let schedule = TrainingSchedule {
        iterations: args.iterations,
        threads: args.threads,
        speculation_threshold: args.speculate,
        seed: args.seed,
        ..TrainingSchedule::default()
    };

    let json = match args.search {
        Search::Scalar => run_scalar(schedule)?,
        Search::Turing => run_turing(schedule)?,
    };

    if let Some(path) = args.save {
        fs::write(&path, json)?;
        info!("Saved program to {}", path.display());
    }

    Ok(())
}

fn run_scalar(schedule: TrainingSchedule) -> EvoResult<String> {
    let config = ScalarConfig {
        schedule,
        ..ScalarConfig::default()
    };
    let trainer = ScalarTrainer::new(config, Arc::new(Addition), Arc::new(Uniform { arguments: 2 }))?;
    let outcome = trainer.train(None)?;

    println!("{}", outcome);
    for (index, node) in outcome.program.iter().enumerate() {
        match node {
            Some(node) => println!("  %{} = {}", index, node),
            None => println!("  %{} = <dead>", index),
        }
    }

    nodes_to_json(&outcome.program)
}

fn run_turing(schedule: TrainingSchedule) -> EvoResult<String> {
    let config = TuringConfig {
        schedule,
        ..TuringConfig::default()
    };
    let trainer = TuringTrainer::new(config, Arc::new(Accumulator))?;
    let outcome = trainer.train(None)?;

    println!("{}, {} node(s)", outcome, outcome.program.size());
    println!("{}", outcome.program);

    tree_to_json(&outcome.program)
}

/// Uniform inputs in `[-10, 10)`.
struct Uniform {
    arguments: usize,
}

impl DataSource for Uniform {
    fn arguments(&self) -> usize {
        self.arguments
    }

    fn fill(&self, buffer: &mut [f64], rng: &mut dyn RngCore) {
        for value in buffer.iter_mut() {
            *value = rng.gen_range(-10.0..10.0);
        }
    }
}

/// Rewards outputs close to `x + y`.
struct Addition;

impl RewardFunction for Addition {
    fn score(&self, inputs: &[f64], output: f64) -> f64 {
        if !output.is_finite() {
            return f64::NEG_INFINITY;
        }

        let error = (inputs[0] + inputs[1] - output).abs();
        if error < 1e-9 {
            f64::INFINITY
        } else {
            -error
        }
    }
}

/// Feeds `n` in variable 0 and expects `1 + 2 + ... + n` in variable 1.
struct Accumulator;

impl TestingEnvironment for Accumulator {
    fn score(&self, action: &mut dyn FnMut(&[f64], &mut [f64]), rng: &mut dyn RngCore) -> f64 {
        let n = rng.gen_range(1..=8) as f64;
        let mut outputs = [0.0; 4];
        action(&[n, 0.0], &mut outputs);

        if !outputs[1].is_finite() {
            return f64::NEG_INFINITY;
        }

        // exact hits score 0, never +inf
        -(n * (n + 1.0) / 2.0 - outputs[1]).abs()
    }
}

fn setup_logger(debug: bool) -> EvoResult<()> {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    match SimpleLogger::init(level, simplelog::Config::default()) {
        Ok(_) => Ok(()),
        Err(err) => Err(EvoError::UnknownError {
            message: err.to_string(),
        }),
    }
}
