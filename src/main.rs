//! bayes-learner - learn a Bayesian network structure from synthetic data
//!
//! Usage:
//!   bayes-learner                                  # defaults: 32 variables, 4096 records
//!   bayes-learner --vars 16 --records 1024 --seed 7
//!   bayes-learner --enable-remove --enable-reverse --threads 8

use bayes_learner::prelude::*;
use clap::Parser;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::process;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bayes-learner")]
#[command(version)]
#[command(about = "Parallel transactional structure learner for binary Bayesian networks")]
struct Cli {
    /// Number of binary variables to generate
    #[arg(short = 'v', long, default_value_t = 32)]
    vars: usize,

    /// Number of records to sample
    #[arg(short = 'r', long, default_value_t = 4096)]
    records: usize,

    /// Maximum parents per variable in the generating network
    #[arg(short = 'n', long, default_value_t = 2)]
    max_parents: usize,

    /// Chance (percent) that the generator accepts each candidate parent
    #[arg(short = 'p', long, default_value_t = 10)]
    percent_parent: u32,

    /// Maximum parents per node while learning (-1 = unbounded)
    #[arg(short = 'e', long, default_value_t = -1, allow_negative_numbers = true)]
    edge_cap: i64,

    /// Penalty weight of each parent edge in insert candidates
    #[arg(short = 'i', long, default_value_t = 1.0)]
    insert_cost: f64,

    /// Quality factor (>= 1) candidates are measured against
    #[arg(short = 'q', long, default_value_t = 1.0)]
    quality: f64,

    /// Worker threads (default: available parallelism)
    #[arg(short = 't', long)]
    threads: Option<usize>,

    /// Deterministic seed for data generation
    #[arg(short = 's', long)]
    seed: Option<u64>,

    /// Also consider removing edges
    #[arg(long)]
    enable_remove: bool,

    /// Also consider reversing edges
    #[arg(long)]
    enable_reverse: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), LearnError> {
    let generator = GeneratorConfig {
        num_variable: cli.vars,
        num_record: cli.records,
        max_num_parent: cli.max_parents,
        percent_parent: cli.percent_parent,
    };
    let mut learner_cfg = LearnerConfig {
        max_parents: usize::try_from(cli.edge_cap).ok(),
        insert_edge_cost: cli.insert_cost,
        quality_factor: cli.quality,
        enable_remove: cli.enable_remove,
        enable_reverse: cli.enable_reverse,
        ..LearnerConfig::default()
    };
    if let Some(threads) = cli.threads {
        learner_cfg.num_threads = threads;
    }
    learner_cfg.validate()?;

    let seed = cli.seed.unwrap_or_else(rand::random);
    info!(seed, vars = cli.vars, records = cli.records, "generating data");
    let mut rng = SmallRng::seed_from_u64(seed);
    let (data, network) = Dataset::generate(&mut rng, &generator)?;
    let index = RecordIndex::new(&data);

    let reference_score = Learner::with_initial_edges(&index, learner_cfg.clone(), network.edges())?.score()?;

    let mut learner = Learner::new(&index, learner_cfg)?;
    let report = learner.run()?;
    learner.verify()?;

    let learned = learner.edges()?;
    let matched = learned
        .iter()
        .filter(|&&(from, to)| {
            network.edges().contains(&(from, to)) || network.edges().contains(&(to, from))
        })
        .count();

    println!("--------------------------------------------------");
    println!("{report}");
    println!("workers: {}", learner.config().num_threads);
    println!("generating network: {} edges, score {reference_score:.4}", network.edges().len());
    println!("learned edges matching the generating skeleton: {matched}/{}", learned.len());
    println!("verification: acyclic, accounting consistent");
    println!("--------------------------------------------------");
    Ok(())
}
