use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use selfplay_rl::checkpoint::load_state_dict;
use selfplay_rl::{
    evaluate, AgentSpec, BeaconFactory, ConventionSpec, Device, EvalConfig, ExplorationConfig,
    LinearQModel, PolicyModel, RuleBotKind, SelfPlayTrainer, TrainConfig,
};

/// Self-play training and evaluation on the Beacon signalling game.
#[derive(Parser)]
#[command(name = "selfplay", about = "Self-play actor/learner training")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a policy with the actor pool and prioritized replay
    Train(TrainArgs),
    /// Evaluate saved weights and/or rule bots
    Eval(EvalArgs),
}

#[derive(Args)]
struct TrainArgs {
    /// JSON training config; flags below override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Comma-separated inference devices, e.g. cpu,cuda:1
    #[arg(long, value_delimiter = ',')]
    devices: Option<Vec<Device>>,

    #[arg(long)]
    threads: Option<usize>,

    #[arg(long)]
    games_per_thread: Option<usize>,

    #[arg(long)]
    seats: Option<usize>,

    #[arg(long)]
    explore_min: Option<f32>,

    #[arg(long)]
    explore_max: Option<f32>,

    /// Replay buffer capacity in fragments
    #[arg(long)]
    buffer_size: Option<usize>,

    #[arg(long)]
    priority_alpha: Option<f32>,

    #[arg(long)]
    priority_beta: Option<f32>,

    /// JSON file of [signal, response] action pairs
    #[arg(long)]
    convention: Option<PathBuf>,

    #[arg(long)]
    convention_sender: Option<usize>,

    /// Frozen partner weights; defaults to the initial model
    #[arg(long)]
    partner_weights: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    /// Updates between evaluations
    #[arg(long)]
    epoch_len: Option<usize>,

    #[arg(long)]
    eval_episodes: Option<usize>,

    #[arg(long)]
    save_dir: Option<PathBuf>,

    #[arg(long)]
    save_every: Option<usize>,

    #[arg(long)]
    csv: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args)]
struct EvalArgs {
    /// One agent per seat: a weights file, `uniform` or `first_legal`
    #[arg(long = "agent", required = true)]
    agents: Vec<String>,

    #[arg(long, default_value_t = 1000)]
    episodes: usize,

    #[arg(long, default_value_t = 10)]
    threads: usize,

    #[arg(long, default_value_t = 1)]
    seed: u64,

    #[arg(long, default_value_t = 80)]
    max_len: usize,

    #[arg(long)]
    convention: Option<PathBuf>,

    #[arg(long, default_value_t = 0)]
    convention_sender: usize,

    /// Per-seat convention override flags, e.g. false,true
    #[arg(long, value_delimiter = ',')]
    overrides: Vec<bool>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => train(args),
        Command::Eval(args) => eval(args),
    }
}

fn fresh_model(factory: &BeaconFactory, seats: usize, seed: u64) -> LinearQModel {
    LinearQModel::new(
        factory.config.feature_size(seats),
        factory.config.num_actions(),
        seed,
    )
}

fn load_model(factory: &BeaconFactory, seats: usize, path: &Path) -> Result<LinearQModel> {
    let state = load_state_dict(path)?;
    let mut model = fresh_model(factory, seats, 0);
    model
        .load_state_dict(&state)
        .with_context(|| format!("loading weights from {}", path.display()))?;
    Ok(model)
}

fn train(args: TrainArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => TrainConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => TrainConfig::default(),
    };

    let pool = &mut config.pool;
    if let Some(devices) = args.devices {
        pool.devices = devices;
    }
    if let Some(n) = args.threads {
        pool.num_threads = n;
    }
    if let Some(n) = args.games_per_thread {
        pool.games_per_thread = n;
    }
    if let Some(n) = args.seats {
        pool.num_seats = n;
    }
    if let Some(sender) = args.convention_sender {
        pool.convention_sender = sender;
    }
    if let Some(seed) = args.seed {
        pool.seed = seed;
    }
    if args.explore_min.is_some() || args.explore_max.is_some() {
        let (default_min, default_max) = match config.exploration {
            ExplorationConfig::Geometric { min, max } => (min, max),
            _ => (1e-4, 0.1),
        };
        config.exploration = ExplorationConfig::Geometric {
            min: args.explore_min.unwrap_or(default_min),
            max: args.explore_max.unwrap_or(default_max),
        };
    }
    if let Some(n) = args.buffer_size {
        config.replay.capacity = n;
    }
    if let Some(alpha) = args.priority_alpha {
        config.replay.alpha = alpha;
    }
    if let Some(beta) = args.priority_beta {
        config.replay.beta = beta;
    }
    if args.convention.is_some() {
        config.convention = args.convention;
    }
    if args.partner_weights.is_some() {
        config.partner_weights = args.partner_weights;
    }
    if let Some(n) = args.epochs {
        config.num_epochs = n;
    }
    if let Some(n) = args.epoch_len {
        config.learner.epoch_len = n;
    }
    if let Some(n) = args.eval_episodes {
        config.eval.num_episodes = n;
    }
    if let Some(dir) = args.save_dir {
        config.checkpoint.dir = dir;
    }
    if let Some(n) = args.save_every {
        config.save_every_epochs = n;
    }
    if args.csv.is_some() {
        config.csv_log = args.csv;
    }

    let factory = BeaconFactory::default();
    let model = fresh_model(&factory, config.pool.num_seats, config.pool.seed);
    let summary = SelfPlayTrainer::new(config, model, factory)?.run()?;

    println!(
        "trained {} epochs, {} updates, {} episodes",
        summary.epochs, summary.updates, summary.episodes
    );
    match summary.best_score() {
        Some(best) => println!("best evaluation score: {best:.3}"),
        None => println!("no checkpoint saved"),
    }
    if summary.interrupted {
        bail!("training was interrupted");
    }
    Ok(())
}

fn eval(args: EvalArgs) -> Result<()> {
    let factory = BeaconFactory::default();
    let seats = args.agents.len();
    let mut agents: Vec<AgentSpec<LinearQModel>> = Vec::with_capacity(seats);
    for spec in &args.agents {
        let agent = match spec.parse::<RuleBotKind>() {
            Ok(kind) => AgentSpec::RuleBot(kind),
            Err(_) => AgentSpec::Learned(Arc::new(load_model(&factory, seats, Path::new(spec))?)),
        };
        agents.push(agent);
    }

    let convention = match &args.convention {
        Some(path) => ConventionSpec::load(path)?,
        None => ConventionSpec::empty(),
    };
    let config = EvalConfig::new(args.episodes, args.threads)
        .with_seats(seats)
        .with_seed(args.seed)
        .with_max_len(args.max_len)
        .with_convention_sender(args.convention_sender)
        .with_overrides(args.overrides);

    let outcome = evaluate(&agents, &factory, Arc::new(convention), &config)?;
    print!("{}", outcome.report());
    Ok(())
}
