//! Self-play training runner.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ game-loop threads (T)        servers (2 per device)          │
//! │   actors ── act ──────────▶  online / partner                │
//! │   actors ── push ─────────▶  replay buffer                   │
//! │                                   │                          │
//! │ caller thread                     ▼                          │
//! │   learner: sample → loss → update priority                   │
//! │            every K updates ─ push weights ─▶ online servers  │
//! │   per epoch: evaluate frozen copy → top-k save → log row     │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use super::config::TrainConfig;
use crate::actors::{ActorPool, LoopMode, LoopProgress, PartnerWeights, ThreadLoopContext};
use crate::buffers::FragmentReplay;
use crate::checkpoint::TopKSaver;
use crate::convention::ConventionSpec;
use crate::environment::GameFactory;
use crate::error::TrainError;
use crate::evaluator::{evaluate, AgentSpec};
use crate::learner::Learner;
use crate::metrics::{ConsoleLogger, CsvLogger, EpochSnapshot, MetricsLogger, MultiLogger};
use crate::model::PolicyModel;

/// What a finished run reports back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainSummary {
    pub epochs: usize,
    pub updates: u64,
    pub episodes: u64,
    pub env_steps: u64,
    /// Mean evaluation score after each epoch.
    pub eval_scores: Vec<f32>,
    /// Scores of the checkpoints still on disk, best first.
    pub retained: Vec<f32>,
    /// True if shutdown was requested before all epochs ran.
    pub interrupted: bool,
}

impl TrainSummary {
    pub fn best_score(&self) -> Option<f32> {
        self.retained.first().copied()
    }
}

/// Wires pool, learner, evaluator and checkpointing into one run.
pub struct SelfPlayTrainer<M: PolicyModel, F: GameFactory> {
    config: TrainConfig,
    model: M,
    factory: F,
    logger: Box<dyn MetricsLogger>,
    shutdown: Arc<AtomicBool>,
}

impl<M: PolicyModel, F: GameFactory> SelfPlayTrainer<M, F> {
    /// Validate `config` and set up the default loggers: a console table on
    /// stdout plus the CSV file if one is configured.
    pub fn new(config: TrainConfig, model: M, factory: F) -> Result<Self, TrainError> {
        config.validate()?;
        let mut logger = MultiLogger::new().add(ConsoleLogger::stdout());
        if let Some(path) = &config.csv_log {
            logger = logger.add(CsvLogger::new(path)?);
        }
        Ok(Self {
            config,
            model,
            factory,
            logger: Box::new(logger),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Replace the epoch logger.
    pub fn with_logger<L: MetricsLogger + 'static>(mut self, logger: L) -> Self {
        self.logger = Box::new(logger);
        self
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Setting this flag ends the run after the current update.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn run(self) -> Result<TrainSummary, TrainError> {
        let Self {
            config,
            model,
            factory,
            mut logger,
            shutdown,
        } = self;
        log::info!("training config:\n{}", config.to_json());

        let convention = Arc::new(match &config.convention {
            Some(path) => ConventionSpec::load(path)?,
            None => ConventionSpec::empty(),
        });
        let replay = Arc::new(FragmentReplay::new(config.replay.clone()));
        let exploration = config.exploration.schedule(config.pool.num_threads)?;
        log::info!("exploration rates: {:?}", exploration.rates());
        let partner = match &config.partner_weights {
            Some(path) => PartnerWeights::File(path.clone()),
            None => PartnerWeights::SameAsOnline,
        };

        let mut pool = ActorPool::new(
            config.pool.clone(),
            &model,
            partner,
            &exploration,
            Arc::clone(&convention),
            Arc::clone(&replay),
        )?;
        let mut ctx = ThreadLoopContext::new();
        for game_loop in pool.take_loops(&factory, LoopMode::Train)? {
            ctx.push(game_loop);
        }
        let partner_model = Arc::new(
            pool.servers()
                .first()
                .map(|pair| pair.partner.snapshot().model().clone())
                .unwrap_or_else(|| model.clone()),
        );
        let learner = Learner::new(config.learner.clone(), model, Arc::clone(&replay))?
            .with_shutdown(Arc::clone(&shutdown));
        let saver = TopKSaver::new(config.checkpoint.clone())?;

        pool.start()?;
        ctx.start();
        let mut session = Session {
            config: &config,
            factory: &factory,
            pool: &pool,
            replay: &replay,
            progress: Arc::clone(ctx.progress()),
            convention,
            partner: partner_model,
            learner,
            saver,
            logger: logger.as_mut(),
        };
        let result = session.run();

        // Blocked actors only wake once their server stops.
        pool.stop();
        ctx.stop();
        for outcome in ctx.join() {
            if let Some(e) = outcome.error {
                log::warn!("game loop {} ended with: {}", outcome.index, e);
            }
        }
        logger.flush();
        result
    }
}

struct Session<'a, M: PolicyModel, F: GameFactory> {
    config: &'a TrainConfig,
    factory: &'a F,
    pool: &'a ActorPool<M>,
    replay: &'a Arc<FragmentReplay>,
    progress: Arc<LoopProgress>,
    convention: Arc<ConventionSpec>,
    partner: Arc<M>,
    learner: Learner<M>,
    saver: TopKSaver,
    logger: &'a mut dyn MetricsLogger,
}

impl<M: PolicyModel, F: GameFactory> Session<'_, M, F> {
    fn run(&mut self) -> Result<TrainSummary, TrainError> {
        let start = Instant::now();
        let mut summary = TrainSummary::default();
        if !self.learner.wait_for_warmup() {
            summary.interrupted = true;
            return Ok(summary);
        }

        for epoch in 0..self.config.num_epochs {
            if self.learner.is_shutdown() {
                summary.interrupted = true;
                break;
            }
            let trained = self.learner.train_epoch(self.pool)?;

            let frozen = Arc::new(self.learner.model().clone());
            let agents: Vec<AgentSpec<M>> = (0..self.config.pool.num_seats)
                .map(|seat| {
                    if seat == 0 {
                        AgentSpec::Learned(Arc::clone(&frozen))
                    } else {
                        AgentSpec::Learned(Arc::clone(&self.partner))
                    }
                })
                .collect();
            let outcome = evaluate(
                &agents,
                self.factory,
                Arc::clone(&self.convention),
                &self.config.eval_config(epoch),
            )?;
            let report = outcome.report();

            let every = self.config.save_every_epochs;
            let force_name =
                (epoch > 0 && every > 0 && epoch % every == 0).then(|| format!("model_epoch{epoch}"));
            self.saver
                .save(&frozen.state_dict(), report.mean, force_name.as_deref())?;

            let snapshot = EpochSnapshot::new(epoch, self.learner.updates())
                .with_progress(
                    self.progress.steps(),
                    self.progress.episodes(),
                    self.replay.size(),
                )
                .with_training(
                    self.progress.mean_score() as f32,
                    trained.mean_loss,
                    trained.mean_grad_norm,
                )
                .with_eval(report.mean, report.sem, report.perfect_rate)
                .with_batching(self.pool.act_stats().mean_batch_size() as f32)
                .with_elapsed(start.elapsed().as_secs_f32());
            self.logger.log(&snapshot);
            self.logger.flush();
            log::info!("epoch {epoch} evaluation:\n{report}");

            summary.epochs += 1;
            summary.eval_scores.push(report.mean);
        }

        if self.learner.is_shutdown() && summary.epochs < self.config.num_epochs {
            summary.interrupted = true;
        }
        summary.updates = self.learner.updates();
        summary.episodes = self.progress.episodes();
        summary.env_steps = self.progress.steps();
        summary.retained = self.saver.retained();
        Ok(summary)
    }
}
