//! Integration tests for self-play training.
//!
//! # Notes
//!
//! - Every test uses real threads and real servers
//! - Timeouts come from the learner's warm-up limit, never from sleeps
//! - Focus is on coordination, not on learning progress

use std::sync::Arc;

use crate::actors::{
    ActorPool, ActorPoolConfig, LoopMode, PartnerWeights, RuleBotKind, StatCounters,
    ThreadLoopContext,
};
use crate::buffers::{FragmentReplay, ReplayConfig};
use crate::checkpoint::{load_state_dict, TopKSaver, TopKSaverConfig};
use crate::convention::ConventionSpec;
use crate::environment::BeaconFactory;
use crate::evaluator::{evaluate, AgentSpec, EvalConfig};
use crate::inference::Method;
use crate::learner::{Learner, LearnerConfig};
use crate::metrics::ConsoleLogger;
use crate::model::{LinearQModel, PolicyModel};
use crate::runners::{SelfPlayTrainer, TrainConfig};
use crate::scheduling::ExplorationSchedule;

fn linear_model(factory: &BeaconFactory, seats: usize) -> LinearQModel {
    LinearQModel::new(
        factory.config.feature_size(seats),
        factory.config.num_actions(),
        7,
    )
}

fn pool(
    config: ActorPoolConfig,
    factory: &BeaconFactory,
    convention: ConventionSpec,
    replay: &Arc<FragmentReplay>,
) -> ActorPool<LinearQModel> {
    let model = linear_model(factory, config.num_seats);
    let exploration = ExplorationSchedule::constant(0.1, config.num_threads);
    ActorPool::new(
        config,
        &model,
        PartnerWeights::SameAsOnline,
        &exploration,
        Arc::new(convention),
        Arc::clone(replay),
    )
    .unwrap()
}

fn replay(capacity: usize) -> Arc<FragmentReplay> {
    Arc::new(FragmentReplay::new(ReplayConfig::new().with_capacity(capacity)))
}

// ============================================================================
// Pool Layout
// ============================================================================

/// Two threads of three two-seat games on one device.
/// INTENT: the grid holds T*G*P actors and one server pair per device.
#[test]
fn test_pool_grid_on_one_device() {
    let factory = BeaconFactory::default();
    let config = ActorPoolConfig::new()
        .with_threads(2)
        .with_games_per_thread(3)
        .with_seats(2);
    let pool = pool(config, &factory, ConventionSpec::empty(), &replay(64));

    assert_eq!(pool.manifest().len(), 12);
    assert_eq!(pool.servers().len(), 1);
    let pair = &pool.servers()[0];
    for entry in pool.manifest() {
        let expected = if entry.learning {
            pair.online.name()
        } else {
            pair.partner.name()
        };
        assert_eq!(entry.server, expected);
        assert_eq!(entry.siblings.len(), 1);
        assert!(entry.siblings.iter().all(|s| s.same_game(&entry.id)));
    }
    assert_eq!(pool.manifest().iter().filter(|e| e.learning).count(), 6);
}

// ============================================================================
// Evaluation Split
// ============================================================================

/// 100 episodes over 10 threads with a learned seat and a rule bot.
/// INTENT: each thread finishes exactly its share of episodes.
#[test]
fn test_eval_splits_episodes_evenly_across_threads() {
    let factory = BeaconFactory::default();
    let agents = vec![
        AgentSpec::Learned(Arc::new(linear_model(&factory, 2))),
        AgentSpec::RuleBot(RuleBotKind::Uniform),
    ];
    let config = EvalConfig::new(100, 10).with_seed(3).with_max_len(30);
    let outcome = evaluate(&agents, &factory, Arc::new(ConventionSpec::empty()), &config).unwrap();

    assert_eq!(outcome.episodes.len(), 100);
    assert_eq!(outcome.episodes_per_thread(), vec![10; 10]);
    assert_eq!(outcome.actors.len(), 200);
    let report = outcome.report();
    assert_eq!(report.episodes, 100);
    assert!(report.mean >= 0.0);
}

// ============================================================================
// Server Consultation
// ============================================================================

/// Without a convention, every act of every seat is an `Act` request.
/// INTENT: nothing bypasses the inference server, not even forced passes.
#[test]
fn test_empty_convention_always_consults_server() {
    let factory = BeaconFactory::default();
    let config = ActorPoolConfig::new()
        .with_threads(2)
        .with_games_per_thread(2)
        .with_seats(2)
        .with_max_len(25);
    let mut pool = pool(config, &factory, ConventionSpec::empty(), &replay(256));

    let mut ctx = ThreadLoopContext::new();
    for game_loop in pool.take_loops(&factory, LoopMode::Eval).unwrap() {
        ctx.push(game_loop);
    }
    pool.start().unwrap();
    ctx.start();
    let outcomes = ctx.join();
    pool.stop();

    let mut episodes = 0;
    let mut steps = 0;
    let mut stats = StatCounters::new();
    for outcome in &outcomes {
        assert!(outcome.error.is_none());
        episodes += outcome.episodes.len();
        steps += outcome.episodes.iter().map(|e| e.steps).sum::<usize>();
        for actor in &outcome.actors {
            stats.merge(actor.stats());
        }
    }
    assert_eq!(episodes, 4);

    let pair = &pool.servers()[0];
    let requests = pair.online.stats(Method::Act).requests + pair.partner.stats(Method::Act).requests;
    assert_eq!(requests as usize, steps * 2);
    assert_eq!(stats.get("convention_scripted"), 0);
}

// ============================================================================
// Checkpoint Retention
// ============================================================================

/// Scores 3, 7, 5, 9, 1 into a K=2 saver.
/// INTENT: the two best survive and their files hold those models.
#[test]
fn test_top_k_keeps_two_best_models() {
    let dir = tempfile::tempdir().unwrap();
    let factory = BeaconFactory::default();
    let mut saver = TopKSaver::new(TopKSaverConfig::new(dir.path()).with_k(2)).unwrap();

    for (i, score) in [3.0, 7.0, 5.0, 9.0, 1.0].into_iter().enumerate() {
        let model = LinearQModel::new(
            factory.config.feature_size(2),
            factory.config.num_actions(),
            i as u64,
        );
        saver.save(&model.state_dict(), score, None).unwrap();
    }
    assert_eq!(saver.retained(), vec![9.0, 7.0]);

    let (best, path) = saver.best().unwrap();
    assert_eq!(best, 9.0);
    let expected = LinearQModel::new(factory.config.feature_size(2), factory.config.num_actions(), 3);
    assert_eq!(load_state_dict(&path).unwrap(), expected.state_dict());
}

// ============================================================================
// Learner and Pool
// ============================================================================

/// Training loops feed the learner while it pushes weights to the pool.
/// INTENT: updates run on real fragments and reach the online servers.
#[test]
fn test_learner_trains_on_pool_fragments() {
    let factory = BeaconFactory::default();
    let config = ActorPoolConfig::new()
        .with_threads(2)
        .with_games_per_thread(2)
        .with_fragment_len(5)
        .with_max_len(20);
    let buffer = replay(128);
    let mut pool = pool(config, &factory, ConventionSpec::empty(), &buffer);
    let initial = pool.servers()[0].online.snapshot().model().clone();

    let mut ctx = ThreadLoopContext::new();
    for game_loop in pool.take_loops(&factory, LoopMode::Train).unwrap() {
        ctx.push(game_loop);
    }
    let learner_config = LearnerConfig::new()
        .with_batch_size(8)
        .with_lr(0.05)
        .with_actor_sync_freq(2)
        .with_epoch_len(6)
        .with_burn_in(8)
        .with_warmup_poll_ms(5)
        .with_warmup_timeout_secs(30);
    let mut learner = Learner::new(learner_config, initial.clone(), Arc::clone(&buffer)).unwrap();

    pool.start().unwrap();
    ctx.start();
    assert!(learner.wait_for_warmup());
    let summary = learner.train_epoch(&pool).unwrap();
    pool.stop();
    ctx.stop();
    for outcome in ctx.join() {
        assert!(outcome.error.is_none());
    }

    assert_eq!(summary.updates, 6);
    assert!(summary.mean_loss.is_finite());
    // Pushes at updates 2 and 4 carry trained weights.
    let served = pool.servers()[0].online.snapshot().model().state_dict();
    assert_ne!(served, initial.state_dict());
    assert_eq!(
        pool.servers()[0].partner.snapshot().model().state_dict(),
        initial.state_dict()
    );
}

// ============================================================================
// Full Run
// ============================================================================

/// A two-epoch run from a JSON document with the linear model.
/// INTENT: the trainer wires every component and shuts down cleanly.
#[test]
fn test_short_run_from_json_config() {
    let dir = tempfile::tempdir().unwrap();
    let text = format!(
        r#"{{
            "num_epochs": 2,
            "pool": {{"num_threads": 2, "games_per_thread": 2, "max_len": 20, "fragment_len": 5}},
            "replay": {{"capacity": 128}},
            "learner": {{"batch_size": 8, "epoch_len": 4, "burn_in": 4, "warmup_poll_ms": 5, "warmup_timeout_secs": 30}},
            "eval": {{"num_episodes": 4, "num_threads": 2}},
            "checkpoint": {{"dir": {:?}, "k": 1}},
            "exploration": {{"kind": "ape_x", "base": 0.4, "alpha": 7.0}}
        }}"#,
        dir.path().join("ckpt")
    );
    let path = dir.path().join("train.json");
    std::fs::write(&path, text).unwrap();
    let config = TrainConfig::from_json_file(&path).unwrap();

    let factory = BeaconFactory::default();
    let model = linear_model(&factory, config.pool.num_seats);
    let summary = SelfPlayTrainer::new(config, model, factory)
        .unwrap()
        .with_logger(ConsoleLogger::new(Vec::new()))
        .run()
        .unwrap();

    assert_eq!(summary.epochs, 2);
    assert_eq!(summary.updates, 8);
    assert_eq!(summary.retained.len(), 1);
    assert!(!summary.interrupted);
    assert!(dir.path().join("ckpt").join("model0.json").exists());
}
