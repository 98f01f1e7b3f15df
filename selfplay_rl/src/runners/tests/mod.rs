//! End-to-end tests for the training runners.
//!
//! These drive the real actor pool, game loops, evaluator and checkpointing
//! together on threads, with the linear model and the Beacon game.
//!
//! - `integration_tests`: pool layout, eval thread split, server
//!   consultation without a convention, top-k retention, learner/pool
//!   weight flow and a short full run

mod integration_tests;
