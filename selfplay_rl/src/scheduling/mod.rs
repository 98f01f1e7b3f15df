//! Exploration scheduling for the actor pool.
//!
//! - [`ExplorationSchedule::geometric`]: rates spaced geometrically between
//!   a minimum and a maximum, one per game-loop thread
//! - [`ExplorationSchedule::ape_x`]: `base^(1 + i/(n-1) * alpha)` spacing
//!
//! ## Example
//!
//! ```rust
//! use selfplay_rl::scheduling::ExplorationSchedule;
//!
//! let schedule = ExplorationSchedule::geometric(0.001, 0.1, 4).unwrap();
//! assert_eq!(schedule.len(), 4);
//! assert!((schedule.rate(0) - 0.1).abs() < 1e-6);
//! ```

pub mod exploration;


pub use exploration::ExplorationSchedule;
