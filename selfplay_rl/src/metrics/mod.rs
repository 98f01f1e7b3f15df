//! Training metrics and logging.
//!
//! ## Timing
//!
//! - [`Stopwatch`]: wall time per named section of the training loop
//! - [`EpochStats`]: running means of per-update values
//!
//! ## Loggers
//!
//! - [`ConsoleLogger`]: fixed-width table to any `Write` sink
//! - [`CsvLogger`]: CSV file logging for analysis
//! - [`MultiLogger`]: combine multiple loggers

pub mod logger;
pub mod stopwatch;

pub use logger::{ConsoleLogger, CsvLogger, EpochSnapshot, MetricsLogger, MultiLogger};
pub use stopwatch::{EpochStats, Stopwatch};
