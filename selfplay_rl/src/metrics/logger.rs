//! Epoch loggers for self-play training.
//!
//! Provides different logging backends for the per-epoch summary the trainer
//! emits after each evaluation.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// One row of training progress.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpochSnapshot {
    pub epoch: usize,
    /// Gradient updates since the start of training.
    pub updates: u64,
    /// Game steps played by all loops.
    pub env_steps: u64,
    /// Training episodes finished.
    pub episodes: u64,
    pub buffer_size: usize,
    /// Mean score of training episodes so far.
    pub train_score: f32,
    pub eval_score: f32,
    pub eval_sem: f32,
    pub perfect_rate: f32,
    pub loss: f32,
    pub grad_norm: f32,
    /// Mean requests per `Act` batch on the online servers.
    pub act_batch_size: f32,
    pub elapsed_secs: f32,
}

impl EpochSnapshot {
    pub fn new(epoch: usize, updates: u64) -> Self {
        Self {
            epoch,
            updates,
            ..Default::default()
        }
    }

    pub fn with_progress(mut self, env_steps: u64, episodes: u64, buffer_size: usize) -> Self {
        self.env_steps = env_steps;
        self.episodes = episodes;
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_eval(mut self, score: f32, sem: f32, perfect_rate: f32) -> Self {
        self.eval_score = score;
        self.eval_sem = sem;
        self.perfect_rate = perfect_rate;
        self
    }

    pub fn with_training(mut self, train_score: f32, loss: f32, grad_norm: f32) -> Self {
        self.train_score = train_score;
        self.loss = loss;
        self.grad_norm = grad_norm;
        self
    }

    pub fn with_batching(mut self, act_batch_size: f32) -> Self {
        self.act_batch_size = act_batch_size;
        self
    }

    pub fn with_elapsed(mut self, secs: f32) -> Self {
        self.elapsed_secs = secs;
        self
    }

    /// Game steps per second over the elapsed time, 0 when no time passed.
    pub fn steps_per_second(&self) -> f32 {
        if self.elapsed_secs <= 0.0 {
            0.0
        } else {
            self.env_steps as f32 / self.elapsed_secs
        }
    }
}

/// Logger trait for different logging backends.
pub trait MetricsLogger: Send {
    fn log(&mut self, snapshot: &EpochSnapshot);

    /// Flush any buffered output.
    fn flush(&mut self);
}

/// Fixed-width table written to any sink.
pub struct ConsoleLogger<W: Write + Send> {
    writer: W,
    show_header: bool,
}

impl ConsoleLogger<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> ConsoleLogger<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            show_header: true,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_header(&mut self) -> io::Result<()> {
        writeln!(
            self.writer,
            "{:>6} {:>10} {:>12} {:>9} {:>9} {:>8} {:>8} {:>8} {:>10} {:>8} {:>8}",
            "Epoch", "Updates", "EnvSteps", "Buffer", "Train", "Eval", "SEM", "Perfect", "Loss", "Batch", "SPS"
        )?;
        writeln!(self.writer, "{}", "-".repeat(106))
    }

    fn write_row(&mut self, s: &EpochSnapshot) -> io::Result<()> {
        writeln!(
            self.writer,
            "{:>6} {:>10} {:>12} {:>9} {:>9.3} {:>8.3} {:>8.3} {:>7.1}% {:>10.5} {:>8.1} {:>8.0}",
            s.epoch,
            s.updates,
            s.env_steps,
            s.buffer_size,
            s.train_score,
            s.eval_score,
            s.eval_sem,
            s.perfect_rate * 100.0,
            s.loss,
            s.act_batch_size,
            s.steps_per_second()
        )
    }
}

impl<W: Write + Send> MetricsLogger for ConsoleLogger<W> {
    fn log(&mut self, snapshot: &EpochSnapshot) {
        if self.show_header {
            if let Err(e) = self.write_header() {
                log::warn!("console logger: {e}");
            }
            self.show_header = false;
        }
        if let Err(e) = self.write_row(snapshot) {
            log::warn!("console logger: {e}");
        }
    }

    fn flush(&mut self) {
        let _ = self.writer.flush();
    }
}

/// CSV file logger for analysis.
pub struct CsvLogger {
    writer: BufWriter<File>,
}

impl CsvLogger {
    /// Create the file and write the header row.
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writeln!(
            writer,
            "epoch,updates,env_steps,episodes,buffer_size,train_score,eval_score,eval_sem,perfect_rate,loss,grad_norm,act_batch_size,elapsed_secs"
        )?;
        Ok(Self { writer })
    }
}

impl MetricsLogger for CsvLogger {
    fn log(&mut self, s: &EpochSnapshot) {
        let _ = writeln!(
            self.writer,
            "{},{},{},{},{},{:.4},{:.4},{:.4},{:.4},{:.6},{:.4},{:.2},{:.2}",
            s.epoch,
            s.updates,
            s.env_steps,
            s.episodes,
            s.buffer_size,
            s.train_score,
            s.eval_score,
            s.eval_sem,
            s.perfect_rate,
            s.loss,
            s.grad_norm,
            s.act_batch_size,
            s.elapsed_secs
        );
    }

    fn flush(&mut self) {
        let _ = self.writer.flush();
    }
}

impl Drop for CsvLogger {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Multi-logger that writes to multiple backends.
#[derive(Default)]
pub struct MultiLogger {
    loggers: Vec<Box<dyn MetricsLogger>>,
}

impl MultiLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<L: MetricsLogger + 'static>(mut self, logger: L) -> Self {
        self.loggers.push(Box::new(logger));
        self
    }

    pub fn len(&self) -> usize {
        self.loggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loggers.is_empty()
    }
}

impl MetricsLogger for MultiLogger {
    fn log(&mut self, snapshot: &EpochSnapshot) {
        for logger in &mut self.loggers {
            logger.log(snapshot);
        }
    }

    fn flush(&mut self) {
        for logger in &mut self.loggers {
            logger.flush();
        }
    }
}
