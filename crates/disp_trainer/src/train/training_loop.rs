//! Training Loop - step counter driven control loop
//!
//! `Initializing -> Running -> {Testing, Finished}`, with `Testing` always
//! returning to `Running`. Per step: schedule lookup, one training step, then
//! the test / log / save gates in that order.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, error, info, warn};

use disp_engine::{Batch, DispRegressor, StepConfig, StepOutput, TrainableModel};

use super::args::TrainArgs;
use super::cadence::{CadenceHits, Cadences};
use super::checkpoint::CheckpointStore;
use super::resume::resume;
use super::schedule::ScheduleTable;
use super::summary::SummaryWriter;
use crate::data::Dataset;
use crate::feed::{BatchFeed, FeedItem, FeedOptions};

/// Last-test-error value before the first test pass.
pub const UNTESTED_ERROR: f32 = 1000.0;
pub const DEFAULT_TEST_ITERS: usize = 1000;

const TEST_SEED_SALT: u64 = 0x7e57;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    BudgetReached,
    FeedExhausted,
    Interrupted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopPhase {
    Initializing,
    Running,
    Testing,
    Finished(StopReason),
}

/// Mutable loop state, owned by the control thread.
#[derive(Clone, Debug, PartialEq)]
pub struct LoopState {
    pub step: u64,
    pub loss_accumulator: f64,
    pub last_test_error: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopConfig {
    pub max_steps: u64,
    pub test_iters: usize,
    pub cadences: Cadences,
}

impl LoopConfig {
    pub fn new(max_steps: u64, log_period: u64, save_period: u64, test_iters: usize) -> Result<Self> {
        anyhow::ensure!(test_iters > 0, "test iterations must be > 0");
        Ok(Self {
            max_steps,
            test_iters,
            cadences: Cadences::new(log_period, save_period)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LoopOutcome {
    pub reason: StopReason,
    pub final_step: u64,
    pub last_test_error: f32,
    /// Checkpoints written by this run, oldest first.
    pub checkpoints: Vec<PathBuf>,
}

pub struct TrainingLoop<'a, M: TrainableModel> {
    model: &'a mut M,
    schedule: &'a ScheduleTable,
    store: &'a CheckpointStore,
    summaries: &'a mut SummaryWriter,
    config: LoopConfig,
    start_step: u64,
    state: LoopState,
    phase: LoopPhase,
    stop: Arc<AtomicBool>,
    // side effects still due for the current step while a test pass runs
    pending: Option<CadenceHits>,
    last_config: Option<StepConfig>,
    last_output: Option<StepOutput>,
    window_time: Duration,
    checkpoints: Vec<PathBuf>,
}

impl<'a, M: TrainableModel> TrainingLoop<'a, M> {
    pub fn new(
        model: &'a mut M,
        schedule: &'a ScheduleTable,
        store: &'a CheckpointStore,
        summaries: &'a mut SummaryWriter,
        config: LoopConfig,
        start_step: u64,
    ) -> Self {
        Self {
            model,
            schedule,
            store,
            summaries,
            config,
            start_step,
            state: LoopState {
                step: start_step,
                loss_accumulator: 0.0,
                last_test_error: UNTESTED_ERROR,
            },
            phase: LoopPhase::Initializing,
            stop: Arc::new(AtomicBool::new(false)),
            pending: None,
            last_config: None,
            last_output: None,
            window_time: Duration::ZERO,
            checkpoints: Vec::new(),
        }
    }

    /// Flag checked between steps; setting it ends the loop after the current step.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    /// Drives the state machine until `Finished`. Feed exhaustion, the step
    /// budget and an interrupt end the loop normally; model failures are
    /// returned as errors without retry.
    pub fn run(&mut self, train: &mut BatchFeed, test: &mut BatchFeed) -> Result<LoopOutcome> {
        loop {
            self.phase = match self.phase {
                LoopPhase::Initializing => self.initialize(),
                LoopPhase::Running => self.running(train)?,
                LoopPhase::Testing => self.testing(test)?,
                LoopPhase::Finished(reason) => {
                    return Ok(LoopOutcome {
                        reason,
                        final_step: self.state.step,
                        last_test_error: self.state.last_test_error,
                        checkpoints: std::mem::take(&mut self.checkpoints),
                    });
                }
            };
        }
    }

    fn initialize(&mut self) -> LoopPhase {
        self.state = LoopState {
            step: self.start_step,
            loss_accumulator: 0.0,
            last_test_error: UNTESTED_ERROR,
        };
        self.pending = None;
        self.window_time = Duration::ZERO;
        info!(
            "Starting training loop at step {} (budget {} steps)",
            self.state.step, self.config.max_steps
        );
        LoopPhase::Running
    }

    fn running(&mut self, train: &mut BatchFeed) -> Result<LoopPhase> {
        let hits = match self.pending.take() {
            Some(hits) => hits,
            None => {
                if self.state.step >= self.config.max_steps {
                    return Ok(LoopPhase::Finished(StopReason::BudgetReached));
                }
                if self.stop.load(Ordering::SeqCst) {
                    info!("🛑 Stop requested at step {}", self.state.step);
                    return Ok(LoopPhase::Finished(StopReason::Interrupted));
                }

                let config = self.step_config();
                if self.schedule.is_phase_start(self.state.step) {
                    info!("iter: {}, switching weights:", self.state.step);
                    info!("{:?}", config.loss_weights);
                    info!("learning rate: {:e}", config.learning_rate);
                }

                let batch = match train.next() {
                    FeedItem::Batch(batch) => batch,
                    FeedItem::Exhausted => {
                        info!("Done training: input exhausted after {} steps", self.state.step);
                        return Ok(LoopPhase::Finished(StopReason::FeedExhausted));
                    }
                    FeedItem::Failed(reason) => {
                        anyhow::bail!("Training input failed at step {}: {}", self.state.step, reason)
                    }
                };
                self.train_on(&batch, config)?;

                let hits = self.config.cadences.hits(self.state.step);
                if hits.test {
                    self.pending = Some(hits);
                    return Ok(LoopPhase::Testing);
                }
                hits
            }
        };

        self.after_step(hits)?;

        if self.state.step >= self.config.max_steps {
            return Ok(LoopPhase::Finished(StopReason::BudgetReached));
        }
        Ok(LoopPhase::Running)
    }

    fn step_config(&self) -> StepConfig {
        let phase = self.schedule.lookup(self.state.step);
        StepConfig {
            loss_weights: phase.loss_weights.clone(),
            learning_rate: phase.learning_rate,
            last_test_error: self.state.last_test_error,
        }
    }

    fn train_on(&mut self, batch: &Batch, config: StepConfig) -> Result<()> {
        let start = Instant::now();
        let output = self.model.train_step(batch, &config)?;
        self.window_time += start.elapsed();

        self.state.loss_accumulator += output.loss as f64;
        self.state.step += 1;
        self.last_config = Some(config);
        self.last_output = Some(output);
        Ok(())
    }

    fn testing(&mut self, test: &mut BatchFeed) -> Result<LoopPhase> {
        info!("Testing...");
        let mut total = 0.0f64;
        for _ in 0..self.config.test_iters {
            let batch = match test.next() {
                FeedItem::Batch(batch) => batch,
                FeedItem::Exhausted => {
                    warn!("⚠️ Test feed exhausted during test pass at step {}", self.state.step);
                    return Ok(LoopPhase::Finished(StopReason::FeedExhausted));
                }
                FeedItem::Failed(reason) => {
                    anyhow::bail!("Test input failed at step {}: {}", self.state.step, reason)
                }
            };
            total += self.model.test_error(&batch)? as f64;
        }
        let test_error = (total / self.config.test_iters as f64) as f32;
        self.state.last_test_error = test_error;
        info!("Test error {:.6}", test_error);
        Ok(LoopPhase::Running)
    }

    fn after_step(&mut self, hits: CadenceHits) -> Result<()> {
        let step = self.state.step;

        if hits.log {
            let log_period = self.config.cadences.log.period();
            let mean_loss = (self.state.loss_accumulator / log_period as f64) as f32;
            let mut config = self.last_config.clone().unwrap_or_else(|| self.step_config());
            config.last_test_error = self.state.last_test_error;

            let summary = self.model.summary(&config, mean_loss)?;
            self.summaries.add_summary(&summary, step)?;

            let step_time = self.window_time.as_secs_f64() / log_period as f64;
            let train_error = self.last_output.map_or(f32::NAN, |o| o.train_error);
            debug!(
                "iter: {}, f/b pass time: {:.6}, loss: {:.6}, error {:.6}",
                step, step_time, mean_loss, train_error
            );
            self.state.loss_accumulator = 0.0;
            self.window_time = Duration::ZERO;
        }

        if hits.save {
            info!("saving to file {}", self.store.path_for(step).display());
            let loss = self.last_output.map_or(f32::NAN, |o| o.loss);
            let path = self.store.save(&*self.model, step, loss)?;
            self.checkpoints.push(path);
        }

        Ok(())
    }
}

fn install_interrupt_handler() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let s = stop.clone();
    let ctrl_c_count = Arc::new(AtomicUsize::new(0));

    let installed = ctrlc::set_handler(move || {
        let count = ctrl_c_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count == 1 {
            info!("\n\n🛑 Ctrl+C detected! Finishing current step and shutting down...");
            info!("   (Press Ctrl+C again to force quit)");
            s.store(true, Ordering::SeqCst);
        } else {
            error!("\n⚠️  Force quit! Exiting immediately.");
            std::process::exit(1);
        }
    });
    if let Err(e) = installed {
        warn!("⚠️ Ctrl+C handler not installed: {}", e);
    }
    stop
}

/// Main training function
pub fn run(args: TrainArgs) -> Result<LoopOutcome> {
    // ============================================================
    // Section 1: Configuration
    // ============================================================
    args.validate()?;
    let loop_config = args.loop_config()?;
    let schedule = args.schedule_table()?;

    info!("--- {} Training ---", args.model_name());
    info!(
        "Config: Batch={}, Steps={}, Log={}, Save/Test={}, TestIters={}",
        args.batch_size, args.n_steps, args.log_step, args.save_step, args.test_iters
    );
    info!(
        "Schedule: {} phase(s), {} steps per phase",
        schedule.len(),
        schedule.period()
    );

    let train_set = Arc::new(Dataset::from_list(&args.training)?);
    let test_set = Arc::new(Dataset::from_list(&args.testing)?);
    anyhow::ensure!(
        train_set.dim() == test_set.dim(),
        "Training samples have {} features but test samples have {}",
        train_set.dim(),
        test_set.dim()
    );

    // ============================================================
    // Section 2: Initialization
    // ============================================================
    std::fs::create_dir_all(&args.checkpoint_path)?;
    let mut model = DispRegressor::new(args.model_config(train_set.dim()))?;
    model.init()?;
    debug!("initialized");

    let store = CheckpointStore::new(&args.checkpoint_path, args.model_name(), args.keep_checkpoints);
    let resume_point = resume(&store, &mut model, args.weights.as_deref())?;

    let train_options = FeedOptions::new(args.batch_size)
        .with_epochs(args.epochs)
        .with_seed(args.seed.wrapping_add(resume_point.start_step));
    let test_options = FeedOptions::new(args.batch_size).with_seed(args.seed ^ TEST_SEED_SALT);
    let mut train_feed = BatchFeed::spawn("train", train_set, train_options)?;
    let mut test_feed = BatchFeed::spawn("test", test_set, test_options)?;
    debug!("input feeds started");

    let mut summaries = SummaryWriter::create(&args.checkpoint_path)?;
    let stop = install_interrupt_handler();

    // ============================================================
    // Section 3: Loop
    // ============================================================
    let mut training = TrainingLoop::new(
        &mut model,
        &schedule,
        &store,
        &mut summaries,
        loop_config,
        resume_point.start_step,
    )
    .with_stop_flag(stop);
    let outcome = training.run(&mut train_feed, &mut test_feed);

    // Feeds are released on every exit path before the result is reported.
    train_feed.stop();
    test_feed.stop();

    let outcome = outcome?;
    match outcome.reason {
        StopReason::BudgetReached => info!("Training complete at step {}.", outcome.final_step),
        StopReason::FeedExhausted => info!("Input exhausted at step {}.", outcome.final_step),
        StopReason::Interrupted => info!("Exiting gracefully at step {}.", outcome.final_step),
    }
    Ok(outcome)
}
