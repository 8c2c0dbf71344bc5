mod common;

use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Mutex};

use common::{dataset, dataset_from, endless_feed, single_phase_table, stepped_table, MockModel};
use disp_trainer::feed::{BatchFeed, FeedItem, FeedOptions};
use disp_trainer::train::summary::{read_summaries, SummaryWriter};
use disp_trainer::train::training_loop::{LoopPhase, UNTESTED_ERROR};
use disp_trainer::train::{resume, CheckpointStore, LoopConfig, StopReason, TrainingLoop};

#[test]
fn test_save_and_test_at_step_1000() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = CheckpointStore::new(dir.path(), "Mock", 0);
    let mut summaries = SummaryWriter::create(dir.path())?;
    let schedule = single_phase_table(50_000);
    let mut model = MockModel::new();
    let config = LoopConfig::new(1500, 100, 1000, 1000)?;

    let mut train = endless_feed("train");
    let mut test = endless_feed("test");
    let outcome = TrainingLoop::new(&mut model, &schedule, &store, &mut summaries, config, 0)
        .run(&mut train, &mut test)?;

    assert_eq!(outcome.reason, StopReason::BudgetReached);
    assert_eq!(outcome.final_step, 1500);
    assert!(dir.path().join("Mock-1000.safetensors").exists());
    assert_eq!(outcome.checkpoints, vec![dir.path().join("Mock-1000.safetensors")]);

    // mean of 1..=1000
    assert_eq!(model.test_calls, 1000);
    assert_eq!(outcome.last_test_error, 500.5);

    // steps 0..999 ran before any test, 1000.. after
    assert!(model.configs[..1000].iter().all(|c| c.last_test_error == UNTESTED_ERROR));
    assert!(model.configs[1000..].iter().all(|c| c.last_test_error == 500.5));
    Ok(())
}

#[test]
fn test_log_cadence_writes_mean_loss_and_resets() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = CheckpointStore::new(dir.path(), "Mock", 0);
    let mut summaries = SummaryWriter::create(dir.path())?;
    let schedule = single_phase_table(1000);
    let mut model = MockModel::new();
    let config = LoopConfig::new(50, 10, 20, 4)?;

    let mut train = endless_feed("train");
    let mut test = endless_feed("test");
    let mut training = TrainingLoop::new(&mut model, &schedule, &store, &mut summaries, config, 0);
    assert_eq!(training.phase(), LoopPhase::Initializing);
    let outcome = training.run(&mut train, &mut test)?;
    assert_eq!(training.phase(), LoopPhase::Finished(StopReason::BudgetReached));
    assert_eq!(training.state().step, outcome.final_step);
    // step 50 closed a log window
    assert_eq!(training.state().loss_accumulator, 0.0);
    assert_eq!(training.state().last_test_error, outcome.last_test_error);
    drop(training);

    let records = read_summaries(summaries.path())?;
    let steps: Vec<u64> = records.iter().map(|r| r.step).collect();
    assert_eq!(steps, vec![10, 20, 30, 40, 50]);
    for record in &records {
        // constant loss 2.0 per step, window fully accumulated then reset
        assert_eq!(record.scalars["loss"], 2.0);
    }
    // the step-20 summary is written after that step's test pass
    assert_eq!(records[0].scalars["test_error"], UNTESTED_ERROR as f64);
    assert_eq!(records[1].scalars["test_error"], 2.5);
    Ok(())
}

#[test]
fn test_feed_exhaustion_is_graceful() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = CheckpointStore::new(dir.path(), "Mock", 0);
    let mut summaries = SummaryWriter::create(dir.path())?;
    let schedule = single_phase_table(1000);
    let mut model = MockModel::new();
    let config = LoopConfig::new(1000, 10, 100, 1)?;

    // 10 samples / batch 2 / one epoch = 5 steps
    let mut train = BatchFeed::spawn("train", dataset(10), FeedOptions::new(2).with_epochs(Some(1)))?;
    let mut test = endless_feed("test");
    let outcome = TrainingLoop::new(&mut model, &schedule, &store, &mut summaries, config, 0)
        .run(&mut train, &mut test)?;

    assert_eq!(outcome.reason, StopReason::FeedExhausted);
    assert_eq!(outcome.final_step, 5);
    assert!(outcome.checkpoints.is_empty());
    Ok(())
}

#[test]
fn test_stop_flag_ends_before_next_step() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = CheckpointStore::new(dir.path(), "Mock", 0);
    let mut summaries = SummaryWriter::create(dir.path())?;
    let schedule = single_phase_table(1000);
    let mut model = MockModel::new();
    let config = LoopConfig::new(1000, 10, 100, 1)?;

    let mut train = endless_feed("train");
    let mut test = endless_feed("test");
    let outcome = TrainingLoop::new(&mut model, &schedule, &store, &mut summaries, config, 7)
        .with_stop_flag(Arc::new(AtomicBool::new(true)))
        .run(&mut train, &mut test)?;

    assert_eq!(outcome.reason, StopReason::Interrupted);
    assert_eq!(outcome.final_step, 7);
    assert!(model.configs.is_empty());
    Ok(())
}

#[test]
fn test_model_failure_propagates_and_feeds_release() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = CheckpointStore::new(dir.path(), "Mock", 0);
    let mut summaries = SummaryWriter::create(dir.path())?;
    let schedule = single_phase_table(1000);
    let mut model = MockModel::new();
    model.fail_on_step = Some(15);
    let config = LoopConfig::new(100, 5, 10, 1)?;

    let mut train = endless_feed("train");
    let mut test = endless_feed("test");
    let result = TrainingLoop::new(&mut model, &schedule, &store, &mut summaries, config, 0)
        .run(&mut train, &mut test);

    let err = result.expect_err("step 15 must fail");
    assert!(err.to_string().contains("device lost"));
    // the failed step is neither retried nor persisted
    assert_eq!(model.steps_trained, 15);
    assert!(dir.path().join("Mock-10.safetensors").exists());
    assert!(!dir.path().join("Mock-15.safetensors").exists());

    train.stop();
    test.stop();
    Ok(())
}

#[test]
fn test_resume_continues_from_checkpoint_step() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = CheckpointStore::new(dir.path(), "Mock", 0);
    let schedule = single_phase_table(1000);

    {
        let mut summaries = SummaryWriter::create(dir.path())?;
        let mut model = MockModel::new();
        let mut train = endless_feed("train");
        let mut test = endless_feed("test");
        TrainingLoop::new(&mut model, &schedule, &store, &mut summaries, LoopConfig::new(30, 5, 10, 1)?, 0)
            .run(&mut train, &mut test)?;
    }

    let mut model = MockModel::new();
    let point = resume(&store, &mut model, None)?;
    assert_eq!(point.start_step, 30);
    assert_eq!(model.steps_trained, 30);

    let mut summaries = SummaryWriter::create(dir.path())?;
    let mut train = endless_feed("train");
    let mut test = endless_feed("test");
    let outcome = TrainingLoop::new(&mut model, &schedule, &store, &mut summaries, LoopConfig::new(31, 5, 10, 1)?, point.start_step)
        .run(&mut train, &mut test)?;

    assert_eq!(outcome.final_step, 31);
    assert_eq!(model.configs.len(), 1);
    Ok(())
}

#[test]
fn test_resumed_schedule_matches_uninterrupted_run() -> anyhow::Result<()> {
    let schedule = stepped_table(4, 10);

    let uninterrupted = {
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path(), "Mock", 0);
        let mut summaries = SummaryWriter::create(dir.path())?;
        let mut model = MockModel::new();
        let mut train = endless_feed("train");
        let mut test = endless_feed("test");
        TrainingLoop::new(&mut model, &schedule, &store, &mut summaries, LoopConfig::new(60, 5, 15, 1)?, 0)
            .run(&mut train, &mut test)?;
        model.learning_rates()
    };

    let dir = tempfile::tempdir()?;
    let store = CheckpointStore::new(dir.path(), "Mock", 0);
    let mut first = MockModel::new();
    {
        let mut summaries = SummaryWriter::create(dir.path())?;
        let mut train = endless_feed("train");
        let mut test = endless_feed("test");
        // crash between checkpoints: steps 31..33 are lost
        TrainingLoop::new(&mut first, &schedule, &store, &mut summaries, LoopConfig::new(33, 5, 15, 1)?, 0)
            .run(&mut train, &mut test)?;
    }

    let mut second = MockModel::new();
    let point = resume(&store, &mut second, None)?;
    assert_eq!(point.start_step, 30);
    let mut summaries = SummaryWriter::create(dir.path())?;
    let mut train = endless_feed("train");
    let mut test = endless_feed("test");
    TrainingLoop::new(&mut second, &schedule, &store, &mut summaries, LoopConfig::new(60, 5, 15, 1)?, point.start_step)
        .run(&mut train, &mut test)?;

    let mut replayed = first.learning_rates()[..30].to_vec();
    replayed.extend(second.learning_rates());
    assert_eq!(replayed, uninterrupted);
    assert_eq!(uninterrupted[0], 1.0);
    assert_eq!(uninterrupted[35], 0.25);
    // clamped at the last phase
    assert_eq!(uninterrupted[59], 0.25);
    Ok(())
}

#[test]
fn test_already_at_budget_finishes_immediately() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = CheckpointStore::new(dir.path(), "Mock", 0);
    let mut summaries = SummaryWriter::create(dir.path())?;
    let schedule = single_phase_table(1000);
    let mut model = MockModel::new();

    let mut train = endless_feed("train");
    let mut test = endless_feed("test");
    let outcome = TrainingLoop::new(&mut model, &schedule, &store, &mut summaries, LoopConfig::new(100, 10, 50, 1)?, 100)
        .run(&mut train, &mut test)?;

    assert_eq!(outcome.reason, StopReason::BudgetReached);
    assert_eq!(outcome.final_step, 100);
    assert!(model.configs.is_empty());
    Ok(())
}

#[test]
fn test_pass_reads_only_the_test_feed() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = CheckpointStore::new(dir.path(), "Mock", 0);
    let mut summaries = SummaryWriter::create(dir.path())?;
    let schedule = single_phase_table(1000);
    let mut model = MockModel::new();
    let config = LoopConfig::new(20, 5, 5, 3)?;

    let mut train = BatchFeed::spawn("train", dataset(8), FeedOptions::new(2).with_shuffle(false))?;
    let mut test = BatchFeed::spawn("test", dataset_from(100, 8), FeedOptions::new(2))?;
    TrainingLoop::new(&mut model, &schedule, &store, &mut summaries, config, 0)
        .run(&mut train, &mut test)?;

    // four passes of three batches
    assert_eq!(model.tested_targets.len(), 4 * 3 * 2);
    assert!(model.tested_targets.iter().all(|&t| t >= 100.0));
    // the training feed continues where it left off across every test pass
    let expected: Vec<f32> = (0..40).map(|i| (i % 8) as f32).collect();
    assert_eq!(model.trained_targets, expected);
    Ok(())
}

#[test]
fn test_training_feed_failure_is_an_error() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = CheckpointStore::new(dir.path(), "Mock", 0);
    let mut summaries = SummaryWriter::create(dir.path())?;
    let schedule = single_phase_table(1000);
    let mut model = MockModel::new();
    let config = LoopConfig::new(100, 10, 10, 1)?;

    let source = dataset(8);
    let (tx, rx) = sync_channel(8);
    for start in [0, 2, 4] {
        tx.send(FeedItem::Batch(source.gather(&[start, start + 1])?))?;
    }
    // producer dies without marking the end of input
    drop(tx);

    let mut train = BatchFeed::from_receiver("train", rx);
    let mut test = endless_feed("test");
    let err = TrainingLoop::new(&mut model, &schedule, &store, &mut summaries, config, 0)
        .run(&mut train, &mut test)
        .expect_err("a dead producer is not exhaustion");
    assert!(err.to_string().contains("Training input failed at step 3"));
    assert_eq!(model.steps_trained, 3);
    Ok(())
}

#[test]
fn test_test_feed_failure_is_an_error() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = CheckpointStore::new(dir.path(), "Mock", 0);
    let mut summaries = SummaryWriter::create(dir.path())?;
    let schedule = single_phase_table(1000);
    let mut model = MockModel::new();
    let config = LoopConfig::new(100, 10, 2, 1)?;

    let (tx, rx) = sync_channel(1);
    tx.send(FeedItem::Failed("corrupt test list".to_string()))?;

    let mut train = endless_feed("train");
    let mut test = BatchFeed::from_receiver("test", rx);
    let err = TrainingLoop::new(&mut model, &schedule, &store, &mut summaries, config, 0)
        .run(&mut train, &mut test)
        .expect_err("test input failure must surface");
    assert!(err.to_string().contains("corrupt test list"));
    // the save of step 2 comes after its test pass
    assert!(!dir.path().join("Mock-2.safetensors").exists());
    Ok(())
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LogBuffer {
    /// Steps named by "iter: N, switching weights" records.
    fn schedule_notices(&self) -> Vec<u64> {
        let text = String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned();
        text.lines()
            .filter(|line| line.contains("switching weights"))
            .filter_map(|line| line.split("iter: ").nth(1)?.split(',').next()?.parse().ok())
            .collect()
    }
}

fn notices_for_run(start_step: u64, max_steps: u64) -> anyhow::Result<Vec<u64>> {
    let dir = tempfile::tempdir()?;
    let store = CheckpointStore::new(dir.path(), "Mock", 0);
    let mut summaries = SummaryWriter::create(dir.path())?;
    let schedule = single_phase_table(1000);
    let mut model = MockModel::new();
    let config = LoopConfig::new(max_steps, 100, 1000, 1)?;
    let mut train = endless_feed("train");
    let mut test = endless_feed("test");

    let logs = LogBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .finish();
    tracing::subscriber::with_default(subscriber, || {
        TrainingLoop::new(&mut model, &schedule, &store, &mut summaries, config, start_step)
            .run(&mut train, &mut test)
    })?;
    Ok(logs.schedule_notices())
}

#[test]
fn test_schedule_notices_follow_the_step_counter() -> anyhow::Result<()> {
    assert_eq!(notices_for_run(0, 2500)?, vec![0, 1000, 2000]);
    // a resumed run announces only the windows it enters
    assert_eq!(notices_for_run(1500, 2500)?, vec![2000]);
    assert_eq!(notices_for_run(1000, 1200)?, vec![1000]);
    Ok(())
}
