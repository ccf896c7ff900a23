//! Training loop and its reporting, evaluation and checkpoint cadence.

use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::checkpoint::{self, CheckpointStore};
use crate::config::TrainConfig;
use crate::context::ExecutionContext;
use crate::data::BatchSource;
use crate::error::LeelazResult;
use crate::export::WeightExporter;
use crate::loss::{accuracy, policy_loss, value_loss};
use crate::model::LeelazNet;
use crate::optimizer::NesterovSgd;
use crate::stats::{EvaluationReport, LossAverages, ProgressReport, ThroughputMeter};

/// What one call to [`TrainingLoop::process`] did.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Step counter after the update
    pub step: u64,
    /// Raw policy loss of the batch
    pub policy_loss: f32,
    /// Raw value loss of the batch (not scaled)
    pub value_loss: f32,
    /// Present on reporting steps
    pub report: Option<ProgressReport>,
    /// Present on evaluation steps
    pub evaluation: Option<EvaluationReport>,
    /// Checkpoint written on evaluation steps
    pub checkpoint: Option<PathBuf>,
    /// Weights file written on evaluation steps
    pub weights: Option<PathBuf>,
}

/// Summary of [`TrainingLoop::run`].
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Steps taken by this call
    pub steps: u64,
    /// Last progress report, if any step reported
    pub last_report: Option<ProgressReport>,
    /// Every evaluation performed, in order
    pub evaluations: Vec<EvaluationReport>,
}

/// Drives optimization over a batch stream.
///
/// # Example
///
/// ```no_run
/// use leelaz_train_rs::{ExecutionContext, SyntheticBatchSource, TrainConfig, TrainingLoop};
///
/// # fn main() -> leelaz_train_rs::LeelazResult<()> {
/// let config = TrainConfig::default();
/// let ctx = ExecutionContext::acquire(&config.device)?;
/// let batch_size = config.training.batch_size;
/// let source = SyntheticBatchSource::new(&config.network, batch_size, config.seed);
/// let mut trainer = TrainingLoop::new(config, &ctx, source)?;
/// trainer.run(10_000)?;
/// # Ok(())
/// # }
/// ```
pub struct TrainingLoop<'a, S: BatchSource> {
    ctx: &'a ExecutionContext,
    config: TrainConfig,
    net: LeelazNet,
    optimizer: NesterovSgd,
    source: S,
    store: CheckpointStore,
    step: u64,
    averages: LossAverages,
    throughput: ThroughputMeter,
}

impl<'a, S: BatchSource> TrainingLoop<'a, S> {
    /// Build the network and optimizer for `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the network
    /// cannot be constructed.
    pub fn new(config: TrainConfig, ctx: &'a ExecutionContext, source: S) -> LeelazResult<Self> {
        config.validate()?;

        let net = LeelazNet::new(&config.network, ctx, config.seed)?;
        let optimizer = NesterovSgd::from_settings(net.trainable_vars(), &config.optimizer)?;
        let store = CheckpointStore::new(&config.output_dir, config.model_prefix.clone());

        tracing::info!(
            "Trainer ready: lr={}, momentum={}, nesterov={}, l2={}",
            config.optimizer.learning_rate,
            config.optimizer.momentum,
            config.optimizer.nesterov,
            config.optimizer.l2_scale
        );

        Ok(Self {
            ctx,
            config,
            net,
            optimizer,
            source,
            store,
            step: 0,
            averages: LossAverages::default(),
            throughput: ThroughputMeter::new(),
        })
    }

    /// Load parameters, statistics and the step counter from a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns a checkpoint error if the checkpoint is missing, corrupt or
    /// belongs to a different topology.
    pub fn restore(&mut self, path: &Path) -> LeelazResult<()> {
        self.step = checkpoint::restore(path, &self.net)?;
        tracing::info!("Resuming at step {}", self.step);
        Ok(())
    }

    /// Take one optimization step on the next batch, then run whatever
    /// reporting, evaluation, checkpointing and export the new step is due for.
    ///
    /// # Errors
    ///
    /// Returns an error if the producer, the forward/backward pass, the
    /// checkpoint or the export fails.
    pub fn process(&mut self) -> LeelazResult<StepOutcome> {
        let batch = self.source.next_batch(self.ctx)?;
        let output = self.net.forward_t(batch.planes(), true)?;

        let policy = policy_loss(&output.policy_logits, batch.policy())?;
        let value = value_loss(&output.value, batch.value())?;
        let mut total = (&policy + &value)?;
        if self.config.optimizer.l2_scale > 0.0 {
            total = (total + (self.net.l2_term()? * self.config.optimizer.l2_scale)?)?;
        }

        // Running statistics land before the parameter update.
        for update in output.statistics {
            update.apply()?;
        }
        self.optimizer.minimize(&total)?;
        self.step += 1;

        let policy_loss = policy.to_scalar::<f32>()?;
        let value_loss = value.to_scalar::<f32>()?;
        self.averages.update(policy_loss, value_loss);
        self.throughput.record(batch.len());

        let report_every = self.config.training.report_every;
        let evaluate_every = self.config.training.evaluate_every;
        let report = if self.step % report_every == 0 {
            Some(self.report())
        } else {
            None
        };

        let (evaluation, checkpoint, weights) = if self.step % evaluate_every == 0 {
            let evaluation = self.evaluate()?;
            let checkpoint = self.store.save(&self.net, self.step)?;
            let weights = self.store.weights_path(self.step);
            self.export_weights(&weights)?;
            (Some(evaluation), Some(checkpoint), Some(weights))
        } else {
            (None, None, None)
        };

        Ok(StepOutcome {
            step: self.step,
            policy_loss,
            value_loss,
            report,
            evaluation,
            checkpoint,
            weights,
        })
    }

    fn report(&mut self) -> ProgressReport {
        let report = ProgressReport {
            step: self.step,
            policy_loss: self.averages.policy.value().unwrap_or_default(),
            value_loss: self.averages.value.value().unwrap_or_default(),
            positions_per_second: self.throughput.report(Instant::now()),
        };
        tracing::info!(
            "step {}, policy loss={} mse={} ({:.0} pos/s)",
            report.step,
            report.policy_loss,
            report.value_loss,
            report.positions_per_second
        );
        report
    }

    /// Average accuracy and scaled value loss over `eval_batches` batches
    /// drawn from the training stream, using the running statistics and
    /// without touching any parameter.
    pub fn evaluate(&mut self) -> LeelazResult<EvaluationReport> {
        let batches = self.config.training.eval_batches;
        let mut sum_accuracy = 0.0f32;
        let mut sum_mse = 0.0f32;
        for _ in 0..batches {
            let batch = self.source.next_batch(self.ctx)?;
            let output = self.net.forward_t(batch.planes(), false)?;
            sum_accuracy += accuracy(&output.policy_logits, batch.policy())?;
            sum_mse += value_loss(&output.value, batch.value())?.to_scalar::<f32>()?;
        }
        let n = batches as f32;
        let report = EvaluationReport {
            step: self.step,
            accuracy: sum_accuracy / n,
            value_loss: sum_mse / (4.0 * n),
        };
        tracing::info!(
            "step {}, training accuracy={}%, mse={}",
            report.step,
            report.accuracy * 100.0,
            report.value_loss
        );
        Ok(report)
    }

    /// Take `steps` steps.
    pub fn run(&mut self, steps: u64) -> LeelazResult<RunSummary> {
        let mut summary = RunSummary::default();
        for _ in 0..steps {
            let outcome = self.process()?;
            summary.steps += 1;
            if outcome.report.is_some() {
                summary.last_report = outcome.report;
            }
            summary.evaluations.extend(outcome.evaluation);
        }
        Ok(summary)
    }

    /// Write the current weights file to `path`.
    pub fn export_weights(&self, path: &Path) -> LeelazResult<()> {
        WeightExporter::new(self.net.registry(), &self.net).save(path)
    }

    /// Completed optimization steps
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn net(&self) -> &LeelazNet {
        &self.net
    }

    pub fn averages(&self) -> &LossAverages {
        &self.averages
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::data::SyntheticBatchSource;
    use crate::stats::RunningAverage;

    fn small_config(dir: &Path) -> TrainConfig {
        let mut config = TrainConfig::default();
        config.network = NetworkConfig::test();
        config.training.batch_size = 4;
        config.training.report_every = 2;
        config.training.evaluate_every = 3;
        config.training.eval_batches = 2;
        config.output_dir = dir.to_string_lossy().into_owned();
        config.model_prefix = "net".into();
        config
    }

    fn trainer<'a>(
        config: TrainConfig,
        ctx: &'a ExecutionContext,
    ) -> TrainingLoop<'a, SyntheticBatchSource> {
        let source = SyntheticBatchSource::new(&config.network, config.training.batch_size, 3);
        TrainingLoop::new(config, ctx, source).unwrap()
    }

    #[test]
    fn test_step_counter_advances_by_one() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ExecutionContext::cpu();
        let mut t = trainer(small_config(dir.path()), &ctx);

        assert_eq!(t.step(), 0);
        let outcome = t.process().unwrap();
        assert_eq!(outcome.step, 1);
        assert_eq!(t.step(), 1);
        assert!(outcome.report.is_none());
        assert!(outcome.evaluation.is_none());
    }

    #[test]
    fn test_first_step_initializes_averages() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ExecutionContext::cpu();
        let mut t = trainer(small_config(dir.path()), &ctx);

        let outcome = t.process().unwrap();
        assert_eq!(
            t.averages().policy,
            RunningAverage::Value(outcome.policy_loss)
        );
        assert_eq!(
            t.averages().value,
            RunningAverage::Value(outcome.value_loss / 4.0)
        );
    }

    #[test]
    fn test_step_updates_statistics_and_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ExecutionContext::cpu();
        let mut t = trainer(small_config(dir.path()), &ctx);

        let snapshot = |net: &LeelazNet| -> Vec<Vec<f32>> {
            net.named_params()
                .unwrap()
                .into_iter()
                .chain(net.named_buffers().unwrap())
                .map(|(_, v)| v.as_tensor().flatten_all().unwrap().to_vec1().unwrap())
                .collect()
        };
        let before = snapshot(t.net());
        t.process().unwrap();
        let after = snapshot(t.net());

        let changed = before.iter().zip(&after).filter(|(a, b)| a != b).count();
        // every trainable tensor and every running statistic moves
        assert!(changed >= t.net().trainable_vars().len());
    }

    #[test]
    fn test_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ExecutionContext::cpu();
        let mut t = trainer(small_config(dir.path()), &ctx);

        let first = t.process().unwrap();
        assert!(first.report.is_none());

        let second = t.process().unwrap();
        let report = second.report.unwrap();
        assert_eq!(report.step, 2);
        assert_eq!(report.positions_per_second, 0.0);

        let third = t.process().unwrap();
        let evaluation = third.evaluation.unwrap();
        assert_eq!(evaluation.step, 3);
        assert!((0.0..=1.0).contains(&evaluation.accuracy));
        assert!((0.0..=1.0).contains(&evaluation.value_loss));

        assert!(dir.path().join("net-3.safetensors").exists());
        assert!(dir.path().join("net-3.json").exists());
        assert_eq!(third.weights, Some(dir.path().join("net-3.txt")));
        let text = std::fs::read_to_string(dir.path().join("net-3.txt")).unwrap();
        assert_eq!(text.lines().count(), NetworkConfig::test().registry_len() + 1);

        let fourth = t.process().unwrap();
        assert!(fourth.report.unwrap().positions_per_second > 0.0);
    }

    #[test]
    fn test_evaluate_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ExecutionContext::cpu();
        let mut t = trainer(small_config(dir.path()), &ctx);
        t.process().unwrap();

        let before: Vec<f32> = t.net().named_buffers().unwrap()[0]
            .1
            .as_tensor()
            .to_vec1()
            .unwrap();
        t.evaluate().unwrap();
        let after: Vec<f32> = t.net().named_buffers().unwrap()[0]
            .1
            .as_tensor()
            .to_vec1()
            .unwrap();
        assert_eq!(before, after);
        assert_eq!(t.step(), 1);
    }

    #[test]
    fn test_run_collects_evaluations() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ExecutionContext::cpu();
        let mut t = trainer(small_config(dir.path()), &ctx);

        let summary = t.run(6).unwrap();
        assert_eq!(summary.steps, 6);
        assert_eq!(summary.evaluations.len(), 2);
        assert_eq!(summary.last_report.unwrap().step, 6);
    }
}
