//! Training orchestration

use candle_core::Var;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use pairtune_core::{CausalLm, Result, TextTokenizer, TuneError};
use pairtune_optimizer::{clip_grad_norm, NamedGrads};

use crate::checkpoint::CheckpointSink;
use crate::collate::Batch;
use crate::dataset::TrainingPair;
use crate::feeder::BatchFeeder;
use crate::progress::{ProgressEvent, ProgressSink, StepMetrics};
use crate::settings::TrainSettings;
use crate::state::TrainingState;

/// Outcome of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub total_steps: usize,
    pub epochs: usize,
    pub checkpoints: usize,
    /// Steps whose update was dropped by the loss scaler.
    pub skipped_updates: usize,
    pub last_loss: Option<f64>,
}

pub struct Trainer<'a> {
    settings: &'a TrainSettings,
    workers: usize,
    seed: u64,
}

/// Optimizer steps for a run: `epochs * ceil(n_train / batch_size)`.
pub fn total_steps(settings: &TrainSettings, n_train: usize) -> usize {
    settings.epochs * n_train.div_ceil(settings.batch_size)
}

impl<'a> Trainer<'a> {
    pub fn new(settings: &'a TrainSettings, workers: usize, seed: u64) -> Self {
        Self { settings, workers, seed }
    }

    /// Run every epoch, checkpoint along the way and once more at the end.
    #[allow(clippy::too_many_arguments)]
    pub fn train(
        &self,
        model: &dyn CausalLm,
        tokenizer: &dyn TextTokenizer,
        train: &[TrainingPair],
        held_out: &[TrainingPair],
        state: &mut TrainingState,
        checkpoints: &mut dyn CheckpointSink,
        progress: &mut dyn ProgressSink,
    ) -> Result<RunSummary> {
        let feeder = BatchFeeder::new(train, tokenizer, self.settings.max_seq_len, self.settings.batch_size, self.workers);
        let steps_per_epoch = feeder.batches_per_epoch();
        let total = total_steps(self.settings, train.len());
        let params = named_vars(model)?;

        tracing::info!(
            "training on {} pairs: {} epochs x {} steps, {} parameter tensors",
            train.len(),
            self.settings.epochs,
            steps_per_epoch,
            params.len()
        );

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut order: Vec<usize> = (0..train.len()).collect();
        let mut summary = RunSummary {
            total_steps: total,
            epochs: self.settings.epochs,
            checkpoints: 0,
            skipped_updates: 0,
            last_loss: None,
        };

        for epoch in 0..self.settings.epochs {
            state.epoch = epoch;
            if self.settings.shuffle {
                order.shuffle(&mut rng);
            }
            tracing::debug!("epoch {}/{}", epoch + 1, self.settings.epochs);

            feeder.run_epoch(&order, |batch| {
                let outcome = self.train_step(model, &params, &batch, state)?;
                summary.last_loss = Some(outcome.loss);
                if outcome.skipped {
                    summary.skipped_updates += 1;
                }
                let step = state.global_step;
                progress.on_step(step, total);

                if step % self.settings.log_every == 0 {
                    progress.emit(ProgressEvent::Metrics(StepMetrics {
                        loss: outcome.loss,
                        grad_norm: outcome.grad_norm,
                        learning_rate: outcome.learning_rate,
                        epoch: step as f64 / steps_per_epoch.max(1) as f64,
                        step,
                    }));
                }

                if step % self.settings.save_every == 0 {
                    checkpoints.save(model, tokenizer, state)?;
                    summary.checkpoints += 1;
                    progress.emit(ProgressEvent::message("Checkpoint saved"));
                }

                if let Some(every) = self.settings.val_every {
                    if step % every == 0 && !held_out.is_empty() {
                        self.report_held_out_loss(model, tokenizer, held_out, step, progress)?;
                    }
                }
                Ok(())
            })?;
        }

        progress.emit(ProgressEvent::message(format!(
            "Saving model to {}",
            checkpoints.location().display()
        )));
        checkpoints.save(model, tokenizer, state)?;
        summary.checkpoints += 1;

        Ok(summary)
    }

    /// scale → backward → unscale → clip → step → update scale → schedule.
    fn train_step(
        &self,
        model: &dyn CausalLm,
        params: &[(String, Var)],
        batch: &Batch,
        state: &mut TrainingState,
    ) -> Result<StepOutcome> {
        let (input_ids, loss_mask) = batch.to_tensors(model.device())?;

        let loss = model.loss(&input_ids, &loss_mask)?;
        let loss_value = loss.to_scalar::<f32>()? as f64;

        let backward_loss = match &state.scaler {
            Some(scaler) => scaler.scale_loss(&loss)?,
            None => loss,
        };
        let grad_store = backward_loss.backward()?;

        let mut grads = NamedGrads::new();
        for (name, var) in params {
            if let Some(grad) = grad_store.get(var.as_tensor()) {
                grads.insert(name.clone(), grad.clone());
            }
        }
        drop(grad_store);

        let found_inf = match &state.scaler {
            Some(scaler) => scaler.unscale(&mut grads)?,
            None => false,
        };
        let grad_norm = clip_grad_norm(&mut grads, self.settings.grad_clip)?;

        if !found_inf {
            state.optimizer.step(params, &grads)?;
        }
        if let Some(scaler) = state.scaler.as_mut() {
            scaler.update(found_inf);
        }

        let learning_rate = state.schedule.step();
        state.optimizer.set_lr(learning_rate);
        state.global_step += 1;

        Ok(StepOutcome {
            loss: loss_value,
            grad_norm,
            learning_rate,
            skipped: found_inf,
        })
    }

    /// Mean masked loss over the held-out pairs, no gradients kept.
    pub fn held_out_loss(&self, model: &dyn CausalLm, tokenizer: &dyn TextTokenizer, held_out: &[TrainingPair]) -> Result<Option<f64>> {
        let feeder = BatchFeeder::new(held_out, tokenizer, self.settings.max_seq_len, self.settings.batch_size, 0);
        let order: Vec<usize> = (0..held_out.len()).collect();

        let mut weighted = 0.0;
        let mut targets = 0usize;
        feeder.run_epoch(&order, |batch| {
            let count = batch.target_count();
            if count > 0 {
                let (input_ids, loss_mask) = batch.to_tensors(model.device())?;
                let loss = model.loss(&input_ids, &loss_mask)?.to_scalar::<f32>()? as f64;
                weighted += loss * count as f64;
                targets += count;
            }
            Ok(())
        })?;

        Ok((targets > 0).then(|| weighted / targets as f64))
    }

    fn report_held_out_loss(
        &self,
        model: &dyn CausalLm,
        tokenizer: &dyn TextTokenizer,
        held_out: &[TrainingPair],
        step: usize,
        progress: &mut dyn ProgressSink,
    ) -> Result<()> {
        match self.held_out_loss(model, tokenizer, held_out)? {
            Some(val_loss) => progress.emit(ProgressEvent::ValLoss { val_loss, step }),
            None => tracing::warn!("held-out set has no supervised tokens at max_seq_len {}", self.settings.max_seq_len),
        }
        Ok(())
    }
}

struct StepOutcome {
    loss: f64,
    grad_norm: f64,
    learning_rate: f64,
    skipped: bool,
}

/// Trainable variables sorted by name.
fn named_vars(model: &dyn CausalLm) -> Result<Vec<(String, Var)>> {
    let data = model
        .varmap()
        .data()
        .lock()
        .map_err(|_| TuneError::Compute(candle_core::Error::Msg("parameter map lock poisoned".into())))?;
    let mut vars: Vec<(String, Var)> = data.iter().map(|(name, var)| (name.clone(), var.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}
