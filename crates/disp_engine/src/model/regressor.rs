//! DispRegressor - multi-scale regressor with optional 1-D correlation feature
//!
//! Shared encoder followed by one linear head per output scale. Each head is
//! supervised with the same target; the schedule decides how much each scale
//! contributes to the loss.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Linear, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use tracing::{debug, info, warn};

use super::config::{DispConfig, NUM_SCALES};
use crate::batch::Batch;
use crate::device_utils::select_device;
use crate::optim::AdamW;
use crate::preinit;
use crate::trainable::{StepConfig, StepOutput, Summary, TrainableModel};

pub struct DispRegressor {
    pub config: DispConfig,
    pub device: Device,
    varmap: VarMap,
    encoder: Linear,
    heads: Vec<Linear>,
    optimizer: Option<AdamW>,
    // optimizer state read by `restore` before `init` created the optimizer
    pending_state: Option<HashMap<String, Tensor>>,
}

impl DispRegressor {
    pub fn new(config: DispConfig) -> Result<Self> {
        config.validate()?;
        let device = select_device(config.corr_type);

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = candle_nn::linear(
            config.encoder_input_dim(),
            config.hidden_dim,
            vb.pp("encoder"),
        )?;
        let heads = (0..NUM_SCALES)
            .map(|i| candle_nn::linear(config.hidden_dim, 1, vb.pp(format!("scale{i}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(Self {
            config,
            device,
            varmap,
            encoder,
            heads,
            optimizer: None,
            pending_state: None,
        })
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn num_parameters(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Per-scale predictions, each of shape (rows, 1), finest first.
    pub fn forward(&self, features: &Tensor) -> Result<Vec<Tensor>> {
        let input = if self.config.corr_type.is_corr() {
            self.correlate(features)?
        } else {
            features.clone()
        };
        let hidden = self.encoder.forward(&input)?.relu()?;
        let preds = self
            .heads
            .iter()
            .map(|head| head.forward(&hidden))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(preds)
    }

    // Appends left * right (elementwise over the two input halves).
    fn correlate(&self, features: &Tensor) -> Result<Tensor> {
        let half = self.config.input_dim / 2;
        let left = features.narrow(1, 0, half)?;
        let right = features.narrow(1, half, half)?;
        let corr = left.mul(&right)?;
        Ok(Tensor::cat(&[features, &corr], 1)?)
    }

    fn masked_l1(pred: &Tensor, target: &Tensor, mask: &Tensor, count: f64) -> Result<Tensor> {
        let l1 = pred.sub(target)?.abs()?.mul(mask)?.sum_all()?;
        Ok(l1.affine(1.0 / count, 0.0)?)
    }

    fn mask_for(&self, batch: &Batch) -> Result<(Tensor, f64)> {
        let mask = batch.confidence_mask(self.config.confidence_th);
        let count = mask.iter().filter(|&&m| m > 0.0).count().max(1) as f64;
        let mask = Tensor::from_vec(mask, (batch.rows, 1), &self.device)?;
        Ok((mask, count))
    }

    fn weight_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("VarMap lock poisoned"))?;
        Ok(data
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect())
    }

    fn load_weights(&self, tensors: &HashMap<String, Tensor>, path: &Path) -> Result<()> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("VarMap lock poisoned"))?;
        for (name, var) in data.iter() {
            let value = tensors
                .get(name)
                .ok_or_else(|| anyhow::anyhow!("'{}' missing from {}", name, path.display()))?;
            var.set(&value.to_dtype(var.dtype())?.to_device(var.device())?)
                .with_context(|| format!("error setting {} using data from {}", name, path.display()))?;
        }
        Ok(())
    }

    fn load_optimizer_state(optimizer: &mut AdamW, tensors: &HashMap<String, Tensor>, path: &Path) -> Result<()> {
        if optimizer.load_state(tensors)? {
            debug!("Optimizer state restored at step {}", optimizer.step_count());
        } else {
            warn!("⚠️ No optimizer state in {}. Moments start from zero.", path.display());
        }
        Ok(())
    }

    fn check_batch(&self, batch: &Batch) -> Result<()> {
        anyhow::ensure!(
            batch.dim == self.config.input_dim,
            "Batch dim {} does not match model input dim {}",
            batch.dim,
            self.config.input_dim
        );
        Ok(())
    }
}

impl TrainableModel for DispRegressor {
    fn init(&mut self) -> Result<()> {
        let params = ParamsAdamW {
            lr: 1e-4,
            weight_decay: 0.0,
            ..Default::default()
        };
        let mut optimizer = AdamW::from_varmap(&self.varmap, params)?;
        if let Some(state) = self.pending_state.take() {
            optimizer
                .load_state(&state)
                .context("Failed to apply restored optimizer state")?;
        }
        self.optimizer = Some(optimizer);
        info!(
            "{} initialized: {} parameters on {:?}",
            self.config.model_name(),
            self.num_parameters(),
            self.device
        );
        Ok(())
    }

    fn train_step(&mut self, batch: &Batch, config: &StepConfig) -> Result<StepOutput> {
        self.check_batch(batch)?;
        anyhow::ensure!(
            config.loss_weights.len() == NUM_SCALES,
            "Expected {} loss weights, got {}",
            NUM_SCALES,
            config.loss_weights.len()
        );

        let features = batch.features_tensor(&self.device)?;
        let target = batch.targets_tensor(&self.device)?;
        let (mask, count) = self.mask_for(batch)?;
        let preds = self.forward(&features)?;

        let mut loss = Tensor::zeros((), DType::F32, &self.device)?;
        for (pred, &w) in preds.iter().zip(&config.loss_weights) {
            if w == 0.0 {
                continue;
            }
            let term = Self::masked_l1(pred, &target, &mask, count)?;
            loss = loss.add(&term.affine(w as f64, 0.0)?)?;
        }
        if self.config.smoothness_lambda > 0.0 {
            for pair in preds.windows(2) {
                let diff = pair[0].sub(&pair[1])?.abs()?.mean_all()?;
                loss = loss.add(&diff.affine(self.config.smoothness_lambda as f64, 0.0)?)?;
            }
        }

        let train_error = Self::masked_l1(&preds[0], &target, &mask, count)?.to_scalar::<f32>()?;
        let loss_value = loss.to_scalar::<f32>()?;

        let optimizer = self
            .optimizer
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("train_step called before init"))?;
        optimizer.set_learning_rate(config.learning_rate);
        optimizer.backward_step(&loss)?;

        Ok(StepOutput {
            loss: loss_value,
            train_error,
        })
    }

    fn test_error(&mut self, batch: &Batch) -> Result<f32> {
        self.check_batch(batch)?;
        let features = batch.features_tensor(&self.device)?;
        let target = batch.targets_tensor(&self.device)?;
        let (mask, count) = self.mask_for(batch)?;
        let preds = self.forward(&features)?;
        let err = Self::masked_l1(&preds[0], &target, &mask, count)?;
        Ok(err.to_scalar::<f32>()?)
    }

    fn summary(&self, config: &StepConfig, mean_loss: f32) -> Result<Summary> {
        let mut summary = Summary::default();
        summary.insert("loss", mean_loss as f64);
        summary.insert("learning_rate", config.learning_rate);
        summary.insert("test_error", config.last_test_error as f64);
        for (i, w) in config.loss_weights.iter().enumerate() {
            summary.insert(format!("loss_weights/scale{i}"), *w as f64);
        }
        let sq_norm = self
            .varmap
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().sqr()?.sum_all()?.to_scalar::<f32>())
            .sum::<candle_core::Result<f32>>()?;
        summary.insert("param_norm", (sq_norm as f64).sqrt());
        Ok(summary)
    }

    /// Weights and, once initialized, the optimizer moments and step counter
    /// go to one safetensors file.
    fn save(&self, path: &Path) -> Result<()> {
        let mut tensors = self.weight_tensors()?;
        if let Some(optimizer) = &self.optimizer {
            tensors.extend(optimizer.state_tensors()?);
        }
        candle_core::safetensors::save(&tensors, path)?;
        debug!("Saved {} to {}", self.config.model_name(), path.display());
        Ok(())
    }

    fn restore(&mut self, path: &Path) -> Result<()> {
        let tensors = candle_core::safetensors::load(path, &self.device)
            .with_context(|| format!("Failed to read checkpoint {}", path.display()))?;
        self.load_weights(&tensors, path)?;
        match self.optimizer.as_mut() {
            Some(optimizer) => Self::load_optimizer_state(optimizer, &tensors, path)?,
            None => self.pending_state = Some(tensors),
        }
        Ok(())
    }

    fn restore_matching(&mut self, path: &Path, prefix: &str) -> Result<usize> {
        preinit::restore_matching(&self.varmap, path, prefix)
    }
}
