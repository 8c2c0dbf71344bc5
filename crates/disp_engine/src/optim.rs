//! AdamW with checkpointable state
//!
//! Same update rule as `candle_nn::AdamW`. The moments and the step counter
//! are kept per variable name so they can be written next to the weights and
//! reloaded on resume.

use std::collections::HashMap;

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use candle_nn::{Optimizer, ParamsAdamW, VarMap};

/// Name prefix of optimizer tensors inside a checkpoint file.
pub const OPTIM_PREFIX: &str = "optim/";

const STEP_KEY: &str = "optim/step";

struct Slot {
    name: String,
    var: Var,
    first_moment: Var,
    second_moment: Var,
}

impl Slot {
    fn new(name: String, var: Var) -> candle_core::Result<Self> {
        let first_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
        let second_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
        Ok(Self {
            name,
            var,
            first_moment,
            second_moment,
        })
    }

    fn m_key(&self) -> String {
        format!("{OPTIM_PREFIX}m/{}", self.name)
    }

    fn v_key(&self) -> String {
        format!("{OPTIM_PREFIX}v/{}", self.name)
    }
}

pub struct AdamW {
    slots: Vec<Slot>,
    step_t: usize,
    params: ParamsAdamW,
}

impl AdamW {
    /// Optimizer over every float variable of `varmap`, keyed by variable name.
    pub fn from_varmap(varmap: &VarMap, params: ParamsAdamW) -> Result<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("VarMap lock poisoned"))?;
        let mut names: Vec<&String> = data.keys().collect();
        names.sort();

        let mut slots = Vec::with_capacity(names.len());
        for name in names {
            let var = &data[name];
            if var.dtype().is_float() {
                slots.push(Slot::new(name.clone(), var.clone())?);
            }
        }
        Ok(Self {
            slots,
            step_t: 0,
            params,
        })
    }

    pub fn step_count(&self) -> usize {
        self.step_t
    }

    /// Moments under `optim/m/<name>` and `optim/v/<name>`, step under `optim/step`.
    pub fn state_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let mut tensors = HashMap::with_capacity(self.slots.len() * 2 + 1);
        for slot in &self.slots {
            tensors.insert(slot.m_key(), slot.first_moment.as_tensor().clone());
            tensors.insert(slot.v_key(), slot.second_moment.as_tensor().clone());
        }
        tensors.insert(
            STEP_KEY.to_string(),
            Tensor::new(&[self.step_t as f64], &Device::Cpu)?,
        );
        Ok(tensors)
    }

    /// Loads state written by [`AdamW::state_tensors`]. Returns `false` when
    /// `tensors` carries no optimizer state at all; partial state is an error.
    pub fn load_state(&mut self, tensors: &HashMap<String, Tensor>) -> Result<bool> {
        let Some(step) = tensors.get(STEP_KEY) else {
            return Ok(false);
        };
        for slot in &self.slots {
            for (key, moment) in [
                (slot.m_key(), &slot.first_moment),
                (slot.v_key(), &slot.second_moment),
            ] {
                let value = tensors
                    .get(&key)
                    .ok_or_else(|| anyhow::anyhow!("Optimizer state is missing '{}'", key))?;
                let value = value.to_dtype(moment.dtype())?.to_device(moment.device())?;
                moment.set(&value)?;
            }
        }
        let step = step.to_dtype(candle_core::DType::F64)?.to_vec1::<f64>()?;
        self.step_t = step
            .first()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Optimizer step counter is empty"))? as usize;
        Ok(true)
    }
}

impl Optimizer for AdamW {
    type Config = ParamsAdamW;

    fn new(vars: Vec<Var>, params: ParamsAdamW) -> candle_core::Result<Self> {
        let slots = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .enumerate()
            .map(|(i, var)| Slot::new(format!("var{i}"), var))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            slots,
            step_t: 0,
            params,
        })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.step_t += 1;
        let lr = self.params.lr;
        let lr_lambda = lr * self.params.weight_decay;
        let beta1 = self.params.beta1;
        let beta2 = self.params.beta2;
        let scale_m = 1f64 / (1f64 - beta1.powi(self.step_t as i32));
        let scale_v = 1f64 / (1f64 - beta2.powi(self.step_t as i32));
        for slot in &self.slots {
            let theta = &slot.var;
            let m = &slot.first_moment;
            let v = &slot.second_moment;
            if let Some(g) = grads.get(theta) {
                let next_m = ((m.as_tensor() * beta1)? + (g * (1.0 - beta1))?)?;
                let next_v = ((v.as_tensor() * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
                let m_hat = (&next_m * scale_m)?;
                let v_hat = (&next_v * scale_v)?;
                let next_theta = (theta.as_tensor() * (1f64 - lr_lambda))?;
                let adjusted_grad = (m_hat / (v_hat.sqrt()? + self.params.eps)?)?;
                let next_theta = (next_theta - (adjusted_grad * lr)?)?;
                m.set(&next_m)?;
                v.set(&next_v)?;
                theta.set(&next_theta)?;
            }
        }
        Ok(())
    }
}
