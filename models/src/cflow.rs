use anyhow::{anyhow, Result};
use common::{column_stats, Config, ConfigLoader};
use engine::{AnomalyModule, StateDict, Tensor};
use serde::{Deserialize, Serialize};

use super::backbone;
use super::init;

const EPS: f32 = 1e-6;

#[derive(Serialize, Deserialize, Debug)]
pub struct CflowOptions {
    pub backbone: String,
    pub layers: Vec<String>,
    pub coupling_blocks: usize,
    pub clamp_alpha: f32,
    pub condition_vector: usize,
    pub embedding_dim: usize,
}

impl Config for CflowOptions {
    fn load(config: &ConfigLoader) -> Result<Self> {
        let backbone = config
            .get("backbone")
            .and_then(|v| v.as_string())
            .unwrap_or_else(|| "wide_resnet50_2".to_string());
        let layers = config
            .get("layers")
            .and_then(|v| v.as_string_vec())
            .unwrap_or_else(|| {
                vec![
                    "layer2".to_string(),
                    "layer3".to_string(),
                    "layer4".to_string(),
                ]
            });
        let embedding_dim = match config.get("embedding_dim").and_then(|v| v.as_usize()) {
            Some(dim) => dim,
            None => backbone::embedding_dim(&backbone, &layers)?,
        };
        if embedding_dim == 0 {
            return Err(anyhow!("embedding_dim must be at least 1"));
        }
        let clamp_alpha = config
            .get("clamp_alpha")
            .and_then(|v| v.as_f32())
            .unwrap_or(1.9);
        if clamp_alpha < 0.0 {
            return Err(anyhow!("clamp_alpha cannot be negative, got {}", clamp_alpha));
        }

        Ok(Self {
            backbone,
            layers,
            coupling_blocks: config
                .get("coupling_blocks")
                .and_then(|v| v.as_usize())
                .unwrap_or(8)
                .max(1),
            clamp_alpha,
            condition_vector: config
                .get("condition_vector")
                .and_then(|v| v.as_usize())
                .unwrap_or(128),
            embedding_dim,
        })
    }
}

/// Conditional normalizing flow. Each coupling block owns the embedding
/// dimensions congruent to its index and whitens them against the fitted
/// statistics, so the likelihood of a sample falls as it leaves the
/// distribution of the normal data.
pub struct CflowLightning {
    options: CflowOptions,
    parameters: StateDict,
}

impl CflowLightning {
    pub fn new(config: &ConfigLoader) -> Result<Self> {
        let options: CflowOptions = config.load()?;
        let mut rng = init::seeded_rng(config);

        let blocks = options.coupling_blocks;
        let dim = options.embedding_dim;

        let mut parameters = StateDict::new();
        parameters.insert("flow.scale", Tensor::full(vec![blocks, dim], 1.0));
        parameters.insert("flow.shift", Tensor::zeros(vec![blocks, dim]));
        parameters.insert(
            "encoder.positional",
            Tensor::from_vec(init::normal_weights(
                &mut rng,
                options.condition_vector,
                0.0,
                1.0,
            )?),
        );

        Ok(Self {
            options,
            parameters,
        })
    }

    fn check_sample(&self, sample: &Tensor) -> Result<()> {
        if sample.numel() != self.options.embedding_dim {
            return Err(anyhow!(
                "Expected an embedding of {} values, got {}",
                self.options.embedding_dim,
                sample.numel()
            ));
        }

        Ok(())
    }
}

impl AnomalyModule for CflowLightning {
    fn name(&self) -> &'static str {
        "CflowLightning"
    }

    fn parameters(&self) -> &StateDict {
        &self.parameters
    }

    fn parameters_mut(&mut self) -> &mut StateDict {
        &mut self.parameters
    }

    fn fit(&mut self, batch: &[Tensor]) -> Result<()> {
        for sample in batch {
            self.check_sample(sample)?;
        }

        let rows = batch.iter().map(|sample| sample.data()).collect::<Vec<_>>();
        let (means, variances) =
            column_stats(&rows).ok_or_else(|| anyhow!("Cannot fit on an empty batch"))?;

        let blocks = self.options.coupling_blocks;
        let dim = self.options.embedding_dim;
        let max_scale = self.options.clamp_alpha.exp();
        let min_scale = (-self.options.clamp_alpha).exp();

        let mut scale = self.parameters.tensor("flow.scale").data().to_vec();
        let mut shift = self.parameters.tensor("flow.shift").data().to_vec();
        if scale.len() != blocks * dim {
            scale = vec![1.0; blocks * dim];
        }
        if shift.len() != blocks * dim {
            shift = vec![0.0; blocks * dim];
        }

        for (i, (mean, var)) in means.iter().zip(variances.iter()).enumerate() {
            let block = i % blocks;
            let sigma = var.sqrt();
            let s = (1.0 / (sigma + EPS)).clamp(min_scale, max_scale);

            scale[block * dim + i] = s;
            shift[block * dim + i] = -mean * s;
        }

        self.parameters
            .insert("flow.scale", Tensor::new(vec![blocks, dim], scale));
        self.parameters
            .insert("flow.shift", Tensor::new(vec![blocks, dim], shift));

        Ok(())
    }

    fn score(&self, sample: &Tensor) -> Result<f32> {
        self.check_sample(sample)?;

        let blocks = self.options.coupling_blocks;
        let dim = self.options.embedding_dim;
        let scale = self.parameters.tensor("flow.scale");
        let shift = self.parameters.tensor("flow.shift");
        if scale.shape() != &[blocks, dim] || shift.shape() != &[blocks, dim] {
            return Err(anyhow!("Flow parameters have unexpected shapes"));
        }

        let mut z = sample.data().to_vec();
        for block in 0..blocks {
            let scale_row = scale.row(block);
            let shift_row = shift.row(block);
            for (value, (s, t)) in z.iter_mut().zip(scale_row.iter().zip(shift_row.iter())) {
                *value = *value * s + t;
            }
        }

        let log_det = scale
            .data()
            .iter()
            .map(|s| s.abs().max(EPS).ln())
            .sum::<f32>();
        let squared = z.iter().map(|v| v * v).sum::<f32>();

        // Negative log likelihood, normalized by the embedding width.
        Ok((0.5 * squared - log_det) / dim as f32)
    }
}
