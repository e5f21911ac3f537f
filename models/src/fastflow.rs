use anyhow::{anyhow, Result};
use common::{column_stats, Config, ConfigLoader};
use engine::{AnomalyModule, StateDict, Tensor};
use serde::{Deserialize, Serialize};

use super::backbone;

const EPS: f32 = 1e-6;

#[derive(Serialize, Deserialize, Debug)]
pub struct FastflowOptions {
    pub backbone: String,
    pub layers: Vec<String>,
    pub flow_steps: usize,
    pub embedding_dim: usize,
}

impl Config for FastflowOptions {
    fn load(config: &ConfigLoader) -> Result<Self> {
        let backbone = config
            .get("backbone")
            .and_then(|v| v.as_string())
            .unwrap_or_else(|| "resnet18".to_string());
        let layers = config
            .get("layers")
            .and_then(|v| v.as_string_vec())
            .unwrap_or_else(|| vec!["layer3".to_string()]);
        let embedding_dim = match config.get("embedding_dim").and_then(|v| v.as_usize()) {
            Some(dim) => dim,
            None => backbone::embedding_dim(&backbone, &layers)?,
        };
        if embedding_dim == 0 {
            return Err(anyhow!("embedding_dim must be at least 1"));
        }

        Ok(Self {
            backbone,
            layers,
            flow_steps: config
                .get("flow_steps")
                .and_then(|v| v.as_usize())
                .unwrap_or(8)
                .max(1),
            embedding_dim,
        })
    }
}

/// A 2d normalizing flow with alternating affine coupling steps. Even steps
/// transform the first half of the embedding and odd steps the second half,
/// so two fitted steps whiten the full embedding.
pub struct FastflowLightning {
    options: FastflowOptions,
    parameters: StateDict,
}

impl FastflowLightning {
    pub fn new(config: &ConfigLoader) -> Result<Self> {
        let options: FastflowOptions = config.load()?;

        let steps = options.flow_steps;
        let dim = options.embedding_dim;

        let mut parameters = StateDict::new();
        parameters.insert("flow.scale", Tensor::full(vec![steps, dim], 1.0));
        parameters.insert("flow.shift", Tensor::zeros(vec![steps, dim]));

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

impl AnomalyModule for FastflowLightning {
    fn name(&self) -> &'static str {
        "FastflowLightning"
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

        let steps = self.options.flow_steps;
        let dim = self.options.embedding_dim;
        let half = dim / 2;

        let mut scale = self.parameters.tensor("flow.scale").data().to_vec();
        let mut shift = self.parameters.tensor("flow.shift").data().to_vec();
        if scale.len() != steps * dim {
            scale = vec![1.0; steps * dim];
        }
        if shift.len() != steps * dim {
            shift = vec![0.0; steps * dim];
        }

        for (i, (mean, var)) in means.iter().zip(variances.iter()).enumerate() {
            // The first half belongs to step 0, the rest to step 1. With a
            // single step the whole embedding is folded into it.
            let step = if steps == 1 || i < half { 0 } else { 1 };
            let s = 1.0 / (var.sqrt() + EPS);

            scale[step * dim + i] = s;
            shift[step * dim + i] = -mean * s;
        }

        self.parameters
            .insert("flow.scale", Tensor::new(vec![steps, dim], scale));
        self.parameters
            .insert("flow.shift", Tensor::new(vec![steps, dim], shift));

        Ok(())
    }

    fn score(&self, sample: &Tensor) -> Result<f32> {
        self.check_sample(sample)?;

        let steps = self.options.flow_steps;
        let dim = self.options.embedding_dim;
        let scale = self.parameters.tensor("flow.scale");
        let shift = self.parameters.tensor("flow.shift");
        if scale.shape() != &[steps, dim] || shift.shape() != &[steps, dim] {
            return Err(anyhow!("Flow parameters have unexpected shapes"));
        }

        let mut z = sample.data().to_vec();
        for step in 0..steps {
            let scale_row = scale.row(step);
            let shift_row = shift.row(step);
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

        Ok((0.5 * squared - log_det) / dim as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        model {
            name = fastflow
            layers = [layer3]
            embedding_dim = 4
            flow_steps = 8
        }
    "#;

    fn model() -> FastflowLightning {
        let config = ConfigLoader::from_str(CONFIG, "model".to_string()).unwrap();
        FastflowLightning::new(&config).unwrap()
    }

    #[test]
    fn test_default_options() {
        let config =
            ConfigLoader::from_str("model { name = fastflow }", "model".to_string()).unwrap();

        let options: FastflowOptions = config.load().unwrap();

        assert_eq!(options.backbone, "resnet18");
        assert_eq!(options.flow_steps, 8);
        assert_eq!(options.embedding_dim, 256);
    }

    #[test]
    fn test_parameter_layout() {
        let model = model();

        assert_eq!(model.parameters().tensor("flow.scale").shape(), &[8, 4]);
        assert_eq!(model.parameters().tensor("flow.shift").shape(), &[8, 4]);
    }

    #[test]
    fn test_fit_then_score() {
        let mut model = model();
        let batch = vec![
            Tensor::from_vec(vec![0.0, 0.0, 0.0, 0.0]),
            Tensor::from_vec(vec![2.0, 2.0, 2.0, 2.0]),
        ];

        model.fit(&batch).unwrap();

        let normal = model
            .score(&Tensor::from_vec(vec![1.0, 1.0, 1.0, 1.0]))
            .unwrap();
        let anomalous = model
            .score(&Tensor::from_vec(vec![9.0, 9.0, 9.0, 9.0]))
            .unwrap();

        assert!(normal < anomalous);
    }

    #[test]
    fn test_zero_width_embedding_is_rejected() {
        let config = ConfigLoader::from_str(
            "model { name = fastflow, embedding_dim = 0 }",
            "model".to_string(),
        )
        .unwrap();

        assert!(FastflowLightning::new(&config).is_err());
    }

    #[test]
    fn test_single_step_flow() {
        let config = ConfigLoader::from_str(
            "model { name = fastflow, embedding_dim = 2, flow_steps = 1 }",
            "model".to_string(),
        )
        .unwrap();
        let mut model = FastflowLightning::new(&config).unwrap();
        let batch = vec![
            Tensor::from_vec(vec![0.0, 0.0]),
            Tensor::from_vec(vec![2.0, 2.0]),
        ];

        model.fit(&batch).unwrap();

        let normal = model.score(&Tensor::from_vec(vec![1.0, 1.0])).unwrap();
        let anomalous = model.score(&Tensor::from_vec(vec![9.0, 9.0])).unwrap();

        assert!(normal < anomalous);
    }
}
