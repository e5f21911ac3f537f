use anyhow::{anyhow, Result};
use common::{dot, mean, Config, ConfigLoader};
use engine::{AnomalyModule, StateDict, Tensor};
use serde::{Deserialize, Serialize};

use super::backbone;
use super::init;

const EPS: f32 = 1e-6;

#[derive(Serialize, Deserialize, Debug)]
pub struct ReverseDistillationOptions {
    pub backbone: String,
    pub layers: Vec<String>,
    pub anomaly_map_mode: String,
    pub embedding_dim: usize,
}

impl Config for ReverseDistillationOptions {
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
                    "layer1".to_string(),
                    "layer2".to_string(),
                    "layer3".to_string(),
                ]
            });
        let anomaly_map_mode = config
            .get("anomaly_map_mode")
            .and_then(|v| v.as_string())
            .unwrap_or_else(|| "multiply".to_string());
        if anomaly_map_mode != "add" && anomaly_map_mode != "multiply" {
            return Err(anyhow!(
                "Unsupported anomaly map mode {}. Expected add or multiply",
                anomaly_map_mode
            ));
        }
        let embedding_dim = match config.get("embedding_dim").and_then(|v| v.as_usize()) {
            Some(dim) => dim,
            None => backbone::embedding_dim(&backbone, &layers)?,
        };

        Ok(Self {
            backbone,
            layers,
            anomaly_map_mode,
            embedding_dim,
        })
    }
}

/// Distillation through a one dimensional bottleneck. The encoder collapses an
/// embedding to a single activation and the decoder expands it back. Training
/// data lies along the direction the decoder learns, so anything off that
/// direction reconstructs with a visible error.
pub struct ReverseDistillationLightning {
    options: ReverseDistillationOptions,
    parameters: StateDict,
}

impl ReverseDistillationLightning {
    pub fn new(config: &ConfigLoader) -> Result<Self> {
        let options: ReverseDistillationOptions = config.load()?;
        let mut rng = init::seeded_rng(config);

        let dim = options.embedding_dim;
        let encoder = init::normal_weights(&mut rng, dim, 1.0, 0.1)?;

        let mut parameters = StateDict::new();
        parameters.insert("encoder.weight", Tensor::from_vec(encoder));
        parameters.insert("decoder.weight", Tensor::zeros(vec![dim]));

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

impl AnomalyModule for ReverseDistillationLightning {
    fn name(&self) -> &'static str {
        "ReverseDistillationLightning"
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

        if batch.is_empty() {
            return Err(anyhow!("Cannot fit on an empty batch"));
        }

        let encoder = self.parameters.tensor("encoder.weight").data().to_vec();
        let dim = self.options.embedding_dim;

        // Least squares for the decoder given the frozen encoder.
        let mut numerators = vec![0.0; dim];
        let mut denominator = 0.0;
        for sample in batch {
            let bottleneck = dot(&encoder, sample.data());
            for (numerator, x) in numerators.iter_mut().zip(sample.data().iter()) {
                *numerator += x * bottleneck;
            }
            denominator += bottleneck * bottleneck;
        }

        let decoder = numerators
            .into_iter()
            .map(|numerator| numerator / (denominator + EPS))
            .collect::<Vec<_>>();
        self.parameters
            .insert("decoder.weight", Tensor::from_vec(decoder));

        Ok(())
    }

    fn score(&self, sample: &Tensor) -> Result<f32> {
        self.check_sample(sample)?;

        let encoder = self.parameters.tensor("encoder.weight");
        let decoder = self.parameters.tensor("decoder.weight");

        let bottleneck = dot(encoder.data(), sample.data());
        let errors = sample
            .data()
            .iter()
            .zip(decoder.data().iter())
            .map(|(x, d)| {
                let reconstructed = d * bottleneck;
                (x - reconstructed) * (x - reconstructed)
            })
            .collect::<Vec<_>>();

        match self.options.anomaly_map_mode.as_str() {
            "add" => Ok(mean(&errors)),
            _ => {
                let log_errors = errors.iter().map(|e| (1.0 + e).ln()).collect::<Vec<_>>();
                Ok(mean(&log_errors).exp() - 1.0)
            }
        }
    }
}
