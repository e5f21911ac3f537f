use anyhow::{anyhow, Result};
use common::{column_stats, mean, Config, ConfigLoader};
use engine::{AnomalyModule, StateDict, Tensor};
use serde::{Deserialize, Serialize};

const EPS: f32 = 1e-6;

#[derive(Serialize, Deserialize, Debug)]
pub struct DraemOptions {
    pub enable_sspcab: bool,
    pub embedding_dim: usize,
}

impl Config for DraemOptions {
    fn load(config: &ConfigLoader) -> Result<Self> {
        Ok(Self {
            enable_sspcab: config
                .get("enable_sspcab")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            embedding_dim: config
                .get("embedding_dim")
                .and_then(|v| v.as_usize())
                .unwrap_or(256),
        })
    }
}

/// Discriminatively trained reconstruction. The reconstructive half learns
/// the normal appearance of each dimension and the discriminative half
/// weights the residuals by the fitted precision. The optional sspcab
/// attention re-weights dimensions by their share of the training variance.
pub struct DraemLightning {
    options: DraemOptions,
    parameters: StateDict,
}

impl DraemLightning {
    pub fn new(config: &ConfigLoader) -> Result<Self> {
        let options: DraemOptions = config.load()?;
        let dim = options.embedding_dim;

        let mut parameters = StateDict::new();
        parameters.insert("reconstruction.weight", Tensor::zeros(vec![dim]));
        parameters.insert("discriminator.weight", Tensor::full(vec![dim], 1.0));
        if options.enable_sspcab {
            parameters.insert("sspcab.weight", Tensor::full(vec![dim], 1.0));
        }

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

impl AnomalyModule for DraemLightning {
    fn name(&self) -> &'static str {
        "DraemLightning"
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

        let precisions = variances.iter().map(|v| 1.0 / (v + EPS)).collect::<Vec<_>>();

        if self.parameters.contains("sspcab.weight") {
            let mean_variance = mean(&variances);
            let attention = variances
                .iter()
                .map(|v| (v + EPS) / (mean_variance + EPS))
                .collect::<Vec<_>>();
            self.parameters
                .insert("sspcab.weight", Tensor::from_vec(attention));
        }

        self.parameters
            .insert("reconstruction.weight", Tensor::from_vec(means));
        self.parameters
            .insert("discriminator.weight", Tensor::from_vec(precisions));

        Ok(())
    }

    fn score(&self, sample: &Tensor) -> Result<f32> {
        self.check_sample(sample)?;

        let reconstruction = self.parameters.tensor("reconstruction.weight");
        let discriminator = self.parameters.tensor("discriminator.weight");
        let attention = self.parameters.get("sspcab.weight");

        let residuals = sample
            .data()
            .iter()
            .zip(reconstruction.data().iter().zip(discriminator.data().iter()))
            .enumerate()
            .map(|(i, (x, (r, p)))| {
                let weight = attention
                    .and_then(|a| a.data().get(i))
                    .copied()
                    .unwrap_or(1.0);
                (x - r) * (x - r) * p * weight
            })
            .collect::<Vec<_>>();

        Ok(mean(&residuals))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn model(extra: &str) -> DraemLightning {
        let content = format!("model {{ name = draem, embedding_dim = 3{} }}", extra);
        let config = ConfigLoader::from_str(&content, "model".to_string()).unwrap();
        DraemLightning::new(&config).unwrap()
    }

    #[test]
    fn test_default_options() {
        let config = ConfigLoader::from_str("model { name = draem }", "model".to_string()).unwrap();

        let options: DraemOptions = config.load().unwrap();

        assert!(!options.enable_sspcab);
        assert_eq!(options.embedding_dim, 256);
    }

    #[test]
    fn test_sspcab_adds_a_parameter() {
        let without = model("");
        let with = model(", enable_sspcab = true");

        assert!(!without.parameters().contains("sspcab.weight"));
        assert!(with.parameters().contains("sspcab.weight"));
    }

    #[test]
    fn test_fit_then_score() {
        let mut model = model("");
        let batch = vec![
            Tensor::from_vec(vec![1.0, 2.0, 3.0]),
            Tensor::from_vec(vec![1.1, 2.1, 3.1]),
        ];

        model.fit(&batch).unwrap();

        let normal = model
            .score(&Tensor::from_vec(vec![1.05, 2.05, 3.05]))
            .unwrap();
        let anomalous = model
            .score(&Tensor::from_vec(vec![8.0, 8.0, 8.0]))
            .unwrap();

        assert!(normal < anomalous);
    }

    #[test]
    fn test_score_at_reconstruction_is_zero() {
        let mut model = model("");
        let batch = vec![Tensor::from_vec(vec![1.0, 2.0, 3.0])];

        model.fit(&batch).unwrap();

        let score = model.score(&Tensor::from_vec(vec![1.0, 2.0, 3.0])).unwrap();

        assert_approx_eq!(score, 0.0, 0.001);
    }
}
