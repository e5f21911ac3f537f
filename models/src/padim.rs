use anyhow::{anyhow, Result};
use common::{column_stats, Config, ConfigLoader};
use engine::{AnomalyModule, StateDict, Tensor};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::backbone;
use super::init;

const EPS: f32 = 1e-6;

#[derive(Serialize, Deserialize, Debug)]
pub struct PadimOptions {
    pub backbone: String,
    pub layers: Vec<String>,
    pub n_features: usize,
    pub embedding_dim: usize,
}

impl Config for PadimOptions {
    fn load(config: &ConfigLoader) -> Result<Self> {
        let backbone = config
            .get("backbone")
            .and_then(|v| v.as_string())
            .unwrap_or_else(|| "resnet18".to_string());
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
        let embedding_dim = match config.get("embedding_dim").and_then(|v| v.as_usize()) {
            Some(dim) => dim,
            None => backbone::embedding_dim(&backbone, &layers)?,
        };
        let n_features = config
            .get("n_features")
            .and_then(|v| v.as_usize())
            .unwrap_or(match backbone.as_str() {
                "wide_resnet50_2" => 550,
                _ => 100,
            });

        Ok(Self {
            backbone,
            layers,
            n_features: n_features.min(embedding_dim),
            embedding_dim,
        })
    }
}

/// Patch distribution modeling. A random subset of the embedding dimensions
/// is described by a per dimension gaussian fitted to the normal samples.
pub struct PadimLightning {
    options: PadimOptions,
    parameters: StateDict,
}

impl PadimLightning {
    pub fn new(config: &ConfigLoader) -> Result<Self> {
        let options: PadimOptions = config.load()?;
        let mut rng = init::seeded_rng(config);

        let mut idx = (0..options.embedding_dim).collect::<Vec<_>>();
        idx.shuffle(&mut rng);
        idx.truncate(options.n_features);
        idx.sort_unstable();

        let mut parameters = StateDict::new();
        parameters.insert(
            "gaussian.idx",
            Tensor::from_vec(idx.into_iter().map(|i| i as f32).collect()),
        );
        parameters.insert("gaussian.mean", Tensor::zeros(vec![options.n_features]));
        parameters.insert(
            "gaussian.inv_covariance",
            Tensor::full(vec![options.n_features], 1.0),
        );

        Ok(Self {
            options,
            parameters,
        })
    }

    fn selected_dims(&self) -> Result<Vec<usize>> {
        let dims = self
            .parameters
            .tensor("gaussian.idx")
            .data()
            .iter()
            .map(|&i| i as usize)
            .collect::<Vec<_>>();

        if let Some(&bad) = dims.iter().find(|&&i| i >= self.options.embedding_dim) {
            return Err(anyhow!("Embedding index {} is out of range", bad));
        }

        Ok(dims)
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

impl AnomalyModule for PadimLightning {
    fn name(&self) -> &'static str {
        "PadimLightning"
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

        let dims = self.selected_dims()?;
        let rows = batch
            .iter()
            .map(|sample| dims.iter().map(|&i| sample.data()[i]).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        let rows = rows.iter().map(|r| r.as_slice()).collect::<Vec<_>>();

        let (means, variances) =
            column_stats(&rows).ok_or_else(|| anyhow!("Cannot fit on an empty batch"))?;
        let inv_covariance = variances.iter().map(|v| 1.0 / (v + EPS)).collect::<Vec<_>>();

        self.parameters
            .insert("gaussian.mean", Tensor::from_vec(means));
        self.parameters
            .insert("gaussian.inv_covariance", Tensor::from_vec(inv_covariance));

        Ok(())
    }

    fn score(&self, sample: &Tensor) -> Result<f32> {
        self.check_sample(sample)?;

        let dims = self.selected_dims()?;
        let mean = self.parameters.tensor("gaussian.mean");
        let inv_covariance = self.parameters.tensor("gaussian.inv_covariance");

        // Mahalanobis distance under a diagonal covariance.
        let distance = dims
            .iter()
            .zip(mean.data().iter().zip(inv_covariance.data().iter()))
            .map(|(&i, (mean, inv_cov))| {
                let delta = sample.data()[i] - mean;
                delta * delta * inv_cov
            })
            .sum::<f32>();

        Ok(distance.sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    const CONFIG: &str = r#"
        model {
            name = padim
            backbone = resnet18
            layers = [layer1]
            embedding_dim = 4
            n_features = 2
        }

        project {
            seed = 7
        }
    "#;

    fn model() -> PadimLightning {
        let config = ConfigLoader::from_str(CONFIG, "model".to_string()).unwrap();
        PadimLightning::new(&config).unwrap()
    }

    #[test]
    fn test_default_options() {
        let config = ConfigLoader::from_str("model { name = padim }", "model".to_string()).unwrap();

        let options: PadimOptions = config.load().unwrap();

        assert_eq!(options.backbone, "resnet18");
        assert_eq!(options.layers.len(), 3);
        assert_eq!(options.embedding_dim, 448);
        assert_eq!(options.n_features, 100);
    }

    #[test]
    fn test_parameter_layout() {
        let model = model();

        assert_eq!(model.parameters().tensor("gaussian.idx").shape(), &[2]);
        assert_eq!(model.parameters().tensor("gaussian.mean").shape(), &[2]);
        assert_eq!(
            model.parameters().tensor("gaussian.inv_covariance").shape(),
            &[2]
        );
    }

    #[test]
    fn test_fit_then_score() {
        let mut model = model();
        let batch = vec![
            Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0]),
            Tensor::from_vec(vec![1.2, 2.2, 3.2, 4.2]),
            Tensor::from_vec(vec![0.8, 1.8, 2.8, 3.8]),
        ];

        model.fit(&batch).unwrap();

        let normal = model
            .score(&Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        let anomalous = model
            .score(&Tensor::from_vec(vec![9.0, 9.0, 9.0, 9.0]))
            .unwrap();

        assert!(normal < anomalous);
    }

    #[test]
    fn test_score_at_mean_is_zero() {
        let mut model = model();
        let batch = vec![Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0])];

        model.fit(&batch).unwrap();

        let score = model
            .score(&Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0]))
            .unwrap();

        assert_approx_eq!(score, 0.0, 0.001);
    }

    #[test]
    fn test_fit_empty_batch_fails() {
        let mut model = model();

        assert!(model.fit(&[]).is_err());
    }

    #[test]
    fn test_rejects_wrong_width() {
        let model = model();

        assert!(model.score(&Tensor::from_vec(vec![1.0])).is_err());
    }
}
