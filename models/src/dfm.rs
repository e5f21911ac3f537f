use anyhow::{anyhow, Result};
use common::{column_stats, dot, Config, ConfigLoader};
use engine::{AnomalyModule, StateDict, Tensor};
use serde::{Deserialize, Serialize};

use super::backbone;
use super::init;

const EPS: f32 = 1e-6;

#[derive(Serialize, Deserialize, Debug)]
pub struct DfmOptions {
    pub backbone: String,
    pub layer: String,
    pub pca_level: f32,
    pub score_type: String,
    pub embedding_dim: usize,
}

impl Config for DfmOptions {
    fn load(config: &ConfigLoader) -> Result<Self> {
        let backbone = config
            .get("backbone")
            .and_then(|v| v.as_string())
            .unwrap_or_else(|| "resnet18".to_string());
        let layer = config
            .get("layer")
            .and_then(|v| v.as_string())
            .unwrap_or_else(|| "layer3".to_string());
        let embedding_dim = match config.get("embedding_dim").and_then(|v| v.as_usize()) {
            Some(dim) => dim,
            None => backbone::layer_dim(&backbone, &layer)?,
        };
        let score_type = config
            .get("score_type")
            .and_then(|v| v.as_string())
            .unwrap_or_else(|| "fre".to_string());

        if score_type != "fre" && score_type != "nll" {
            return Err(anyhow!("Unsupported score type {}", score_type));
        }

        Ok(Self {
            backbone,
            layer,
            pca_level: config
                .get("pca_level")
                .and_then(|v| v.as_f32())
                .unwrap_or(0.97),
            score_type,
            embedding_dim,
        })
    }
}

/// Deep feature modeling. Embeddings are compressed through a fixed random
/// projection and scored either by the feature reconstruction error or by
/// the gaussian likelihood of the projection coefficients.
pub struct DfmLightning {
    options: DfmOptions,
    parameters: StateDict,
}

impl DfmLightning {
    pub fn new(config: &ConfigLoader) -> Result<Self> {
        let options: DfmOptions = config.load()?;
        let mut rng = init::seeded_rng(config);

        let dim = options.embedding_dim;
        let components = (((options.pca_level * dim as f32) as usize).max(1)).min(dim);

        let mut rows = Vec::with_capacity(components * dim);
        for _ in 0..components {
            let mut row = init::normal_weights(&mut rng, dim, 0.0, 1.0)?;
            let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt().max(EPS);
            for value in row.iter_mut() {
                *value /= norm;
            }
            rows.extend(row);
        }

        let mut parameters = StateDict::new();
        parameters.insert("projection.mean", Tensor::zeros(vec![dim]));
        parameters.insert(
            "projection.components",
            Tensor::new(vec![components, dim], rows),
        );
        parameters.insert("projection.variance", Tensor::full(vec![components], 1.0));

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

impl AnomalyModule for DfmLightning {
    fn name(&self) -> &'static str {
        "DfmLightning"
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
        let (means, _) =
            column_stats(&rows).ok_or_else(|| anyhow!("Cannot fit on an empty batch"))?;

        let centered_rows = batch
            .iter()
            .map(|sample| {
                sample
                    .data()
                    .iter()
                    .zip(means.iter())
                    .map(|(x, m)| x - m)
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        let variances = {
            let components = self.parameters.tensor("projection.components");
            components
                .rows()
                .map(|component| {
                    let squares = centered_rows
                        .iter()
                        .map(|centered| {
                            let coefficient = dot(component, centered);
                            coefficient * coefficient
                        })
                        .sum::<f32>();

                    (squares / batch.len() as f32).max(EPS)
                })
                .collect::<Vec<_>>()
        };

        self.parameters
            .insert("projection.mean", Tensor::from_vec(means));
        self.parameters
            .insert("projection.variance", Tensor::from_vec(variances));

        Ok(())
    }

    fn score(&self, sample: &Tensor) -> Result<f32> {
        self.check_sample(sample)?;

        let mean = self.parameters.tensor("projection.mean");
        let components = self.parameters.tensor("projection.components");
        let variance = self.parameters.tensor("projection.variance");

        let centered = sample
            .data()
            .iter()
            .zip(mean.data().iter())
            .map(|(x, m)| x - m)
            .collect::<Vec<_>>();
        let coefficients = components
            .rows()
            .map(|component| dot(component, &centered))
            .collect::<Vec<_>>();

        let score = match self.options.score_type.as_str() {
            "nll" => coefficients
                .iter()
                .zip(variance.data().iter())
                .map(|(t, var)| t * t / var.max(EPS) + var.max(EPS).ln())
                .sum::<f32>(),
            _ => {
                // Feature reconstruction error.
                let mut reconstruction = vec![0.0; centered.len()];
                for (component, coefficient) in components.rows().zip(coefficients.iter()) {
                    for (r, c) in reconstruction.iter_mut().zip(component.iter()) {
                        *r += coefficient * c;
                    }
                }

                centered
                    .iter()
                    .zip(reconstruction.iter())
                    .map(|(c, r)| (c - r) * (c - r))
                    .sum::<f32>()
            }
        };

        Ok(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    const CONFIG: &str = r#"
        model {
            name = dfm
            layer = layer3
            embedding_dim = 4
            pca_level = 0.75
        }

        project {
            seed = 5
        }
    "#;

    fn model_with(score_type: &str) -> DfmLightning {
        let content = format!(
            "model {{ name = dfm, embedding_dim = 4, pca_level = 0.75, score_type = {} }} project {{ seed = 5 }}",
            score_type
        );
        let config = ConfigLoader::from_str(&content, "model".to_string()).unwrap();
        DfmLightning::new(&config).unwrap()
    }

    #[test]
    fn test_default_options() {
        let config = ConfigLoader::from_str("model { name = dfm }", "model".to_string()).unwrap();

        let options: DfmOptions = config.load().unwrap();

        assert_eq!(options.backbone, "resnet18");
        assert_eq!(options.layer, "layer3");
        assert_eq!(options.embedding_dim, 256);
        assert_eq!(options.score_type, "fre");
    }

    #[test]
    fn test_invalid_score_type_is_rejected() {
        let config = ConfigLoader::from_str(
            "model { name = dfm, score_type = density }",
            "model".to_string(),
        )
        .unwrap();

        assert!(config.load::<DfmOptions>().is_err());
    }

    #[test]
    fn test_components_have_unit_norm() {
        let config = ConfigLoader::from_str(CONFIG, "model".to_string()).unwrap();
        let model = DfmLightning::new(&config).unwrap();

        let components = model.parameters().tensor("projection.components");
        assert_eq!(components.shape(), &[3, 4]);

        for component in components.rows() {
            let norm = component.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert_approx_eq!(norm, 1.0, 0.0001);
        }
    }

    #[test]
    fn test_fre_score_is_zero_at_the_mean() {
        let mut model = model_with("fre");
        let batch = vec![
            Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0]),
            Tensor::from_vec(vec![3.0, 4.0, 5.0, 6.0]),
        ];

        model.fit(&batch).unwrap();

        let score = model
            .score(&Tensor::from_vec(vec![2.0, 3.0, 4.0, 5.0]))
            .unwrap();

        assert_approx_eq!(score, 0.0, 0.0001);
    }

    #[test]
    fn test_nll_score_orders_anomalies() {
        let mut model = model_with("nll");
        let batch = vec![
            Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0]),
            Tensor::from_vec(vec![1.1, 2.1, 3.1, 4.1]),
            Tensor::from_vec(vec![0.9, 1.9, 2.9, 3.9]),
        ];

        model.fit(&batch).unwrap();

        let normal = model
            .score(&Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        let anomalous = model
            .score(&Tensor::from_vec(vec![30.0, -10.0, 12.0, 4.0]))
            .unwrap();

        assert!(normal < anomalous);
    }
}
