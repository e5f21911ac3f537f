use anyhow::{anyhow, Result};
use common::{column_stats, mean, Config, ConfigLoader};
use engine::{AnomalyModule, StateDict, Tensor};
use serde::{Deserialize, Serialize};

use super::backbone;

const EPS: f32 = 1e-6;

#[derive(Serialize, Deserialize, Debug)]
pub struct DfkdeOptions {
    pub backbone: String,
    pub layers: Vec<String>,
    pub max_training_points: usize,
    pub embedding_dim: usize,
}

impl Config for DfkdeOptions {
    fn load(config: &ConfigLoader) -> Result<Self> {
        let backbone = config
            .get("backbone")
            .and_then(|v| v.as_string())
            .unwrap_or_else(|| "resnet18".to_string());
        let layers = config
            .get("layers")
            .and_then(|v| v.as_string_vec())
            .unwrap_or_else(|| vec!["layer4".to_string()]);
        let embedding_dim = match config.get("embedding_dim").and_then(|v| v.as_usize()) {
            Some(dim) => dim,
            None => backbone::embedding_dim(&backbone, &layers)?,
        };

        Ok(Self {
            backbone,
            layers,
            max_training_points: config
                .get("max_training_points")
                .and_then(|v| v.as_usize())
                .unwrap_or(40000),
            embedding_dim,
        })
    }
}

/// Kernel density estimation over a bank of normal embeddings. The score of
/// a sample is the negative log density under a gaussian kernel whose
/// bandwidth follows Scott's rule.
pub struct DfkdeLightning {
    options: DfkdeOptions,
    parameters: StateDict,
}

impl DfkdeLightning {
    pub fn new(config: &ConfigLoader) -> Result<Self> {
        let options: DfkdeOptions = config.load()?;

        let mut parameters = StateDict::new();
        parameters.insert("kde.samples", Tensor::zeros(vec![0, options.embedding_dim]));
        parameters.insert("kde.bandwidth", Tensor::from_vec(vec![1.0]));

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

    fn check_bank(&self, bank: &Tensor) -> Result<()> {
        if bank.shape().len() != 2 || bank.shape()[1] != self.options.embedding_dim {
            return Err(anyhow!(
                "The sample bank has shape {:?}, expected [n, {}]",
                bank.shape(),
                self.options.embedding_dim
            ));
        }

        Ok(())
    }
}

impl AnomalyModule for DfkdeLightning {
    fn name(&self) -> &'static str {
        "DfkdeLightning"
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
        // A hydrated bank may have any shape, so it is checked before rows
        // are appended to it.
        self.check_bank(self.parameters.tensor("kde.samples"))?;

        let max_points = self.options.max_training_points;

        {
            let bank = self.parameters.tensor_mut("kde.samples");
            for sample in batch {
                if bank.num_rows() >= max_points {
                    break;
                }
                bank.push_row(sample.data());
            }
        }

        let bandwidth = {
            let bank = self.parameters.tensor("kde.samples");
            if bank.num_rows() == 0 {
                return Ok(());
            }

            let rows = bank.rows().collect::<Vec<_>>();
            let (_, variances) =
                column_stats(&rows).ok_or_else(|| anyhow!("The sample bank is empty"))?;
            let sigmas = variances.iter().map(|v| v.sqrt()).collect::<Vec<_>>();

            let n = bank.num_rows() as f32;
            let dim = self.options.embedding_dim as f32;
            (n.powf(-1.0 / (dim + 4.0)) * mean(&sigmas)).max(EPS)
        };

        self.parameters
            .insert("kde.bandwidth", Tensor::from_vec(vec![bandwidth]));

        Ok(())
    }

    fn score(&self, sample: &Tensor) -> Result<f32> {
        self.check_sample(sample)?;

        let bank = self.parameters.tensor("kde.samples");
        self.check_bank(bank)?;
        if bank.num_rows() == 0 {
            return Err(anyhow!("Cannot score before fitting any samples"));
        }

        let bandwidth = self
            .parameters
            .tensor("kde.bandwidth")
            .data()
            .first()
            .copied()
            .unwrap_or(1.0)
            .max(EPS);

        let density = bank
            .rows()
            .map(|row| {
                let distance = common::euclidean(sample.data(), row) / bandwidth;
                (-0.5 * distance * distance).exp()
            })
            .sum::<f32>()
            / bank.num_rows() as f32;

        Ok(-(density + EPS).ln())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        model {
            name = dfkde
            layers = [layer4]
            embedding_dim = 2
            max_training_points = 16
        }
    "#;

    fn model() -> DfkdeLightning {
        let config = ConfigLoader::from_str(CONFIG, "model".to_string()).unwrap();
        DfkdeLightning::new(&config).unwrap()
    }

    #[test]
    fn test_default_options() {
        let config = ConfigLoader::from_str("model { name = dfkde }", "model".to_string()).unwrap();

        let options: DfkdeOptions = config.load().unwrap();

        assert_eq!(options.backbone, "resnet18");
        assert_eq!(options.layers, vec!["layer4".to_string()]);
        assert_eq!(options.max_training_points, 40000);
        assert_eq!(options.embedding_dim, 512);
    }

    #[test]
    fn test_fit_fills_the_bank() {
        let mut model = model();
        let batch = vec![
            Tensor::from_vec(vec![0.0, 0.0]),
            Tensor::from_vec(vec![0.1, 0.0]),
            Tensor::from_vec(vec![0.0, 0.1]),
        ];

        model.fit(&batch).unwrap();

        let bank = model.parameters().tensor("kde.samples");
        assert_eq!(bank.shape(), &[3, 2]);
        assert!(model.parameters().tensor("kde.bandwidth").data()[0] > 0.0);
    }

    #[test]
    fn test_bank_is_capped() {
        let config = ConfigLoader::from_str(
            "model { name = dfkde, embedding_dim = 2, max_training_points = 2 }",
            "model".to_string(),
        )
        .unwrap();
        let mut model = DfkdeLightning::new(&config).unwrap();
        let batch = vec![
            Tensor::from_vec(vec![0.0, 0.0]),
            Tensor::from_vec(vec![1.0, 0.0]),
            Tensor::from_vec(vec![2.0, 0.0]),
        ];

        model.fit(&batch).unwrap();

        assert_eq!(model.parameters().tensor("kde.samples").num_rows(), 2);
    }

    #[test]
    fn test_reshaped_bank_is_rejected() {
        let mut model = model();
        let mut incoming = StateDict::new();
        incoming.insert("kde.samples", Tensor::zeros(vec![1, 3]));
        model.load_state_dict(&incoming, false).unwrap();

        assert!(model.fit(&[Tensor::from_vec(vec![1.0, 2.0])]).is_err());
        assert!(model.score(&Tensor::from_vec(vec![1.0, 2.0])).is_err());
    }

    #[test]
    fn test_fit_then_score() {
        let mut model = model();
        let batch = vec![
            Tensor::from_vec(vec![0.0, 0.0]),
            Tensor::from_vec(vec![0.1, 0.0]),
            Tensor::from_vec(vec![0.0, 0.1]),
        ];

        model.fit(&batch).unwrap();

        let normal = model.score(&Tensor::from_vec(vec![0.0, 0.0])).unwrap();
        let anomalous = model.score(&Tensor::from_vec(vec![5.0, 5.0])).unwrap();

        assert!(normal < anomalous);
    }

    #[test]
    fn test_score_without_fit_fails() {
        let model = model();

        assert!(model.score(&Tensor::from_vec(vec![0.0, 0.0])).is_err());
    }
}
