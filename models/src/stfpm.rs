use anyhow::{anyhow, Result};
use common::{mean, Config, ConfigLoader};
use engine::{AnomalyModule, StateDict, Tensor};
use serde::{Deserialize, Serialize};

use super::backbone;
use super::init;

#[derive(Serialize, Deserialize, Debug)]
pub struct StfpmOptions {
    pub backbone: String,
    pub layers: Vec<String>,
    pub weight_decay: f32,
    pub embedding_dim: usize,
}

impl Config for StfpmOptions {
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

        Ok(Self {
            backbone,
            layers,
            weight_decay: config
                .get("weight_decay")
                .and_then(|v| v.as_f32())
                .unwrap_or(0.0001),
            embedding_dim,
        })
    }
}

/// Student teacher feature matching. The student is fitted to mimic the fixed
/// teacher response on training data, with weight decay pulling unused
/// dimensions toward zero. Scoring measures how far the two responses drift
/// apart on a sample.
pub struct StfpmLightning {
    options: StfpmOptions,
    parameters: StateDict,
}

impl StfpmLightning {
    pub fn new(config: &ConfigLoader) -> Result<Self> {
        let options: StfpmOptions = config.load()?;
        let mut rng = init::seeded_rng(config);

        let dim = options.embedding_dim;
        let teacher = init::normal_weights(&mut rng, dim, 1.0, 0.1)?;

        let mut parameters = StateDict::new();
        parameters.insert("teacher_model.weight", Tensor::from_vec(teacher));
        parameters.insert("student_model.weight", Tensor::zeros(vec![dim]));

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

impl AnomalyModule for StfpmLightning {
    fn name(&self) -> &'static str {
        "StfpmLightning"
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

        let dim = self.options.embedding_dim;
        let mut activation = vec![0.0; dim];
        for sample in batch {
            for (total, x) in activation.iter_mut().zip(sample.data().iter()) {
                *total += x * x;
            }
        }

        // Ridge solution per dimension. Strongly activated dimensions match the
        // teacher, unseen ones decay to zero.
        let decay = self.options.weight_decay;
        let teacher = self.parameters.tensor("teacher_model.weight").data().to_vec();
        let student = teacher
            .iter()
            .zip(activation.iter())
            .map(|(t, a)| t * a / (a + decay))
            .collect::<Vec<_>>();

        self.parameters
            .insert("student_model.weight", Tensor::from_vec(student));

        Ok(())
    }

    fn score(&self, sample: &Tensor) -> Result<f32> {
        self.check_sample(sample)?;

        let teacher = self.parameters.tensor("teacher_model.weight");
        let student = self.parameters.tensor("student_model.weight");

        let differences = sample
            .data()
            .iter()
            .zip(teacher.data().iter().zip(student.data().iter()))
            .map(|(x, (t, s))| {
                let drift = (t - s) * x;
                drift * drift
            })
            .collect::<Vec<_>>();

        Ok(mean(&differences))
    }
}
