use anyhow::{anyhow, Result};
use common::{euclidean, mean, Config, ConfigLoader};
use engine::{AnomalyModule, StateDict, Tensor};
use serde::{Deserialize, Serialize};

use super::backbone;

#[derive(Serialize, Deserialize, Debug)]
pub struct PatchcoreOptions {
    pub backbone: String,
    pub layers: Vec<String>,
    pub coreset_sampling_ratio: f32,
    pub num_neighbors: usize,
    pub embedding_dim: usize,
}

impl Config for PatchcoreOptions {
    fn load(config: &ConfigLoader) -> Result<Self> {
        let backbone = config
            .get("backbone")
            .and_then(|v| v.as_string())
            .unwrap_or_else(|| "wide_resnet50_2".to_string());
        let layers = config
            .get("layers")
            .and_then(|v| v.as_string_vec())
            .unwrap_or_else(|| vec!["layer2".to_string(), "layer3".to_string()]);
        let embedding_dim = match config.get("embedding_dim").and_then(|v| v.as_usize()) {
            Some(dim) => dim,
            None => backbone::embedding_dim(&backbone, &layers)?,
        };

        Ok(Self {
            backbone,
            layers,
            coreset_sampling_ratio: config
                .get("coreset_sampling_ratio")
                .and_then(|v| v.as_f32())
                .unwrap_or(0.1),
            num_neighbors: config
                .get("num_neighbors")
                .and_then(|v| v.as_usize())
                .unwrap_or(9)
                .max(1),
            embedding_dim,
        })
    }
}

/// Memory bank scoring over a coreset of training embeddings. Fitting keeps a
/// small, maximally spread subset of the batch and scoring averages the
/// distances to the nearest stored neighbors.
pub struct PatchcoreLightning {
    options: PatchcoreOptions,
    parameters: StateDict,
}

impl PatchcoreLightning {
    pub fn new(config: &ConfigLoader) -> Result<Self> {
        let options: PatchcoreOptions = config.load()?;

        let mut parameters = StateDict::new();
        parameters.insert("memory_bank", Tensor::zeros(vec![0, options.embedding_dim]));

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

/// Greedy farthest point selection. Starts from the first row and repeatedly
/// adds the row farthest from everything selected so far.
fn coreset_indices(rows: &[&[f32]], target: usize) -> Vec<usize> {
    let mut selected = vec![0];
    let mut min_distances = rows
        .iter()
        .map(|row| euclidean(row, rows[0]))
        .collect::<Vec<_>>();

    while selected.len() < target {
        let mut farthest = 0;
        for (i, distance) in min_distances.iter().enumerate() {
            if *distance > min_distances[farthest] {
                farthest = i;
            }
        }

        selected.push(farthest);
        for (i, distance) in min_distances.iter_mut().enumerate() {
            *distance = distance.min(euclidean(rows[i], rows[farthest]));
        }
    }

    selected
}

impl AnomalyModule for PatchcoreLightning {
    fn name(&self) -> &'static str {
        "PatchcoreLightning"
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
            return Ok(());
        }

        let rows = batch.iter().map(|sample| sample.data()).collect::<Vec<_>>();
        let target = ((self.options.coreset_sampling_ratio * rows.len() as f32).ceil() as usize)
            .clamp(1, rows.len());

        let mut bank = Tensor::zeros(vec![0, self.options.embedding_dim]);
        for index in coreset_indices(&rows, target) {
            bank.push_row(rows[index]);
        }

        self.parameters.insert("memory_bank", bank);

        Ok(())
    }

    fn score(&self, sample: &Tensor) -> Result<f32> {
        self.check_sample(sample)?;

        let bank = self.parameters.tensor("memory_bank");
        if bank.num_rows() == 0 {
            return Err(anyhow!("The memory bank is empty. Fit the model first"));
        }

        let mut distances = bank
            .rows()
            .map(|row| euclidean(sample.data(), row))
            .collect::<Vec<_>>();
        distances.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let neighbors = self.options.num_neighbors.min(distances.len());
        Ok(mean(&distances[..neighbors]))
    }
}
