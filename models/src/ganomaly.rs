use anyhow::{anyhow, Result};
use common::{column_stats, dot, mean, Config, ConfigLoader};
use engine::{AnomalyModule, StateDict, Tensor};
use serde::{Deserialize, Serialize};

use super::init;

#[derive(Serialize, Deserialize, Debug)]
pub struct GanomalyOptions {
    pub latent_vec_size: usize,
    pub wadv: f32,
    pub wcon: f32,
    pub wenc: f32,
    pub embedding_dim: usize,
}

impl Config for GanomalyOptions {
    fn load(config: &ConfigLoader) -> Result<Self> {
        Ok(Self {
            latent_vec_size: config
                .get("latent_vec_size")
                .and_then(|v| v.as_usize())
                .unwrap_or(100)
                .max(1),
            wadv: config.get("wadv").and_then(|v| v.as_f32()).unwrap_or(1.0),
            wcon: config.get("wcon").and_then(|v| v.as_f32()).unwrap_or(50.0),
            wenc: config.get("wenc").and_then(|v| v.as_f32()).unwrap_or(1.0),
            embedding_dim: config
                .get("embedding_dim")
                .and_then(|v| v.as_usize())
                .unwrap_or(256),
        })
    }
}

/// Generative adversarial scoring. The generator encodes a centered sample
/// into a latent vector, reconstructs it, and re-encodes the reconstruction.
/// Normal samples survive the round trip, anomalous ones drift in latent
/// space and reconstruct poorly.
pub struct GanomalyLightning {
    options: GanomalyOptions,
    parameters: StateDict,
}

impl GanomalyLightning {
    pub fn new(config: &ConfigLoader) -> Result<Self> {
        let options: GanomalyOptions = config.load()?;
        let mut rng = init::seeded_rng(config);

        let latent = options.latent_vec_size;
        let dim = options.embedding_dim;

        let encoder = init::normal_weights(&mut rng, latent * dim, 0.0, 1.0 / (dim as f32).sqrt())?;
        let mut decoder = vec![0.0; dim * latent];
        for j in 0..latent {
            for i in 0..dim {
                decoder[i * latent + j] = encoder[j * dim + i];
            }
        }

        let mut parameters = StateDict::new();
        parameters.insert("generator.encoder", Tensor::new(vec![latent, dim], encoder));
        parameters.insert("generator.decoder", Tensor::new(vec![dim, latent], decoder));
        parameters.insert("discriminator.weight", Tensor::zeros(vec![dim]));

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

fn matvec(matrix: &Tensor, vector: &[f32]) -> Vec<f32> {
    matrix.rows().map(|row| dot(row, vector)).collect()
}

impl AnomalyModule for GanomalyLightning {
    fn name(&self) -> &'static str {
        "GanomalyLightning"
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

        self.parameters
            .insert("discriminator.weight", Tensor::from_vec(means));

        Ok(())
    }

    fn score(&self, sample: &Tensor) -> Result<f32> {
        self.check_sample(sample)?;

        let encoder = self.parameters.tensor("generator.encoder");
        let decoder = self.parameters.tensor("generator.decoder");
        let center = self.parameters.tensor("discriminator.weight");

        let centered = sample
            .data()
            .iter()
            .zip(center.data().iter())
            .map(|(x, m)| x - m)
            .collect::<Vec<_>>();

        let latent = matvec(encoder, &centered);
        let reconstruction = matvec(decoder, &latent);
        let latent_again = matvec(encoder, &reconstruction);

        let enc_error = latent
            .iter()
            .zip(latent_again.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            / latent.len().max(1) as f32;
        let con_error = mean(
            &centered
                .iter()
                .zip(reconstruction.iter())
                .map(|(c, r)| (c - r).abs())
                .collect::<Vec<_>>(),
        );
        let adv_error = mean(&centered.iter().map(|c| c * c).collect::<Vec<_>>());

        let options = &self.options;
        Ok(options.wenc * enc_error + options.wcon * con_error + options.wadv * adv_error)
    }
}
