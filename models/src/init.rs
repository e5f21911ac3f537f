use anyhow::Result;
use common::ConfigLoader;
use rand::prelude::{Distribution, SeedableRng, StdRng};
use rand_distr::Normal;

// All randomized parameters are derived from the project seed so that
// constructing the same model from the same config is repeatable.
pub fn seeded_rng(config: &ConfigLoader) -> StdRng {
    let seed = config
        .get("project.seed")
        .and_then(|v| v.as_usize())
        .unwrap_or(0);

    StdRng::seed_from_u64(seed as u64)
}

pub fn normal_weights(rng: &mut StdRng, len: usize, mean: f32, std: f32) -> Result<Vec<f32>> {
    let normal = Normal::new(mean, std)?;

    Ok((0..len).map(|_| normal.sample(rng)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_weights() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);

        assert_eq!(
            normal_weights(&mut a, 16, 0.0, 1.0).unwrap(),
            normal_weights(&mut b, 16, 0.0, 1.0).unwrap()
        );
    }

    #[test]
    fn test_different_seeds_differ() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(8);

        assert_ne!(
            normal_weights(&mut a, 16, 0.0, 1.0).unwrap(),
            normal_weights(&mut b, 16, 0.0, 1.0).unwrap()
        );
    }
}
