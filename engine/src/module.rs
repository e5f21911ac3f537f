use anyhow::Result;

use super::state_dict::{LoadReport, StateDict, StateDictError};
use super::tensor::Tensor;

/// A trainable anomaly detection model backed by a set of named parameters.
pub trait AnomalyModule {
    /// The class name of the model, e.g. `PadimLightning`.
    fn name(&self) -> &'static str;

    fn parameters(&self) -> &StateDict;

    fn parameters_mut(&mut self) -> &mut StateDict;

    fn state_dict(&self) -> StateDict {
        self.parameters().clone()
    }

    fn load_state_dict(
        &mut self,
        state_dict: &StateDict,
        strict: bool,
    ) -> Result<LoadReport, StateDictError> {
        self.parameters_mut().apply(state_dict, strict)
    }

    fn fit(&mut self, batch: &[Tensor]) -> Result<()>;

    // Higher scores are more anomalous.
    fn score(&self, sample: &Tensor) -> Result<f32>;
}
