use std::collections::BTreeMap;

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::tensor::Tensor;

/// Named parameter tensors, ordered by name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateDict {
    tensors: BTreeMap<String, Tensor>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    // The parameter set of a model is fixed at construction, so a missing
    // name here is a programming error rather than a recoverable one.
    pub fn tensor(&self, name: &str) -> &Tensor {
        self.get(name)
            .unwrap_or_else(|| panic!("Missing parameter {}", name))
    }

    pub fn tensor_mut(&mut self, name: &str) -> &mut Tensor {
        self.tensors
            .get_mut(name)
            .unwrap_or_else(|| panic!("Missing parameter {}", name))
    }

    // Merges the incoming parameters into this state dict.
    //
    // When strict, the key sets and tensor shapes must match exactly and
    // nothing is modified on failure. Otherwise matching names are replaced
    // by the incoming tensors and the names that did not line up are
    // reported back to the caller.
    pub fn apply(
        &mut self,
        incoming: &StateDict,
        strict: bool,
    ) -> Result<LoadReport, StateDictError> {
        let missing_keys = self
            .keys()
            .filter(|k| !incoming.contains(k))
            .map(|k| k.to_string())
            .collect::<Vec<_>>();
        let unexpected_keys = incoming
            .keys()
            .filter(|k| !self.contains(k))
            .map(|k| k.to_string())
            .collect::<Vec<_>>();

        if strict {
            if !missing_keys.is_empty() || !unexpected_keys.is_empty() {
                return Err(StateDictError::IncompatibleKeys {
                    missing_keys,
                    unexpected_keys,
                });
            }

            for (name, tensor) in incoming.iter() {
                let expected = self.tensor(name).shape();
                if expected != tensor.shape() {
                    return Err(StateDictError::ShapeMismatch {
                        name: name.to_string(),
                        expected: expected.to_vec(),
                        found: tensor.shape().to_vec(),
                    });
                }
            }
        }

        for (name, tensor) in incoming.iter() {
            if let Some(existing) = self.tensors.get_mut(name) {
                if existing.shape() != tensor.shape() {
                    warn!(
                        "Parameter {} changed shape from {:?} to {:?}",
                        name,
                        existing.shape(),
                        tensor.shape()
                    );
                }
                *existing = tensor.clone();
            }
        }

        Ok(LoadReport {
            missing_keys,
            unexpected_keys,
        })
    }
}

/// Names that did not line up while merging parameters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadReport {
    pub missing_keys: Vec<String>,
    pub unexpected_keys: Vec<String>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.missing_keys.is_empty() && self.unexpected_keys.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum StateDictError {
    #[error("state dict keys do not match: missing {missing_keys:?}, unexpected {unexpected_keys:?}")]
    IncompatibleKeys {
        missing_keys: Vec<String>,
        unexpected_keys: Vec<String>,
    },

    #[error("parameter {name} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
}
