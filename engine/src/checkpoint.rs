use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::state_dict::{StateDict, StateDictError};

/// A persisted training snapshot. The parameters live under a top level
/// `state_dict` entry, serialized as gzipped json.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub state_dict: StateDict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_step: Option<u64>,
}

impl Checkpoint {
    pub fn new(state_dict: StateDict) -> Self {
        Self {
            state_dict,
            epoch: None,
            global_step: None,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, WeightsError> {
        let path = path.as_ref();
        debug!("Reading checkpoint from {:?}", path);

        let file = File::open(path).map_err(|source| WeightsError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let content = GzDecoder::new(file);
        let checkpoint: Checkpoint =
            serde_json::from_reader(content).map_err(|source| WeightsError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;

        for (name, tensor) in checkpoint.state_dict.iter() {
            if !tensor.is_consistent() {
                return Err(WeightsError::InconsistentTensor {
                    path: path.to_path_buf(),
                    name: name.to_string(),
                });
            }
        }

        Ok(checkpoint)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), WeightsError> {
        let path = path.as_ref();
        debug!("Writing checkpoint to {:?}", path);

        let file = File::create(path).map_err(|source| WeightsError::Create {
            path: path.to_path_buf(),
            source,
        })?;
        let compressor = GzEncoder::new(file, Compression::default());
        serde_json::to_writer(compressor, self).map_err(|source| WeightsError::Encode {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum WeightsError {
    #[error("could not open weights file {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not create weights file {path:?}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("weights file {path:?} is not a valid checkpoint")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not serialize checkpoint to {path:?}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("weights file {path:?} holds an inconsistent tensor {name}")]
    InconsistentTensor { path: PathBuf, name: String },

    #[error("init_weights is set but no weights file is configured")]
    PathUnset,

    #[error(transparent)]
    Apply(#[from] StateDictError),
}
