use std::path::PathBuf;

use engine::WeightsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown model {name}!")]
    UnsupportedModel { name: String },

    #[error("model {name} resolved to class {found}, expected {expected}")]
    Resolution {
        name: String,
        expected: String,
        found: String,
    },

    #[error("could not load weights for model {name} from {path:?}")]
    WeightLoad {
        name: String,
        path: PathBuf,
        #[source]
        source: WeightsError,
    },

    #[error("config has no model.name entry")]
    MissingModelName,

    #[error("could not construct model {name}")]
    Construct {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}
