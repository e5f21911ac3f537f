use std::path::{Path, PathBuf};

use common::{ConfigLoader, FsExt};
use engine::{AnomalyModule, Checkpoint, LoadReport, WeightsError};
use log::{debug, warn};

use super::error::ModelError;
use super::registry;

/// Builds the model named by `model.name` and, when the configuration asks
/// for it, hydrates the parameters from a checkpoint on disk.
pub fn get_model(config: &ConfigLoader) -> Result<Box<dyn AnomalyModule>, ModelError> {
    let name = config
        .get("name")
        .and_then(|v| v.as_string())
        .ok_or(ModelError::MissingModelName)?;

    let entry = registry::find_entry(&name).ok_or_else(|| ModelError::UnsupportedModel {
        name: name.clone(),
    })?;

    let mut model = entry
        .build(config)
        .map_err(|source| ModelError::Construct {
            name: name.clone(),
            source,
        })?;

    let expected = format!("{}Lightning", registry::snake_to_pascal_case(&name));
    if model.name() != expected {
        return Err(ModelError::Resolution {
            name,
            expected,
            found: model.name().to_string(),
        });
    }
    debug!("Resolved model {} to {}", name, expected);

    let requested = requested_weights(config).map_err(|source| ModelError::WeightLoad {
        name: name.clone(),
        path: base_dir(config),
        source,
    })?;

    if let Some(relative) = requested {
        let path = base_dir(config).join(relative);
        let path = path.relative_to_cwd().unwrap_or(path);

        let report =
            load_weights(model.as_mut(), &path).map_err(|source| ModelError::WeightLoad {
                name: name.clone(),
                path: path.clone(),
                source,
            })?;

        if !report.is_clean() {
            warn!(
                "Checkpoint for {} left {} parameters untouched and carried {} unknown entries",
                name,
                report.missing_keys.len(),
                report.unexpected_keys.len()
            );
        }
    }

    Ok(model)
}

// Older configs put the checkpoint path directly in init_weights, newer ones
// set a boolean alongside weights_path. Both spellings are honored.
fn requested_weights(config: &ConfigLoader) -> Result<Option<String>, WeightsError> {
    let value = match config.get("init_weights") {
        Some(value) => value,
        None => return Ok(None),
    };

    if let Some(enabled) = value.as_bool() {
        if !enabled {
            return Ok(None);
        }

        return match config.get("weights_path").and_then(|v| v.as_string()) {
            Some(path) if !path.is_empty() => Ok(Some(path)),
            _ => Err(WeightsError::PathUnset),
        };
    }

    match value.as_string() {
        Some(path) if !path.is_empty() => Ok(Some(path)),
        _ => Err(WeightsError::PathUnset),
    }
}

fn base_dir(config: &ConfigLoader) -> PathBuf {
    config
        .get("project.path")
        .and_then(|v| v.as_string())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn load_weights(
    model: &mut dyn AnomalyModule,
    path: &Path,
) -> Result<LoadReport, WeightsError> {
    let checkpoint = Checkpoint::load(path)?;
    debug!(
        "Applying {} checkpoint parameters to {}",
        checkpoint.state_dict.len(),
        model.name()
    );

    let report = model.load_state_dict(&checkpoint.state_dict, false)?;
    Ok(report)
}
