use anyhow::Result;
use common::ConfigLoader;
use engine::AnomalyModule;

use super::cflow::CflowLightning;
use super::dfkde::DfkdeLightning;
use super::dfm::DfmLightning;
use super::draem::DraemLightning;
use super::fastflow::FastflowLightning;
use super::ganomaly::GanomalyLightning;
use super::padim::PadimLightning;
use super::patchcore::PatchcoreLightning;
use super::reverse_distillation::ReverseDistillationLightning;
use super::stfpm::StfpmLightning;

pub struct ModelEntry {
    pub name: &'static str,
    build: fn(&ConfigLoader) -> Result<Box<dyn AnomalyModule>>,
}

impl ModelEntry {
    pub fn build(&self, config: &ConfigLoader) -> Result<Box<dyn AnomalyModule>> {
        (self.build)(config)
    }
}

/// Every available model, ordered by configuration name.
pub const REGISTRY: &[ModelEntry] = &[
    ModelEntry {
        name: "cflow",
        build: |config| Ok(Box::new(CflowLightning::new(config)?)),
    },
    ModelEntry {
        name: "dfkde",
        build: |config| Ok(Box::new(DfkdeLightning::new(config)?)),
    },
    ModelEntry {
        name: "dfm",
        build: |config| Ok(Box::new(DfmLightning::new(config)?)),
    },
    ModelEntry {
        name: "draem",
        build: |config| Ok(Box::new(DraemLightning::new(config)?)),
    },
    ModelEntry {
        name: "fastflow",
        build: |config| Ok(Box::new(FastflowLightning::new(config)?)),
    },
    ModelEntry {
        name: "ganomaly",
        build: |config| Ok(Box::new(GanomalyLightning::new(config)?)),
    },
    ModelEntry {
        name: "padim",
        build: |config| Ok(Box::new(PadimLightning::new(config)?)),
    },
    ModelEntry {
        name: "patchcore",
        build: |config| Ok(Box::new(PatchcoreLightning::new(config)?)),
    },
    ModelEntry {
        name: "reverse_distillation",
        build: |config| Ok(Box::new(ReverseDistillationLightning::new(config)?)),
    },
    ModelEntry {
        name: "stfpm",
        build: |config| Ok(Box::new(StfpmLightning::new(config)?)),
    },
];

pub fn find_entry(name: &str) -> Option<&'static ModelEntry> {
    REGISTRY.iter().find(|entry| entry.name == name)
}

pub fn model_names() -> Vec<&'static str> {
    REGISTRY.iter().map(|entry| entry.name).collect()
}

/// Maps a configuration name like `reverse_distillation` onto the
/// `ReverseDistillation` class prefix. Each segment is capitalized, so any
/// characters past the first are lowercased.
pub fn snake_to_pascal_case(name: &str) -> String {
    name.split('_')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => std::iter::once(first.to_ascii_uppercase())
                    .chain(chars.map(|c| c.to_ascii_lowercase()))
                    .collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}
