use anyhow::{anyhow, Result};

// Channel widths of the feature layers of the supported torchvision backbones.
const RESNET18_DIMS: [(&str, usize); 4] = [
    ("layer1", 64),
    ("layer2", 128),
    ("layer3", 256),
    ("layer4", 512),
];

const WIDE_RESNET50_2_DIMS: [(&str, usize); 4] = [
    ("layer1", 256),
    ("layer2", 512),
    ("layer3", 1024),
    ("layer4", 2048),
];

pub fn layer_dim(backbone: &str, layer: &str) -> Result<usize> {
    let dims = match backbone {
        "resnet18" => &RESNET18_DIMS,
        "wide_resnet50_2" => &WIDE_RESNET50_2_DIMS,
        _ => return Err(anyhow!("Unsupported backbone {}", backbone)),
    };

    dims.iter()
        .find(|(name, _)| *name == layer)
        .map(|(_, dim)| *dim)
        .ok_or_else(|| anyhow!("Backbone {} has no layer {}", backbone, layer))
}

// The embedding a model sees is the concatenation of the configured layers.
pub fn embedding_dim(backbone: &str, layers: &[String]) -> Result<usize> {
    let mut dim = 0;
    for layer in layers {
        dim += layer_dim(backbone, layer)?;
    }

    Ok(dim)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_dims() {
        assert_eq!(layer_dim("resnet18", "layer1").unwrap(), 64);
        assert_eq!(layer_dim("wide_resnet50_2", "layer4").unwrap(), 2048);
    }

    #[test]
    fn test_embedding_dim_sums_layers() {
        let layers = vec![
            "layer1".to_string(),
            "layer2".to_string(),
            "layer3".to_string(),
        ];

        assert_eq!(embedding_dim("resnet18", &layers).unwrap(), 448);
        assert_eq!(embedding_dim("wide_resnet50_2", &layers).unwrap(), 1792);
    }

    #[test]
    fn test_unknown_backbone_is_rejected() {
        assert!(layer_dim("vgg16", "layer1").is_err());
        assert!(layer_dim("resnet18", "layer9").is_err());
    }
}
