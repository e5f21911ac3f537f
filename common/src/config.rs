use std::{collections::HashMap, path::Path};

use anyhow::{Context, Result};
use hocon::{Hocon, HoconLoader};
use log::debug;

#[derive(Debug)]
pub struct ConfigLoader {
    hocon: Hocon,
    env: HashMap<String, String>,
    scope: String,
}

impl ConfigLoader {
    pub fn new(path: impl AsRef<Path>, scope: String) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from {:?}", path);

        let env = std::env::vars().collect::<HashMap<_, _>>();

        let hocon = HoconLoader::new()
            .load_file(path)
            .with_context(|| format!("Failed to find or load config file at: {:?}", path))?
            .hocon()?;

        Ok(Self { hocon, env, scope })
    }

    pub fn from_str(content: &str, scope: String) -> Result<Self> {
        let env = std::env::vars().collect::<HashMap<_, _>>();

        let hocon = HoconLoader::new()
            .load_str(content)
            .context("Failed to parse config")?
            .hocon()?;

        Ok(Self { hocon, env, scope })
    }

    // Lookup order is env var, then the scoped section, then the document root.
    // Names may be dotted paths into nested sections.
    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.env.get(name) {
            return Some(Value::String(value.clone()));
        }

        let scope = &self.hocon[self.scope.as_str()];
        if matches!(scope, Hocon::Hash(_)) {
            if let Some(value) = Self::map_hocon(scope, name) {
                return Some(value);
            }
        }

        Self::map_hocon(&self.hocon, name)
    }

    pub fn load<T: Config>(&self) -> Result<T> {
        let res = T::load(self)?;
        Ok(res)
    }

    fn map_hocon(hocon: &Hocon, name: &str) -> Option<Value> {
        let mut node = hocon;
        for part in name.split('.') {
            node = &node[part];
        }

        Self::map_value(node)
    }

    fn map_value(hocon: &Hocon) -> Option<Value> {
        match hocon {
            Hocon::Real(f64) => Some(Value::Float(*f64 as f32)),
            Hocon::Integer(i64) => Some(Value::Integer(*i64 as usize)),
            Hocon::String(string) => Some(Value::String(string.clone())),
            Hocon::Boolean(bool) => Some(Value::Boolean(*bool)),
            Hocon::Array(items) => Some(Value::Array(
                items.iter().filter_map(Self::map_value).collect(),
            )),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum Value {
    String(String),
    Integer(usize),
    Float(f32),
    Boolean(bool),
    Array(Vec<Value>),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(val) => Some(*val),
            Value::String(val) => Hocon::String(val.clone()).as_bool(),
            _ => None,
        }
    }

    pub fn as_usize(&self) -> Option<usize> {
        match self {
            Value::Integer(val) => Some(*val),
            Value::String(val) => val.parse::<usize>().ok(),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::Float(val) => Some(*val),
            Value::Integer(val) => Some(*val as f32),
            Value::String(val) => val.parse::<f32>().ok(),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<String> {
        match self {
            Value::String(val) => Some(val.clone()),
            Value::Boolean(true) => Some("true".to_string()),
            Value::Boolean(false) => Some("false".to_string()),
            Value::Float(val) => Some(val.to_string()),
            Value::Integer(val) => Some(val.to_string()),
            Value::Array(_) => None,
        }
    }

    pub fn as_string_vec(&self) -> Option<Vec<String>> {
        match self {
            Value::Array(items) => Some(items.iter().filter_map(|v| v.as_string()).collect()),
            Value::String(val) => Some(vec![val.clone()]),
            _ => None,
        }
    }
}

pub trait Config {
    fn load(config: &ConfigLoader) -> Result<Self>
    where
        Self: Sized;
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        model {
            name = padim
            backbone = resnet18
            layers = [layer1, layer2, layer3]
            init_weights = false
            pre_trained = true
        }

        project {
            seed = 42
            path = "./results/padim"
        }
    "#;

    fn loader() -> ConfigLoader {
        ConfigLoader::from_str(CONFIG, "model".to_string()).unwrap()
    }

    #[test]
    fn test_get_scoped_key() {
        let config = loader();

        let name = config.get("name").and_then(|v| v.as_string());

        assert_eq!(name, Some("padim".to_string()));
    }

    #[test]
    fn test_loads_a_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.conf");
        std::fs::write(&path, CONFIG).unwrap();

        let config = ConfigLoader::new(&path, "model".to_string()).unwrap();

        assert_eq!(
            config.get("name").and_then(|v| v.as_string()),
            Some("padim".to_string())
        );
    }

    #[test]
    fn test_missing_config_file_fails() {
        assert!(ConfigLoader::new("does_not_exist.conf", "model".to_string()).is_err());
    }

    #[test]
    fn test_get_dotted_path_from_root() {
        let config = loader();

        let seed = config.get("project.seed").and_then(|v| v.as_usize());
        let path = config.get("project.path").and_then(|v| v.as_string());

        assert_eq!(seed, Some(42));
        assert_eq!(path, Some("./results/padim".to_string()));
    }

    #[test]
    fn test_get_missing_key_is_none() {
        let config = loader();

        assert!(config.get("does_not_exist").is_none());
        assert!(config.get("project.does_not_exist").is_none());
    }

    #[test]
    fn test_get_string_list() {
        let config = loader();

        let layers = config.get("layers").and_then(|v| v.as_string_vec());

        assert_eq!(
            layers,
            Some(vec![
                "layer1".to_string(),
                "layer2".to_string(),
                "layer3".to_string()
            ])
        );
    }

    #[test]
    fn test_bool_values() {
        let config = loader();

        assert_eq!(config.get("init_weights").and_then(|v| v.as_bool()), Some(false));
        assert_eq!(config.get("pre_trained").and_then(|v| v.as_bool()), Some(true));
    }

    #[test]
    fn test_value_coercions() {
        assert_eq!(Value::String("8".to_string()).as_usize(), Some(8));
        assert_eq!(Value::String("1.9".to_string()).as_f32(), Some(1.9));
        assert_eq!(Value::String("true".to_string()).as_bool(), Some(true));
        assert_eq!(Value::Integer(3).as_f32(), Some(3.0));
        assert_eq!(
            Value::String("layer3".to_string()).as_string_vec(),
            Some(vec!["layer3".to_string()])
        );
    }
}
