use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::registry::{EntitySchema, ResourceDescriptor, ResourceRegistry, DEFAULT_CACHE_TIME};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Prefix of every endpoint, e.g. `https://api.example.com/v1`
  pub base_url: String,
  /// Sort attribute for resources that do not set `order`
  pub default_order: Option<String>,
  /// Environment variable holding a bearer token
  pub token_env: Option<String>,
  /// Where the object store, ledger and logs live
  pub data_dir: Option<PathBuf>,
  #[serde(default)]
  pub entities: Vec<EntitySchema>,
  #[serde(default)]
  pub resources: Vec<ResourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
  pub key: String,
  pub endpoint: String,
  /// Single target entity type
  pub entity: Option<String>,
  /// Candidate entity types for polymorphic resources
  #[serde(default)]
  pub entities: Vec<String>,
  pub order: Option<String>,
  /// Seconds a cached request stays fresh
  #[serde(default = "default_cache_time")]
  pub cache_time: u64,
  /// Item field naming the entity type of polymorphic items
  pub selector_field: Option<String>,
}

fn default_cache_time() -> u64 {
  DEFAULT_CACHE_TIME
}

impl ResourceConfig {
  fn descriptor(&self) -> Result<ResourceDescriptor> {
    let mut descriptor = match (&self.entity, self.entities.is_empty()) {
      (Some(entity), true) => ResourceDescriptor::new(&self.key, &self.endpoint, entity),
      (None, _) => ResourceDescriptor::polymorphic(&self.key, &self.endpoint, self.entities.clone()),
      (Some(_), false) => {
        return Err(eyre!(
          "Resource {} sets both entity and entities",
          self.key
        ))
      }
    };

    descriptor = descriptor.cache_for(self.cache_time);
    if let Some(order) = &self.order {
      descriptor = descriptor.sorted_by(order);
    }
    if let Some(field) = self.selector_field.clone() {
      descriptor = descriptor.select_with(move |item| item.get(&field)?.as_str().map(String::from));
    }
    Ok(descriptor)
  }
}

impl FromStr for Config {
  type Err = color_eyre::Report;

  fn from_str(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }
}

impl Config {
  /// Load configuration from `explicit_path`, or the first file found in
  /// `./refetch.yaml` then `$XDG_CONFIG_HOME/refetch/config.yaml`.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = match explicit_path {
      Some(p) if p.exists() => p.to_path_buf(),
      Some(p) => return Err(eyre!("Config file not found: {}", p.display())),
      None => Self::search_paths()
        .into_iter()
        .find(|p| p.exists())
        .ok_or_else(|| {
          eyre!("No configuration file found. Create one at ~/.config/refetch/config.yaml")
        })?,
    };

    std::fs::read_to_string(&path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?
      .parse()
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("refetch.yaml")];
    paths.extend(dirs::config_dir().map(|dir| dir.join("refetch").join("config.yaml")));
    paths
  }

  /// Build the validated resource registry.
  pub fn registry(&self) -> Result<ResourceRegistry> {
    let mut registry = ResourceRegistry::new(self.default_order.clone());
    registry.register_entities(self.entities.iter().cloned())?;

    let descriptors = self
      .resources
      .iter()
      .map(ResourceConfig::descriptor)
      .collect::<Result<Vec<_>>>()?;
    registry.register(descriptors)?;

    Ok(registry)
  }

  /// Bearer token from `token_env`, falling back to REFETCH_TOKEN.
  /// `None` means requests go out unauthenticated.
  pub fn api_token(&self) -> Option<String> {
    self
      .token_env
      .as_deref()
      .and_then(|name| std::env::var(name).ok())
      .or_else(|| std::env::var("REFETCH_TOKEN").ok())
      .filter(|token| !token.is_empty())
  }

  /// Data directory: configured, else the platform data dir.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }
    dirs::data_dir()
      .map(|dir| dir.join("refetch"))
      .ok_or_else(|| eyre!("Could not determine data directory"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::registry::{AttributeKind, TargetTypes};
  use serde_json::json;

  const SAMPLE: &str = r#"
base_url: https://api.example.com/v1
default_order: id
token_env: EXAMPLE_TOKEN
entities:
  - name: Post
    identity: id
    attributes:
      - { name: id, kind: integer }
      - { name: title, kind: string, required: true }
      - { name: publishedAt, kind: date, json_key: published_at }
  - name: Photo
    identity: id
    attributes:
      - { name: id, kind: integer }
resources:
  - key: posts
    endpoint: /posts
    entity: Post
    order: publishedAt
    cache_time: 60
  - key: feed
    endpoint: /feed
    entities: [Post, Photo]
    selector_field: type
"#;

  #[test]
  fn test_parse_config() {
    let config = SAMPLE.parse::<Config>().unwrap();
    assert_eq!(config.base_url, "https://api.example.com/v1");
    assert_eq!(config.entities.len(), 2);
    assert_eq!(config.entities[0].attributes[2].kind, AttributeKind::Date);
    assert_eq!(config.entities[0].attributes[2].json_key(), "published_at");
    assert!(config.entities[0].attributes[1].required);
    assert_eq!(config.resources[1].cache_time, DEFAULT_CACHE_TIME);
  }

  #[test]
  fn test_registry_from_config() {
    let registry = SAMPLE.parse::<Config>().unwrap().registry().unwrap();

    let posts = registry.resolve("posts").unwrap();
    assert_eq!(posts.cache_ttl_secs, 60);
    assert_eq!(registry.sort_attribute(&posts), Some("publishedAt"));

    let feed = registry.resolve("feed").unwrap();
    assert_eq!(
      feed.targets,
      TargetTypes::Many(vec!["Post".into(), "Photo".into()])
    );
    assert_eq!(registry.sort_attribute(&feed), Some("id"));
    assert_eq!(
      feed.select_entity(&json!({"type": "Photo", "id": 1})),
      Some("Photo".to_string())
    );
  }

  #[test]
  fn test_unknown_entity_is_rejected() {
    let yaml = r#"
base_url: https://api.example.com
resources:
  - key: posts
    endpoint: /posts
    entity: Post
"#;
    let config = yaml.parse::<Config>().unwrap();
    assert!(config.registry().is_err());
  }

  #[test]
  fn test_entity_and_entities_conflict() {
    let yaml = r#"
base_url: https://api.example.com
entities:
  - { name: Post, identity: id }
resources:
  - { key: posts, endpoint: /posts, entity: Post, entities: [Post] }
"#;
    let config = yaml.parse::<Config>().unwrap();
    assert!(config.registry().is_err());
  }

  #[test]
  fn test_invalid_yaml_is_error() {
    assert!("base_url: [".parse::<Config>().is_err());
  }

  #[test]
  fn test_search_paths_prefer_working_directory() {
    let paths = Config::search_paths();
    assert_eq!(paths[0], PathBuf::from("refetch.yaml"));
    assert!(paths.iter().skip(1).all(|p| p.ends_with("refetch/config.yaml")));
  }

  #[test]
  fn test_explicit_missing_path_is_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Config::load(Some(&dir.path().join("missing.yaml"))).is_err());
  }

  #[test]
  fn test_load_from_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("refetch.yaml");
    std::fs::write(&path, SAMPLE).unwrap();
    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.resources.len(), 2);

    let broken = dir.path().join("broken.yaml");
    std::fs::write(&broken, "base_url: [").unwrap();
    let err = Config::load(Some(&broken)).unwrap_err().to_string();
    assert!(err.contains("Failed to parse config file"));
    assert!(err.contains("broken.yaml"));

    let config = Config {
      data_dir: Some(dir.path().to_path_buf()),
      ..config
    };
    assert_eq!(config.data_dir().unwrap(), dir.path());
  }
}
