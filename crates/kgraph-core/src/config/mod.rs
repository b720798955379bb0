//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::application::{EnrichmentConfig, MaintenanceConfig};
use crate::domain::discovery::DiscoveryConfig;
use crate::domain::graph::{MetaPath, PathTemplate};
use crate::domain::resolution::ResolverConfig;
use crate::domain::search::SearchConfig;
use crate::error::{Error, Result};
use crate::storage::default_data_dir;

/// Environment variable overriding the config directory
pub const CONFIG_DIR_ENV: &str = "KGRAPH_CONFIG_DIR";

/// Sections in listing order
const SECTIONS: [&str; 7] = [
    "storage",
    "resolver",
    "search",
    "discovery",
    "maintenance",
    "enrichment",
    "patterns",
];

/// kgraph configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub storage: StorageConfig,
    pub resolver: ResolverConfig,
    pub search: SearchConfig,
    pub discovery: DiscoveryConfig,
    pub maintenance: MaintenanceConfig,
    pub enrichment: EnrichmentConfig,
    pub patterns: PatternConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for per-agent databases; platform data dir when unset
    pub data_dir: Option<PathBuf>,
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_connections: 5,
        }
    }
}

impl StorageConfig {
    /// Configured data directory, or the platform default
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }
}

/// Static meta-path patterns seeded into every agent's graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    pub static_patterns: Vec<StaticPattern>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticPattern {
    pub predicates: Vec<String>,
    pub weight: f64,
}

impl StaticPattern {
    fn new(predicates: &[&str], weight: f64) -> Self {
        Self {
            predicates: predicates.iter().map(|p| p.to_string()).collect(),
            weight,
        }
    }

    pub fn template(&self) -> Result<PathTemplate> {
        PathTemplate::parse(&self.predicates)
    }
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            static_patterns: vec![
                StaticPattern::new(&["knows", "works_on"], 0.8),
                StaticPattern::new(&["works_on", "part_of"], 0.7),
                StaticPattern::new(&["member_of", "located_in"], 0.6),
                StaticPattern::new(&["uses", "depends_on"], 0.6),
            ],
        }
    }
}

impl PatternConfig {
    /// Static patterns ready to seed for an agent
    pub fn seeds(&self, agent_id: &str) -> Result<Vec<MetaPath>> {
        self.static_patterns
            .iter()
            .map(|p| Ok(MetaPath::seeded(agent_id, p.template()?, p.weight)))
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        for pattern in &self.static_patterns {
            pattern.template().map_err(|e| {
                Error::ConfigError(format!("patterns.static_patterns: {}", e))
            })?;
            if !(0.0..=1.0).contains(&pattern.weight) {
                return Err(Error::ConfigError(format!(
                    "patterns.static_patterns: weight {} must be between 0.0 and 1.0",
                    pattern.weight
                )));
            }
        }
        Ok(())
    }
}

impl GraphConfig {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var(CONFIG_DIR_ENV) {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("kgraph")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: GraphConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        if self.storage.max_connections == 0 {
            return Err(Error::ConfigError(
                "storage.max_connections must be positive".to_string(),
            ));
        }
        self.resolver.validate()?;
        self.search.validate()?;
        self.discovery.validate()?;
        self.maintenance.validate()?;
        self.enrichment.validate()?;
        self.patterns.validate()
    }

    /// Get a configuration value by dotted key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        if key == "storage.data_dir" {
            return Ok(self.storage.resolved_data_dir().display().to_string());
        }

        let root = toml::Value::try_from(self).context("Failed to serialize config")?;
        let (section, field) = split_key(key)?;
        let value = root
            .get(section)
            .and_then(|s| s.get(field))
            .ok_or_else(|| unknown_key(key))?;

        Ok(render(value))
    }

    /// Set a configuration value by dotted key
    ///
    /// The value is parsed as the type the key already holds. The whole
    /// configuration is re-validated before the change is applied.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        if key == "storage.data_dir" {
            self.storage.data_dir = Some(PathBuf::from(value));
            return Ok(());
        }

        let mut root = toml::Value::try_from(&*self).context("Failed to serialize config")?;
        let (section, field) = split_key(key)?;
        let table = root
            .get_mut(section)
            .and_then(toml::Value::as_table_mut)
            .ok_or_else(|| unknown_key(key))?;
        let current = table.get(field).ok_or_else(|| unknown_key(key))?;

        let parsed = match current {
            toml::Value::Integer(_) => toml::Value::Integer(
                value
                    .parse()
                    .with_context(|| format!("Invalid integer for {}: {}", key, value))?,
            ),
            toml::Value::Float(_) => toml::Value::Float(
                value
                    .parse()
                    .with_context(|| format!("Invalid number for {}: {}", key, value))?,
            ),
            toml::Value::Boolean(_) => toml::Value::Boolean(
                value
                    .parse()
                    .with_context(|| format!("Invalid boolean for {}: {}", key, value))?,
            ),
            toml::Value::String(_) => toml::Value::String(value.to_string()),
            _ => {
                return Err(anyhow!(
                    "{} cannot be set from the command line; edit the config file instead",
                    key
                ));
            }
        };
        table.insert(field.to_string(), parsed);

        let updated: GraphConfig = root
            .try_into()
            .with_context(|| format!("Invalid value for {}: {}", key, value))?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let root = toml::Value::try_from(self).context("Failed to serialize config")?;
        let mut entries = vec![(
            "storage.data_dir".to_string(),
            self.storage.resolved_data_dir().display().to_string(),
        )];

        for section in SECTIONS {
            let Some(table) = root.get(section).and_then(toml::Value::as_table) else {
                continue;
            };
            for (field, value) in table {
                if section == "storage" && field == "data_dir" {
                    continue;
                }
                entries.push((format!("{}.{}", section, field), render(value)));
            }
        }
        Ok(entries)
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}

fn split_key(key: &str) -> anyhow::Result<(&str, &str)> {
    key.split_once('.').ok_or_else(|| unknown_key(key))
}

fn unknown_key(key: &str) -> anyhow::Error {
    anyhow!(
        "Unknown configuration key: {}. Use `kgraph config list` to see available keys.",
        key
    )
}

fn render(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(render).collect();
            format!("[{}]", rendered.join(", "))
        }
        toml::Value::Table(table) => {
            let rendered: Vec<String> = table
                .iter()
                .map(|(k, v)| format!("{} = {}", k, render(v)))
                .collect();
            format!("{{ {} }}", rendered.join(", "))
        }
        other => other.to_string(),
    }
}
