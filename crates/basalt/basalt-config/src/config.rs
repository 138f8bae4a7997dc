use serde::Deserialize;
use std::path::Path;

#[derive(Deserialize, Debug)]
pub struct BasaltConfig {
    #[serde(default = "defaults::cells")]
    pub cells: usize,
    /// "value32" or "clk48"
    #[serde(default = "defaults::mode")]
    pub mode: String,
    /// "aos" or "soa"
    #[serde(default = "defaults::layout")]
    pub layout: String,
    /// NUMA node to pin the cell array to; omit for unpinned.
    #[serde(default)]
    pub numa_node: Option<u32>,
    #[serde(default = "defaults::region_size")]
    pub region_size: usize,
    #[serde(default = "defaults::queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
}

mod defaults {
    pub fn cells() -> usize {
        1 << 16 // 65536
    }

    pub fn mode() -> String {
        "value32".into()
    }

    pub fn layout() -> String {
        "aos".into()
    }

    pub fn region_size() -> usize {
        1 << 10
    }

    pub fn queue_capacity() -> usize {
        1 << 14
    }

    pub fn log_level() -> String {
        "info".into()
    }
}

impl Default for BasaltConfig {
    fn default() -> Self {
        Self {
            cells: defaults::cells(),
            mode: defaults::mode(),
            layout: defaults::layout(),
            numa_node: None,
            region_size: defaults::region_size(),
            queue_capacity: defaults::queue_capacity(),
            log_level: defaults::log_level(),
        }
    }
}

impl BasaltConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config: BasaltConfig = toml::from_str(&raw)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_the_defaults() {
        let c: BasaltConfig = toml::from_str("").unwrap();
        assert_eq!(c.cells, 1 << 16);
        assert_eq!(c.mode, "value32");
        assert_eq!(c.layout, "aos");
        assert_eq!(c.numa_node, None);
        assert_eq!(c.queue_capacity, 1 << 14);
    }

    #[test]
    fn fields_override_the_defaults() {
        let c: BasaltConfig = toml::from_str(
            r#"
            cells = 1024
            layout = "soa"
            numa_node = 1
            log_level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(c.cells, 1024);
        assert_eq!(c.layout, "soa");
        assert_eq!(c.numa_node, Some(1));
        assert_eq!(c.log_level, "debug");
        assert_eq!(c.mode, "value32");
    }

    #[test]
    fn missing_file_surfaces_the_path() {
        let err = BasaltConfig::load("/nonexistent/basalt.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("/nonexistent/basalt.toml"));
    }
}
