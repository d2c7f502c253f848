//! Resolves a config name to a path under `~/.config/evdev_transformer/`,
//! parses it as JSON, and validates it.

use std::path::PathBuf;

use crate::error::ConfigError;
use crate::model::Config;

/// Resolve `<config_name>` to `~/.config/evdev_transformer/<config_name>.json`.
pub fn config_path(config_name: &str) -> PathBuf {
    let expanded = shellexpand::tilde("~/.config/evdev_transformer");
    PathBuf::from(expanded.as_ref()).join(format!("{config_name}.json"))
}

/// Load, parse and validate the configuration named by `config_name`.
pub fn load_config(config_name: &str) -> Result<Config, ConfigError> {
    let path = config_path(config_name);
    tracing::debug!(path = %path.display(), "loading configuration");
    let contents = std::fs::read_to_string(&path)?;
    parse_config(&contents)
}

/// Parse and validate configuration JSON already read into memory.
pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(contents).map_err(|source| ConfigError::ParseError { source })?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "config_version": 1,
        "sources": [
            {"name": "kbd", "type": "evdev_udev", "properties": {"udev": {"ID_VENDOR_ID": "046d"}}}
        ],
        "source_groups": [
            {"name": "kbd_group", "sources": ["kbd"]}
        ],
        "destinations": [
            {"name": "virt", "type": "uinput", "properties": {}}
        ],
        "links": [
            {"source_group": "kbd_group", "destination": "virt"}
        ]
    }"#;

    #[test]
    fn parses_minimal_config() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.links.len(), 1);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            parse_config("{not json"),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn config_path_expands_tilde() {
        let path = config_path("example");
        assert!(path.ends_with("evdev_transformer/example.json"));
        assert!(!path.starts_with("~"));
    }

    #[test]
    fn loads_from_a_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        std::fs::write(&path, MINIMAL).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        parse_config(&contents).unwrap();
    }
}
