//! Configuration data model.
//!
//! Mirrors the JSON configuration schema: a `Config` is deserialized
//! directly from the on-disk file, then `Config::validate` is run once to
//! enforce the invariants that `serde` cannot express structurally (unique
//! names, disjoint groups, known references).

use std::collections::{BTreeMap, HashSet};

use evdev::Key;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::key_codes::parse_key_name;

pub const SUPPORTED_CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub config_version: u32,
    pub sources: Vec<Source>,
    pub source_groups: Vec<SourceGroup>,
    pub destinations: Vec<Destination>,
    pub links: Vec<Link>,
}

impl Config {
    /// Parse and validate in one step; the distinction between "invalid
    /// JSON" and "valid JSON, invalid config" is preserved by `from_json`
    /// and `validate` being separate calls in the loader.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.config_version != SUPPORTED_CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                found: self.config_version,
                supported: SUPPORTED_CONFIG_VERSION,
            });
        }

        let mut source_names = HashSet::new();
        for source in &self.sources {
            if !source_names.insert(source.name.as_str()) {
                return Err(ConfigError::DuplicateName {
                    kind: "source",
                    name: source.name.clone(),
                });
            }
            source.validate()?;
        }

        let mut group_names = HashSet::new();
        let mut claimed_sources: HashSet<&str> = HashSet::new();
        for group in &self.source_groups {
            if !group_names.insert(group.name.as_str()) {
                return Err(ConfigError::DuplicateName {
                    kind: "source_group",
                    name: group.name.clone(),
                });
            }
            for member in &group.sources {
                if !source_names.contains(member.as_str()) {
                    return Err(ConfigError::UnknownReference {
                        kind: "source",
                        name: member.clone(),
                    });
                }
                if !claimed_sources.insert(member.as_str()) {
                    return Err(ConfigError::OverlappingSourceGroups {
                        source: member.clone(),
                    });
                }
            }
        }

        let mut destination_names = HashSet::new();
        for destination in &self.destinations {
            if !destination_names.insert(destination.name.as_str()) {
                return Err(ConfigError::DuplicateName {
                    kind: "destination",
                    name: destination.name.clone(),
                });
            }
        }

        let mut link_pairs = HashSet::new();
        for link in &self.links {
            if !group_names.contains(link.source_group.as_str()) {
                return Err(ConfigError::UnknownReference {
                    kind: "source_group",
                    name: link.source_group.clone(),
                });
            }
            if !destination_names.contains(link.destination.as_str()) {
                return Err(ConfigError::UnknownReference {
                    kind: "destination",
                    name: link.destination.clone(),
                });
            }
            let pair = (link.source_group.clone(), link.destination.clone());
            if !link_pairs.insert(pair) {
                return Err(ConfigError::DuplicateLink {
                    source_group: link.source_group.clone(),
                    destination: link.destination.clone(),
                });
            }
            let mut seen_activators = HashSet::new();
            for activator in &link.activators {
                activator.validate()?;
                let key = activator.dedup_key();
                if !seen_activators.insert(key) {
                    return Err(ConfigError::DuplicateActivator {
                        source_group: link.source_group.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Groups referencing `source_name`, in `source_groups` order.
    pub fn group_for_source(&self, source_name: &str) -> Option<&SourceGroup> {
        self.source_groups
            .iter()
            .find(|g| g.sources.iter().any(|s| s == source_name))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Source {
    pub name: String,
    #[serde(flatten)]
    pub kind: SourceKind,
    #[serde(default)]
    pub transforms: Vec<Transform>,
}

impl Source {
    fn validate(&self) -> Result<(), ConfigError> {
        self.kind.validate(&self.name)?;
        for transform in &self.transforms {
            transform.validate()?;
        }
        Ok(())
    }

    pub fn identifier(&self) -> SourceIdentifier {
        self.kind.identifier()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "properties", rename_all = "snake_case")]
pub enum SourceKind {
    EvdevUdev {
        #[serde(rename = "udev")]
        udev_attrs: BTreeMap<String, String>,
    },
    EvdevUnixSocket {
        socket_name: String,
        evdev_id: EvdevId,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvdevId {
    pub vendor: u16,
    pub product: u16,
}

impl SourceKind {
    fn validate(&self, source_name: &str) -> Result<(), ConfigError> {
        match self {
            SourceKind::EvdevUdev { udev_attrs } => {
                if udev_attrs.is_empty() {
                    return Err(ConfigError::Invalid {
                        message: format!(
                            "source '{source_name}' has an empty udev attribute match set"
                        ),
                    });
                }
                Ok(())
            }
            SourceKind::EvdevUnixSocket { socket_name, .. } => {
                if socket_name.is_empty() {
                    return Err(ConfigError::Invalid {
                        message: format!("source '{source_name}' has an empty socket_name"),
                    });
                }
                Ok(())
            }
        }
    }

    pub fn identifier(&self) -> SourceIdentifier {
        match self {
            SourceKind::EvdevUdev { udev_attrs } => SourceIdentifier::UdevAttrs(udev_attrs.clone()),
            SourceKind::EvdevUnixSocket {
                socket_name,
                evdev_id,
            } => SourceIdentifier::NetTriple {
                host: socket_name.clone(),
                vendor: evdev_id.vendor,
                product: evdev_id.product,
            },
        }
    }
}

/// Structural identifier for a source: a udev attribute map or a
/// `(host, vendor, product)` triple. `BTreeMap` is used (not `HashMap`) so
/// this type can derive `Hash`/`Eq` and serve as a key in the hub's
/// activation and destination-cache tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceIdentifier {
    UdevAttrs(BTreeMap<String, String>),
    NetTriple {
        host: String,
        vendor: u16,
        product: u16,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceGroup {
    pub name: String,
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Destination {
    pub name: String,
    #[serde(flatten)]
    pub kind: DestinationKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "properties", rename_all = "snake_case")]
pub enum DestinationKind {
    /// A struct variant, not a unit variant: under adjacent tagging a unit
    /// variant rejects a `properties` value at all (even `{}`), which would
    /// make every on-disk `{"type":"uinput","properties":{}}` destination
    /// unloadable.
    Uinput {},
    Subprocess {
        command: Vec<String>,
    },
    HidGadget {
        #[serde(default = "default_hidg_path")]
        device_path: String,
    },
}

fn default_hidg_path() -> String {
    "/dev/hidg0".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Link {
    pub source_group: String,
    pub destination: String,
    #[serde(default)]
    pub activators: Vec<Activator>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "properties", rename_all = "snake_case")]
pub enum Transform {
    KeyRemap { remaps: Vec<KeyRemapEntry> },
    Script { filename: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyRemapEntry {
    pub source: String,
    pub destination: String,
}

impl KeyRemapEntry {
    pub fn parsed(&self) -> Option<(Key, Key)> {
        Some((
            parse_key_name(&self.source)?,
            parse_key_name(&self.destination)?,
        ))
    }
}

impl Transform {
    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Transform::KeyRemap { remaps } => {
                for remap in remaps {
                    if remap.parsed().is_none() {
                        return Err(ConfigError::UnknownKey {
                            key: format!("{} -> {}", remap.source, remap.destination),
                        });
                    }
                }
                Ok(())
            }
            Transform::Script { .. } => Err(ConfigError::UnsupportedScript {
                kind: "transform",
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "properties", rename_all = "snake_case")]
pub enum Activator {
    Hotkey {
        hotkey: HotkeySpec,
    },
    Script {
        filename: String,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HotkeySpec {
    pub key: String,
    #[serde(default)]
    pub modifiers: Vec<String>,
}

impl Activator {
    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Activator::Hotkey { hotkey } => {
                if parse_key_name(&hotkey.key).is_none() {
                    return Err(ConfigError::UnknownKey {
                        key: hotkey.key.clone(),
                    });
                }
                for modifier in &hotkey.modifiers {
                    if parse_key_name(modifier).is_none() {
                        return Err(ConfigError::UnknownKey {
                            key: modifier.clone(),
                        });
                    }
                }
                Ok(())
            }
            Activator::Script { .. } => Err(ConfigError::UnsupportedScript { kind: "activator" }),
        }
    }

    /// A value distinguishing activators for the "pairwise distinct"
    /// per-link invariant; script activators can never reach here since
    /// they fail validation first.
    fn dedup_key(&self) -> (Key, Vec<Key>) {
        match self {
            Activator::Hotkey { hotkey } => {
                let key = parse_key_name(&hotkey.key).expect("validated above");
                let mut modifiers: Vec<Key> = hotkey
                    .modifiers
                    .iter()
                    .map(|m| parse_key_name(m).expect("validated above"))
                    .collect();
                modifiers.sort_by_key(|k| k.code());
                (key, modifiers)
            }
            Activator::Script { .. } => unreachable!("script activators are rejected in validate"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            config_version: SUPPORTED_CONFIG_VERSION,
            sources: vec![Source {
                name: "kbd".into(),
                kind: SourceKind::EvdevUdev {
                    udev_attrs: BTreeMap::from([(
                        "ID_VENDOR_ID".to_string(),
                        "046d".to_string(),
                    )]),
                },
                transforms: vec![],
            }],
            source_groups: vec![SourceGroup {
                name: "kbd_group".into(),
                sources: vec!["kbd".into()],
            }],
            destinations: vec![Destination {
                name: "virt".into(),
                kind: DestinationKind::Uinput {},
            }],
            links: vec![Link {
                source_group: "kbd_group".into(),
                destination: "virt".into(),
                activators: vec![],
            }],
        }
    }

    #[test]
    fn valid_config_passes() {
        base_config().validate().unwrap();
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut config = base_config();
        config.config_version = 99;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn rejects_overlapping_source_groups() {
        let mut config = base_config();
        config.source_groups.push(SourceGroup {
            name: "other_group".into(),
            sources: vec!["kbd".into()],
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OverlappingSourceGroups { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_link_pair() {
        let mut config = base_config();
        let link = config.links[0].clone();
        config.links.push(link);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateLink { .. })
        ));
    }

    #[test]
    fn rejects_script_transform() {
        let mut config = base_config();
        config.sources[0].transforms.push(Transform::Script {
            filename: "foo.py".into(),
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedScript { .. })
        ));
    }

    #[test]
    fn rejects_unknown_key_in_remap() {
        let mut config = base_config();
        config.sources[0].transforms.push(Transform::KeyRemap {
            remaps: vec![KeyRemapEntry {
                source: "KEY_TOTALLY_MADE_UP".into(),
                destination: "KEY_ESC".into(),
            }],
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownKey { .. })
        ));
    }
}
