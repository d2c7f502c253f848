//! Holds the validated configuration plus the mutable *current-link
//! selection*, and emits the add/remove event stream the Hub reconciles
//! against.
//!
//! The immutable `Config` tree itself lives in `evdev-transformer-config`;
//! this is the daemon-side layer that tracks which link is currently
//! selected per source group and lets activators cycle it.

use std::collections::HashMap;
use std::sync::Mutex;

use evdev_transformer_config::{Activator, Config, Destination, Link, Source, SourceGroup};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum ConfigEntity {
    Source(Source),
    SourceGroup(SourceGroup),
    Destination(Destination),
    Link(Link),
}

#[derive(Debug, Clone)]
pub enum ConfigEvent {
    Add(ConfigEntity),
    Remove(ConfigEntity),
}

pub struct ResolvedLink<'a> {
    pub link: &'a Link,
    pub sources: Vec<&'a Source>,
    pub destination: &'a Destination,
}

#[derive(Debug, Error)]
pub enum ConfigStoreError {
    #[error("no link configured for source group '{0}'")]
    NoLinkForGroup(String),
    #[error("no link for source group '{0}' matches the given activator")]
    NoMatchingActivator(String),
}

pub struct ConfigStore {
    config: Config,
    selection: Mutex<HashMap<String, usize>>,
    event_tx: mpsc::UnboundedSender<ConfigEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<ConfigEvent>>>,
}

impl ConfigStore {
    pub fn new(config: Config) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        for source in &config.sources {
            let _ = event_tx.send(ConfigEvent::Add(ConfigEntity::Source(source.clone())));
        }
        for group in &config.source_groups {
            let _ = event_tx.send(ConfigEvent::Add(ConfigEntity::SourceGroup(group.clone())));
        }
        for destination in &config.destinations {
            let _ = event_tx.send(ConfigEvent::Add(ConfigEntity::Destination(destination.clone())));
        }
        for link in &config.links {
            let _ = event_tx.send(ConfigEvent::Add(ConfigEntity::Link(link.clone())));
        }

        let selection = config
            .source_groups
            .iter()
            .map(|group| (group.name.clone(), 0))
            .collect();

        Self {
            config,
            selection: Mutex::new(selection),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// `events()` is a single-consumer channel: the first call hands out
    /// the seeded receiver (initial adds, then `cycle_link` deltas);
    /// further calls return `None`.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<ConfigEvent>> {
        self.event_rx.lock().unwrap().take()
    }

    fn links_for_group<'a>(&'a self, group: &str) -> Vec<&'a Link> {
        self.config
            .links
            .iter()
            .filter(|l| l.source_group == group)
            .collect()
    }

    pub fn current_links(&self) -> Vec<ResolvedLink<'_>> {
        let selection = self.selection.lock().unwrap();
        self.config
            .source_groups
            .iter()
            .filter_map(|group| {
                let links = self.links_for_group(&group.name);
                if links.is_empty() {
                    return None;
                }
                let index = selection.get(&group.name).copied().unwrap_or(0) % links.len();
                let link = links[index];
                let sources = group
                    .sources
                    .iter()
                    .filter_map(|name| self.config.sources.iter().find(|s| &s.name == name))
                    .collect();
                let destination = self
                    .config
                    .destinations
                    .iter()
                    .find(|d| d.name == link.destination)?;
                Some(ResolvedLink {
                    link,
                    sources,
                    destination,
                })
            })
            .collect()
    }

    /// Select the next link for `group`, wrapping around. `activator`, when
    /// given, is only checked for membership in *some* link of the group
    /// (catching a misrouted call); it does not restrict which link is
    /// next. A group can have a link whose activator is only declared on
    /// the currently active link (the common case: press the hotkey to
    /// leave this link, there's nothing to press to leave the other one),
    /// so restricting candidates to links carrying the fired activator
    /// would make cycling a no-op exactly when it matters most.
    pub fn cycle_link(
        &self,
        group: &str,
        activator: Option<&Activator>,
    ) -> Result<(), ConfigStoreError> {
        let links = self.links_for_group(group);
        if links.is_empty() {
            return Err(ConfigStoreError::NoLinkForGroup(group.to_string()));
        }
        if let Some(a) = activator {
            if !links.iter().any(|link| link.activators.contains(a)) {
                return Err(ConfigStoreError::NoMatchingActivator(group.to_string()));
            }
        }

        let mut selection = self.selection.lock().unwrap();
        let current = selection.get(group).copied().unwrap_or(0) % links.len();
        let next = (current + 1) % links.len();

        if next != current {
            let _ = self
                .event_tx
                .send(ConfigEvent::Remove(ConfigEntity::Link(links[current].clone())));
            let _ = self
                .event_tx
                .send(ConfigEvent::Add(ConfigEntity::Link(links[next].clone())));
        }
        selection.insert(group.to_string(), next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evdev_transformer_config::{DestinationKind, HotkeySpec, SourceKind};
    use std::collections::BTreeMap;

    fn sample_config() -> Config {
        Config {
            config_version: 1,
            sources: vec![Source {
                name: "kbd".into(),
                kind: SourceKind::EvdevUdev {
                    udev_attrs: BTreeMap::from([("ID_VENDOR_ID".to_string(), "046d".to_string())]),
                },
                transforms: vec![],
            }],
            source_groups: vec![SourceGroup {
                name: "main".into(),
                sources: vec!["kbd".into()],
            }],
            destinations: vec![
                Destination {
                    name: "work".into(),
                    kind: DestinationKind::Uinput {},
                },
                Destination {
                    name: "game".into(),
                    kind: DestinationKind::Uinput {},
                },
            ],
            links: vec![
                Link {
                    source_group: "main".into(),
                    destination: "work".into(),
                    activators: vec![Activator::Hotkey {
                        hotkey: HotkeySpec {
                            key: "KEY_F1".into(),
                            modifiers: vec!["KEY_LEFTCTRL".into()],
                        },
                    }],
                },
                Link {
                    source_group: "main".into(),
                    destination: "game".into(),
                    activators: vec![Activator::Hotkey {
                        hotkey: HotkeySpec {
                            key: "KEY_F1".into(),
                            modifiers: vec!["KEY_LEFTCTRL".into()],
                        },
                    }],
                },
            ],
        }
    }

    #[test]
    fn initial_selection_is_first_link_per_group() {
        let store = ConfigStore::new(sample_config());
        let links = store.current_links();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].destination.name, "work");
    }

    #[test]
    fn cycle_link_wraps_around() {
        let store = ConfigStore::new(sample_config());
        store.cycle_link("main", None).unwrap();
        assert_eq!(store.current_links()[0].destination.name, "game");
        store.cycle_link("main", None).unwrap();
        assert_eq!(store.current_links()[0].destination.name, "work");
    }

    #[test]
    fn cycle_link_advances_even_when_activator_is_only_on_active_link() {
        // S3: the activator that fires is declared only on the currently
        // active link. Restricting candidates to links carrying it would
        // leave `next == current` here and the selection would never move.
        let mut config = sample_config();
        config.links[1].activators.clear();
        let store = ConfigStore::new(config);
        let fired = Activator::Hotkey {
            hotkey: HotkeySpec {
                key: "KEY_F1".into(),
                modifiers: vec!["KEY_LEFTCTRL".into()],
            },
        };
        store.cycle_link("main", Some(&fired)).unwrap();
        assert_eq!(store.current_links()[0].destination.name, "game");
    }

    #[test]
    fn cycle_link_rejects_activator_unknown_to_the_group() {
        let store = ConfigStore::new(sample_config());
        let unknown = Activator::Hotkey {
            hotkey: HotkeySpec {
                key: "KEY_F9".into(),
                modifiers: vec![],
            },
        };
        assert!(matches!(
            store.cycle_link("main", Some(&unknown)),
            Err(ConfigStoreError::NoMatchingActivator(_))
        ));
    }

    #[test]
    fn cycle_link_unknown_group_errors() {
        let store = ConfigStore::new(sample_config());
        assert!(matches!(
            store.cycle_link("nope", None),
            Err(ConfigStoreError::NoLinkForGroup(_))
        ));
    }

    #[test]
    fn events_seeds_initial_adds_once() {
        let store = ConfigStore::new(sample_config());
        let mut rx = store.events().expect("first call gets the receiver");
        assert!(store.events().is_none());
        let first = rx.try_recv().expect("at least one initial event");
        assert!(matches!(first, ConfigEvent::Add(ConfigEntity::Source(_))));
    }
}
