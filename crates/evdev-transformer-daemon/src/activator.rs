//! Per-link hotkey recognizers. An activator is tried against a source's
//! transformed pressed-key set; a match fires a link-cycle request and
//! absorbs the triggering event.

use std::collections::HashSet;

use evdev::Key;
use evdev_transformer_config::{parse_key_name, Activator as ActivatorConfig};

#[derive(Debug, Clone)]
pub struct Hotkey {
    pub key: Key,
    pub modifiers: Vec<Key>,
}

#[derive(Debug, Clone)]
pub enum Activator {
    Hotkey(Hotkey),
}

impl Activator {
    /// `Script` entries never reach here: rejected at config validation.
    ///
    /// Keeps the source `ActivatorConfig` paired with the runtime matcher
    /// built from it: `cycle_link` takes the specific activator that fired,
    /// not just a "something matched" signal, so a match needs to hand
    /// back the original configuration entry.
    pub fn list_from_config(configs: &[ActivatorConfig]) -> Vec<(Activator, ActivatorConfig)> {
        configs
            .iter()
            .filter_map(|c| match c {
                ActivatorConfig::Hotkey { hotkey } => {
                    let key = parse_key_name(&hotkey.key)?;
                    let modifiers = hotkey
                        .modifiers
                        .iter()
                        .filter_map(|m| parse_key_name(m))
                        .collect();
                    Some((Activator::Hotkey(Hotkey { key, modifiers }), c.clone()))
                }
                ActivatorConfig::Script { .. } => {
                    tracing::error!("script activators are unsupported and should have been rejected at config validation");
                    None
                }
            })
            .collect()
    }

    /// Does this activator match the key that was just pressed, given the
    /// source's full pressed-key set (which already includes `trigger`)?
    pub fn matches(&self, trigger: Key, pressed: &HashSet<Key>) -> bool {
        match self {
            Activator::Hotkey(hotkey) => {
                hotkey.key == trigger && hotkey.modifiers.iter().all(|m| pressed.contains(m))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hotkey_matches_trigger_with_modifiers_held() {
        let activator = Activator::Hotkey(Hotkey {
            key: Key::KEY_F1,
            modifiers: vec![Key::KEY_LEFTCTRL],
        });
        let mut pressed = HashSet::new();
        pressed.insert(Key::KEY_LEFTCTRL);
        pressed.insert(Key::KEY_F1);
        assert!(activator.matches(Key::KEY_F1, &pressed));
    }

    #[test]
    fn hotkey_does_not_match_without_modifier() {
        let activator = Activator::Hotkey(Hotkey {
            key: Key::KEY_F1,
            modifiers: vec![Key::KEY_LEFTCTRL],
        });
        let mut pressed = HashSet::new();
        pressed.insert(Key::KEY_F1);
        assert!(!activator.matches(Key::KEY_F1, &pressed));
    }

    #[test]
    fn hotkey_does_not_match_different_trigger() {
        let activator = Activator::Hotkey(Hotkey {
            key: Key::KEY_F1,
            modifiers: vec![],
        });
        let pressed = HashSet::new();
        assert!(!activator.matches(Key::KEY_F2, &pressed));
    }
}
