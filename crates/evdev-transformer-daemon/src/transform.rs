//! The transform chain: an ordered list of event mappers installed on a
//! `SourceDevice`, each turning one input event into zero or more output
//! events.

use evdev::{EventType, InputEvent, Key};
use evdev_transformer_config::Transform as TransformConfig;

/// One stage of a source's transform chain.
#[derive(Debug, Clone)]
pub enum Transform {
    KeyRemap(KeyRemap),
}

#[derive(Debug, Clone, Default)]
pub struct KeyRemap {
    remaps: std::collections::HashMap<Key, Key>,
}

impl KeyRemap {
    pub fn new(remaps: std::collections::HashMap<Key, Key>) -> Self {
        Self { remaps }
    }

    fn apply(&self, event: InputEvent) -> Vec<InputEvent> {
        if event.event_type() != EventType::KEY {
            return vec![event];
        }
        let key = Key::new(event.code());
        match self.remaps.get(&key) {
            Some(&remapped) => vec![InputEvent::new(EventType::KEY, remapped.code(), event.value())],
            None => vec![event],
        }
    }
}

impl Transform {
    fn apply(&self, event: InputEvent) -> Vec<InputEvent> {
        match self {
            Transform::KeyRemap(remap) => remap.apply(event),
        }
    }

    /// Build the runtime representation of a config's transform list.
    /// `Script` entries never reach here: `Config::validate` rejects them
    /// before a `SourceDevice` is ever built.
    pub fn chain_from_config(configs: &[TransformConfig]) -> Vec<Transform> {
        configs
            .iter()
            .filter_map(|c| match c {
                TransformConfig::KeyRemap { remaps } => {
                    let mut map = std::collections::HashMap::new();
                    for entry in remaps {
                        if let Some((from, to)) = entry.parsed() {
                            map.insert(from, to);
                        }
                    }
                    Some(Transform::KeyRemap(KeyRemap::new(map)))
                }
                TransformConfig::Script { .. } => {
                    tracing::error!("script transforms are unsupported and should have been rejected at config validation");
                    None
                }
            })
            .collect()
    }
}

/// Feed one event through the whole chain in order, stage 0 first.
pub fn apply_chain(chain: &[Transform], event: InputEvent) -> Vec<InputEvent> {
    let mut batch = vec![event];
    for stage in chain {
        batch = batch.into_iter().flat_map(|e| stage.apply(e)).collect();
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaps_key_events() {
        let mut map = std::collections::HashMap::new();
        map.insert(Key::KEY_CAPSLOCK, Key::KEY_ESC);
        let chain = vec![Transform::KeyRemap(KeyRemap::new(map))];

        let event = InputEvent::new(EventType::KEY, Key::KEY_CAPSLOCK.code(), 1);
        let out = apply_chain(&chain, event);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].code(), Key::KEY_ESC.code());
        assert_eq!(out[0].value(), 1);
    }

    #[test]
    fn passes_through_unmatched_events() {
        let chain = vec![Transform::KeyRemap(KeyRemap::new(Default::default()))];
        let event = InputEvent::new(EventType::KEY, Key::KEY_A.code(), 1);
        let out = apply_chain(&chain, event);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].code(), Key::KEY_A.code());
    }

    #[test]
    fn non_key_events_pass_through() {
        let mut map = std::collections::HashMap::new();
        map.insert(Key::KEY_A, Key::KEY_B);
        let chain = vec![Transform::KeyRemap(KeyRemap::new(map))];
        let event = InputEvent::new(EventType::RELATIVE, 0, 5);
        let out = apply_chain(&chain, event);
        assert_eq!(out, vec![event]);
    }
}
