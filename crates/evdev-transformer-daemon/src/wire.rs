//! Newline-delimited JSON wire format shared by the subprocess destination
//! and the IPC listener.

use std::collections::BTreeMap;

use evdev::{Device, EventType, InputEvent};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub event_type: u16,
    pub code: u16,
    pub value: i32,
}

impl From<InputEvent> for WireEvent {
    fn from(event: InputEvent) -> Self {
        WireEvent {
            event_type: event.event_type().0,
            code: event.code(),
            value: event.value(),
        }
    }
}

impl From<WireEvent> for InputEvent {
    fn from(event: WireEvent) -> Self {
        InputEvent::new(EventType(event.event_type), event.code, event.value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatchMessage {
    pub events: Vec<WireEvent>,
}

impl EventBatchMessage {
    pub fn from_batch(batch: &[InputEvent]) -> Self {
        EventBatchMessage {
            events: batch.iter().copied().map(WireEvent::from).collect(),
        }
    }

    pub fn into_batch(self) -> Vec<InputEvent> {
        self.events.into_iter().map(InputEvent::from).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputId {
    pub bustype: u16,
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbsInfo {
    pub minimum: i32,
    pub maximum: i32,
    pub fuzz: i32,
    pub flat: i32,
    pub resolution: i32,
    pub value: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    pub name: String,
    pub id: InputId,
    pub evbits: BTreeMap<u16, Vec<u16>>,
    pub absinfo: BTreeMap<u16, AbsInfo>,
    pub rep_value: BTreeMap<u16, i32>,
    pub properties: Vec<u16>,
}

impl Descriptor {
    /// Build the descriptor for a device, for the "(Virtual)" sink built
    /// to mirror it.
    pub fn from_device(device: &Device) -> Self {
        let id = device.input_id();
        let mut evbits: BTreeMap<u16, Vec<u16>> = BTreeMap::new();

        if let Some(keys) = device.supported_keys() {
            evbits.insert(EventType::KEY.0, keys.iter().map(|k| k.code()).collect());
        }
        if let Some(axes) = device.supported_relative_axes() {
            evbits.insert(EventType::RELATIVE.0, axes.iter().map(|a| a.0).collect());
        }
        if let Some(axes) = device.supported_absolute_axes() {
            evbits.insert(EventType::ABSOLUTE.0, axes.iter().map(|a| a.0).collect());
        }
        if let Some(switches) = device.supported_switches() {
            evbits.insert(EventType::SWITCH.0, switches.iter().map(|s| s.0).collect());
        }

        let mut absinfo = BTreeMap::new();
        if let (Some(axes), Ok(state)) = (device.supported_absolute_axes(), device.get_abs_state())
        {
            for axis in axes.iter() {
                let info = state[axis.0 as usize];
                absinfo.insert(
                    axis.0,
                    AbsInfo {
                        minimum: info.minimum,
                        maximum: info.maximum,
                        fuzz: info.fuzz,
                        flat: info.flat,
                        resolution: info.resolution,
                        value: info.value,
                    },
                );
            }
        }

        let rep_value = device
            .get_auto_repeat()
            .map(|rep| BTreeMap::from([(0u16, rep.delay as i32), (1u16, rep.period as i32)]))
            .unwrap_or_default();

        let properties = device.properties().iter().map(|p| p.0).collect();

        Descriptor {
            name: device.name().unwrap_or("Input Device").to_string(),
            id: InputId {
                bustype: id.bus_type().0,
                vendor: id.vendor(),
                product: id.product(),
                version: id.version(),
            },
            evbits,
            absinfo,
            rep_value,
            properties,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorEnvelope {
    pub host: String,
    pub vendor: u16,
    pub product: u16,
    pub data: Descriptor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_event_round_trips_through_input_event() {
        let event = InputEvent::new(EventType::KEY, 30, 1);
        let wire: WireEvent = event.into();
        let back: InputEvent = wire.into();
        assert_eq!(back.event_type(), event.event_type());
        assert_eq!(back.code(), event.code());
        assert_eq!(back.value(), event.value());
    }

    #[test]
    fn event_batch_message_serializes_with_events_key() {
        let batch = vec![InputEvent::new(EventType::KEY, 30, 1)];
        let msg = EventBatchMessage::from_batch(&batch);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.starts_with(r#"{"events":"#));
    }
}
