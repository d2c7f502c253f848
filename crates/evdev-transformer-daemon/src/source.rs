//! The event pipeline: grab a device (or accept an IPC stream), decode,
//! maintain kernel-protocol state, run it through the transform chain and
//! activator check, and hand synchronized batches to whoever is running
//! this source's forwarder.
//!
//! This is the hardest part of the system. The pipeline
//! itself runs inside a single spawned task per `run()` call so that its
//! transient state (the in-progress batch buffer, the current MT slot)
//! needs no synchronization; only the state other components legitimately
//! need to observe from outside — pressed keys, MT slot table, the
//! activators/transforms to apply, and the release flag — lives behind a
//! lock on the `SourceDevice` itself.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use evdev::{AbsoluteAxisType, Device, EventType, InputEvent, InputEventKind, Key, Synchronization};
use evdev_transformer_config::SourceIdentifier;
use futures::StreamExt;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use evdev_transformer_config::Activator as ActivatorConfig;

use crate::activator::Activator;
use crate::transform::{self, Transform};
use crate::wire::{self, Descriptor};

pub const BATCH_CHANNEL_CAPACITY: usize = 64;

/// Where a source's raw events come from.
///
/// The IPC variant stores an already-constructed `Lines` reader rather than
/// the raw socket: the listener must read the leading descriptor envelope
/// line itself before handing the connection off, and re-wrapping a fresh
/// `BufReader` around the raw stream at that point would silently drop
/// whatever the OS had already buffered past that line.
pub enum Backend {
    Evdev(Device),
    Ipc(tokio::io::Lines<tokio::io::BufReader<UnixStream>>),
}

pub struct SourceDevice {
    pub name: String,
    pub identifier: SourceIdentifier,
    pub descriptor: Descriptor,
    supports_mt: bool,
    pressed_keys: Mutex<HashSet<Key>>,
    mt_tracking_ids_by_slot: Mutex<BTreeMap<u16, i32>>,
    activators: Mutex<Vec<(Activator, ActivatorConfig)>>,
    transforms: Mutex<Vec<Transform>>,
    release_requested: AtomicBool,
    event_lock: AsyncMutex<()>,
    backend: AsyncMutex<Option<Backend>>,
    /// Fired with the matched `ActivatorConfig` when an activator fires:
    /// the hub cycles this source's link with that specific activator.
    activator_tx: Mutex<Option<mpsc::UnboundedSender<ActivatorConfig>>>,
}

impl SourceDevice {
    pub fn new(name: String, identifier: SourceIdentifier, device: Device) -> Result<Self> {
        let descriptor = Descriptor::from_device(&device);
        let supports_mt = device
            .supported_absolute_axes()
            .map(|axes| axes.contains(AbsoluteAxisType::ABS_MT_SLOT))
            .unwrap_or(false);
        Ok(Self {
            name,
            identifier,
            descriptor,
            supports_mt,
            pressed_keys: Mutex::new(HashSet::new()),
            mt_tracking_ids_by_slot: Mutex::new(BTreeMap::new()),
            activators: Mutex::new(Vec::new()),
            transforms: Mutex::new(Vec::new()),
            release_requested: AtomicBool::new(false),
            event_lock: AsyncMutex::new(()),
            backend: AsyncMutex::new(Some(Backend::Evdev(device))),
            activator_tx: Mutex::new(None),
        })
    }

    pub fn new_ipc(
        name: String,
        identifier: SourceIdentifier,
        descriptor: Descriptor,
        lines: tokio::io::Lines<tokio::io::BufReader<UnixStream>>,
    ) -> Self {
        let supports_mt = descriptor
            .evbits
            .get(&EventType::ABSOLUTE.0)
            .map(|codes| codes.contains(&AbsoluteAxisType::ABS_MT_SLOT.0))
            .unwrap_or(false);
        Self {
            name,
            identifier,
            descriptor,
            supports_mt,
            pressed_keys: Mutex::new(HashSet::new()),
            mt_tracking_ids_by_slot: Mutex::new(BTreeMap::new()),
            activators: Mutex::new(Vec::new()),
            transforms: Mutex::new(Vec::new()),
            release_requested: AtomicBool::new(false),
            event_lock: AsyncMutex::new(()),
            backend: AsyncMutex::new(Some(Backend::Ipc(lines))),
            activator_tx: Mutex::new(None),
        }
    }

    /// No backend at all: exercises the pipeline functions directly
    /// against a fixture, bypassing a real kernel device.
    #[cfg(test)]
    pub(crate) fn new_bare(supports_mt: bool) -> Self {
        Self {
            name: "test".to_string(),
            identifier: SourceIdentifier::UdevAttrs(BTreeMap::new()),
            descriptor: Descriptor {
                name: "test".to_string(),
                id: wire::InputId {
                    bustype: 0,
                    vendor: 0,
                    product: 0,
                    version: 0,
                },
                evbits: BTreeMap::new(),
                absinfo: BTreeMap::new(),
                rep_value: BTreeMap::new(),
                properties: Vec::new(),
            },
            supports_mt,
            pressed_keys: Mutex::new(HashSet::new()),
            mt_tracking_ids_by_slot: Mutex::new(BTreeMap::new()),
            activators: Mutex::new(Vec::new()),
            transforms: Mutex::new(Vec::new()),
            release_requested: AtomicBool::new(false),
            event_lock: AsyncMutex::new(()),
            backend: AsyncMutex::new(None),
            activator_tx: Mutex::new(None),
        }
    }

    pub fn set_transforms(&self, transforms: Vec<Transform>) {
        *self.transforms.lock().unwrap() = transforms;
    }

    pub fn set_activators(&self, activators: Vec<(Activator, ActivatorConfig)>) {
        *self.activators.lock().unwrap() = activators;
    }

    /// Install (or clear, with `None`) the channel notified when an
    /// activator matches. The hub rewires this every time the source's
    /// current link changes.
    pub fn set_activator_channel(&self, tx: Option<mpsc::UnboundedSender<ActivatorConfig>>) {
        *self.activator_tx.lock().unwrap() = tx;
    }

    pub fn has_pressed_keys(&self, keys: &[Key]) -> bool {
        let pressed = self.pressed_keys.lock().unwrap();
        keys.iter().all(|k| pressed.contains(k))
    }

    pub fn release(&self) {
        self.release_requested.store(true, Ordering::SeqCst);
    }

    fn release_requested_flag(&self) -> bool {
        self.release_requested.load(Ordering::SeqCst)
    }

    /// Run the pipeline to completion, sending synchronized batches to
    /// `tx`. Returns once release has drained and the epilogue has run, or
    /// the backend hits EOF/a non-recoverable read error.
    pub async fn run(&self, tx: mpsc::Sender<Vec<InputEvent>>) -> Result<()> {
        let _guard = self
            .event_lock
            .try_lock()
            .map_err(|_| anyhow::anyhow!("source '{}' already has an active event loop", self.name))?;

        let backend = self
            .backend
            .lock()
            .await
            .take()
            .context("source device has no backend (already consumed)")?;

        self.release_requested.store(false, Ordering::SeqCst);

        self.emit_attach_prologue(&tx).await;

        let result = match backend {
            Backend::Evdev(mut device) => {
                device.grab().context("failed to grab source device")?;
                let mut stream = device.into_event_stream().context("failed to open event stream")?;
                let result = self.pump(&mut stream, &tx).await;
                result
            }
            Backend::Ipc(lines) => {
                let mut reader = IpcEventReader::new(lines);
                self.pump(&mut reader, &tx).await
            }
        };

        self.emit_release_epilogue(&tx).await;
        result
    }

    async fn pump<S>(&self, stream: &mut S, tx: &mpsc::Sender<Vec<InputEvent>>) -> Result<()>
    where
        S: futures::Stream<Item = std::io::Result<InputEvent>> + Unpin,
    {
        let mut current_slot: Option<u16> = None;
        let mut batch: Vec<InputEvent> = Vec::new();

        loop {
            let next = stream.next().await;
            let raw_event = match next {
                Some(Ok(event)) => event,
                Some(Err(err)) => {
                    tracing::warn!(source = %self.name, error = %err, "event read error; source detaching");
                    return Err(err.into());
                }
                None => break,
            };

            for ready in self.process_raw_event(raw_event, &mut current_slot, &mut batch) {
                let _ = tx.send(ready).await;
            }

            if self.release_requested_flag() {
                break;
            }
        }
        Ok(())
    }

    /// Runs decode/transform/activator/batch for one raw event,
    /// against the caller's running `current_slot`/`batch` state. Returns
    /// the batches completed by this event, usually zero or one, but
    /// possibly more than one if a single raw event expands into several
    /// transformed events spanning a `SYN_REPORT`.
    ///
    /// Factored out of `pump` so the pipeline can be exercised directly
    /// against a fixture of raw events in tests, without a real stream.
    fn process_raw_event(
        &self,
        raw_event: InputEvent,
        current_slot: &mut Option<u16>,
        batch: &mut Vec<InputEvent>,
    ) -> Vec<Vec<InputEvent>> {
        let mut ready = Vec::new();
        for transformed in apply_transforms(&self.transforms, raw_event) {
            if self.check_activator(transformed) {
                // Absorbed: this key-down requested a link cycle. The
                // in-progress batch (this still-open frame's earlier
                // events) is dropped with it, not forwarded.
                batch.clear();
                continue;
            }
            self.update_state(transformed, current_slot);
            batch.push(transformed);
            if is_syn_report(transformed) {
                if batch.len() > 1 {
                    ready.push(std::mem::take(batch));
                } else {
                    batch.clear();
                }
                *current_slot = None;
            }
        }
        ready
    }

    fn check_activator(&self, event: InputEvent) -> bool {
        if event.event_type() != EventType::KEY || event.value() != 1 {
            return false;
        }
        let trigger = Key::new(event.code());
        let activators = self.activators.lock().unwrap();
        if activators.is_empty() {
            return false;
        }
        let matched = {
            let pressed = self.pressed_keys.lock().unwrap();
            activators
                .iter()
                .find(|(a, _)| a.matches(trigger, &pressed))
                .map(|(_, cfg)| cfg.clone())
        };
        let is_match = matched.is_some();
        if let Some(cfg) = matched {
            if let Some(tx) = self.activator_tx.lock().unwrap().as_ref() {
                let _ = tx.send(cfg);
            }
        }
        is_match
    }

    fn update_state(&self, event: InputEvent, current_slot: &mut Option<u16>) {
        match event.kind() {
            InputEventKind::Key(key) => match event.value() {
                0 => {
                    self.pressed_keys.lock().unwrap().remove(&key);
                }
                1 => {
                    self.pressed_keys.lock().unwrap().insert(key);
                }
                _ => {} // auto-repeat (value 2): state unchanged, never forwarded
            },
            InputEventKind::AbsAxis(axis) if axis == AbsoluteAxisType::ABS_MT_SLOT => {
                *current_slot = Some(event.value() as u16);
            }
            InputEventKind::AbsAxis(axis) if axis == AbsoluteAxisType::ABS_MT_TRACKING_ID => {
                let mut slots = self.mt_tracking_ids_by_slot.lock().unwrap();
                let slot = current_slot.unwrap_or_else(|| {
                    slots.keys().next().copied().unwrap_or(0)
                });
                if event.value() == -1 {
                    slots.remove(&slot);
                } else {
                    slots.insert(slot, event.value());
                }
            }
            _ => {}
        }
    }

    async fn emit_attach_prologue(&self, tx: &mpsc::Sender<Vec<InputEvent>>) {
        let slots: Vec<(u16, i32)> = self
            .mt_tracking_ids_by_slot
            .lock()
            .unwrap()
            .iter()
            .map(|(&s, &t)| (s, t))
            .collect();
        for (slot, tracking_id) in slots {
            let batch = vec![
                mt_slot_event(slot),
                mt_tracking_id_event(tracking_id),
                syn_report(),
            ];
            let _ = tx.send(batch).await;
        }
    }

    async fn emit_release_epilogue(&self, tx: &mpsc::Sender<Vec<InputEvent>>) {
        let pressed: Vec<Key> = self.pressed_keys.lock().unwrap().iter().copied().collect();
        for key in pressed {
            let batch = vec![
                InputEvent::new(EventType::KEY, key.code(), 0),
                syn_report(),
            ];
            let _ = tx.send(batch).await;
        }
        self.pressed_keys.lock().unwrap().clear();

        let slots: Vec<u16> = self
            .mt_tracking_ids_by_slot
            .lock()
            .unwrap()
            .keys()
            .copied()
            .collect();
        for slot in slots {
            let batch = vec![mt_slot_event(slot), mt_tracking_id_event(-1), syn_report()];
            let _ = tx.send(batch).await;
        }

        if self.supports_mt {
            let _ = tx
                .send(vec![mt_tracking_id_event(-1), syn_report()])
                .await;
        }
    }
}

fn apply_transforms(transforms: &Mutex<Vec<Transform>>, event: InputEvent) -> Vec<InputEvent> {
    let chain = transforms.lock().unwrap();
    transform::apply_chain(&chain, event)
}

fn is_syn_report(event: InputEvent) -> bool {
    matches!(
        event.kind(),
        InputEventKind::Synchronization(Synchronization::SYN_REPORT)
    )
}

fn syn_report() -> InputEvent {
    InputEvent::new(EventType::SYNCHRONIZATION, Synchronization::SYN_REPORT.0, 0)
}

fn mt_slot_event(slot: u16) -> InputEvent {
    InputEvent::new(EventType::ABSOLUTE, AbsoluteAxisType::ABS_MT_SLOT.0, slot as i32)
}

fn mt_tracking_id_event(tracking_id: i32) -> InputEvent {
    InputEvent::new(
        EventType::ABSOLUTE,
        AbsoluteAxisType::ABS_MT_TRACKING_ID.0,
        tracking_id,
    )
}

/// Adapts a newline-delimited JSON unix-socket stream into
/// the same `Stream<Item = io::Result<InputEvent>>` shape evdev's own
/// `EventStream` produces, so `SourceDevice::pump` can run identically over
/// either backend.
struct IpcEventReader {
    lines: tokio::io::Lines<tokio::io::BufReader<UnixStream>>,
    pending: std::collections::VecDeque<InputEvent>,
}

impl IpcEventReader {
    fn new(lines: tokio::io::Lines<tokio::io::BufReader<UnixStream>>) -> Self {
        Self {
            lines,
            pending: std::collections::VecDeque::new(),
        }
    }
}

impl futures::Stream for IpcEventReader {
    type Item = std::io::Result<InputEvent>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;

        let this = self.get_mut();

        if let Some(event) = this.pending.pop_front() {
            return Poll::Ready(Some(Ok(event)));
        }

        loop {
            match futures::ready!(this.lines.poll_next_line(cx)) {
                Ok(Some(line)) => {
                    let message: wire::EventBatchMessage = match serde_json::from_str(&line) {
                        Ok(msg) => msg,
                        Err(err) => {
                            tracing::warn!(error = %err, "dropping malformed IPC event batch");
                            continue;
                        }
                    };
                    this.pending.extend(message.into_batch());
                    if let Some(event) = this.pending.pop_front() {
                        return Poll::Ready(Some(Ok(event)));
                    }
                    continue;
                }
                Ok(None) => return Poll::Ready(None),
                Err(err) => return Poll::Ready(Some(Err(err))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: Key, value: i32) -> InputEvent {
        InputEvent::new(EventType::KEY, code.code(), value)
    }

    fn feed(device: &SourceDevice, events: &[InputEvent]) -> Vec<Vec<InputEvent>> {
        let mut current_slot = None;
        let mut batch = Vec::new();
        let mut batches = Vec::new();
        for &event in events {
            batches.extend(device.process_raw_event(event, &mut current_slot, &mut batch));
        }
        batches
    }

    // S1
    #[test]
    fn passthrough_forwards_key_down_and_up_batches() {
        let device = SourceDevice::new_bare(false);
        let batches = feed(
            &device,
            &[key(Key::KEY_A, 1), syn_report(), key(Key::KEY_A, 0), syn_report()],
        );
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], vec![key(Key::KEY_A, 1), syn_report()]);
        assert_eq!(batches[1], vec![key(Key::KEY_A, 0), syn_report()]);
    }

    // S2
    #[test]
    fn auto_repeat_frame_is_suppressed() {
        let device = SourceDevice::new_bare(false);
        let batches = feed(
            &device,
            &[
                key(Key::KEY_A, 1),
                syn_report(),
                key(Key::KEY_A, 2),
                syn_report(),
                key(Key::KEY_A, 0),
                syn_report(),
            ],
        );
        assert_eq!(batches.len(), 2);
        assert!(device.has_pressed_keys(&[]));
    }

    #[test]
    fn solitary_syn_report_never_forwarded() {
        let device = SourceDevice::new_bare(false);
        let batches = feed(&device, &[syn_report()]);
        assert!(batches.is_empty());
    }

    // S5
    #[test]
    fn key_remap_transform_rewrites_code_and_pressed_state() {
        let device = SourceDevice::new_bare(false);
        let mut remaps = std::collections::HashMap::new();
        remaps.insert(Key::KEY_CAPSLOCK, Key::KEY_ESC);
        device.set_transforms(vec![Transform::KeyRemap(transform::KeyRemap::new(remaps))]);

        let batches = feed(&device, &[key(Key::KEY_CAPSLOCK, 1), syn_report()]);
        assert_eq!(batches[0], vec![key(Key::KEY_ESC, 1), syn_report()]);
        assert!(device.has_pressed_keys(&[Key::KEY_ESC]));
        assert!(!device.has_pressed_keys(&[Key::KEY_CAPSLOCK]));
    }

    fn f1_ctrl_activator() -> Vec<(crate::activator::Activator, ActivatorConfig)> {
        vec![(
            crate::activator::Activator::Hotkey(crate::activator::Hotkey {
                key: Key::KEY_F1,
                modifiers: vec![Key::KEY_LEFTCTRL],
            }),
            ActivatorConfig::Hotkey {
                hotkey: evdev_transformer_config::HotkeySpec {
                    key: "KEY_F1".to_string(),
                    modifiers: vec!["KEY_LEFTCTRL".to_string()],
                },
            },
        )]
    }

    // S3
    #[test]
    fn matched_activator_absorbs_trigger_and_earlier_completed_frames_are_unaffected() {
        let device = SourceDevice::new_bare(false);
        device.set_activators(f1_ctrl_activator());

        let batches = feed(
            &device,
            &[
                key(Key::KEY_LEFTCTRL, 1),
                syn_report(),
                key(Key::KEY_F1, 1),
                syn_report(),
            ],
        );

        // The CTRL-down frame already closed on its own SYN_REPORT before
        // F1 arrived, so it was queued as ready before the trigger fired.
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], vec![key(Key::KEY_LEFTCTRL, 1), syn_report()]);
        assert!(!device.has_pressed_keys(&[Key::KEY_F1]));
    }

    #[test]
    fn matched_activator_clears_in_progress_batch_from_the_same_frame() {
        let device = SourceDevice::new_bare(false);
        device.set_activators(f1_ctrl_activator());

        // CTRL-down and F1-down land in the same still-open frame (no
        // SYN_REPORT between them): the match must drop CTRL-down along
        // with the trigger, not let it leak out once the frame closes.
        let batches = feed(
            &device,
            &[key(Key::KEY_LEFTCTRL, 1), key(Key::KEY_F1, 1), syn_report()],
        );

        assert!(batches.is_empty());
        assert!(!device.has_pressed_keys(&[Key::KEY_F1]));
    }

    #[test]
    fn mt_tracking_id_with_unset_slot_falls_back_to_first_known_slot() {
        let device = SourceDevice::new_bare(true);
        let batches = feed(
            &device,
            &[mt_slot_event(0), mt_tracking_id_event(5), syn_report()],
        );
        assert_eq!(batches.len(), 1);

        let batches = feed(&device, &[mt_tracking_id_event(9), syn_report()]);
        assert_eq!(batches.len(), 1);
        assert_eq!(
            device.mt_tracking_ids_by_slot.lock().unwrap().get(&0),
            Some(&9)
        );
    }
}
