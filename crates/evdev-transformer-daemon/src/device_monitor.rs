//! Watches udev for input-device attach/detach and matches them against
//! attribute rules registered by the hub.
//!
//! Rules are not known up front: the hub registers one per configured
//! `evdev_udev` source as it walks the configuration, and a newly
//! registered rule is immediately checked against devices already present
//! before the live monitor is consulted for anything further.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use anyhow::Result;
use tokio::io::unix::AsyncFd;
use tokio_stream::Stream;
use udev::Enumerator;

pub type UdevAttrs = BTreeMap<String, String>;

/// A device seen on the bus, as much of it as the matching rule and later
/// `SourceDevice` construction need.
#[derive(Debug, Clone)]
pub struct RawDevice {
    pub devnode: PathBuf,
    pub properties: UdevAttrs,
}

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Add { device: RawDevice, matched: UdevAttrs },
    Remove { device: RawDevice, matched: UdevAttrs },
}

pub struct DeviceMonitor {
    socket: Arc<AsyncFd<udev::MonitorSocket>>,
    monitored: Vec<UdevAttrs>,
    pending: VecDeque<DeviceEvent>,
}

impl DeviceMonitor {
    pub fn new() -> Result<Self> {
        // Bind the monitor socket before any rule is registered, so a
        // device attaching between construction and the first
        // `add_monitored_attrs` call is still observed live.
        let mut builder = udev::MonitorBuilder::new()?;
        builder = builder.match_subsystem("input")?;
        let socket = Arc::new(AsyncFd::new(builder.listen()?)?);
        Ok(Self {
            socket,
            monitored: Vec::new(),
            pending: VecDeque::new(),
        })
    }

    /// Register an attribute rule. Idempotent. If a device currently on
    /// the bus already matches it, a synthetic `Add` is queued.
    pub fn add_monitored_attrs(&mut self, attrs: UdevAttrs) {
        if self.monitored.contains(&attrs) {
            return;
        }
        self.monitored.push(attrs.clone());
        if let Some(device) = Self::scan_for_rule(&attrs) {
            tracing::debug!(?attrs, devnode = %device.devnode.display(), "rule matched an already-attached device");
            self.pending.push_back(DeviceEvent::Add {
                device,
                matched: attrs,
            });
        }
    }

    /// Unregister a rule. Idempotent. If a device currently on the bus
    /// still matches it, a synthetic `Remove` is queued so bound state is
    /// torn down consistently.
    pub fn remove_monitored_attrs(&mut self, attrs: &UdevAttrs) {
        let Some(pos) = self.monitored.iter().position(|m| m == attrs) else {
            return;
        };
        self.monitored.remove(pos);
        if let Some(device) = Self::scan_for_rule(attrs) {
            self.pending.push_back(DeviceEvent::Remove {
                device,
                matched: attrs.clone(),
            });
        }
    }

    fn scan_for_rule(rule: &UdevAttrs) -> Option<RawDevice> {
        let mut enumerator = Enumerator::new().ok()?;
        enumerator
            .match_subsystem("input")
            .ok()?;
        for device in enumerator.scan_devices().ok()? {
            if let Some(raw) = device_matches(&device, rule) {
                return Some(raw);
            }
        }
        None
    }

    fn find_matching_rule(&self, device: &udev::Device) -> Option<(UdevAttrs, RawDevice)> {
        self.monitored
            .iter()
            .find_map(|rule| device_matches(device, rule).map(|raw| (rule.clone(), raw)))
    }

    fn try_read(&mut self) -> Result<Option<DeviceEvent>> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }

        loop {
            let Some(event) = self.socket.get_ref().iter().next() else {
                return Ok(None);
            };
            let action = event.event_type();
            let Some((matched, device)) = self.find_matching_rule(&event.device()) else {
                continue;
            };
            match action {
                udev::EventType::Add => {
                    return Ok(Some(DeviceEvent::Add { device, matched }));
                }
                udev::EventType::Remove => {
                    return Ok(Some(DeviceEvent::Remove { device, matched }));
                }
                _ => continue,
            }
        }
    }
}

/// Matching rule: every `(key, value)` in `rule` present and equal on the
/// device, devnode under `/dev/input/event*`, syspath not under a
/// virtual-device subtree.
fn device_matches(device: &udev::Device, rule: &UdevAttrs) -> Option<RawDevice> {
    let devnode = device.devnode()?;
    if !devnode.to_string_lossy().starts_with("/dev/input/event") {
        return None;
    }
    if device.syspath().to_string_lossy().contains("/devices/virtual/") {
        return None;
    }
    for (key, value) in rule {
        match device.property_value(key) {
            Some(v) if v.to_string_lossy() == *value => continue,
            _ => return None,
        }
    }
    let properties = device
        .properties()
        .map(|p| (p.name().to_string_lossy().into_owned(), p.value().to_string_lossy().into_owned()))
        .collect();
    Some(RawDevice {
        devnode: devnode.to_path_buf(),
        properties,
    })
}

impl Stream for DeviceMonitor {
    type Item = Result<DeviceEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if !self.pending.is_empty() {
            return Poll::Ready(self.try_read().transpose());
        }
        let fd = self.socket.clone();
        loop {
            let mut guard = ready!(fd.poll_read_ready(cx))?;
            match self.try_read() {
                Ok(Some(event)) => break Poll::Ready(Some(Ok(event))),
                Err(err) => break Poll::Ready(Some(Err(err))),
                Ok(None) => {
                    guard.clear_ready();
                    continue;
                }
            }
        }
    }
}
