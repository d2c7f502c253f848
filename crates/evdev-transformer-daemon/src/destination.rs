//! Virtual sinks. A destination mirrors a source's descriptor and accepts
//! synchronized event batches for as long as a link points at it.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{
    AbsInfo as EvdevAbsInfo, AbsoluteAxisType, AttributeSet, BusType, EventType, InputEvent,
    InputId, Key, RelativeAxisType, SwitchType, UinputAbsSetup,
};
use evdev_transformer_config::DestinationKind;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use crate::hid;
use crate::wire::{Descriptor, DescriptorEnvelope, EventBatchMessage};

/// How long to wait after creating a uinput device before the first write,
/// so userspace has registered the new node.
const SETTLING_DELAY: Duration = Duration::from_millis(100);

pub enum Destination {
    Uinput(UinputSink),
    Subprocess(SubprocessSink),
    HidGadget(HidGadgetSink),
}

impl Destination {
    pub async fn build(
        kind: &DestinationKind,
        name: &str,
        descriptor: &Descriptor,
    ) -> Result<Self> {
        match kind {
            DestinationKind::Uinput {} => Ok(Destination::Uinput(UinputSink::build(name, descriptor).await?)),
            DestinationKind::Subprocess { command } => Ok(Destination::Subprocess(
                SubprocessSink::spawn(command.clone(), name.to_string(), descriptor.clone()).await?,
            )),
            DestinationKind::HidGadget { device_path } => {
                Ok(Destination::HidGadget(HidGadgetSink::open(PathBuf::from(device_path))?))
            }
        }
    }

    pub async fn write_batch(&mut self, batch: &[InputEvent]) -> Result<()> {
        match self {
            Destination::Uinput(sink) => sink.write_batch(batch),
            Destination::Subprocess(sink) => sink.write_batch(batch).await,
            Destination::HidGadget(sink) => sink.write_batch(batch),
        }
    }
}

pub struct UinputSink {
    device: VirtualDevice,
}

impl UinputSink {
    async fn build(name: &str, descriptor: &Descriptor) -> Result<Self> {
        let mirrored_name = format!("{} (Virtual)", name);
        let mut builder = VirtualDeviceBuilder::new()?.name(&mirrored_name);

        builder = builder.input_id(InputId::new(
            BusType(descriptor.id.bustype),
            descriptor.id.vendor,
            descriptor.id.product,
            descriptor.id.version,
        ));

        if let Some(codes) = descriptor.evbits.get(&EventType::KEY.0) {
            let mut set = AttributeSet::<Key>::new();
            for &code in codes {
                set.insert(Key::new(code));
            }
            builder = builder.with_keys(&set)?;
        }

        if let Some(codes) = descriptor.evbits.get(&EventType::RELATIVE.0) {
            let mut set = AttributeSet::<RelativeAxisType>::new();
            for &code in codes {
                set.insert(RelativeAxisType(code));
            }
            builder = builder.with_relative_axes(&set)?;
        }

        if let Some(codes) = descriptor.evbits.get(&EventType::ABSOLUTE.0) {
            for &code in codes {
                let axis = AbsoluteAxisType(code);
                let info = descriptor.absinfo.get(&code);
                let abs_info = match info {
                    Some(i) => EvdevAbsInfo::new(i.value, i.minimum, i.maximum, i.fuzz, i.flat, i.resolution),
                    None => EvdevAbsInfo::new(0, 0, 0, 0, 0, 0),
                };
                builder = builder.with_absolute_axis(&UinputAbsSetup::new(axis, abs_info))?;
            }
        }

        if let Some(codes) = descriptor.evbits.get(&EventType::SWITCH.0) {
            let mut set = AttributeSet::<SwitchType>::new();
            for &code in codes {
                set.insert(SwitchType(code));
            }
            builder = builder.with_switches(&set)?;
        }

        // evdev's VirtualDeviceBuilder has no with_properties hook; the
        // input-property bitset (INPUT_PROP_*) is mirrored on a best-effort
        // basis only through the capability bits above.

        let device = builder.build().context("failed to create virtual uinput device")?;
        tokio::time::sleep(SETTLING_DELAY).await;
        Ok(Self { device })
    }

    fn write_batch(&mut self, batch: &[InputEvent]) -> Result<()> {
        self.device.emit(batch).context("uinput write failed")
    }
}

pub struct SubprocessSink {
    command: Vec<String>,
    name: String,
    descriptor: Descriptor,
    child: Child,
}

impl SubprocessSink {
    async fn spawn(command: Vec<String>, name: String, descriptor: Descriptor) -> Result<Self> {
        let mut child = Self::spawn_child(&command)?;
        Self::send_descriptor(&mut child, &name, &descriptor).await?;
        Ok(Self {
            command,
            name,
            descriptor,
            child,
        })
    }

    fn spawn_child(command: &[String]) -> Result<Child> {
        let (program, args) = command
            .split_first()
            .context("subprocess destination has an empty command")?;
        Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .spawn()
            .context("failed to spawn subprocess destination")
    }

    async fn send_descriptor(child: &mut Child, name: &str, descriptor: &Descriptor) -> Result<()> {
        let envelope = DescriptorEnvelope {
            host: hostname(),
            vendor: descriptor.id.vendor,
            product: descriptor.id.product,
            data: descriptor.clone(),
        };
        let _ = name;
        let stdin = child.stdin.as_mut().context("subprocess stdin unavailable")?;
        let mut line = serde_json::to_string(&envelope)?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn write_batch(&mut self, batch: &[InputEvent]) -> Result<()> {
        let message = EventBatchMessage::from_batch(batch);
        let mut line = serde_json::to_string(&message)?;
        line.push('\n');

        let write_result = match self.child.stdin.as_mut() {
            Some(stdin) => stdin.write_all(line.as_bytes()).await,
            None => Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "no stdin")),
        };

        if let Err(err) = write_result {
            tracing::warn!(destination = %self.name, error = %err, "subprocess destination pipe broken, respawning");
            self.child = Self::spawn_child(&self.command)?;
            Self::send_descriptor(&mut self.child, &self.name, &self.descriptor).await?;
            let stdin = self.child.stdin.as_mut().context("subprocess stdin unavailable")?;
            stdin.write_all(line.as_bytes()).await?;
        }
        Ok(())
    }
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|s| s.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

pub struct HidGadgetSink {
    file: std::fs::File,
    pressed: HashSet<Key>,
}

impl HidGadgetSink {
    fn open(device_path: PathBuf) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&device_path)
            .with_context(|| format!("failed to open HID gadget device {}", device_path.display()))?;
        Ok(Self {
            file,
            pressed: HashSet::new(),
        })
    }

    fn write_batch(&mut self, batch: &[InputEvent]) -> Result<()> {
        use std::io::Write;
        let mut dirty = false;
        for event in batch {
            if event.event_type() != EventType::KEY {
                continue;
            }
            let key = Key::new(event.code());
            match event.value() {
                1 => {
                    dirty |= self.pressed.insert(key);
                }
                0 => {
                    dirty |= self.pressed.remove(&key);
                }
                _ => {}
            }
        }
        if !dirty {
            return Ok(());
        }
        let pressed: Vec<Key> = self.pressed.iter().copied().collect();
        let report = hid::boot_keyboard_report(&pressed);
        self.file.write_all(&report).context("HID gadget write failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hid_gadget_writes_one_report_per_dirty_batch() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut sink = HidGadgetSink::open(file.path().to_path_buf()).unwrap();

        sink.write_batch(&[InputEvent::new(EventType::KEY, Key::KEY_A.code(), 1)])
            .unwrap();
        // Unrelated event, no key state change: no second report written.
        sink.write_batch(&[InputEvent::new(EventType::RELATIVE, 0, 1)])
            .unwrap();
        sink.write_batch(&[InputEvent::new(EventType::KEY, Key::KEY_A.code(), 0)])
            .unwrap();

        let written = std::fs::read(file.path()).unwrap();
        assert_eq!(written.len(), 16);
        assert_eq!(written[2], hid::hid_usage(Key::KEY_A).unwrap());
        assert_eq!(&written[8..16], &[0u8; 8]);
    }
}
