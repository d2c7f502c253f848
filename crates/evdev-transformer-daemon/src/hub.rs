//! The reconciliation loop: keeps live device state, configuration state,
//! and forwarder workers consistent.
//!
//! `update_links_sync` is the only place that mutates the hub's bookkeeping
//! and runs entirely under `state`, a `std::sync::Mutex` never held across
//! an `.await` — it returns a worklist of new bindings, and the caller
//! builds destinations and spawns forwarders for that worklist afterwards,
//! outside the lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use evdev::InputEvent;
use evdev_transformer_config::{Destination as DestinationConfig, SourceIdentifier, SourceKind};
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::activator;
use crate::config_store::{ConfigEntity, ConfigEvent, ConfigStore};
use crate::destination::Destination;
use crate::device_monitor::{DeviceEvent, DeviceMonitor, RawDevice, UdevAttrs};
use crate::source::{self, SourceDevice};
use crate::transform;

struct HubState {
    sources: Vec<Arc<SourceDevice>>,
    /// source name -> bound destination name.
    activations: HashMap<String, String>,
    forwarder_handles: Vec<JoinHandle<()>>,
}

/// A binding decided during `update_links_sync` that still needs a
/// destination device (possibly a fresh one) and a forwarder.
struct BindTask {
    source_name: String,
    group_name: String,
    destination_cfg: DestinationConfig,
    device: Arc<SourceDevice>,
}

enum MonitorCommand {
    Add(UdevAttrs),
    Remove(UdevAttrs),
}

pub struct Hub {
    config_store: Arc<ConfigStore>,
    state: Mutex<HubState>,
    destinations: AsyncMutex<HashMap<(String, String), Arc<AsyncMutex<Destination>>>>,
}

impl Hub {
    pub fn new(config_store: Arc<ConfigStore>) -> Arc<Self> {
        Arc::new(Self {
            config_store,
            state: Mutex::new(HubState {
                sources: Vec::new(),
                activations: HashMap::new(),
                forwarder_handles: Vec::new(),
            }),
            destinations: AsyncMutex::new(HashMap::new()),
        })
    }

    /// Drives the whole daemon: the device monitor loop (and the commands
    /// that mutate it), the config-store event consumer, and, if given,
    /// the IPC listener. Runs until one of those producers ends.
    pub async fn run(
        self: &Arc<Self>,
        mut device_monitor: DeviceMonitor,
        ipc_listener: Option<crate::ipc::IpcListener>,
    ) -> anyhow::Result<()> {
        let (monitor_cmd_tx, mut monitor_cmd_rx) = mpsc::unbounded_channel::<MonitorCommand>();

        let mut config_events = self
            .config_store
            .events()
            .expect("config store events() consumed exactly once, by the hub");
        {
            let hub = self.clone();
            let monitor_cmd_tx = monitor_cmd_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = config_events.recv().await {
                    hub.handle_config_event(event, &monitor_cmd_tx);
                }
            });
        }

        if let Some(listener) = ipc_listener {
            let hub = self.clone();
            tokio::spawn(async move {
                if let Err(err) = listener.serve(hub).await {
                    tracing::error!(error = %err, "IPC listener stopped");
                }
            });
        }

        loop {
            tokio::select! {
                cmd = monitor_cmd_rx.recv() => {
                    match cmd {
                        Some(MonitorCommand::Add(attrs)) => device_monitor.add_monitored_attrs(attrs),
                        Some(MonitorCommand::Remove(attrs)) => device_monitor.remove_monitored_attrs(&attrs),
                        None => break,
                    }
                }
                event = device_monitor.next() => {
                    match event {
                        Some(Ok(DeviceEvent::Add { device, matched })) => self.handle_device_add(device, matched),
                        Some(Ok(DeviceEvent::Remove { device, matched })) => self.handle_device_remove(device, matched),
                        Some(Err(err)) => tracing::warn!(error = %err, "device monitor read error"),
                        None => break,
                    }
                }
            }
        }

        Ok(())
    }

    /// Releases every currently attached source and waits for their
    /// release epilogues (and forwarders) to finish, so shutdown leaves no
    /// held key or active MT contact on any destination.
    pub async fn shutdown(self: &Arc<Self>) {
        let handles = {
            let mut state = self.state.lock().unwrap();
            for source in &state.sources {
                source.release();
            }
            std::mem::take(&mut state.forwarder_handles)
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn handle_config_event(
        self: &Arc<Self>,
        event: ConfigEvent,
        monitor_cmd_tx: &mpsc::UnboundedSender<MonitorCommand>,
    ) {
        match event {
            ConfigEvent::Add(ConfigEntity::Source(source)) => {
                if let SourceKind::EvdevUdev { udev_attrs } = &source.kind {
                    let _ = monitor_cmd_tx.send(MonitorCommand::Add(udev_attrs.clone()));
                }
                // EvdevUnixSocket sources have no udev rule to register;
                // they arrive through the IPC listener instead, matched by
                // identifier once connected.
            }
            ConfigEvent::Remove(ConfigEntity::Source(source)) => {
                if let SourceKind::EvdevUdev { udev_attrs } = &source.kind {
                    let _ = monitor_cmd_tx.send(MonitorCommand::Remove(udev_attrs.clone()));
                }
            }
            ConfigEvent::Add(ConfigEntity::Link(_)) | ConfigEvent::Remove(ConfigEntity::Link(_)) => {
                self.reconcile();
            }
            ConfigEvent::Add(ConfigEntity::SourceGroup(_))
            | ConfigEvent::Remove(ConfigEntity::SourceGroup(_))
            | ConfigEvent::Add(ConfigEntity::Destination(_))
            | ConfigEvent::Remove(ConfigEntity::Destination(_)) => {}
        }
    }

    fn handle_device_add(self: &Arc<Self>, device: RawDevice, matched: UdevAttrs) {
        let devnode = device.devnode.clone();
        let raw = match evdev::Device::open(&devnode) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(devnode = %devnode.display(), error = %err, "failed to open attached device");
                return;
            }
        };
        let name = raw.name().unwrap_or("Input Device").to_string();
        let identifier = SourceIdentifier::UdevAttrs(matched);
        match SourceDevice::new(name, identifier, raw) {
            Ok(source) => self.add_source(Arc::new(source)),
            Err(err) => tracing::warn!(devnode = %devnode.display(), error = %err, "failed to initialize source device"),
        }
    }

    fn handle_device_remove(self: &Arc<Self>, _device: RawDevice, matched: UdevAttrs) {
        let identifier = SourceIdentifier::UdevAttrs(matched);
        {
            let mut state = self.state.lock().unwrap();
            if let Some(pos) = state.sources.iter().position(|s| s.identifier == identifier) {
                state.sources.remove(pos).release();
            }
        }
        self.reconcile();
    }

    /// Registers an already-constructed source (evdev or IPC) and
    /// immediately reconciles against it.
    pub fn add_source(self: &Arc<Self>, source: Arc<SourceDevice>) {
        self.state.lock().unwrap().sources.push(source);
        self.reconcile();
    }

    /// Recomputes bindings and, if anything needs a new destination or
    /// forwarder, finishes the work on a spawned task.
    pub fn reconcile(self: &Arc<Self>) {
        let binds = self.update_links_sync();
        if binds.is_empty() {
            return;
        }
        let hub = self.clone();
        tokio::spawn(async move {
            hub.process_binds(binds).await;
        });
    }

    /// The reconciliation pass, synchronous: all bookkeeping mutation
    /// happens here, under one lock acquisition for the whole pass, with
    /// no `.await` inside it.
    fn update_links_sync(self: &Arc<Self>) -> Vec<BindTask> {
        let mut state = self.state.lock().unwrap();
        let mut seen: HashSet<String> = HashSet::new();
        let mut binds = Vec::new();
        let mut stale_indices: Vec<usize> = Vec::new();

        for resolved in self.config_store.current_links() {
            for source_cfg in &resolved.sources {
                seen.insert(source_cfg.name.clone());
                let identifier = source_cfg.identifier();

                let mut matching: Vec<usize> = state
                    .sources
                    .iter()
                    .enumerate()
                    .filter(|(_, d)| d.identifier == identifier)
                    .map(|(i, _)| i)
                    .collect();

                if matching.is_empty() {
                    state.activations.remove(&source_cfg.name);
                    continue;
                }

                if let Some(current_destination) = state.activations.get(&source_cfg.name) {
                    if current_destination != &resolved.destination.name {
                        for &i in &matching {
                            state.sources[i].release();
                        }
                        state.activations.remove(&source_cfg.name);
                        // Handover property: don't rebind in this same pass.
                        // The old forwarder's run() holds the device's event
                        // lock until its release epilogue completes; binding
                        // here would race it. Once that run() returns, its
                        // task re-enters `reconcile()` and a later pass binds
                        // the new destination against a device it can
                        // actually lock.
                        continue;
                    }
                }

                // Keep the most recently attached match (highest index,
                // since `sources` is appended to in attach order);
                // release and discard any earlier duplicate.
                let keep = matching.pop().expect("matching is non-empty");
                for stale in matching {
                    state.sources[stale].release();
                    stale_indices.push(stale);
                }

                let device = state.sources[keep].clone();
                device.set_transforms(transform::Transform::chain_from_config(&source_cfg.transforms));
                device.set_activators(activator::Activator::list_from_config(&resolved.link.activators));

                if !state.activations.contains_key(&source_cfg.name) {
                    state
                        .activations
                        .insert(source_cfg.name.clone(), resolved.destination.name.clone());
                    binds.push(BindTask {
                        source_name: source_cfg.name.clone(),
                        group_name: resolved.link.source_group.clone(),
                        destination_cfg: resolved.destination.clone(),
                        device,
                    });
                }
            }
        }

        state.activations.retain(|name, _| seen.contains(name));

        stale_indices.sort_unstable();
        stale_indices.dedup();
        for &i in stale_indices.iter().rev() {
            state.sources.remove(i);
        }

        binds
    }

    async fn process_binds(self: Arc<Self>, binds: Vec<BindTask>) {
        for bind in binds {
            let destination = match self
                .get_or_build_destination(&bind.source_name, &bind.destination_cfg, &bind.device)
                .await
            {
                Ok(destination) => destination,
                Err(err) => {
                    tracing::warn!(
                        source = %bind.source_name,
                        destination = %bind.destination_cfg.name,
                        error = %err,
                        "failed to build destination device; dropping activation"
                    );
                    self.state.lock().unwrap().activations.remove(&bind.source_name);
                    continue;
                }
            };
            self.spawn_forwarder(bind.device, destination, bind.group_name);
        }
    }

    async fn get_or_build_destination(
        &self,
        source_name: &str,
        destination_cfg: &DestinationConfig,
        device: &SourceDevice,
    ) -> anyhow::Result<Arc<AsyncMutex<Destination>>> {
        let key = (source_name.to_string(), destination_cfg.name.clone());
        let mut cache = self.destinations.lock().await;
        if let Some(existing) = cache.get(&key) {
            return Ok(existing.clone());
        }
        let built = Destination::build(&destination_cfg.kind, &destination_cfg.name, &device.descriptor).await?;
        let built = Arc::new(AsyncMutex::new(built));
        cache.insert(key, built.clone());
        Ok(built)
    }

    /// One forwarder per bind: a task that watches for an activator match
    /// and cycles the link, a task that runs the source's pipeline, and a
    /// task that writes every batch the pipeline produces to the bound
    /// destination. All three end on their own once the source releases.
    fn spawn_forwarder(
        self: &Arc<Self>,
        device: Arc<SourceDevice>,
        destination: Arc<AsyncMutex<Destination>>,
        group_name: String,
    ) {
        let (activator_tx, mut activator_rx) =
            mpsc::unbounded_channel::<evdev_transformer_config::Activator>();
        device.set_activator_channel(Some(activator_tx));

        let config_store = self.config_store.clone();
        tokio::spawn(async move {
            while let Some(activator) = activator_rx.recv().await {
                if let Err(err) = config_store.cycle_link(&group_name, Some(&activator)) {
                    tracing::warn!(group = %group_name, error = %err, "activator fired but the link could not be cycled");
                }
            }
        });

        let (tx, mut rx) = mpsc::channel::<Vec<InputEvent>>(source::BATCH_CHANNEL_CAPACITY);

        let run_device = device.clone();
        let hub = self.clone();
        let run_handle = tokio::spawn(async move {
            if let Err(err) = run_device.run(tx).await {
                tracing::warn!(source = %run_device.name, error = %err, "source device pipeline terminated");
            }
            // The device's event lock is free now: re-enter reconciliation
            // so a pending handover (or a reattach) can bind it again.
            hub.reconcile();
        });
        self.state.lock().unwrap().forwarder_handles.push(run_handle);

        let forward_name = device.name.clone();
        tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                let mut sink = destination.lock().await;
                if let Err(err) = sink.write_batch(&batch).await {
                    tracing::warn!(source = %forward_name, error = %err, "destination write failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use evdev_transformer_config::{
        Activator, Config, Destination as DestinationConfig, DestinationKind, HotkeySpec, Link,
        Source, SourceGroup, SourceKind,
    };

    use super::*;

    fn source_named(name: &str) -> Source {
        Source {
            name: name.to_string(),
            kind: SourceKind::EvdevUdev {
                udev_attrs: BTreeMap::new(),
            },
            transforms: vec![],
        }
    }

    fn config_with_two_destinations() -> Config {
        Config {
            config_version: 1,
            sources: vec![source_named("kbd")],
            source_groups: vec![SourceGroup {
                name: "main".into(),
                sources: vec!["kbd".into()],
            }],
            destinations: vec![
                DestinationConfig {
                    name: "work".into(),
                    kind: DestinationKind::Uinput {},
                },
                DestinationConfig {
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
                            modifiers: vec![],
                        },
                    }],
                },
                Link {
                    source_group: "main".into(),
                    destination: "game".into(),
                    activators: vec![Activator::Hotkey {
                        hotkey: HotkeySpec {
                            key: "KEY_F2".into(),
                            modifiers: vec![],
                        },
                    }],
                },
            ],
        }
    }

    fn hub_with(config: Config) -> Arc<Hub> {
        Hub::new(Arc::new(ConfigStore::new(config)))
    }

    #[test]
    fn unmatched_source_binds_once() {
        let hub = hub_with(config_with_two_destinations());
        hub.state
            .lock()
            .unwrap()
            .sources
            .push(Arc::new(SourceDevice::new_bare(false)));

        let binds = hub.update_links_sync();
        assert_eq!(binds.len(), 1);
        assert_eq!(binds[0].source_name, "kbd");
        assert_eq!(binds[0].destination_cfg.name, "work");
        assert_eq!(
            hub.state.lock().unwrap().activations.get("kbd").unwrap(),
            "work"
        );

        // A second pass with nothing changed produces no further binds: the
        // activation already exists.
        assert!(hub.update_links_sync().is_empty());
    }

    #[test]
    fn duplicate_attach_keeps_newest_and_releases_earlier() {
        let hub = hub_with(config_with_two_destinations());
        let first = Arc::new(SourceDevice::new_bare(false));
        let second = Arc::new(SourceDevice::new_bare(false));
        {
            let mut state = hub.state.lock().unwrap();
            state.sources.push(first.clone());
            state.sources.push(second.clone());
        }

        let binds = hub.update_links_sync();
        assert_eq!(binds.len(), 1);
        assert!(Arc::ptr_eq(&binds[0].device, &second));
        assert_eq!(hub.state.lock().unwrap().sources.len(), 1);
        assert!(Arc::ptr_eq(&hub.state.lock().unwrap().sources[0], &second));
    }

    #[test]
    fn cycling_the_link_defers_rebind_to_a_later_pass() {
        let hub = hub_with(config_with_two_destinations());
        hub.state
            .lock()
            .unwrap()
            .sources
            .push(Arc::new(SourceDevice::new_bare(false)));

        assert_eq!(hub.update_links_sync().len(), 1);
        hub.config_store.cycle_link("main", None).unwrap();

        // The destination changed under an existing activation: this pass
        // releases and forgets the old binding but does not immediately
        // rebind, so the freshly-released device isn't raced by a second
        // concurrent forwarder.
        let binds = hub.update_links_sync();
        assert!(binds.is_empty());
        assert!(!hub.state.lock().unwrap().activations.contains_key("kbd"));

        // Once the device's event lock is known free (as it would be after
        // the old forwarder's run() task calls reconcile()), the next pass
        // binds the new destination.
        let binds = hub.update_links_sync();
        assert_eq!(binds.len(), 1);
        assert_eq!(binds[0].destination_cfg.name, "game");
    }

    #[test]
    fn detached_source_is_forgotten() {
        let hub = hub_with(config_with_two_destinations());
        hub.state
            .lock()
            .unwrap()
            .sources
            .push(Arc::new(SourceDevice::new_bare(false)));
        assert_eq!(hub.update_links_sync().len(), 1);

        hub.state.lock().unwrap().sources.clear();
        let binds = hub.update_links_sync();
        assert!(binds.is_empty());
        assert!(!hub.state.lock().unwrap().activations.contains_key("kbd"));
    }
}
