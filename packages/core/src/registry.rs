//! The volume registry.
//!
//! Owns the canonical volume list and reconciles the two sources of truth,
//! device records and mount table changes, into create/update/remove
//! transitions. Every transition is announced on the event bus and then run
//! through the automount policy.
//!
//! All methods run on the caller's thread. Commands are handed to the
//! [`TaskRunner`] and never awaited.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use nix::unistd::{AccessFlags, access};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::device::{DeviceReader, DeviceRecord};
use crate::error::{Error, Result};
use crate::events::{EventBus, SubscriptionId, VolumeEvent, VolumeObserver};
use crate::executor::{Task, TaskPurpose, TaskRunner};
use crate::handler::{self, HandlerAction, HandlerMode, ProgramLocator, ResolvedCommand};
use crate::mountinfo::{self, DevNum, Devmount, MTAB_PATH, MountTable};
use crate::netmount::{self, Netmount};
use crate::policy::{self, UnmountReason};
use crate::volume::{Volume, VolumeKind};

/// Which configured hook to run.
#[derive(Debug, Clone, Copy)]
enum Hook {
    Insert,
    Mount,
    Unmount,
    Remove,
}

pub struct VolumeRegistry {
    settings: Settings,
    reader: DeviceReader,
    mount_table: MountTable,
    mtab_path: PathBuf,
    volumes: Vec<Volume>,
    bus: EventBus,
    runner: Box<dyn TaskRunner>,
    locator: Box<dyn ProgramLocator>,
    automount: bool,
}

impl VolumeRegistry {
    pub fn new(
        settings: Settings,
        runner: Box<dyn TaskRunner>,
        locator: Box<dyn ProgramLocator>,
    ) -> Self {
        Self {
            settings,
            reader: DeviceReader::default(),
            mount_table: MountTable::default(),
            mtab_path: PathBuf::from(MTAB_PATH),
            volumes: Vec::new(),
            bus: EventBus::new(),
            runner,
            locator,
            automount: false,
        }
    }

    pub fn with_reader(mut self, reader: DeviceReader) -> Self {
        self.reader = reader;
        self
    }

    pub fn with_mount_table(mut self, mount_table: MountTable) -> Self {
        self.mount_table = mount_table;
        self
    }

    pub fn with_mtab_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.mtab_path = path.into();
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn mount_table(&self) -> &MountTable {
        &self.mount_table
    }

    /// Enables or disables automount for subsequent transitions.
    pub fn set_automount(&mut self, automount: bool) {
        self.automount = automount;
    }

    /// Reads the mount table and every block device present, then every
    /// non-block mount.
    pub fn init(&mut self, automount: bool) -> Result<()> {
        self.automount = automount;
        self.mount_table.refresh(false)?;

        for record in self.reader.enumerate()? {
            self.device_added(&record);
        }

        let untracked: Vec<Devmount> = self
            .mount_table
            .devmounts()
            .iter()
            .filter(|d| self.index_of(d.devnum).is_none())
            .filter(|d| d.devnum.is_anonymous() || self.reader.lookup(d.devnum).is_none())
            .cloned()
            .collect();
        for devmount in untracked {
            self.nonblock_changed(&devmount);
        }

        info!("volume registry initialized with {} volumes", self.volumes.len());
        Ok(())
    }

    pub fn subscribe(&mut self, observer: impl VolumeObserver + 'static) -> SubscriptionId {
        self.bus.subscribe(observer)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    pub fn volumes(&self) -> &[Volume] {
        &self.volumes
    }

    /// Volumes the visibility settings surface to UI-facing consumers.
    pub fn visible_volumes(&self) -> Vec<&Volume> {
        self.volumes
            .iter()
            .filter(|v| policy::is_volume_visible(v, &self.settings.visibility))
            .collect()
    }

    /// Finds a volume by device file, unique id or mount point.
    pub fn volume_by_device(&self, device: &str) -> Option<&Volume> {
        self.volumes.iter().find(|v| {
            v.device_file == device
                || v.udi == device
                || v.mount_point
                    .as_deref()
                    .is_some_and(|p| p.as_os_str() == device)
        })
    }

    pub fn volume_by_devnum(&self, devnum: DevNum) -> Option<&Volume> {
        self.volumes.iter().find(|v| v.devnum == devnum)
    }

    fn index_of(&self, devnum: DevNum) -> Option<usize> {
        self.volumes.iter().position(|v| v.devnum == devnum)
    }

    /// Handles an add or change record for a block device.
    pub fn device_added(&mut self, record: &DeviceRecord) {
        if record.subsystem().is_some_and(|s| s != "block") {
            return;
        }
        let device = match self.reader.read(record, self.mount_table.devmounts()) {
            Ok(device) => device,
            Err(e) => {
                debug!("dropping device record: {}", e);
                return;
            }
        };
        let fresh = Volume::from_device(&device, &self.settings.display);

        match self.index_of(fresh.devnum) {
            Some(idx) => self.update_volume(idx, fresh),
            None => self.add_volume(fresh),
        }
    }

    /// Handles a remove record: runs the remove hook, unmounts if still
    /// mounted, then forgets the volume.
    pub fn device_removed(&mut self, record: &DeviceRecord) {
        let Some(idx) = record.devnum().and_then(|d| self.index_of(d)) else {
            return;
        };
        let volume = self.volumes[idx].clone();

        self.run_hook(Hook::Remove, &volume);
        if volume.is_mounted
            && volume.is_block()
            && let Err(e) = self.execute(HandlerAction::Unmount, &volume)
        {
            warn!("unmount of removed {} failed: {}", volume.device_file, e);
        }

        self.volumes.remove(idx);
        info!("volume removed: {}", volume.device_file);
        self.bus.emit(&VolumeEvent::Removed(volume));
    }

    /// Re-reads the mount table and applies every changed entry.
    pub fn mount_table_changed(&mut self) -> Result<()> {
        let changed = self.mount_table.refresh(true)?;

        for devmount in changed {
            let known_block = self
                .index_of(devmount.devnum)
                .is_some_and(|idx| self.volumes[idx].is_block());
            let record = if devmount.devnum.is_anonymous() {
                None
            } else {
                self.reader.lookup(devmount.devnum)
            };

            match record {
                Some(record) => self.device_added(&record),
                None if known_block => {
                    if let Some(idx) = self.index_of(devmount.devnum) {
                        let mut fresh = self.volumes[idx].clone();
                        fresh.set_mount_points(&devmount.mount_points);
                        fresh.refresh_presentation(&self.settings.display);
                        self.update_volume(idx, fresh);
                    }
                }
                None => self.nonblock_changed(&devmount),
            }
        }

        self.cleanup_stale_nonblock();
        Ok(())
    }

    /// Creates, updates or removes a network or other volume for a mount
    /// table entry that has no device record.
    fn nonblock_changed(&mut self, devmount: &Devmount) {
        let idx = self.index_of(devmount.devnum);

        if !devmount.is_mounted() {
            if let Some(idx) = idx {
                self.remove_nonblock(idx);
            }
            return;
        }

        let fresh = self.classify_nonblock(devmount);
        match (idx, fresh) {
            (Some(idx), Some(fresh)) if self.volumes[idx].kind() == fresh.kind() => {
                self.update_volume(idx, fresh)
            }
            (Some(idx), Some(fresh)) => {
                self.remove_nonblock(idx);
                self.add_volume(fresh);
            }
            (None, Some(fresh)) => self.add_volume(fresh),
            (Some(idx), None) => self.remove_nonblock(idx),
            (None, None) => {}
        }
    }

    fn classify_nonblock(&self, devmount: &Devmount) -> Option<Volume> {
        let point = devmount.primary_mount_point()?;
        let mut fstype = devmount.fstype.clone();
        let mut source = devmount.source.clone().filter(|s| s != "none");

        if source.is_none() {
            let mtab = fs::read_to_string(&self.mtab_path).ok()?;
            let (mtab_source, mtab_fstype) = mountinfo::mtab_source(&mtab, point)?;
            source = Some(mtab_source);
            fstype = fstype.or(Some(mtab_fstype));
        }
        let source = source?;

        match network_source(&source, fstype.as_deref()) {
            Ok(net) => Some(Volume::network(devmount, &net, &self.settings.display)),
            Err(Error::InvalidNetworkUrl { url, message }) => {
                debug!("ignoring mount of '{}': {}", url, message);
                None
            }
            Err(_) => self
                .other_allowed(fstype.as_deref(), point)
                .then(|| Volume::other(devmount, &source, &self.settings.display)),
        }
    }

    /// Filter for other mounts: fstype not blacklisted, mount point readable
    /// and under an allowed path (fuse mounts may live anywhere).
    fn other_allowed(&self, fstype: Option<&str>, point: &Path) -> bool {
        let other = &self.settings.other;
        let fstype = fstype.unwrap_or_default();
        if other.blacklist_fstypes.iter().any(|b| b == fstype) {
            return false;
        }
        let is_fuse = fstype.starts_with("fuse");
        if !is_fuse && !other.allow_paths.iter().any(|p| point.starts_with(p)) {
            return false;
        }
        access(point, AccessFlags::R_OK).is_ok()
    }

    fn remove_nonblock(&mut self, idx: usize) {
        let volume = self.volumes.remove(idx);
        self.run_hook(Hook::Unmount, &volume);
        info!("volume removed: {}", volume.device_file);
        self.bus.emit(&VolumeEvent::Removed(volume));
    }

    /// Removes network and other volumes whose device number is gone from
    /// the current mount table.
    pub fn cleanup_stale_nonblock(&mut self) {
        let devmounts = self.mount_table.devmounts();
        let stale: Vec<DevNum> = self
            .volumes
            .iter()
            .filter(|v| !v.is_block())
            .filter(|v| !devmounts.get(v.devnum).is_some_and(|d| d.is_mounted()))
            .map(|v| v.devnum)
            .collect();

        for devnum in stale {
            if let Some(idx) = self.index_of(devnum) {
                self.remove_nonblock(idx);
            }
        }
    }

    fn add_volume(&mut self, mut volume: Volume) {
        if volume.is_mounted {
            volume.ever_mounted = true;
        }
        info!("volume added: {} ({})", volume.device_file, volume.disp_name);
        let inserted = volume.is_block() && volume.removable && volume.media_available;

        self.volumes.push(volume.clone());
        self.bus.emit(&VolumeEvent::Added(volume.clone()));
        if inserted {
            self.run_hook(Hook::Insert, &volume);
        }

        let idx = self.volumes.len() - 1;
        self.apply_policy(idx);
    }

    /// Folds fresh state into an existing volume and applies the mount and
    /// eject transitions.
    fn update_volume(&mut self, idx: usize, fresh: Volume) {
        let volume = &mut self.volumes[idx];
        let was_mounted = volume.is_mounted;
        let had_media = volume.media_available;
        let automounted = volume.automount_time.is_some();

        let changed = volume.refresh_from(&fresh);
        let mut ejected = false;

        if !was_mounted && volume.is_mounted {
            volume.ever_mounted = true;
            volume.automount_time = None;
        }
        if was_mounted && !volume.is_mounted {
            volume.should_autounmount = false;
            if volume.removable && !volume.media_available {
                volume.ever_mounted = false;
                volume.inhibit_auto = false;
                ejected = true;
            }
        }
        if volume.is_mounted && volume.removable && !volume.media_available {
            volume.should_autounmount = true;
        }
        if !volume.media_available && !volume.is_mounted {
            volume.ever_mounted = false;
            volume.inhibit_auto = false;
        }

        let snapshot = volume.clone();
        if changed {
            debug!("volume changed: {}", snapshot.device_file);
            self.bus.emit(&VolumeEvent::Changed(snapshot.clone()));
        }
        if ejected {
            info!("media ejected from {}", snapshot.device_file);
            self.bus.emit(&VolumeEvent::Ejected(snapshot.clone()));
        }

        if !was_mounted && snapshot.is_mounted && automounted {
            self.run_hook(Hook::Mount, &snapshot);
        }
        if was_mounted && !snapshot.is_mounted {
            self.run_hook(Hook::Unmount, &snapshot);
        }
        if !had_media && snapshot.media_available && snapshot.removable && snapshot.is_block() {
            self.run_hook(Hook::Insert, &snapshot);
        }

        self.apply_policy(idx);
    }

    /// Runs the autounmount and automount decisions for one volume.
    fn apply_policy(&mut self, idx: usize) {
        let volume = &self.volumes[idx];
        if policy::should_autounmount(volume, &self.settings.automount, UnmountReason::Transition) {
            let volume = volume.clone();
            self.volumes[idx].should_autounmount = false;
            match self.execute(HandlerAction::Unmount, &volume) {
                Ok(resolved) => info!("autounmount {} via {}", volume.device_file, resolved.handler),
                Err(e) => warn!("autounmount of {} failed: {}", volume.device_file, e),
            }
            return;
        }

        if !self.automount {
            return;
        }
        let volume = &mut self.volumes[idx];
        if !policy::should_automount(volume, &self.settings.automount, Instant::now()) {
            return;
        }
        let volume = volume.clone();
        match self.execute(HandlerAction::Mount, &volume) {
            Ok(resolved) => info!("automount {} via {}", volume.device_file, resolved.handler),
            Err(e) if e.is_no_handler() => info!("not automounting {}: {}", volume.device_file, e),
            Err(e) => warn!("automount of {} failed: {}", volume.device_file, e),
        }
    }

    /// Resolves the command for a user action without running it.
    pub fn resolve_command(&self, device: &str, action: HandlerAction) -> Result<ResolvedCommand> {
        let volume = self
            .volume_by_device(device)
            .ok_or_else(|| Error::NoHandlerFound {
                action: action.to_string(),
                target: device.to_string(),
            })?;
        self.resolve(action, volume)
    }

    fn resolve(&self, action: HandlerAction, volume: &Volume) -> Result<ResolvedCommand> {
        let net = match volume.kind() {
            VolumeKind::Network => Some(network_source(
                &volume.device_file,
                volume.fs_type.as_deref(),
            )?),
            VolumeKind::Block | VolumeKind::Other => None,
        };
        let mode = match net {
            Some(_) => HandlerMode::Network,
            None => HandlerMode::Filesystem,
        };
        handler::resolve(
            mode,
            action,
            volume,
            net.as_ref(),
            &self.settings,
            self.locator.as_ref(),
        )
    }

    fn execute(&mut self, action: HandlerAction, volume: &Volume) -> Result<ResolvedCommand> {
        let resolved = self.resolve(action, volume)?;
        let purpose = match action {
            HandlerAction::Mount => TaskPurpose::Mount,
            HandlerAction::Unmount => TaskPurpose::Unmount,
            HandlerAction::Properties => TaskPurpose::Properties,
        };
        self.runner
            .run(&Task::from_resolved(resolved.clone(), purpose))?;
        Ok(resolved)
    }

    /// Mounts a volume on user request.
    pub fn mount(&mut self, device: &str) -> Result<ResolvedCommand> {
        self.user_action(device, HandlerAction::Mount)
    }

    /// Unmounts a volume on user request. Automount stays off for it until
    /// its media is ejected.
    pub fn unmount(&mut self, device: &str) -> Result<ResolvedCommand> {
        let resolved = self.user_action(device, HandlerAction::Unmount)?;
        if let Some(devnum) = self.volume_by_device(device).map(|v| v.devnum)
            && let Some(idx) = self.index_of(devnum)
        {
            self.volumes[idx].inhibit_auto = true;
        }
        Ok(resolved)
    }

    pub fn properties(&mut self, device: &str) -> Result<ResolvedCommand> {
        self.user_action(device, HandlerAction::Properties)
    }

    fn user_action(&mut self, device: &str, action: HandlerAction) -> Result<ResolvedCommand> {
        let volume = self
            .volume_by_device(device)
            .cloned()
            .ok_or_else(|| Error::NoHandlerFound {
                action: action.to_string(),
                target: device.to_string(),
            })?;
        self.execute(action, &volume)
    }

    fn run_hook(&mut self, hook: Hook, volume: &Volume) {
        let hooks = &self.settings.hooks;
        let template = match hook {
            Hook::Insert => &hooks.insert,
            Hook::Mount => &hooks.mount,
            Hook::Unmount => &hooks.unmount,
            Hook::Remove => &hooks.remove,
        };
        let Some(template) = template.as_deref().filter(|t| !t.trim().is_empty()) else {
            return;
        };

        let command = expand_hook(template, volume);
        debug!("running {:?} hook for {}", hook, volume.device_file);
        if let Err(e) = self.runner.run(&Task::new(command, false, TaskPurpose::Hook)) {
            warn!("{:?} hook for {} failed: {}", hook, volume.device_file, e);
        }
    }

    /// Tears the registry down: clears observers and unmounts what the
    /// exit policy allows.
    pub fn shutdown(mut self) {
        self.bus.clear();
        let volumes = std::mem::take(&mut self.volumes);
        for volume in volumes {
            if !policy::should_autounmount(&volume, &self.settings.automount, UnmountReason::Exit) {
                continue;
            }
            if let Err(e) = self.execute(HandlerAction::Unmount, &volume) {
                warn!("unmount of {} on exit failed: {}", volume.device_file, e);
            }
        }
        info!("volume registry shut down");
    }
}

/// Splits a network mount source, letting the mounted filesystem type
/// refine the protocol (`user@host:/path` mounted by sshfs is ssh, not nfs).
fn network_source(source: &str, fstype: Option<&str>) -> Result<Netmount> {
    let net = netmount::split(source)?;
    Ok(match fstype.and_then(netmount::protocol_for_fstype) {
        Some(protocol) if protocol != net.protocol => net.with_protocol(protocol),
        _ => net,
    })
}

/// Expands hook variables: `%v` device, `%m` mount point, `%l` label,
/// `%t` fstype, `%i` unique id.
fn expand_hook(template: &str, volume: &Volume) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let value = match chars.next() {
            Some('v') => volume.device_file.clone(),
            Some('m') => volume
                .mount_point
                .as_deref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Some('l') => volume.label.clone().unwrap_or_default(),
            Some('t') => volume.fs_type.clone().unwrap_or_default(),
            Some('i') => volume.udi.clone(),
            Some('%') => {
                out.push('%');
                continue;
            }
            Some(other) => {
                out.push('%');
                out.push(other);
                continue;
            }
            None => {
                out.push('%');
                continue;
            }
        };
        out.push_str(&handler::shell_quote(&value));
    }
    out
}
