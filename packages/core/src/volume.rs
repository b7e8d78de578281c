//! The canonical volume model.
//!
//! A [`Volume`] is one mountable or mounted entity: a block device, a
//! network share or some other special mount. Block volumes are built from
//! a [`Device`] descriptor; the others from a mount table entry.

use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;

use crate::config::DisplaySettings;
use crate::device::Device;
use crate::mountinfo::{DevNum, Devmount};
use crate::netmount::Netmount;

/// What a volume is backed by. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeKind {
    Block,
    Network,
    Other,
}

/// Icon chosen for a volume's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IconKey {
    Audiocd,
    OpticalMounted,
    OpticalMedia,
    OpticalNomedia,
    FloppyMounted,
    FloppyUnmounted,
    RemoveMounted,
    RemoveUnmounted,
    InternalMounted,
    InternalUnmounted,
    Network,
    Other,
}

impl IconKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            IconKey::Audiocd => "audiocd",
            IconKey::OpticalMounted => "optical_mounted",
            IconKey::OpticalMedia => "optical_media",
            IconKey::OpticalNomedia => "optical_nomedia",
            IconKey::FloppyMounted => "floppy_mounted",
            IconKey::FloppyUnmounted => "floppy_unmounted",
            IconKey::RemoveMounted => "remove_mounted",
            IconKey::RemoveUnmounted => "remove_unmounted",
            IconKey::InternalMounted => "internal_mounted",
            IconKey::InternalUnmounted => "internal_unmounted",
            IconKey::Network => "network",
            IconKey::Other => "other",
        }
    }
}

/// A tracked volume.
///
/// `is_mounted` is true exactly when `mount_point` is set. The registry keeps
/// at most one volume per device number.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Volume {
    kind: VolumeKind,
    pub devnum: DevNum,
    /// Device node for block volumes, the mount source otherwise.
    pub device_file: String,
    /// Unique id: a stable device link, the URL, or the mount point.
    pub udi: String,
    pub is_mounted: bool,
    pub mount_point: Option<PathBuf>,
    /// Size in bytes; zero when unknown.
    pub size: u64,
    pub label: Option<String>,
    pub fs_type: Option<String>,
    pub fs_usage: Option<String>,
    pub disp_name: String,
    pub icon: IconKey,

    pub removable: bool,
    pub optical: bool,
    pub floppy: bool,
    pub table: bool,
    pub requires_eject: bool,
    pub audiocd: bool,
    pub dvd: bool,
    pub blank: bool,
    pub user_visible: bool,
    pub nopolicy: bool,
    pub mountable: bool,
    pub media_available: bool,
    pub system_internal: bool,

    /// The volume was mounted at some point since media was inserted.
    pub ever_mounted: bool,
    /// Suppresses automount until the media is ejected.
    pub inhibit_auto: bool,
    /// The engine mounted this volume and should unmount it on removal.
    pub should_autounmount: bool,
    /// Last automount attempt.
    #[serde(skip)]
    pub automount_time: Option<Instant>,
}

impl Volume {
    fn empty(kind: VolumeKind, devnum: DevNum, device_file: String) -> Self {
        Self {
            kind,
            devnum,
            udi: device_file.clone(),
            device_file,
            is_mounted: false,
            mount_point: None,
            size: 0,
            label: None,
            fs_type: None,
            fs_usage: None,
            disp_name: String::new(),
            icon: IconKey::Other,
            removable: false,
            optical: false,
            floppy: false,
            table: false,
            requires_eject: false,
            audiocd: false,
            dvd: false,
            blank: false,
            user_visible: true,
            nopolicy: false,
            mountable: false,
            media_available: true,
            system_internal: false,
            ever_mounted: false,
            inhibit_auto: false,
            should_autounmount: false,
            automount_time: None,
        }
    }

    /// Classifies a block device.
    pub fn from_device(device: &Device, display: &DisplaySettings) -> Self {
        let devnode = device.devnode.to_string_lossy().into_owned();
        let mut volume = Self::empty(VolumeKind::Block, device.devnum, devnode);

        volume.udi = device.id.clone().unwrap_or_else(|| volume.device_file.clone());
        volume.mount_point = device.mount_points.first().cloned();
        volume.is_mounted = volume.mount_point.is_some();
        volume.size = device.size;
        volume.label = device
            .label()
            .map(str::to_string)
            .or_else(|| device.presentation.name.clone());
        volume.fs_type = device.fstype().map(str::to_string);
        volume.fs_usage = device.fs_usage().map(str::to_string);

        volume.removable = device.is_removable;
        volume.optical = device.optical.is_drive;
        volume.floppy = device.is_floppy();
        volume.table = device.partition_table.is_some();
        volume.requires_eject = device.optical.is_drive
            || device
                .drive
                .media_compatibility
                .iter()
                .any(|m| m == "floppy_zip" || m == "floppy_jaz");
        volume.audiocd = device.optical.has_disc
            && device.optical.num_audio_tracks > 0
            && device.filesystem.is_none();
        volume.dvd = device.is_dvd();
        volume.blank = device.optical.is_blank;
        volume.user_visible = !device.presentation.hide;
        volume.nopolicy = device.presentation.nopolicy;
        volume.media_available = device.is_media_available;
        volume.system_internal = device.is_system_internal;
        volume.mountable = !volume.table
            && match volume.fs_usage.as_deref() {
                Some("filesystem" | "crypto") => true,
                None => volume.fs_type.as_deref().is_some_and(|t| t != "swap"),
                Some(_) => false,
            };

        volume.refresh_presentation(display);
        volume
    }

    /// A network share found in the mount table.
    pub fn network(devmount: &Devmount, netmount: &Netmount, display: &DisplaySettings) -> Self {
        let mut volume = Self::empty(VolumeKind::Network, devmount.devnum, netmount.url.clone());
        volume.fs_type = devmount
            .fstype
            .clone()
            .or_else(|| Some(netmount.fstype.clone()));
        volume.label = Some(format!(
            "{}{}",
            netmount.host,
            netmount.path.as_deref().unwrap_or_default()
        ))
        .filter(|l| !l.is_empty());
        volume.mountable = true;
        volume.set_mount_points(&devmount.mount_points);
        volume.refresh_presentation(display);
        volume
    }

    /// A special mount that is neither a block device nor a network share.
    pub fn other(devmount: &Devmount, source: &str, display: &DisplaySettings) -> Self {
        let mut volume = Self::empty(VolumeKind::Other, devmount.devnum, source.to_string());
        volume.fs_type = devmount.fstype.clone();
        volume.mountable = true;
        volume.set_mount_points(&devmount.mount_points);
        if let Some(point) = &volume.mount_point {
            volume.udi = point.to_string_lossy().into_owned();
        }
        volume.refresh_presentation(display);
        volume
    }

    pub fn kind(&self) -> VolumeKind {
        self.kind
    }

    pub fn is_block(&self) -> bool {
        self.kind == VolumeKind::Block
    }

    /// Last path component of the device file.
    pub fn device_basename(&self) -> &str {
        let trimmed = self.device_file.trim_end_matches('/');
        trimmed.rsplit('/').next().unwrap_or(trimmed)
    }

    pub fn mount_point_path(&self) -> Option<&Path> {
        self.mount_point.as_deref()
    }

    /// Sets the mounted state from a mount table entry.
    pub fn set_mount_points(&mut self, points: &[PathBuf]) {
        self.mount_point = points.first().cloned();
        self.is_mounted = self.mount_point.is_some();
    }

    /// Recomputes the display name and icon.
    pub fn refresh_presentation(&mut self, display: &DisplaySettings) {
        self.disp_name = self.format_name(&display.name_format, display.binary_units);
        self.icon = self.icon_key();
    }

    /// Copies the mutable state of a freshly classified volume into this
    /// one, keeping identity and automount bookkeeping. Returns whether
    /// anything changed.
    pub fn refresh_from(&mut self, fresh: &Volume) -> bool {
        let before = self.clone();

        self.device_file = fresh.device_file.clone();
        self.udi = fresh.udi.clone();
        self.is_mounted = fresh.is_mounted;
        self.mount_point = fresh.mount_point.clone();
        self.size = fresh.size;
        self.label = fresh.label.clone();
        self.fs_type = fresh.fs_type.clone();
        self.fs_usage = fresh.fs_usage.clone();
        self.disp_name = fresh.disp_name.clone();
        self.icon = fresh.icon;
        self.removable = fresh.removable;
        self.optical = fresh.optical;
        self.floppy = fresh.floppy;
        self.table = fresh.table;
        self.requires_eject = fresh.requires_eject;
        self.audiocd = fresh.audiocd;
        self.dvd = fresh.dvd;
        self.blank = fresh.blank;
        self.user_visible = fresh.user_visible;
        self.nopolicy = fresh.nopolicy;
        self.mountable = fresh.mountable;
        self.media_available = fresh.media_available;
        self.system_internal = fresh.system_internal;

        *self != before
    }

    fn icon_key(&self) -> IconKey {
        match self.kind {
            VolumeKind::Network => IconKey::Network,
            VolumeKind::Other => IconKey::Other,
            VolumeKind::Block if self.audiocd => IconKey::Audiocd,
            VolumeKind::Block if self.optical => {
                if self.is_mounted {
                    IconKey::OpticalMounted
                } else if self.media_available {
                    IconKey::OpticalMedia
                } else {
                    IconKey::OpticalNomedia
                }
            }
            VolumeKind::Block if self.floppy => {
                if self.is_mounted {
                    IconKey::FloppyMounted
                } else {
                    IconKey::FloppyUnmounted
                }
            }
            VolumeKind::Block if self.removable => {
                if self.is_mounted {
                    IconKey::RemoveMounted
                } else {
                    IconKey::RemoveUnmounted
                }
            }
            VolumeKind::Block => {
                if self.is_mounted {
                    IconKey::InternalMounted
                } else {
                    IconKey::InternalUnmounted
                }
            }
        }
    }

    /// Expands a display-name template.
    ///
    /// `%v` device basename, `%s` size, `%t` fstype, `%l` label, `%m` mount
    /// point, `%n` label or a size-based name, `%i` unique id. Whitespace
    /// runs collapse; an empty result falls back to the device basename.
    pub fn format_name(&self, format: &str, binary_units: bool) -> String {
        let size = if self.size > 0 {
            format_size(self.size, binary_units)
        } else {
            String::new()
        };

        let mut out = String::new();
        let mut chars = format.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('v') => out.push_str(self.device_basename()),
                Some('s') => out.push_str(&size),
                Some('t') => out.push_str(self.fs_type.as_deref().unwrap_or_default()),
                Some('l') => out.push_str(self.label.as_deref().unwrap_or_default()),
                Some('m') => {
                    if let Some(point) = &self.mount_point {
                        out.push_str(&point.to_string_lossy());
                    }
                }
                Some('n') => match (&self.label, size.is_empty()) {
                    (Some(label), _) => out.push_str(label),
                    (None, false) => out.push_str(&format!("{} Volume", size)),
                    (None, true) => {}
                },
                Some('i') => out.push_str(&self.udi),
                Some(other) => {
                    out.push('%');
                    out.push(other);
                }
                None => out.push('%'),
            }
        }

        let collapsed = out.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            self.device_basename().to_string()
        } else {
            collapsed
        }
    }
}

/// Formats a byte count with one decimal in 1000- or 1024-based units.
pub fn format_size(bytes: u64, binary_units: bool) -> String {
    let (base, units): (f64, [&str; 5]) = if binary_units {
        (1024.0, ["KiB", "MiB", "GiB", "TiB", "PiB"])
    } else {
        (1000.0, ["kB", "MB", "GB", "TB", "PB"])
    };

    let mut value = bytes as f64;
    if value < base {
        return format!("{} B", bytes);
    }
    let mut unit = units[0];
    for candidate in units {
        value /= base;
        unit = candidate;
        if value < base {
            break;
        }
    }
    format!("{:.1} {}", value, unit)
}
