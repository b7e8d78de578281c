//! Device snapshot reader.
//!
//! Builds a [`Device`] descriptor from a raw device-manager record (uevent
//! key/value properties), the udev database entry for the device and the
//! per-device attribute files under sysfs. A descriptor is short lived: it is
//! folded into a [`crate::volume::Volume`] and dropped.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use tracing::debug;

use crate::error::{Error, IoResultExt, Result};
use crate::mountinfo::{DevNum, Devmounts};

/// Default sysfs mount point.
pub const SYSFS_ROOT: &str = "/sys";

/// Default udev database directory.
pub const UDEV_DB: &str = "/run/udev/data";

/// Sector size used by the sysfs `size` attribute.
const SECTOR_SIZE: u64 = 512;

/// Drive capability properties and the media names they map to.
const MEDIA_COMPATIBILITY: &[(&str, &str)] = &[
    ("ID_DRIVE_FLASH", "flash"),
    ("ID_DRIVE_FLASH_CF", "flash_cf"),
    ("ID_DRIVE_FLASH_MS", "flash_ms"),
    ("ID_DRIVE_FLASH_SM", "flash_sm"),
    ("ID_DRIVE_FLASH_SD", "flash_sd"),
    ("ID_DRIVE_FLASH_SDHC", "flash_sdhc"),
    ("ID_DRIVE_FLASH_MMC", "flash_mmc"),
    ("ID_DRIVE_FLOPPY", "floppy"),
    ("ID_DRIVE_FLOPPY_ZIP", "floppy_zip"),
    ("ID_DRIVE_FLOPPY_JAZ", "floppy_jaz"),
    ("ID_CDROM", "optical_cd"),
    ("ID_CDROM_CD_R", "optical_cd_r"),
    ("ID_CDROM_CD_RW", "optical_cd_rw"),
    ("ID_CDROM_DVD", "optical_dvd"),
    ("ID_CDROM_DVD_R", "optical_dvd_r"),
    ("ID_CDROM_DVD_RW", "optical_dvd_rw"),
    ("ID_CDROM_DVD_RAM", "optical_dvd_ram"),
    ("ID_CDROM_DVD_PLUS_R", "optical_dvd_plus_r"),
    ("ID_CDROM_DVD_PLUS_RW", "optical_dvd_plus_rw"),
    ("ID_CDROM_DVD_PLUS_R_DL", "optical_dvd_plus_r_dl"),
    ("ID_CDROM_DVD_PLUS_RW_DL", "optical_dvd_plus_rw_dl"),
    ("ID_CDROM_BD", "optical_bd"),
    ("ID_CDROM_BD_R", "optical_bd_r"),
    ("ID_CDROM_BD_RE", "optical_bd_re"),
    ("ID_CDROM_HDDVD", "optical_hddvd"),
    ("ID_CDROM_HDDVD_R", "optical_hddvd_r"),
    ("ID_CDROM_HDDVD_RW", "optical_hddvd_rw"),
    ("ID_CDROM_MO", "optical_mo"),
    ("ID_CDROM_MRW", "optical_mrw"),
    ("ID_CDROM_MRW_W", "optical_mrw_w"),
];

/// Media-present properties and the media names they map to.
const MEDIA_PRESENT: &[(&str, &str)] = &[
    ("ID_CDROM_MEDIA_CD", "optical_cd"),
    ("ID_CDROM_MEDIA_CD_R", "optical_cd_r"),
    ("ID_CDROM_MEDIA_CD_RW", "optical_cd_rw"),
    ("ID_CDROM_MEDIA_DVD", "optical_dvd"),
    ("ID_CDROM_MEDIA_DVD_R", "optical_dvd_r"),
    ("ID_CDROM_MEDIA_DVD_RW", "optical_dvd_rw"),
    ("ID_CDROM_MEDIA_DVD_RAM", "optical_dvd_ram"),
    ("ID_CDROM_MEDIA_DVD_PLUS_R", "optical_dvd_plus_r"),
    ("ID_CDROM_MEDIA_DVD_PLUS_RW", "optical_dvd_plus_rw"),
    ("ID_CDROM_MEDIA_BD", "optical_bd"),
    ("ID_CDROM_MEDIA_BD_R", "optical_bd_r"),
    ("ID_CDROM_MEDIA_BD_RE", "optical_bd_re"),
    ("ID_CDROM_MEDIA_HDDVD", "optical_hddvd"),
    ("ID_DRIVE_MEDIA_FLASH", "flash"),
    ("ID_DRIVE_MEDIA_FLASH_CF", "flash_cf"),
    ("ID_DRIVE_MEDIA_FLASH_MS", "flash_ms"),
    ("ID_DRIVE_MEDIA_FLASH_SD", "flash_sd"),
    ("ID_DRIVE_MEDIA_FLASH_SDHC", "flash_sdhc"),
    ("ID_DRIVE_MEDIA_FLASH_MMC", "flash_mmc"),
];

/// MBR partition types that only contain other partitions.
const EXTENDED_PARTITION_TYPES: &[&str] = &["0x5", "0xf", "0x85"];

/// The kind of change a device record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAction {
    Add,
    Remove,
    Change,
    Other,
}

impl DeviceAction {
    pub fn parse(action: &str) -> Self {
        match action {
            "add" => Self::Add,
            "remove" => Self::Remove,
            "change" => Self::Change,
            _ => Self::Other,
        }
    }
}

/// A raw device-manager record: an action plus key/value properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub action: DeviceAction,
    /// Device path relative to the sysfs root (`/devices/...`).
    pub devpath: String,
    pub properties: BTreeMap<String, String>,
}

impl DeviceRecord {
    /// Builds a record from properties; `ACTION` and `DEVPATH` are taken
    /// from the properties themselves.
    pub fn from_properties(properties: BTreeMap<String, String>) -> Self {
        let action = properties
            .get("ACTION")
            .map(|a| DeviceAction::parse(a))
            .unwrap_or(DeviceAction::Change);
        let devpath = properties.get("DEVPATH").cloned().unwrap_or_default();
        Self {
            action,
            devpath,
            properties,
        }
    }

    /// Parses `KEY=VALUE` lines as found in sysfs `uevent` files.
    pub fn parse_properties(text: &str) -> BTreeMap<String, String> {
        text.lines()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect()
    }

    /// Returns a non-empty property value.
    pub fn property(&self, key: &str) -> Option<&str> {
        prop(&self.properties, key)
    }

    pub fn subsystem(&self) -> Option<&str> {
        self.property("SUBSYSTEM")
    }

    pub fn devnum(&self) -> Option<DevNum> {
        Some(DevNum::new(
            self.property("MAJOR")?.parse().ok()?,
            self.property("MINOR")?.parse().ok()?,
        ))
    }

    /// Device node path; relative `DEVNAME` values live under `/dev`.
    pub fn devnode(&self) -> Option<PathBuf> {
        let name = self.property("DEVNAME")?;
        if name.starts_with('/') {
            Some(PathBuf::from(name))
        } else {
            Some(Path::new("/dev").join(name))
        }
    }
}

/// Filesystem properties of a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilesystemInfo {
    pub usage: Option<String>,
    pub fstype: Option<String>,
    pub version: Option<String>,
    pub uuid: Option<String>,
    pub label: Option<String>,
}

/// Properties of the physical drive backing a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriveInfo {
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub revision: Option<String>,
    pub serial: Option<String>,
    pub wwn: Option<String>,
    /// Connection bus (`usb`, `scsi`, `firewire`, `sdio`, `platform`, `ata`, ...).
    pub connection_interface: Option<String>,
    /// Connection speed in bits per second.
    pub connection_speed: Option<u64>,
    /// Sorted, de-duplicated media the drive accepts.
    pub media_compatibility: Vec<String>,
    /// Media currently in the drive, when known.
    pub media: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionInfo {
    pub number: Option<u32>,
    pub scheme: Option<String>,
    pub part_type: Option<String>,
    pub uuid: Option<String>,
    pub label: Option<String>,
    pub flags: Option<String>,
    pub offset: Option<u64>,
    pub size: Option<u64>,
    /// The partition sits inside a parent block device of devtype `disk`.
    pub is_contained: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionTableInfo {
    pub scheme: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpticalInfo {
    pub is_drive: bool,
    pub has_disc: bool,
    pub is_blank: bool,
    pub num_tracks: u32,
    pub num_audio_tracks: u32,
    pub num_sessions: u32,
}

/// Hints from the device manager about how to present a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresentationHints {
    pub hide: bool,
    pub nopolicy: bool,
    pub name: Option<String>,
    pub icon_name: Option<String>,
}

/// A structured snapshot of one block device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub devnum: DevNum,
    pub devnode: PathBuf,
    pub syspath: PathBuf,
    pub devtype: Option<String>,
    /// Stable identifier, usually a `/dev/disk/by-id` link.
    pub id: Option<String>,
    pub is_removable: bool,
    pub is_read_only: bool,
    pub is_media_available: bool,
    pub is_system_internal: bool,
    /// Size in bytes.
    pub size: u64,
    pub filesystem: Option<FilesystemInfo>,
    pub drive: DriveInfo,
    pub partition: Option<PartitionInfo>,
    pub partition_table: Option<PartitionTableInfo>,
    pub optical: OpticalInfo,
    pub presentation: PresentationHints,
    /// Current mount points from the latest mount table snapshot.
    pub mount_points: Vec<PathBuf>,
}

impl Device {
    pub fn fstype(&self) -> Option<&str> {
        self.filesystem.as_ref().and_then(|fs| fs.fstype.as_deref())
    }

    pub fn fs_usage(&self) -> Option<&str> {
        self.filesystem.as_ref().and_then(|fs| fs.usage.as_deref())
    }

    pub fn label(&self) -> Option<&str> {
        self.filesystem.as_ref().and_then(|fs| fs.label.as_deref())
    }

    pub fn is_floppy(&self) -> bool {
        self.drive
            .media_compatibility
            .iter()
            .any(|m| m.starts_with("floppy"))
            || self.devnode.to_string_lossy().starts_with("/dev/fd")
    }

    pub fn is_dvd(&self) -> bool {
        self.drive
            .media
            .as_deref()
            .is_some_and(|m| m.starts_with("optical_dvd"))
    }
}

/// Reads device descriptors from sysfs and the udev database.
#[derive(Debug, Clone)]
pub struct DeviceReader {
    sysfs_root: PathBuf,
    udev_db: PathBuf,
    probe_media: bool,
}

impl Default for DeviceReader {
    fn default() -> Self {
        Self::new(SYSFS_ROOT, UDEV_DB)
    }
}

impl DeviceReader {
    pub fn new(sysfs_root: impl Into<PathBuf>, udev_db: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            udev_db: udev_db.into(),
            probe_media: true,
        }
    }

    /// Enables or disables the probe-open used to detect media presence.
    pub fn with_media_probe(mut self, probe: bool) -> Self {
        self.probe_media = probe;
        self
    }

    pub fn sysfs_root(&self) -> &Path {
        &self.sysfs_root
    }

    fn syspath(&self, devpath: &str) -> PathBuf {
        self.sysfs_root.join(devpath.trim_start_matches('/'))
    }

    /// Builds a record for a device number from sysfs and the udev database.
    pub fn lookup(&self, devnum: DevNum) -> Option<DeviceRecord> {
        let link = self
            .sysfs_root
            .join("dev/block")
            .join(devnum.to_string());
        let dir = fs::canonicalize(&link).ok()?;
        let root = fs::canonicalize(&self.sysfs_root).ok()?;
        let devpath = format!("/{}", dir.strip_prefix(&root).ok()?.display());

        let uevent = fs::read_to_string(dir.join("uevent")).unwrap_or_default();
        let mut properties = DeviceRecord::parse_properties(&uevent);
        properties
            .entry("MAJOR".to_string())
            .or_insert_with(|| devnum.major.to_string());
        properties
            .entry("MINOR".to_string())
            .or_insert_with(|| devnum.minor.to_string());
        properties.insert("DEVPATH".to_string(), devpath.clone());
        properties
            .entry("SUBSYSTEM".to_string())
            .or_insert_with(|| "block".to_string());
        for (key, value) in self.udev_properties(devnum) {
            properties.entry(key).or_insert(value);
        }

        Some(DeviceRecord {
            action: DeviceAction::Change,
            devpath,
            properties,
        })
    }

    /// Lists records for every block device known to sysfs.
    pub fn enumerate(&self) -> Result<Vec<DeviceRecord>> {
        let class_dir = self.sysfs_root.join("class/block");
        let entries = fs::read_dir(&class_dir).sysfs_context(&class_dir)?;

        let mut devnums: Vec<DevNum> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| read_attr(&entry.path(), "dev"))
            .filter_map(|dev| DevNum::parse(&dev))
            .collect();
        devnums.sort();

        Ok(devnums.into_iter().filter_map(|d| self.lookup(d)).collect())
    }

    /// Reads `E:` (property) and `S:` (symlink) lines from the udev database.
    fn udev_properties(&self, devnum: DevNum) -> BTreeMap<String, String> {
        let path = self.udev_db.join(format!("b{}", devnum));
        let Ok(content) = fs::read_to_string(&path) else {
            return BTreeMap::new();
        };

        let mut properties = BTreeMap::new();
        let mut links = Vec::new();
        for line in content.lines() {
            if let Some(entry) = line.strip_prefix("E:") {
                if let Some((key, value)) = entry.split_once('=') {
                    properties.insert(key.to_string(), value.to_string());
                }
            } else if let Some(link) = line.strip_prefix("S:") {
                links.push(format!("/dev/{}", link));
            }
        }
        if !links.is_empty() {
            properties
                .entry("DEVLINKS".to_string())
                .or_insert_with(|| links.join(" "));
        }
        properties
    }

    /// Reads a device descriptor for `record`.
    ///
    /// Fails with [`Error::IncompleteDeviceRecord`] when the record has no
    /// device number or device node.
    pub fn read(&self, record: &DeviceRecord, devmounts: &Devmounts) -> Result<Device> {
        let incomplete = || Error::IncompleteDeviceRecord {
            syspath: record.devpath.clone(),
        };
        let devnum = record.devnum().ok_or_else(incomplete)?;
        let devnode = record.devnode().ok_or_else(incomplete)?;

        let mut props = record.properties.clone();
        for (key, value) in self.udev_properties(devnum) {
            props.entry(key).or_insert(value);
        }

        let syspath = self.syspath(&record.devpath);
        let devtype = prop(&props, "DEVTYPE").map(str::to_string);
        let is_partition = devtype.as_deref() == Some("partition");
        let whole_disk = if is_partition {
            syspath.parent().map(Path::to_path_buf).unwrap_or_else(|| syspath.clone())
        } else {
            syspath.clone()
        };

        let is_removable = read_attr(&whole_disk, "removable").as_deref() == Some("1");
        let is_read_only = read_attr(&syspath, "ro").as_deref() == Some("1");
        let size = read_attr(&syspath, "size")
            .and_then(|s| s.parse::<u64>().ok())
            .map(sectors_to_bytes)
            .unwrap_or(0);

        let partition = (is_partition || prop(&props, "ID_PART_ENTRY_NUMBER").is_some())
            .then(|| read_partition(&props, &syspath, is_partition));
        let partition_table = if is_partition {
            None
        } else {
            prop(&props, "ID_PART_TABLE_TYPE").map(|scheme| PartitionTableInfo {
                scheme: scheme.to_string(),
                count: count_partitions(&syspath),
            })
        };

        let is_container = partition_table.is_some()
            || partition.as_ref().is_some_and(|p| {
                p.scheme.as_deref() == Some("dos")
                    && p.part_type
                        .as_deref()
                        .is_some_and(|t| EXTENDED_PARTITION_TYPES.contains(&t))
            });
        let filesystem = if is_container {
            None
        } else {
            read_filesystem(&props)
        };

        let mut drive = self.read_drive(&whole_disk);
        fill_drive_from_properties(&mut drive, &props);

        let optical = OpticalInfo {
            is_drive: flag(&props, "ID_CDROM"),
            has_disc: flag(&props, "ID_CDROM_MEDIA"),
            is_blank: prop(&props, "ID_CDROM_MEDIA_STATE") == Some("blank"),
            num_tracks: prop_u32(&props, "ID_CDROM_MEDIA_TRACK_COUNT"),
            num_audio_tracks: prop_u32(&props, "ID_CDROM_MEDIA_TRACK_COUNT_AUDIO"),
            num_sessions: prop_u32(&props, "ID_CDROM_MEDIA_SESSION_COUNT"),
        };

        let is_media_available = self.media_available(&props, &devnode, is_removable);

        let presentation = PresentationHints {
            hide: flag(&props, "UDISKS_PRESENTATION_HIDE") || flag(&props, "UDISKS_IGNORE"),
            nopolicy: flag(&props, "UDISKS_PRESENTATION_NOPOLICY")
                || prop(&props, "UDISKS_AUTO") == Some("0"),
            name: prop(&props, "UDISKS_PRESENTATION_NAME")
                .or_else(|| prop(&props, "UDISKS_NAME"))
                .map(str::to_string),
            icon_name: prop(&props, "UDISKS_PRESENTATION_ICON_NAME")
                .or_else(|| prop(&props, "UDISKS_ICON_NAME"))
                .map(str::to_string),
        };

        let is_system_internal = !is_removable
            && !matches!(
                drive.connection_interface.as_deref(),
                Some("usb" | "firewire" | "sdio")
            );

        Ok(Device {
            devnum,
            id: stable_id(&props),
            devnode,
            syspath,
            devtype,
            is_removable,
            is_read_only,
            is_media_available,
            is_system_internal,
            size,
            filesystem,
            drive,
            partition,
            partition_table,
            optical,
            presentation,
            mount_points: devmounts.mount_points(devnum).to_vec(),
        })
    }

    /// Media availability, in priority order: filesystem or table ids,
    /// a successful probe-open of a removable device, optical media, then
    /// non-removable devices default to available.
    fn media_available(
        &self,
        props: &BTreeMap<String, String>,
        devnode: &Path,
        is_removable: bool,
    ) -> bool {
        if ["ID_FS_USAGE", "ID_FS_TYPE", "ID_PART_TABLE_TYPE"]
            .iter()
            .any(|key| prop(props, key).is_some())
        {
            return true;
        }
        if is_removable && self.probe_media && probe_open(devnode) {
            return true;
        }
        if flag(props, "ID_CDROM_MEDIA") {
            return true;
        }
        !is_removable
    }

    /// Walks up from the disk through its ancestors, taking drive details
    /// from the first informative subsystem.
    fn read_drive(&self, whole_disk: &Path) -> DriveInfo {
        let mut drive = DriveInfo::default();

        for dir in whole_disk.ancestors().skip(1) {
            if dir == self.sysfs_root || !dir.starts_with(&self.sysfs_root) {
                break;
            }
            let Some(subsystem) = subsystem_of(dir) else {
                continue;
            };

            match subsystem.as_str() {
                "scsi" => {
                    if drive.vendor.is_none() && read_attr(dir, "vendor").is_some() {
                        drive.vendor = read_attr(dir, "vendor");
                        drive.model = read_attr(dir, "model");
                        drive.revision = read_attr(dir, "rev");
                        drive.connection_interface = Some("scsi".to_string());
                    }
                    // Keep walking: a usb or firewire parent names the real bus
                }
                "usb" => {
                    if read_attr(dir, "idVendor").is_none() {
                        continue;
                    }
                    if drive.vendor.is_none() {
                        drive.vendor = read_attr(dir, "manufacturer");
                        drive.model = read_attr(dir, "product");
                    }
                    drive.serial = read_attr(dir, "serial");
                    drive.connection_interface = Some("usb".to_string());
                    drive.connection_speed = read_attr(dir, "speed")
                        .and_then(|s| s.parse::<f64>().ok())
                        .map(|mbps| (mbps * 1_000_000.0) as u64);
                    break;
                }
                "firewire" | "ieee1394" => {
                    drive.connection_interface = Some("firewire".to_string());
                    break;
                }
                "mmc" => {
                    drive.model = drive.model.or_else(|| read_attr(dir, "name"));
                    drive.serial = read_attr(dir, "serial");
                    drive.connection_interface = Some("sdio".to_string());
                    break;
                }
                "platform" => {
                    if drive.connection_interface.is_none() {
                        drive.connection_interface = Some("platform".to_string());
                    }
                    break;
                }
                _ => {}
            }
        }

        drive
    }
}

/// Fills drive fields the sysfs walk left empty from device-manager
/// properties, then computes media compatibility.
fn fill_drive_from_properties(drive: &mut DriveInfo, props: &BTreeMap<String, String>) {
    let take = |key: &str| prop(props, key).map(str::to_string);
    drive.vendor = drive.vendor.take().or_else(|| take("ID_VENDOR"));
    drive.model = drive.model.take().or_else(|| take("ID_MODEL"));
    drive.revision = drive.revision.take().or_else(|| take("ID_REVISION"));
    drive.serial = drive
        .serial
        .take()
        .or_else(|| take("ID_SERIAL_SHORT"))
        .or_else(|| take("ID_SERIAL"));
    drive.wwn = take("ID_WWN_WITH_EXTENSION").or_else(|| take("ID_WWN"));
    drive.connection_interface = drive
        .connection_interface
        .take()
        .or_else(|| take("ID_BUS"));

    let mut compatibility: Vec<String> = MEDIA_COMPATIBILITY
        .iter()
        .filter(|(key, _)| flag(props, key))
        .map(|(_, media)| media.to_string())
        .collect();
    compatibility.sort();
    compatibility.dedup();
    drive.media_compatibility = compatibility;

    drive.media = MEDIA_PRESENT
        .iter()
        .find(|(key, _)| flag(props, key))
        .map(|(_, media)| media.to_string());
}

fn read_filesystem(props: &BTreeMap<String, String>) -> Option<FilesystemInfo> {
    let label = prop(props, "ID_FS_LABEL_ENC")
        .map(decode_hex_escapes)
        .or_else(|| prop(props, "ID_FS_LABEL").map(str::to_string));
    let info = FilesystemInfo {
        usage: prop(props, "ID_FS_USAGE").map(str::to_string),
        fstype: prop(props, "ID_FS_TYPE").map(str::to_string),
        version: prop(props, "ID_FS_VERSION").map(str::to_string),
        uuid: prop(props, "ID_FS_UUID").map(str::to_string),
        label,
    };
    (info != FilesystemInfo::default()).then_some(info)
}

fn read_partition(
    props: &BTreeMap<String, String>,
    syspath: &Path,
    is_contained: bool,
) -> PartitionInfo {
    let label = prop(props, "ID_PART_ENTRY_NAME").map(decode_hex_escapes);
    PartitionInfo {
        number: prop(props, "ID_PART_ENTRY_NUMBER")
            .map(str::to_string)
            .or_else(|| read_attr(syspath, "partition"))
            .and_then(|n| n.parse().ok()),
        scheme: prop(props, "ID_PART_ENTRY_SCHEME").map(str::to_string),
        part_type: prop(props, "ID_PART_ENTRY_TYPE").map(str::to_string),
        uuid: prop(props, "ID_PART_ENTRY_UUID").map(str::to_string),
        label,
        flags: prop(props, "ID_PART_ENTRY_FLAGS").map(str::to_string),
        offset: prop(props, "ID_PART_ENTRY_OFFSET")
            .and_then(|o| o.parse::<u64>().ok())
            .map(sectors_to_bytes),
        size: prop(props, "ID_PART_ENTRY_SIZE")
            .and_then(|s| s.parse::<u64>().ok())
            .map(sectors_to_bytes),
        is_contained,
    }
}

/// Sector count to bytes, saturating at `u64::MAX`.
fn sectors_to_bytes(sectors: u64) -> u64 {
    sectors.saturating_mul(SECTOR_SIZE)
}

/// Counts child directories that are partitions of a disk.
fn count_partitions(syspath: &Path) -> usize {
    fs::read_dir(syspath)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.path().join("partition").is_file())
                .count()
        })
        .unwrap_or(0)
}

/// Picks a by-id link, then a by-uuid link, as the stable identifier.
fn stable_id(props: &BTreeMap<String, String>) -> Option<String> {
    let links: Vec<&str> = prop(props, "DEVLINKS")
        .map(|l| l.split_whitespace().collect())
        .unwrap_or_default();
    ["/dev/disk/by-id/", "/dev/disk/by-uuid/"]
        .iter()
        .find_map(|prefix| links.iter().find(|l| l.starts_with(prefix)))
        .map(|l| l.to_string())
}

/// Opens the device node without blocking; success means media is present.
fn probe_open(devnode: &Path) -> bool {
    let result = fs::OpenOptions::new()
        .read(true)
        .custom_flags((OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).bits())
        .open(devnode);
    match result {
        Ok(_) => true,
        Err(e) => {
            debug!("probe open of {} failed: {}", devnode.display(), e);
            false
        }
    }
}

/// Returns the name of the subsystem a sysfs directory belongs to.
fn subsystem_of(dir: &Path) -> Option<String> {
    fs::read_link(dir.join("subsystem"))
        .ok()?
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}

/// Reads a trimmed, non-empty sysfs attribute.
fn read_attr(dir: &Path, name: &str) -> Option<String> {
    fs::read_to_string(dir.join(name))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn prop<'a>(props: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    props.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

fn flag(props: &BTreeMap<String, String>, key: &str) -> bool {
    prop(props, key) == Some("1")
}

fn prop_u32(props: &BTreeMap<String, String>, key: &str) -> u32 {
    prop(props, key).and_then(|v| v.parse().ok()).unwrap_or(0)
}

/// Decodes udev's `\xNN` escapes (`MY\x20STICK` -> `MY STICK`).
pub fn decode_hex_escapes(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && bytes.get(i + 1) == Some(&b'x')
            && let Some(hex) = input.get(i + 2..i + 4)
            && let Ok(byte) = u8::from_str_radix(hex, 16)
        {
            out.push(byte);
            i += 4;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mountinfo::MountTable;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    const USB_PATH: &str = "devices/pci0000:00/0000:00:14.0/usb1/1-1";
    const SCSI_PATH: &str = "1-1:1.0/host6/target6:0:0/6:0:0:0";

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    /// Builds a sysfs tree for a USB stick `sdb` with one partition `sdb1`.
    fn usb_stick_fixture() -> (TempDir, DeviceReader) {
        let tmp = TempDir::new().unwrap();
        let sys = tmp.path().join("sys");
        let udev = tmp.path().join("udev");

        let usb = sys.join(USB_PATH);
        fs::create_dir_all(&usb).unwrap();
        symlink("../../../../bus/usb", usb.join("subsystem")).unwrap();
        write(&usb.join("idVendor"), "0781\n");
        write(&usb.join("manufacturer"), "SanDisk\n");
        write(&usb.join("product"), "Cruzer Blade\n");
        write(&usb.join("serial"), "4C530001\n");
        write(&usb.join("speed"), "480\n");

        let scsi = usb.join(SCSI_PATH);
        fs::create_dir_all(&scsi).unwrap();
        symlink("../../../../../bus/scsi", scsi.join("subsystem")).unwrap();
        write(&scsi.join("vendor"), "SanDisk \n");
        write(&scsi.join("model"), "Cruzer Blade    \n");
        write(&scsi.join("rev"), "1.00\n");

        let disk = scsi.join("block/sdb");
        write(&disk.join("removable"), "1\n");
        write(&disk.join("ro"), "0\n");
        write(&disk.join("size"), "31266816\n");
        write(&disk.join("dev"), "8:16\n");
        write(
            &disk.join("uevent"),
            "MAJOR=8\nMINOR=16\nDEVNAME=sdb\nDEVTYPE=disk\n",
        );

        let part = disk.join("sdb1");
        write(&part.join("partition"), "1\n");
        write(&part.join("ro"), "0\n");
        write(&part.join("size"), "31264768\n");
        write(&part.join("dev"), "8:17\n");
        write(
            &part.join("uevent"),
            "MAJOR=8\nMINOR=17\nDEVNAME=sdb1\nDEVTYPE=partition\nPARTN=1\n",
        );

        fs::create_dir_all(sys.join("dev/block")).unwrap();
        fs::create_dir_all(sys.join("class/block")).unwrap();
        symlink(&disk, sys.join("dev/block/8:16")).unwrap();
        symlink(&part, sys.join("dev/block/8:17")).unwrap();
        symlink(&disk, sys.join("class/block/sdb")).unwrap();
        symlink(&part, sys.join("class/block/sdb1")).unwrap();

        write(
            &udev.join("b8:16"),
            "S:disk/by-id/usb-SanDisk_Cruzer_Blade_4C530001-0:0\n\
             E:ID_BUS=usb\nE:ID_PART_TABLE_TYPE=dos\nE:ID_DRIVE_FLASH_SD=1\n",
        );
        write(
            &udev.join("b8:17"),
            "S:disk/by-id/usb-SanDisk_Cruzer_Blade_4C530001-0:0-part1\n\
             S:disk/by-uuid/1234-ABCD\n\
             E:ID_BUS=usb\n\
             E:ID_FS_USAGE=filesystem\nE:ID_FS_TYPE=vfat\nE:ID_FS_UUID=1234-ABCD\n\
             E:ID_FS_LABEL=MY_STICK\nE:ID_FS_LABEL_ENC=MY\\x20STICK\n\
             E:ID_PART_TABLE_TYPE=dos\nE:ID_PART_ENTRY_SCHEME=dos\n\
             E:ID_PART_ENTRY_NUMBER=1\nE:ID_PART_ENTRY_TYPE=0xc\n\
             E:ID_DRIVE_FLASH_SD=1\nE:ID_DRIVE_FLASH=1\nE:ID_DRIVE_FLASH_SD=1\n",
        );

        let reader = DeviceReader::new(&sys, &udev).with_media_probe(false);
        (tmp, reader)
    }

    #[test]
    fn test_huge_sector_counts_saturate() {
        let (tmp, reader) = usb_stick_fixture();
        let part = tmp
            .path()
            .join("sys")
            .join(USB_PATH)
            .join(SCSI_PATH)
            .join("block/sdb/sdb1");
        write(&part.join("size"), "18446744073709551615\n");

        let record = reader.lookup(DevNum::new(8, 17)).unwrap();
        let device = reader.read(&record, &Devmounts::default()).unwrap();
        assert_eq!(device.size, u64::MAX);
    }

    #[test]
    fn test_read_usb_partition() {
        let (_tmp, reader) = usb_stick_fixture();
        let record = reader.lookup(DevNum::new(8, 17)).unwrap();
        let device = reader.read(&record, &Devmounts::default()).unwrap();

        assert_eq!(device.devnode, PathBuf::from("/dev/sdb1"));
        assert_eq!(device.devtype.as_deref(), Some("partition"));
        assert!(device.is_removable); // inherited from the whole disk
        assert!(!device.is_read_only);
        assert!(!device.is_system_internal);
        assert_eq!(device.size, 31264768 * 512);
        assert_eq!(device.fstype(), Some("vfat"));
        assert_eq!(device.label(), Some("MY STICK"));
        assert_eq!(device.partition.as_ref().unwrap().number, Some(1));
        assert!(device.partition.as_ref().unwrap().is_contained);
        assert!(device.partition_table.is_none());
        assert!(device.is_media_available);
        assert_eq!(
            device.id.as_deref(),
            Some("/dev/disk/by-id/usb-SanDisk_Cruzer_Blade_4C530001-0:0-part1")
        );
        assert!(device.mount_points.is_empty());
    }

    #[test]
    fn test_drive_walk_prefers_scsi_names_and_usb_bus() {
        let (_tmp, reader) = usb_stick_fixture();
        let record = reader.lookup(DevNum::new(8, 17)).unwrap();
        let device = reader.read(&record, &Devmounts::default()).unwrap();

        assert_eq!(device.drive.vendor.as_deref(), Some("SanDisk"));
        assert_eq!(device.drive.model.as_deref(), Some("Cruzer Blade"));
        assert_eq!(device.drive.revision.as_deref(), Some("1.00"));
        assert_eq!(device.drive.serial.as_deref(), Some("4C530001"));
        assert_eq!(device.drive.connection_interface.as_deref(), Some("usb"));
        assert_eq!(device.drive.connection_speed, Some(480_000_000));
        assert_eq!(
            device.drive.media_compatibility,
            vec!["flash".to_string(), "flash_sd".to_string()]
        );
    }

    #[test]
    fn test_partition_table_suppresses_filesystem() {
        let (_tmp, reader) = usb_stick_fixture();
        let mut record = reader.lookup(DevNum::new(8, 16)).unwrap();
        // A stale fs signature on the container must not surface
        record
            .properties
            .insert("ID_FS_TYPE".to_string(), "vfat".to_string());

        let device = reader.read(&record, &Devmounts::default()).unwrap();
        let table = device.partition_table.as_ref().unwrap();
        assert_eq!(table.scheme, "dos");
        assert_eq!(table.count, 1);
        assert!(device.filesystem.is_none());
        assert!(device.partition.is_none());
    }

    #[test]
    fn test_extended_partition_is_container() {
        let (_tmp, reader) = usb_stick_fixture();
        let mut record = reader.lookup(DevNum::new(8, 17)).unwrap();
        record
            .properties
            .insert("ID_PART_ENTRY_TYPE".to_string(), "0x5".to_string());

        let device = reader.read(&record, &Devmounts::default()).unwrap();
        assert!(device.filesystem.is_none());
    }

    #[test]
    fn test_mount_points_come_from_snapshot() {
        let (_tmp, reader) = usb_stick_fixture();
        let mut table = MountTable::new("/unused");
        table.parse(
            "40 22 8:17 / /media/MY\\040STICK rw - vfat /dev/sdb1 rw\n",
            false,
        );

        let record = reader.lookup(DevNum::new(8, 17)).unwrap();
        let device = reader.read(&record, table.devmounts()).unwrap();
        assert_eq!(device.mount_points, vec![PathBuf::from("/media/MY STICK")]);
    }

    #[test]
    fn test_incomplete_record_rejected() {
        let reader = DeviceReader::new("/nonexistent", "/nonexistent");
        let record = DeviceRecord::from_properties(DeviceRecord::parse_properties(
            "ACTION=add\nDEVPATH=/devices/virtual/block/loop0\nSUBSYSTEM=block\n",
        ));
        assert!(matches!(
            reader.read(&record, &Devmounts::default()),
            Err(Error::IncompleteDeviceRecord { .. })
        ));

        let record = DeviceRecord::from_properties(DeviceRecord::parse_properties(
            "ACTION=add\nMAJOR=7\nMINOR=0\n",
        ));
        assert!(reader.read(&record, &Devmounts::default()).is_err());
    }

    #[test]
    fn test_media_availability_cascade() {
        let reader = DeviceReader::new("/nonexistent", "/nonexistent").with_media_probe(false);
        let devnode = Path::new("/dev/nonexistent");
        let mut props = BTreeMap::new();

        // Non-removable defaults to available
        assert!(reader.media_available(&props, devnode, false));
        // Removable without ids or optical media is empty
        assert!(!reader.media_available(&props, devnode, true));

        props.insert("ID_CDROM_MEDIA".to_string(), "1".to_string());
        assert!(reader.media_available(&props, devnode, true));

        props.clear();
        props.insert("ID_FS_TYPE".to_string(), "iso9660".to_string());
        assert!(reader.media_available(&props, devnode, true));
    }

    #[test]
    fn test_optical_and_presentation_properties() {
        let tmp = TempDir::new().unwrap();
        let reader = DeviceReader::new(tmp.path(), tmp.path()).with_media_probe(false);
        let record = DeviceRecord::from_properties(DeviceRecord::parse_properties(
            "ACTION=change\nDEVPATH=/devices/sr0\nMAJOR=11\nMINOR=0\nDEVNAME=/dev/sr0\n\
             DEVTYPE=disk\nID_CDROM=1\nID_CDROM_DVD=1\nID_CDROM_MEDIA=1\n\
             ID_CDROM_MEDIA_DVD=1\nID_CDROM_MEDIA_STATE=blank\n\
             ID_CDROM_MEDIA_TRACK_COUNT=1\nUDISKS_PRESENTATION_NOPOLICY=1\n\
             UDISKS_NAME=Burner\n",
        ));

        let device = reader.read(&record, &Devmounts::default()).unwrap();
        assert!(device.optical.is_drive);
        assert!(device.optical.has_disc);
        assert!(device.optical.is_blank);
        assert_eq!(device.optical.num_tracks, 1);
        assert!(device.is_dvd());
        assert!(device.presentation.nopolicy);
        assert!(!device.presentation.hide);
        assert_eq!(device.presentation.name.as_deref(), Some("Burner"));
        assert_eq!(
            device.drive.media_compatibility,
            vec!["optical_cd".to_string(), "optical_dvd".to_string()]
        );
    }

    #[test]
    fn test_enumerate_lists_all_block_devices() {
        let (_tmp, reader) = usb_stick_fixture();
        let records = reader.enumerate().unwrap();
        let devnums: Vec<DevNum> = records.iter().filter_map(|r| r.devnum()).collect();
        assert_eq!(devnums, vec![DevNum::new(8, 16), DevNum::new(8, 17)]);
        assert!(records[1].devpath.ends_with("block/sdb/sdb1"));
    }

    #[test]
    fn test_decode_hex_escapes() {
        assert_eq!(decode_hex_escapes("MY\\x20STICK"), "MY STICK");
        assert_eq!(decode_hex_escapes("plain"), "plain");
        assert_eq!(decode_hex_escapes("bad\\xZZ"), "bad\\xZZ");
    }
}
