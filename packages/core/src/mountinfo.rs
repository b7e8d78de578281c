//! Mount table parsing and diffing module.
//!
//! This module reads the kernel's `mountinfo` table, groups its lines by
//! device number and diffs successive snapshots. Diffing is how mounts
//! without a hotplug event of their own (loop, network and fuse mounts) are
//! discovered. It also looks up mount sources in legacy `mtab` format.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, IoResultExt, Result};

/// Default location of the live mount table.
pub const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// Default location of the legacy mtab-format table.
pub const MTAB_PATH: &str = "/proc/self/mounts";

/// Separator between the per-mount and per-superblock fields.
const FIELD_SEPARATOR: &str = " - ";

/// A kernel device number (`major:minor`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DevNum {
    pub major: u32,
    pub minor: u32,
}

impl DevNum {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parses the `major:minor` form used by mountinfo and sysfs `dev` files.
    pub fn parse(s: &str) -> Option<Self> {
        let (major, minor) = s.trim().split_once(':')?;
        Some(Self {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }

    /// Anonymous device numbers back non-block mounts (network, fuse, tmpfs).
    pub fn is_anonymous(&self) -> bool {
        self.major == 0
    }
}

impl fmt::Display for DevNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// Mount points associated with one device number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Devmount {
    pub devnum: DevNum,
    /// Filesystem type of the first line seen for this device.
    pub fstype: Option<String>,
    /// Mount source of the first line seen for this device.
    pub source: Option<String>,
    /// Sorted, de-duplicated mount points. Empty means "no longer mounted".
    pub mount_points: Vec<PathBuf>,
}

impl Devmount {
    /// Returns the mount points joined into one comparable string.
    pub fn joined(&self) -> String {
        self.mount_points
            .iter()
            .map(|p| p.to_string_lossy())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Returns the first (lowest sorting) mount point.
    pub fn primary_mount_point(&self) -> Option<&Path> {
        self.mount_points.first().map(PathBuf::as_path)
    }

    pub fn is_mounted(&self) -> bool {
        !self.mount_points.is_empty()
    }

    fn removed(devnum: DevNum) -> Self {
        Self {
            devnum,
            fstype: None,
            source: None,
            mount_points: Vec::new(),
        }
    }
}

/// One snapshot of the mount table grouped by device number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Devmounts(BTreeMap<DevNum, Devmount>);

impl Devmounts {
    pub fn get(&self, devnum: DevNum) -> Option<&Devmount> {
        self.0.get(&devnum)
    }

    pub fn contains(&self, devnum: DevNum) -> bool {
        self.0.contains_key(&devnum)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Devmount> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Mount points currently recorded for a device, empty when unmounted.
    pub fn mount_points(&self, devnum: DevNum) -> &[PathBuf] {
        self.0
            .get(&devnum)
            .map(|d| d.mount_points.as_slice())
            .unwrap_or(&[])
    }
}

/// A single parsed mountinfo line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MountLine {
    devnum: DevNum,
    root: String,
    mount_point: PathBuf,
    fstype: String,
    source: String,
}

impl MountLine {
    /// Parses a mountinfo line:
    /// `36 25 8:2 / /mnt rw,relatime shared:1 - ext4 /dev/sda2 rw`
    fn from_line(line: &str) -> Result<Self> {
        let malformed = |message: &str| Error::MountTableParse {
            line: line.to_string(),
            message: message.to_string(),
        };

        let (left, right) = line
            .split_once(FIELD_SEPARATOR)
            .ok_or_else(|| malformed("missing separator"))?;

        let fields: Vec<&str> = left.split_whitespace().collect();
        if fields.len() < 5 {
            return Err(malformed("too few fields before separator"));
        }
        if fields[0].parse::<u64>().is_err() || fields[1].parse::<u64>().is_err() {
            return Err(malformed("mount ids are not numeric"));
        }
        let devnum = DevNum::parse(fields[2]).ok_or_else(|| malformed("bad major:minor"))?;

        let mut right_fields = right.split_whitespace();
        let fstype = right_fields
            .next()
            .ok_or_else(|| malformed("missing filesystem type"))?;
        let source = right_fields.next().unwrap_or("none");

        Ok(Self {
            devnum,
            root: unescape_mount_field(fields[3]),
            mount_point: PathBuf::from(unescape_mount_field(fields[4])),
            fstype: fstype.to_string(),
            source: unescape_mount_field(source),
        })
    }

    /// A subdirectory (bind) mount of a local device duplicates its parent
    /// mount and is not tracked. Network sources keep non-`/` roots.
    fn is_excluded_subdir_mount(&self) -> bool {
        self.root != "/" && is_local_device_path(&self.source)
    }
}

fn is_local_device_path(source: &str) -> bool {
    source.starts_with('/') && !source.starts_with("//")
}

/// Unescapes octal sequences (`\040`, `\011`, `\012`, `\134`) in mount table fields.
pub fn unescape_mount_field(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' {
            let lookahead: String = chars.clone().take(3).collect();
            if lookahead.len() == 3
                && lookahead.chars().all(|d| ('0'..='7').contains(&d))
                && let Ok(byte) = u8::from_str_radix(&lookahead, 8)
            {
                result.push(byte as char);
                for _ in 0..3 {
                    chars.next();
                }
                continue;
            }
        }
        result.push(c);
    }
    result
}

/// Parses mountinfo text into a per-device grouping.
///
/// Malformed lines are logged and skipped; parsing always continues.
pub fn parse_devmounts(text: &str) -> Devmounts {
    let mut grouped: BTreeMap<DevNum, (Option<String>, Option<String>, BTreeSet<PathBuf>)> =
        BTreeMap::new();

    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let parsed = match MountLine::from_line(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("skipping mount table line: {}", e);
                continue;
            }
        };

        if parsed.is_excluded_subdir_mount() {
            continue;
        }

        let entry = grouped
            .entry(parsed.devnum)
            .or_insert_with(|| (Some(parsed.fstype.clone()), Some(parsed.source.clone()), BTreeSet::new()));
        entry.2.insert(parsed.mount_point);
    }

    Devmounts(
        grouped
            .into_iter()
            .map(|(devnum, (fstype, source, points))| {
                (
                    devnum,
                    Devmount {
                        devnum,
                        fstype,
                        source,
                        mount_points: points.into_iter().collect(),
                    },
                )
            })
            .collect(),
    )
}

/// Diffs two snapshots.
///
/// Entries whose joined mount-point string is unchanged are dropped, so a
/// filesystem-type change with the same mount points is not reported. New
/// and changed entries are returned as they are in `new`; entries only in
/// `old` are returned with an empty mount-point list.
pub fn diff_devmounts(old: &Devmounts, new: &Devmounts) -> Vec<Devmount> {
    let mut changed: BTreeMap<DevNum, Devmount> = BTreeMap::new();

    for devmount in new.iter() {
        match old.get(devmount.devnum) {
            Some(previous) if previous.joined() == devmount.joined() => {}
            _ => {
                changed.insert(devmount.devnum, devmount.clone());
            }
        }
    }

    for devmount in old.iter() {
        if !new.contains(devmount.devnum) {
            changed.insert(devmount.devnum, Devmount::removed(devmount.devnum));
        }
    }

    changed.into_values().collect()
}

/// Looks up the source and filesystem type of a mount point in mtab-format
/// text (`source point fstype options dump pass`).
///
/// The last matching line wins, as later mounts shadow earlier ones.
pub fn mtab_source(text: &str, mount_point: &Path) -> Option<(String, String)> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let point = fields.next()?;
            let fstype = fields.next()?;
            (Path::new(&unescape_mount_field(point)) == mount_point)
                .then(|| (unescape_mount_field(source), fstype.to_string()))
        })
        .last()
}

/// The watched mount table and its last parsed snapshot.
#[derive(Debug, Clone)]
pub struct MountTable {
    path: PathBuf,
    devmounts: Devmounts,
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new(MOUNTINFO_PATH)
    }
}

impl MountTable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            devmounts: Devmounts::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The latest snapshot.
    pub fn devmounts(&self) -> &Devmounts {
        &self.devmounts
    }

    /// Parses `text`, replaces the stored snapshot wholesale and, when
    /// `report` is true, returns the entries that differ from the previous one.
    pub fn parse(&mut self, text: &str, report: bool) -> Vec<Devmount> {
        let fresh = parse_devmounts(text);
        let changed = if report {
            diff_devmounts(&self.devmounts, &fresh)
        } else {
            Vec::new()
        };
        debug!(
            "mount table parsed: {} devices, {} changed",
            fresh.len(),
            changed.len()
        );
        self.devmounts = fresh;
        changed
    }

    /// Re-reads the mount table file. See [`MountTable::parse`].
    pub fn refresh(&mut self, report: bool) -> Result<Vec<Devmount>> {
        let text = fs::read_to_string(&self.path).mount_table_context(&self.path)?;
        Ok(self.parse(&text, report))
    }
}
