//! User settings for volume handling.
//!
//! Settings are read from a JSON file. Every section has defaults so a
//! missing file or a partial file is always usable. User-facing list syntax
//! (`+value -value` show/hide lists, handler pattern lists) is parsed once
//! at load time into structured predicates.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::debug;

use crate::error::{IoResultExt, Result, SettingsParseSnafu};
use crate::handler::HandlerRule;

/// Directory name used under the user's config and runtime directories.
pub const APP_DIR: &str = "volmon";

/// Settings file name.
pub const SETTINGS_FILE: &str = "settings.json";

/// Default display name format: device, size, label, mount point.
pub const DEFAULT_NAME_FORMAT: &str = "%v %s %l %m";

/// Default mount options handed to mount handlers.
pub const DEFAULT_MOUNT_OPTIONS: &str = "noexec,nosuid,noatime";

/// Filesystem types that are never surfaced as "other" volumes.
const DEFAULT_OTHER_BLACKLIST: &[&str] = &[
    "autofs",
    "binfmt_misc",
    "bpf",
    "cgroup",
    "cgroup2",
    "configfs",
    "debugfs",
    "devpts",
    "devtmpfs",
    "efivarfs",
    "fusectl",
    "hugetlbfs",
    "mqueue",
    "nsfs",
    "overlay",
    "proc",
    "pstore",
    "ramfs",
    "rpc_pipefs",
    "securityfs",
    "selinuxfs",
    "squashfs",
    "sysfs",
    "tmpfs",
    "tracefs",
];

/// Whether a show/hide token shows or hides its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Show,
    Hide,
}

/// A parsed `+value -value` list keyed on device path, label or unique id.
///
/// Tokens are whitespace separated; the first token naming one of the
/// volume's keys decides. Tokens without a sign are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ShowHideList {
    entries: Vec<(Polarity, String)>,
}

impl From<String> for ShowHideList {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<ShowHideList> for String {
    fn from(list: ShowHideList) -> Self {
        list.entries
            .iter()
            .map(|(polarity, value)| match polarity {
                Polarity::Show => format!("+{}", value),
                Polarity::Hide => format!("-{}", value),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl ShowHideList {
    pub fn parse(raw: &str) -> Self {
        let entries = raw
            .split_whitespace()
            .filter_map(|token| {
                if let Some(value) = token.strip_prefix('+') {
                    Some((Polarity::Show, value.to_string()))
                } else if let Some(value) = token.strip_prefix('-') {
                    Some((Polarity::Hide, value.to_string()))
                } else {
                    debug!("ignoring unsigned show/hide token '{}'", token);
                    None
                }
            })
            .filter(|(_, value)| !value.is_empty())
            .collect();
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the polarity of the first entry matching any of `keys`.
    pub fn decide<'a>(&self, keys: impl IntoIterator<Item = &'a str> + Clone) -> Option<Polarity> {
        self.entries.iter().find_map(|(polarity, value)| {
            keys.clone()
                .into_iter()
                .any(|key| key == value)
                .then_some(*polarity)
        })
    }
}

/// Automount and mount-option settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomountSettings {
    /// Automount optical media.
    pub optical: bool,
    /// Automount removable media.
    pub removable: bool,
    /// Automount even when the device asks not to be handled by policy.
    pub ignore_nopolicy: bool,
    /// Explicit automount overrides (`+/dev/sdb1 -LABEL`).
    pub volumes: ShowHideList,
    /// Unmount automounted volumes when the engine shuts down.
    pub unmount_on_exit: bool,
    /// Options substituted for `%o` in mount commands.
    pub mount_options: String,
    /// Extra options appended for specific filesystem types.
    pub fstype_options: BTreeMap<String, String>,
}

impl Default for AutomountSettings {
    fn default() -> Self {
        Self {
            optical: true,
            removable: true,
            ignore_nopolicy: false,
            volumes: ShowHideList::default(),
            unmount_on_exit: true,
            mount_options: DEFAULT_MOUNT_OPTIONS.to_string(),
            fstype_options: BTreeMap::from([
                ("vfat".to_string(), "utf8".to_string()),
                ("ntfs".to_string(), "utf8".to_string()),
            ]),
        }
    }
}

impl AutomountSettings {
    /// Mount options for a filesystem type.
    pub fn options_for(&self, fstype: Option<&str>) -> String {
        let extra = fstype.and_then(|fs| self.fstype_options.get(fs));
        match extra {
            Some(extra) if !extra.is_empty() && !self.mount_options.is_empty() => {
                format!("{},{}", self.mount_options, extra)
            }
            Some(extra) if !extra.is_empty() => extra.clone(),
            _ => self.mount_options.clone(),
        }
    }
}

/// Which volumes are surfaced to UI-facing consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisibilitySettings {
    pub show_internal: bool,
    pub show_empty: bool,
    pub show_partition_tables: bool,
    pub show_network: bool,
    pub show_other: bool,
    pub hide_unmounted: bool,
    /// Show volumes the device manager marked hidden.
    pub ignore_presentation_hide: bool,
    /// Explicit overrides (`+/dev/sda1 -Recovery`).
    pub volumes: ShowHideList,
}

impl Default for VisibilitySettings {
    fn default() -> Self {
        Self {
            show_internal: true,
            show_empty: true,
            show_partition_tables: false,
            show_network: true,
            show_other: true,
            hide_unmounted: false,
            ignore_presentation_hide: false,
            volumes: ShowHideList::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplaySettings {
    /// Display name template (`%v %s %t %l %m %n %i`).
    pub name_format: String,
    /// Use 1024-based size units.
    pub binary_units: bool,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            name_format: DEFAULT_NAME_FORMAT.to_string(),
            binary_units: false,
        }
    }
}

/// Ordered handler lists. List order is priority.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerSettings {
    pub fs: Vec<HandlerRule>,
    pub net: Vec<HandlerRule>,
}

/// Shell templates run on volume transitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookSettings {
    /// New removable media appeared.
    pub insert: Option<String>,
    /// An automounted volume became mounted.
    pub mount: Option<String>,
    /// A volume became unmounted.
    pub unmount: Option<String>,
    /// A device is about to be removed.
    pub remove: Option<String>,
}

/// Filter for non-block, non-network mounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtherMountSettings {
    pub blacklist_fstypes: Vec<String>,
    /// Mount points must live under one of these (fuse mounts are exempt).
    pub allow_paths: Vec<PathBuf>,
}

impl Default for OtherMountSettings {
    fn default() -> Self {
        let mut allow_paths = vec![
            PathBuf::from("/media"),
            PathBuf::from("/mnt"),
            PathBuf::from("/run/media"),
        ];
        if let Some(home) = dirs::home_dir() {
            allow_paths.push(home);
        }
        Self {
            blacklist_fstypes: DEFAULT_OTHER_BLACKLIST
                .iter()
                .map(|s| s.to_string())
                .collect(),
            allow_paths,
        }
    }
}

/// All engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub automount: AutomountSettings,
    pub visibility: VisibilitySettings,
    pub display: DisplaySettings,
    pub handlers: HandlerSettings,
    pub hooks: HookSettings,
    pub other: OtherMountSettings,
    /// Prefix used to run a command inside a terminal emulator.
    pub terminal: String,
    /// Base directory for freshly created mount points.
    pub mount_root: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            automount: AutomountSettings::default(),
            visibility: VisibilitySettings::default(),
            display: DisplaySettings::default(),
            handlers: HandlerSettings::default(),
            hooks: HookSettings::default(),
            other: OtherMountSettings::default(),
            terminal: "xterm -e".to_string(),
            mount_root: None,
        }
    }
}

impl Settings {
    /// Returns the default settings file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(SETTINGS_FILE))
    }

    /// Loads settings from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("no settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).settings_read_context(path)?;
        Self::from_json(&content).context(SettingsParseSnafu { path })
    }

    /// Loads settings from the default location.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_json(content: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// Base directory for mount points created by the handler resolver.
    pub fn mount_root(&self) -> PathBuf {
        self.mount_root.clone().unwrap_or_else(|| {
            dirs::runtime_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(APP_DIR)
                .join("media")
        })
    }
}
