//! Unified error types for the volmon-core library.
//!
//! Uses SNAFU for context-rich error handling, especially useful when the same
//! underlying error type (like `std::io::Error`) appears in different contexts.

use snafu::{ResultExt, Snafu};
use std::path::PathBuf;

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all core library operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Device record lacks a device node or device number.
    #[snafu(display("incomplete device record at {syspath}"))]
    IncompleteDeviceRecord { syspath: String },

    /// A single mount-table line could not be parsed.
    #[snafu(display("malformed mount table line '{line}': {message}"))]
    MountTableParse { line: String, message: String },

    /// Failed to read the mount table file.
    #[snafu(display("failed to read mount table at {}", path.display()))]
    MountTableRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to read a sysfs attribute or udev database entry.
    #[snafu(display("failed to read device attributes at {}", path.display()))]
    SysfsRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// No configured handler and no known mount utility for an action.
    #[snafu(display("no handler found to {action} {target}"))]
    NoHandlerFound { action: String, target: String },

    /// The string has no recognizable protocol token.
    #[snafu(display("'{url}' is not a network URL"))]
    NotNetworkUrl { url: String },

    /// The string looks like a network URL but is structurally broken.
    #[snafu(display("invalid network URL '{url}': {message}"))]
    InvalidNetworkUrl { url: String, message: String },

    /// Settings file could not be read.
    #[snafu(display("failed to read settings at {}", path.display()))]
    SettingsRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Settings file is not valid JSON for the settings schema.
    #[snafu(display("failed to parse settings at {}", path.display()))]
    SettingsParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Mount point creation failed.
    #[snafu(display("failed to create mount point at {}", path.display()))]
    MountPointCreation {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to hand a command to the shell.
    #[snafu(display("failed to execute command '{command}'"))]
    CommandExecution {
        command: String,
        source: std::io::Error,
    },

    /// Netlink uevent socket setup or receive failed.
    #[snafu(display("netlink uevent socket error"))]
    Netlink { source: nix::Error },

    /// Polling the watched descriptors failed.
    #[snafu(display("failed to poll device and mount watches"))]
    Poll { source: nix::Error },
}

impl Error {
    /// Returns true for errors that only mean "nothing to do" during
    /// non-interactive actions.
    pub fn is_no_handler(&self) -> bool {
        matches!(self, Error::NoHandlerFound { .. })
    }
}

/// Extension trait for adding context to io::Error results.
pub trait IoResultExt<T> {
    /// Add context for command execution errors.
    fn command_context(self, command: impl Into<String>) -> Result<T>;

    /// Add context for settings read errors.
    fn settings_read_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for mount table read errors.
    fn mount_table_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for sysfs and udev database read errors.
    fn sysfs_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for mount point creation errors.
    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn command_context(self, command: impl Into<String>) -> Result<T> {
        self.context(CommandExecutionSnafu {
            command: command.into(),
        })
    }

    fn settings_read_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(SettingsReadSnafu { path: path.into() })
    }

    fn mount_table_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(MountTableReadSnafu { path: path.into() })
    }

    fn sysfs_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(SysfsReadSnafu { path: path.into() })
    }

    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(MountPointCreationSnafu { path: path.into() })
    }
}
