//! volmon-core: removable and network volume tracking for Linux desktops.
//!
//! This library keeps a live list of mountable volumes (block devices,
//! network shares and other mounts) by combining device hotplug records
//! with the kernel mount table, and applies a configurable automount
//! policy. Mounting itself is delegated to external programs such as
//! `udevil`, `pmount` or `udisksctl`.
//!
//! # Modules
//!
//! - [`mountinfo`]: Mount table parsing and diffing
//! - [`device`]: Device records and descriptors from sysfs and the udev database
//! - [`netmount`]: Network URL splitting
//! - [`volume`]: The volume model and display names
//! - [`policy`]: Automount, autounmount and visibility decisions
//! - [`handler`]: Mount/unmount command resolution
//! - [`executor`]: Running resolved commands and hooks
//! - [`events`]: Change notification
//! - [`registry`]: The volume registry
//! - [`monitor`]: Netlink and mount table event sources
//! - [`config`]: Settings
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use volmon_core::{PathLocator, Settings, ShellRunner, VolumeEvent, VolumeRegistry};
//!
//! let settings = Settings::load_default().unwrap();
//! let runner = ShellRunner::new(settings.terminal.clone());
//! let mut registry = VolumeRegistry::new(settings, Box::new(runner), Box::new(PathLocator));
//! registry.subscribe(|event: &VolumeEvent| {
//!     println!("{} {}", event.name(), event.volume().disp_name);
//! });
//! registry.init(true).unwrap();
//!
//! for volume in registry.visible_volumes() {
//!     println!("{}", volume.disp_name);
//! }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod executor;
pub mod handler;
pub mod monitor;
pub mod mountinfo;
pub mod netmount;
pub mod policy;
pub mod registry;
pub mod volume;

// Re-export commonly used types
pub use config::Settings;
pub use device::{Device, DeviceReader, DeviceRecord};
pub use error::{Error, Result};
pub use events::{SubscriptionId, VolumeEvent, VolumeObserver};
pub use executor::{RecordingRunner, ShellRunner, Task, TaskRunner};
pub use handler::{HandlerAction, PathLocator, ProgramLocator, ResolvedCommand};
pub use monitor::Monitor;
pub use mountinfo::{DevNum, MountTable};
pub use netmount::Netmount;
pub use registry::VolumeRegistry;
pub use volume::{Volume, VolumeKind};
