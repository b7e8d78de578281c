//! Automount, autounmount and visibility decisions.
//!
//! These are pure functions over a [`Volume`] and the user's settings,
//! apart from [`should_automount`] which stamps the debounce time on the
//! volume when it says yes.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::{AutomountSettings, Polarity, VisibilitySettings};
use crate::volume::{Volume, VolumeKind};

/// Minimum interval between automount attempts on one volume.
pub const AUTOMOUNT_DEBOUNCE: Duration = Duration::from_secs(5);

/// Why an autounmount is being considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountReason {
    /// After a registry transition.
    Transition,
    /// The engine is shutting down.
    Exit,
}

/// Keys a show/hide list can name: device path, label, unique id.
fn volume_keys(volume: &Volume) -> [&str; 3] {
    [
        volume.device_file.as_str(),
        volume.label.as_deref().unwrap_or_default(),
        volume.udi.as_str(),
    ]
}

/// Decides whether to automount `volume` now.
///
/// A `true` answer records `now` as the last attempt, so a second call
/// within [`AUTOMOUNT_DEBOUNCE`] returns `false`.
pub fn should_automount(volume: &mut Volume, settings: &AutomountSettings, now: Instant) -> bool {
    if volume.kind() != VolumeKind::Block || !volume.mountable || volume.blank {
        return false;
    }
    if volume.is_mounted || volume.ever_mounted || volume.inhibit_auto {
        return false;
    }
    if let Some(last) = volume.automount_time
        && now.saturating_duration_since(last) < AUTOMOUNT_DEBOUNCE
    {
        debug!("automount of {} debounced", volume.device_file);
        return false;
    }

    let decision = match settings.volumes.decide(volume_keys(volume)) {
        Some(polarity) => polarity == Polarity::Show,
        None => {
            if volume.nopolicy && !settings.ignore_nopolicy {
                false
            } else if volume.table {
                false
            } else if volume.optical {
                settings.optical
            } else if volume.removable {
                settings.removable
            } else {
                false
            }
        }
    };

    if decision {
        volume.automount_time = Some(now);
    }
    decision
}

/// Decides whether to unmount `volume` without user action.
pub fn should_autounmount(
    volume: &Volume,
    settings: &AutomountSettings,
    reason: UnmountReason,
) -> bool {
    if !volume.is_mounted {
        return false;
    }
    match reason {
        UnmountReason::Transition => volume.should_autounmount,
        UnmountReason::Exit => {
            volume.should_autounmount
                || (settings.unmount_on_exit
                    && volume.is_block()
                    && (volume.removable || volume.optical))
        }
    }
}

/// Decides whether `volume` is surfaced to UI-facing consumers.
pub fn is_volume_visible(volume: &Volume, settings: &VisibilitySettings) -> bool {
    if let Some(polarity) = settings.volumes.decide(volume_keys(volume)) {
        return polarity == Polarity::Show;
    }
    if settings.hide_unmounted && !volume.is_mounted {
        return false;
    }
    match volume.kind() {
        VolumeKind::Network => settings.show_network,
        VolumeKind::Other => settings.show_other,
        VolumeKind::Block => {
            (volume.user_visible || settings.ignore_presentation_hide)
                && (!volume.table || settings.show_partition_tables)
                && (!volume.system_internal || settings.show_internal)
                && (volume.media_available || settings.show_empty)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DisplaySettings, ShowHideList};
    use crate::device::{Device, DriveInfo, FilesystemInfo, OpticalInfo, PresentationHints};
    use crate::mountinfo::{DevNum, Devmount};
    use std::path::PathBuf;

    /// An unmounted removable vfat volume.
    fn removable_volume() -> Volume {
        let device = Device {
            devnum: DevNum::new(8, 17),
            devnode: PathBuf::from("/dev/sdb1"),
            syspath: PathBuf::from("/sys/block/sdb/sdb1"),
            devtype: Some("partition".to_string()),
            id: None,
            is_removable: true,
            is_read_only: false,
            is_media_available: true,
            is_system_internal: false,
            size: 1 << 30,
            filesystem: Some(FilesystemInfo {
                usage: Some("filesystem".to_string()),
                fstype: Some("vfat".to_string()),
                label: Some("STICK".to_string()),
                ..FilesystemInfo::default()
            }),
            drive: DriveInfo::default(),
            partition: None,
            partition_table: None,
            optical: OpticalInfo::default(),
            presentation: PresentationHints::default(),
            mount_points: Vec::new(),
        };
        Volume::from_device(&device, &DisplaySettings::default())
    }

    #[test]
    fn test_removable_automounts_then_debounces() {
        let settings = AutomountSettings::default();
        let mut volume = removable_volume();
        let start = Instant::now();

        assert!(should_automount(&mut volume, &settings, start));
        assert!(!should_automount(
            &mut volume,
            &settings,
            start + Duration::from_secs(2)
        ));
        assert!(should_automount(
            &mut volume,
            &settings,
            start + Duration::from_secs(6)
        ));
    }

    #[test]
    fn test_removable_toggle_off() {
        let settings = AutomountSettings {
            removable: false,
            ..AutomountSettings::default()
        };
        assert!(!should_automount(
            &mut removable_volume(),
            &settings,
            Instant::now()
        ));
    }

    #[test]
    fn test_explicit_list_overrides_policy() {
        let mut volume = removable_volume();
        volume.nopolicy = true;

        let settings = AutomountSettings {
            volumes: ShowHideList::parse("+STICK"),
            ..AutomountSettings::default()
        };
        assert!(should_automount(&mut volume, &settings, Instant::now()));

        let settings = AutomountSettings {
            volumes: ShowHideList::parse("-/dev/sdb1"),
            ..AutomountSettings::default()
        };
        assert!(!should_automount(&mut removable_volume(), &settings, Instant::now()));
    }

    #[test]
    fn test_nopolicy_and_table_suppress() {
        let settings = AutomountSettings::default();

        let mut volume = removable_volume();
        volume.nopolicy = true;
        assert!(!should_automount(&mut volume, &settings, Instant::now()));

        let ignoring = AutomountSettings {
            ignore_nopolicy: true,
            ..AutomountSettings::default()
        };
        assert!(should_automount(&mut volume, &ignoring, Instant::now()));

        let mut volume = removable_volume();
        volume.table = true;
        assert!(!should_automount(&mut volume, &settings, Instant::now()));
    }

    #[test]
    fn test_never_automount_mounted_blank_or_non_block() {
        let settings = AutomountSettings::default();

        let mut volume = removable_volume();
        volume.is_mounted = true;
        assert!(!should_automount(&mut volume, &settings, Instant::now()));

        let mut volume = removable_volume();
        volume.blank = true;
        assert!(!should_automount(&mut volume, &settings, Instant::now()));

        let mut volume = removable_volume();
        volume.ever_mounted = true;
        assert!(!should_automount(&mut volume, &settings, Instant::now()));

        let devmount = Devmount {
            devnum: DevNum::new(0, 50),
            fstype: Some("cifs".to_string()),
            source: None,
            mount_points: Vec::new(),
        };
        let mut other = Volume::other(&devmount, "//nas/share", &DisplaySettings::default());
        assert!(!should_automount(&mut other, &settings, Instant::now()));
    }

    #[test]
    fn test_autounmount() {
        let settings = AutomountSettings::default();
        let mut volume = removable_volume();
        assert!(!should_autounmount(&volume, &settings, UnmountReason::Exit));

        volume.is_mounted = true;
        assert!(!should_autounmount(&volume, &settings, UnmountReason::Transition));
        assert!(should_autounmount(&volume, &settings, UnmountReason::Exit));

        volume.should_autounmount = true;
        assert!(should_autounmount(&volume, &settings, UnmountReason::Transition));

        let keep = AutomountSettings {
            unmount_on_exit: false,
            ..AutomountSettings::default()
        };
        volume.should_autounmount = false;
        assert!(!should_autounmount(&volume, &keep, UnmountReason::Exit));
    }

    #[test]
    fn test_visibility_is_pure() {
        let settings = VisibilitySettings::default();
        let mut volume = removable_volume();
        let first = is_volume_visible(&volume, &settings);
        assert_eq!(first, is_volume_visible(&volume, &settings));
        assert!(first);

        volume.user_visible = false;
        assert!(!is_volume_visible(&volume, &settings));

        let forced = VisibilitySettings {
            volumes: ShowHideList::parse("+/dev/sdb1"),
            ..VisibilitySettings::default()
        };
        assert!(is_volume_visible(&volume, &forced));

        volume.user_visible = true;
        volume.table = true;
        assert!(!is_volume_visible(&volume, &settings));

        let hide_unmounted = VisibilitySettings {
            hide_unmounted: true,
            ..VisibilitySettings::default()
        };
        assert!(!is_volume_visible(&removable_volume(), &hide_unmounted));
    }
}
