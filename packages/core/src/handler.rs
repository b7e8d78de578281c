//! Handler resolution.
//!
//! Picks the command used to mount, unmount or show a volume. The user's
//! ordered handler rules are tried first; each rule has glob whitelist and
//! blacklist patterns over `key=value` strings describing the volume. When
//! no rule matches, well-known mount utilities found on `PATH` are used.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::{Error, IoResultExt, Result};
use crate::netmount::{self, Netmount};
use crate::volume::Volume;

/// Gives up looking for a free mount point directory after this many tries.
const MAX_MOUNT_POINT_SUFFIX: u32 = 100;

/// One compiled glob pattern. Mandatory patterns (`+pattern`) must all match.
#[derive(Debug, Clone)]
struct Pattern {
    source: String,
    matcher: GlobMatcher,
    mandatory: bool,
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.mandatory == other.mandatory
    }
}

impl Eq for Pattern {}

impl Pattern {
    fn new(token: &str) -> Option<Self> {
        let (source, mandatory) = match token.strip_prefix('+') {
            Some(glob) => (glob, true),
            None => (token, false),
        };
        if source.is_empty() {
            return None;
        }
        match Glob::new(source) {
            Ok(glob) => Some(Self {
                source: source.to_string(),
                matcher: glob.compile_matcher(),
                mandatory,
            }),
            Err(e) => {
                warn!("ignoring invalid handler pattern '{}': {}", source, e);
                None
            }
        }
    }

    fn matches(&self, values: &[String]) -> bool {
        self.source == "*" || values.iter().any(|v| self.matcher.is_match(v))
    }
}

/// A whitespace-separated list of glob patterns (`*`, `?`, `[...]`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct PatternList {
    patterns: Vec<Pattern>,
}

impl From<String> for PatternList {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<PatternList> for String {
    fn from(list: PatternList) -> Self {
        list.patterns
            .iter()
            .map(|p| {
                if p.mandatory {
                    format!("+{}", p.source)
                } else {
                    p.source.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl PatternList {
    pub fn parse(raw: &str) -> Self {
        let patterns = raw.split_whitespace().filter_map(Pattern::new).collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// True if any pattern matches any value.
    pub fn matches_any(&self, values: &[String]) -> bool {
        self.patterns.iter().any(|p| p.matches(values))
    }

    /// Whitelist semantics: every mandatory pattern matches some value, and
    /// at least one optional pattern matches (`*` matches everything). A
    /// list of only mandatory patterns needs nothing more.
    pub fn admits(&self, values: &[String]) -> bool {
        let (mandatory, optional): (Vec<&Pattern>, Vec<&Pattern>) =
            self.patterns.iter().partition(|p| p.mandatory);

        if !mandatory.iter().all(|p| p.matches(values)) {
            return false;
        }
        if optional.is_empty() {
            return !mandatory.is_empty();
        }
        optional.iter().any(|p| p.matches(values))
    }
}

fn default_enabled() -> bool {
    true
}

/// A user-configured handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerRule {
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub whitelist: PatternList,
    #[serde(default)]
    pub blacklist: PatternList,
    #[serde(default)]
    pub mount: Option<String>,
    #[serde(default)]
    pub unmount: Option<String>,
    #[serde(default)]
    pub info: Option<String>,
    #[serde(default)]
    pub mount_in_terminal: bool,
    #[serde(default)]
    pub unmount_in_terminal: bool,
    #[serde(default)]
    pub info_in_terminal: bool,
}

impl HandlerRule {
    /// Blacklist matches none of the values and the whitelist admits them.
    pub fn matches(&self, values: &[String]) -> bool {
        self.enabled && !self.blacklist.matches_any(values) && self.whitelist.admits(values)
    }

    fn template(&self, action: HandlerAction) -> Option<(&str, bool)> {
        let (template, terminal) = match action {
            HandlerAction::Mount => (&self.mount, self.mount_in_terminal),
            HandlerAction::Unmount => (&self.unmount, self.unmount_in_terminal),
            HandlerAction::Properties => (&self.info, self.info_in_terminal),
        };
        template
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| (t, terminal))
    }
}

/// Which handler list applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerMode {
    Filesystem,
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerAction {
    Mount,
    Unmount,
    Properties,
}

impl HandlerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerAction::Mount => "mount",
            HandlerAction::Unmount => "unmount",
            HandlerAction::Properties => "info",
        }
    }
}

impl fmt::Display for HandlerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerAction::Properties => f.write_str("show properties of"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// A fully substituted shell command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedCommand {
    pub command: String,
    pub in_terminal: bool,
    /// Handler id, or the utility name for a fallback.
    pub handler: String,
}

/// Finds external programs.
pub trait ProgramLocator {
    fn locate(&self, program: &str) -> Option<PathBuf>;
}

/// Looks programs up on `PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathLocator;

impl ProgramLocator for PathLocator {
    fn locate(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }
}

fn flag_value(key: &str, value: bool) -> String {
    format!("{}={}", key, if value { 1 } else { 0 })
}

/// `key=value` strings describing a block volume.
pub fn volume_values(volume: &Volume) -> Vec<String> {
    vec![
        format!("dev={}", volume.device_file),
        format!("fstype={}", volume.fs_type.as_deref().unwrap_or_default()),
        format!("label={}", volume.label.as_deref().unwrap_or_default()),
        format!("id={}", volume.udi),
        format!(
            "point={}",
            volume
                .mount_point
                .as_deref()
                .map(|p| p.to_string_lossy())
                .unwrap_or_default()
        ),
        flag_value("removable", volume.removable),
        flag_value("optical", volume.optical),
        flag_value("audiocd", volume.audiocd),
        flag_value("dvd", volume.dvd),
        flag_value("floppy", volume.floppy),
    ]
}

/// `key=value` strings describing a network source.
pub fn network_values(net: &Netmount) -> Vec<String> {
    vec![
        format!("url={}", net.url),
        format!("protocol={}", net.protocol),
        format!("host={}", net.host),
        format!("port={}", net.port.map(|p| p.to_string()).unwrap_or_default()),
        format!("user={}", net.user.as_deref().unwrap_or_default()),
        format!("path={}", net.path.as_deref().unwrap_or_default()),
        format!("fstype={}", net.fstype),
    ]
}

/// Quotes a value for `sh` when it contains anything beyond a safe set.
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/-_.,:=@+".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Resolves the command for `action` on `volume`.
///
/// In network mode the source is `netmount`, or the volume's device file
/// split as a URL. Errors are [`Error::NoHandlerFound`] when neither a rule
/// nor a fallback utility applies, and URL errors for bad network sources.
pub fn resolve(
    mode: HandlerMode,
    action: HandlerAction,
    volume: &Volume,
    netmount: Option<&Netmount>,
    settings: &Settings,
    locator: &dyn ProgramLocator,
) -> Result<ResolvedCommand> {
    let net = match (mode, netmount) {
        (HandlerMode::Filesystem, _) => None,
        (HandlerMode::Network, Some(net)) => Some(net.clone()),
        (HandlerMode::Network, None) => Some(netmount::split(&volume.device_file)?),
    };

    let (rules, values) = match &net {
        Some(net) => (&settings.handlers.net, network_values(net)),
        None => (&settings.handlers.fs, volume_values(volume)),
    };

    for rule in rules {
        if !rule.matches(&values) {
            continue;
        }
        let Some((template, in_terminal)) = rule.template(action) else {
            continue;
        };
        debug!("handler '{}' selected to {} {}", rule.id, action, volume.device_file);
        let command = Substitution::new(volume, net.as_ref(), settings).apply(template)?;
        return Ok(ResolvedCommand {
            command,
            in_terminal,
            handler: rule.id.clone(),
        });
    }

    fallback(action, volume, net.as_ref(), settings, locator).ok_or_else(|| {
        Error::NoHandlerFound {
            action: action.to_string(),
            target: volume.device_file.clone(),
        }
    })
}

/// The fixed discovery cascade of well-known mount utilities.
fn fallback(
    action: HandlerAction,
    volume: &Volume,
    net: Option<&Netmount>,
    settings: &Settings,
    locator: &dyn ProgramLocator,
) -> Option<ResolvedCommand> {
    let dev = shell_quote(&volume.device_file);
    let options = shell_quote(&settings.automount.options_for(volume.fs_type.as_deref()));
    let point = volume
        .mount_point
        .as_deref()
        .map(|p| shell_quote(&p.to_string_lossy()));

    let candidates: Vec<(&str, String, bool)> = match (net, action) {
        (None, HandlerAction::Mount) => vec![
            ("udevil", format!("mount -o {} {}", options, dev), false),
            ("pmount", dev.clone(), false),
            ("udisksctl", format!("mount -b {}", dev), false),
        ],
        (None, HandlerAction::Unmount) => vec![
            ("udevil", format!("umount {}", dev), false),
            ("pumount", dev.clone(), false),
            ("udisksctl", format!("unmount -b {}", dev), false),
        ],
        (None, HandlerAction::Properties) => vec![
            ("udevil", format!("info {}", dev), true),
            ("udisksctl", format!("info -b {}", dev), true),
        ],
        (Some(net), HandlerAction::Mount) => {
            vec![("udevil", format!("mount {}", shell_quote(&net.url)), false)]
        }
        (Some(_), HandlerAction::Unmount) => {
            let target = point.unwrap_or_else(|| dev.clone());
            if volume.fs_type.as_deref().is_some_and(|t| t.starts_with("fuse")) {
                vec![
                    ("fusermount", format!("-u {}", target), false),
                    ("udevil", format!("umount {}", target), false),
                ]
            } else {
                vec![("udevil", format!("umount {}", target), false)]
            }
        }
        (Some(_), HandlerAction::Properties) => Vec::new(),
    };

    candidates
        .into_iter()
        .find_map(|(program, args, in_terminal)| {
            let path = locator.locate(program)?;
            debug!("falling back to {} at {}", program, path.display());
            Some(ResolvedCommand {
                command: format!("{} {}", shell_quote(&path.to_string_lossy()), args),
                in_terminal,
                handler: program.to_string(),
            })
        })
}

/// Template variable expansion for one resolution.
struct Substitution<'a> {
    volume: &'a Volume,
    net: Option<&'a Netmount>,
    settings: &'a Settings,
}

impl<'a> Substitution<'a> {
    fn new(volume: &'a Volume, net: Option<&'a Netmount>, settings: &'a Settings) -> Self {
        Self {
            volume,
            net,
            settings,
        }
    }

    /// Expands one template in a single pass, so substituted values are
    /// never expanded again.
    fn apply(&self, template: &str) -> Result<String> {
        let mut mount_point: Option<PathBuf> = None;
        let net_tokens = self.net.map(net_tokens);

        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(idx) = rest.find('%') {
            out.push_str(&rest[..idx]);
            let tail = &rest[idx..];

            if let Some(tokens) = &net_tokens
                && let Some((token, value)) = tokens.iter().find(|(t, _)| tail.starts_with(t))
            {
                out.push_str(&shell_quote(value));
                rest = &tail[token.len()..];
                continue;
            }

            let Some(c) = tail[1..].chars().next() else {
                out.push('%');
                rest = "";
                break;
            };
            rest = &tail[1 + c.len_utf8()..];
            let value = match c {
                'v' => self.volume.device_file.clone(),
                'o' => self
                    .settings
                    .automount
                    .options_for(self.volume.fs_type.as_deref()),
                't' => self.volume.fs_type.clone().unwrap_or_default(),
                'a' => {
                    if mount_point.is_none() {
                        mount_point = Some(self.mount_point()?);
                    }
                    mount_point
                        .as_deref()
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_default()
                }
                'l' => self.volume.label.clone().unwrap_or_default(),
                'i' => self.volume.udi.clone(),
                '%' => {
                    out.push('%');
                    continue;
                }
                other => {
                    out.push('%');
                    out.push(other);
                    continue;
                }
            };
            out.push_str(&shell_quote(&value));
        }
        out.push_str(rest);

        match self.net {
            Some(net) => Ok(format!("{}{}", export_prefix(net), out)),
            None => Ok(out),
        }
    }

    /// The current mount point, or a fresh directory under the mount root.
    fn mount_point(&self) -> Result<PathBuf> {
        if let Some(point) = &self.volume.mount_point {
            return Ok(point.clone());
        }
        let base = match self.net {
            Some(net) if !net.host.is_empty() => sanitize_dir_name(&net.host),
            _ => sanitize_dir_name(
                self.volume
                    .label
                    .as_deref()
                    .unwrap_or(self.volume.device_basename()),
            ),
        };
        create_mount_point(&self.settings.mount_root(), &base)
    }
}

fn net_tokens(net: &Netmount) -> [(&'static str, String); 7] {
    [
        ("%url%", net.url.clone()),
        ("%proto%", net.protocol.clone()),
        ("%host%", net.host.clone()),
        ("%port%", net.port.map(|p| p.to_string()).unwrap_or_default()),
        ("%user%", net.user.clone().unwrap_or_default()),
        ("%pass%", net.pass.clone().unwrap_or_default()),
        ("%path%", net.path.clone().unwrap_or_default()),
    ]
}

/// `export fm_url=... fm_url_proto=...; ` so handler scripts can read the
/// split source from the environment.
fn export_prefix(net: &Netmount) -> String {
    let names = [
        "fm_url",
        "fm_url_proto",
        "fm_url_host",
        "fm_url_port",
        "fm_url_user",
        "fm_url_pass",
        "fm_url_path",
    ];
    let assignments: Vec<String> = names
        .iter()
        .zip(net_tokens(net))
        .map(|(name, (_, value))| format!("{}={}", name, shell_quote(&value)))
        .collect();
    format!("export {}; ", assignments.join(" "))
}

fn sanitize_dir_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "volume".to_string()
    } else {
        cleaned
    }
}

/// Creates `root/base`, or reuses it when it is an empty directory; taken
/// names get `-2`, `-3`, ... suffixes.
fn create_mount_point(root: &Path, base: &str) -> Result<PathBuf> {
    for n in 1..=MAX_MOUNT_POINT_SUFFIX {
        let name = if n == 1 {
            base.to_string()
        } else {
            format!("{}-{}", base, n)
        };
        let path = root.join(name);

        if !path.exists() {
            fs::create_dir_all(&path).mount_point_context(&path)?;
            debug!("created mount point {}", path.display());
            return Ok(path);
        }
        if path.is_dir() && is_empty_dir(&path) {
            return Ok(path);
        }
    }

    let path = root.join(base);
    Err(io::Error::new(io::ErrorKind::AlreadyExists, "no free mount point name"))
        .mount_point_context(path)
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DisplaySettings, HandlerSettings};
    use crate::device::{Device, DriveInfo, FilesystemInfo, OpticalInfo, PresentationHints};
    use crate::mountinfo::{DevNum, Devmount};
    use tempfile::TempDir;

    struct FakeLocator(Vec<&'static str>);

    impl ProgramLocator for FakeLocator {
        fn locate(&self, program: &str) -> Option<PathBuf> {
            self.0
                .contains(&program)
                .then(|| PathBuf::from("/usr/bin").join(program))
        }
    }

    fn stick(label: Option<&str>) -> Volume {
        let device = Device {
            devnum: DevNum::new(8, 17),
            devnode: PathBuf::from("/dev/sdb1"),
            syspath: PathBuf::from("/sys/block/sdb/sdb1"),
            devtype: Some("partition".to_string()),
            id: Some("/dev/disk/by-uuid/1234-ABCD".to_string()),
            is_removable: true,
            is_read_only: false,
            is_media_available: true,
            is_system_internal: false,
            size: 1 << 30,
            filesystem: Some(FilesystemInfo {
                usage: Some("filesystem".to_string()),
                fstype: Some("vfat".to_string()),
                label: label.map(str::to_string),
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

    fn rule(id: &str, whitelist: &str, blacklist: &str, mount: &str) -> HandlerRule {
        HandlerRule {
            id: id.to_string(),
            enabled: true,
            whitelist: PatternList::parse(whitelist),
            blacklist: PatternList::parse(blacklist),
            mount: Some(mount.to_string()),
            unmount: None,
            info: None,
            mount_in_terminal: false,
            unmount_in_terminal: false,
            info_in_terminal: false,
        }
    }

    fn settings_with(fs: Vec<HandlerRule>, root: &Path) -> Settings {
        Settings {
            handlers: HandlerSettings { fs, net: Vec::new() },
            mount_root: Some(root.to_path_buf()),
            ..Settings::default()
        }
    }

    #[test]
    fn test_pattern_globs() {
        let values = |v: &str| vec![v.to_string()];

        assert!(PatternList::parse("dev=/dev/sd*").matches_any(&values("dev=/dev/sdb1")));
        assert!(PatternList::parse("fstype=?fat").matches_any(&values("fstype=vfat")));
        assert!(PatternList::parse("*").matches_any(&values("")));
        assert!(PatternList::parse("a*b*c").matches_any(&values("axxbyyc")));
        assert!(!PatternList::parse("a*b*c").matches_any(&values("axxbyy")));
        assert!(!PatternList::parse("fstype=ext?").matches_any(&values("fstype=ext")));
        assert!(PatternList::parse("fstype=ext[234]").matches_any(&values("fstype=ext4")));
    }

    #[test]
    fn test_invalid_pattern_dropped() {
        let list = PatternList::parse("label=[unclosed fstype=vfat");
        assert_eq!(String::from(list.clone()), "fstype=vfat");
        assert!(list.matches_any(&["fstype=vfat".to_string()]));
        assert!(!list.matches_any(&["label=[unclosed".to_string()]));
    }

    #[test]
    fn test_whitelist_mandatory_tokens() {
        let values = volume_values(&stick(Some("STICK")));

        assert!(PatternList::parse("*").admits(&values));
        assert!(PatternList::parse("fstype=vfat").admits(&values));
        assert!(PatternList::parse("+removable=1").admits(&values));
        assert!(PatternList::parse("+removable=1 fstype=ntfs fstype=vfat").admits(&values));
        assert!(!PatternList::parse("+optical=1 fstype=vfat").admits(&values));
        assert!(!PatternList::parse("").admits(&values));
        assert_eq!(
            String::from(PatternList::parse("+removable=1  fstype=*")),
            "+removable=1 fstype=*"
        );
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let tmp = TempDir::new().unwrap();
        let settings = settings_with(
            vec![
                rule("ntfs", "fstype=ntfs", "", "ntfs-3g %v %a"),
                rule("skip", "*", "label=STICK", "never %v"),
                rule("vfat", "fstype=vfat", "", "mount -o %o %v"),
                rule("any", "*", "", "mount %v"),
            ],
            tmp.path(),
        );

        let resolved = resolve(
            HandlerMode::Filesystem,
            HandlerAction::Mount,
            &stick(Some("STICK")),
            None,
            &settings,
            &FakeLocator(vec![]),
        )
        .unwrap();
        assert_eq!(resolved.handler, "vfat");
        assert_eq!(
            resolved.command,
            "mount -o noexec,nosuid,noatime,utf8 /dev/sdb1"
        );
        assert!(!resolved.in_terminal);
    }

    #[test]
    fn test_disabled_rule_and_missing_template_skipped() {
        let tmp = TempDir::new().unwrap();
        let mut disabled = rule("off", "*", "", "off %v");
        disabled.enabled = false;
        let settings = settings_with(vec![disabled, rule("on", "*", "", "on %v")], tmp.path());

        let resolved = resolve(
            HandlerMode::Filesystem,
            HandlerAction::Mount,
            &stick(None),
            None,
            &settings,
            &FakeLocator(vec![]),
        )
        .unwrap();
        assert_eq!(resolved.handler, "on");

        // No unmount template anywhere and no utilities
        let err = resolve(
            HandlerMode::Filesystem,
            HandlerAction::Unmount,
            &stick(None),
            None,
            &settings,
            &FakeLocator(vec![]),
        )
        .unwrap_err();
        assert!(err.is_no_handler());
    }

    #[test]
    fn test_mount_point_created_and_quoted() {
        let tmp = TempDir::new().unwrap();
        let settings = settings_with(vec![rule("any", "*", "", "mount %v %a")], tmp.path());

        let resolved = resolve(
            HandlerMode::Filesystem,
            HandlerAction::Mount,
            &stick(Some("MY STICK")),
            None,
            &settings,
            &FakeLocator(vec![]),
        )
        .unwrap();

        let expected = tmp.path().join("MY_STICK");
        assert!(expected.is_dir());
        assert_eq!(
            resolved.command,
            format!("mount /dev/sdb1 {}", shell_quote(&expected.to_string_lossy()))
        );
    }

    #[test]
    fn test_escaped_percent_a_creates_nothing() {
        let tmp = TempDir::new().unwrap();
        let settings = settings_with(vec![rule("any", "*", "", "echo 100%%a %v")], tmp.path());

        let resolved = resolve(
            HandlerMode::Filesystem,
            HandlerAction::Mount,
            &stick(Some("STICK")),
            None,
            &settings,
            &FakeLocator(vec![]),
        )
        .unwrap();

        assert_eq!(resolved.command, "echo 100%a /dev/sdb1");
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_mount_point_taken_gets_suffix() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("STICK")).unwrap();
        fs::write(tmp.path().join("STICK/file"), "x").unwrap();

        let path = create_mount_point(tmp.path(), "STICK").unwrap();
        assert_eq!(path, tmp.path().join("STICK-2"));

        // An empty existing directory is reused
        let again = create_mount_point(tmp.path(), "STICK").unwrap();
        assert_eq!(again, path);
    }

    #[test]
    fn test_fallback_cascade_order() {
        let tmp = TempDir::new().unwrap();
        let settings = settings_with(Vec::new(), tmp.path());
        let volume = stick(Some("STICK"));

        let resolved = resolve(
            HandlerMode::Filesystem,
            HandlerAction::Mount,
            &volume,
            None,
            &settings,
            &FakeLocator(vec!["pmount", "udisksctl"]),
        )
        .unwrap();
        assert_eq!(resolved.handler, "pmount");
        assert_eq!(resolved.command, "/usr/bin/pmount /dev/sdb1");

        let resolved = resolve(
            HandlerMode::Filesystem,
            HandlerAction::Properties,
            &volume,
            None,
            &settings,
            &FakeLocator(vec!["pmount", "udisksctl"]),
        )
        .unwrap();
        assert_eq!(resolved.command, "/usr/bin/udisksctl info -b /dev/sdb1");
        assert!(resolved.in_terminal);

        let err = resolve(
            HandlerMode::Filesystem,
            HandlerAction::Mount,
            &volume,
            None,
            &settings,
            &FakeLocator(vec![]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::NoHandlerFound { .. }));
    }

    #[test]
    fn test_network_handler_tokens_and_exports() {
        let tmp = TempDir::new().unwrap();
        let mut settings = settings_with(Vec::new(), tmp.path());
        let mut net_rule = rule("sshfs", "protocol=ssh", "", "sshfs -p %port% %user%@%host%:%path% %a");
        net_rule.mount_in_terminal = true;
        settings.handlers.net = vec![net_rule];

        let net = netmount::split("ssh://me@example.org:2222/srv/data").unwrap();
        let devmount = Devmount {
            devnum: DevNum::new(0, 0),
            fstype: None,
            source: None,
            mount_points: Vec::new(),
        };
        let volume = Volume::network(&devmount, &net, &DisplaySettings::default());

        let resolved = resolve(
            HandlerMode::Network,
            HandlerAction::Mount,
            &volume,
            Some(&net),
            &settings,
            &FakeLocator(vec![]),
        )
        .unwrap();

        let point = tmp.path().join("example.org");
        assert!(point.is_dir());
        assert!(resolved.in_terminal);
        assert_eq!(
            resolved.command,
            format!(
                "export fm_url=ssh://me@example.org:2222/srv/data fm_url_proto=ssh \
                 fm_url_host=example.org fm_url_port=2222 fm_url_user=me fm_url_pass='' \
                 fm_url_path=/srv/data; sshfs -p 2222 me@example.org:/srv/data {}",
                shell_quote(&point.to_string_lossy())
            )
        );
    }

    #[test]
    fn test_network_unmount_fuse_fallback() {
        let tmp = TempDir::new().unwrap();
        let settings = settings_with(Vec::new(), tmp.path());
        let devmount = Devmount {
            devnum: DevNum::new(0, 60),
            fstype: Some("fuse.sshfs".to_string()),
            source: Some("me@host:/data".to_string()),
            mount_points: vec![PathBuf::from("/home/me/remote")],
        };
        let net = netmount::split("me@host:/data").unwrap().with_protocol("ssh");
        let volume = Volume::network(&devmount, &net, &DisplaySettings::default());

        let resolved = resolve(
            HandlerMode::Network,
            HandlerAction::Unmount,
            &volume,
            Some(&net),
            &settings,
            &FakeLocator(vec!["fusermount", "udevil"]),
        )
        .unwrap();
        assert_eq!(resolved.command, "/usr/bin/fusermount -u /home/me/remote");
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let tmp = TempDir::new().unwrap();
        let settings = settings_with(
            vec![rule("a", "label=ST*", "", "mount -t %t -o %o %v # %l %i")],
            tmp.path(),
        );
        let volume = stick(Some("STICK"));
        let run = || {
            resolve(
                HandlerMode::Filesystem,
                HandlerAction::Mount,
                &volume,
                None,
                &settings,
                &FakeLocator(vec!["udevil"]),
            )
            .unwrap()
        };
        assert_eq!(run(), run());
        assert_eq!(
            run().command,
            "mount -t vfat -o noexec,nosuid,noatime,utf8 /dev/sdb1 # STICK /dev/disk/by-uuid/1234-ABCD"
        );
    }

    #[test]
    fn test_substituted_values_not_reexpanded() {
        let tmp = TempDir::new().unwrap();
        let settings = settings_with(vec![rule("any", "*", "", "echo %l 100%%")], tmp.path());

        let resolved = resolve(
            HandlerMode::Filesystem,
            HandlerAction::Mount,
            &stick(Some("odd%v")),
            None,
            &settings,
            &FakeLocator(vec![]),
        )
        .unwrap();
        assert_eq!(resolved.command, "echo 'odd%v' 100%");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/dev/sdb1"), "/dev/sdb1");
        assert_eq!(shell_quote("My Disk"), "'My Disk'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_rule_deserializes_with_defaults() {
        let rule: HandlerRule = serde_json::from_str(
            r#"{ "id": "udevil", "whitelist": "+removable=1 *", "mount": "udevil mount %v" }"#,
        )
        .unwrap();
        assert!(rule.enabled);
        assert!(rule.blacklist.is_empty());
        assert_eq!(rule.template(HandlerAction::Mount), Some(("udevil mount %v", false)));
        assert_eq!(rule.template(HandlerAction::Unmount), None);
    }
}
