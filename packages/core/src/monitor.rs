//! Event sources: the device-manager netlink socket and the mount table.
//!
//! A [`Monitor`] polls both descriptors on the calling thread and feeds what
//! it sees into a [`VolumeRegistry`]. Device records arrive on the udev
//! netlink group (libudev framing) or, as a fallback, in the kernel's plain
//! `ACTION@DEVPATH` framing. The mount table signals a change with
//! `POLLPRI`/`POLLERR`.

use std::collections::BTreeMap;
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::socket::{
    AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType, bind, recv, socket,
};
use snafu::ResultExt;
use tracing::{debug, warn};

use crate::device::{DeviceAction, DeviceRecord};
use crate::error::{IoResultExt, NetlinkSnafu, PollSnafu, Result};
use crate::registry::VolumeRegistry;

/// Netlink multicast group udev re-broadcasts processed events on.
const UDEV_GROUP: u32 = 2;

/// Prefix of a libudev-framed netlink message.
const LIBUDEV_PREFIX: &[u8] = b"libudev\0";

/// Size of the fixed libudev header.
const LIBUDEV_HEADER_LEN: usize = 40;

const RECV_BUFFER_LEN: usize = 16 * 1024;

/// Poll timeout used by [`Monitor::run`] between stop checks.
const RUN_POLL_MS: u16 = 500;

/// Something the monitor observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    Device(DeviceRecord),
    MountTableChanged,
}

/// Parses one netlink uevent message.
///
/// Returns `None` for malformed messages and for devices outside the
/// `block` subsystem.
pub fn parse_uevent(buf: &[u8]) -> Option<DeviceRecord> {
    let properties = if buf.starts_with(LIBUDEV_PREFIX) {
        if buf.len() < LIBUDEV_HEADER_LEN {
            return None;
        }
        let read_u32 = |at: usize| -> Option<usize> {
            let bytes: [u8; 4] = buf.get(at..at + 4)?.try_into().ok()?;
            Some(u32::from_ne_bytes(bytes) as usize)
        };
        let offset = read_u32(16)?;
        let len = read_u32(20)?;
        buf.get(offset..offset.checked_add(len)?)?
    } else {
        // ACTION@DEVPATH header, then KEY=VALUE entries
        let header_end = buf.iter().position(|&b| b == 0)?;
        if !buf[..header_end].contains(&b'@') {
            return None;
        }
        &buf[header_end + 1..]
    };

    let properties: BTreeMap<String, String> = properties
        .split(|&b| b == 0)
        .filter_map(|entry| std::str::from_utf8(entry).ok())
        .filter_map(|entry| entry.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    if properties.get("SUBSYSTEM").map(String::as_str) != Some("block") {
        return None;
    }
    let record = DeviceRecord::from_properties(properties);
    (!record.devpath.is_empty()).then_some(record)
}

/// Watches device hotplug and mount table changes.
#[derive(Debug)]
pub struct Monitor {
    socket: OwnedFd,
    mountinfo: File,
}

impl Monitor {
    /// Opens the udev netlink socket and the mount table at `mountinfo_path`.
    pub fn open(mountinfo_path: &Path) -> Result<Self> {
        let socket = socket(
            AddressFamily::Netlink,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            SockProtocol::NetlinkKObjectUEvent,
        )
        .context(NetlinkSnafu)?;
        bind(socket.as_raw_fd(), &NetlinkAddr::new(0, UDEV_GROUP)).context(NetlinkSnafu)?;

        let mountinfo = File::open(mountinfo_path).mount_table_context(mountinfo_path)?;
        debug!("monitoring uevents and {}", mountinfo_path.display());

        Ok(Self { socket, mountinfo })
    }

    /// Waits for activity and returns what happened. `None` waits forever.
    pub fn wait(&mut self, timeout_ms: Option<u16>) -> Result<Vec<MonitorEvent>> {
        let timeout = timeout_ms.map(PollTimeout::from).unwrap_or(PollTimeout::NONE);
        let mut fds = [
            PollFd::new(self.socket.as_fd(), PollFlags::POLLIN),
            PollFd::new(self.mountinfo.as_fd(), PollFlags::POLLPRI),
        ];

        match poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Vec::new()),
            Err(e) => return Err(e).context(PollSnafu),
        }

        let socket_ready = fds[0]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN));
        let table_changed = fds[1]
            .revents()
            .is_some_and(|r| r.intersects(PollFlags::POLLPRI | PollFlags::POLLERR));

        let mut events = Vec::new();
        if socket_ready {
            events.extend(self.drain_socket()?.into_iter().map(MonitorEvent::Device));
        }
        if table_changed {
            events.push(MonitorEvent::MountTableChanged);
        }
        Ok(events)
    }

    /// Reads every queued message from the nonblocking socket.
    fn drain_socket(&mut self) -> Result<Vec<DeviceRecord>> {
        let mut records = Vec::new();
        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        loop {
            match recv(self.socket.as_raw_fd(), &mut buf, MsgFlags::empty()) {
                Ok(0) => break,
                Ok(len) => match parse_uevent(&buf[..len]) {
                    Some(record) => records.push(record),
                    None => debug!("ignoring uevent of {} bytes", len),
                },
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(Errno::ENOBUFS) => {
                    warn!("uevent receive buffer overrun, events were lost");
                    continue;
                }
                Err(e) => return Err(e).context(NetlinkSnafu),
            }
        }
        Ok(records)
    }

    /// Waits once and dispatches everything observed into `registry`.
    pub fn run_once(&mut self, registry: &mut VolumeRegistry, timeout_ms: Option<u16>) -> Result<()> {
        for event in self.wait(timeout_ms)? {
            dispatch(registry, event);
        }
        Ok(())
    }

    /// Dispatches events until `stop` is set.
    pub fn run(&mut self, registry: &mut VolumeRegistry, stop: &AtomicBool) -> Result<()> {
        while !stop.load(Ordering::Relaxed) {
            self.run_once(registry, Some(RUN_POLL_MS))?;
        }
        Ok(())
    }
}

/// Feeds one event into the registry.
pub fn dispatch(registry: &mut VolumeRegistry, event: MonitorEvent) {
    match event {
        MonitorEvent::Device(record) if record.action == DeviceAction::Remove => {
            registry.device_removed(&record)
        }
        MonitorEvent::Device(record) => registry.device_added(&record),
        MonitorEvent::MountTableChanged => {
            if let Err(e) = registry.mount_table_changed() {
                warn!("failed to process mount table change: {}", e);
            }
        }
    }
}
