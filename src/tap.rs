//! The tap: public, cross-thread surface of the shim.
//!
//! One `Tap` exists per joined overlay network. It binds the rendezvous
//! endpoint for interceptors, spawns the event-loop thread, and exposes
//! the overlay-facing operations (`put`, address assignment, multicast
//! scanning). Everything here may be called from overlay threads; the
//! shared state is lock- or atomic-guarded. Apart from the initial
//! interface setup inside `add_ip`, which the address lock serializes, no
//! stack call happens off the loop thread.

use std::collections::VecDeque;
use std::fs;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use crate::arp::ArpCache;
use crate::bridge;
use crate::conn::set_nonblocking;
use crate::error::ShimError;
use crate::event_loop::EventLoop;
use crate::mac::{Mac, MulticastGroup};
use crate::stack::{NetifHandle, Stack};

/// Default interface MTU.
pub const DEFAULT_MTU: u16 = 2800;

/// Frames queued by `put` and not yet fed to the stack; beyond this the
/// overlay is dropping faster than the loop drains.
const INGRESS_QUEUE_MAX: usize = 1024;

/// Overlay frame handler: `(nwid, src, dst, ethertype, vlan_id, payload)`.
pub type FrameHandler = Arc<dyn Fn(u64, Mac, Mac, u16, u32, &[u8]) + Send + Sync>;

/// Rendezvous endpoint path for a network id.
pub fn rendezvous_path(nwid: u64) -> PathBuf {
    PathBuf::from(format!("/tmp/.ztnc_{:016x}", nwid))
}

/// Tap construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct TapConfig {
    pub nwid: u64,
    pub mac: Mac,
    pub mtu: u16,
}

impl TapConfig {
    pub fn new(nwid: u64, mac: Mac) -> TapConfig {
        TapConfig {
            nwid,
            mac,
            mtu: DEFAULT_MTU,
        }
    }

    pub fn with_mtu(mut self, mtu: u16) -> TapConfig {
        self.mtu = mtu;
        self
    }
}

/// An assigned interface address with its prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IpAssignment {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

impl IpAssignment {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> IpAssignment {
        IpAssignment { addr, prefix_len }
    }

    pub fn netmask(&self) -> Ipv4Addr {
        let bits = u32::MAX
            .checked_shl(32 - u32::from(self.prefix_len.min(32)))
            .unwrap_or(0);
        Ipv4Addr::from(bits)
    }
}

/// A frame queued from the overlay toward the stack.
pub(crate) struct IngressFrame {
    pub src: Mac,
    pub dst: Mac,
    pub ethertype: u16,
    pub payload: Vec<u8>,
}

/// Interface state: assigned addresses plus the stack-facing netif. One
/// lock serializes address changes and the netif setup they trigger.
pub(crate) struct NetState {
    pub ips: Vec<IpAssignment>,
    pub netif: Option<NetifHandle>,
    pub configured: Option<IpAssignment>,
}

/// State shared between the event-loop thread and overlay callers.
pub(crate) struct TapShared {
    pub nwid: u64,
    pub mac: Mac,
    pub mtu: u16,
    pub path: PathBuf,
    pub handler: FrameHandler,
    stack: Arc<dyn Stack>,
    enabled: AtomicBool,
    run: AtomicBool,
    pub net: Mutex<NetState>,
    pub arp: Mutex<ArpCache>,
    groups: Mutex<Vec<MulticastGroup>>,
    pub ingress: Mutex<VecDeque<IngressFrame>>,
    wake_tx: OwnedFd,
}

impl TapShared {
    pub(crate) fn new(
        config: TapConfig,
        stack: Arc<dyn Stack>,
        handler: FrameHandler,
        wake_tx: OwnedFd,
    ) -> TapShared {
        TapShared {
            nwid: config.nwid,
            mac: config.mac,
            mtu: config.mtu,
            path: rendezvous_path(config.nwid),
            handler,
            stack,
            enabled: AtomicBool::new(true),
            run: AtomicBool::new(true),
            net: Mutex::new(NetState {
                ips: Vec::new(),
                netif: None,
                configured: None,
            }),
            arp: Mutex::new(ArpCache::new()),
            groups: Mutex::new(Vec::new()),
            ingress: Mutex::new(VecDeque::new()),
            wake_tx,
        }
    }

    pub(crate) fn stack(&self) -> Arc<dyn Stack> {
        Arc::clone(&self.stack)
    }

    pub(crate) fn running(&self) -> bool {
        self.run.load(Ordering::SeqCst)
    }

    pub(crate) fn stop(&self) {
        self.run.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Interrupt the loop's poll.
    pub(crate) fn wake(&self) {
        // A full pipe already guarantees a pending wakeup.
        let _ = crate::conn::write_fd(self.wake_tx.as_raw_fd(), &[1]);
    }

    /// First assigned IPv4 address, the one the interface is programmed
    /// from and the one binds are pinned to.
    pub(crate) fn primary_ip(&self) -> Option<Ipv4Addr> {
        self.net.lock().unwrap().ips.first().map(|a| a.addr)
    }
}

/// A virtual Ethernet interface attached to one overlay network, with the
/// socket shim servicing intercepted clients behind it.
pub struct Tap {
    shared: Arc<TapShared>,
    thread: Option<JoinHandle<()>>,
}

impl Tap {
    /// Bind the rendezvous endpoint for `config.nwid`, initialize the
    /// stack and start the event loop.
    pub fn new(
        config: TapConfig,
        stack: Arc<dyn Stack>,
        handler: FrameHandler,
    ) -> Result<Tap, ShimError> {
        stack.init();

        let path = rendezvous_path(config.nwid);
        // State is ephemeral; a leftover endpoint is from a dead process.
        let _ = fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;

        let (wake_rx, wake_tx) = nix::unistd::pipe()?;
        set_nonblocking(wake_rx.as_raw_fd())?;
        set_nonblocking(wake_tx.as_raw_fd())?;

        let shared = Arc::new(TapShared::new(config, stack, handler, wake_tx));
        let loop_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name(format!("tapshim-{:016x}", config.nwid))
            .spawn(move || {
                let mut el = EventLoop::new(loop_shared, listener, wake_rx);
                el.run();
            })
            .map_err(ShimError::Io)?;

        info!(
            nwid = format_args!("{:016x}", config.nwid),
            path = %shared.path.display(),
            mtu = config.mtu,
            "tap up"
        );
        Ok(Tap {
            shared,
            thread: Some(thread),
        })
    }

    /// The rendezvous endpoint path, which doubles as the device name.
    pub fn device_name(&self) -> String {
        self.shared.path.display().to_string()
    }

    pub fn enabled(&self) -> bool {
        self.shared.is_enabled()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.shared.set_enabled(enabled);
    }

    /// Queue one Ethernet frame from the overlay into the stack. Disabled
    /// taps drop frames without queueing.
    pub fn put(&self, src: Mac, dst: Mac, ethertype: u16, payload: &[u8]) {
        if !self.shared.is_enabled() {
            return;
        }
        {
            let mut q = self.shared.ingress.lock().unwrap();
            if q.len() >= INGRESS_QUEUE_MAX {
                debug!("ingress queue full; dropping frame");
                return;
            }
            q.push_back(IngressFrame {
                src,
                dst,
                ethertype,
                payload: payload.to_vec(),
            });
        }
        self.shared.wake();
    }

    /// Assign an address. The first IPv4 address programs the stack
    /// interface; later additions only update the ARP cache unless they
    /// displace the primary.
    pub fn add_ip(&self, assignment: IpAssignment) -> bool {
        let mut net = self.shared.net.lock().unwrap();
        if net.ips.contains(&assignment) {
            return false;
        }
        net.ips.push(assignment);
        net.ips.sort();
        net.ips.dedup();

        self.shared
            .arp
            .lock()
            .unwrap()
            .add_local(assignment.addr, self.shared.mac);

        bridge::configure_interface(&self.shared, &mut net);
        true
    }

    /// Unassign an address and retire its ARP entry. The interface keeps
    /// its primary address even when that address is removed (a known
    /// limitation).
    pub fn remove_ip(&self, assignment: IpAssignment) -> bool {
        let mut net = self.shared.net.lock().unwrap();
        let Some(i) = net.ips.iter().position(|a| *a == assignment) else {
            return false;
        };
        net.ips.remove(i);
        drop(net);
        self.shared.arp.lock().unwrap().remove(assignment.addr);
        true
    }

    /// Snapshot of assigned addresses, sorted and deduplicated.
    pub fn ips(&self) -> Vec<IpAssignment> {
        self.shared.net.lock().unwrap().ips.clone()
    }

    /// Whether `ip` still resolves locally.
    pub fn arp_has(&self, ip: Ipv4Addr) -> bool {
        self.shared.arp.lock().unwrap().contains(ip)
    }

    /// Diff the multicast groups implied by the current addresses against
    /// the last scan. Returns `(added, removed)`; with no address changes
    /// in between, a second scan returns two empty lists.
    pub fn scan_multicast_groups(&self) -> (Vec<MulticastGroup>, Vec<MulticastGroup>) {
        let mut new_groups: Vec<MulticastGroup> = self
            .ips()
            .iter()
            .map(|a| MulticastGroup::for_address_resolution(a.addr))
            .collect();
        new_groups.sort();
        new_groups.dedup();

        let mut groups = self.shared.groups.lock().unwrap();
        let added = new_groups
            .iter()
            .filter(|g| groups.binary_search(g).is_err())
            .copied()
            .collect();
        let removed = groups
            .iter()
            .filter(|g| new_groups.binary_search(g).is_err())
            .copied()
            .collect();
        *groups = new_groups;
        (added, removed)
    }

    /// Stop the loop, tear down every client, and release the interface.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shared.stop();
        self.shared.wake();
        if thread.join().is_err() {
            warn!("event loop thread panicked");
        }
        // The loop has exited: the stack is quiescent, safe to release
        // the interface from this thread.
        let mut net = self.shared.net.lock().unwrap();
        if let Some(netif) = net.netif.take() {
            let stack = self.shared.stack();
            stack.netif_set_down(netif);
            stack.netif_remove(netif);
        }
        net.configured = None;
        drop(net);
        let _ = fs::remove_file(&self.shared.path);
        info!(path = %self.shared.path.display(), "tap down");
    }
}

impl Drop for Tap {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}
