//! Production stack bound to the project's lwIP shared object.
//!
//! The object is the stack package's lwIP build plus a small C export shim
//! for the pieces that are macros or config-dependent field reads in the
//! headers: `shim_netif_add` (allocates and wires the interface the way a
//! tap driver's init would), `shim_netif_input`, `shim_tcp_accepted`,
//! `shim_tcp_state` and `shim_tcp_sndbuf`. Everything else resolves by its
//! standard lwIP symbol name.
//!
//! lwIP's raw API is single-threaded; the event loop is the only caller
//! once the interface is up.

use std::ffi::c_void;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use libloading::Library;
use thiserror::Error;
use tracing::info;

use super::{
    AcceptCallback, ConnectedCallback, ErrCallback, ErrT, LinkOutputCallback, NetifConfig,
    NetifHandle, Pbuf, Pcb, PollCallback, RecvCallback, SentCallback, Stack, TcpState,
};

/// pbuf_alloc layer argument: raw link-level bytes.
const PBUF_RAW: i32 = 3;
/// pbuf_alloc type argument: pool-backed chain.
const PBUF_POOL: i32 = 3;
/// tcp_write flag: the stack copies the data.
const TCP_WRITE_FLAG_COPY: u8 = 0x01;
/// Backlog passed to tcp_listen_with_backlog.
const TCP_DEFAULT_LISTEN_BACKLOG: u8 = 0xff;

/// Error loading the stack object or resolving its symbols.
#[derive(Debug, Error)]
pub enum StackLoadError {
    #[error("failed to load stack object {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("missing stack symbol {name}: {source}")]
    Symbol {
        name: &'static str,
        #[source]
        source: libloading::Error,
    },
}

type LwipInitFn = unsafe extern "C" fn();
type ShimNetifAddFn = unsafe extern "C" fn(
    addr: u32,
    netmask: u32,
    gw: u32,
    mac: *const u8,
    mtu: u16,
    link_output: LinkOutputCallback,
    arg: *mut c_void,
) -> *mut c_void;
type NetifFn = unsafe extern "C" fn(netif: *mut c_void);
type ShimNetifInputFn = unsafe extern "C" fn(p: *mut Pbuf, netif: *mut c_void) -> ErrT;
type PbufAllocFn = unsafe extern "C" fn(layer: i32, len: u16, kind: i32) -> *mut Pbuf;
type PbufFreeFn = unsafe extern "C" fn(p: *mut Pbuf) -> u8;
type TcpNewFn = unsafe extern "C" fn() -> *mut c_void;
type TcpBindFn = unsafe extern "C" fn(pcb: *mut c_void, addr: *const u32, port: u16) -> ErrT;
type TcpListenFn = unsafe extern "C" fn(pcb: *mut c_void, backlog: u8) -> *mut c_void;
type TcpAcceptFn = unsafe extern "C" fn(pcb: *mut c_void, cb: AcceptCallback);
type TcpRecvFn = unsafe extern "C" fn(pcb: *mut c_void, cb: RecvCallback);
type TcpSentFn = unsafe extern "C" fn(pcb: *mut c_void, cb: SentCallback);
type TcpErrFn = unsafe extern "C" fn(pcb: *mut c_void, cb: Option<ErrCallback>);
type TcpPollFn = unsafe extern "C" fn(pcb: *mut c_void, cb: PollCallback, interval: u8);
type TcpArgFn = unsafe extern "C" fn(pcb: *mut c_void, arg: *mut c_void);
type TcpConnectFn = unsafe extern "C" fn(
    pcb: *mut c_void,
    addr: *const u32,
    port: u16,
    cb: ConnectedCallback,
) -> ErrT;
type TcpWriteFn =
    unsafe extern "C" fn(pcb: *mut c_void, data: *const c_void, len: u16, flags: u8) -> ErrT;
type TcpRecvedFn = unsafe extern "C" fn(pcb: *mut c_void, len: u16);
type TcpSimpleFn = unsafe extern "C" fn(pcb: *mut c_void);
type TcpCloseFn = unsafe extern "C" fn(pcb: *mut c_void) -> ErrT;
type TcpStateFn = unsafe extern "C" fn(pcb: *mut c_void) -> i32;
type TcpSndbufFn = unsafe extern "C" fn(pcb: *mut c_void) -> u16;
type TimerFn = unsafe extern "C" fn();

struct Symbols {
    lwip_init: LwipInitFn,
    shim_netif_add: ShimNetifAddFn,
    netif_remove: NetifFn,
    netif_set_default: NetifFn,
    netif_set_up: NetifFn,
    netif_set_down: NetifFn,
    shim_netif_input: ShimNetifInputFn,
    pbuf_alloc: PbufAllocFn,
    pbuf_free: PbufFreeFn,
    tcp_new: TcpNewFn,
    tcp_bind: TcpBindFn,
    tcp_listen_with_backlog: TcpListenFn,
    tcp_accept: TcpAcceptFn,
    tcp_recv: TcpRecvFn,
    tcp_sent: TcpSentFn,
    tcp_err: TcpErrFn,
    tcp_poll: TcpPollFn,
    tcp_arg: TcpArgFn,
    tcp_connect: TcpConnectFn,
    tcp_write: TcpWriteFn,
    tcp_recved: TcpRecvedFn,
    shim_tcp_accepted: TcpSimpleFn,
    tcp_close: TcpCloseFn,
    shim_tcp_state: TcpStateFn,
    shim_tcp_sndbuf: TcpSndbufFn,
    tcp_tmr: TimerFn,
    etharp_tmr: TimerFn,
}

/// Stack adapter over a dynamically loaded lwIP object.
pub struct LwipStack {
    syms: Symbols,
    /// Keeps the resolved symbols valid.
    _lib: Library,
}

unsafe fn resolve<T: Copy>(lib: &Library, name: &'static str) -> Result<T, StackLoadError> {
    lib.get::<T>(name.as_bytes())
        .map(|sym| *sym)
        .map_err(|source| StackLoadError::Symbol { name, source })
}

impl LwipStack {
    /// Load the stack object at `path` and resolve its symbol table.
    pub fn load(path: &Path) -> Result<LwipStack, StackLoadError> {
        let lib = unsafe { Library::new(path) }.map_err(|source| StackLoadError::Load {
            path: path.to_path_buf(),
            source,
        })?;

        let syms = unsafe {
            Symbols {
                lwip_init: resolve(&lib, "lwip_init")?,
                shim_netif_add: resolve(&lib, "shim_netif_add")?,
                netif_remove: resolve(&lib, "netif_remove")?,
                netif_set_default: resolve(&lib, "netif_set_default")?,
                netif_set_up: resolve(&lib, "netif_set_up")?,
                netif_set_down: resolve(&lib, "netif_set_down")?,
                shim_netif_input: resolve(&lib, "shim_netif_input")?,
                pbuf_alloc: resolve(&lib, "pbuf_alloc")?,
                pbuf_free: resolve(&lib, "pbuf_free")?,
                tcp_new: resolve(&lib, "tcp_new")?,
                tcp_bind: resolve(&lib, "tcp_bind")?,
                tcp_listen_with_backlog: resolve(&lib, "tcp_listen_with_backlog")?,
                tcp_accept: resolve(&lib, "tcp_accept")?,
                tcp_recv: resolve(&lib, "tcp_recv")?,
                tcp_sent: resolve(&lib, "tcp_sent")?,
                tcp_err: resolve(&lib, "tcp_err")?,
                tcp_poll: resolve(&lib, "tcp_poll")?,
                tcp_arg: resolve(&lib, "tcp_arg")?,
                tcp_connect: resolve(&lib, "tcp_connect")?,
                tcp_write: resolve(&lib, "tcp_write")?,
                tcp_recved: resolve(&lib, "tcp_recved")?,
                shim_tcp_accepted: resolve(&lib, "shim_tcp_accepted")?,
                tcp_close: resolve(&lib, "tcp_close")?,
                shim_tcp_state: resolve(&lib, "shim_tcp_state")?,
                shim_tcp_sndbuf: resolve(&lib, "shim_tcp_sndbuf")?,
                tcp_tmr: resolve(&lib, "tcp_tmr")?,
                etharp_tmr: resolve(&lib, "etharp_tmr")?,
            }
        };

        info!(path = %path.display(), "stack object loaded");
        Ok(LwipStack { syms, _lib: lib })
    }
}

/// IPv4 address as the stack stores it: a network-order word.
fn ip_word(addr: Ipv4Addr) -> u32 {
    u32::from(addr).to_be()
}

impl Stack for LwipStack {
    fn init(&self) {
        unsafe { (self.syms.lwip_init)() }
    }

    fn netif_add(
        &self,
        cfg: &NetifConfig,
        link_output: LinkOutputCallback,
        arg: *mut c_void,
    ) -> NetifHandle {
        let mac = cfg.mac.octets();
        let netif = unsafe {
            (self.syms.shim_netif_add)(
                ip_word(cfg.addr),
                ip_word(cfg.netmask),
                ip_word(cfg.gateway),
                mac.as_ptr(),
                cfg.mtu,
                link_output,
                arg,
            )
        };
        NetifHandle(netif)
    }

    fn netif_remove(&self, netif: NetifHandle) {
        unsafe { (self.syms.netif_remove)(netif.0) }
    }

    fn netif_set_default(&self, netif: NetifHandle) {
        unsafe { (self.syms.netif_set_default)(netif.0) }
    }

    fn netif_set_up(&self, netif: NetifHandle) {
        unsafe { (self.syms.netif_set_up)(netif.0) }
    }

    fn netif_set_down(&self, netif: NetifHandle) {
        unsafe { (self.syms.netif_set_down)(netif.0) }
    }

    fn netif_input(&self, p: *mut Pbuf, netif: NetifHandle) -> ErrT {
        unsafe { (self.syms.shim_netif_input)(p, netif.0) }
    }

    fn pbuf_alloc(&self, len: u16) -> *mut Pbuf {
        unsafe { (self.syms.pbuf_alloc)(PBUF_RAW, len, PBUF_POOL) }
    }

    fn pbuf_free(&self, p: *mut Pbuf) {
        unsafe {
            (self.syms.pbuf_free)(p);
        }
    }

    fn tcp_new(&self) -> Pcb {
        Pcb(unsafe { (self.syms.tcp_new)() })
    }

    fn tcp_bind(&self, pcb: Pcb, addr: Ipv4Addr, port: u16) -> ErrT {
        let word = ip_word(addr);
        unsafe { (self.syms.tcp_bind)(pcb.0, &word, port) }
    }

    fn tcp_listen(&self, pcb: Pcb) -> Pcb {
        Pcb(unsafe { (self.syms.tcp_listen_with_backlog)(pcb.0, TCP_DEFAULT_LISTEN_BACKLOG) })
    }

    fn tcp_accept(&self, pcb: Pcb, cb: AcceptCallback) {
        unsafe { (self.syms.tcp_accept)(pcb.0, cb) }
    }

    fn tcp_recv(&self, pcb: Pcb, cb: RecvCallback) {
        unsafe { (self.syms.tcp_recv)(pcb.0, cb) }
    }

    fn tcp_sent(&self, pcb: Pcb, cb: SentCallback) {
        unsafe { (self.syms.tcp_sent)(pcb.0, cb) }
    }

    fn tcp_err(&self, pcb: Pcb, cb: Option<ErrCallback>) {
        unsafe { (self.syms.tcp_err)(pcb.0, cb) }
    }

    fn tcp_poll(&self, pcb: Pcb, cb: PollCallback, interval: u8) {
        unsafe { (self.syms.tcp_poll)(pcb.0, cb, interval) }
    }

    fn tcp_arg(&self, pcb: Pcb, arg: *mut c_void) {
        unsafe { (self.syms.tcp_arg)(pcb.0, arg) }
    }

    fn tcp_connect(&self, pcb: Pcb, addr: Ipv4Addr, port: u16, cb: ConnectedCallback) -> ErrT {
        let word = ip_word(addr);
        unsafe { (self.syms.tcp_connect)(pcb.0, &word, port, cb) }
    }

    fn tcp_write(&self, pcb: Pcb, data: &[u8]) -> ErrT {
        unsafe {
            (self.syms.tcp_write)(
                pcb.0,
                data.as_ptr() as *const c_void,
                data.len() as u16,
                TCP_WRITE_FLAG_COPY,
            )
        }
    }

    fn tcp_recved(&self, pcb: Pcb, len: u16) {
        unsafe { (self.syms.tcp_recved)(pcb.0, len) }
    }

    fn tcp_accepted(&self, pcb: Pcb) {
        unsafe { (self.syms.shim_tcp_accepted)(pcb.0) }
    }

    fn tcp_close(&self, pcb: Pcb) -> ErrT {
        unsafe { (self.syms.tcp_close)(pcb.0) }
    }

    fn tcp_state(&self, pcb: Pcb) -> TcpState {
        TcpState::from_raw(unsafe { (self.syms.shim_tcp_state)(pcb.0) })
    }

    fn tcp_sndbuf(&self, pcb: Pcb) -> u16 {
        unsafe { (self.syms.shim_tcp_sndbuf)(pcb.0) }
    }

    fn tcp_tmr(&self) {
        unsafe { (self.syms.tcp_tmr)() }
    }

    fn etharp_tmr(&self) {
        unsafe { (self.syms.etharp_tmr)() }
    }
}
