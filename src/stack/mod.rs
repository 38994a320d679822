//! Typed adapter over the embedded TCP/IP stack.
//!
//! The stack is an external collaborator with a C ABI; everything the rest
//! of the crate knows about it goes through the [`Stack`] trait. The
//! production implementation ([`lwip::LwipStack`]) binds a dynamically
//! loaded shared object; [`mock::MockStack`] records every call so tests
//! can drive the shim and fire its callbacks by hand.
//!
//! The raw API is not thread safe: all calls except the initial interface
//! setup happen on the event-loop thread.

pub mod lwip;
pub mod mock;

use std::ffi::c_void;
use std::net::Ipv4Addr;

use crate::mac::Mac;

/// Milliseconds between TCP timer ticks.
pub const TCP_TMR_INTERVAL: u64 = 250;

/// Milliseconds between ARP timer ticks.
pub const ARP_TMR_INTERVAL: u64 = 5_000;

/// Per-PCB send buffer size, from the stack build configuration.
pub const TCP_SND_BUF: u16 = u16::MAX;

/// Stack error code (`err_t` in the C ABI: a signed byte).
pub type ErrT = i8;

/// The error codes the shim interprets.
pub mod err {
    use super::ErrT;

    pub const OK: ErrT = 0;
    pub const MEM: ErrT = -1;
    pub const BUF: ErrT = -2;
    pub const TIMEOUT: ErrT = -3;
    pub const RTE: ErrT = -4;
    pub const VAL: ErrT = -6;
    pub const USE: ErrT = -8;
    pub const ABRT: ErrT = -10;
    pub const CONN: ErrT = -13;
    pub const ARG: ErrT = -14;
}

/// TCP PCB states as the stack reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub enum TcpState {
    #[default]
    Closed = 0,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    pub fn from_raw(v: i32) -> TcpState {
        match v {
            1 => TcpState::Listen,
            2 => TcpState::SynSent,
            3 => TcpState::SynRcvd,
            4 => TcpState::Established,
            5 => TcpState::FinWait1,
            6 => TcpState::FinWait2,
            7 => TcpState::CloseWait,
            8 => TcpState::Closing,
            9 => TcpState::LastAck,
            10 => TcpState::TimeWait,
            _ => TcpState::Closed,
        }
    }
}

/// Opaque handle to a protocol control block. The stack owns the memory;
/// holders only ever pass the handle back through the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pcb(pub *mut c_void);

impl Pcb {
    pub const NULL: Pcb = Pcb(std::ptr::null_mut());

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }
}

// Opaque token; never dereferenced outside the stack.
unsafe impl Send for Pcb {}
unsafe impl Sync for Pcb {}

/// Opaque handle to a stack network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct NetifHandle(pub *mut c_void);

// Opaque token; never dereferenced outside the stack.
unsafe impl Send for NetifHandle {}
unsafe impl Sync for NetifHandle {}

/// One segment of a stack buffer chain, mirroring the C layout.
#[repr(C)]
pub struct Pbuf {
    pub next: *mut Pbuf,
    pub payload: *mut c_void,
    /// Bytes in this segment and all following ones.
    pub tot_len: u16,
    /// Bytes in this segment.
    pub len: u16,
    pub kind: u8,
    pub flags: u8,
    pub refcount: u16,
}

/// Parameters for programming the stack-facing network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetifConfig {
    pub addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub mac: Mac,
    pub mtu: u16,
}

pub type AcceptCallback = extern "C" fn(arg: *mut c_void, newpcb: Pcb, err: ErrT) -> ErrT;
pub type RecvCallback = extern "C" fn(arg: *mut c_void, pcb: Pcb, p: *mut Pbuf, err: ErrT) -> ErrT;
pub type SentCallback = extern "C" fn(arg: *mut c_void, pcb: Pcb, len: u16) -> ErrT;
pub type ErrCallback = extern "C" fn(arg: *mut c_void, err: ErrT);
pub type PollCallback = extern "C" fn(arg: *mut c_void, pcb: Pcb) -> ErrT;
pub type ConnectedCallback = extern "C" fn(arg: *mut c_void, pcb: Pcb, err: ErrT) -> ErrT;
pub type LinkOutputCallback = extern "C" fn(arg: *mut c_void, p: *mut Pbuf) -> ErrT;

/// The operations the shim needs from the embedded stack. This trait is
/// the single trust boundary; it also converts between native address
/// representations and the tap's address types.
pub trait Stack: Send + Sync {
    /// One-time stack initialization.
    fn init(&self);

    // Interface management.
    fn netif_add(
        &self,
        cfg: &NetifConfig,
        link_output: LinkOutputCallback,
        arg: *mut c_void,
    ) -> NetifHandle;
    fn netif_remove(&self, netif: NetifHandle);
    fn netif_set_default(&self, netif: NetifHandle);
    fn netif_set_up(&self, netif: NetifHandle);
    fn netif_set_down(&self, netif: NetifHandle);
    /// Feed one link-level frame into the interface input path. Ownership
    /// of the chain passes to the stack on success.
    fn netif_input(&self, p: *mut Pbuf, netif: NetifHandle) -> ErrT;

    // Buffer chains.
    /// Allocate a chain holding `len` bytes, or null when the pool is
    /// exhausted.
    fn pbuf_alloc(&self, len: u16) -> *mut Pbuf;
    fn pbuf_free(&self, p: *mut Pbuf);

    // TCP operations.
    /// New PCB, or null when allocation fails.
    fn tcp_new(&self) -> Pcb;
    fn tcp_bind(&self, pcb: Pcb, addr: Ipv4Addr, port: u16) -> ErrT;
    /// Move `pcb` to the listen state. The stack is free to return a
    /// replacement PCB; null means allocation failure.
    fn tcp_listen(&self, pcb: Pcb) -> Pcb;
    fn tcp_accept(&self, pcb: Pcb, cb: AcceptCallback);
    fn tcp_recv(&self, pcb: Pcb, cb: RecvCallback);
    fn tcp_sent(&self, pcb: Pcb, cb: SentCallback);
    fn tcp_err(&self, pcb: Pcb, cb: Option<ErrCallback>);
    fn tcp_poll(&self, pcb: Pcb, cb: PollCallback, interval: u8);
    fn tcp_arg(&self, pcb: Pcb, arg: *mut c_void);
    fn tcp_connect(&self, pcb: Pcb, addr: Ipv4Addr, port: u16, cb: ConnectedCallback) -> ErrT;
    /// Enqueue bytes for sending, always with the copy flag.
    fn tcp_write(&self, pcb: Pcb, data: &[u8]) -> ErrT;
    /// Inform the stack that `len` received bytes were consumed, opening
    /// the receive window.
    fn tcp_recved(&self, pcb: Pcb, len: u16);
    /// Acknowledge an accepted connection on the listening PCB.
    fn tcp_accepted(&self, pcb: Pcb);
    fn tcp_close(&self, pcb: Pcb) -> ErrT;
    fn tcp_state(&self, pcb: Pcb) -> TcpState;
    /// Available send buffer space.
    fn tcp_sndbuf(&self, pcb: Pcb) -> u16;

    // Periodic timers.
    fn tcp_tmr(&self);
    fn etharp_tmr(&self);
}

pub fn htons(v: u16) -> u16 {
    v.to_be()
}

pub fn ntohs(v: u16) -> u16 {
    u16::from_be(v)
}

pub fn htonl(v: u32) -> u32 {
    v.to_be()
}

pub fn ntohl(v: u32) -> u32 {
    u32::from_be(v)
}

/// Payload of one segment.
///
/// # Safety
///
/// `q` must point to a live pbuf whose payload holds `len` readable bytes,
/// and the slice must not outlive the chain.
pub unsafe fn pbuf_bytes<'a>(q: *const Pbuf) -> &'a [u8] {
    std::slice::from_raw_parts((*q).payload as *const u8, (*q).len as usize)
}

/// Mutable payload of one segment.
///
/// # Safety
///
/// Same as [`pbuf_bytes`], plus exclusive access to the chain.
pub unsafe fn pbuf_bytes_mut<'a>(q: *mut Pbuf) -> &'a mut [u8] {
    std::slice::from_raw_parts_mut((*q).payload as *mut u8, (*q).len as usize)
}

/// Flatten a chain into one contiguous buffer.
///
/// # Safety
///
/// `p` must be a live, well-formed chain.
pub unsafe fn flatten_chain(p: *const Pbuf) -> Vec<u8> {
    let mut out = Vec::with_capacity(if p.is_null() { 0 } else { (*p).tot_len as usize });
    let mut q = p;
    while !q.is_null() {
        out.extend_from_slice(pbuf_bytes(q));
        q = (*q).next;
    }
    out
}

/// Scatter `data` across the chain's segments starting at the head.
///
/// # Safety
///
/// `p` must be a live, well-formed chain with `tot_len >= data.len()` and
/// exclusive access.
pub unsafe fn fill_chain(p: *mut Pbuf, data: &[u8]) {
    let mut q = p;
    let mut off = 0;
    while !q.is_null() && off < data.len() {
        let seg = pbuf_bytes_mut(q);
        let n = seg.len().min(data.len() - off);
        seg[..n].copy_from_slice(&data[off..off + n]);
        off += n;
        q = (*q).next;
    }
}
