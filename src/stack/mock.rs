//! Recording stack mock.
//!
//! Implements [`Stack`] over plain heap state so tests (and development
//! without the real stack object) can drive the shim: every adapter call
//! is recorded, and `fire_*` methods invoke the registered callbacks the
//! way the real stack would.

use std::collections::HashMap;
use std::ffi::c_void;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use super::{
    err, AcceptCallback, ConnectedCallback, ErrCallback, ErrT, LinkOutputCallback, NetifConfig,
    NetifHandle, Pbuf, Pcb, PollCallback, RecvCallback, SentCallback, Stack, TcpState,
    TCP_SND_BUF,
};

/// Default segment size for mock pool buffers, so multi-segment chain
/// handling gets exercised.
const DEFAULT_SEG_SIZE: u16 = 512;

#[derive(Default)]
struct PcbState {
    state: TcpState,
    arg: usize,
    accept: Option<AcceptCallback>,
    recv: Option<RecvCallback>,
    sent: Option<SentCallback>,
    err: Option<ErrCallback>,
    poll: Option<PollCallback>,
    connected: Option<ConnectedCallback>,
    bound: Option<(Ipv4Addr, u16)>,
    written: Vec<u8>,
    recved: u32,
    accepted_acks: u32,
    snd_avail: u16,
}

struct NetifState {
    config: NetifConfig,
    link_output: LinkOutputCallback,
    arg: usize,
    up: bool,
    default: bool,
}

struct State {
    next_id: usize,
    pcbs: HashMap<usize, PcbState>,
    last_pcb: usize,
    closed: Vec<usize>,
    netif: Option<NetifState>,
    netif_adds: u32,
    netif_removes: u32,
    inputs: Vec<Vec<u8>>,
    pbufs: HashMap<usize, Box<[u8]>>,
    alloc_attempts: u32,
    tcp_tmr_calls: u32,
    etharp_tmr_calls: u32,
    init_calls: u32,
    fail_tcp_new: bool,
    fail_pbuf_alloc: bool,
    listen_replaces: bool,
    connect_result: ErrT,
    bind_result: ErrT,
    write_result: ErrT,
    default_sndbuf: u16,
    seg_size: u16,
}

/// A [`Stack`] whose behavior tests control.
pub struct MockStack {
    state: Mutex<State>,
}

impl Default for MockStack {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStack {
    pub fn new() -> Self {
        MockStack {
            state: Mutex::new(State {
                next_id: 1,
                pcbs: HashMap::new(),
                last_pcb: 0,
                closed: Vec::new(),
                netif: None,
                netif_adds: 0,
                netif_removes: 0,
                inputs: Vec::new(),
                pbufs: HashMap::new(),
                alloc_attempts: 0,
                tcp_tmr_calls: 0,
                etharp_tmr_calls: 0,
                init_calls: 0,
                fail_tcp_new: false,
                fail_pbuf_alloc: false,
                listen_replaces: true,
                connect_result: err::OK,
                bind_result: err::OK,
                write_result: err::OK,
                default_sndbuf: TCP_SND_BUF,
                seg_size: DEFAULT_SEG_SIZE,
            }),
        }
    }

    // ---- behavior knobs ----

    pub fn set_fail_tcp_new(&self, fail: bool) {
        self.state.lock().unwrap().fail_tcp_new = fail;
    }

    pub fn set_fail_pbuf_alloc(&self, fail: bool) {
        self.state.lock().unwrap().fail_pbuf_alloc = fail;
    }

    /// Whether tcp_listen hands back a replacement PCB (the default, as
    /// the real stack does) or the same one.
    pub fn set_listen_replaces(&self, replace: bool) {
        self.state.lock().unwrap().listen_replaces = replace;
    }

    pub fn set_connect_result(&self, e: ErrT) {
        self.state.lock().unwrap().connect_result = e;
    }

    pub fn set_bind_result(&self, e: ErrT) {
        self.state.lock().unwrap().bind_result = e;
    }

    pub fn set_write_result(&self, e: ErrT) {
        self.state.lock().unwrap().write_result = e;
    }

    /// Available send buffer reported for every PCB (existing and new).
    pub fn set_sndbuf(&self, avail: u16) {
        let mut s = self.state.lock().unwrap();
        s.default_sndbuf = avail;
        for pcb in s.pcbs.values_mut() {
            pcb.snd_avail = avail;
        }
    }

    pub fn set_seg_size(&self, size: u16) {
        self.state.lock().unwrap().seg_size = size.max(1);
    }

    pub fn set_state(&self, pcb: Pcb, state: TcpState) {
        if let Some(p) = self.state.lock().unwrap().pcbs.get_mut(&key(pcb)) {
            p.state = state;
        }
    }

    // ---- callback firing ----

    /// Deliver an inbound connection on a listening PCB; returns the new
    /// PCB handle (null if no accept callback was installed).
    pub fn fire_accept(&self, listener: Pcb) -> Pcb {
        let (cb, arg, newpcb) = {
            let mut s = self.state.lock().unwrap();
            let (cb, arg) = match s.pcbs.get(&key(listener)) {
                Some(l) => (l.accept, l.arg),
                None => return Pcb::NULL,
            };
            let id = s.mint();
            let default_sndbuf = s.default_sndbuf;
            s.pcbs.insert(
                id,
                PcbState {
                    state: TcpState::Established,
                    snd_avail: default_sndbuf,
                    ..PcbState::default()
                },
            );
            (cb, arg, Pcb(id as *mut c_void))
        };
        match cb {
            Some(cb) => {
                cb(arg as *mut c_void, newpcb, err::OK);
                newpcb
            }
            None => Pcb::NULL,
        }
    }

    /// Deliver received bytes for a PCB as a (possibly multi-segment)
    /// buffer chain.
    pub fn fire_recv(&self, pcb: Pcb, data: &[u8]) {
        let chain = {
            let mut s = self.state.lock().unwrap();
            s.alloc_chain(data.len() as u16)
        };
        unsafe { super::fill_chain(chain, data) };
        let cb = {
            let s = self.state.lock().unwrap();
            s.pcbs.get(&key(pcb)).map(|p| (p.recv, p.arg))
        };
        match cb {
            Some((Some(cb), arg)) => {
                cb(arg as *mut c_void, pcb, chain, err::OK);
            }
            _ => self.pbuf_free(chain),
        }
    }

    /// Deliver the remote-close signal: a null chain.
    pub fn fire_remote_close(&self, pcb: Pcb) {
        let cb = {
            let s = self.state.lock().unwrap();
            s.pcbs.get(&key(pcb)).map(|p| (p.recv, p.arg))
        };
        if let Some((Some(cb), arg)) = cb {
            cb(arg as *mut c_void, pcb, std::ptr::null_mut(), err::OK);
        }
    }

    pub fn fire_connected(&self, pcb: Pcb, e: ErrT) {
        let cb = {
            let mut s = self.state.lock().unwrap();
            match s.pcbs.get_mut(&key(pcb)) {
                Some(p) => {
                    if e == err::OK {
                        p.state = TcpState::Established;
                    }
                    Some((p.connected, p.arg))
                }
                None => None,
            }
        };
        if let Some((Some(cb), arg)) = cb {
            cb(arg as *mut c_void, pcb, e);
        }
    }

    /// Invalidate a PCB the way a reset or fatal error does: the PCB is
    /// freed by the stack before the error callback runs.
    pub fn fire_err(&self, pcb: Pcb, e: ErrT) {
        let cb = {
            let mut s = self.state.lock().unwrap();
            s.pcbs.remove(&key(pcb)).map(|p| (p.err, p.arg))
        };
        if let Some((Some(cb), arg)) = cb {
            cb(arg as *mut c_void, e);
        }
    }

    pub fn fire_poll(&self, pcb: Pcb) {
        let cb = {
            let s = self.state.lock().unwrap();
            s.pcbs.get(&key(pcb)).map(|p| (p.poll, p.arg))
        };
        if let Some((Some(cb), arg)) = cb {
            cb(arg as *mut c_void, pcb);
        }
    }

    /// Acknowledge `n` sent bytes, restoring send buffer space.
    /// Acknowledge `n` sent bytes, restoring send buffer space and
    /// invoking the sent callback.
    pub fn ack(&self, pcb: Pcb, n: u16) {
        let cb = {
            let mut s = self.state.lock().unwrap();
            match s.pcbs.get_mut(&key(pcb)) {
                Some(p) => {
                    p.snd_avail = p.snd_avail.saturating_add(n).min(TCP_SND_BUF);
                    Some((p.sent, p.arg))
                }
                None => None,
            }
        };
        if let Some((Some(cb), arg)) = cb {
            cb(arg as *mut c_void, pcb, n);
        }
    }

    // ---- inspection ----

    pub fn init_count(&self) -> u32 {
        self.state.lock().unwrap().init_calls
    }

    pub fn last_pcb(&self) -> Pcb {
        Pcb(self.state.lock().unwrap().last_pcb as *mut c_void)
    }

    pub fn written(&self, pcb: Pcb) -> Vec<u8> {
        self.state
            .lock()
            .unwrap()
            .pcbs
            .get(&key(pcb))
            .map(|p| p.written.clone())
            .unwrap_or_default()
    }

    pub fn recved(&self, pcb: Pcb) -> u32 {
        self.state
            .lock()
            .unwrap()
            .pcbs
            .get(&key(pcb))
            .map(|p| p.recved)
            .unwrap_or(0)
    }

    pub fn accepted_count(&self, pcb: Pcb) -> u32 {
        self.state
            .lock()
            .unwrap()
            .pcbs
            .get(&key(pcb))
            .map(|p| p.accepted_acks)
            .unwrap_or(0)
    }

    pub fn bound(&self, pcb: Pcb) -> Option<(Ipv4Addr, u16)> {
        self.state.lock().unwrap().pcbs.get(&key(pcb)).and_then(|p| p.bound)
    }

    pub fn state_of(&self, pcb: Pcb) -> TcpState {
        self.tcp_state(pcb)
    }

    pub fn was_closed(&self, pcb: Pcb) -> bool {
        self.state.lock().unwrap().closed.contains(&key(pcb))
    }

    pub fn is_live(&self, pcb: Pcb) -> bool {
        self.state.lock().unwrap().pcbs.contains_key(&key(pcb))
    }

    /// Frames delivered to the interface input, flattened.
    pub fn inputs(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().inputs.clone()
    }

    pub fn alloc_attempts(&self) -> u32 {
        self.state.lock().unwrap().alloc_attempts
    }

    /// Buffer chains allocated and not yet freed.
    pub fn live_pbufs(&self) -> usize {
        self.state.lock().unwrap().pbufs.len()
    }

    pub fn tcp_tmr_count(&self) -> u32 {
        self.state.lock().unwrap().tcp_tmr_calls
    }

    pub fn etharp_tmr_count(&self) -> u32 {
        self.state.lock().unwrap().etharp_tmr_calls
    }

    pub fn netif_config(&self) -> Option<NetifConfig> {
        self.state.lock().unwrap().netif.as_ref().map(|n| n.config)
    }

    pub fn netif_up(&self) -> bool {
        self.state.lock().unwrap().netif.as_ref().map(|n| n.up).unwrap_or(false)
    }

    pub fn netif_is_default(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .netif
            .as_ref()
            .map(|n| n.default)
            .unwrap_or(false)
    }

    /// The link-output callback and argument registered with the
    /// interface, for firing egress the way the stack would.
    pub fn netif_link_output(&self) -> Option<(LinkOutputCallback, usize)> {
        self.state
            .lock()
            .unwrap()
            .netif
            .as_ref()
            .map(|n| (n.link_output, n.arg))
    }

    pub fn netif_adds(&self) -> u32 {
        self.state.lock().unwrap().netif_adds
    }

    pub fn netif_removes(&self) -> u32 {
        self.state.lock().unwrap().netif_removes
    }
}

fn key(pcb: Pcb) -> usize {
    pcb.0 as usize
}

impl State {
    fn mint(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        self.last_pcb = id;
        id
    }

    /// Build a chain of `seg_size` segments holding `len` bytes.
    fn alloc_chain(&mut self, len: u16) -> *mut Pbuf {
        let seg = self.seg_size;
        let mut head: *mut Pbuf = std::ptr::null_mut();
        let mut remaining = len;
        let mut sizes = Vec::new();
        while remaining > 0 {
            let n = remaining.min(seg);
            sizes.push(n);
            remaining -= n;
        }
        if sizes.is_empty() {
            sizes.push(0);
        }
        let mut tot = 0u16;
        for &n in sizes.iter().rev() {
            let mut payload = vec![0u8; n as usize].into_boxed_slice();
            tot += n;
            let hdr = Box::into_raw(Box::new(Pbuf {
                next: head,
                payload: payload.as_mut_ptr() as *mut c_void,
                tot_len: tot,
                len: n,
                kind: 0,
                flags: 0,
                refcount: 1,
            }));
            self.pbufs.insert(hdr as usize, payload);
            head = hdr;
        }
        head
    }

    fn free_chain(&mut self, p: *mut Pbuf) {
        let mut q = p;
        while !q.is_null() {
            let next = unsafe { (*q).next };
            if self.pbufs.remove(&(q as usize)).is_some() {
                drop(unsafe { Box::from_raw(q) });
            }
            q = next;
        }
    }
}

impl Stack for MockStack {
    fn init(&self) {
        self.state.lock().unwrap().init_calls += 1;
    }

    fn netif_add(
        &self,
        cfg: &NetifConfig,
        link_output: LinkOutputCallback,
        arg: *mut c_void,
    ) -> NetifHandle {
        let mut s = self.state.lock().unwrap();
        let id = s.mint();
        s.netif = Some(NetifState {
            config: *cfg,
            link_output,
            arg: arg as usize,
            up: false,
            default: false,
        });
        s.netif_adds += 1;
        NetifHandle(id as *mut c_void)
    }

    fn netif_remove(&self, _netif: NetifHandle) {
        let mut s = self.state.lock().unwrap();
        s.netif = None;
        s.netif_removes += 1;
    }

    fn netif_set_default(&self, _netif: NetifHandle) {
        if let Some(n) = self.state.lock().unwrap().netif.as_mut() {
            n.default = true;
        }
    }

    fn netif_set_up(&self, _netif: NetifHandle) {
        if let Some(n) = self.state.lock().unwrap().netif.as_mut() {
            n.up = true;
        }
    }

    fn netif_set_down(&self, _netif: NetifHandle) {
        if let Some(n) = self.state.lock().unwrap().netif.as_mut() {
            n.up = false;
        }
    }

    fn netif_input(&self, p: *mut Pbuf, _netif: NetifHandle) -> ErrT {
        let frame = unsafe { super::flatten_chain(p) };
        let mut s = self.state.lock().unwrap();
        s.inputs.push(frame);
        // Like the real input path, the stack takes ownership.
        s.free_chain(p);
        err::OK
    }

    fn pbuf_alloc(&self, len: u16) -> *mut Pbuf {
        let mut s = self.state.lock().unwrap();
        s.alloc_attempts += 1;
        if s.fail_pbuf_alloc {
            return std::ptr::null_mut();
        }
        s.alloc_chain(len)
    }

    fn pbuf_free(&self, p: *mut Pbuf) {
        self.state.lock().unwrap().free_chain(p);
    }

    fn tcp_new(&self) -> Pcb {
        let mut s = self.state.lock().unwrap();
        if s.fail_tcp_new {
            return Pcb::NULL;
        }
        let id = s.mint();
        let sndbuf = s.default_sndbuf;
        s.pcbs.insert(
            id,
            PcbState {
                snd_avail: sndbuf,
                ..PcbState::default()
            },
        );
        Pcb(id as *mut c_void)
    }

    fn tcp_bind(&self, pcb: Pcb, addr: Ipv4Addr, port: u16) -> ErrT {
        let mut s = self.state.lock().unwrap();
        if s.bind_result != err::OK {
            return s.bind_result;
        }
        match s.pcbs.get_mut(&key(pcb)) {
            Some(p) => {
                p.bound = Some((addr, port));
                err::OK
            }
            None => err::ARG,
        }
    }

    fn tcp_listen(&self, pcb: Pcb) -> Pcb {
        let mut s = self.state.lock().unwrap();
        if !s.listen_replaces {
            match s.pcbs.get_mut(&key(pcb)) {
                Some(p) => {
                    p.state = TcpState::Listen;
                    return pcb;
                }
                None => return Pcb::NULL,
            }
        }
        // The real stack moves the PCB to a smaller listen PCB and frees
        // the original.
        let Some(mut old) = s.pcbs.remove(&key(pcb)) else {
            return Pcb::NULL;
        };
        old.state = TcpState::Listen;
        let id = s.mint();
        s.pcbs.insert(id, old);
        Pcb(id as *mut c_void)
    }

    fn tcp_accept(&self, pcb: Pcb, cb: AcceptCallback) {
        if let Some(p) = self.state.lock().unwrap().pcbs.get_mut(&key(pcb)) {
            p.accept = Some(cb);
        }
    }

    fn tcp_recv(&self, pcb: Pcb, cb: RecvCallback) {
        if let Some(p) = self.state.lock().unwrap().pcbs.get_mut(&key(pcb)) {
            p.recv = Some(cb);
        }
    }

    fn tcp_sent(&self, pcb: Pcb, cb: SentCallback) {
        if let Some(p) = self.state.lock().unwrap().pcbs.get_mut(&key(pcb)) {
            p.sent = Some(cb);
        }
    }

    fn tcp_err(&self, pcb: Pcb, cb: Option<ErrCallback>) {
        if let Some(p) = self.state.lock().unwrap().pcbs.get_mut(&key(pcb)) {
            p.err = cb;
        }
    }

    fn tcp_poll(&self, pcb: Pcb, cb: PollCallback, _interval: u8) {
        if let Some(p) = self.state.lock().unwrap().pcbs.get_mut(&key(pcb)) {
            p.poll = Some(cb);
        }
    }

    fn tcp_arg(&self, pcb: Pcb, arg: *mut c_void) {
        if let Some(p) = self.state.lock().unwrap().pcbs.get_mut(&key(pcb)) {
            p.arg = arg as usize;
        }
    }

    fn tcp_connect(&self, pcb: Pcb, addr: Ipv4Addr, port: u16, cb: ConnectedCallback) -> ErrT {
        let mut s = self.state.lock().unwrap();
        let result = s.connect_result;
        match s.pcbs.get_mut(&key(pcb)) {
            Some(p) => {
                p.connected = Some(cb);
                if result == err::OK {
                    p.state = TcpState::SynSent;
                    p.bound = p.bound.or(Some((addr, port)));
                }
                result
            }
            None => err::ARG,
        }
    }

    fn tcp_write(&self, pcb: Pcb, data: &[u8]) -> ErrT {
        let mut s = self.state.lock().unwrap();
        if s.write_result != err::OK {
            return s.write_result;
        }
        match s.pcbs.get_mut(&key(pcb)) {
            Some(p) => {
                if data.len() > p.snd_avail as usize {
                    return err::MEM;
                }
                p.written.extend_from_slice(data);
                p.snd_avail -= data.len() as u16;
                err::OK
            }
            None => err::ARG,
        }
    }

    fn tcp_recved(&self, pcb: Pcb, len: u16) {
        if let Some(p) = self.state.lock().unwrap().pcbs.get_mut(&key(pcb)) {
            p.recved += u32::from(len);
        }
    }

    fn tcp_accepted(&self, pcb: Pcb) {
        if let Some(p) = self.state.lock().unwrap().pcbs.get_mut(&key(pcb)) {
            p.accepted_acks += 1;
        }
    }

    fn tcp_close(&self, pcb: Pcb) -> ErrT {
        let mut s = self.state.lock().unwrap();
        match s.pcbs.remove(&key(pcb)) {
            Some(_) => {
                s.closed.push(key(pcb));
                err::OK
            }
            None => err::ARG,
        }
    }

    fn tcp_state(&self, pcb: Pcb) -> TcpState {
        self.state
            .lock()
            .unwrap()
            .pcbs
            .get(&key(pcb))
            .map(|p| p.state)
            .unwrap_or(TcpState::Closed)
    }

    fn tcp_sndbuf(&self, pcb: Pcb) -> u16 {
        self.state
            .lock()
            .unwrap()
            .pcbs
            .get(&key(pcb))
            .map(|p| p.snd_avail)
            .unwrap_or(0)
    }

    fn tcp_tmr(&self) {
        self.state.lock().unwrap().tcp_tmr_calls += 1;
    }

    fn etharp_tmr(&self) {
        self.state.lock().unwrap().etharp_tmr_calls += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_allocation_and_flatten() {
        let stack = MockStack::new();
        stack.set_seg_size(4);
        let p = stack.pbuf_alloc(10);
        assert!(!p.is_null());
        unsafe {
            super::super::fill_chain(p, b"0123456789");
            assert_eq!(super::super::flatten_chain(p), b"0123456789");
            assert_eq!((*p).tot_len, 10);
            assert_eq!((*p).len, 4);
        }
        assert_eq!(stack.live_pbufs(), 3);
        stack.pbuf_free(p);
        assert_eq!(stack.live_pbufs(), 0);
    }

    #[test]
    fn test_write_accounting() {
        let stack = MockStack::new();
        let pcb = stack.tcp_new();
        stack.set_sndbuf(8);
        assert_eq!(stack.tcp_write(pcb, b"abcde"), err::OK);
        assert_eq!(stack.tcp_sndbuf(pcb), 3);
        stack.ack(pcb, 5);
        assert_eq!(stack.tcp_sndbuf(pcb), 8);
        assert_eq!(stack.written(pcb), b"abcde");
    }

    #[test]
    fn test_listen_replacement() {
        let stack = MockStack::new();
        let pcb = stack.tcp_new();
        let listener = stack.tcp_listen(pcb);
        assert_ne!(listener, pcb);
        assert!(!stack.is_live(pcb));
        assert_eq!(stack.state_of(listener), TcpState::Listen);
    }
}
