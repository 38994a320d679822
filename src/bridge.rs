//! Ethernet bridging between the overlay and the embedded stack.
//!
//! Ingress: frames queued by `put` are wrapped in stack buffer chains,
//! prefixed with a synthesized Ethernet header, and fed to the interface
//! input. Egress: the stack's link-output callback flattens the chain and
//! hands the frame to the overlay handler, byte-exact. This module also
//! programs the stack interface from the primary IPv4 address.

use std::ffi::c_void;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::event_loop::EventLoop;
use crate::mac::Mac;
use crate::stack::{self, err, ErrT, NetifConfig, Pbuf, Stack};
use crate::tap::{NetState, TapShared};

/// Ethernet header: destination, source, ethertype.
pub const ETH_HDR_LEN: usize = 14;

/// Program (or reprogram) the stack interface from the primary address.
/// Caller holds the interface lock, which is what serializes this stack
/// call off the loop thread.
pub(crate) fn configure_interface(shared: &Arc<TapShared>, net: &mut NetState) {
    let Some(&primary) = net.ips.first() else {
        return;
    };
    if net.configured == Some(primary) {
        return;
    }

    let stack = shared.stack();
    if let Some(old) = net.netif.take() {
        stack.netif_set_down(old);
        stack.netif_remove(old);
    }

    let cfg = NetifConfig {
        addr: primary.addr,
        netmask: primary.netmask(),
        gateway: Ipv4Addr::UNSPECIFIED,
        mac: shared.mac,
        mtu: shared.mtu,
    };
    let arg = Arc::as_ptr(shared) as *mut c_void;
    let netif = stack.netif_add(&cfg, link_output, arg);
    stack.netif_set_default(netif);
    stack.netif_set_up(netif);
    net.netif = Some(netif);
    net.configured = Some(primary);
    info!(addr = %primary.addr, netmask = %primary.netmask(), "interface configured");
}

/// Link-output callback registered with the interface: flatten the chain
/// and hand the frame to the overlay, preserving the bytes exactly.
///
/// `arg` is the `TapShared` the interface was registered with; the tap
/// keeps it alive until after the interface is removed.
pub(crate) extern "C" fn link_output(arg: *mut c_void, p: *mut Pbuf) -> ErrT {
    if arg.is_null() || p.is_null() {
        return err::ARG;
    }
    let shared = unsafe { &*(arg as *const TapShared) };
    let frame = unsafe { stack::flatten_chain(p) };
    if frame.len() < ETH_HDR_LEN {
        warn!(len = frame.len(), "runt frame from stack");
        return err::BUF;
    }
    let dst = Mac(frame[0..6].try_into().unwrap_or_default());
    let src = Mac(frame[6..12].try_into().unwrap_or_default());
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    (shared.handler)(
        shared.nwid,
        src,
        dst,
        ethertype,
        0,
        &frame[ETH_HDR_LEN..],
    );
    err::OK
}

impl EventLoop {
    /// Feed queued overlay frames into the stack, one buffer chain each.
    pub(crate) fn pump_ingress(&mut self) {
        loop {
            let frame = self.shared.ingress.lock().unwrap().pop_front();
            let Some(frame) = frame else { break };
            if !self.shared.is_enabled() {
                continue;
            }
            let Some(netif) = self.shared.net.lock().unwrap().netif else {
                debug!("no interface configured; dropping frame");
                continue;
            };

            let total = frame.payload.len() + ETH_HDR_LEN;
            if total > usize::from(u16::MAX) {
                warn!(len = frame.payload.len(), "oversized frame dropped");
                continue;
            }
            trace!(
                src = %frame.src,
                dst = %frame.dst,
                ethertype = frame.ethertype,
                len = frame.payload.len(),
                "frame in"
            );
            let chain = self.stack.pbuf_alloc(total as u16);
            if chain.is_null() {
                // Pool exhausted: the frame is dropped silently, as on a
                // congested wire.
                continue;
            }

            // Header destination is the tap itself; source is whatever
            // the overlay reported.
            let mut bytes = Vec::with_capacity(total);
            bytes.extend_from_slice(&self.shared.mac.octets());
            bytes.extend_from_slice(&frame.src.octets());
            bytes.extend_from_slice(&frame.ethertype.to_be_bytes());
            bytes.extend_from_slice(&frame.payload);
            unsafe { stack::fill_chain(chain, &bytes) };

            let e = self.stack.netif_input(chain, netif);
            if e != err::OK {
                warn!(err = e, "interface input rejected frame");
                self.stack.pbuf_free(chain);
            }
            self.drain_stack_events();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::testutil::rig_with_handler;
    use crate::tap::{IngressFrame, IpAssignment};
    use std::sync::Mutex;

    type Captured = (u64, Mac, Mac, u16, u32, Vec<u8>);

    fn capture_handler() -> (crate::tap::FrameHandler, Arc<Mutex<Vec<Captured>>>) {
        let seen: Arc<Mutex<Vec<Captured>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: crate::tap::FrameHandler =
            Arc::new(move |nwid, src, dst, ethertype, vlan, bytes| {
                sink.lock()
                    .unwrap()
                    .push((nwid, src, dst, ethertype, vlan, bytes.to_vec()));
            });
        (handler, seen)
    }

    fn assign_ip(rig: &mut crate::event_loop::testutil::TestRig) {
        let mut net = rig.shared.net.lock().unwrap();
        net.ips.push(IpAssignment::new("10.9.0.1".parse().unwrap(), 24));
        configure_interface(&rig.shared, &mut net);
    }

    fn queue_frame(rig: &crate::event_loop::testutil::TestRig, payload: &[u8]) {
        rig.shared.ingress.lock().unwrap().push_back(IngressFrame {
            src: Mac([2, 0, 0, 0, 0, 9]),
            dst: Mac([2, 0, 0, 0, 0, 1]),
            ethertype: 0x0800,
            payload: payload.to_vec(),
        });
    }

    #[test]
    fn test_ingress_synthesizes_header() {
        let mut rig = rig_with_handler(Arc::new(|_, _, _, _, _, _| {}));
        assign_ip(&mut rig);
        queue_frame(&rig, b"ip packet bytes");
        rig.el.pump_ingress();

        let inputs = rig.stack.inputs();
        assert_eq!(inputs.len(), 1);
        let frame = &inputs[0];
        // Destination is the tap MAC, source the caller's, then the
        // ethertype in network order, then the payload verbatim.
        assert_eq!(&frame[0..6], &[2, 0, 0, 0, 0, 1]);
        assert_eq!(&frame[6..12], &[2, 0, 0, 0, 0, 9]);
        assert_eq!(&frame[12..14], &0x0800u16.to_be_bytes());
        assert_eq!(&frame[14..], b"ip packet bytes");
        assert_eq!(rig.stack.live_pbufs(), 0);
    }

    #[test]
    fn test_ingress_spans_segments() {
        let mut rig = rig_with_handler(Arc::new(|_, _, _, _, _, _| {}));
        rig.stack.set_seg_size(8);
        assign_ip(&mut rig);
        let payload: Vec<u8> = (0u8..100).collect();
        queue_frame(&rig, &payload);
        rig.el.pump_ingress();

        let inputs = rig.stack.inputs();
        assert_eq!(inputs[0].len(), ETH_HDR_LEN + 100);
        assert_eq!(&inputs[0][ETH_HDR_LEN..], payload.as_slice());
    }

    #[test]
    fn test_disabled_tap_drops_before_allocation() {
        let mut rig = rig_with_handler(Arc::new(|_, _, _, _, _, _| {}));
        assign_ip(&mut rig);
        // Frames queued while enabled, then the tap is disabled before
        // the loop drains them.
        queue_frame(&rig, b"late");
        rig.shared.set_enabled(false);
        rig.el.pump_ingress();
        assert!(rig.stack.inputs().is_empty());
        assert_eq!(rig.stack.alloc_attempts(), 0);
    }

    #[test]
    fn test_alloc_failure_drops_silently() {
        let mut rig = rig_with_handler(Arc::new(|_, _, _, _, _, _| {}));
        assign_ip(&mut rig);
        rig.stack.set_fail_pbuf_alloc(true);
        queue_frame(&rig, b"doomed");
        rig.el.pump_ingress();
        assert!(rig.stack.inputs().is_empty());
        assert_eq!(rig.stack.live_pbufs(), 0);
    }

    #[test]
    fn test_egress_reaches_overlay_handler() {
        let (handler, seen) = capture_handler();
        let mut rig = rig_with_handler(handler);
        assign_ip(&mut rig);

        // Build the frame the stack would emit and fire the registered
        // link-output callback with the registered argument.
        let mut frame = Vec::new();
        frame.extend_from_slice(&[2, 0, 0, 0, 0, 9]); // destination peer
        frame.extend_from_slice(&[2, 0, 0, 0, 0, 1]); // source: the tap
        frame.extend_from_slice(&0x0806u16.to_be_bytes());
        frame.extend_from_slice(b"arp reply bytes");
        let chain = rig.stack.pbuf_alloc(frame.len() as u16);
        unsafe { stack::fill_chain(chain, &frame) };

        let (cb, arg) = rig.stack.netif_link_output().unwrap();
        assert_eq!(cb(arg as *mut c_void, chain), err::OK);
        rig.stack.pbuf_free(chain);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (nwid, src, dst, ethertype, vlan, bytes) = &seen[0];
        assert_eq!(*nwid, rig.shared.nwid);
        assert_eq!(*src, Mac([2, 0, 0, 0, 0, 1]));
        assert_eq!(*dst, Mac([2, 0, 0, 0, 0, 9]));
        assert_eq!(*ethertype, 0x0806);
        assert_eq!(*vlan, 0);
        assert_eq!(bytes.as_slice(), b"arp reply bytes");
    }

    #[test]
    fn test_egress_runt_frame_rejected() {
        let (handler, seen) = capture_handler();
        let mut rig = rig_with_handler(handler);
        assign_ip(&mut rig);
        let chain = rig.stack.pbuf_alloc(4);
        let (cb, arg) = rig.stack.netif_link_output().unwrap();
        assert_ne!(cb(arg as *mut c_void, chain), err::OK);
        rig.stack.pbuf_free(chain);
        assert!(seen.lock().unwrap().is_empty());
    }
}
