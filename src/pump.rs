//! The data pump: bytes between client stream-pairs and the stack.
//!
//! Client→stack: readable buffer sockets fill the per-connection staging
//! buffer, and `handle_write` pushes as much as the stack's send window
//! takes, holding off entirely above a load threshold. Stack→client: the
//! receive path drains buffer chains into the local socket, advancing the
//! TCP window by exactly what was written. The stack's per-PCB poll
//! callback retries staged bytes once congestion clears.

use std::os::fd::RawFd;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::conn::{self, ConnRef, STAGING_BUF_SIZE};
use crate::event_loop::EventLoop;
use crate::stack::{self, err, Pbuf, Pcb, Stack, TCP_SND_BUF};

/// Interval, in stack coarse-timer units, between per-PCB poll callbacks.
pub(crate) const PCB_POLL_INTERVAL: u8 = 1;

/// Send-buffer load factor at or above which staged bytes stay staged.
const SND_BUF_LOAD_LIMIT: f32 = 0.9;

impl EventLoop {
    /// A buffer socket became readable: stage what fits, then push.
    pub(crate) fn on_buffer_readable(&mut self, local_fd: RawFd) {
        let Some(r) = conn::find_by_local_fd(&self.clients, local_fd) else {
            return;
        };
        let read = {
            let Some(c) = self.conn_mut(r) else { return };
            if c.idx >= STAGING_BUF_SIZE {
                return;
            }
            let idx = c.idx;
            conn::read_fd(local_fd, &mut c.buf[idx..])
        };
        match read {
            Ok(0) => {
                // Interceptor closed its end of the pair.
                debug!(fd = local_fd, "buffer endpoint closed");
                self.close_connection(r);
            }
            Ok(n) => {
                if let Some(c) = self.conn_mut(r) {
                    c.idx += n;
                }
                self.handle_write(r);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!(fd = local_fd, error = %e, "buffer read failed");
                self.close_connection(r);
            }
        }
    }

    /// Push staged bytes into the stack's send buffer, respecting the
    /// load threshold, and compact the staging buffer by what was taken.
    /// On a stack write error the bytes stay staged for the next poll
    /// tick.
    pub(crate) fn handle_write(&mut self, r: ConnRef) {
        let stack = Arc::clone(&self.stack);
        let Some(c) = self.conn_mut(r) else {
            debug!("write for unknown connection");
            return;
        };
        let Some(pcb) = c.live_pcb() else { return };

        let snd_buf = stack.tcp_sndbuf(pcb);
        let load = 1.0 - (f32::from(snd_buf) / f32::from(TCP_SND_BUF));
        if load >= SND_BUF_LOAD_LIMIT {
            return;
        }

        let allowance = usize::from(snd_buf).min(c.idx);
        if allowance == 0 {
            debug!("stack send buffer full");
            return;
        }
        let e = stack.tcp_write(pcb, &c.buf[..allowance]);
        if e != err::OK {
            warn!(err = e, staged = c.idx, "stack rejected write");
            return;
        }
        c.buf.copy_within(allowance..c.idx, 0);
        c.idx -= allowance;
    }

    /// Received bytes (or the remote-close signal) for a PCB.
    pub(crate) fn on_stack_recv(&mut self, pcb: Pcb, chain: *mut Pbuf) {
        let stack = Arc::clone(&self.stack);
        let Some(r) = conn::find_by_pcb(&self.clients, pcb) else {
            debug!("received data for unknown connection");
            if !chain.is_null() {
                stack.pbuf_free(chain);
            }
            return;
        };
        if chain.is_null() {
            // Remote close.
            debug!("remote closed connection");
            self.close_connection(r);
            return;
        }

        let Some(c) = self.conn_mut(r) else {
            stack.pbuf_free(chain);
            return;
        };
        let local_fd = c.local_fd();
        let mut q = chain;
        while !q.is_null() {
            let seg = unsafe { stack::pbuf_bytes(q) };
            if seg.is_empty() {
                break;
            }
            match conn::write_fd(local_fd, seg) {
                Ok(0) => warn!(fd = local_fd, "no bytes written to client buffer"),
                Ok(n) => {
                    if n < seg.len() {
                        // Completing short writes is deferred; the
                        // remainder of this segment is dropped.
                        warn!(fd = local_fd, wrote = n, len = seg.len(), "short write to client");
                    }
                    stack.tcp_recved(pcb, n as u16);
                }
                Err(e) => {
                    warn!(fd = local_fd, error = %e, "write to client failed");
                }
            }
            q = unsafe { (*q).next };
        }
        stack.pbuf_free(chain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::testutil::{attach_client, rig, send_request, TestRig};
    use crate::wire::{Request, SocketReq};
    use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
    use std::io::{IoSliceMut, Read, Write};
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::os::unix::net::UnixStream;

    fn recv_fd(stream: &UnixStream) -> OwnedFd {
        let mut carrier = [0u8; 1];
        let mut iov = [IoSliceMut::new(&mut carrier)];
        let mut cmsg = nix::cmsg_space!([RawFd; 1]);
        let msg = recvmsg::<()>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg),
            MsgFlags::empty(),
        )
        .unwrap();
        for c in msg.cmsgs().unwrap() {
            if let ControlMessageOwned::ScmRights(fds) = c {
                return unsafe { OwnedFd::from_raw_fd(fds[0]) };
            }
        }
        panic!("no descriptor in ancillary data");
    }

    /// A mapped buffer connection plus the interceptor's data stream.
    fn buffer_conn(
        rig: &mut TestRig,
    ) -> (UnixStream, RawFd, UnixStream, crate::stack::Pcb, RawFd) {
        let (mut interceptor, rpc_fd) = attach_client(&mut rig.el);
        send_request(
            &mut rig.el,
            rpc_fd,
            &mut interceptor,
            &Request::Socket(SocketReq {
                tid: 7,
                domain: 2,
                socktype: 1,
                protocol: 0,
            }),
        );
        let data = UnixStream::from(recv_fd(&interceptor));
        let pcb = rig.stack.last_pcb();
        send_request(
            &mut rig.el,
            rpc_fd,
            &mut interceptor,
            &Request::FdMapCompletion { their_fd: 42 },
        );
        let local_fd = rig.el.clients.get(&rpc_fd).unwrap().conns[0].local_fd();
        (interceptor, rpc_fd, data, pcb, local_fd)
    }

    fn conn_ref(rig: &TestRig, local_fd: RawFd) -> ConnRef {
        conn::find_by_local_fd(&rig.el.clients, local_fd).unwrap()
    }

    #[test]
    fn test_client_bytes_reach_stack_in_order() {
        let mut rig = rig();
        let (_interceptor, _rpc_fd, mut data, pcb, local_fd) = buffer_conn(&mut rig);

        data.write_all(b"first ").unwrap();
        rig.el.on_buffer_readable(local_fd);
        data.write_all(b"second").unwrap();
        rig.el.on_buffer_readable(local_fd);

        assert_eq!(rig.stack.written(pcb), b"first second");
        let r = conn_ref(&rig, local_fd);
        assert_eq!(rig.el.conn_mut(r).unwrap().idx, 0);
    }

    #[test]
    fn test_backpressure_above_load_limit() {
        let mut rig = rig();
        let (_interceptor, _rpc_fd, mut data, pcb, local_fd) = buffer_conn(&mut rig);
        // 1000 of 65535 available: load ≈ 0.985, above the limit.
        rig.stack.set_sndbuf(1000);

        data.write_all(b"held back").unwrap();
        rig.el.on_buffer_readable(local_fd);

        assert!(rig.stack.written(pcb).is_empty());
        let r = conn_ref(&rig, local_fd);
        assert_eq!(rig.el.conn_mut(r).unwrap().idx, 9);
    }

    #[test]
    fn test_poll_tick_drains_after_congestion() {
        let mut rig = rig();
        let (_interceptor, _rpc_fd, mut data, pcb, local_fd) = buffer_conn(&mut rig);
        rig.stack.set_sndbuf(1000);
        data.write_all(b"held back").unwrap();
        rig.el.on_buffer_readable(local_fd);
        assert!(rig.stack.written(pcb).is_empty());

        // Window reopens; the stack's periodic poll retries the pump.
        rig.stack.set_sndbuf(crate::stack::TCP_SND_BUF);
        rig.stack.fire_poll(pcb);
        rig.el.drain_stack_events();

        assert_eq!(rig.stack.written(pcb), b"held back");
    }

    #[test]
    fn test_partial_window_compacts_staging() {
        let mut rig = rig();
        let (_interceptor, _rpc_fd, _data, pcb, local_fd) = buffer_conn(&mut rig);

        // Stage 8000 bytes by hand, window takes 6600 of them.
        let pattern: Vec<u8> = (0..8000u32).map(|i| (i % 251) as u8).collect();
        let r = conn_ref(&rig, local_fd);
        {
            let c = rig.el.conn_mut(r).unwrap();
            c.buf[..8000].copy_from_slice(&pattern);
            c.idx = 8000;
        }
        rig.stack.set_sndbuf(6600);
        rig.el.handle_write(r);

        assert_eq!(rig.stack.written(pcb), &pattern[..6600]);
        let c = rig.el.conn_mut(r).unwrap();
        assert_eq!(c.idx, 1400);
        assert_eq!(&c.buf[..1400], &pattern[6600..]);
    }

    #[test]
    fn test_stack_write_error_keeps_bytes_staged() {
        let mut rig = rig();
        let (_interceptor, _rpc_fd, mut data, pcb, local_fd) = buffer_conn(&mut rig);
        rig.stack.set_write_result(err::MEM);

        data.write_all(b"sticky").unwrap();
        rig.el.on_buffer_readable(local_fd);

        assert!(rig.stack.written(pcb).is_empty());
        let r = conn_ref(&rig, local_fd);
        assert_eq!(rig.el.conn_mut(r).unwrap().idx, 6);

        // Error clears; the next poll tick delivers the staged bytes.
        rig.stack.set_write_result(err::OK);
        rig.stack.fire_poll(pcb);
        rig.el.drain_stack_events();
        assert_eq!(rig.stack.written(pcb), b"sticky");
    }

    #[test]
    fn test_stack_recv_reaches_client_and_opens_window() {
        let mut rig = rig();
        rig.stack.set_seg_size(8);
        let (_interceptor, _rpc_fd, mut data, pcb, _local_fd) = buffer_conn(&mut rig);

        rig.stack.fire_recv(pcb, b"forwarded to the interceptor");
        rig.el.drain_stack_events();

        let mut buf = [0u8; 28];
        data.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"forwarded to the interceptor");
        assert_eq!(rig.stack.recved(pcb), 28);
        assert_eq!(rig.stack.live_pbufs(), 0);
    }

    #[test]
    fn test_remote_close_tears_down_connection() {
        let mut rig = rig();
        let (_interceptor, rpc_fd, _data, pcb, _local_fd) = buffer_conn(&mut rig);

        rig.stack.fire_remote_close(pcb);
        rig.el.drain_stack_events();

        assert!(rig.el.clients.get(&rpc_fd).unwrap().conns.is_empty());
        assert!(rig.stack.was_closed(pcb));
    }

    #[test]
    fn test_recv_after_close_frees_chain() {
        let mut rig = rig();
        let (_interceptor, rpc_fd, _data, pcb, local_fd) = buffer_conn(&mut rig);
        let r = conn_ref(&rig, local_fd);
        rig.el.close_connection(r);
        assert!(rig.el.clients.get(&rpc_fd).unwrap().conns.is_empty());

        // A chain already queued when the connection died is dropped and
        // freed, never delivered.
        rig.stack.fire_recv(pcb, b"too late");
        rig.el.drain_stack_events();
        assert_eq!(rig.stack.live_pbufs(), 0);
    }

    #[test]
    fn test_sent_ack_restores_window_without_events() {
        let mut rig = rig();
        let (_interceptor, _rpc_fd, mut data, pcb, local_fd) = buffer_conn(&mut rig);
        rig.stack.tcp_sent(pcb, crate::events::on_sent);

        data.write_all(b"abc").unwrap();
        rig.el.on_buffer_readable(local_fd);
        assert_eq!(rig.stack.tcp_sndbuf(pcb), crate::stack::TCP_SND_BUF - 3);

        // The ACK fires the sent callback; nothing waits on it, so no
        // event is queued and the window simply reopens.
        rig.stack.ack(pcb, 3);
        assert!(rig.el.events.borrow().is_empty());
        assert_eq!(rig.stack.tcp_sndbuf(pcb), crate::stack::TCP_SND_BUF);
    }

    #[test]
    fn test_full_staging_buffer_defers_reads() {
        let mut rig = rig();
        let (_interceptor, _rpc_fd, mut data, pcb, local_fd) = buffer_conn(&mut rig);
        rig.stack.set_sndbuf(1000); // park everything staged

        let r = conn_ref(&rig, local_fd);
        {
            let c = rig.el.conn_mut(r).unwrap();
            c.idx = STAGING_BUF_SIZE;
        }
        data.write_all(b"overflow").unwrap();
        rig.el.on_buffer_readable(local_fd);

        // Nothing read past the full staging buffer, nothing written.
        let c = rig.el.conn_mut(r).unwrap();
        assert_eq!(c.idx, STAGING_BUF_SIZE);
        assert!(rig.stack.written(pcb).is_empty());
    }
}
