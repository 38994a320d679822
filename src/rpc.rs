//! The RPC dispatcher.
//!
//! Serves socket-API requests arriving on client RPC channels. The
//! dispatcher itself is stateless per message; request state lives on the
//! `Client`. Handlers whose failure must not produce a reply return a
//! typed error that is logged and dropped; the interceptor observes its
//! blocking read time out. Paths that succeed either reply immediately or
//! register enough stack callbacks that a RETVAL is eventually sent.

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use tracing::{debug, error, info, warn};

use crate::conn::{self, ConnKind, ConnRef, Connection, Slot};
use crate::error::ShimError;
use crate::event_loop::EventLoop;
use crate::events::{self, Larg};
use crate::pump::PCB_POLL_INTERVAL;
use crate::stack::{err, Pcb, TcpState};
use crate::wire::{self, BindReq, ConnectReq, ListenReq, Request, SocketReq};

/// Local stream-pair: our nonblocking end plus the end destined for the
/// interceptor.
fn make_stream_pair() -> Result<(OwnedFd, OwnedFd), ShimError> {
    let (ours, theirs) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )?;
    conn::set_nonblocking(ours.as_raw_fd())?;
    Ok((ours, theirs))
}

impl EventLoop {
    /// Read and dispatch whatever the client wrote. Requests are handled
    /// strictly in arrival order; one read may carry several.
    pub(crate) fn dispatch_rpc(&mut self, rpc_fd: RawFd) {
        let mut buf = [0u8; 4096];
        let read_result = {
            let Some(client) = self.clients.get_mut(&rpc_fd) else {
                return;
            };
            (&client.rpc).read(&mut buf)
        };
        let n = match read_result {
            Ok(0) => {
                debug!(client = rpc_fd, "rpc channel closed by peer");
                self.close_client(rpc_fd);
                return;
            }
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!(client = rpc_fd, error = %e, "rpc read failed");
                self.close_client(rpc_fd);
                return;
            }
        };

        let mut off = 0;
        while off < n && self.clients.contains_key(&rpc_fd) {
            let (req, used) = match wire::decode_request(&buf[off..n]) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(client = rpc_fd, error = %e, "dropping malformed request");
                    break;
                }
            };
            off += used;

            if let Some(tid) = req.tid() {
                if let Some(client) = self.clients.get_mut(&rpc_fd) {
                    client.tid = tid;
                }
            }

            let result = match req {
                Request::Socket(r) => self.handle_socket(rpc_fd, r),
                Request::Bind(r) => self.handle_bind(rpc_fd, r),
                Request::Listen(r) => self.handle_listen(rpc_fd, r),
                Request::Connect(r) => self.handle_connect(rpc_fd, r),
                Request::KillIntercept => {
                    info!(client = rpc_fd, "kill requested");
                    self.close_client(rpc_fd);
                    Ok(())
                }
                Request::FdMapCompletion { their_fd } => self.handle_fd_map(rpc_fd, their_fd),
            };
            if let Err(e) = result {
                let tid = self.clients.get(&rpc_fd).map(|c| c.tid).unwrap_or(0);
                warn!(client = rpc_fd, tid, error = %e, "request failed");
            }
            self.drain_stack_events();
        }
    }

    /// SOCKET: allocate a PCB, hand the far end of a fresh stream-pair to
    /// the interceptor, and park the connection until FD_MAP_COMPLETION.
    fn handle_socket(&mut self, rpc_fd: RawFd, _req: SocketReq) -> Result<(), ShimError> {
        let stack = Arc::clone(&self.stack);
        let pcb = stack.tcp_new();
        if pcb.is_null() {
            return Err(ShimError::AllocFailure("tcp pcb"));
        }
        if !self.clients.contains_key(&rpc_fd) {
            stack.tcp_close(pcb);
            return Err(ShimError::NotFound("client"));
        }

        let (ours, theirs) = match make_stream_pair() {
            Ok(pair) => pair,
            Err(e) => {
                stack.tcp_close(pcb);
                return Err(e);
            }
        };
        let mut new_conn = Connection::new(ConnKind::Buffer, ours);
        new_conn.their_fd = theirs.as_raw_fd();
        new_conn.pcb = Some(pcb);

        if let Err(e) = wire::send_fd(rpc_fd, theirs.as_raw_fd()) {
            stack.tcp_close(pcb);
            return Err(ShimError::Io(e));
        }
        drop(theirs);

        let Some(client) = self.clients.get_mut(&rpc_fd) else {
            stack.tcp_close(pcb);
            return Err(ShimError::NotFound("client"));
        };
        if client.unmapped.is_some() {
            warn!(client = rpc_fd, "previous descriptor mapping still pending");
        }
        client.unmapped = Some(new_conn);
        debug!(client = rpc_fd, "socket staged for descriptor mapping");
        Ok(())
    }

    /// BIND: pin the bind address to the tap's primary IPv4. The caller
    /// cannot know the virtual interface's address, so the supplied
    /// address (INADDR_ANY included) is overridden deliberately.
    fn handle_bind(&mut self, rpc_fd: RawFd, req: BindReq) -> Result<(), ShimError> {
        let primary = self
            .shared
            .primary_ip()
            .ok_or(ShimError::NotFound("assigned address"))?;
        let stack = Arc::clone(&self.stack);
        let port = req.addr.port();

        let client = self
            .clients
            .get_mut(&rpc_fd)
            .ok_or(ShimError::NotFound("client"))?;
        let conn = client
            .conn_by_their_fd(req.sockfd)
            .ok_or(ShimError::NotFound("sockfd"))?;
        let pcb = conn.live_pcb().ok_or(ShimError::NotFound("pcb"))?;

        let state = stack.tcp_state(pcb);
        if state != TcpState::Closed {
            return Err(ShimError::BadState { op: "bind", state });
        }
        let e = stack.tcp_bind(pcb, primary, port);
        if e != err::OK {
            return Err(ShimError::Stack(e.into()));
        }
        debug!(client = rpc_fd, addr = %primary, port, "bound");
        Ok(())
    }

    /// LISTEN: no-op when already listening; otherwise move to the listen
    /// state, adopting the replacement PCB the stack may hand back, and
    /// arm the accept callback.
    fn handle_listen(&mut self, rpc_fd: RawFd, req: ListenReq) -> Result<(), ShimError> {
        let stack = Arc::clone(&self.stack);
        let events = self.events.clone();

        let client = self
            .clients
            .get_mut(&rpc_fd)
            .ok_or(ShimError::NotFound("client"))?;
        let conn = client
            .conn_by_their_fd(req.sockfd)
            .ok_or(ShimError::NotFound("sockfd"))?;
        let pcb = conn.live_pcb().ok_or(ShimError::NotFound("pcb"))?;

        if stack.tcp_state(pcb) == TcpState::Listen {
            debug!(client = rpc_fd, "pcb already listening");
            return Ok(());
        }
        let listener = stack.tcp_listen(pcb);
        if listener.is_null() {
            return Err(ShimError::AllocFailure("listen pcb"));
        }
        conn.pcb = Some(listener);
        let larg = Larg::new(&events, conn.local_fd());
        stack.tcp_arg(listener, Larg::as_arg(&larg));
        stack.tcp_accept(listener, events::on_accept);
        conn.larg = Some(larg);
        client.waiting_for_retval = true;
        debug!(client = rpc_fd, backlog = req.backlog, "listening");
        Ok(())
    }

    /// CONNECT: install the data callbacks, then initiate the connect. An
    /// accepted SYN only means the segment was enqueued; the real verdict
    /// arrives via the connected or error callback, so only an immediate
    /// failure is answered here.
    fn handle_connect(&mut self, rpc_fd: RawFd, req: ConnectReq) -> Result<(), ShimError> {
        let stack = Arc::clone(&self.stack);
        let events = self.events.clone();

        let client = self
            .clients
            .get_mut(&rpc_fd)
            .ok_or(ShimError::NotFound("client"))?;
        let conn = client
            .conn_by_their_fd(req.fd)
            .ok_or(ShimError::NotFound("fd"))?;
        let pcb = conn.live_pcb().ok_or(ShimError::NotFound("pcb"))?;

        let larg = Larg::new(&events, conn.local_fd());
        stack.tcp_arg(pcb, Larg::as_arg(&larg));
        stack.tcp_sent(pcb, events::on_sent);
        stack.tcp_recv(pcb, events::on_recv);
        stack.tcp_err(pcb, Some(events::on_err));
        stack.tcp_poll(pcb, events::on_poll, PCB_POLL_INTERVAL);
        conn.larg = Some(larg);
        client.waiting_for_retval = true;

        let e = stack.tcp_connect(pcb, req.addr.ipv4(), req.addr.port(), events::on_connected);
        if e < 0 {
            self.send_return_value(rpc_fd, e.into());
        }
        Ok(())
    }

    /// FD_MAP_COMPLETION: adopt the interceptor-side descriptor value and
    /// move the pending connection into the client's table.
    fn handle_fd_map(&mut self, rpc_fd: RawFd, their_fd: i32) -> Result<(), ShimError> {
        let client = self
            .clients
            .get_mut(&rpc_fd)
            .ok_or(ShimError::NotFound("client"))?;
        let mut conn = client
            .unmapped
            .take()
            .ok_or(ShimError::NotFound("pending connection"))?;
        conn.their_fd = their_fd;
        client.conns.push(conn);
        debug!(client = rpc_fd, their_fd, "descriptor mapped");
        Ok(())
    }

    /// Inbound connection accepted on a listening PCB: build a new buffer
    /// connection, signal the interceptor, transfer the descriptor, and
    /// ack the accept.
    pub(crate) fn on_accepted(&mut self, listen_fd: RawFd, newpcb: Pcb) {
        let stack = Arc::clone(&self.stack);
        let events = self.events.clone();
        let Some(r) = conn::find_by_local_fd(&self.clients, listen_fd) else {
            debug!("accept for unknown listener");
            stack.tcp_close(newpcb);
            return;
        };
        let rpc_fd = r.client;
        let listener_pcb = self.conn_mut(r).and_then(|c| c.live_pcb());

        let (ours, theirs) = match make_stream_pair() {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept dropped: no stream pair");
                stack.tcp_close(newpcb);
                return;
            }
        };
        let mut new_conn = Connection::new(ConnKind::Buffer, ours);
        new_conn.their_fd = theirs.as_raw_fd();
        new_conn.pcb = Some(newpcb);

        // Signal byte on the buffer pair first: a descriptor follows on
        // the RPC channel.
        match conn::write_fd(new_conn.local_fd(), &[wire::FD_SIGNAL_BYTE]) {
            Ok(1) => {}
            _ => {
                warn!(client = rpc_fd, "unable to write signal byte for accepted connection");
                stack.tcp_close(newpcb);
                return;
            }
        }
        if let Err(e) = wire::send_fd(rpc_fd, theirs.as_raw_fd()) {
            warn!(client = rpc_fd, error = %e, "descriptor transfer failed");
            stack.tcp_close(newpcb);
            return;
        }
        drop(theirs);

        let larg = Larg::new(&events, new_conn.local_fd());
        stack.tcp_arg(newpcb, Larg::as_arg(&larg));
        stack.tcp_recv(newpcb, events::on_recv);
        stack.tcp_err(newpcb, Some(events::on_err));
        stack.tcp_sent(newpcb, events::on_sent);
        stack.tcp_poll(newpcb, events::on_poll, PCB_POLL_INTERVAL);
        new_conn.larg = Some(larg);

        let Some(client) = self.clients.get_mut(&rpc_fd) else {
            return;
        };
        if client.unmapped.is_some() {
            warn!(client = rpc_fd, "previous descriptor mapping still pending");
        }
        client.unmapped = Some(new_conn);
        if let Some(listener) = listener_pcb {
            stack.tcp_accepted(listener);
        }
        debug!(client = rpc_fd, "inbound connection staged for descriptor mapping");
    }

    /// The stack invalidated a PCB. The client hears about it through a
    /// RETVAL only if it is still waiting for one; the connection goes
    /// away either way, and the dead PCB is never closed again.
    pub(crate) fn on_stack_failed(&mut self, local_fd: RawFd, e: i32) {
        let Some(r) = conn::find_by_local_fd(&self.clients, local_fd) else {
            debug!(err = e, "error callback for unknown connection");
            return;
        };
        if let Some(c) = self.conn_mut(r) {
            c.pcb_dead = true;
        }
        let waiting = self
            .clients
            .get(&r.client)
            .map(|c| c.waiting_for_retval)
            .unwrap_or(false);
        if waiting {
            self.send_return_value(r.client, e);
        }
        self.close_connection(r);
    }

    /// Reply to the request the client is blocked on. At most one RETVAL
    /// goes out per armed request; the flag clears before the write.
    pub(crate) fn send_return_value(&mut self, rpc_fd: RawFd, value: i32) {
        let Some(client) = self.clients.get_mut(&rpc_fd) else {
            return;
        };
        if !client.waiting_for_retval {
            debug!(client = rpc_fd, value, "client is not waiting for a return value");
            return;
        }
        client.waiting_for_retval = false;
        let msg = wire::encode_retval(value);
        match (&client.rpc).write(&msg) {
            Ok(n) if n == msg.len() => {
                debug!(client = rpc_fd, tid = client.tid, value, "return value sent");
            }
            Ok(n) => {
                error!(client = rpc_fd, wrote = n, "short write sending return value");
                self.close_client(rpc_fd);
            }
            Err(e) => {
                error!(client = rpc_fd, error = %e, "unable to send return value to the intercept");
                self.close_client(rpc_fd);
            }
        }
    }

    pub(crate) fn conn_mut(&mut self, r: ConnRef) -> Option<&mut Connection> {
        let client = self.clients.get_mut(&r.client)?;
        match r.slot {
            Slot::Listed(i) => client.conns.get_mut(i),
            Slot::Unmapped => client.unmapped.as_mut(),
        }
    }

    /// Detach and tear down one connection.
    pub(crate) fn close_connection(&mut self, r: ConnRef) {
        let Some(client) = self.clients.get_mut(&r.client) else {
            return;
        };
        let conn = match r.slot {
            Slot::Listed(i) if i < client.conns.len() => client.conns.remove(i),
            Slot::Listed(_) => return,
            Slot::Unmapped => match client.unmapped.take() {
                Some(c) => c,
                None => return,
            },
        };
        self.destroy_connection(conn);
    }

    /// Local socket first, then the PCB, then the callback argument.
    fn destroy_connection(&mut self, conn: Connection) {
        let stack = Arc::clone(&self.stack);
        let Connection {
            sock,
            pcb,
            pcb_dead,
            larg,
            ..
        } = conn;
        drop(sock);
        if let Some(pcb) = pcb {
            if !pcb_dead {
                // Clear the user argument so a callback already in flight
                // cannot observe a freed Larg.
                stack.tcp_arg(pcb, std::ptr::null_mut());
                stack.tcp_err(pcb, None);
                let e = stack.tcp_close(pcb);
                if e != err::OK {
                    warn!(err = e, "stack close failed");
                }
            }
        }
        drop(larg);
    }

    /// Tear down a client: every connection, the pending one, then the
    /// RPC channel.
    pub(crate) fn close_client(&mut self, rpc_fd: RawFd) {
        let Some(mut client) = self.clients.remove(&rpc_fd) else {
            return;
        };
        info!(
            client = rpc_fd,
            connections = client.conns.len(),
            "closing client"
        );
        for c in client.conns.drain(..) {
            self.destroy_connection(c);
        }
        if let Some(c) = client.unmapped.take() {
            self.destroy_connection(c);
        }
    }
}
