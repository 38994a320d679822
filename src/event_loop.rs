//! The single-threaded cooperative core.
//!
//! One thread owns every client, every connection, the stack event queue
//! and, apart from the initial interface setup, every call into the
//! stack. Each iteration paces the stack's TCP and ARP timers, then blocks
//! in `poll` over the wake pipe, the rendezvous listener, client RPC
//! channels and buffer sockets.

use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::sync::Arc;
use std::time::Instant;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, error, info, warn};

use crate::conn::{self, ClientTable, Client, STAGING_BUF_SIZE};
use crate::events::{self, EventQueue, StackEvent};
use crate::stack::{Stack, ARP_TMR_INTERVAL, TCP_TMR_INTERVAL};
use crate::tap::TapShared;

/// Timer bookkeeping, separated out so pacing is testable against a fake
/// clock.
pub(crate) struct TimerState {
    last_tcp_ms: u64,
    last_arp_ms: u64,
}

pub(crate) struct TimerActions {
    pub tcp: bool,
    pub arp: bool,
    /// Poll timeout: the smaller of the two elapsed-since-tick values.
    pub poll_ms: u64,
}

impl TimerState {
    pub(crate) fn new() -> TimerState {
        TimerState {
            last_tcp_ms: 0,
            last_arp_ms: 0,
        }
    }

    pub(crate) fn advance(&mut self, now_ms: u64) -> TimerActions {
        let since_tcp = now_ms.saturating_sub(self.last_tcp_ms);
        let since_arp = now_ms.saturating_sub(self.last_arp_ms);
        let poll_ms = since_tcp.min(since_arp);

        let tcp = since_tcp >= TCP_TMR_INTERVAL;
        if tcp {
            // Recorded one millisecond ahead so successive ticks do not
            // creep earlier each round.
            self.last_tcp_ms = now_ms + 1;
        }
        let arp = since_arp >= ARP_TMR_INTERVAL;
        if arp {
            self.last_arp_ms = now_ms;
        }
        TimerActions { tcp, arp, poll_ms }
    }
}

#[derive(Debug, Clone, Copy)]
enum Tag {
    Wake,
    Listener,
    Rpc(RawFd),
    Buffer(RawFd),
}

pub(crate) struct EventLoop {
    pub(crate) shared: Arc<TapShared>,
    pub(crate) stack: Arc<dyn Stack>,
    listener: UnixListener,
    wake_rx: OwnedFd,
    pub(crate) clients: ClientTable,
    pub(crate) events: EventQueue,
    timers: TimerState,
}

impl EventLoop {
    pub(crate) fn new(
        shared: Arc<TapShared>,
        listener: UnixListener,
        wake_rx: OwnedFd,
    ) -> EventLoop {
        let stack = shared.stack();
        EventLoop {
            shared,
            stack,
            listener,
            wake_rx,
            clients: ClientTable::new(),
            events: events::new_queue(),
            timers: TimerState::new(),
        }
    }

    pub(crate) fn run(&mut self) {
        info!("event loop started");
        let start = Instant::now();
        while self.shared.running() {
            let now_ms = start.elapsed().as_millis() as u64;
            let actions = self.timers.advance(now_ms);
            if actions.tcp {
                self.stack.tcp_tmr();
                self.drain_stack_events();
            }
            if actions.arp {
                self.stack.etharp_tmr();
                self.drain_stack_events();
            }
            self.poll_once(actions.poll_ms);
        }
        self.close_all_clients();
        info!("event loop stopped");
    }

    fn poll_once(&mut self, timeout_ms: u64) {
        let mut pfds = Vec::with_capacity(2 + self.clients.len() * 2);
        let mut tags = Vec::with_capacity(pfds.capacity());

        pfds.push(PollFd::new(self.wake_rx.as_fd(), PollFlags::POLLIN));
        tags.push(Tag::Wake);
        pfds.push(PollFd::new(self.listener.as_fd(), PollFlags::POLLIN));
        tags.push(Tag::Listener);

        for (&rpc_fd, client) in &self.clients {
            pfds.push(PollFd::new(client.rpc.as_fd(), PollFlags::POLLIN));
            tags.push(Tag::Rpc(rpc_fd));
            for c in &client.conns {
                // A full staging buffer parks the descriptor until the
                // pump drains it: backpressure by omission.
                if c.kind == conn::ConnKind::Buffer && c.idx < STAGING_BUF_SIZE {
                    pfds.push(PollFd::new(c.sock.as_fd(), PollFlags::POLLIN));
                    tags.push(Tag::Buffer(c.local_fd()));
                }
            }
        }

        let timeout = PollTimeout::from(timeout_ms.min(u64::from(u16::MAX)) as u16);
        match poll(&mut pfds, timeout) {
            Ok(0) => return,
            Ok(_) => {}
            Err(Errno::EINTR) => return,
            Err(e) => {
                error!(error = %e, "poll failed");
                return;
            }
        }

        let ready: Vec<(Tag, PollFlags)> = pfds
            .iter()
            .zip(&tags)
            .filter_map(|(p, tag)| {
                p.revents()
                    .filter(|r| !r.is_empty())
                    .map(|r| (*tag, r))
            })
            .collect();
        drop(pfds);

        for (tag, revents) in ready {
            match tag {
                Tag::Wake => self.on_wake(),
                Tag::Listener => self.accept_clients(),
                Tag::Rpc(fd) => {
                    if revents.contains(PollFlags::POLLIN) {
                        self.dispatch_rpc(fd);
                    } else if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                        debug!(client = fd, "rpc channel closed");
                        self.close_client(fd);
                    }
                }
                Tag::Buffer(fd) => {
                    if revents.contains(PollFlags::POLLIN) {
                        self.on_buffer_readable(fd);
                    } else if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                        if let Some(r) = conn::find_by_local_fd(&self.clients, fd) {
                            self.close_connection(r);
                        }
                    }
                }
            }
            self.drain_stack_events();
        }
    }

    fn on_wake(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match conn::read_fd(self.wake_rx.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "wake pipe read failed");
                    break;
                }
            }
        }
        self.pump_ingress();
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!(error = %e, "dropping client: nonblocking setup failed");
                        continue;
                    }
                    let fd = stream.as_raw_fd();
                    info!(client = fd, "interceptor connected");
                    self.clients.insert(fd, Client::new(stream));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Handle everything the stack callbacks queued during the last call
    /// into the stack.
    pub(crate) fn drain_stack_events(&mut self) {
        loop {
            let ev = self.events.borrow_mut().pop_front();
            match ev {
                Some(ev) => self.handle_stack_event(ev),
                None => break,
            }
        }
    }

    fn handle_stack_event(&mut self, ev: StackEvent) {
        match ev {
            StackEvent::Accepted { listen_fd, newpcb } => self.on_accepted(listen_fd, newpcb),
            StackEvent::Received { pcb, chain } => self.on_stack_recv(pcb, chain),
            StackEvent::Connected { pcb, err } => {
                match conn::client_by_pcb(&self.clients, pcb) {
                    Some(rpc_fd) => self.send_return_value(rpc_fd, err),
                    None => debug!(err, "connected callback for unknown PCB"),
                }
            }
            StackEvent::Failed { local_fd, err } => self.on_stack_failed(local_fd, err),
            StackEvent::Poll { pcb } => {
                if let Some(r) = conn::find_by_pcb(&self.clients, pcb) {
                    self.handle_write(r);
                }
            }
        }
    }

    fn close_all_clients(&mut self) {
        let fds: Vec<RawFd> = self.clients.keys().copied().collect();
        for fd in fds {
            self.close_client(fd);
        }
    }
}
