//! Clients and their connections.
//!
//! A `Client` is one connected interceptor process; each of its
//! `Connection`s pairs a PCB inside the stack with a local stream-pair
//! whose far end lives in the interceptor. Lookups scan linearly: the
//! table is bounded by local process count.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::events::Larg;
use crate::stack::Pcb;

/// Bytes a connection may stage between the client socket and the stack.
pub const STAGING_BUF_SIZE: usize = 64 * 1024;

/// What a connection's local stream-pair carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    /// Control channel: opcode messages and descriptor transfer.
    #[allow(dead_code)] // the control channel is held on Client directly
    Rpc,
    /// Application bytes between the interceptor and the stack.
    Buffer,
}

/// One socket-equivalent.
pub struct Connection {
    pub kind: ConnKind,
    /// Local end of the stream-pair; the far end was handed to the
    /// interceptor.
    pub sock: OwnedFd,
    /// Descriptor value as known to the interceptor. Holds our far-end
    /// value until the FD_MAP_COMPLETION reply overwrites it.
    pub their_fd: i32,
    pub pcb: Option<Pcb>,
    /// Set when the stack invalidated the PCB from its error callback; a
    /// dead PCB must not be closed again.
    pub pcb_dead: bool,
    /// Staging buffer for client→stack bytes; `buf[..idx]` is pending.
    pub buf: Box<[u8]>,
    pub idx: usize,
    /// Callback argument registered with the stack for this PCB. The box
    /// must outlive the registration, so it is freed only after the close
    /// request.
    pub larg: Option<Box<Larg>>,
}

impl Connection {
    pub fn new(kind: ConnKind, sock: OwnedFd) -> Connection {
        Connection {
            kind,
            sock,
            their_fd: -1,
            pcb: None,
            pcb_dead: false,
            buf: vec![0u8; STAGING_BUF_SIZE].into_boxed_slice(),
            idx: 0,
            larg: None,
        }
    }

    pub fn local_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    /// The PCB handle, if it is still the stack's to operate on.
    pub fn live_pcb(&self) -> Option<Pcb> {
        if self.pcb_dead {
            None
        } else {
            self.pcb
        }
    }
}

/// One connected interceptor process.
pub struct Client {
    /// Control channel to the interceptor.
    pub rpc: UnixStream,
    pub conns: Vec<Connection>,
    /// Connection awaiting the interceptor's FD_MAP_COMPLETION reply.
    pub unmapped: Option<Connection>,
    pub waiting_for_retval: bool,
    /// Thread id carried by the last request, for error reporting.
    pub tid: i32,
}

impl Client {
    pub fn new(rpc: UnixStream) -> Client {
        Client {
            rpc,
            conns: Vec::new(),
            unmapped: None,
            waiting_for_retval: false,
            tid: 0,
        }
    }

    pub fn conn_by_their_fd(&mut self, fd: i32) -> Option<&mut Connection> {
        self.conns.iter_mut().find(|c| c.their_fd == fd)
    }

    pub fn owns_pcb(&self, pcb: Pcb) -> bool {
        self.conns
            .iter()
            .chain(self.unmapped.iter())
            .any(|c| c.pcb == Some(pcb))
    }
}

/// Client set keyed by the RPC channel descriptor.
pub type ClientTable = HashMap<RawFd, Client>;

/// Which slot of a client a connection occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Listed(usize),
    Unmapped,
}

/// Locator for a connection: owning client's RPC descriptor plus slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnRef {
    pub client: RawFd,
    pub slot: Slot,
}

fn locate(
    clients: &ClientTable,
    pred: impl Fn(&Connection) -> bool,
) -> Option<ConnRef> {
    for (&rpc_fd, client) in clients {
        if let Some(i) = client.conns.iter().position(&pred) {
            return Some(ConnRef {
                client: rpc_fd,
                slot: Slot::Listed(i),
            });
        }
        if client.unmapped.as_ref().is_some_and(&pred) {
            return Some(ConnRef {
                client: rpc_fd,
                slot: Slot::Unmapped,
            });
        }
    }
    None
}

/// Connection owning `pcb`, wherever it lives.
pub fn find_by_pcb(clients: &ClientTable, pcb: Pcb) -> Option<ConnRef> {
    locate(clients, |c| c.pcb == Some(pcb))
}

/// Connection whose local stream-pair end is `fd`.
pub fn find_by_local_fd(clients: &ClientTable, fd: RawFd) -> Option<ConnRef> {
    locate(clients, |c| c.local_fd() == fd)
}

/// RPC descriptor of the client owning `pcb`.
pub fn client_by_pcb(clients: &ClientTable, pcb: Pcb) -> Option<RawFd> {
    clients
        .iter()
        .find(|(_, c)| c.owns_pcb(pcb))
        .map(|(&fd, _)| fd)
}

/// Put `fd` into nonblocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Plain `read(2)`; the descriptor table mixes std and raw fds.
pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Plain `write(2)`.
pub fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use std::ffi::c_void;

    fn pair() -> (OwnedFd, OwnedFd) {
        socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .unwrap()
    }

    fn table_with_one_conn() -> (ClientTable, RawFd, RawFd, Pcb) {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        let rpc_fd = a.as_raw_fd();
        let mut client = Client::new(a);

        let (ours, theirs) = pair();
        let pcb = Pcb(0x1000 as *mut c_void);
        let mut conn = Connection::new(ConnKind::Buffer, ours);
        conn.pcb = Some(pcb);
        conn.their_fd = 42;
        let local = conn.local_fd();
        client.conns.push(conn);
        drop(theirs);

        let mut clients = ClientTable::new();
        clients.insert(rpc_fd, client);
        (clients, rpc_fd, local, pcb)
    }

    #[test]
    fn test_find_by_pcb() {
        let (clients, rpc_fd, _, pcb) = table_with_one_conn();
        let r = find_by_pcb(&clients, pcb).unwrap();
        assert_eq!(r.client, rpc_fd);
        assert_eq!(r.slot, Slot::Listed(0));
        assert!(find_by_pcb(&clients, Pcb(0x2000 as *mut c_void)).is_none());
    }

    #[test]
    fn test_find_by_local_fd() {
        let (clients, rpc_fd, local, _) = table_with_one_conn();
        let r = find_by_local_fd(&clients, local).unwrap();
        assert_eq!(r.client, rpc_fd);
        assert!(find_by_local_fd(&clients, -1).is_none());
    }

    #[test]
    fn test_find_unmapped() {
        let (mut clients, rpc_fd, _, _) = table_with_one_conn();
        let (ours, theirs) = pair();
        let pcb = Pcb(0x3000 as *mut c_void);
        let mut conn = Connection::new(ConnKind::Buffer, ours);
        conn.pcb = Some(pcb);
        clients.get_mut(&rpc_fd).unwrap().unmapped = Some(conn);
        drop(theirs);

        let r = find_by_pcb(&clients, pcb).unwrap();
        assert_eq!(r.slot, Slot::Unmapped);
        assert_eq!(client_by_pcb(&clients, pcb), Some(rpc_fd));
    }

    #[test]
    fn test_conn_by_their_fd() {
        let (mut clients, rpc_fd, _, _) = table_with_one_conn();
        let client = clients.get_mut(&rpc_fd).unwrap();
        assert!(client.conn_by_their_fd(42).is_some());
        assert!(client.conn_by_their_fd(57).is_none());
    }

    #[test]
    fn test_live_pcb_honors_death() {
        let (ours, theirs) = pair();
        drop(theirs);
        let mut conn = Connection::new(ConnKind::Buffer, ours);
        conn.pcb = Some(Pcb(0x1000 as *mut c_void));
        assert!(conn.live_pcb().is_some());
        conn.pcb_dead = true;
        assert!(conn.live_pcb().is_none());
    }
}
