//! RPC framing: one opcode byte followed by a fixed-size struct.
//!
//! Layouts are bit-compatible with the C structs the interceptor library
//! memcpys onto the channel, so decoding is raw byte extraction in host
//! order, never a serialization format. Descriptor transfer is out of
//! band: `send_fd` passes the far end of a stream-pair across the RPC
//! channel as ancillary data.

use std::io::{self, IoSlice};
use std::net::Ipv4Addr;
use std::os::fd::RawFd;

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use thiserror::Error;

/// Request and reply opcodes, the first byte of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Socket = 1,
    Connect = 2,
    Bind = 3,
    Listen = 4,
    KillIntercept = 5,
    FdMapCompletion = 6,
    Retval = 7,
}

impl Opcode {
    pub fn from_byte(b: u8) -> Option<Opcode> {
        match b {
            1 => Some(Opcode::Socket),
            2 => Some(Opcode::Connect),
            3 => Some(Opcode::Bind),
            4 => Some(Opcode::Listen),
            5 => Some(Opcode::KillIntercept),
            6 => Some(Opcode::FdMapCompletion),
            7 => Some(Opcode::Retval),
            _ => None,
        }
    }
}

/// Error decoding a message (short read or junk opcode).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("empty message")]
    Empty,

    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("truncated {what}: got {got} bytes, need {need}")]
    Truncated {
        what: &'static str,
        got: usize,
        need: usize,
    },
}

/// Bit-compatible image of the `sockaddr_in` the interceptor captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SockaddrIn {
    pub sin_family: u16,
    /// Network byte order.
    pub sin_port: u16,
    /// Network byte order.
    pub sin_addr: u32,
    pub sin_zero: [u8; 8],
}

pub const SOCKADDR_IN_LEN: usize = 16;

impl SockaddrIn {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        SockaddrIn {
            sin_family: libc::AF_INET as u16,
            sin_port: port.to_be(),
            sin_addr: u32::from(ip).to_be(),
            sin_zero: [0; 8],
        }
    }

    /// Port in host byte order.
    pub fn port(&self) -> u16 {
        u16::from_be(self.sin_port)
    }

    pub fn ipv4(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from_be(self.sin_addr))
    }

    fn read(buf: &[u8]) -> SockaddrIn {
        SockaddrIn {
            sin_family: u16::from_ne_bytes([buf[0], buf[1]]),
            sin_port: u16::from_ne_bytes([buf[2], buf[3]]),
            sin_addr: u32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]),
            sin_zero: buf[8..16].try_into().unwrap_or([0; 8]),
        }
    }

    fn write(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.sin_family.to_ne_bytes());
        buf[2..4].copy_from_slice(&self.sin_port.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.sin_addr.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.sin_zero);
    }
}

/// `socket()` request: the arguments as the libc call received them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketReq {
    pub tid: i32,
    pub domain: i32,
    pub socktype: i32,
    pub protocol: i32,
}

pub const SOCKET_REQ_LEN: usize = 16;

/// `bind()` request against the interceptor-side descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindReq {
    pub tid: i32,
    pub sockfd: i32,
    pub addr: SockaddrIn,
    pub addrlen: i32,
}

pub const BIND_REQ_LEN: usize = 8 + SOCKADDR_IN_LEN + 4;

/// `listen()` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenReq {
    pub tid: i32,
    pub sockfd: i32,
    pub backlog: i32,
}

pub const LISTEN_REQ_LEN: usize = 12;

/// `connect()` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectReq {
    pub tid: i32,
    pub fd: i32,
    pub addr: SockaddrIn,
    pub addrlen: i32,
}

pub const CONNECT_REQ_LEN: usize = 8 + SOCKADDR_IN_LEN + 4;

/// A decoded client→shim request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Socket(SocketReq),
    Bind(BindReq),
    Listen(ListenReq),
    Connect(ConnectReq),
    KillIntercept,
    FdMapCompletion { their_fd: i32 },
}

impl Request {
    /// Thread id carried by the request, if the opcode has one.
    pub fn tid(&self) -> Option<i32> {
        match self {
            Request::Socket(r) => Some(r.tid),
            Request::Bind(r) => Some(r.tid),
            Request::Listen(r) => Some(r.tid),
            Request::Connect(r) => Some(r.tid),
            Request::KillIntercept | Request::FdMapCompletion { .. } => None,
        }
    }
}

fn need(what: &'static str, buf: &[u8], need: usize) -> Result<(), WireError> {
    if buf.len() < need {
        Err(WireError::Truncated {
            what,
            got: buf.len(),
            need,
        })
    } else {
        Ok(())
    }
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    i32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Decode one message from the front of `buf`. Returns the request and the
/// number of bytes consumed, so callers can walk a read that coalesced
/// several messages.
pub fn decode_request(buf: &[u8]) -> Result<(Request, usize), WireError> {
    let (&op, payload) = buf.split_first().ok_or(WireError::Empty)?;
    match Opcode::from_byte(op) {
        Some(Opcode::Socket) => {
            need("socket request", payload, SOCKET_REQ_LEN)?;
            let req = SocketReq {
                tid: read_i32(payload, 0),
                domain: read_i32(payload, 4),
                socktype: read_i32(payload, 8),
                protocol: read_i32(payload, 12),
            };
            Ok((Request::Socket(req), 1 + SOCKET_REQ_LEN))
        }
        Some(Opcode::Bind) => {
            need("bind request", payload, BIND_REQ_LEN)?;
            let req = BindReq {
                tid: read_i32(payload, 0),
                sockfd: read_i32(payload, 4),
                addr: SockaddrIn::read(&payload[8..8 + SOCKADDR_IN_LEN]),
                addrlen: read_i32(payload, 8 + SOCKADDR_IN_LEN),
            };
            Ok((Request::Bind(req), 1 + BIND_REQ_LEN))
        }
        Some(Opcode::Listen) => {
            need("listen request", payload, LISTEN_REQ_LEN)?;
            let req = ListenReq {
                tid: read_i32(payload, 0),
                sockfd: read_i32(payload, 4),
                backlog: read_i32(payload, 8),
            };
            Ok((Request::Listen(req), 1 + LISTEN_REQ_LEN))
        }
        Some(Opcode::Connect) => {
            need("connect request", payload, CONNECT_REQ_LEN)?;
            let req = ConnectReq {
                tid: read_i32(payload, 0),
                fd: read_i32(payload, 4),
                addr: SockaddrIn::read(&payload[8..8 + SOCKADDR_IN_LEN]),
                addrlen: read_i32(payload, 8 + SOCKADDR_IN_LEN),
            };
            Ok((Request::Connect(req), 1 + CONNECT_REQ_LEN))
        }
        Some(Opcode::KillIntercept) => Ok((Request::KillIntercept, 1)),
        Some(Opcode::FdMapCompletion) => {
            need("fd map completion", payload, 4)?;
            Ok((
                Request::FdMapCompletion {
                    their_fd: read_i32(payload, 0),
                },
                1 + 4,
            ))
        }
        Some(Opcode::Retval) | None => Err(WireError::UnknownOpcode(op)),
    }
}

/// Length of a RETVAL reply on the wire.
pub const RETVAL_LEN: usize = 5;

/// Encode a RETVAL reply: opcode byte, then the value in host byte order.
pub fn encode_retval(value: i32) -> [u8; RETVAL_LEN] {
    let v = value.to_ne_bytes();
    [Opcode::Retval as u8, v[0], v[1], v[2], v[3]]
}

/// Byte written on a new buffer pair to signal that a descriptor follows
/// on the RPC channel.
pub const FD_SIGNAL_BYTE: u8 = b'z';

/// Encode a request for transmission. The interceptor side of the
/// protocol; the shim uses it in tests.
pub fn encode_request(req: &Request) -> Vec<u8> {
    match req {
        Request::Socket(r) => {
            let mut out = vec![Opcode::Socket as u8];
            for v in [r.tid, r.domain, r.socktype, r.protocol] {
                out.extend_from_slice(&v.to_ne_bytes());
            }
            out
        }
        Request::Bind(r) => {
            let mut out = vec![Opcode::Bind as u8];
            out.extend_from_slice(&r.tid.to_ne_bytes());
            out.extend_from_slice(&r.sockfd.to_ne_bytes());
            let mut sa = [0u8; SOCKADDR_IN_LEN];
            r.addr.write(&mut sa);
            out.extend_from_slice(&sa);
            out.extend_from_slice(&r.addrlen.to_ne_bytes());
            out
        }
        Request::Listen(r) => {
            let mut out = vec![Opcode::Listen as u8];
            for v in [r.tid, r.sockfd, r.backlog] {
                out.extend_from_slice(&v.to_ne_bytes());
            }
            out
        }
        Request::Connect(r) => {
            let mut out = vec![Opcode::Connect as u8];
            out.extend_from_slice(&r.tid.to_ne_bytes());
            out.extend_from_slice(&r.fd.to_ne_bytes());
            let mut sa = [0u8; SOCKADDR_IN_LEN];
            r.addr.write(&mut sa);
            out.extend_from_slice(&sa);
            out.extend_from_slice(&r.addrlen.to_ne_bytes());
            out
        }
        Request::KillIntercept => vec![Opcode::KillIntercept as u8],
        Request::FdMapCompletion { their_fd } => {
            let mut out = vec![Opcode::FdMapCompletion as u8];
            out.extend_from_slice(&their_fd.to_ne_bytes());
            out
        }
    }
}

/// Pass `fd` to the peer of `channel` as ancillary data. The payload is a
/// single placeholder byte; the descriptor rides in the control message.
pub fn send_fd(channel: RawFd, fd: RawFd) -> io::Result<()> {
    let carrier = [0u8];
    let iov = [IoSlice::new(&carrier)];
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(channel, &iov, &cmsg, MsgFlags::empty(), None)
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    Ok(())
}
