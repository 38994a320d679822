//! End-to-end exercise of the rendezvous endpoint: a live tap (mock
//! stack), driven by an interceptor-side unix client the way the
//! preloaded library would drive it.

use std::io::{IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
use tapshim::stack::err;
use tapshim::wire::{
    encode_request, BindReq, ConnectReq, ListenReq, Opcode, Request, SockaddrIn, SocketReq,
    RETVAL_LEN, SOCKADDR_IN_LEN,
};
use tapshim::{IpAssignment, Mac, MockStack, Tap, TapConfig};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

fn start_tap(nwid: u64) -> (Tap, Arc<MockStack>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
    let stack = Arc::new(MockStack::new());
    let config = TapConfig::new(nwid, Mac([2, 0, 0, 0, 0, 1]));
    let tap = Tap::new(config, stack.clone(), Arc::new(|_, _, _, _, _, _| {})).unwrap();
    (tap, stack)
}

fn connect_interceptor(tap: &Tap) -> UnixStream {
    let stream = UnixStream::connect(tap.device_name()).unwrap();
    stream.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
    stream
}

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

fn read_retval(stream: &mut UnixStream) -> i32 {
    let mut buf = [0u8; RETVAL_LEN];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(buf[0], Opcode::Retval as u8);
    i32::from_ne_bytes([buf[1], buf[2], buf[3], buf[4]])
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + READ_TIMEOUT;
    while !cond() {
        assert!(std::time::Instant::now() < deadline, "condition never held");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn socket_bind_listen_over_rendezvous_endpoint() {
    let (tap, stack) = start_tap(0x0e2e_0000_0000_0001);
    tap.add_ip(IpAssignment::new("10.121.0.2".parse().unwrap(), 24));

    let mut rpc = connect_interceptor(&tap);

    // SOCKET: a descriptor comes back out of band.
    rpc.write_all(&encode_request(&Request::Socket(SocketReq {
        tid: 7,
        domain: 2,
        socktype: 1,
        protocol: 0,
    })))
    .unwrap();
    let data_fd = recv_fd(&rpc);
    let _data = UnixStream::from(data_fd);

    rpc.write_all(&encode_request(&Request::FdMapCompletion { their_fd: 42 }))
        .unwrap();

    // BIND to 0.0.0.0:8080; the shim pins the primary address. No reply.
    rpc.write_all(&encode_request(&Request::Bind(BindReq {
        tid: 7,
        sockfd: 42,
        addr: SockaddrIn::new("0.0.0.0".parse().unwrap(), 8080),
        addrlen: SOCKADDR_IN_LEN as i32,
    })))
    .unwrap();
    wait_until(|| {
        stack
            .bound(stack.last_pcb())
            .is_some_and(|(addr, port)| addr == "10.121.0.2".parse::<std::net::Ipv4Addr>().unwrap() && port == 8080)
    });

    // LISTEN: the PCB moves to the listen state (replaced by the stack).
    rpc.write_all(&encode_request(&Request::Listen(ListenReq {
        tid: 7,
        sockfd: 42,
        backlog: 16,
    })))
    .unwrap();
    wait_until(|| stack.state_of(stack.last_pcb()) == tapshim::stack::TcpState::Listen);

    tap.shutdown();
}

#[test]
fn connect_failure_travels_back_as_retval() {
    let (tap, stack) = start_tap(0x0e2e_0000_0000_0002);
    stack.set_connect_result(err::TIMEOUT);

    let mut rpc = connect_interceptor(&tap);
    rpc.write_all(&encode_request(&Request::Socket(SocketReq {
        tid: 9,
        domain: 2,
        socktype: 1,
        protocol: 0,
    })))
    .unwrap();
    let _data = UnixStream::from(recv_fd(&rpc));
    rpc.write_all(&encode_request(&Request::FdMapCompletion { their_fd: 5 }))
        .unwrap();

    rpc.write_all(&encode_request(&Request::Connect(ConnectReq {
        tid: 9,
        fd: 5,
        addr: SockaddrIn::new("10.0.0.1".parse().unwrap(), 22),
        addrlen: SOCKADDR_IN_LEN as i32,
    })))
    .unwrap();

    assert_eq!(read_retval(&mut rpc), -3);
    tap.shutdown();
}

#[test]
fn channel_close_releases_shim_state() {
    let (tap, stack) = start_tap(0x0e2e_0000_0000_0003);

    let mut rpc = connect_interceptor(&tap);
    rpc.write_all(&encode_request(&Request::Socket(SocketReq {
        tid: 3,
        domain: 2,
        socktype: 1,
        protocol: 0,
    })))
    .unwrap();
    let _data = UnixStream::from(recv_fd(&rpc));
    rpc.write_all(&encode_request(&Request::FdMapCompletion { their_fd: 11 }))
        .unwrap();
    let pcb = stack.last_pcb();
    wait_until(|| stack.is_live(pcb));

    drop(rpc);
    wait_until(|| stack.was_closed(pcb));
    tap.shutdown();
}
