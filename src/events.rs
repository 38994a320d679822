//! Stack-callback plumbing.
//!
//! The stack's C ABI allows one opaque user argument per PCB. Every
//! registration gets a boxed [`Larg`] carrying the event queue and the
//! connection's local descriptor; the `extern "C"` trampolines do nothing
//! but enqueue, and the event loop drains the queue right after every call
//! into the stack. A drained event whose connection no longer resolves is
//! dropped, which is how teardown cancels callbacks already in flight.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::ffi::c_void;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use crate::stack::{err, ErrT, Pbuf, Pcb};

pub type EventQueue = Rc<RefCell<VecDeque<StackEvent>>>;

pub fn new_queue() -> EventQueue {
    Rc::new(RefCell::new(VecDeque::new()))
}

/// Callback argument registered with the stack for one PCB.
pub struct Larg {
    queue: Weak<RefCell<VecDeque<StackEvent>>>,
    /// Local descriptor of the connection the registration belongs to.
    pub local_fd: RawFd,
}

impl Larg {
    pub fn new(queue: &EventQueue, local_fd: RawFd) -> Box<Larg> {
        Box::new(Larg {
            queue: Rc::downgrade(queue),
            local_fd,
        })
    }

    /// The pointer handed to the stack. Valid for as long as the box
    /// lives; the owning connection keeps it until after the PCB close.
    pub fn as_arg(larg: &Larg) -> *mut c_void {
        larg as *const Larg as *mut c_void
    }

    fn push(&self, ev: StackEvent) {
        if let Some(q) = self.queue.upgrade() {
            q.borrow_mut().push_back(ev);
        }
    }
}

/// Deferred work produced by a stack callback.
#[derive(Debug)]
pub enum StackEvent {
    /// New PCB accepted on the listener registered at `listen_fd`.
    Accepted { listen_fd: RawFd, newpcb: Pcb },
    /// Bytes received for a PCB; a null chain signals remote close.
    Received { pcb: Pcb, chain: *mut Pbuf },
    /// Outgoing connect finished.
    Connected { pcb: Pcb, err: i32 },
    /// The stack invalidated the PCB behind this registration.
    Failed { local_fd: RawFd, err: i32 },
    /// Per-PCB periodic poll.
    Poll { pcb: Pcb },
}

fn with_larg(arg: *mut c_void, f: impl FnOnce(&Larg)) {
    if !arg.is_null() {
        f(unsafe { &*(arg as *const Larg) });
    }
}

pub extern "C" fn on_accept(arg: *mut c_void, newpcb: Pcb, _err: ErrT) -> ErrT {
    with_larg(arg, |l| {
        l.push(StackEvent::Accepted {
            listen_fd: l.local_fd,
            newpcb,
        })
    });
    err::OK
}

pub extern "C" fn on_recv(arg: *mut c_void, pcb: Pcb, p: *mut Pbuf, _err: ErrT) -> ErrT {
    with_larg(arg, |l| l.push(StackEvent::Received { pcb, chain: p }));
    err::OK
}

pub extern "C" fn on_sent(_arg: *mut c_void, _pcb: Pcb, _len: u16) -> ErrT {
    // Nothing staged waits on ACKs; the poll callback drives the pump.
    err::OK
}

pub extern "C" fn on_err(arg: *mut c_void, e: ErrT) {
    with_larg(arg, |l| {
        l.push(StackEvent::Failed {
            local_fd: l.local_fd,
            err: i32::from(e),
        })
    });
}

pub extern "C" fn on_poll(arg: *mut c_void, pcb: Pcb) -> ErrT {
    with_larg(arg, |l| l.push(StackEvent::Poll { pcb }));
    err::OK
}

pub extern "C" fn on_connected(arg: *mut c_void, pcb: Pcb, e: ErrT) -> ErrT {
    with_larg(arg, |l| {
        l.push(StackEvent::Connected {
            pcb,
            err: i32::from(e),
        })
    });
    err::OK
}
