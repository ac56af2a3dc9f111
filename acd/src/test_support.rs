//! In-memory [`Driver`] so the protocol machinery can run without a
//! kernel: manual clock, captured transmissions, injected frames and
//! fault injection for sends, receives and the filter map.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::rc::Rc;

use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::arp::{ArpPacket, MacAddr};
use crate::context::Acd;
use crate::sys::{Driver, SendOutcome};

pub(crate) const LOCAL_MAC: MacAddr = MacAddr([0x02, 0xaa, 0xbb, 0x00, 0x00, 0x01]);

#[derive(Default)]
pub(crate) struct TestState {
    /// The manual clock, in microseconds.
    pub now: u64,
    /// Deadline of the armed timer, if any.
    pub alarm: Option<u64>,
    /// Every frame the engine put on the wire, in order.
    pub sent: Vec<ArpPacket>,
    /// Frames waiting to be received.
    pub rx: VecDeque<Vec<u8>>,
    /// Number of upcoming sends to report as queue-dropped.
    pub drop_sends: usize,
    /// Errno to fail the next send with.
    pub send_errno: Option<i32>,
    /// Errno to fail the next receive with.
    pub recv_errno: Option<i32>,
    /// The watched-IP set as the kernel would see it.
    pub filter: HashSet<Ipv4Addr>,
    pub capacity: usize,
    pub fail_reserve: bool,
}

pub(crate) struct TestDriver(pub Rc<RefCell<TestState>>);

impl Driver for TestDriver {
    fn now(&self) -> u64 {
        self.0.borrow().now
    }

    fn readiness_fd(&self) -> RawFd {
        -1
    }

    fn ack_alarm(&mut self) {}

    fn set_alarm(&mut self, deadline: Option<u64>) {
        self.0.borrow_mut().alarm = deadline;
    }

    fn send_frame(&mut self, frame: &[u8]) -> io::Result<SendOutcome> {
        let mut state = self.0.borrow_mut();
        if let Some(errno) = state.send_errno.take() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        if state.drop_sends > 0 {
            state.drop_sends -= 1;
            return Ok(SendOutcome::Dropped);
        }
        let pkt = ArpPacket::decode(frame).expect("engine emitted a malformed frame");
        state.sent.push(pkt);
        Ok(SendOutcome::Sent)
    }

    fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let mut state = self.0.borrow_mut();
        if let Some(errno) = state.recv_errno.take() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        match state.rx.pop_front() {
            Some(frame) => {
                buf[..frame.len()].copy_from_slice(&frame);
                Ok(Some(frame.len()))
            }
            None => Ok(None),
        }
    }

    fn filter_reserve(&mut self, live: &[Ipv4Addr]) -> io::Result<()> {
        let mut state = self.0.borrow_mut();
        if state.fail_reserve {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        while state.capacity < live.len() + 1 {
            state.capacity *= 2;
        }
        Ok(())
    }

    fn filter_insert(&mut self, ip: Ipv4Addr) -> io::Result<()> {
        let mut state = self.0.borrow_mut();
        if state.filter.len() >= state.capacity {
            return Err(io::Error::from_raw_os_error(libc::E2BIG));
        }
        state.filter.insert(ip);
        Ok(())
    }

    fn filter_remove(&mut self, ip: Ipv4Addr) -> io::Result<()> {
        if !self.0.borrow_mut().filter.remove(&ip) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        Ok(())
    }
}

/// A context on the in-memory driver, with a fixed rng seed so schedules
/// are reproducible.
pub(crate) fn harness() -> (Acd, Rc<RefCell<TestState>>) {
    let state = Rc::new(RefCell::new(TestState {
        capacity: 8,
        ..Default::default()
    }));
    let driver = TestDriver(Rc::clone(&state));
    let acd = Acd::with_parts(Box::new(driver), LOCAL_MAC, SmallRng::seed_from_u64(0x5eed));
    (acd, state)
}

/// Jumps the clock to the armed deadline and dispatches.
pub(crate) fn fire_next(acd: &mut Acd, state: &Rc<RefCell<TestState>>) {
    let alarm = state.borrow().alarm.expect("no timer armed");
    {
        let mut state = state.borrow_mut();
        if state.now < alarm {
            state.now = alarm;
        }
    }
    acd.dispatch().expect("dispatch failed");
}

/// Queues a frame for the next dispatch to receive.
pub(crate) fn inject(state: &Rc<RefCell<TestState>>, pkt: ArpPacket) {
    state.borrow_mut().rx.push_back(pkt.to_bytes());
}
