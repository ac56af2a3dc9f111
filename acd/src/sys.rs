//! Linux plumbing: the packet socket, the timerfd and the epoll readiness
//! handle a context hands to its caller.
//!
//! The context itself never issues a syscall directly; everything goes
//! through the [`Driver`] trait so the protocol machinery can run against
//! an in-memory driver in tests.

use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use tracing::warn;

use crate::arp::MacAddr;
use crate::bpf;

/// Initial capacity of the watched-IP map; grows geometrically.
const INITIAL_MAP_CAPACITY: u32 = 8;

/// Outcome of a frame transmission that did not fail the socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SendOutcome {
    /// The frame was handed to the device queue.
    Sent,
    /// The kernel refused the frame at packet granularity (`EAGAIN`,
    /// `ENOBUFS`); the caller pretends the attempt never happened.
    Dropped,
}

/// Everything the conflict-detection engine needs from the outside world.
pub(crate) trait Driver {
    /// Monotonic microsecond timestamp; the single time source for all
    /// scheduling decisions.
    fn now(&self) -> u64;

    /// The readiness handle multiplexing socket and timer.
    fn readiness_fd(&self) -> RawFd;

    /// Consumes a pending timer expiration so a level-triggered poll loop
    /// does not spin.
    fn ack_alarm(&mut self);

    /// Arms the timer for an absolute microsecond deadline, or disarms it.
    fn set_alarm(&mut self, deadline: Option<u64>);

    /// Broadcasts one link-layer frame.
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<SendOutcome>;

    /// Receives one frame, or `None` when the queue is empty.
    fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    /// Ensures the kernel filter has room for one more address on top of
    /// `live`, rebuilding map and program if it does not.
    fn filter_reserve(&mut self, live: &[Ipv4Addr]) -> io::Result<()>;

    /// Adds an address to the kernel filter. Space for it has been
    /// reserved beforehand.
    fn filter_insert(&mut self, ip: Ipv4Addr) -> io::Result<()>;

    /// Drops an address from the kernel filter. The entry is known to be
    /// present.
    fn filter_remove(&mut self, ip: Ipv4Addr) -> io::Result<()>;
}

/// Errnos that mean the link itself is gone rather than one frame.
pub(crate) fn is_link_down(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENETDOWN) | Some(libc::ENXIO) | Some(libc::ENODEV)
    )
}

/// The production [`Driver`]: an `AF_PACKET` socket bound to one
/// interface, filtered in the kernel, plus a timerfd, both registered in
/// an epoll instance that serves as the single readiness fd.
pub(crate) struct SysDriver {
    ifindex: u32,
    mac: MacAddr,
    epoll: OwnedFd,
    timer: OwnedFd,
    socket: OwnedFd,
    map: OwnedFd,
    map_capacity: u32,
}

impl SysDriver {
    pub fn new(ifindex: u32, mac: MacAddr) -> io::Result<Self> {
        let epoll = epoll_create()?;
        let timer = timerfd_create()?;
        let map = bpf::map_create(INITIAL_MAP_CAPACITY)?;

        // The socket is created unbound (protocol 0) so that no frame can
        // be queued before the filter is attached; only then is it bound
        // to ETH_P_ARP on the interface.
        let socket = packet_socket()?;
        attach_filter(&socket, &map, mac)?;
        bind_packet_socket(&socket, ifindex)?;

        epoll_add(&epoll, socket.as_raw_fd())?;
        epoll_add(&epoll, timer.as_raw_fd())?;

        Ok(SysDriver {
            ifindex,
            mac,
            epoll,
            timer,
            socket,
            map,
            map_capacity: INITIAL_MAP_CAPACITY,
        })
    }
}

impl Driver for SysDriver {
    fn now(&self) -> u64 {
        monotonic_now()
    }

    fn readiness_fd(&self) -> RawFd {
        self.epoll.as_raw_fd()
    }

    fn ack_alarm(&mut self) {
        let mut expirations = [0u8; 8];
        unsafe {
            libc::read(
                self.timer.as_raw_fd(),
                expirations.as_mut_ptr() as *mut libc::c_void,
                expirations.len(),
            );
        }
    }

    fn set_alarm(&mut self, deadline: Option<u64>) {
        let mut spec: libc::itimerspec = unsafe { mem::zeroed() };
        if let Some(usec) = deadline {
            // An all-zero it_value disarms the timer, so a deadline in the
            // past is clamped to the earliest armable instant.
            let usec = usec.max(1);
            spec.it_value.tv_sec = (usec / 1_000_000) as libc::time_t;
            spec.it_value.tv_nsec = ((usec % 1_000_000) * 1_000) as libc::c_long;
        }
        let r = unsafe {
            libc::timerfd_settime(
                self.timer.as_raw_fd(),
                libc::TFD_TIMER_ABSTIME,
                &spec,
                ptr::null_mut(),
            )
        };
        if r < 0 {
            warn!(err = %io::Error::last_os_error(), "failed to arm timerfd");
        }
    }

    fn send_frame(&mut self, frame: &[u8]) -> io::Result<SendOutcome> {
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
        addr.sll_protocol = (libc::ETH_P_ARP as u16).to_be();
        addr.sll_ifindex = self.ifindex as libc::c_int;
        addr.sll_halen = 6;
        addr.sll_addr[..6].copy_from_slice(&MacAddr::BROADCAST.octets());

        let r = unsafe {
            libc::sendto(
                self.socket.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                libc::MSG_NOSIGNAL,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if r < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                // Transient queue pressure; the frame never left.
                Some(libc::EAGAIN) | Some(libc::ENOBUFS) => Ok(SendOutcome::Dropped),
                _ => Err(err),
            };
        }
        Ok(SendOutcome::Sent)
    }

    fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        loop {
            let r = unsafe {
                libc::recv(
                    self.socket.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if r >= 0 {
                return Ok(Some(r as usize));
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return Ok(None),
                _ => return Err(err),
            }
        }
    }

    fn filter_reserve(&mut self, live: &[Ipv4Addr]) -> io::Result<()> {
        let needed = live.len() as u32 + 1;
        if needed <= self.map_capacity {
            return Ok(());
        }
        let mut capacity = self.map_capacity;
        while capacity < needed {
            capacity *= 2;
        }

        // Build and populate the replacement map in full before swapping
        // the program; the kernel must never consult a partial set.
        let map = bpf::map_create(capacity)?;
        for ip in live {
            bpf::map_insert(&map, *ip)?;
        }
        attach_filter(&self.socket, &map, self.mac)?;
        self.map = map;
        self.map_capacity = capacity;
        Ok(())
    }

    fn filter_insert(&mut self, ip: Ipv4Addr) -> io::Result<()> {
        bpf::map_insert(&self.map, ip)
    }

    fn filter_remove(&mut self, ip: Ipv4Addr) -> io::Result<()> {
        bpf::map_remove(&self.map, ip)
    }
}

pub(crate) fn monotonic_now() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}

fn epoll_create() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn epoll_add(epoll: &OwnedFd, fd: RawFd) -> io::Result<()> {
    let mut event = libc::epoll_event {
        events: libc::EPOLLIN as u32,
        u64: fd as u64,
    };
    let r = unsafe { libc::epoll_ctl(epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event) };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn timerfd_create() -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn packet_socket() -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn bind_packet_socket(socket: &OwnedFd, ifindex: u32) -> io::Result<()> {
    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
    addr.sll_protocol = (libc::ETH_P_ARP as u16).to_be();
    addr.sll_ifindex = ifindex as libc::c_int;
    let r = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Compiles and attaches the filter for `map` to `socket`, replacing any
/// previously attached program. The program fd is released afterwards; the
/// socket keeps its own reference.
fn attach_filter(socket: &OwnedFd, map: &OwnedFd, mac: MacAddr) -> io::Result<()> {
    let prog = bpf::filter_program(map.as_raw_fd(), mac);
    let prog_fd = bpf::prog_load(&prog)?;
    let fd: libc::c_int = prog_fd.as_raw_fd();
    let r = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ATTACH_BPF,
            &fd as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
