//! The per-interface multiplexing context.
//!
//! One [`Acd`] owns the packet socket, the kernel filter, the timer and the
//! event queue for every probe running on one network interface. Probes are
//! rows in the context, addressed by [`ProbeId`]; the caller drives the
//! whole ensemble by polling the readiness fd and calling
//! [`Acd::dispatch`], then draining [`Acd::pop_event`].

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, RawFd};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace, warn};

use crate::arp::{ArpOp, ArpPacket, MacAddr};
use crate::probe::{
    Defend, Probe, ProbeConfig, ProbeId, State, MAX_CONFLICTS, PROBE_NUM, PROBE_WAIT_USEC,
    RATE_LIMIT_INTERVAL_USEC,
};
use crate::sys::{is_link_down, Driver, SendOutcome, SysDriver};
use crate::Error;

/// Upper bound on frames handled per [`Acd::dispatch`] call, so one call
/// cannot monopolize the caller's poll loop under an ARP storm.
const MAX_FRAMES_PER_DISPATCH: usize = 128;

/// The link-layer transport a context runs on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum Transport {
    #[default]
    Ethernet,
}

/// Static configuration of a context.
#[derive(Clone, Debug)]
pub struct Config {
    /// Index of the network interface to probe on.
    pub ifindex: u32,
    /// Hardware address of that interface; used as the source of every
    /// emitted frame and to suppress our own echoes.
    pub mac: MacAddr,
    pub transport: Transport,
}

/// Notifications surfaced to the caller, in FIFO order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Probing finished without a conflict; configure the address, then
    /// call [`Acd::announce`].
    Ready { probe: ProbeId },
    /// The address is in use by another station; the probe failed.
    Used {
        probe: ProbeId,
        operation: ArpOp,
        sender: MacAddr,
    },
    /// A hard conflict was absorbed by defending the address.
    Defended {
        probe: ProbeId,
        operation: ArpOp,
        sender: MacAddr,
    },
    /// A hard conflict was fatal under the configured defense policy; the
    /// probe failed and the address must be deconfigured.
    Conflict {
        probe: ProbeId,
        operation: ArpOp,
        sender: MacAddr,
    },
    /// The link is gone; the context is preempted and every probe on it is
    /// stalled. The caller decides whether to tear them down.
    Down,
}

impl Event {
    /// The probe this event belongs to, if any.
    pub fn probe(&self) -> Option<ProbeId> {
        match self {
            Event::Ready { probe }
            | Event::Used { probe, .. }
            | Event::Defended { probe, .. }
            | Event::Conflict { probe, .. } => Some(*probe),
            Event::Down => None,
        }
    }
}

impl std::fmt::Debug for Acd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acd")
            .field("mac", &self.mac)
            .field("probes", &self.probes)
            .field("ip_index", &self.ip_index)
            .field("schedule", &self.schedule)
            .field("events", &self.events)
            .field("next_id", &self.next_id)
            .field("n_conflicts", &self.n_conflicts)
            .field("preempted", &self.preempted)
            .finish()
    }
}

/// Address conflict detection on one network interface.
pub struct Acd {
    driver: Box<dyn Driver>,
    mac: MacAddr,
    pub(crate) probes: HashMap<ProbeId, Probe>,
    /// Active probes indexed by address; duplicates are allowed and share
    /// one kernel filter entry.
    pub(crate) ip_index: HashMap<Ipv4Addr, Vec<ProbeId>>,
    /// Pending expiries, ordered by deadline.
    pub(crate) schedule: BTreeSet<(u64, ProbeId)>,
    pub(crate) events: VecDeque<Event>,
    rng: SmallRng,
    next_id: u64,
    /// Conflicts observed while probing; at `MAX_CONFLICTS` new probes are
    /// rate limited as required by RFC 5227.
    n_conflicts: u32,
    preempted: bool,
}

impl Acd {
    /// Opens the packet socket on the configured interface, installs the
    /// kernel filter and sets up timer and readiness plumbing.
    ///
    /// Needs `CAP_NET_RAW`; failing that, the error is
    /// [`std::io::ErrorKind::PermissionDenied`].
    pub fn new(config: Config) -> Result<Self, Error> {
        let Transport::Ethernet = config.transport;
        if config.ifindex == 0 || config.mac.is_null() {
            return Err(Error::InvalidArgument);
        }
        let driver = SysDriver::new(config.ifindex, config.mac)?;
        debug!(ifindex = config.ifindex, mac = %config.mac, "context up");
        Ok(Self::with_parts(
            Box::new(driver),
            config.mac,
            SmallRng::from_entropy(),
        ))
    }

    pub(crate) fn with_parts(driver: Box<dyn Driver>, mac: MacAddr, rng: SmallRng) -> Self {
        Acd {
            driver,
            mac,
            probes: HashMap::new(),
            ip_index: HashMap::new(),
            schedule: BTreeSet::new(),
            events: VecDeque::new(),
            rng,
            next_id: 0,
            n_conflicts: 0,
            preempted: false,
        }
    }

    /// The engine's monotonic clock, in microseconds.
    pub fn now(&self) -> u64 {
        self.driver.now()
    }

    /// Removes and returns the next pending event.
    pub fn pop_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Registers a new probe for `config.ip` and schedules its first
    /// transmission.
    ///
    /// Duplicate addresses are fine; concurrent probes for the same IP on
    /// the same context do not conflict with each other.
    pub fn add_probe(&mut self, config: ProbeConfig) -> Result<ProbeId, Error> {
        if self.preempted {
            return Err(Error::Preempted);
        }
        let ip = config.ip();
        if ip.is_unspecified() {
            return Err(Error::InvalidArgument);
        }

        // Guarantee filter space before any state is linked, so failure
        // here leaves the context untouched.
        let live: Vec<Ipv4Addr> = self.ip_index.keys().copied().collect();
        self.driver.filter_reserve(&live).map_err(|err| {
            warn!(%ip, %err, "cannot grow kernel filter map");
            Error::Exhausted
        })?;
        if !self.ip_index.contains_key(&ip) {
            self.driver.filter_insert(ip).map_err(|err| {
                warn!(%ip, %err, "cannot watch address in kernel filter");
                Error::Exhausted
            })?;
        }

        let id = ProbeId(self.next_id);
        self.next_id += 1;
        self.ip_index.entry(ip).or_default().push(id);

        let multiplier = config.multiplier();
        let mut probe = Probe::new(ip, multiplier);
        if multiplier == 0 {
            // No active probing requested: pretend all probes were already
            // sent and let the next timer tick emit Ready. The state
            // machine only ever advances from dispatch.
            probe.n_iteration = PROBE_NUM;
        }
        self.probes.insert(id, probe);

        if multiplier == 0 {
            self.schedule_probe(id, 0, 0);
        } else if self.n_conflicts >= MAX_CONFLICTS {
            debug!(%ip, "conflict budget spent, rate limiting probe start");
            self.schedule_probe(id, RATE_LIMIT_INTERVAL_USEC, multiplier * PROBE_WAIT_USEC);
        } else {
            self.schedule_probe(id, 0, multiplier * PROBE_WAIT_USEC);
        }

        debug!(probe = %id, %ip, multiplier, "probe registered");
        Ok(id)
    }

    /// Drops a probe: cancels its pending expiry, unlinks it from the
    /// address index and kernel filter, and evicts its unread events.
    pub fn remove_probe(&mut self, id: ProbeId) {
        let Some(probe) = self.probes.remove(&id) else {
            return;
        };
        if let Some(deadline) = probe.deadline {
            self.schedule.remove(&(deadline, id));
        }
        self.unlink_probe(id, probe.ip);
        self.events.retain(|event| event.probe() != Some(id));
        self.update_alarm();
        debug!(probe = %id, ip = %probe.ip, "probe removed");
    }

    /// Starts announcing a successfully probed address, defending it per
    /// `defend` from now on. Call this in response to [`Event::Ready`],
    /// after the address has been configured on the interface.
    pub fn announce(&mut self, id: ProbeId, defend: Defend) -> Result<(), Error> {
        let probe = self.probes.get_mut(&id).ok_or(Error::InvalidArgument)?;
        probe.state = State::Announcing;
        probe.defend = defend;
        probe.n_iteration = 0;
        // Fake zero timeout; the first announcement goes out on the next
        // dispatch, never from inside this call.
        self.schedule_probe(id, 0, 0);
        debug!(probe = %id, ?defend, "announcing");
        Ok(())
    }

    /// Attaches an opaque caller token to a probe.
    pub fn set_userdata(&mut self, id: ProbeId, data: u64) -> Result<(), Error> {
        let probe = self.probes.get_mut(&id).ok_or(Error::InvalidArgument)?;
        probe.userdata = data;
        Ok(())
    }

    /// The token previously attached with [`Acd::set_userdata`].
    pub fn userdata(&self, id: ProbeId) -> Option<u64> {
        self.probes.get(&id).map(|probe| probe.userdata)
    }

    /// Advances every due timer, then drains the socket queue.
    ///
    /// Never blocks; conflicts and lifecycle transitions are reported via
    /// the event queue, not as return values. Once the context is
    /// preempted this is a no-op.
    pub fn dispatch(&mut self) -> Result<(), Error> {
        if self.preempted {
            return Ok(());
        }
        self.driver.ack_alarm();

        // Timers strictly before packets, so one dispatch cannot advance a
        // probe from both directions at once.
        let now = self.driver.now();
        while let Some(&(deadline, id)) = self.schedule.iter().next() {
            if deadline > now || self.preempted {
                break;
            }
            self.schedule.remove(&(deadline, id));
            if let Some(probe) = self.probes.get_mut(&id) {
                probe.deadline = None;
            }
            self.probe_handle_timeout(id)?;
        }

        let mut buf = [0u8; 64];
        for _ in 0..MAX_FRAMES_PER_DISPATCH {
            if self.preempted {
                break;
            }
            match self.driver.recv_frame(&mut buf) {
                Ok(Some(len)) => {
                    if let Some(pkt) = ArpPacket::decode(&buf[..len]) {
                        self.route_packet(&pkt)?;
                    }
                }
                Ok(None) => break,
                Err(err) if is_link_down(&err) => self.raise_down(),
                Err(err) => return Err(err.into()),
            }
        }

        self.update_alarm();
        Ok(())
    }

    /// Hands a received packet to every probe interested in it.
    fn route_packet(&mut self, pkt: &ArpPacket) -> Result<(), Error> {
        if pkt.sha == self.mac {
            // The kernel filter already rejects our own echoes, but it can
            // briefly lag a program swap.
            trace!(?pkt, "own echo ignored");
            return Ok(());
        }
        // A non-zero sender address claiming a watched IP is a hard
        // conflict; a zero sender probing for a watched IP is a soft one.
        let (targets, hard) = if !pkt.spa.is_unspecified() {
            (self.ip_index.get(&pkt.spa).cloned(), true)
        } else {
            (self.ip_index.get(&pkt.tpa).cloned(), false)
        };
        for id in targets.unwrap_or_default() {
            self.probe_handle_packet(id, pkt, hard)?;
        }
        Ok(())
    }

    /// Transmits one ARP request. `spa` is absent for probe packets and
    /// equals the owned address for announcements and defenses.
    pub(crate) fn send_arp(
        &mut self,
        tpa: Ipv4Addr,
        spa: Option<Ipv4Addr>,
    ) -> Result<SendOutcome, Error> {
        let pkt = match spa {
            Some(owned) => ArpPacket::announcement(self.mac, owned),
            None => ArpPacket::probe(self.mac, tpa),
        };
        match self.driver.send_frame(&pkt.to_bytes()) {
            Ok(outcome) => {
                trace!(%tpa, ?spa, ?outcome, "arp request out");
                Ok(outcome)
            }
            Err(err) if is_link_down(&err) => {
                // The frame never left, and the link is gone with it.
                self.raise_down();
                Ok(SendOutcome::Dropped)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) fn raise(&mut self, event: Event) {
        trace!(?event, "event queued");
        self.events.push_back(event);
    }

    pub(crate) fn raise_down(&mut self) {
        if !self.preempted {
            warn!("link lost, context preempted");
            self.preempted = true;
            self.events.push_back(Event::Down);
        }
    }

    /// (Re)schedules a probe's expiry at `now + timeout`, plus a uniformly
    /// random jitter in `[0, jitter)` to decorrelate stations that power
    /// up together.
    pub(crate) fn schedule_probe(&mut self, id: ProbeId, timeout: u64, jitter: u64) {
        let mut deadline = self.driver.now() + timeout;
        if jitter > 0 {
            deadline += self.rng.gen_range(0..jitter);
        }
        let Some(probe) = self.probes.get_mut(&id) else {
            return;
        };
        let previous = probe.deadline.replace(deadline);
        if let Some(previous) = previous {
            self.schedule.remove(&(previous, id));
        }
        self.schedule.insert((deadline, id));
        self.update_alarm();
    }

    pub(crate) fn unschedule_probe(&mut self, id: ProbeId) {
        let Some(probe) = self.probes.get_mut(&id) else {
            return;
        };
        if let Some(deadline) = probe.deadline.take() {
            self.schedule.remove(&(deadline, id));
        }
        self.update_alarm();
    }

    /// Detaches a probe from the address index, dropping the kernel filter
    /// entry when the last probe for that address goes away.
    pub(crate) fn unlink_probe(&mut self, id: ProbeId, ip: Ipv4Addr) {
        let Some(ids) = self.ip_index.get_mut(&ip) else {
            return;
        };
        let Some(pos) = ids.iter().position(|other| *other == id) else {
            return;
        };
        ids.remove(pos);
        if ids.is_empty() {
            self.ip_index.remove(&ip);
            if let Err(err) = self.driver.filter_remove(ip) {
                // The entry was inserted when the address became watched,
                // so removal cannot legitimately fail.
                debug_assert!(false, "filter entry for {ip} missing: {err}");
                warn!(%ip, %err, "kernel filter out of sync");
            }
        }
    }

    pub(crate) fn remember_conflict(&mut self) {
        if self.n_conflicts < MAX_CONFLICTS {
            self.n_conflicts += 1;
        }
    }

    pub(crate) fn remember_success(&mut self) {
        self.n_conflicts = 0;
    }

    /// Keeps the kernel timer pointed at the earliest pending expiry.
    fn update_alarm(&mut self) {
        let next = self.schedule.iter().next().map(|&(deadline, _)| deadline);
        self.driver.set_alarm(next);
    }
}

impl AsRawFd for Acd {
    /// The readiness handle to integrate into the caller's poll loop; it
    /// becomes readable whenever a timer or the socket needs a
    /// [`Acd::dispatch`] call.
    fn as_raw_fd(&self) -> RawFd {
        self.driver.readiness_fd()
    }
}
