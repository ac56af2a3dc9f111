//! The per-address RFC 5227 state machine.
//!
//! The RFC fixes its durations in seconds: 1 s PROBE_WAIT, 1-3 s between
//! probes, 2 s ANNOUNCE_WAIT, for a worst case of nine seconds before an
//! address may be used. That is far beyond what today's links need, so the
//! durations below are the RFC values divided by 9000 and every probe
//! carries a caller-chosen multiplier instead: a multiplier of 9000
//! reproduces the RFC timing exactly, and around 100 is a sensible default
//! for wired and wireless links where round trips stay below a few
//! milliseconds. Only the announcement cadence is pinned to the RFC clock,
//! because by then the address is in use and timing is no longer latency
//! critical.

use std::fmt;
use std::net::Ipv4Addr;

use tracing::{debug, warn};

use crate::arp::ArpPacket;
use crate::context::{Acd, Event};
use crate::sys::SendOutcome;
use crate::Error;

/// Timeout multiplier reproducing the durations mandated by RFC 5227.
pub const TIMEOUT_RFC5227: u64 = 9000;

pub(crate) const PROBE_NUM: u64 = 3;
pub(crate) const PROBE_WAIT_USEC: u64 = 111;
pub(crate) const PROBE_MIN_USEC: u64 = 111;
pub(crate) const PROBE_MAX_USEC: u64 = 333;
pub(crate) const ANNOUNCE_NUM: u64 = 3;
pub(crate) const ANNOUNCE_WAIT_USEC: u64 = 222;
pub(crate) const ANNOUNCE_INTERVAL_USEC: u64 = 222;
pub(crate) const MAX_CONFLICTS: u32 = 10;
pub(crate) const RATE_LIMIT_INTERVAL_USEC: u64 = 60_000_000;
pub(crate) const DEFEND_INTERVAL_USEC: u64 = 10_000_000;

/// Handle of one probe within its context. Never reused, so a stale id in
/// a late event cannot alias a newer probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProbeId(pub(crate) u64);

impl fmt::Display for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What to do about hard conflicts once the address is announced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Defend {
    /// Give up on the first hard conflict.
    Never,
    /// Defend once; give up if another hard conflict arrives within
    /// `DEFEND_INTERVAL`.
    Once,
    /// Keep the address no matter what, defending at most once per
    /// `DEFEND_INTERVAL`.
    Always,
}

/// Parameters of one conflict-detection run.
#[derive(Clone, Debug)]
pub struct ProbeConfig {
    ip: Ipv4Addr,
    timeout_ms: u64,
}

impl ProbeConfig {
    pub fn new(ip: Ipv4Addr) -> Self {
        ProbeConfig {
            ip,
            timeout_ms: TIMEOUT_RFC5227,
        }
    }

    /// Total time budget from creation to the first announcement, which
    /// doubles as the multiplier for all probing intervals. Zero disables
    /// active probing: the probe reports `Ready` on the next dispatch
    /// without touching the wire.
    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub(crate) fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub(crate) fn multiplier(&self) -> u64 {
        self.timeout_ms
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    /// Sending probes and listening for anyone else claiming the address.
    Probing,
    /// `Ready` was delivered; waiting for the caller to configure the
    /// address and call announce.
    Configuring,
    /// Announcing and then passively defending the configured address.
    Announcing,
    /// Terminal; the caller is expected to remove the probe.
    Failed,
}

#[derive(Debug)]
pub(crate) struct Probe {
    pub ip: Ipv4Addr,
    pub timeout_multiplier: u64,
    pub state: State,
    pub n_iteration: u64,
    pub defend: Defend,
    /// Timestamp of the last defensive transmission window.
    pub last_defend: Option<u64>,
    /// Pending expiry, mirrored in the context schedule.
    pub deadline: Option<u64>,
    pub userdata: u64,
}

impl Probe {
    pub fn new(ip: Ipv4Addr, timeout_multiplier: u64) -> Self {
        Probe {
            ip,
            timeout_multiplier,
            state: State::Probing,
            n_iteration: 0,
            defend: Defend::Never,
            last_defend: None,
            deadline: None,
            userdata: 0,
        }
    }
}

impl Acd {
    /// Advances a probe whose timer expired.
    pub(crate) fn probe_handle_timeout(&mut self, id: ProbeId) -> Result<(), Error> {
        let Some(probe) = self.probes.get(&id) else {
            return Ok(());
        };
        let ip = probe.ip;
        let multiplier = probe.timeout_multiplier;
        let state = probe.state;
        let mut iteration = probe.n_iteration;

        match state {
            State::Probing => {
                if iteration < PROBE_NUM {
                    if self.send_arp(ip, None)? == SendOutcome::Sent {
                        iteration += 1;
                        if let Some(probe) = self.probes.get_mut(&id) {
                            probe.n_iteration = iteration;
                        }
                    }
                    // A dropped frame never reached the wire; leaving the
                    // counter alone and rescheduling stretches the current
                    // interval instead of skipping a probe.
                    if iteration < PROBE_NUM {
                        self.schedule_probe(
                            id,
                            multiplier * PROBE_MIN_USEC,
                            multiplier * (PROBE_MAX_USEC - PROBE_MIN_USEC),
                        );
                    } else {
                        self.schedule_probe(id, multiplier * ANNOUNCE_WAIT_USEC, 0);
                    }
                } else {
                    // The quiet period elapsed. The address is usable, but
                    // announcements wait until the caller has configured it
                    // and can answer queries for it.
                    self.remember_success();
                    self.raise(Event::Ready { probe: id });
                    if let Some(probe) = self.probes.get_mut(&id) {
                        probe.state = State::Configuring;
                    }
                    debug!(probe = %id, %ip, "address ready");
                }
            }
            State::Announcing => {
                if self.send_arp(ip, Some(ip))? == SendOutcome::Sent {
                    iteration += 1;
                    if let Some(probe) = self.probes.get_mut(&id) {
                        probe.n_iteration = iteration;
                    }
                }
                if iteration < ANNOUNCE_NUM {
                    // Announcement cadence follows the RFC clock, not the
                    // caller multiplier (which may even be zero).
                    self.schedule_probe(id, TIMEOUT_RFC5227 * ANNOUNCE_INTERVAL_USEC, 0);
                }
                // After the last announcement the probe listens passively;
                // no further timer exists.
            }
            State::Configuring | State::Failed => {
                debug_assert!(false, "timeout fired in {state:?}");
                warn!(probe = %id, ?state, "spurious timeout");
            }
        }
        Ok(())
    }

    /// Feeds a conflicting packet to a probe. `hard_conflict` is set when
    /// the sender claims the address as its own rather than probing for it.
    pub(crate) fn probe_handle_packet(
        &mut self,
        id: ProbeId,
        pkt: &ArpPacket,
        hard_conflict: bool,
    ) -> Result<(), Error> {
        let Some(probe) = self.probes.get(&id) else {
            return Ok(());
        };
        let ip = probe.ip;
        let state = probe.state;
        let defend = probe.defend;
        let last_defend = probe.last_defend;
        let now = self.now();

        match state {
            State::Probing => {
                // Soft or hard, any contention while probing means the
                // address is not ours to take.
                self.remember_conflict();
                self.raise(Event::Used {
                    probe: id,
                    operation: pkt.op,
                    sender: pkt.sha,
                });
                self.fail_probe(id, ip);
                debug!(probe = %id, %ip, sender = %pkt.sha, "address in use");
            }
            State::Configuring => {
                // The caller may already be using the address even though
                // it has not announced yet; neither a conflict report nor a
                // defense would be safe here. Drop the packet and let the
                // announcement run see any real conflict again.
            }
            State::Announcing => {
                if !hard_conflict {
                    // Peers still probing will see our announcements and
                    // back off; nothing to do.
                    return Ok(());
                }
                let rate_limited =
                    last_defend.map_or(false, |t| now < t + DEFEND_INTERVAL_USEC);
                let mut conflict = false;
                match defend {
                    Defend::Never => conflict = true,
                    Defend::Once if rate_limited => conflict = true,
                    Defend::Once | Defend::Always => {
                        if !rate_limited {
                            match self.send_arp(ip, Some(ip))? {
                                SendOutcome::Sent => {
                                    if let Some(probe) = self.probes.get_mut(&id) {
                                        probe.last_defend = Some(now);
                                    }
                                }
                                SendOutcome::Dropped => {
                                    if defend == Defend::Once {
                                        // The one defense we were allowed
                                        // never made it out.
                                        conflict = true;
                                    } else if let Some(probe) = self.probes.get_mut(&id) {
                                        probe.last_defend = Some(now);
                                    }
                                }
                            }
                        }
                        if !conflict {
                            self.raise(Event::Defended {
                                probe: id,
                                operation: pkt.op,
                                sender: pkt.sha,
                            });
                            debug!(probe = %id, %ip, sender = %pkt.sha, "defended address");
                        }
                    }
                }
                if conflict {
                    self.raise(Event::Conflict {
                        probe: id,
                        operation: pkt.op,
                        sender: pkt.sha,
                    });
                    self.fail_probe(id, ip);
                    debug!(probe = %id, %ip, sender = %pkt.sha, "lost address");
                }
            }
            State::Failed => {
                // Failed probes are unlinked from the address index, so
                // the dispatcher cannot route packets here.
                debug_assert!(false, "packet delivered to failed probe");
            }
        }
        Ok(())
    }

    fn fail_probe(&mut self, id: ProbeId, ip: Ipv4Addr) {
        self.unschedule_probe(id);
        self.unlink_probe(id, ip);
        if let Some(probe) = self.probes.get_mut(&id) {
            probe.state = State::Failed;
        }
    }
}
