//! IPv4 address conflict detection for Linux, per RFC 5227.
//!
//! Before a host assigns itself an IPv4 address it should verify that no
//! other station on the link is using it, and afterwards it should notice
//! and react when another station starts using it anyway. This crate
//! implements both halves on top of a raw `AF_PACKET` socket:
//!
//! - An [`Acd`] context owns the socket, a kernel eBPF prefilter, a
//!   monotonic timer and an event queue for one network interface.
//! - Any number of probes run on one context, each a small state machine
//!   walking through probing, announcing and defending a single address.
//!
//! The engine is single threaded and externally driven. It never blocks:
//! the caller polls the context's readiness fd, calls [`Acd::dispatch`]
//! when it fires and drains [`Acd::pop_event`]. A typical run looks like:
//!
//! - create the context and a probe for the candidate address;
//! - wait for [`Event::Ready`], then configure the address on the
//!   interface and call [`Acd::announce`] with a [`Defend`] policy;
//! - keep dispatching; [`Event::Defended`] means a conflict was absorbed,
//!   [`Event::Used`] and [`Event::Conflict`] mean the address is lost.
//!
//! Probing a `/24`'s worth of addresses concurrently is fine: all probes
//! share the one socket, and the kernel filter discards ARP traffic for
//! addresses nobody is watching before it ever crosses into userspace.

mod arp;
mod bpf;
mod context;
mod probe;
mod sys;
#[cfg(test)]
mod test_support;

pub use arp::{ArpOp, MacAddr};
pub use context::{Acd, Config, Event, Transport};
pub use probe::{Defend, ProbeConfig, ProbeId, TIMEOUT_RFC5227};

/// Errors surfaced by context and probe operations.
///
/// Protocol outcomes (conflicts, lost addresses, link loss) are reported
/// as [`Event`]s, never as errors; errors mean the operation itself could
/// not be carried out.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A parameter was rejected: zero interface index, null hardware
    /// address, the unspecified IPv4 address, or an unknown probe handle.
    #[error("invalid argument")]
    InvalidArgument,
    /// The kernel filter map could not accommodate another address.
    #[error("kernel filter resources exhausted")]
    Exhausted,
    /// The link went away; the context emitted [`Event::Down`] and stopped
    /// doing work.
    #[error("context preempted after link loss")]
    Preempted,
    /// An unforeseen system failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
