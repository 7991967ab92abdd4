//! Server-side multiplexing of section requests.
//!
//! The [`Dispatcher`] lives in the process that creates sections. Each
//! [`tick`](Dispatcher::tick) walks every registered section and every peer
//! linked to it, answers at most one request per peer, and then reorders
//! peers and sections so the ones most likely to make progress are served
//! first next time:
//!
//! - within a section, the lock owner's peer goes first, then peers by
//!   descending [`DispatchPriority`];
//! - sections holding an owner-peer go first, then sections with more peers
//!   at higher priority levels, then sections with more peers.
//!
//! Both sorts are stable. A forked child inherits a copy of the dispatcher
//! and switches it to [`Role::Client`], which turns `tick` into a no-op.

use crate::observability::{DispatchTimer, record_active_peers, span_dispatch};
use crate::process::{Pid, current_pid, is_alive};
use crate::section::{DispatchPriority, PeerContext, SectionCore, SectionId};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

/// Whether this process serves sections or only talks to a server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Serves the sections it created.
    Server,
    /// Forked peer; never dispatches.
    Client,
}

/// How long a tick may wait on a quiet peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchMode {
    /// Skip peers with nothing pending.
    NonBlocking,
    /// Wait on each peer for a load-dependent slice.
    Blocking,
}

/// Registry of sections created by this process and their request loop.
#[derive(Debug)]
pub struct Dispatcher {
    role: Role,
    sections: Vec<Weak<Mutex<SectionCore>>>,
    departed: HashSet<Pid>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_core(core: &Mutex<SectionCore>) -> MutexGuard<'_, SectionCore> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Dispatcher {
    /// Create an empty dispatcher in the server role.
    pub fn new() -> Self {
        Self {
            role: Role::Server,
            sections: Vec::new(),
            departed: HashSet::new(),
        }
    }

    /// Current role.
    pub fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn register(&mut self, core: Weak<Mutex<SectionCore>>) {
        self.sections.push(core);
    }

    /// Switch to the client role. Called in a freshly forked child.
    pub fn become_client(&mut self) {
        self.role = Role::Client;
        self.departed.clear();
    }

    /// Mark a peer process as exited; it is dropped on the next tick.
    pub fn mark_departed(&mut self, pid: Pid) {
        self.departed.insert(pid);
    }

    fn live_sections(&mut self) -> Vec<Arc<Mutex<SectionCore>>> {
        self.sections.retain(|weak| weak.strong_count() > 0);
        self.sections.iter().filter_map(Weak::upgrade).collect()
    }

    /// Number of sections still alive.
    pub fn section_count(&self) -> usize {
        self.sections
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Number of peers across all live sections.
    pub fn peer_count(&self) -> usize {
        self.sections
            .iter()
            .filter_map(Weak::upgrade)
            .map(|core| lock_core(&core).peers.len())
            .sum()
    }

    /// Live sections in current dispatch order.
    pub fn section_order(&self) -> Vec<SectionId> {
        self.sections
            .iter()
            .filter_map(Weak::upgrade)
            .map(|core| lock_core(&core).id)
            .collect()
    }

    /// Run one dispatch pass. Returns the number of requests answered.
    pub fn tick(&mut self, mode: DispatchMode) -> usize {
        if self.role == Role::Client {
            return 0;
        }

        let sections = self.live_sections();
        let _timer = DispatchTimer::start();
        let span = span_dispatch(mode == DispatchMode::Blocking, sections.len());
        let _guard = span.enter();

        let me = current_pid();
        let mut total_peers = 0;
        for core in &sections {
            let core = lock_core(core);
            for peer in &core.peers {
                if !is_alive(peer.pid) {
                    self.departed.insert(peer.pid);
                }
            }
            total_peers += core.peers.len();
        }

        let mut served = 0;
        let mut ranked = Vec::with_capacity(sections.len());
        for core in sections {
            let summary = {
                let mut guard = lock_core(&core);
                let slice = guard.config.slice_for(total_peers);
                served += service_section(&mut guard, mode, slice, &self.departed, me);
                SectionSummary::of(&guard)
            };
            ranked.push((summary, core));
        }

        ranked.sort_by(|(a, _), (b, _)| a.cmp_dispatch_order(b));
        self.sections = ranked.iter().map(|(_, core)| Arc::downgrade(core)).collect();
        self.departed.clear();

        let peers: usize = ranked.iter().map(|(summary, _)| summary.peers).sum();
        record_active_peers(peers);
        if served > 0 {
            tracing::trace!(served, peers, "dispatch tick");
        }
        served
    }
}

/// Drop peers that exited or whose link broke.
fn prune_peers(core: &mut SectionCore, departed: &HashSet<Pid>) {
    let SectionCore {
        id,
        peers,
        authority,
        ..
    } = core;
    peers.retain(|peer| {
        let keep = !departed.contains(&peer.pid) && !peer.link.is_broken();
        if !keep {
            tracing::debug!(section = %id, peer = peer.pid, thread = %peer.thread, "removing peer from dispatch");
            authority.record_peer_removed();
        }
        keep
    });
}

fn service_section(
    core: &mut SectionCore,
    mode: DispatchMode,
    slice: Duration,
    departed: &HashSet<Pid>,
    me: Pid,
) -> usize {
    prune_peers(core, departed);

    let receive_timeout = match mode {
        DispatchMode::NonBlocking => core.config.receive_timeout,
        DispatchMode::Blocking => slice,
    };

    let mut served = 0;
    let SectionCore {
        id,
        peers,
        authority,
        ..
    } = &mut *core;
    for peer in peers.iter_mut() {
        if mode == DispatchMode::NonBlocking && !peer.link.is_data_available() {
            peer.priority = DispatchPriority::Idle;
            continue;
        }

        match peer.link.try_receive(receive_timeout) {
            Ok(Some(frame)) => {
                if authority.serve(me, peer, frame) {
                    served += 1;
                }
            }
            Ok(None) => peer.priority = DispatchPriority::Idle,
            Err(e) => {
                tracing::debug!(section = %id, peer = peer.pid, error = %e, "receive failed");
                peer.priority = DispatchPriority::Idle;
            }
        }
    }

    prune_peers(core, departed);
    sort_peers(&mut core.peers, core.authority.owner);
    served
}

/// Owner's peer first, then by descending priority. Stable.
fn sort_peers(peers: &mut [PeerContext], owner: Option<Pid>) {
    peers.sort_by(|a, b| {
        let a_owner = owner == Some(a.pid);
        let b_owner = owner == Some(b.pid);
        b_owner
            .cmp(&a_owner)
            .then_with(|| b.priority.cmp(&a.priority))
    });
}

/// Ordering key of a section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SectionSummary {
    holds_owner: bool,
    /// Peer counts per priority level, highest level first.
    histogram: [usize; 3],
    peers: usize,
}

impl SectionSummary {
    fn of(core: &SectionCore) -> Self {
        let owner = core.authority.owner;
        let mut histogram = [0; 3];
        for peer in &core.peers {
            if let Some(level) = DispatchPriority::DESCENDING
                .iter()
                .position(|p| *p == peer.priority)
            {
                histogram[level] += 1;
            }
        }
        Self {
            holds_owner: core.peers.iter().any(|peer| owner == Some(peer.pid)),
            histogram,
            peers: core.peers.len(),
        }
    }

    /// `Less` means `self` is dispatched before `other`.
    fn cmp_dispatch_order(&self, other: &Self) -> Ordering {
        other
            .holds_owner
            .cmp(&self.holds_owner)
            .then_with(|| (other.peers > 0).cmp(&(self.peers > 0)))
            .then_with(|| other.histogram.cmp(&self.histogram))
            .then_with(|| other.peers.cmp(&self.peers))
    }
}
