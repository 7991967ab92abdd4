//! Critical sections: a cross-process mutex with shared key/value state.
//!
//! A [`SharedSection`] is created in the process that will act as its server
//! (the *creator*). Forked peers reach it over one [`Link`] each. The
//! creator's copy of the lock owner and of the [`ResourceStore`] is
//! authoritative; a peer's copy is a cache refreshed by reads and by the
//! snapshot pulled on every lock acquisition.
//!
//! # Lock protocol
//!
//! ```text
//!   peer                          creator (dispatcher)
//!    | -- LOCKSYN --------------->  |  unowned, own, or owner dead?
//!    | <------------- LOCKACK ----  |  owner := peer
//!    | -- READALLSYN ------------>  |
//!    | <---- READALLACK(snapshot)-  |
//!    |        ... reads/writes ...  |
//!    | -- UNLOCKSYN ------------->  |
//!    | <----------- UNLOCKACK ----  |  owner := none
//! ```
//!
//! In the creator itself `lock`/`unlock` are purely local and skip all
//! contention checks.

use crate::codec::{Frame, Opcode, Request, Store};
use crate::config::SectionConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::link::Link;
use crate::observability::{SectionMetrics, span_section, trace_lock_change};
use crate::process::{Pid, current_pid, is_alive};
use crate::store::ResourceStore;
use crate::thread::ThreadId;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

static NEXT_SECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a section.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionId(u64);

impl SectionId {
    fn next() -> Self {
        Self(NEXT_SECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw id, e.g. one parsed from a pipe name.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dispatch ordering hint recorded per peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DispatchPriority {
    /// No interaction in the last tick.
    #[default]
    Idle = 0,
    /// A request was seen but the exchange did not complete.
    Pending = 1,
    /// A state-changing exchange just completed; a follow-up is likely.
    Hot = 2,
}

impl DispatchPriority {
    /// All levels, highest first.
    pub const DESCENDING: [DispatchPriority; 3] = [
        DispatchPriority::Hot,
        DispatchPriority::Pending,
        DispatchPriority::Idle,
    ];
}

/// Lock state as seen by the calling process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    /// Nobody holds the lock.
    Unlocked,
    /// A lock request is in flight.
    ///
    /// Only visible to other threads of the requesting process: the thread
    /// calling [`SharedSection::lock`] is blocked until the exchange ends.
    LockPending,
    /// The lock is held by this process.
    Locked(Pid),
}

/// Server-side context of one connected peer.
#[derive(Debug)]
pub struct PeerContext {
    /// Thread handle that forked the peer.
    pub thread: ThreadId,
    /// Peer process.
    pub pid: Pid,
    /// Connection to the peer.
    pub link: Link,
    /// Ordering hint for the next dispatch pass.
    pub priority: DispatchPriority,
}

impl PeerContext {
    pub(crate) fn new(thread: ThreadId, pid: Pid, link: Link) -> Self {
        Self {
            thread,
            pid,
            link,
            priority: DispatchPriority::Idle,
        }
    }
}

/// What an accepted request does to the authoritative state.
#[derive(Debug, PartialEq, Eq)]
enum Effect {
    None,
    Acquire(Pid),
    Release,
    Insert(Store, String, Vec<u8>),
    Remove(Store, String),
}

/// Server decision for one request.
#[derive(Debug)]
struct Verdict {
    request: Opcode,
    reply: Frame,
    accepted: bool,
    effect: Effect,
}

/// Lock owner plus store: authoritative in the creator, a cache elsewhere.
#[derive(Debug)]
pub(crate) struct Authority {
    pub(crate) owner: Option<Pid>,
    pub(crate) store: ResourceStore,
    metrics: SectionMetrics,
    section: SectionId,
}

impl Authority {
    fn new(section: SectionId) -> Self {
        Self {
            owner: None,
            store: ResourceStore::new(),
            metrics: SectionMetrics::new(section),
            section,
        }
    }

    fn set_owner(&mut self, owner: Option<Pid>) {
        if self.owner != owner {
            trace_lock_change(self.section, self.owner, owner);
            self.owner = owner;
        }
    }

    fn owned_by(&self, pid: Pid) -> bool {
        self.owner == Some(pid)
    }

    /// Whether `sender` may take or release the lock.
    fn lock_available_to(&self, sender: Pid) -> bool {
        match self.owner {
            None => true,
            Some(owner) => owner == sender || !is_alive(owner),
        }
    }

    fn decide(&self, me: Pid, request: Request, sender: Pid) -> Verdict {
        let opcode = request.opcode();
        let reply = |accepted: bool| Frame::new(if accepted { opcode.ack() } else { opcode.nack() }, me);
        let gate = |store: Store| store == Store::Unreliable || self.owned_by(sender);

        let (accepted, reply, effect) = match request {
            Request::Lock => {
                let ok = self.lock_available_to(sender);
                (ok, reply(ok), Effect::Acquire(sender))
            }
            Request::Unlock => {
                let ok = self.lock_available_to(sender);
                (ok, reply(ok), Effect::Release)
            }
            Request::AddOrUpdate { store, name, value } => {
                let ok = gate(store);
                let frame = if ok { reply(true).with_name(name.clone()) } else { reply(false) };
                (ok, frame, Effect::Insert(store, name, value))
            }
            Request::Erase { store, name } => {
                let ok = gate(store);
                let frame = if ok { reply(true).with_name(name.clone()) } else { reply(false) };
                (ok, frame, Effect::Remove(store, name))
            }
            Request::Read { store, name } => {
                if !gate(store) {
                    (false, reply(false), Effect::None)
                } else {
                    // The name is echoed only when the resource exists.
                    let frame = match self.store.get(store, &name) {
                        Some(value) => reply(true).with_name(name).with_value(value),
                        None => reply(true),
                    };
                    (true, frame, Effect::None)
                }
            }
            Request::ReadAll => {
                if !self.owned_by(sender) {
                    (false, reply(false), Effect::None)
                } else {
                    match self.store.to_snapshot() {
                        Ok(snapshot) => (true, reply(true).with_value(snapshot), Effect::None),
                        Err(e) => {
                            tracing::warn!(section = %self.section, error = %e, "snapshot failed");
                            (false, reply(false), Effect::None)
                        }
                    }
                }
            }
        };

        Verdict {
            request: opcode,
            reply,
            accepted,
            effect,
        }
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::None => {}
            Effect::Acquire(pid) => self.set_owner(Some(pid)),
            Effect::Release => self.set_owner(None),
            Effect::Insert(store, name, value) => self.store.insert(store, name, value),
            Effect::Remove(store, name) => {
                self.store.remove(store, &name);
            }
        }
    }

    /// Answer one request from `peer`.
    ///
    /// The effect of an accepted request is applied only after its ACK was
    /// delivered. A request that cannot be decoded is refused with its NACK;
    /// a stray reply is dropped. Returns `false` if the reply could not be
    /// sent.
    pub(crate) fn serve(&mut self, me: Pid, peer: &mut PeerContext, frame: Frame) -> bool {
        let sender = frame.sender;
        let opcode = frame.opcode;
        peer.priority = DispatchPriority::Pending;

        let request = match Request::from_frame(frame) {
            Ok(request) => request,
            Err(e) if opcode.is_request() => {
                tracing::warn!(section = %self.section, peer = peer.pid, error = %e, "refusing malformed request");
                self.metrics.record_served(opcode, false);
                return peer.link.send_frame(&Frame::new(opcode.nack(), me));
            }
            Err(e) => {
                tracing::warn!(section = %self.section, peer = peer.pid, error = %e, "ignoring unexpected reply");
                return true;
            }
        };

        let verdict = self.decide(me, request, sender);
        self.metrics.record_served(verdict.request, verdict.accepted);

        if !peer.link.send_frame(&verdict.reply) {
            return false;
        }
        if verdict.accepted {
            let released = verdict.effect == Effect::Release;
            self.apply(verdict.effect);
            peer.priority = if released {
                DispatchPriority::Idle
            } else {
                DispatchPriority::Hot
            };
        }
        true
    }

    pub(crate) fn record_peer_removed(&self) {
        self.metrics.record_peer_removed();
    }
}

/// State behind a [`SharedSection`] handle.
#[derive(Debug)]
pub(crate) struct SectionCore {
    pub(crate) id: SectionId,
    pub(crate) config: SectionConfig,
    pub(crate) creator: Pid,
    pub(crate) authority: Authority,
    pub(crate) peers: Vec<PeerContext>,
    upstream: Option<Link>,
}

impl SectionCore {
    fn is_creator(&self) -> bool {
        current_pid() == self.creator
    }

    fn upstream_broken(&self) -> bool {
        self.upstream.as_ref().is_none_or(Link::is_broken)
    }

    /// Send one request to the creator and wait for its ACK or NACK.
    fn round_trip(&self, request: Request) -> Result<Frame> {
        let link = self
            .upstream
            .as_ref()
            .ok_or(Error::LinkBroken(self.creator))?;
        let opcode = request.opcode();

        if !link.send_frame(&request.into_frame(current_pid())) {
            return Err(if link.is_broken() {
                Error::LinkBroken(self.creator)
            } else {
                Error::OperationTimeout
            });
        }

        let reply = link.receive_operation()?;
        if reply.opcode != opcode.ack() && reply.opcode != opcode.nack() {
            return Err(Error::InvalidFrame(format!(
                "expected reply to {opcode}, got {}",
                reply.opcode
            )));
        }
        Ok(reply)
    }

    /// Pull the creator's full state after a lock grant.
    fn pull_snapshot(&mut self) -> Result<()> {
        let reply = self.round_trip(Request::ReadAll)?;
        if reply.opcode != Opcode::ReadAllAck {
            return Err(Error::NotOwned(self.id));
        }
        self.authority.store = ResourceStore::from_snapshot(&reply.value)?;
        Ok(())
    }

    /// Round-trip a request whose ACK carries no data. Transport failures
    /// become `false`.
    fn acknowledged(&self, request: Request) -> bool {
        let opcode = request.opcode();
        match self.round_trip(request) {
            Ok(reply) => reply.opcode == opcode.ack(),
            Err(e) => {
                tracing::debug!(section = %self.id, %opcode, error = %e, "request failed");
                false
            }
        }
    }

    fn read(&mut self, store: Store, name: &str) -> Result<Option<Vec<u8>>> {
        // An empty name cannot be put on the wire; nothing is ever stored under it.
        if name.is_empty() {
            return Ok(None);
        }
        if self.is_creator() {
            return Ok(self.authority.store.get(store, name).map(<[u8]>::to_vec));
        }

        let reply = self.round_trip(Request::Read {
            store,
            name: name.to_owned(),
        })?;
        if reply.opcode == Opcode::ReadNack {
            return Err(Error::NotOwned(self.id));
        }
        if reply.opcode == Opcode::UnrelReadNack {
            return Err(Error::OperationTimeout);
        }

        let value = reply.name.is_some().then_some(reply.value);
        self.authority.store.refresh(store, name, value.clone());
        Ok(value)
    }
}

/// Handle to a critical section. Clones share the same section.
///
/// # Example
///
/// ```rust,ignore
/// use forksync::prelude::*;
///
/// let mut dispatcher = Dispatcher::new();
/// let section = SharedSection::new(&mut dispatcher, SectionConfig::from_env());
///
/// let mut worker = ThreadHandle::new(vec![section.clone()]);
/// let body_section = section.clone();
/// worker.start(&mut dispatcher, move || {
///     body_section.lock(true);
///     body_section.add_or_update("answer", b"42".to_vec()).ok();
///     body_section.unlock(true);
///     0
/// })?;
/// worker.join(&mut dispatcher);
///
/// assert_eq!(section.get_fast("answer"), Some(b"42".to_vec()));
/// ```
#[derive(Clone, Debug)]
pub struct SharedSection {
    core: Arc<Mutex<SectionCore>>,
    /// Set while a lock request is in flight. Kept outside the core mutex,
    /// which the requesting thread holds for the whole exchange.
    pending: Arc<AtomicBool>,
}

impl SharedSection {
    /// Create a section served by the calling process and register it.
    pub fn new(dispatcher: &mut Dispatcher, config: SectionConfig) -> Self {
        let id = SectionId::next();
        let core = Arc::new(Mutex::new(SectionCore {
            id,
            config,
            creator: current_pid(),
            authority: Authority::new(id),
            peers: Vec::new(),
            upstream: None,
        }));
        dispatcher.register(Arc::downgrade(&core));
        tracing::debug!(section = %id, "section created");
        Self {
            core,
            pending: Arc::new(AtomicBool::new(false)),
        }
    }

    fn core(&self) -> MutexGuard<'_, SectionCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn with_core<R>(&self, f: impl FnOnce(&mut SectionCore) -> R) -> R {
        f(&mut self.core())
    }

    /// Section identifier.
    pub fn id(&self) -> SectionId {
        self.core().id
    }

    /// Process serving this section.
    pub fn creator(&self) -> Pid {
        self.core().creator
    }

    /// Configuration the section was created with.
    pub fn config(&self) -> SectionConfig {
        self.core().config.clone()
    }

    /// Number of peers connected to the creator.
    pub fn peer_count(&self) -> usize {
        self.core().peers.len()
    }

    /// Lock state from this process's point of view.
    pub fn state(&self) -> LockState {
        if self.pending.load(Ordering::Acquire) {
            return LockState::LockPending;
        }
        match self.core().authority.owner {
            Some(pid) => LockState::Locked(pid),
            None => LockState::Unlocked,
        }
    }

    /// Connect the section for a freshly forked peer.
    ///
    /// Called in both processes after the fork. The creator opens its end of
    /// the link and registers the peer for dispatch; the child drops
    /// everything it inherited and opens its own link to the creator.
    pub fn initialize(&self, peer: Pid, thread: ThreadId) -> bool {
        let mut core = self.core();
        let id = core.id;

        if core.is_creator() {
            match Link::establish(&core.config, id, peer, true) {
                Ok(link) => {
                    core.peers.push(PeerContext::new(thread, peer, link));
                    true
                }
                Err(e) => {
                    tracing::warn!(section = %id, peer, error = %e, "failed to link peer");
                    false
                }
            }
        } else {
            // Inherited descriptors belong to the creator's side.
            core.peers.clear();
            core.upstream = None;
            self.pending.store(false, Ordering::Release);
            core.authority.owner = None;

            let creator = core.creator;
            match Link::establish(&core.config, id, creator, false) {
                Ok(link) => {
                    core.upstream = Some(link);
                    true
                }
                Err(e) => {
                    tracing::warn!(section = %id, creator, error = %e, "failed to link creator");
                    false
                }
            }
        }
    }

    /// Forget the peer forked by `thread`. Returns `true` if it was known.
    pub fn finalize(&self, thread: ThreadId) -> bool {
        let mut core = self.core();
        let before = core.peers.len();
        core.peers.retain(|peer| peer.thread != thread);
        let removed = core.peers.len() != before;
        if removed {
            tracing::debug!(section = %core.id, thread = %thread, "peer finalized");
        }
        removed
    }

    /// Acquire the lock.
    ///
    /// Re-entrant: returns `true` at once if this process already owns it.
    /// With `blocking`, retries after each refusal until the lock is granted
    /// or the creator dies.
    pub fn lock(&self, blocking: bool) -> bool {
        let mut core = self.core();
        let me = current_pid();
        let _span = span_section(core.id, me).entered();

        if core.authority.owned_by(me) {
            return true;
        }
        if core.is_creator() {
            core.authority.set_owner(Some(me));
            return true;
        }

        self.pending.store(true, Ordering::Release);
        let granted = loop {
            match core.round_trip(Request::Lock) {
                Ok(reply) if reply.opcode == Opcode::LockAck => break true,
                Ok(_) => {}
                Err(e) => tracing::debug!(section = %core.id, error = %e, "lock request failed"),
            }
            if !blocking || core.upstream_broken() {
                break false;
            }
            core.config.io_backoff.sleep();
        };
        self.pending.store(false, Ordering::Release);

        if !granted {
            return false;
        }
        core.authority.set_owner(Some(me));

        if let Err(e) = core.pull_snapshot() {
            tracing::warn!(section = %core.id, error = %e, "snapshot after lock failed, releasing");
            if core.acknowledged(Request::Unlock) {
                core.authority.set_owner(None);
            }
            return false;
        }
        true
    }

    /// Release the lock.
    ///
    /// Fails if another process owns it. With `blocking`, a refused release
    /// is retried until granted or the creator dies.
    pub fn unlock(&self, blocking: bool) -> bool {
        let mut core = self.core();
        let me = current_pid();

        if core.authority.owner.is_some_and(|owner| owner != me) {
            return false;
        }
        if core.is_creator() {
            core.authority.set_owner(None);
            return true;
        }

        loop {
            if core.acknowledged(Request::Unlock) {
                core.authority.set_owner(None);
                return true;
            }
            if !blocking || core.upstream_broken() {
                return false;
            }
            core.config.io_backoff.sleep();
        }
    }

    /// Insert or overwrite a reliable resource. Requires the lock.
    ///
    /// `Ok(false)` means the creator refused or could not be reached.
    pub fn add_or_update(&self, name: &str, value: Vec<u8>) -> Result<bool> {
        let mut core = self.core();
        if !core.authority.owned_by(current_pid()) {
            return Err(Error::NotOwned(core.id));
        }
        if name.is_empty() {
            return Ok(false);
        }
        Ok(update(&mut core, Store::Reliable, name, value))
    }

    /// Remove a reliable resource. Requires the lock.
    ///
    /// `Ok(false)` if the resource is not in the local view or the creator
    /// refused.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let mut core = self.core();
        if !core.authority.owned_by(current_pid()) {
            return Err(Error::NotOwned(core.id));
        }
        Ok(erase(&mut core, Store::Reliable, name))
    }

    /// Insert or overwrite an unreliable resource. Never needs the lock.
    pub fn add_or_update_unreliable(&self, name: &str, value: Vec<u8>) -> bool {
        if name.is_empty() {
            return false;
        }
        update(&mut self.core(), Store::Unreliable, name, value)
    }

    /// Remove an unreliable resource present in the local view.
    pub fn remove_unreliable(&self, name: &str) -> bool {
        erase(&mut self.core(), Store::Unreliable, name)
    }

    /// Cached reliable value. May be stale.
    pub fn get_fast(&self, name: &str) -> Option<Vec<u8>> {
        self.core()
            .authority
            .store
            .get(Store::Reliable, name)
            .map(<[u8]>::to_vec)
    }

    /// Cached unreliable value. May be stale.
    pub fn get_unreliable_fast(&self, name: &str) -> Option<Vec<u8>> {
        self.core()
            .authority
            .store
            .get(Store::Unreliable, name)
            .map(<[u8]>::to_vec)
    }

    /// Authoritative reliable value. Requires the lock.
    ///
    /// `Ok(None)` means the resource does not exist.
    pub fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let mut core = self.core();
        if !core.authority.owned_by(current_pid()) {
            return Err(Error::NotOwned(core.id));
        }
        core.read(Store::Reliable, name)
    }

    /// Authoritative unreliable value.
    pub fn get_unreliable(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.core().read(Store::Unreliable, name)
    }

    /// Names in the local reliable view.
    pub fn resource_names(&self) -> Vec<String> {
        self.core().authority.store.names(Store::Reliable)
    }

    /// Names in the local unreliable view.
    pub fn unreliable_resource_names(&self) -> Vec<String> {
        self.core().authority.store.names(Store::Unreliable)
    }

    /// Remove stale pipes left in this section's pipe directory.
    pub fn clean_pipe_garbage(&self) -> Result<Vec<PathBuf>> {
        let dir = self.core().config.pipe_dir.clone();
        crate::gc::clean_pipe_garbage(dir)
    }
}

fn update(core: &mut SectionCore, store: Store, name: &str, value: Vec<u8>) -> bool {
    if !core.is_creator() {
        let accepted = core.acknowledged(Request::AddOrUpdate {
            store,
            name: name.to_owned(),
            value: value.clone(),
        });
        if !accepted {
            return false;
        }
    }
    core.authority.store.insert(store, name, value);
    true
}

fn erase(core: &mut SectionCore, store: Store, name: &str) -> bool {
    if !core.authority.store.contains(store, name) {
        return false;
    }
    if !core.is_creator()
        && !core.acknowledged(Request::Erase {
            store,
            name: name.to_owned(),
        })
    {
        return false;
    }
    core.authority.store.remove(store, name);
    true
}
