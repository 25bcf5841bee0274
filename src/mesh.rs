//! In-process channel-backed transport with failure injection.
//!
//! [`MeshWorld`] wires `n` ranks together through per-rank mailboxes; each
//! rank drives a [`MeshComm`] handle implementing [`Transport`]. Ranks are
//! expected to live on their own OS threads, mirroring how the store would
//! sit on separate processes in production.
//!
//! Failures are injected with [`MeshWorld::kill`]: a dead rank makes sends
//! to it, tests over undelivered sends to it, barriers it has not entered
//! and consensus rounds it belongs to all fail with
//! [`Error::PeerFailed`], which is exactly the observable behaviour the
//! store's progress loops are written against. [`MeshComm::shrink`] builds
//! the repaired communicator: every caller observing the same surviving set
//! receives the same new generation. Messages carry their generation and
//! stale ones are discarded, so traffic from an abandoned communicator can
//! never alias a repaired one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use ahash::AHashMap;
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::error::{Error, Result};
use crate::transport::{CurrentRank, GlobalRank, Group, ProbedMessage, Tag, Transport};

struct Envelope {
    source: GlobalRank,
    tag: Tag,
    generation: u64,
    payload: Vec<u8>,
    /// Set by the receiving rank when the message is taken; completes the
    /// matching synchronous send.
    delivered: Arc<AtomicBool>,
}

struct Mailbox {
    tx: Sender<Envelope>,
    rx: Mutex<Receiver<Envelope>>,
    /// Envelopes pulled off the channel but not yet matched by a receive.
    stash: Mutex<VecDeque<Envelope>>,
}

/// One communicator generation: the member list and its collective state.
struct CommState {
    generation: u64,
    members: Vec<GlobalRank>,
    revoked: AtomicBool,
    barriers: Mutex<Vec<CollectiveSlot>>,
    agreements: Mutex<Vec<CollectiveSlot>>,
}

struct CollectiveSlot {
    /// Arrival flags by member index.
    arrived: Vec<bool>,
}

struct WorldInner {
    alive: Mutex<Vec<bool>>,
    mailboxes: Vec<Mailbox>,
    root: Arc<CommState>,
    /// Shrink results keyed by (parent generation, surviving members), so
    /// that all callers of a collective shrink agree on the new state.
    shrunk: Mutex<AHashMap<(u64, Vec<GlobalRank>), Arc<CommState>>>,
    next_generation: AtomicU64,
}

/// A set of in-process ranks wired together through channels.
#[derive(Clone)]
pub struct MeshWorld {
    inner: Arc<WorldInner>,
}

impl MeshWorld {
    /// Create a world of `n` ranks.
    ///
    /// # Panics
    /// Panics if `n` is 0.
    pub fn new(n: usize) -> Self {
        assert!(n > 0, "must have at least one rank");
        let mailboxes = (0..n)
            .map(|_| {
                let (tx, rx) = unbounded();
                Mailbox {
                    tx,
                    rx: Mutex::new(rx),
                    stash: Mutex::new(VecDeque::new()),
                }
            })
            .collect();
        let root = Arc::new(CommState {
            generation: 0,
            members: (0..n).collect(),
            revoked: AtomicBool::new(false),
            barriers: Mutex::new(Vec::new()),
            agreements: Mutex::new(Vec::new()),
        });
        Self {
            inner: Arc::new(WorldInner {
                alive: Mutex::new(vec![true; n]),
                mailboxes,
                root,
                shrunk: Mutex::new(AHashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.mailboxes.len()
    }

    /// The world communicator handle for `rank`. Create exactly one handle
    /// per rank; clones of a handle share its collective sequence numbers.
    pub fn comm(&self, rank: GlobalRank) -> MeshComm {
        MeshComm {
            world: self.inner.clone(),
            state: self.inner.root.clone(),
            global: rank,
            my_index: rank,
            barrier_seq: Arc::new(AtomicU64::new(0)),
            agree_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Mark a rank as failed. Takes effect on the next transport call that
    /// observes it.
    pub fn kill(&self, rank: GlobalRank) {
        self.inner.alive.lock().unwrap()[rank] = false;
    }
}

/// Completion handle of one synchronous send.
pub struct MeshSendRequest {
    delivered: Arc<AtomicBool>,
    dest: GlobalRank,
}

/// Completion handle of one nonblocking barrier.
pub struct MeshBarrierRequest {
    seq: usize,
}

/// Per-rank communicator handle. Cloning shares the underlying endpoint, so
/// a clone can be moved onto a worker thread.
#[derive(Clone)]
pub struct MeshComm {
    world: Arc<WorldInner>,
    state: Arc<CommState>,
    global: GlobalRank,
    my_index: usize,
    barrier_seq: Arc<AtomicU64>,
    agree_seq: Arc<AtomicU64>,
}

impl MeshComm {
    /// Generation number of the communicator this handle speaks on.
    pub fn generation(&self) -> u64 {
        self.state.generation
    }

    fn check_open(&self) -> Result<()> {
        if self.state.revoked.load(Ordering::Acquire) {
            return Err(Error::CommunicatorRevoked);
        }
        Ok(())
    }

    fn is_alive(&self, rank: GlobalRank) -> bool {
        self.world.alive.lock().unwrap()[rank]
    }

    /// Move arrived envelopes into the stash, discarding traffic from
    /// abandoned (older) generations.
    fn drain_mailbox(&self) {
        let mailbox = &self.world.mailboxes[self.global];
        let rx = mailbox.rx.lock().unwrap();
        let mut stash = mailbox.stash.lock().unwrap();
        stash.retain(|e| e.generation >= self.state.generation);
        while let Ok(envelope) = rx.try_recv() {
            if envelope.generation >= self.state.generation {
                stash.push_back(envelope);
            }
        }
    }

    fn matches(&self, envelope: &Envelope, tag: Tag) -> bool {
        envelope.generation == self.state.generation && envelope.tag == tag
    }
}

impl Transport for MeshComm {
    type SendRequest = MeshSendRequest;
    type BarrierRequest = MeshBarrierRequest;

    fn group(&self) -> Group {
        Group::new(self.state.members.clone())
    }

    fn my_rank(&self) -> CurrentRank {
        self.my_index
    }

    fn iprobe(&self, tag: Tag) -> Result<Option<ProbedMessage>> {
        self.check_open()?;
        self.drain_mailbox();
        let mailbox = &self.world.mailboxes[self.global];
        let stash = mailbox.stash.lock().unwrap();
        for envelope in stash.iter() {
            if self.matches(envelope, tag) {
                if let Some(source) = self.state.members.iter().position(|&g| g == envelope.source)
                {
                    return Ok(Some(ProbedMessage {
                        source,
                        len: envelope.payload.len(),
                    }));
                }
            }
        }
        drop(stash);
        thread::yield_now();
        Ok(None)
    }

    fn recv(&self, source: CurrentRank, tag: Tag) -> Result<Vec<u8>> {
        let src_global = self.state.members[source];
        loop {
            self.check_open()?;
            self.drain_mailbox();
            {
                let mailbox = &self.world.mailboxes[self.global];
                let mut stash = mailbox.stash.lock().unwrap();
                let position = stash
                    .iter()
                    .position(|e| self.matches(e, tag) && e.source == src_global);
                if let Some(position) = position {
                    let envelope = stash.remove(position).unwrap();
                    envelope.delivered.store(true, Ordering::Release);
                    return Ok(envelope.payload);
                }
            }
            if !self.is_alive(src_global) {
                return Err(Error::PeerFailed);
            }
            thread::yield_now();
        }
    }

    fn issend(&self, dest: CurrentRank, tag: Tag, payload: &[u8]) -> Result<MeshSendRequest> {
        self.check_open()?;
        let dest_global = self.state.members[dest];
        if !self.is_alive(dest_global) {
            return Err(Error::PeerFailed);
        }
        let delivered = Arc::new(AtomicBool::new(false));
        let envelope = Envelope {
            source: self.global,
            tag,
            generation: self.state.generation,
            payload: payload.to_vec(),
            delivered: delivered.clone(),
        };
        // Cannot fail: the world owns every receiver for its lifetime.
        let _ = self.world.mailboxes[dest_global].tx.send(envelope);
        Ok(MeshSendRequest {
            delivered,
            dest: dest_global,
        })
    }

    fn test_all_sends(&self, requests: &mut [MeshSendRequest]) -> Result<bool> {
        self.check_open()?;
        let mut all_done = true;
        for request in requests.iter() {
            if request.delivered.load(Ordering::Acquire) {
                continue;
            }
            if !self.is_alive(request.dest) {
                return Err(Error::PeerFailed);
            }
            all_done = false;
        }
        Ok(all_done)
    }

    fn ibarrier(&self) -> Result<MeshBarrierRequest> {
        self.check_open()?;
        let seq = self.barrier_seq.fetch_add(1, Ordering::Relaxed) as usize;
        let mut barriers = self.state.barriers.lock().unwrap();
        while barriers.len() <= seq {
            barriers.push(CollectiveSlot {
                arrived: vec![false; self.state.members.len()],
            });
        }
        barriers[seq].arrived[self.my_index] = true;
        Ok(MeshBarrierRequest { seq })
    }

    fn test_barrier(&self, request: &mut MeshBarrierRequest) -> Result<bool> {
        self.check_open()?;
        let barriers = self.state.barriers.lock().unwrap();
        let slot = &barriers[request.seq];
        if slot.arrived.iter().all(|&a| a) {
            return Ok(true);
        }
        let alive = self.world.alive.lock().unwrap();
        for (index, &member) in self.state.members.iter().enumerate() {
            if !slot.arrived[index] && !alive[member] {
                return Err(Error::PeerFailed);
            }
        }
        Ok(false)
    }

    fn agree(&self) -> Result<()> {
        self.check_open()?;
        let seq = self.agree_seq.fetch_add(1, Ordering::Relaxed) as usize;
        {
            let mut agreements = self.state.agreements.lock().unwrap();
            while agreements.len() <= seq {
                agreements.push(CollectiveSlot {
                    arrived: vec![false; self.state.members.len()],
                });
            }
            agreements[seq].arrived[self.my_index] = true;
        }
        loop {
            self.check_open()?;
            {
                let alive = self.world.alive.lock().unwrap();
                if self.state.members.iter().any(|&m| !alive[m]) {
                    return Err(Error::PeerFailed);
                }
                drop(alive);
                let agreements = self.state.agreements.lock().unwrap();
                if agreements[seq].arrived.iter().all(|&a| a) {
                    return Ok(());
                }
            }
            thread::yield_now();
        }
    }

    fn revoke(&self) {
        self.state.revoked.store(true, Ordering::Release);
    }

    /// Shrink works on a revoked communicator; that is its whole point.
    fn shrink(&self) -> Result<MeshComm> {
        if !self.is_alive(self.global) {
            return Err(Error::PeerFailed);
        }
        let survivors: Vec<GlobalRank> = {
            let alive = self.world.alive.lock().unwrap();
            self.state
                .members
                .iter()
                .copied()
                .filter(|&m| alive[m])
                .collect()
        };
        let state = {
            let mut shrunk = self.world.shrunk.lock().unwrap();
            shrunk
                .entry((self.state.generation, survivors.clone()))
                .or_insert_with(|| {
                    Arc::new(CommState {
                        generation: self.world.next_generation.fetch_add(1, Ordering::Relaxed),
                        members: survivors,
                        revoked: AtomicBool::new(false),
                        barriers: Mutex::new(Vec::new()),
                        agreements: Mutex::new(Vec::new()),
                    })
                })
                .clone()
        };
        let my_index = state
            .members
            .iter()
            .position(|&g| g == self.global)
            .expect("surviving rank missing from shrunken communicator");
        Ok(MeshComm {
            world: self.world.clone(),
            state,
            global: self.global,
            my_index,
            barrier_seq: Arc::new(AtomicU64::new(0)),
            agree_seq: Arc::new(AtomicU64::new(0)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_probe_recv() {
        let world = MeshWorld::new(2);
        let c0 = world.comm(0);
        let c1 = world.comm(1);

        let mut requests = vec![c0.issend(1, 7, b"hello").unwrap()];
        // A synchronous send does not complete before the receive.
        assert!(!c0.test_all_sends(&mut requests).unwrap());

        let probed = c1.iprobe(7).unwrap().unwrap();
        assert_eq!(probed.source, 0);
        assert_eq!(probed.len, 5);
        assert_eq!(c1.recv(0, 7).unwrap(), b"hello");

        assert!(c0.test_all_sends(&mut requests).unwrap());
    }

    #[test]
    fn test_probe_filters_by_tag() {
        let world = MeshWorld::new(2);
        let c0 = world.comm(0);
        let c1 = world.comm(1);

        let _req = c0.issend(1, 7, b"a").unwrap();
        assert!(c1.iprobe(8).unwrap().is_none());
        assert!(c1.iprobe(7).unwrap().is_some());
    }

    #[test]
    fn test_send_to_dead_rank_fails() {
        let world = MeshWorld::new(2);
        let c0 = world.comm(0);
        world.kill(1);
        assert!(matches!(c0.issend(1, 7, b"x"), Err(Error::PeerFailed)));
    }

    #[test]
    fn test_unmatched_send_to_dying_rank_fails() {
        let world = MeshWorld::new(2);
        let c0 = world.comm(0);
        let mut requests = vec![c0.issend(1, 7, b"x").unwrap()];
        world.kill(1);
        assert!(matches!(
            c0.test_all_sends(&mut requests),
            Err(Error::PeerFailed)
        ));
    }

    #[test]
    fn test_barrier_completes_when_all_arrive() {
        let world = MeshWorld::new(2);
        let c0 = world.comm(0);
        let c1 = world.comm(1);

        let mut barrier = c0.ibarrier().unwrap();
        assert!(!c0.test_barrier(&mut barrier).unwrap());
        let mut other = c1.ibarrier().unwrap();
        assert!(c0.test_barrier(&mut barrier).unwrap());
        assert!(c1.test_barrier(&mut other).unwrap());
    }

    #[test]
    fn test_barrier_with_dead_straggler_fails() {
        let world = MeshWorld::new(2);
        let c0 = world.comm(0);
        let mut barrier = c0.ibarrier().unwrap();
        world.kill(1);
        assert!(matches!(
            c0.test_barrier(&mut barrier),
            Err(Error::PeerFailed)
        ));
    }

    #[test]
    fn test_agree_succeeds_across_threads() {
        let world = MeshWorld::new(3);
        let handles: Vec<_> = (0..3)
            .map(|rank| {
                let comm = world.comm(rank);
                thread::spawn(move || comm.agree())
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }
    }

    #[test]
    fn test_agree_with_dead_member_fails() {
        let world = MeshWorld::new(2);
        let c0 = world.comm(0);
        world.kill(1);
        assert!(matches!(c0.agree(), Err(Error::PeerFailed)));
    }

    #[test]
    fn test_revoke_poisons_every_holder() {
        let world = MeshWorld::new(2);
        let c0 = world.comm(0);
        let c1 = world.comm(1);
        c0.revoke();
        assert!(matches!(c1.iprobe(7), Err(Error::CommunicatorRevoked)));
        assert!(matches!(
            c1.issend(0, 7, b"x"),
            Err(Error::CommunicatorRevoked)
        ));
    }

    #[test]
    fn test_shrink_is_collective() {
        let world = MeshWorld::new(3);
        let c0 = world.comm(0);
        let c2 = world.comm(2);
        world.kill(1);

        let s0 = c0.shrink().unwrap();
        let s2 = c2.shrink().unwrap();
        assert_eq!(s0.generation(), s2.generation());
        assert_eq!(s0.group().members(), &[0, 2]);
        assert_eq!(s0.my_rank(), 0);
        assert_eq!(s2.my_rank(), 1);
    }

    #[test]
    fn test_stale_generation_traffic_is_discarded() {
        let world = MeshWorld::new(3);
        let c0 = world.comm(0);
        let c2 = world.comm(2);

        // Undelivered message on the doomed generation.
        let _req = c0.issend(2, 7, b"stale").unwrap();
        world.kill(1);

        let s0 = c0.shrink().unwrap();
        let s2 = c2.shrink().unwrap();
        assert!(s2.iprobe(7).unwrap().is_none());

        // Fresh traffic on the new generation still flows; note rank 2 is
        // now current rank 1.
        let _req = s0.issend(1, 7, b"fresh").unwrap();
        let probed = s2.iprobe(7).unwrap().unwrap();
        assert_eq!(probed.source, 0);
        assert_eq!(s2.recv(0, 7).unwrap(), b"fresh");
    }

    #[test]
    fn test_self_send() {
        let world = MeshWorld::new(1);
        let c0 = world.comm(0);
        let mut requests = vec![c0.issend(0, 9, b"loop").unwrap()];
        assert_eq!(c0.recv(0, 9).unwrap(), b"loop");
        assert!(c0.test_all_sends(&mut requests).unwrap());
    }
}
