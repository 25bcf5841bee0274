//! Rank namespace bookkeeping and the sparse all-to-all collective.
//!
//! [`RankManager`] tracks three snapshots of the communicator's member set:
//! `original` (the namespace all block distribution math is expressed in,
//! frozen at submission), `current` (alive ranks now), and `last_queried`
//! (for failure change-notification). [`CommContext`] bundles a transport
//! handle with its manager.
//!
//! [`sparse_all_to_all`] delivers an arbitrary per-rank message bag without
//! any global size exchange: every payload goes out as a *synchronous* send,
//! which completes only once the matching receive has started. When all
//! local sends have matched, a nonblocking barrier is posted; once it
//! completes on every rank, every payload in the system has been received.

use crate::error::{Error, Result};
use crate::transport::{
    CurrentRank, GlobalRank, Group, OriginalRank, RecvMessage, SendMessage, Tag, Transport,
};

/// Snapshots of the original and current rank namespaces, plus translation
/// between them.
#[derive(Debug)]
pub struct RankManager {
    original: Group,
    current: Group,
    last_queried: Group,
    my_global: GlobalRank,
}

impl RankManager {
    pub fn new(group: Group, my_global: GlobalRank) -> Self {
        Self {
            original: group.clone(),
            current: group.clone(),
            last_queried: group,
            my_global,
        }
    }

    /// Re-read the current namespace after the communicator changed.
    pub fn update_current(&mut self, group: Group) {
        self.current = group;
    }

    /// Pin the original namespace to the current one. Called exactly once
    /// per submission, so that distribution math is anchored to the ranks
    /// that actually stored the data.
    pub fn reset_original_to_current(&mut self) {
        self.original = self.current.clone();
    }

    pub fn original_size(&self) -> usize {
        self.original.size()
    }

    pub fn current_size(&self) -> usize {
        self.current.size()
    }

    pub fn my_original_rank(&self) -> OriginalRank {
        self.original
            .rank_of_global(self.my_global)
            .expect("calling rank is not part of the original namespace")
    }

    pub fn my_current_rank(&self) -> CurrentRank {
        self.current
            .rank_of_global(self.my_global)
            .expect("calling rank is not part of the current namespace")
    }

    /// Translate a current rank to the original namespace. Always defined:
    /// a rank cannot be alive without having been there at submission.
    pub fn original_of_current(&self, rank: CurrentRank) -> OriginalRank {
        self.current
            .translate_rank(rank, &self.original)
            .expect("current rank has no original counterpart")
    }

    /// Translate an original rank to the current namespace; `None` when the
    /// rank has died.
    pub fn current_of_original(&self, rank: OriginalRank) -> Option<CurrentRank> {
        self.original.translate_rank(rank, &self.current)
    }

    /// Filter a list of original ranks down to those still alive.
    pub fn only_alive(&self, ranks: &[OriginalRank]) -> Vec<OriginalRank> {
        ranks
            .iter()
            .copied()
            .filter(|&r| self.current_of_original(r).is_some())
            .collect()
    }

    /// Current ranks of the alive subset of `ranks`.
    pub fn alive_current_ranks(&self, ranks: &[OriginalRank]) -> Vec<CurrentRank> {
        ranks
            .iter()
            .filter_map(|&r| self.current_of_original(r))
            .collect()
    }

    /// Original ranks that died since the last call (or since construction).
    pub fn ranks_died_since_last_call(&mut self) -> Vec<OriginalRank> {
        let died = self
            .last_queried
            .difference(&self.current)
            .into_iter()
            .filter_map(|g| self.original.rank_of_global(g))
            .collect();
        self.last_queried = self.current.clone();
        died
    }

    pub fn num_failures_since_reset(&self) -> usize {
        self.original_size() - self.current_size()
    }
}

/// A transport handle together with its namespace bookkeeping.
#[derive(Debug)]
pub struct CommContext<T: Transport> {
    comm: T,
    ranks: RankManager,
}

impl<T: Transport> CommContext<T> {
    pub fn new(comm: T) -> Self {
        let group = comm.group();
        let my_global = group.global_of_rank(comm.my_rank());
        Self {
            ranks: RankManager::new(group, my_global),
            comm,
        }
    }

    pub fn comm(&self) -> &T {
        &self.comm
    }

    pub fn ranks(&self) -> &RankManager {
        &self.ranks
    }

    pub fn ranks_mut(&mut self) -> &mut RankManager {
        &mut self.ranks
    }

    /// Swap in a repaired communicator after failures.
    pub fn update_comm(&mut self, new_comm: T) {
        self.ranks.update_current(new_comm.group());
        self.comm = new_comm;
    }

    pub fn reset_original_to_current(&mut self) {
        self.ranks.reset_original_to_current();
    }

    /// Fault-tolerant barrier. A detected member death revokes the
    /// communicator before the error propagates, so that peers blocked in
    /// their own progress loops observe the failure too.
    pub fn ft_barrier(&self) -> Result<()> {
        let result = self.comm.agree();
        if let Err(Error::PeerFailed) = &result {
            self.comm.revoke();
        }
        result
    }
}

/// Deliver an arbitrary multiset of point-to-point payloads. Returns every
/// payload addressed to this rank, tagged with its source, in arrival order.
///
/// No rank needs to know a priori who will send to it and no sizes are
/// exchanged up front. A detected peer failure aborts both phases; partial
/// results are discarded by the caller.
pub fn sparse_all_to_all<T: Transport>(
    comm: &T,
    messages: &[SendMessage],
    tag: Tag,
) -> Result<Vec<RecvMessage>> {
    let result = exchange(comm, messages, tag);
    if let Err(Error::PeerFailed) = &result {
        // The detector revokes so that ranks whose own traffic only touches
        // survivors do not spin forever waiting for the dead rank's sends.
        comm.revoke();
    }
    result
}

fn exchange<T: Transport>(
    comm: &T,
    messages: &[SendMessage],
    tag: Tag,
) -> Result<Vec<RecvMessage>> {
    let mut requests = Vec::with_capacity(messages.len());
    for message in messages {
        requests.push(comm.issend(message.dest, tag, &message.data)?);
    }

    let mut result = Vec::new();

    // Receive until all local synchronous sends have matched.
    loop {
        receive_new_message(comm, tag, &mut result)?;
        if comm.test_all_sends(&mut requests)? {
            break;
        }
    }

    // Every rank past this barrier implies every send in the system has
    // matched a receive; keep draining until it completes.
    let mut barrier = comm.ibarrier()?;
    loop {
        receive_new_message(comm, tag, &mut result)?;
        if comm.test_barrier(&mut barrier)? {
            break;
        }
    }

    Ok(result)
}

fn receive_new_message<T: Transport>(
    comm: &T,
    tag: Tag,
    result: &mut Vec<RecvMessage>,
) -> Result<()> {
    if let Some(probed) = comm.iprobe(tag)? {
        let data = comm.recv(probed.source, tag)?;
        debug_assert_eq!(data.len(), probed.len);
        result.push(RecvMessage {
            source: probed.source,
            data,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::MeshWorld;
    use std::thread;

    fn manager() -> RankManager {
        // Four ranks, of which global 1 and 3 have died.
        let mut m = RankManager::new(Group::new(vec![0, 1, 2, 3]), 2);
        m.update_current(Group::new(vec![0, 2]));
        m
    }

    #[test]
    fn test_namespace_translation() {
        let m = manager();
        assert_eq!(m.original_size(), 4);
        assert_eq!(m.current_size(), 2);
        assert_eq!(m.my_original_rank(), 2);
        assert_eq!(m.my_current_rank(), 1);
        assert_eq!(m.current_of_original(0), Some(0));
        assert_eq!(m.current_of_original(1), None);
        assert_eq!(m.current_of_original(2), Some(1));
        assert_eq!(m.original_of_current(1), 2);
        assert_eq!(m.num_failures_since_reset(), 2);
    }

    #[test]
    fn test_alive_filtering() {
        let m = manager();
        assert_eq!(m.only_alive(&[0, 1, 2, 3]), vec![0, 2]);
        assert_eq!(m.alive_current_ranks(&[3, 2, 0]), vec![1, 0]);
    }

    #[test]
    fn test_ranks_died_since_last_call() {
        let mut m = manager();
        assert_eq!(m.ranks_died_since_last_call(), vec![1, 3]);
        // Queried state advances: no new deaths, nothing to report.
        assert!(m.ranks_died_since_last_call().is_empty());
    }

    #[test]
    fn test_reset_pins_original_to_current() {
        let mut m = manager();
        m.reset_original_to_current();
        assert_eq!(m.original_size(), 2);
        assert_eq!(m.my_original_rank(), 1);
    }

    #[test]
    fn test_sparse_all_to_all_delivers_every_payload() {
        let n = 4;
        let world = MeshWorld::new(n);

        let handles: Vec<_> = (0..n)
            .map(|rank| {
                let comm = world.comm(rank);
                thread::spawn(move || {
                    // Rank r sends one payload to every rank s with s <= r,
                    // so message counts differ per destination.
                    let messages: Vec<SendMessage> = (0..=rank)
                        .map(|dest| SendMessage {
                            dest,
                            data: vec![rank as u8; dest + 1],
                        })
                        .collect();
                    let mut received = sparse_all_to_all(&comm, &messages, 42).unwrap();
                    received.sort_by_key(|m| m.source);
                    received
                })
            })
            .collect();

        for (rank, handle) in handles.into_iter().enumerate() {
            let received = handle.join().unwrap();
            // Rank r hears from every rank s with s >= r, exactly once.
            let sources: Vec<_> = received.iter().map(|m| m.source).collect();
            let expected: Vec<_> = (rank..n).collect();
            assert_eq!(sources, expected);
            for message in received {
                assert_eq!(message.data, vec![message.source as u8; rank + 1]);
            }
        }
    }

    #[test]
    fn test_sparse_all_to_all_with_no_messages() {
        let world = MeshWorld::new(2);
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                let comm = world.comm(rank);
                thread::spawn(move || sparse_all_to_all(&comm, &[], 42).unwrap())
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_empty());
        }
    }
}
