//! The transport capabilities the store consumes.
//!
//! The store never talks to a network library directly. It is written
//! against [`Transport`], a thin shim over whatever actually moves bytes
//! between ranks: nonblocking synchronous sends, probe-driven receives, a
//! nonblocking barrier, a fault-tolerant consensus barrier, and group
//! bookkeeping. [`crate::mesh`] provides an in-process implementation used
//! by the tests; an MPI binding would provide another.
//!
//! All rank arguments and results of transport calls are expressed in the
//! *current* namespace (the communicator the handle represents). Stable
//! process identities across communicator generations are [`GlobalRank`]s,
//! exposed through [`Group`] snapshots.

use crate::error::Result;

/// Message tag. One tag is shared by all replica traffic of a store.
pub type Tag = u32;

/// Rank in the communicator the store currently runs on. Shrinks and gets
/// renumbered when ranks fail.
pub type CurrentRank = usize;

/// Rank in the namespace frozen at the last submission. All block
/// distribution math is expressed in original ranks.
pub type OriginalRank = usize;

/// Stable process identity, independent of any communicator generation.
pub type GlobalRank = usize;

/// An immutable snapshot of one rank namespace: the ordered list of global
/// identities behind ranks `0..size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    members: Vec<GlobalRank>,
}

impl Group {
    pub fn new(members: Vec<GlobalRank>) -> Self {
        Self { members }
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> &[GlobalRank] {
        &self.members
    }

    /// Global identity behind rank `rank` of this namespace.
    pub fn global_of_rank(&self, rank: usize) -> GlobalRank {
        self.members[rank]
    }

    /// Rank of `global` in this namespace, if it is a member.
    pub fn rank_of_global(&self, global: GlobalRank) -> Option<usize> {
        self.members.iter().position(|&g| g == global)
    }

    /// Translate `rank` of this namespace into `other`. `None` when the
    /// process behind the rank is not a member of `other`.
    pub fn translate_rank(&self, rank: usize, other: &Group) -> Option<usize> {
        other.rank_of_global(self.global_of_rank(rank))
    }

    /// Global identities present in this namespace but absent from `other`.
    pub fn difference(&self, other: &Group) -> Vec<GlobalRank> {
        self.members
            .iter()
            .copied()
            .filter(|g| other.rank_of_global(*g).is_none())
            .collect()
    }
}

/// Result of a successful probe: a message from `source` with `len` payload
/// bytes is ready to be received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbedMessage {
    pub source: CurrentRank,
    pub len: usize,
}

/// One outgoing payload of a sparse all-to-all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessage {
    pub dest: CurrentRank,
    pub data: Vec<u8>,
}

/// One delivered payload of a sparse all-to-all, tagged with its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvMessage {
    pub source: CurrentRank,
    pub data: Vec<u8>,
}

/// Point-to-point and group primitives the store is built on.
///
/// Every fallible call maps peer death to [`crate::Error::PeerFailed`] and a
/// revoked communicator to [`crate::Error::CommunicatorRevoked`]; the store
/// relies on these surfacing inside its progress loops.
pub trait Transport {
    /// Handle for an in-flight synchronous send.
    type SendRequest;
    /// Handle for an in-flight nonblocking barrier.
    type BarrierRequest;

    /// Snapshot of the current member set.
    fn group(&self) -> Group;

    /// This process's rank in the current namespace.
    fn my_rank(&self) -> CurrentRank;

    /// Nonblocking probe for any incoming message with `tag`.
    fn iprobe(&self, tag: Tag) -> Result<Option<ProbedMessage>>;

    /// Receive the next message from `source` with `tag`. Intended to be
    /// called after a successful probe of the same source.
    fn recv(&self, source: CurrentRank, tag: Tag) -> Result<Vec<u8>>;

    /// Start a synchronous send: the returned request completes only once
    /// the receiver has taken the matching message.
    fn issend(&self, dest: CurrentRank, tag: Tag, payload: &[u8]) -> Result<Self::SendRequest>;

    /// Test whether every request in `requests` has completed.
    fn test_all_sends(&self, requests: &mut [Self::SendRequest]) -> Result<bool>;

    /// Start a nonblocking barrier over the current member set.
    fn ibarrier(&self) -> Result<Self::BarrierRequest>;

    /// Test whether the barrier has completed.
    fn test_barrier(&self, request: &mut Self::BarrierRequest) -> Result<bool>;

    /// Fault-tolerant consensus barrier. Blocks until every live member
    /// arrived; surfaces member death as an error.
    fn agree(&self) -> Result<()>;

    /// Revoke the communicator for every holder.
    fn revoke(&self);

    /// Collectively build a new communicator containing only the surviving
    /// members, in relative order.
    fn shrink(&self) -> Result<Self>
    where
        Self: Sized;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_translation() {
        let original = Group::new(vec![10, 11, 12, 13]);
        let current = Group::new(vec![10, 12, 13]); // 11 died

        assert_eq!(original.translate_rank(0, &current), Some(0));
        assert_eq!(original.translate_rank(1, &current), None);
        assert_eq!(original.translate_rank(2, &current), Some(1));
        assert_eq!(original.translate_rank(3, &current), Some(2));

        // Current to original is always defined.
        assert_eq!(current.translate_rank(1, &original), Some(2));
    }

    #[test]
    fn test_group_difference() {
        let a = Group::new(vec![0, 1, 2, 3]);
        let b = Group::new(vec![0, 2]);
        assert_eq!(a.difference(&b), vec![1, 3]);
        assert!(b.difference(&a).is_empty());
    }
}
