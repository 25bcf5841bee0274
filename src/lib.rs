//! repstore - replicated in-memory block storage embedded into a
//! bulk-synchronous message-passing job.
//!
//! Every rank of the job holds a shard of application data cut into
//! fixed-identity blocks. The store scatters `k` replicas of each block over
//! the ranks so that, after a subset of ranks has crashed, the survivors can
//! rebuild any block that still has at least one living replica.
//!
//! # Architecture
//!
//! ```text
//!            submit_blocks                    push / pull
//!                 │                                │
//!                 ▼                                ▼
//!  ┌─────────────────────────────────────────────────────────┐
//!  │                      Store                              │
//!  │  ┌──────────────┐ ┌──────────────┐ ┌─────────────────┐  │
//!  │  │ Permutation  │ │ Distribution │ │ Block storage   │  │
//!  │  │ id scatter   │ │ id → ranks   │ │ byte arenas     │  │
//!  │  └──────────────┘ └──────────────┘ └─────────────────┘  │
//!  │                 sparse all-to-all                       │
//!  └───────────────────────────┬─────────────────────────────┘
//!                              ▼
//!                    Transport (MPI-like shim)
//! ```
//!
//! Placement is a pure function of `(rank count, block count, replication)`,
//! so no rank ever exchanges placement metadata: everyone computes the same
//! distribution locally. Replica traffic rides a sparse all-to-all built
//! from synchronous sends and a nonblocking barrier, which needs no global
//! size exchange and surfaces peer failures inside its progress loops.
//!
//! A store is unpopulated until the first [`Store::submit_blocks`]. A
//! submission that trips over a peer failure drops all replicated state and
//! reports the error; the caller repairs the communicator with
//! [`Store::update_comm`] and submits again:
//!
//! ```text
//! CREATED ──submit──▶ SUBMITTING ──ok──▶ POPULATED ──push/pull──▶ POPULATED
//!    ▲                    │                  │
//!    └─────── failure ────┘                  └──submit──▶ SUBMITTING
//! ```

pub mod comm;
pub mod distribution;
pub mod encoding;
pub mod error;
pub mod mesh;
pub mod permutation;
pub mod storage;
pub mod transport;

use std::sync::Arc;
use std::thread;

use ahash::AHashMap;
use log::{debug, warn};

use comm::{sparse_all_to_all, CommContext};
use distribution::BlockDistribution;
use encoding::{append_record_header, for_each_block, for_each_header, patch_record_hi};
use permutation::RangePermutation;
use storage::SerializedBlockStorage;

pub use error::{Error, Result};
pub use mesh::{MeshComm, MeshWorld};
pub use transport::{
    CurrentRank, GlobalRank, Group, OriginalRank, ProbedMessage, RecvMessage, SendMessage, Tag,
    Transport,
};

/// Globally unique, stable identity of one block.
pub type BlockId = u64;

/// Default tag for replica traffic.
pub const DEFAULT_TAG: Tag = 42;

/// Default number of consecutive block ids the pseudo-random permutation
/// keeps contiguous.
pub const DEFAULT_PERMUTATION_RANGE_SIZE: u64 = 4096;

/// How the serialized blocks are located inside the byte arenas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OffsetMode {
    /// Every block serializes to at most this many bytes; shorter blocks
    /// are zero-padded. Block `b` of a range sits at a computed offset, no
    /// per-block table is kept.
    Constant(usize),
    /// A per-block offset table, for blocks of wildly varying size.
    /// Declared but not implemented; submissions report
    /// [`Error::NotImplemented`].
    LookupTable,
}

/// Immutable store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Number of replicas kept of every block, `>= 1`.
    pub replication_level: usize,
    pub offset_mode: OffsetMode,
    /// Granularity of the block-id permutation, `>= 1`. Rounded up to a
    /// power of two.
    pub permutation_range_size: u64,
    pub permutation_seed: u64,
    /// When false, block ids are stored unpermuted.
    pub randomize_block_ids: bool,
    pub tag: Tag,
}

impl StoreConfig {
    pub fn new(replication_level: usize, offset_mode: OffsetMode) -> Self {
        Self {
            replication_level,
            offset_mode,
            permutation_range_size: DEFAULT_PERMUTATION_RANGE_SIZE,
            permutation_seed: 0,
            randomize_block_ids: true,
            tag: DEFAULT_TAG,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.replication_level == 0 {
            return Err(Error::InvalidConfiguration(
                "replication level must be at least 1".into(),
            ));
        }
        if let OffsetMode::Constant(0) = self.offset_mode {
            return Err(Error::InvalidConfiguration(
                "constant offset mode requires a block size greater than 0".into(),
            ));
        }
        if self.permutation_range_size == 0 {
            return Err(Error::InvalidConfiguration(
                "permutation range size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// A contiguous interval of block ids `[start, start + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub start: BlockId,
    pub len: u64,
}

impl BlockRange {
    pub fn new(start: BlockId, len: u64) -> Self {
        Self { start, len }
    }

    /// Exclusive end id.
    pub fn end(&self) -> BlockId {
        self.start + self.len
    }
}

/// The subcomponents that exist only while blocks are stored. Created by
/// submission, dropped atomically when a submission fails.
struct ReplicatedState {
    distribution: Arc<BlockDistribution>,
    storage: SerializedBlockStorage,
    permutation: RangePermutation,
}

/// Everything a submission needs before the exchange: sized distribution,
/// empty local arenas and the id permutation.
struct SubmissionPrep {
    distribution: Arc<BlockDistribution>,
    storage: SerializedBlockStorage,
    permutation: RangePermutation,
    block_size: usize,
}

/// One permuted chunk scheduled for transfer: blocks `[lo, hi]` (inclusive)
/// and the peer involved (destination on the send side, serving rank on the
/// receive side).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TransferEntry {
    lo: BlockId,
    hi: BlockId,
    rank: CurrentRank,
}

/// Replicated in-memory block store.
///
/// The store is generic over the [`Transport`] moving its bytes; the
/// application block type enters only through the serialization callback of
/// [`Store::submit_blocks`] and leaves through the byte-level callback of
/// the retrieval operations.
pub struct Store<T: Transport> {
    config: StoreConfig,
    ctx: CommContext<T>,
    replicated: Option<ReplicatedState>,
    in_flight: Option<thread::JoinHandle<Result<ReplicatedState>>>,
}

impl<T: Transport> Store<T> {
    /// Create an unpopulated store on `comm`.
    pub fn new(comm: T, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        if comm.group().size() == 0 {
            return Err(Error::InvalidConfiguration(
                "communicator has no members".into(),
            ));
        }
        Ok(Self {
            config,
            ctx: CommContext::new(comm),
            replicated: None,
            in_flight: None,
        })
    }

    /// Number of replicas kept of every block.
    pub fn replication_level(&self) -> usize {
        self.config.replication_level
    }

    /// How serialized blocks are located in memory.
    pub fn offset_mode(&self) -> &OffsetMode {
        &self.config.offset_mode
    }

    /// Install a repaired communicator after rank failures. Any pending
    /// asynchronous submission is finished first; its failure, if any, has
    /// already reset the replicated state and is only logged here.
    pub fn update_comm(&mut self, new_comm: T) {
        if let Err(e) = self.finish_in_flight() {
            warn!("dropping failed submission before communicator update: {}", e);
        }
        self.ctx.update_comm(new_comm);
    }

    /// Original ranks that died since the previous call (or since the store
    /// was created).
    pub fn ranks_died_since_last_call(&mut self) -> Vec<OriginalRank> {
        self.ctx.ranks_mut().ranks_died_since_last_call()
    }

    /// Replicate blocks over the ranks. Collective: every rank calls this
    /// exactly once per submission round.
    ///
    /// `next` yields `(block_id, block)` pairs until it returns `None`;
    /// `serialize` appends the flat byte image of one block to the staging
    /// buffer. In constant-offset mode the image may be at most the
    /// configured block size and is zero-padded up to it.
    ///
    /// On a peer failure the store drops all replicated state and returns
    /// the error; repair the communicator with [`Store::update_comm`] and
    /// submit again.
    pub fn submit_blocks<B, S, N>(
        &mut self,
        serialize: S,
        next: N,
        total_blocks: u64,
    ) -> Result<()>
    where
        S: FnMut(&B, &mut Vec<u8>),
        N: FnMut() -> Option<(BlockId, B)>,
    {
        self.finish_in_flight()?;
        let (prep, messages) = self.build_submission(serialize, next, total_blocks)?;
        let state = Self::run_exchange(self.ctx.comm(), prep, messages, self.config.tag)
            .map_err(|e| {
                warn!("replica exchange failed: {}", e);
                e
            })?;
        self.replicated = Some(state);
        Ok(())
    }

    /// As [`Store::submit_blocks`] for callers that already hold serialized
    /// byte images. Each descriptor is `(first_block_id, bytes)` covering
    /// `bytes.len() / block_size` consecutive blocks. Constant-offset only.
    pub fn submit_serialized_blocks(
        &mut self,
        descriptors: &[(BlockId, &[u8])],
        total_blocks: u64,
    ) -> Result<()> {
        self.finish_in_flight()?;
        let prep = self.prepare_submission(total_blocks)?;
        let mut builder =
            SendBufferBuilder::new(prep.distribution.as_ref(), &prep.permutation, prep.block_size);
        for &(first_id, bytes) in descriptors {
            if bytes.is_empty() || bytes.len() % prep.block_size != 0 {
                return Err(Error::InvalidConfiguration(format!(
                    "descriptor of {} bytes is not a positive multiple of the block size {}",
                    bytes.len(),
                    prep.block_size
                )));
            }
            let count = (bytes.len() / prep.block_size) as u64;
            if first_id + count > total_blocks {
                return Err(Error::InvalidConfiguration(format!(
                    "descriptor blocks [{}, {}) exceed the total of {}",
                    first_id,
                    first_id + count,
                    total_blocks
                )));
            }
            for i in 0..count {
                let offset = i as usize * prep.block_size;
                builder.add_block(first_id + i, &bytes[offset..offset + prep.block_size]);
            }
        }
        let messages = builder.into_messages();
        let state = Self::run_exchange(self.ctx.comm(), prep, messages, self.config.tag)?;
        self.replicated = Some(state);
        Ok(())
    }

    /// Send blocks to ranks named in the current namespace. Collective: the
    /// plan must be the same on every rank; each entry routes the blocks of
    /// `range` to `destination`.
    ///
    /// On a destination, `on_block` sees blocks grouped by serving rank in
    /// ascending current-rank order and by ascending permuted id within one
    /// serving rank, each as `(bytes, block_id)` with the application-space
    /// id.
    pub fn push_blocks_current_rank_ids<F>(
        &mut self,
        plan: &[(BlockRange, CurrentRank)],
        on_block: F,
    ) -> Result<()>
    where
        F: FnMut(&[u8], BlockId),
    {
        self.finish_in_flight()?;
        let state = self.replicated.as_ref().ok_or(Error::NotPopulated)?;
        let (send, recv) = self.plan_transfers(state, plan)?;
        debug!(
            "pushing {} chunks, expecting {} chunks",
            send.len(),
            recv.len()
        );
        self.execute_transfer(state, &send, &recv, on_block)
    }

    /// As [`Store::push_blocks_current_rank_ids`] with destinations named in
    /// the original namespace. Entries addressed to dead ranks are dropped.
    pub fn push_blocks_original_rank_ids<F>(
        &mut self,
        plan: &[(BlockRange, OriginalRank)],
        on_block: F,
    ) -> Result<()>
    where
        F: FnMut(&[u8], BlockId),
    {
        self.finish_in_flight()?;
        let translated: Vec<(BlockRange, CurrentRank)> = plan
            .iter()
            .filter_map(|&(range, dest)| {
                match self.ctx.ranks().current_of_original(dest) {
                    Some(current) => Some((range, current)),
                    None => {
                        warn!("dropping push entry for dead original rank {}", dest);
                        None
                    }
                }
            })
            .collect();
        let state = self.replicated.as_ref().ok_or(Error::NotPopulated)?;
        let (send, recv) = self.plan_transfers(state, &translated)?;
        self.execute_transfer(state, &send, &recv, on_block)
    }

    /// Fetch blocks this rank wants without knowing the other ranks' needs.
    /// Collective. Each rank forwards its request plan to the serving ranks
    /// over a first sparse all-to-all, a transport barrier fences the tag,
    /// and the servers answer with the data over a second one.
    pub fn pull_blocks<F>(&mut self, ranges: &[BlockRange], on_block: F) -> Result<()>
    where
        F: FnMut(&[u8], BlockId),
    {
        self.finish_in_flight()?;
        let state = self.replicated.as_ref().ok_or(Error::NotPopulated)?;

        let mut recv = Vec::new();
        for &range in ranges {
            if range.len == 0 {
                continue;
            }
            self.validate_range(state, range)?;
            for (lo, hi) in permuted_runs(&state.permutation, state.distribution.as_ref(), range) {
                let (_, serving_current) = self.serving_rank(state, lo)?;
                recv.push(TransferEntry {
                    lo,
                    hi,
                    rank: serving_current,
                });
            }
        }
        recv.sort_by_key(|e| (e.rank, e.lo));

        // Control round: forward the request plan to the serving ranks.
        let mut control: Vec<SendMessage> = Vec::new();
        for entry in &recv {
            match control.last_mut() {
                Some(message) if message.dest == entry.rank => {
                    append_record_header(&mut message.data, entry.lo, entry.hi);
                }
                _ => {
                    let mut data = Vec::new();
                    append_record_header(&mut data, entry.lo, entry.hi);
                    control.push(SendMessage {
                        dest: entry.rank,
                        data,
                    });
                }
            }
        }
        let requests = sparse_all_to_all(self.ctx.comm(), &control, self.config.tag)?;

        // Both rounds share one tag; the barrier keeps a fast rank's data
        // from racing into a slow rank's control round.
        self.ctx.ft_barrier()?;

        let mut send = Vec::new();
        for message in &requests {
            for_each_header(&message.data, |lo, hi| {
                send.push(TransferEntry {
                    lo,
                    hi,
                    rank: message.source,
                });
                Ok(())
            })?;
        }
        send.sort_by_key(|e| (e.rank, e.lo));

        self.execute_transfer(state, &send, &recv, on_block)
    }

    /// Validate arguments, drop prior replicated state, freeze the rank
    /// namespace and size the distribution, arenas and permutation.
    fn prepare_submission(&mut self, total_blocks: u64) -> Result<SubmissionPrep> {
        let block_size = match self.config.offset_mode {
            OffsetMode::Constant(c) => c,
            OffsetMode::LookupTable => {
                return Err(Error::NotImplemented("lookup-table offset mode"))
            }
        };
        if total_blocks == 0 {
            return Err(Error::InvalidConfiguration(
                "total number of blocks must be positive".into(),
            ));
        }

        // Re-submission frees the previous replicas before reallocating.
        self.replicated = None;
        self.ctx.reset_original_to_current();
        let num_ranks = self.ctx.ranks().original_size();
        debug_assert_eq!(num_ranks, self.ctx.ranks().current_size());

        let distribution = Arc::new(BlockDistribution::new(
            num_ranks,
            total_blocks,
            self.config.replication_level,
        ));
        let permutation = if self.config.randomize_block_ids {
            RangePermutation::new(
                total_blocks,
                self.config.permutation_range_size,
                self.config.permutation_seed,
            )
        } else {
            RangePermutation::identity()
        };
        let storage = SerializedBlockStorage::new(
            distribution.clone(),
            block_size,
            self.ctx.ranks().my_original_rank(),
        );
        debug!(
            "submitting {} blocks over {} ranks at replication {}",
            total_blocks, num_ranks, self.config.replication_level
        );
        Ok(SubmissionPrep {
            distribution,
            storage,
            permutation,
            block_size,
        })
    }

    /// Serialize all local blocks into per-destination frames.
    fn build_submission<B, S, N>(
        &mut self,
        mut serialize: S,
        mut next: N,
        total_blocks: u64,
    ) -> Result<(SubmissionPrep, Vec<SendMessage>)>
    where
        S: FnMut(&B, &mut Vec<u8>),
        N: FnMut() -> Option<(BlockId, B)>,
    {
        let prep = self.prepare_submission(total_blocks)?;
        let mut builder =
            SendBufferBuilder::new(prep.distribution.as_ref(), &prep.permutation, prep.block_size);
        let mut staging = Vec::with_capacity(prep.block_size);
        while let Some((id, block)) = next() {
            if id >= total_blocks {
                return Err(Error::InvalidConfiguration(format!(
                    "block id {} is outside [0, {})",
                    id, total_blocks
                )));
            }
            staging.clear();
            serialize(&block, &mut staging);
            if staging.len() > prep.block_size {
                return Err(Error::BlockTooLarge {
                    len: staging.len(),
                    max: prep.block_size,
                });
            }
            // The constant block size is an upper bound.
            staging.resize(prep.block_size, 0);
            builder.add_block(id, &staging);
        }
        let messages = builder.into_messages();
        Ok((prep, messages))
    }

    /// Steps shared by the synchronous and asynchronous submission paths:
    /// exchange the frames and park every incoming replica in the arenas.
    fn run_exchange(
        comm: &T,
        prep: SubmissionPrep,
        messages: Vec<SendMessage>,
        tag: Tag,
    ) -> Result<ReplicatedState> {
        let SubmissionPrep {
            distribution,
            mut storage,
            permutation,
            block_size,
        } = prep;
        let received = sparse_all_to_all(comm, &messages, tag)?;
        for message in &received {
            for_each_block(&message.data, block_size, |id, bytes| {
                storage.write_block(id, bytes)
            })?;
        }
        Ok(ReplicatedState {
            distribution,
            storage,
            permutation,
        })
    }

    /// Wait for a pending asynchronous submission and install its result.
    fn finish_in_flight(&mut self) -> Result<()> {
        let Some(handle) = self.in_flight.take() else {
            return Ok(());
        };
        let result = handle
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
        match result {
            Ok(state) => {
                self.replicated = Some(state);
                Ok(())
            }
            Err(e) => {
                warn!("asynchronous submission failed: {}", e);
                Err(e)
            }
        }
    }

    fn validate_range(&self, state: &ReplicatedState, range: BlockRange) -> Result<()> {
        if range.end() > state.distribution.num_blocks() {
            return Err(Error::InvalidConfiguration(format!(
                "blocks [{}, {}) are outside the submitted id space [0, {})",
                range.start,
                range.end(),
                state.distribution.num_blocks()
            )));
        }
        Ok(())
    }

    /// First replica of the range containing `lo` (by rotation order) that
    /// is still alive.
    fn serving_rank(
        &self,
        state: &ReplicatedState,
        lo: BlockId,
    ) -> Result<(OriginalRank, CurrentRank)> {
        for replica in state.distribution.ranks_for_block(lo) {
            if let Some(current) = self.ctx.ranks().current_of_original(replica) {
                return Ok((replica, current));
            }
        }
        Err(Error::UnrecoverableDataLoss)
    }

    /// Split a push plan into this rank's send side (chunks it serves) and
    /// receive side (chunks addressed to it), both sorted by
    /// `(peer, permuted id)`.
    fn plan_transfers(
        &self,
        state: &ReplicatedState,
        plan: &[(BlockRange, CurrentRank)],
    ) -> Result<(Vec<TransferEntry>, Vec<TransferEntry>)> {
        let my_original = self.ctx.ranks().my_original_rank();
        let my_current = self.ctx.ranks().my_current_rank();
        let mut send = Vec::new();
        let mut recv = Vec::new();
        for &(range, dest) in plan {
            if range.len == 0 {
                continue;
            }
            self.validate_range(state, range)?;
            for (lo, hi) in permuted_runs(&state.permutation, state.distribution.as_ref(), range) {
                let (serving_original, serving_current) = self.serving_rank(state, lo)?;
                if serving_original == my_original {
                    send.push(TransferEntry { lo, hi, rank: dest });
                }
                if dest == my_current {
                    recv.push(TransferEntry {
                        lo,
                        hi,
                        rank: serving_current,
                    });
                }
            }
        }
        send.sort_by_key(|e| (e.rank, e.lo));
        recv.sort_by_key(|e| (e.rank, e.lo));
        Ok((send, recv))
    }

    /// Move the planned chunks: pack per-destination data frames (raw block
    /// bytes, no headers; receivers interpret them through their own plan),
    /// run the sparse all-to-all, and dispatch in plan order.
    fn execute_transfer<F>(
        &self,
        state: &ReplicatedState,
        send: &[TransferEntry],
        recv: &[TransferEntry],
        mut on_block: F,
    ) -> Result<()>
    where
        F: FnMut(&[u8], BlockId),
    {
        let block_size = state.storage.block_size();

        let mut messages: Vec<SendMessage> = Vec::new();
        for entry in send {
            let bytes = state.storage.read_chunk(entry.lo, entry.hi)?;
            match messages.last_mut() {
                Some(message) if message.dest == entry.rank => {
                    message.data.extend_from_slice(bytes)
                }
                _ => messages.push(SendMessage {
                    dest: entry.rank,
                    data: bytes.to_vec(),
                }),
            }
        }

        let mut received = sparse_all_to_all(self.ctx.comm(), &messages, self.config.tag)?;
        received.sort_by_key(|m| m.source);

        let mut index = 0;
        for message in &received {
            let mut cursor = 0;
            while index < recv.len() && recv[index].rank == message.source {
                let entry = &recv[index];
                for id in entry.lo..=entry.hi {
                    let end = cursor + block_size;
                    if end > message.data.len() {
                        return Err(Error::MalformedFrame);
                    }
                    on_block(&message.data[cursor..end], state.permutation.invert(id));
                    cursor = end;
                }
                index += 1;
            }
            if cursor != message.data.len() {
                return Err(Error::MalformedFrame);
            }
        }
        if index != recv.len() {
            return Err(Error::MalformedFrame);
        }
        Ok(())
    }
}

impl<T: Transport + Clone + Send + 'static> Store<T> {
    /// As [`Store::submit_blocks`], but the exchange and local stores run on
    /// a background task. Completion is observed through
    /// [`Store::poll_submit_blocks_is_finished`] or
    /// [`Store::wait_submit_blocks_is_finished`]; any other store operation
    /// waits for the task first.
    pub fn submit_blocks_async<B, S, N>(
        &mut self,
        serialize: S,
        next: N,
        total_blocks: u64,
    ) -> Result<()>
    where
        S: FnMut(&B, &mut Vec<u8>),
        N: FnMut() -> Option<(BlockId, B)>,
    {
        self.finish_in_flight()?;
        let (prep, messages) = self.build_submission(serialize, next, total_blocks)?;
        let comm = self.ctx.comm().clone();
        let tag = self.config.tag;
        self.in_flight =
            Some(thread::spawn(move || Self::run_exchange(&comm, prep, messages, tag)));
        Ok(())
    }

    /// Whether the asynchronous submission has completed. On completion the
    /// result is installed; a failed submission surfaces its error here.
    pub fn poll_submit_blocks_is_finished(&mut self) -> Result<bool> {
        match &self.in_flight {
            None => Ok(true),
            Some(handle) if handle.is_finished() => {
                self.finish_in_flight()?;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    /// Block until the asynchronous submission has completed and install
    /// its result.
    pub fn wait_submit_blocks_is_finished(&mut self) -> Result<()> {
        self.finish_in_flight()
    }
}

/// Per-destination submission frames. Appends every block behind a
/// `(lo, hi)` record header and extends the open record in place while
/// permuted ids stay consecutive within one primary range.
struct SendBufferBuilder<'a> {
    distribution: &'a BlockDistribution,
    permutation: &'a RangePermutation,
    block_size: usize,
    buffers: AHashMap<OriginalRank, DestBuffer>,
}

#[derive(Default)]
struct DestBuffer {
    data: Vec<u8>,
    open: bool,
    last_id: BlockId,
    last_range: usize,
    hi_offset: usize,
}

impl<'a> SendBufferBuilder<'a> {
    fn new(
        distribution: &'a BlockDistribution,
        permutation: &'a RangePermutation,
        block_size: usize,
    ) -> Self {
        Self {
            distribution,
            permutation,
            block_size,
            buffers: AHashMap::new(),
        }
    }

    fn add_block(&mut self, id: BlockId, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), self.block_size);
        let permuted = self.permutation.permute(id);
        let range = self.distribution.range_of_block(permuted);
        for dest in self.distribution.replica_ranks(range.index) {
            let buffer = self.buffers.entry(dest).or_default();
            if buffer.open && permuted == buffer.last_id + 1 && range.index == buffer.last_range {
                patch_record_hi(&mut buffer.data, buffer.hi_offset, permuted);
            } else {
                buffer.hi_offset = append_record_header(&mut buffer.data, permuted, permuted);
            }
            buffer.data.extend_from_slice(bytes);
            buffer.open = true;
            buffer.last_id = permuted;
            buffer.last_range = range.index;
        }
    }

    /// All frames, by ascending destination. Submission runs right after
    /// the namespace reset, so original destinations are current ranks.
    fn into_messages(self) -> Vec<SendMessage> {
        let mut messages: Vec<SendMessage> = self
            .buffers
            .into_iter()
            .map(|(dest, buffer)| SendMessage {
                dest,
                data: buffer.data,
            })
            .collect();
        messages.sort_by_key(|m| m.dest);
        messages
    }
}

/// Cut a user-space block range into maximal runs that stay contiguous
/// after permutation and inside one primary range. With randomization off
/// this degenerates to splitting at primary-range boundaries only.
fn permuted_runs(
    permutation: &RangePermutation,
    distribution: &BlockDistribution,
    range: BlockRange,
) -> Vec<(BlockId, BlockId)> {
    let mut runs = Vec::new();
    let mut open: Option<(BlockId, BlockId, usize)> = None; // (lo, hi, range index)
    for id in range.start..range.end() {
        let permuted = permutation.permute(id);
        let range_index = distribution.range_of_block(permuted).index;
        open = match open {
            Some((lo, hi, index)) if permuted == hi + 1 && range_index == index => {
                Some((lo, permuted, index))
            }
            Some((lo, hi, _)) => {
                runs.push((lo, hi));
                Some((permuted, permuted, range_index))
            }
            None => Some((permuted, permuted, range_index)),
        };
    }
    if let Some((lo, hi, _)) = open {
        runs.push((lo, hi));
    }
    runs
}
