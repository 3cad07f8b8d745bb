//! Operation history.
//!
//! Each public wallet operation (send, claim, swap, counter-swap, exit,
//! cancel, refresh, preimage distribution) opens an [`Operation`]. The
//! operation logs the protocol phases it went through and the ids of the
//! transfers it started, claimed or cancelled. A failed operation returns an
//! [`OperationError`] naming the phase that failed. A send that failed in
//! [`Phase::SignRefunds`] never reached the operators' key shares; one that
//! failed in [`Phase::TweakKeys`] may have.
//!
//! Records go to an [`OperationStore`]. The SDK starts with an
//! [`OperationLog`] that keeps every running operation and the most recent
//! finished ones.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::SdkError;

/// Finished operations kept by [`OperationLog::default`].
pub const DEFAULT_OPERATION_HISTORY: usize = 256;

// ---------------------------------------------------------------------------
// Identifiers and kinds
// ---------------------------------------------------------------------------

/// Process-unique operation id, shown as `op-<n>` in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl OperationId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum OperationKind {
    Transfer,
    Claim,
    Swap,
    CounterSwap,
    CooperativeExit,
    Cancel,
    TimelockRefresh,
    PreimageDistribution,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transfer => "transfer",
            Self::Claim => "claim",
            Self::Swap => "swap",
            Self::CounterSwap => "counter_swap",
            Self::CooperativeExit => "cooperative_exit",
            Self::Cancel => "cancel",
            Self::TimelockRefresh => "timelock_refresh",
            Self::PreimageDistribution => "preimage_distribution",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Running,
    Succeeded,
    Failed,
    /// Some transfers of a batch went through, others did not.
    PartiallyCompleted,
}

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

/// A protocol phase of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Phase {
    /// Picking leaves that sum exactly to the amount.
    SelectLeaves,
    /// Swapping with the provider for exact denominations.
    SwapLeaves,
    /// Checking a swap counterparty's transfer, adaptor signatures or
    /// revealed secret.
    VerifySwap,
    /// Reserving leaves in the tree store.
    ReserveLeaves,
    /// Extending refund timelocks that reached the floor.
    ExtendTimelocks,
    /// Coordinator co-signs refunds to the transient or exit key.
    SignRefunds,
    /// Every operator applies its share of the key tweak.
    TweakKeys,
    /// Listing inbound transfers that can be claimed.
    ListPending,
    /// Claiming one inbound transfer.
    ClaimTransfer(String),
    /// Cancelling an outbound transfer.
    CancelTransfer,
    /// Committing leaf changes to the tree store.
    StoreLeaves,
    /// Revealing the adaptor secret to the swap provider.
    SettleWithProvider,
    /// Splitting a preimage over the operators.
    DistributePreimage,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SelectLeaves => "select_leaves",
            Self::SwapLeaves => "swap_leaves",
            Self::VerifySwap => "verify_swap",
            Self::ReserveLeaves => "reserve_leaves",
            Self::ExtendTimelocks => "extend_timelocks",
            Self::SignRefunds => "sign_refunds",
            Self::TweakKeys => "tweak_keys",
            Self::ListPending => "list_pending",
            Self::ClaimTransfer(id) => return write!(f, "claim_transfer({id})"),
            Self::CancelTransfer => "cancel_transfer",
            Self::StoreLeaves => "store_leaves",
            Self::SettleWithProvider => "settle_with_provider",
            Self::DistributePreimage => "distribute_preimage",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    Done,
    /// Nothing to do, e.g. exact leaves were already held.
    Skipped,
    Failed(SdkError),
}

#[derive(Debug, Clone)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub outcome: PhaseOutcome,
    pub elapsed: Duration,
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub phases: Vec<PhaseRecord>,
    /// Transfers this operation started, claimed or cancelled.
    pub transfer_ids: Vec<String>,
    pub started_at: Instant,
    pub finished_at: Option<Instant>,
}

impl Operation {
    fn new(kind: OperationKind) -> Self {
        Self {
            id: OperationId::next(),
            kind,
            status: OperationStatus::Running,
            phases: Vec::new(),
            transfer_ids: Vec::new(),
            started_at: Instant::now(),
            finished_at: None,
        }
    }

    fn link(&mut self, transfer_id: &str) -> bool {
        if self.transfer_ids.iter().any(|id| id == transfer_id) {
            return false;
        }
        self.transfer_ids.push(transfer_id.to_owned());
        true
    }

    fn finish(&mut self, status: OperationStatus) {
        self.status = status;
        self.finished_at = Some(Instant::now());
    }
}

/// A failed operation: the error, the phase it surfaced in and the phases
/// that ran before.
#[derive(Debug, Clone)]
pub struct OperationError {
    pub operation_id: OperationId,
    pub error: SdkError,
    pub failed_phase: Phase,
    pub history: Vec<PhaseRecord>,
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.operation_id, self.failed_phase, self.error)
    }
}

impl std::error::Error for OperationError {}

impl From<OperationError> for SdkError {
    fn from(e: OperationError) -> Self {
        e.error
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Polling schedule while waiting on a counterparty, e.g. for the swap
/// provider's counter transfer to become claimable.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Polls before giving up, the first one included.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Wait before poll `attempt + 1` (0-indexed).
    pub(crate) fn backoff_for(&self, attempt: u32) -> Duration {
        let ms = self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(ms as u64).min(self.max_backoff)
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Where operation records go.
pub trait OperationStore: Send + Sync {
    fn begin(&self, op: &Operation);

    fn record_phase(&self, id: OperationId, record: PhaseRecord);

    fn link_transfer(&self, id: OperationId, transfer_id: &str);

    fn finish(&self, id: OperationId, status: OperationStatus);

    fn get(&self, id: OperationId) -> Option<Operation>;

    /// Operations that have not finished.
    fn running(&self) -> Vec<Operation>;

    /// Operations that touched `transfer_id`, oldest first.
    fn for_transfer(&self, transfer_id: &str) -> Vec<Operation>;
}

/// In-memory [`OperationStore`] that keeps every running operation and the
/// last `capacity` finished ones.
pub struct OperationLog {
    capacity: usize,
    inner: RwLock<LogInner>,
}

#[derive(Default)]
struct LogInner {
    ops: HashMap<OperationId, Operation>,
    finished: VecDeque<OperationId>,
}

impl OperationLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            inner: RwLock::new(LogInner::default()),
        }
    }
}

impl Default for OperationLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_OPERATION_HISTORY)
    }
}

impl OperationStore for OperationLog {
    fn begin(&self, op: &Operation) {
        self.inner.write().unwrap().ops.insert(op.id, op.clone());
    }

    fn record_phase(&self, id: OperationId, record: PhaseRecord) {
        if let Some(op) = self.inner.write().unwrap().ops.get_mut(&id) {
            op.phases.push(record);
        }
    }

    fn link_transfer(&self, id: OperationId, transfer_id: &str) {
        if let Some(op) = self.inner.write().unwrap().ops.get_mut(&id) {
            op.link(transfer_id);
        }
    }

    fn finish(&self, id: OperationId, status: OperationStatus) {
        let mut inner = self.inner.write().unwrap();
        let Some(op) = inner.ops.get_mut(&id) else {
            return;
        };
        op.finish(status);
        inner.finished.push_back(id);
        while inner.finished.len() > self.capacity {
            if let Some(evicted) = inner.finished.pop_front() {
                inner.ops.remove(&evicted);
            }
        }
    }

    fn get(&self, id: OperationId) -> Option<Operation> {
        self.inner.read().unwrap().ops.get(&id).cloned()
    }

    fn running(&self) -> Vec<Operation> {
        let mut ops: Vec<Operation> = self
            .inner
            .read()
            .unwrap()
            .ops
            .values()
            .filter(|op| op.status == OperationStatus::Running)
            .cloned()
            .collect();
        ops.sort_by_key(|op| op.id);
        ops
    }

    fn for_transfer(&self, transfer_id: &str) -> Vec<Operation> {
        let mut ops: Vec<Operation> = self
            .inner
            .read()
            .unwrap()
            .ops
            .values()
            .filter(|op| op.transfer_ids.iter().any(|id| id == transfer_id))
            .cloned()
            .collect();
        ops.sort_by_key(|op| op.id);
        ops
    }
}

// ---------------------------------------------------------------------------
// OperationTracker
// ---------------------------------------------------------------------------

/// The running side of an [`Operation`]: mirrors every change to the store
/// and ends in exactly one of `succeed`, `fail` or `partial`.
pub(crate) struct OperationTracker {
    store: Arc<dyn OperationStore>,
    op: Operation,
}

impl OperationTracker {
    pub fn start(store: Arc<dyn OperationStore>, kind: OperationKind) -> Self {
        let op = Operation::new(kind);
        store.begin(&op);
        debug!(op_id = %op.id, kind = %kind, "operation started");
        Self { store, op }
    }

    pub fn id(&self) -> OperationId {
        self.op.id
    }

    fn record(&mut self, phase: Phase, outcome: PhaseOutcome, elapsed: Duration) {
        let record = PhaseRecord {
            phase,
            outcome,
            elapsed,
        };
        self.store.record_phase(self.op.id, record.clone());
        self.op.phases.push(record);
    }

    pub fn done(&mut self, phase: Phase, elapsed: Duration) {
        self.record(phase, PhaseOutcome::Done, elapsed);
    }

    pub fn skipped(&mut self, phase: Phase) {
        self.record(phase, PhaseOutcome::Skipped, Duration::ZERO);
    }

    /// Records a failure that does not end the operation, e.g. one transfer
    /// of a batch claim.
    pub fn failed(&mut self, phase: Phase, error: SdkError, elapsed: Duration) {
        if let Some(id) = error.transfer_id() {
            self.link_transfer(id);
        }
        self.record(phase, PhaseOutcome::Failed(error), elapsed);
    }

    pub fn link_transfer(&mut self, transfer_id: &str) {
        if self.op.link(transfer_id) {
            self.store.link_transfer(self.op.id, transfer_id);
        }
    }

    pub fn succeed(mut self) {
        self.op.finish(OperationStatus::Succeeded);
        self.store.finish(self.op.id, OperationStatus::Succeeded);
    }

    pub fn fail(self, phase: Phase, error: SdkError) -> OperationError {
        self.end(OperationStatus::Failed, phase, error)
    }

    pub fn partial(self, phase: Phase, error: SdkError) -> OperationError {
        self.end(OperationStatus::PartiallyCompleted, phase, error)
    }

    fn end(mut self, status: OperationStatus, phase: Phase, error: SdkError) -> OperationError {
        if let Some(id) = error.transfer_id() {
            self.link_transfer(id);
        }
        self.op.finish(status);
        self.store.finish(self.op.id, status);
        OperationError {
            operation_id: self.op.id,
            error,
            failed_phase: phase,
            history: self.op.phases,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.backoff_for(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(350));
    }

    #[test]
    fn stuck_send_is_found_by_its_transfer() {
        let log = Arc::new(OperationLog::default());
        let mut tracker = OperationTracker::start(log.clone(), OperationKind::Transfer);
        let id = tracker.id();

        tracker.done(Phase::SelectLeaves, Duration::from_millis(1));
        tracker.skipped(Phase::SwapLeaves);
        tracker.done(Phase::SignRefunds, Duration::from_millis(3));
        assert_eq!(log.running().len(), 1);

        let err = tracker.fail(
            Phase::TweakKeys,
            SdkError::TransferStuck {
                transfer_id: "t-1".to_owned(),
            },
        );
        assert_eq!(err.operation_id, id);
        assert_eq!(err.failed_phase, Phase::TweakKeys);
        assert_eq!(err.history.len(), 3);
        assert!(log.running().is_empty());

        let found = log.for_transfer("t-1");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].status, OperationStatus::Failed);
        assert_eq!(found[0].phases[1].outcome, PhaseOutcome::Skipped);
        assert!(log.for_transfer("t-2").is_empty());
    }

    #[test]
    fn batch_claim_links_every_transfer_it_touched() {
        let log = Arc::new(OperationLog::default());
        let mut tracker = OperationTracker::start(log.clone(), OperationKind::Claim);
        let id = tracker.id();

        tracker.link_transfer("a");
        tracker.done(Phase::ClaimTransfer("a".to_owned()), Duration::ZERO);
        tracker.failed(
            Phase::ClaimTransfer("b".to_owned()),
            SdkError::ClaimVerificationFailed {
                transfer_id: "b".to_owned(),
                leaf_id: "leaf".to_owned(),
            },
            Duration::ZERO,
        );
        tracker.link_transfer("a");
        let err = tracker.partial(Phase::ClaimTransfer("b".to_owned()), SdkError::InvalidRequest);

        let op = log.get(id).unwrap();
        assert_eq!(op.status, OperationStatus::PartiallyCompleted);
        assert_eq!(op.transfer_ids, vec!["a".to_owned(), "b".to_owned()]);
        assert_eq!(err.to_string(), format!("[{id}] claim_transfer(b): invalid request"));
    }

    #[test]
    fn log_drops_oldest_finished_operations() {
        let log = Arc::new(OperationLog::with_capacity(2));
        let running = OperationTracker::start(log.clone(), OperationKind::Swap);
        let ids: Vec<OperationId> = (0..3)
            .map(|_| {
                let tracker = OperationTracker::start(log.clone(), OperationKind::Cancel);
                let id = tracker.id();
                tracker.succeed();
                id
            })
            .collect();

        assert!(log.get(ids[0]).is_none());
        assert!(log.get(ids[1]).is_some());
        assert!(log.get(ids[2]).is_some());
        assert_eq!(log.running()[0].id, running.id());
    }
}
