//! Group Commit
//!
//! Batches concurrent WAL submissions into one write and one sync.
//!
//! ## Worker Loop
//! ```text
//!   submitters ──► bounded queue ──► worker thread
//!                                     │
//!                                     ├─ recv()            (blocks, no timeout)
//!                                     ├─ try_recv / recv_deadline(first + delay)
//!                                     │    ... up to max_batch_size
//!                                     ├─ encode: D D C | D C | D D D C
//!                                     ├─ one write, one sync
//!                                     └─ resolve every handle
//! ```
//!
//! The first read blocks so a commit arriving while the worker is idle is
//! never left behind by a timed-out wait.
//!
//! Every submission also carries a [`CommitTicket`]. The worker resolves it
//! before answering the handle, so other threads can learn the outcome of a
//! submission they did not make. Once a batch fails the log stays unhealthy,
//! so the failed submissions of one submitter always form a suffix of its
//! submissions until health is restored.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::{Config, WalDurability};
use crate::error::{AtlasError, Result};

use super::entry::RecordKind;
use super::writer::WalWriter;

const PENDING: u8 = 0;
const CLAIMED: u8 = 1;
const CANCELLED: u8 = 2;

/// Tuning for the group commit worker
#[derive(Debug, Clone)]
pub struct GroupCommitConfig {
    pub durability: WalDurability,
    pub max_batch_size: usize,
    pub max_batch_delay: Duration,
    pub queue_capacity: usize,
    pub flush_retry_limit: u32,
}

impl From<&Config> for GroupCommitConfig {
    fn from(config: &Config) -> Self {
        Self {
            durability: config.wal_durability,
            max_batch_size: config.wal_max_batch_size,
            max_batch_delay: config.wal_max_batch_delay,
            queue_capacity: config.wal_queue_capacity,
            flush_retry_limit: config.flush_retry_limit,
        }
    }
}

impl Default for GroupCommitConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// LSNs assigned to a committed submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    /// One LSN per data record, in submission order
    pub lsns: Vec<u64>,

    /// LSN of the commit marker closing the submission
    pub commit_lsn: u64,
}

/// Counters kept by the worker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalStats {
    /// Batches written successfully
    pub batches: u64,
    /// Submissions committed
    pub submissions: u64,
    /// Data records committed
    pub records: u64,
    /// Hardware syncs issued
    pub syncs: u64,
    /// Batches that failed after all retries
    pub failed_batches: u64,
    pub bytes_written: u64,
}

/// How a submission ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketOutcome {
    Durable { commit_lsn: u64 },
    Failed,
}

#[derive(Debug, Default)]
struct TicketState {
    outcome: Mutex<Option<TicketOutcome>>,
    resolved: Condvar,
}

/// Shared view of one submission's outcome
///
/// Cloneable and pollable, unlike [`CommitHandle`]. Resolved exactly once;
/// later resolutions are ignored.
#[derive(Debug, Clone, Default)]
pub struct CommitTicket {
    state: Arc<TicketState>,
}

impl CommitTicket {
    fn resolve(&self, outcome: TicketOutcome) {
        let mut slot = self.state.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.state.resolved.notify_all();
        }
    }

    /// Outcome if the submission has been resolved
    pub fn outcome(&self) -> Option<TicketOutcome> {
        *self.state.outcome.lock()
    }

    /// Block until the submission is resolved
    pub fn wait(&self) -> TicketOutcome {
        let mut slot = self.state.outcome.lock();
        loop {
            if let Some(outcome) = *slot {
                return outcome;
            }
            self.state.resolved.wait(&mut slot);
        }
    }
}

/// A submission waiting for the worker
struct PendingCommit {
    records: Vec<Vec<u8>>,
    state: Arc<AtomicU8>,
    ticket: CommitTicket,
    done: Sender<Result<CommitReceipt>>,
}

impl PendingCommit {
    fn fail(&self, reason: &str) {
        self.ticket.resolve(TicketOutcome::Failed);
        let _ = self
            .done
            .send(Err(AtlasError::DurabilityFailure(reason.to_string())));
    }
}

impl Drop for PendingCommit {
    fn drop(&mut self) {
        // Cancelled, or dropped with the queue when the worker stopped
        self.ticket.resolve(TicketOutcome::Failed);
    }
}

enum WalRequest {
    Commit(PendingCommit),
    Sync(Sender<Result<()>>),
    Checkpoint(Sender<Result<u64>>),
    RestoreHealth(Sender<Result<()>>),
}

/// Completion signal for one submission
#[must_use = "a submission is only known durable once waited on"]
pub struct CommitHandle {
    state: Arc<AtomicU8>,
    ticket: CommitTicket,
    done: Receiver<Result<CommitReceipt>>,
}

impl CommitHandle {
    /// Block until the batch holding this submission is durable or failed
    pub fn wait(self) -> Result<CommitReceipt> {
        match self.done.recv() {
            Ok(result) => result,
            Err(_) => Err(AtlasError::DurabilityFailure(
                "WAL worker stopped before the submission was written".to_string(),
            )),
        }
    }

    /// Withdraw the submission if the worker has not claimed it yet
    ///
    /// Returns the handle back when the submission is already part of a batch;
    /// it will then commit or fail with that batch.
    pub fn cancel(self) -> std::result::Result<(), CommitHandle> {
        match self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.ticket.resolve(TicketOutcome::Failed);
                Ok(())
            }
            Err(_) => Err(self),
        }
    }

    /// Ticket resolved with this submission's outcome
    pub fn ticket(&self) -> CommitTicket {
        self.ticket.clone()
    }
}

struct Shared {
    healthy: AtomicBool,
    durable_lsn: AtomicU64,
    stats: Mutex<WalStats>,
    injected_failures: AtomicU32,
}

impl Shared {
    /// Consume one injected I/O failure, if any are armed
    fn injected_failure(&self) -> Result<()> {
        let armed = self
            .injected_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            return Err(AtlasError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected sync failure",
            )));
        }
        Ok(())
    }
}

/// Front end of the WAL: owns the worker thread and its queue
pub struct GroupCommitter {
    sender: RwLock<Option<Sender<WalRequest>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl GroupCommitter {
    /// Start a worker that appends to `writer`
    pub fn start(writer: WalWriter, config: GroupCommitConfig) -> Result<Self> {
        let (sender, receiver) = channel::bounded(config.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            healthy: AtomicBool::new(true),
            durable_lsn: AtomicU64::new(writer.next_lsn().saturating_sub(1)),
            stats: Mutex::new(WalStats::default()),
            injected_failures: AtomicU32::new(0),
        });

        let worker = Worker {
            writer,
            config,
            receiver,
            shared: Arc::clone(&shared),
        };
        let handle = thread::Builder::new()
            .name("atlasdb-wal".to_string())
            .spawn(move || worker.run())?;

        Ok(Self {
            sender: RwLock::new(Some(sender)),
            worker: Mutex::new(Some(handle)),
            shared,
        })
    }

    /// Queue a submission, blocking while the queue is full
    ///
    /// Every record becomes one data frame; the submission is closed by a
    /// commit marker and is atomic on recovery.
    pub fn submit(&self, records: Vec<Vec<u8>>) -> Result<CommitHandle> {
        self.ensure_healthy()?;
        let (pending, handle) = Self::pending(records);

        let sender = self.sender.read();
        let sender = sender.as_ref().ok_or_else(Self::closed)?;
        sender
            .send(WalRequest::Commit(pending))
            .map_err(|_| Self::closed())?;
        Ok(handle)
    }

    /// Queue a submission without blocking
    ///
    /// Fails with `CapacityExceeded` when the queue is full.
    pub fn try_submit(&self, records: Vec<Vec<u8>>) -> Result<CommitHandle> {
        self.ensure_healthy()?;
        let (pending, handle) = Self::pending(records);

        let sender = self.sender.read();
        let sender = sender.as_ref().ok_or_else(Self::closed)?;
        match sender.try_send(WalRequest::Commit(pending)) {
            Ok(()) => Ok(handle),
            Err(TrySendError::Full(_)) => Err(AtlasError::CapacityExceeded(format!(
                "WAL queue full ({} pending)",
                sender.len()
            ))),
            Err(TrySendError::Disconnected(_)) => Err(Self::closed()),
        }
    }

    /// Submit and wait for durability
    pub fn commit(&self, records: Vec<Vec<u8>>) -> Result<CommitReceipt> {
        self.submit(records)?.wait()
    }

    /// Force any written but unsynced frames to disk
    pub fn sync(&self) -> Result<()> {
        self.request(WalRequest::Sync)
    }

    /// Truncate the log once every store holds its effects durably
    ///
    /// Returns the LSN the new, empty log starts at. Callers must make sure no
    /// submission is in flight.
    pub fn checkpoint(&self) -> Result<u64> {
        self.request(WalRequest::Checkpoint)
    }

    /// Try to bring an unhealthy log back into service
    ///
    /// A no-op on a healthy log. Queuing it anyway could let it run right
    /// after a failure that happens later, ahead of submissions that were
    /// meant to fail with that batch.
    pub fn restore_health(&self) -> Result<()> {
        if self.is_healthy() {
            return Ok(());
        }
        self.request(WalRequest::RestoreHealth)
    }

    pub fn is_healthy(&self) -> bool {
        self.shared.healthy.load(Ordering::Acquire)
    }

    /// Highest LSN known to be durable (or acknowledged under Async)
    pub fn durable_lsn(&self) -> u64 {
        self.shared.durable_lsn.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> WalStats {
        self.shared.stats.lock().clone()
    }

    /// Make the next `count` write attempts fail as if the device did
    #[doc(hidden)]
    pub fn inject_io_failures(&self, count: u32) {
        self.shared.injected_failures.store(count, Ordering::Release);
    }

    /// Stop accepting submissions, drain the queue and join the worker
    pub fn close(&self) {
        self.sender.write().take();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("WAL worker panicked");
            }
        }
    }

    fn pending(records: Vec<Vec<u8>>) -> (PendingCommit, CommitHandle) {
        let state = Arc::new(AtomicU8::new(PENDING));
        let ticket = CommitTicket::default();
        let (done_tx, done_rx) = channel::bounded(1);
        (
            PendingCommit {
                records,
                state: Arc::clone(&state),
                ticket: ticket.clone(),
                done: done_tx,
            },
            CommitHandle {
                state,
                ticket,
                done: done_rx,
            },
        )
    }

    fn request<T>(&self, make: impl FnOnce(Sender<Result<T>>) -> WalRequest) -> Result<T> {
        let (reply_tx, reply_rx) = channel::bounded(1);
        {
            let sender = self.sender.read();
            let sender = sender.as_ref().ok_or_else(Self::closed)?;
            sender.send(make(reply_tx)).map_err(|_| Self::closed())?;
        }
        reply_rx.recv().map_err(|_| Self::closed())?
    }

    fn ensure_healthy(&self) -> Result<()> {
        if self.is_healthy() {
            Ok(())
        } else {
            Err(AtlasError::DurabilityFailure(
                "log is unhealthy; restore health before writing".to_string(),
            ))
        }
    }

    fn closed() -> AtlasError {
        AtlasError::DurabilityFailure("WAL is closed".to_string())
    }
}

impl Drop for GroupCommitter {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for GroupCommitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupCommitter")
            .field("healthy", &self.is_healthy())
            .field("durable_lsn", &self.durable_lsn())
            .finish()
    }
}

// =============================================================================
// Worker
// =============================================================================

struct Worker {
    writer: WalWriter,
    config: GroupCommitConfig,
    receiver: Receiver<WalRequest>,
    shared: Arc<Shared>,
}

impl Worker {
    fn run(mut self) {
        info!(path = %self.writer.path().display(), next_lsn = self.writer.next_lsn(), "WAL worker started");
        let mut deferred: Option<WalRequest> = None;

        loop {
            let first = match deferred.take() {
                Some(request) => request,
                None => match self.next_request() {
                    Some(request) => request,
                    None => break,
                },
            };

            match first {
                WalRequest::Commit(commit) => deferred = self.collect_and_flush(commit),
                control => self.handle_control(control),
            }
        }

        self.idle_sync();
        info!("WAL worker stopped");
    }

    /// Blocking read for the next request; `None` once every sender is gone
    fn next_request(&mut self) -> Option<WalRequest> {
        if self.writer.has_unsynced() {
            match self.receiver.try_recv() {
                Ok(request) => return Some(request),
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) => self.idle_sync(),
            }
        }
        self.receiver.recv().ok()
    }

    /// Drain further commits into a batch and flush it
    ///
    /// A control request met while draining ends the batch and is returned
    /// so it runs right after the flush.
    fn collect_and_flush(&mut self, first: PendingCommit) -> Option<WalRequest> {
        let deadline = Instant::now() + self.config.max_batch_delay;
        let mut batch = vec![first];
        let mut deferred = None;

        while batch.len() < self.config.max_batch_size {
            let next = match self.receiver.try_recv() {
                Ok(request) => request,
                Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => match self.receiver.recv_deadline(deadline) {
                    Ok(request) => request,
                    Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
                },
            };

            match next {
                WalRequest::Commit(commit) => batch.push(commit),
                control => {
                    deferred = Some(control);
                    break;
                }
            }
        }

        self.flush_batch(batch);
        deferred
    }

    fn flush_batch(&mut self, batch: Vec<PendingCommit>) {
        // Claim; cancelled submissions are dropped, closing their channel
        let claimed: Vec<PendingCommit> = batch
            .into_iter()
            .filter(|c| {
                c.state
                    .compare_exchange(PENDING, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            })
            .collect();
        if claimed.is_empty() {
            return;
        }

        if !self.shared.healthy.load(Ordering::Acquire) {
            Self::fail_all(&claimed, "log is unhealthy; restore health before writing");
            return;
        }

        let first_lsn = self.writer.next_lsn();
        let (buf, receipts) = match self.encode(&claimed) {
            Ok(encoded) => encoded,
            Err(e) => {
                self.writer.discard_unwritten(first_lsn);
                self.shared.healthy.store(false, Ordering::Release);
                self.shared.stats.lock().failed_batches += 1;
                error!(error = %e, "Failed to encode WAL batch; log marked unhealthy");
                Self::fail_all(&claimed, &format!("failed to encode batch: {}", e));
                return;
            }
        };

        let mut attempt = 0;
        let outcome = loop {
            match self.write_batch(&buf) {
                Ok(()) => break Ok(()),
                Err(e) if attempt < self.config.flush_retry_limit => {
                    attempt += 1;
                    warn!(attempt, error = %e, "WAL flush failed, retrying");
                    if let Err(e) = self.writer.truncate_to_durable() {
                        break Err(e);
                    }
                }
                Err(e) => break Err(e),
            }
        };

        match outcome {
            Ok(()) => {
                let last_lsn = receipts.last().map(|r| r.commit_lsn).unwrap_or(first_lsn);
                self.shared.durable_lsn.store(last_lsn, Ordering::Release);
                {
                    let mut stats = self.shared.stats.lock();
                    stats.batches += 1;
                    stats.submissions += claimed.len() as u64;
                    stats.records += claimed.iter().map(|c| c.records.len() as u64).sum::<u64>();
                    stats.bytes_written += buf.len() as u64;
                    if self.config.durability == WalDurability::FullSync {
                        stats.syncs += 1;
                    }
                }
                debug!(
                    submissions = claimed.len(),
                    bytes = buf.len(),
                    last_lsn,
                    "WAL batch committed"
                );
                for (commit, receipt) in claimed.iter().zip(receipts) {
                    commit.ticket.resolve(TicketOutcome::Durable {
                        commit_lsn: receipt.commit_lsn,
                    });
                    let _ = commit.done.send(Ok(receipt));
                }
            }
            Err(e) => {
                if let Err(rollback) = self.writer.rollback_to_durable() {
                    error!(error = %rollback, "Failed to cut WAL back to durable offset");
                }
                self.shared.healthy.store(false, Ordering::Release);
                self.shared.stats.lock().failed_batches += 1;
                error!(
                    submissions = claimed.len(),
                    attempts = attempt + 1,
                    error = %e,
                    "WAL batch failed; log marked unhealthy"
                );
                Self::fail_all(
                    &claimed,
                    &format!("batch failed after {} attempts: {}", attempt + 1, e),
                );
            }
        }
    }

    /// Serialize the batch: each submission's data frames, then its marker
    fn encode(&mut self, claimed: &[PendingCommit]) -> Result<(Vec<u8>, Vec<CommitReceipt>)> {
        let mut buf = Vec::new();
        let mut receipts = Vec::with_capacity(claimed.len());

        for commit in claimed {
            let mut lsns = Vec::with_capacity(commit.records.len());
            for record in &commit.records {
                lsns.push(self.writer.encode_frame(RecordKind::Data, record, &mut buf)?);
            }
            let count = (commit.records.len() as u32).to_le_bytes();
            let commit_lsn = self.writer.encode_frame(RecordKind::Commit, &count, &mut buf)?;
            receipts.push(CommitReceipt { lsns, commit_lsn });
        }

        Ok((buf, receipts))
    }

    fn write_batch(&mut self, buf: &[u8]) -> Result<()> {
        self.writer.write(buf)?;
        self.shared.injected_failure()?;
        match self.config.durability {
            WalDurability::FullSync => self.writer.sync(),
            WalDurability::Async => {
                self.writer.acknowledge_written();
                Ok(())
            }
        }
    }

    fn handle_control(&mut self, request: WalRequest) {
        match request {
            WalRequest::Commit(commit) => self.flush_batch(vec![commit]),
            WalRequest::Sync(reply) => {
                let result = if self.shared.healthy.load(Ordering::Acquire) {
                    self.sync_now()
                } else {
                    Err(AtlasError::DurabilityFailure("log is unhealthy".to_string()))
                };
                let _ = reply.send(result);
            }
            WalRequest::Checkpoint(reply) => {
                let result = if self.shared.healthy.load(Ordering::Acquire) {
                    self.writer.reset()
                } else {
                    Err(AtlasError::DurabilityFailure(
                        "cannot checkpoint an unhealthy log".to_string(),
                    ))
                };
                if let Ok(start_lsn) = &result {
                    info!(start_lsn, "WAL checkpointed");
                }
                let _ = reply.send(result);
            }
            WalRequest::RestoreHealth(reply) => {
                let result = self.restore_health();
                let _ = reply.send(result);
            }
        }
    }

    fn restore_health(&mut self) -> Result<()> {
        if self.shared.healthy.load(Ordering::Acquire) {
            return Ok(());
        }
        self.writer.rollback_to_durable()?;
        self.shared.injected_failure()?;
        self.writer.sync()?;
        self.shared.healthy.store(true, Ordering::Release);
        info!(next_lsn = self.writer.next_lsn(), "WAL health restored");
        Ok(())
    }

    fn sync_now(&mut self) -> Result<()> {
        if !self.writer.has_unsynced() {
            return Ok(());
        }
        self.writer.sync()?;
        self.shared.stats.lock().syncs += 1;
        Ok(())
    }

    /// Sync deferred writes when there is nothing else to do
    fn idle_sync(&mut self) {
        if let Err(e) = self.sync_now() {
            warn!(error = %e, "Deferred WAL sync failed");
        }
    }

    fn fail_all(claimed: &[PendingCommit], reason: &str) {
        for commit in claimed {
            commit.fail(reason);
        }
    }
}
