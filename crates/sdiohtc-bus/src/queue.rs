//! Single-worker bus request queue.
//!
//! Every physical transfer, synchronous or asynchronous, goes through one
//! FIFO and is executed by one worker thread that owns the [`RawBus`].
//! Requests are drawn from a fixed pool; an empty pool is reported to the
//! caller immediately as backpressure.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use bytes::BytesMut;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::error::{BusError, Result};
use crate::mailbox::MailboxMap;
use crate::request::{RequestFlags, Transfer, TransferOutcome};
use crate::traits::{AsyncCompletion, RawBus};

/// Default size of the request pool.
pub const DEFAULT_POOL_SIZE: usize = 64;

enum Completion {
    Sync(SyncSender<Box<BusRequest>>),
    Async(Box<dyn AsyncCompletion>),
}

/// A pooled request slot.
struct BusRequest {
    address: u32,
    buffer: BytesMut,
    length: usize,
    flags: RequestFlags,
    completion: Option<Completion>,
    status: Result<()>,
}

impl BusRequest {
    fn empty() -> Self {
        Self {
            address: 0,
            buffer: BytesMut::new(),
            length: 0,
            flags: RequestFlags::empty(),
            completion: None,
            status: Ok(()),
        }
    }

    fn fill(&mut self, transfer: Transfer, completion: Completion) {
        self.address = transfer.address;
        self.buffer = transfer.buffer;
        self.length = transfer.length;
        self.flags = transfer.flags;
        self.completion = Some(completion);
        self.status = Ok(());
    }

    fn take_outcome(&mut self) -> TransferOutcome {
        TransferOutcome {
            buffer: std::mem::take(&mut self.buffer),
            status: std::mem::replace(&mut self.status, Ok(())),
        }
    }
}

/// A rejected asynchronous submission; the caller gets everything back.
pub struct Rejected<C> {
    pub error: BusError,
    pub transfer: Transfer,
    pub completion: C,
}

impl<C> std::fmt::Debug for Rejected<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .field("transfer", &self.transfer)
            .finish_non_exhaustive()
    }
}

/// Counters kept by the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub submitted: u64,
    pub executed: u64,
    pub failed: u64,
    pub pool_exhausted: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
    pool_exhausted: AtomicU64,
}

struct QueueState {
    free: Vec<Box<BusRequest>>,
    pending: VecDeque<Box<BusRequest>>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    signal: Condvar,
    map: MailboxMap,
    capacity: usize,
    counters: Counters,
}

type Refused<C> = (BusError, Transfer, C);

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, mut request: Box<BusRequest>) {
        request.completion = None;
        request.buffer = BytesMut::new();
        self.lock().free.push(request);
    }

    /// Take a slot from the pool and append it to the pending FIFO.
    fn enqueue<C>(
        &self,
        transfer: Transfer,
        completion: C,
        wrap: impl FnOnce(C) -> Completion,
    ) -> std::result::Result<(), Refused<C>> {
        let mut state = self.lock();
        if state.shutdown {
            return Err((BusError::Shutdown, transfer, completion));
        }
        let Some(mut request) = state.free.pop() else {
            drop(state);
            self.counters.pool_exhausted.fetch_add(1, Ordering::Relaxed);
            warn!(capacity = self.capacity, "bus request pool exhausted");
            let error = BusError::PoolExhausted {
                capacity: self.capacity,
            };
            return Err((error, transfer, completion));
        };
        request.fill(transfer, wrap(completion));
        state.pending.push_back(request);
        drop(state);

        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.signal.notify_one();
        Ok(())
    }
}

/// Handle to the request queue and its worker thread.
pub struct BusQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BusQueue {
    /// Start a worker that owns `bus`, with a pool of `pool_size` requests.
    pub fn start<B: RawBus>(bus: B, map: MailboxMap, pool_size: usize) -> Result<Self> {
        if pool_size == 0 {
            return Err(BusError::InvalidRequest(
                "request pool must hold at least one request".to_string(),
            ));
        }
        let free = (0..pool_size)
            .map(|_| Box::new(BusRequest::empty()))
            .collect();
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                free,
                pending: VecDeque::with_capacity(pool_size),
                shutdown: false,
            }),
            signal: Condvar::new(),
            map,
            capacity: pool_size,
            counters: Counters::default(),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("sdiohtc-bus".to_string())
            .spawn(move || worker_loop(&worker_shared, bus))
            .map_err(|err| BusError::InvalidRequest(format!("failed to spawn bus worker: {err}")))?;

        debug!(pool_size, "bus worker started");
        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Mailbox table used for write-address fixups.
    pub fn mailbox_map(&self) -> &MailboxMap {
        &self.shared.map
    }

    /// Submit a transfer and block until the worker has executed it.
    ///
    /// Returns the buffer (filled, for reads) on success.
    pub fn submit_sync(&self, transfer: Transfer) -> Result<BytesMut> {
        transfer.flags.check(true)?;
        let (tx, rx) = mpsc::sync_channel(1);
        self.shared
            .enqueue(transfer, tx, Completion::Sync)
            .map_err(|(err, _, _)| err)?;

        let mut request = rx.recv().map_err(|_| BusError::Shutdown)?;
        let outcome = request.take_outcome();
        self.shared.release(request);
        outcome.status.map(|()| outcome.buffer)
    }

    /// Queue a transfer and return immediately; `completion` runs on the
    /// worker thread once the transfer has executed.
    ///
    /// `Ok(())` means the request is pending.
    pub fn submit_async<C: AsyncCompletion>(
        &self,
        transfer: Transfer,
        completion: C,
    ) -> std::result::Result<(), Rejected<C>> {
        if let Err(error) = transfer.flags.check(false) {
            return Err(Rejected {
                error,
                transfer,
                completion,
            });
        }
        self.shared
            .enqueue(transfer, completion, |c| Completion::Async(Box::new(c)))
            .map_err(|(error, transfer, completion)| Rejected {
                error,
                transfer,
                completion,
            })
    }

    /// Await a transfer executed through the asynchronous path.
    #[cfg(feature = "async")]
    pub async fn submit_await(&self, mut transfer: Transfer) -> Result<BytesMut> {
        transfer.flags = transfer.flags.into_async();
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.submit_async(transfer, move |outcome: TransferOutcome| {
            let _ = tx.send(outcome);
        })
        .map_err(|rejected| rejected.error)?;
        let outcome = rx.await.map_err(|_| BusError::Shutdown)?;
        outcome.status.map(|()| outcome.buffer)
    }

    /// Snapshot of the queue counters.
    pub fn stats(&self) -> QueueStats {
        let c = &self.shared.counters;
        QueueStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            executed: c.executed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            pool_exhausted: c.pool_exhausted.load(Ordering::Relaxed),
        }
    }

    /// Number of free request slots.
    pub fn available(&self) -> usize {
        self.shared.lock().free.len()
    }

    /// Pool size this queue was started with.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Stop the worker after the request it is executing, if any.
    ///
    /// Requests still queued complete with [`BusError::Shutdown`].
    pub fn shutdown(&self) {
        self.shared.lock().shutdown = true;
        self.shared.signal.notify_all();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("bus worker panicked");
            }
            debug!("bus worker stopped");
        }
    }
}

impl Drop for BusQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for BusQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusQueue")
            .field("capacity", &self.shared.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

fn worker_loop<B: RawBus>(shared: &Shared, mut bus: B) {
    loop {
        let mut state = shared.lock();
        while state.pending.is_empty() && !state.shutdown {
            state = shared
                .signal
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.shutdown {
            break;
        }
        drop(state);

        bus.claim();
        loop {
            let request = {
                let mut state = shared.lock();
                if state.shutdown {
                    break;
                }
                match state.pending.pop_front() {
                    Some(request) => request,
                    None => break,
                }
            };
            execute(shared, &mut bus, request);
        }
        bus.release();
    }

    let leftovers: Vec<_> = shared.lock().pending.drain(..).collect();
    if !leftovers.is_empty() {
        debug!(count = leftovers.len(), "failing requests queued at shutdown");
    }
    for mut request in leftovers {
        request.status = Err(BusError::Shutdown);
        complete(shared, request);
    }
}

fn execute<B: RawBus>(shared: &Shared, bus: &mut B, mut request: Box<BusRequest>) {
    let status = perform(shared, bus, &mut request);
    request.status = status;
    shared.counters.executed.fetch_add(1, Ordering::Relaxed);
    if let Err(err) = &request.status {
        shared.counters.failed.fetch_add(1, Ordering::Relaxed);
        warn!(address = request.address, length = request.length, error = %err, "bus transfer failed");
    }
    complete(shared, request);
}

fn perform<B: RawBus>(shared: &Shared, bus: &mut B, request: &mut BusRequest) -> Result<()> {
    let dummy = usize::from(request.flags.dummy_space());
    let available = if request.flags.is_write() {
        request.buffer.len() + dummy
    } else {
        request.buffer.len()
    };
    if request.length > available {
        return Err(BusError::InvalidRequest(format!(
            "length {} exceeds buffer of {} bytes",
            request.length,
            request.buffer.len()
        )));
    }
    let address = if request.flags.is_write() {
        shared
            .map
            .fixup_write_address(request.address, request.length, request.flags)?
    } else {
        request.address
    };
    trace!(
        address,
        length = request.length,
        flags = ?request.flags,
        "bus transfer"
    );
    bus.raw_transfer(address, &mut request.buffer, request.length, request.flags)
}

fn complete(shared: &Shared, mut request: Box<BusRequest>) {
    match request.completion.take() {
        Some(Completion::Sync(tx)) => {
            // The caller releases the slot once it has read the outcome.
            if let Err(mpsc::SendError(request)) = tx.send(request) {
                shared.release(request);
            }
        }
        Some(Completion::Async(callback)) => {
            let outcome = request.take_outcome();
            shared.release(request);
            callback.complete(outcome);
        }
        None => shared.release(request),
    }
}
