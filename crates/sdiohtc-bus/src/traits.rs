use crate::error::Result;
use crate::request::{RequestFlags, TransferOutcome};

/// The platform's physical bus binding.
///
/// This is the only downward collaborator of the transport. It is owned by
/// the queue's worker thread, so implementations may block and are never
/// re-entered.
pub trait RawBus: Send + 'static {
    /// Execute one transfer of `length` bytes at `address`.
    ///
    /// Reads fill `buffer[..length]`. Writes send the bytes in `buffer`; when
    /// `flags` carries dummy space, `length` exceeds `buffer.len()` by that
    /// many bytes and the hardware supplies them.
    fn raw_transfer(
        &mut self,
        address: u32,
        buffer: &mut [u8],
        length: usize,
        flags: RequestFlags,
    ) -> Result<()>;

    /// Take exclusive ownership of the bus before a batch of transfers.
    fn claim(&mut self) {}

    /// Give bus ownership back after a batch.
    fn release(&mut self) {}
}

/// Completion of an asynchronous transfer, run on the worker thread.
pub trait AsyncCompletion: Send + 'static {
    fn complete(self: Box<Self>, outcome: TransferOutcome);
}

impl<F> AsyncCompletion for F
where
    F: FnOnce(TransferOutcome) + Send + 'static,
{
    fn complete(self: Box<Self>, outcome: TransferOutcome) {
        (*self)(outcome)
    }
}
