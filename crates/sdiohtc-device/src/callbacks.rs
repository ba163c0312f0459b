use bytes::BytesMut;
use sdiohtc_frame::NetBuf;

use crate::error::DeviceError;

/// Upward interface to the layer that owns endpoints and credits.
///
/// Receive and fatal notifications run on the thread that called
/// [`Device::dsr`](crate::Device::dsr); transmit completions run on the bus
/// worker thread.
pub trait HostCallbacks: Send + Sync + 'static {
    /// A validated message, header included, truncated to its actual length.
    fn rx_completion(&self, buffer: BytesMut, pipe: u8);

    /// A send finished; `payload` is the buffer handed to `send`.
    fn tx_completion(&self, payload: NetBuf, transfer_id: u32, status: Result<(), DeviceError>);

    /// The target reported a condition the transport cannot recover from.
    fn fatal_event(&self, status: DeviceError);

    /// Buffer for one receive unit, or `None` when none is available.
    fn alloc_rx_buffer(&self, capacity: usize) -> Option<BytesMut> {
        Some(BytesMut::zeroed(capacity))
    }

    /// Scratch buffer for one bundle transfer.
    fn alloc_bundle_buffer(&self, capacity: usize) -> Option<BytesMut> {
        Some(BytesMut::zeroed(capacity))
    }
}
