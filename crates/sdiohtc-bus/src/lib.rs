//! Bus layer of the SDIO mailbox transport.
//!
//! Provides the two pieces everything else builds on:
//! - Mailbox addressing: pipe ↔ mailbox mapping, mailbox windows and
//!   block-size padding with dummy-space encoding
//! - A single-worker request queue that serializes every physical transfer,
//!   synchronous or asynchronous, in submission order
//!
//! The physical bus itself is abstracted by the [`RawBus`] trait.

pub mod error;
pub mod mailbox;
pub mod queue;
pub mod request;
pub mod traits;

pub use error::{BusError, Result};
pub use mailbox::{
    map_service_to_pipe, mailbox_for_pipe, mailbox_to_pipe, padded_length, pipe_to_mailbox,
    Direction, MailboxLayout, MailboxMap, MailboxWindow, INVALID_MAILBOX, MAILBOX_COUNT,
    MAILBOX_USED_COUNT,
};
pub use queue::{BusQueue, QueueStats, Rejected, DEFAULT_POOL_SIZE};
pub use request::{RequestFlags, Transfer, TransferOutcome};
pub use traits::{AsyncCompletion, RawBus};
