//! Device layer of the SDIO mailbox transport.
//!
//! A [`Device`] owns one attached target. It runs the interrupt service
//! routine ([`Device::dsr`]) that turns status snapshots into mailbox
//! fetches, reassembles bundled receives, validates every message against
//! the lookahead that announced it and hands it up through
//! [`HostCallbacks`]. Sends go the other way through [`Device::send`].
//!
//! The `sim` feature adds an in-memory target for tests and demos.

mod bundle;
pub mod callbacks;
pub mod config;
pub mod device;
pub mod error;
pub mod irq;
mod recv;
pub mod registers;
pub mod send;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod unit;
mod validate;

pub use callbacks::HostCallbacks;
pub use config::{BundleConfig, DeviceConfig, IrqConfig, DEFAULT_BLOCK_SIZE};
pub use device::{Device, DeviceStats, PENDING_RECV_POLLS};
pub use error::{DeviceError, Result, SendError};
pub use irq::DsrOutcome;
pub use registers::{IrqEnable, IrqSnapshot};
pub use send::Outbound;
pub use unit::{ReceiveUnit, RxFlags, UnitCompletion};
