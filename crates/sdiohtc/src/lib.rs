//! SDIO mailbox HTC transport.
//!
//! sdiohtc moves HTC messages between a host and a target over the four
//! SDIO mailboxes: bus request queueing, message framing with trailer
//! lookaheads, and the interrupt-driven receive engine with bundling.
//!
//! # Crate Structure
//!
//! - [`bus`]: Mailbox address map, request flags and the serialized bus queue
//! - [`frame`]: HTC header, lookahead and trailer codec
//! - [`device`]: Interrupt service, receive and send paths (simulated target behind `sim`)

/// Re-export bus types.
pub mod bus {
    pub use sdiohtc_bus::*;
}

/// Re-export frame types.
pub mod frame {
    pub use sdiohtc_frame::*;
}

/// Re-export device types.
pub mod device {
    pub use sdiohtc_device::*;
}
