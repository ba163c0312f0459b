//! HTC endpoint ids.
//!
//! Endpoint 0 is the HTC control endpoint; the remaining ids are assigned
//! to services when they connect.

/// HTC control endpoint.
pub const CONTROL: u8 = 0;

/// First endpoint available to services.
pub const SERVICE_ENDPOINT_START: u8 = 1;

/// One past the highest valid endpoint id.
pub const ENDPOINT_MAX: u8 = 22;

/// Returns a human-readable name for an endpoint id.
pub fn endpoint_name(id: u8) -> &'static str {
    match id {
        CONTROL => "CONTROL",
        SERVICE_ENDPOINT_START..ENDPOINT_MAX => "SERVICE",
        _ => "INVALID",
    }
}

/// Returns true if `id` is below `max`.
pub fn is_valid(id: u8, max: u8) -> bool {
    id < max
}
