//! Boot protocol drivers.
//!
//! A protocol owns everything from "config entry selected" to the jump
//! into the kernel. Only `ultra` is implemented; the registry exists so
//! the entry picker can complain about unknown names in one place.

pub mod ultra;

/// Names accepted for the `protocol` key.
pub const KNOWN_PROTOCOLS: &[&str] = &["ultra"];

pub fn is_known_protocol(name: &str) -> bool {
    KNOWN_PROTOCOLS.contains(&name)
}
