//! Utilities used by the Bittorrent Engine Project.

extern crate crypto;

/// Bittorrent specific types.
pub mod bt;

/// Length validation errors.
pub mod error;

/// Working with and expressing SHA-1 and SHA-256 values.
pub mod sha;

/// Generating sequences of ids.
pub mod trans;

/// Wraparound aware sequence number arithmetic.
pub mod wrap;
