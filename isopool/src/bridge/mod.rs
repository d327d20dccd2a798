//! Messages exchanged with execution units and their stream framing.
//!
//! - **protocol**: `UnitRequest` / `UnitResponse` and identifiers
//! - **codec**: JSON framing for AsyncRead/AsyncWrite (process units)

pub mod codec;
pub mod protocol;
