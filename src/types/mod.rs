//! Core domain types of the settlement engine.

mod transfer;
pub use transfer::*;
mod bridge;
pub use bridge::*;
mod contracts;
pub use contracts::*;
