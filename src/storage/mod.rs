//! Durable state: transfers, bridge rows, and the serial-relation recovery
//! anchor, behind the [`StorageApi`] seam.

mod api;
pub use api::{BridgeClose, Result, SettlementTx, StorageApi};
mod memory;
pub use memory::InMemoryStorage;
mod pg;
pub use pg::PgStorage;
