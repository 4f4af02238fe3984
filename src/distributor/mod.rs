//! Communication plans and the transfers built on them.

pub mod combine;
pub mod plan;
pub mod transfer;

pub use combine::{Combinable, CombineMode};
pub use plan::Distributor;
pub use transfer::{Export, Import, TransferKind, TransferPlan};
