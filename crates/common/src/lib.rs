//! Shared types used across the PPOB workspace.

pub mod types;

pub use types::{Money, PartnerId, TenantId, TransactionId};
