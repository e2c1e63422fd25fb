pub mod health;
pub mod metrics;
pub mod operator;
pub mod partners;
pub mod transactions;
