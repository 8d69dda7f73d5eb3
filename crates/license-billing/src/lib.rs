//! Billing cycles and usage accounting for licensed, metered products.
//!
//! Usage is recorded per license and usage group. Counter groups add up
//! events, gauge groups hold levels over time. Billing cycles tile the
//! timeline per owner, and chargeable usage is computed per cycle.

pub mod config;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod storage;

pub use config::BillingConfig;
pub use error::{BillingError, Result};
