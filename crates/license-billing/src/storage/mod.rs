pub mod connection;
pub mod cycles;
pub mod licenses;
pub mod memory;
pub mod retry;
pub mod usage;

pub use connection::DatabaseConnection;

pub use cycles::{BillingCycleRepository, SqlBillingCycleRepository};

pub use licenses::{LicenseRepository, SqlLicenseRepository};

pub use memory::InMemoryStore;

pub use retry::retry_on_conflict;

pub use usage::{SqlUsageRepository, UsageFilter, UsageRepository, UsageTransaction};
