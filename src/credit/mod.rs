//! Credit grants and the burn-down engine that depletes them against metered usage.

pub mod balance;
pub mod connector;
pub mod engine;
pub mod grant;
pub mod history;
pub mod owner;
pub mod period;
pub mod repository;

pub use balance::{BalanceMap, GrantBalanceSnapshot};
pub use connector::{CreditConnector, CreditConnectorOptions};
pub use engine::{Engine, Granularity, RunResult, UsageQuery};
pub use grant::{CreateGrantInput, ExpirationDuration, ExpirationPeriod, Grant, OwnerRef};
pub use history::{BurnReason, GrantBurnDownHistory, GrantBurnDownHistorySegment, GrantUsage};
pub use owner::{OwnerConnector, OwnerMeta};
pub use period::{Period, Recurrence, RecurrenceInterval};
pub use repository::{BalanceSnapshotRepo, GrantRepo};
