pub mod bus;
pub mod config;
pub mod credit;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use error::{CreditError, CreditResult};
