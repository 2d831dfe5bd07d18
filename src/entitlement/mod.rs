//! Entitlements: the subject-facing side of credits.

pub mod models;
pub mod owner;
pub mod repository;
pub mod value;

pub use models::{Entitlement, EntitlementKind, EntitlementValue, Feature};
pub use owner::EntitlementOwner;
pub use repository::{EntitlementRepo, FeatureRepo, MeterUsage, SubjectResolver};
pub use value::{EntitlementValueResolver, ValueCalculator};
