//! Domain layer: product entities and the acquisition error taxonomy

pub mod errors;
pub mod product;

pub use errors::{AcquireError, AcquisitionFailure, RetryError, StopReason, TierFailure};
pub use product::{PartialRecord, ProductRecord, ProductRef, Rating, SourceTag, StockStatus};
