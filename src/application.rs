//! Application layer: source tiers and the acquisition orchestrator

pub mod orchestrator;
pub mod tiers;

pub use orchestrator::{RecordValidator, SourceOrchestrator, SourceTier};
pub use tiers::{detect_blocked, ApiTier, BrowserTier, HtmlTier, ProductSource};
