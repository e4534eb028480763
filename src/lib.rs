// Re-export modules
pub mod api;
pub mod behavior;
pub mod clock;
pub mod config;
pub mod device;
pub mod events;
pub mod location;
pub mod models;
pub mod orchestrator;
pub mod policy;
pub mod response;
pub mod risk;
pub mod storage;
pub mod telemetry;
pub mod utils;

pub use orchestrator::{RequestContext, TrustAssessment, TrustOrchestrator};
