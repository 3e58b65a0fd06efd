pub mod cache;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod lock;
pub mod rules;
pub mod store;
pub mod types;

pub use catalog::{MetricCatalog, MetricRule};
pub use config::Config;
pub use engine::{EngineError, MilestoneEngine};
pub use rules::CrossingRule;
pub use types::*;
