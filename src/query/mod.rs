//! Query planning and execution

pub mod engine;
pub mod planner;
pub mod request;

pub use engine::{EngineHealth, EngineStats, QueryEngine, QueryEngineBuilder, QueryResult};
pub use planner::{Fingerprint, Plan};
pub use request::{CanonicalQuery, Query, QueryBuilder};
