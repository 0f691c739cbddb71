//! Rate limiting logic and progressive blocking.

mod backend;
mod engine;
mod keys;
mod policy;
mod reason;
mod window;

pub use backend::DecisionBackend;
pub use engine::RateLimitEngine;
pub use keys::{hash_tag, KeySpace, DEFAULT_KEY_PREFIX};
pub use policy::{FailureMode, RateLimitPolicy};
pub use reason::{Decision, DecisionError, Reason};
pub use window::TimeWindow;
