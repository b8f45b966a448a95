pub mod action;
pub mod cache;
pub mod engine;
pub mod error;
pub mod fakeip;
pub mod forwarder;
pub mod matcher;
pub mod parser;
pub mod query;

pub use action::{Action, ActionContext, ActionOutcome};
pub use cache::Cache;
pub use engine::{EvalContext, Rule, RuleEngine};
pub use error::{Error, Result};
pub use fakeip::{FakeIpPool, FakeIpRegistry, NatSink, NullNatSink};
pub use forwarder::{UpstreamForwarder, UpstreamReply};
pub use query::{QType, Query, Verbosity};
