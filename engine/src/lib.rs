//! A rule graph execution engine.
//!
//! Rules are pure, typed functions. They're registered with a
//! [RuleGraphBuilder], which resolves them statically into a [RuleGraph] for
//! a set of queries. A [Scheduler] then computes requests against that
//! graph, memoizing every intermediate result, and forgetting exactly those
//! derived from files that changed.
pub mod config;
pub mod error;
pub mod invalidation;
pub mod rule_graph;
pub mod rules;
pub mod scheduler;
pub mod session;
pub mod types;

pub use config::{ConfigError, EngineConfig};
pub use error::{CompileError, Failure, FailureKind, RequestError};
pub use invalidation::{InvalidationWatcher, PollingWatcher};
pub use rule_graph::{NodeId, RuleGraph, RuleGraphBuilder};
pub use rules::{DependencyKey, Get, Rule, RuleBody};
pub use scheduler::{InvalidationResult, NodeKey, RuleContext, Scheduler};
pub use session::Session;
pub use types::{Params, RuleValue, TypeKey, Value};
