//! Policy enforcement for signing operations
//!
//! This module provides:
//! - Policy documents and their durable store with wallet bindings
//! - Per-request fact extraction, including call-data decoding
//! - The deny-overrides, default-deny evaluation engine

pub mod abi;
pub mod context;
pub mod engine;
pub mod extract;
pub mod rules;
pub mod store;

pub use context::{EvaluationContext, FactValue, Payload};
pub use engine::{PolicyEngine, Verdict};
pub use extract::{authorization_context, message_context, transaction_context};
pub use rules::{
    Condition, FieldSource, Operator, Policy, PolicyDraft, Rule, RuleAction, RuleMethod,
    SigningMethod,
};
pub use store::{Binding, PolicyStore};
