//! # RSE Selector
//!
//! Weighted, quota-aware site picker consumed by the rule engine (§4.C).

pub mod expression;
pub mod selector;

pub use expression::{LiteralRseExpressionResolver, RseExpressionResolver, StaticRseExpressionResolver};
pub use selector::{AccountQuotaProvider, RseAttributeProvider, RseSelector, SqlRseAttributeProvider};
