//! RSE expression resolution — an external collaborator contract.
//!
//! The actual expression grammar (`tier=T1&country=FR`, etc.) lives
//! outside this crate's scope; the rule engine depends only on this
//! trait, a pure function of the expression string and the current RSE
//! attribute snapshot.

use async_trait::async_trait;
use std::collections::HashMap;

#[async_trait]
pub trait RseExpressionResolver: Send + Sync {
    async fn resolve(&self, expression: &str) -> Result<Vec<String>, String>;
}

/// Test/dev resolver: a fixed `expression -> rse_ids` table, no parsing.
pub struct StaticRseExpressionResolver {
    table: HashMap<String, Vec<String>>,
}

impl StaticRseExpressionResolver {
    pub fn new(table: HashMap<String, Vec<String>>) -> Self {
        Self { table }
    }

    pub fn single(expression: impl Into<String>, rse_ids: Vec<String>) -> Self {
        let mut table = HashMap::new();
        table.insert(expression.into(), rse_ids);
        Self { table }
    }
}

#[async_trait]
impl RseExpressionResolver for StaticRseExpressionResolver {
    async fn resolve(&self, expression: &str) -> Result<Vec<String>, String> {
        self.table
            .get(expression)
            .cloned()
            .ok_or_else(|| format!("unknown RSE expression: {expression}"))
    }
}

/// Production resolver for the trivial grammar this crate supports: a
/// comma-separated list of literal RSE ids. The `tier=T1&country=FR`
/// boolean-attribute grammar itself is the external collaborator's
/// concern and isn't implemented here.
pub struct LiteralRseExpressionResolver;

#[async_trait]
impl RseExpressionResolver for LiteralRseExpressionResolver {
    async fn resolve(&self, expression: &str) -> Result<Vec<String>, String> {
        let ids: Vec<String> = expression.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect();
        if ids.is_empty() {
            return Err(format!("empty RSE expression: {expression:?}"));
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_resolves_the_one_registered_expression() {
        let resolver = StaticRseExpressionResolver::single("tier=T1", vec!["RSE1".to_string(), "RSE2".to_string()]);
        let rses = resolver.resolve("tier=T1").await.unwrap();
        assert_eq!(rses, vec!["RSE1".to_string(), "RSE2".to_string()]);
    }

    #[tokio::test]
    async fn unknown_expression_is_an_error() {
        let resolver = StaticRseExpressionResolver::single("tier=T1", vec!["RSE1".to_string()]);
        assert!(resolver.resolve("tier=T2").await.is_err());
    }

    #[tokio::test]
    async fn literal_resolver_splits_on_commas() {
        let resolver = LiteralRseExpressionResolver;
        let rses = resolver.resolve("RSE1, RSE2,RSE3").await.unwrap();
        assert_eq!(rses, vec!["RSE1".to_string(), "RSE2".to_string(), "RSE3".to_string()]);
    }

    #[tokio::test]
    async fn literal_resolver_rejects_an_empty_expression() {
        let resolver = LiteralRseExpressionResolver;
        assert!(resolver.resolve("").await.is_err());
    }
}
