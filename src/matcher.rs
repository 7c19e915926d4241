//! Request matching engine.
//!
//! Owns the rule store (method full path -> ordered rule list) and resolves
//! incoming requests to the first rule whose predicates all hold.

use crate::json;
use crate::rule::{BodyPattern, JsonPathPattern, MockRule, PathMode, RequestSpec};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::warn;

/// Matching failure surfaced to the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    /// The method is unknown to the store, or no rule's predicates all hold.
    #[error("request not matched")]
    NotMatched,
}

/// Rule store plus evaluation. Any number of concurrent `match_rule` calls may
/// run; `add_mock`/`clear` take exclusive access, so readers never observe a
/// partially-applied mutation. Rules are immutable once appended.
#[derive(Default)]
pub struct MockMatcher {
    rules: RwLock<HashMap<String, Vec<MockRule>>>,
}

impl MockMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bulk-append rules grouped by method, preserving insertion order.
    pub async fn load(&self, mocks: Vec<MockRule>) {
        let mut rules = self.rules.write().await;
        for mock in mocks {
            rules
                .entry(mock.request.method.clone())
                .or_default()
                .push(mock);
        }
    }

    /// Append one rule to its method's list. Available while serving traffic.
    pub async fn add_mock(&self, mock: MockRule) {
        let mut rules = self.rules.write().await;
        rules
            .entry(mock.request.method.clone())
            .or_default()
            .push(mock);
    }

    /// Atomically empty the whole store.
    pub async fn clear(&self) {
        self.rules.write().await.clear();
    }

    /// Snapshot of the store, for pre-serve validation.
    pub async fn snapshot(&self) -> HashMap<String, Vec<MockRule>> {
        self.rules.read().await.clone()
    }

    /// Return the first rule under `method` whose request spec is satisfied by
    /// `doc`. A rule whose evaluation errors is logged and skipped; it never
    /// blocks evaluation of subsequent rules or aborts the call.
    pub async fn match_rule(&self, method: &str, doc: &Value) -> Result<MockRule, MatchError> {
        let rules = self.rules.read().await;
        let mocks = rules.get(method).ok_or(MatchError::NotMatched)?;

        for mock in mocks {
            match rule_matches(doc, &mock.request) {
                Ok(true) => return Ok(mock.clone()),
                Ok(false) => {}
                Err(err) => {
                    warn!(method = %method, error = %err, "mock evaluation error, rule skipped");
                }
            }
        }

        Err(MatchError::NotMatched)
    }
}

/// Evaluate all body patterns of a request spec (AND). An empty pattern list
/// matches any body for the method.
fn rule_matches(doc: &Value, request: &RequestSpec) -> anyhow::Result<bool> {
    for pattern in &request.body_patterns {
        let holds = match pattern {
            BodyPattern::EqualToJson(expected) => json::structural_eq(doc, expected),
            BodyPattern::JsonPath(jsonpath) => jsonpath_matches(doc, jsonpath)?,
        };
        if !holds {
            return Ok(false);
        }
    }
    Ok(true)
}

fn jsonpath_matches(doc: &Value, pattern: &JsonPathPattern) -> anyhow::Result<bool> {
    let nodes = json::select_nodes(doc, &pattern.expression)?;
    if nodes.is_empty() {
        return Ok(false);
    }

    match &pattern.mode {
        PathMode::Partial => Ok(true),
        PathMode::Contains(substring) => {
            Ok(json::node_string_form(&nodes[0]).contains(substring.as_str()))
        }
        PathMode::Regexp(pattern) => {
            let re = Regex::new(pattern)?;
            Ok(nodes
                .iter()
                .all(|node| re.is_match(&json::node_string_form(node))))
        }
        PathMode::Equals(expected) => {
            for node in &nodes {
                if !node_equals(node, expected)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
    }
}

/// Type-aware equality between a selected node and the configured value.
fn node_equals(node: &Value, expected: &str) -> anyhow::Result<bool> {
    match node {
        Value::String(s) => Ok(s.to_lowercase() == expected.to_lowercase()),
        Value::Number(n) => {
            let target: f64 = expected
                .parse()
                .map_err(|_| anyhow::anyhow!("expected numeric value, got '{}'", expected))?;
            Ok(n.as_f64() == Some(target))
        }
        Value::Bool(b) => {
            let target: bool = expected
                .parse()
                .map_err(|_| anyhow::anyhow!("expected boolean value, got '{}'", expected))?;
            Ok(*b == target)
        }
        Value::Object(_) | Value::Array(_) => json::structural_eq_str(node, expected),
        Value::Null => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::ResponseSpec;
    use serde_json::json;

    fn jsonpath_rule(method: &str, expr: &str, mode: PathMode, body: Value) -> MockRule {
        MockRule {
            request: RequestSpec {
                method: method.to_string(),
                body_patterns: vec![BodyPattern::JsonPath(JsonPathPattern {
                    expression: expr.to_string(),
                    mode,
                })],
            },
            responses: vec![ResponseSpec::Body(body)],
        }
    }

    fn response_body(rule: &MockRule) -> &Value {
        match &rule.responses[0] {
            ResponseSpec::Body(v) => v,
            other => panic!("expected body response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_equal_to_json_matching() {
        let matcher = MockMatcher::new();
        matcher
            .load(vec![MockRule {
                request: RequestSpec {
                    method: "/test.Svc/Call".to_string(),
                    body_patterns: vec![BodyPattern::EqualToJson(json!({}))],
                },
                responses: vec![ResponseSpec::Body(json!({"ok": true}))],
            }])
            .await;

        let matched = matcher.match_rule("/test.Svc/Call", &json!({})).await;
        assert!(matched.is_ok());

        let missed = matcher
            .match_rule("/test.Svc/Call", &json!({"name": "x"}))
            .await;
        assert!(matches!(missed, Err(MatchError::NotMatched)));
    }

    #[tokio::test]
    async fn test_jsonpath_equals_matching() {
        let cases = [
            ("$.name", "tofu", json!({"name": "tofu"})),
            ("$.meal.name", "tofu", json!({"meal": {"name": "tofu"}})),
            (
                "$.meal[1].name",
                "tofu",
                json!({"meal": [{"name": "apple"}, {"name": "tofu"}]}),
            ),
            (
                "$.meal[?(@.name == 'tofu')].name",
                "tofu",
                json!({"meal": [{"name": "apple"}, {"name": "tofu"}]}),
            ),
            ("$.stationIds", "[1, 2]", json!({"stationIds": [1, 2]})),
            ("$.result", "true", json!({"result": true})),
            ("$.duration", "100", json!({"duration": 100})),
        ];

        for (expr, equals, doc) in cases {
            let matcher = MockMatcher::new();
            matcher
                .load(vec![jsonpath_rule(
                    "test",
                    expr,
                    PathMode::Equals(equals.to_string()),
                    json!("ok"),
                )])
                .await;

            let matched = matcher.match_rule("test", &doc).await;
            assert!(matched.is_ok(), "expression {} should match", expr);
        }
    }

    #[tokio::test]
    async fn test_jsonpath_equals_case_insensitive() {
        let matcher = MockMatcher::new();
        matcher
            .load(vec![jsonpath_rule(
                "test",
                "$.name",
                PathMode::Equals("BOB".to_string()),
                json!("ok"),
            )])
            .await;

        assert!(matcher
            .match_rule("test", &json!({"name": "bob"}))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_jsonpath_partial_matching() {
        let matcher = MockMatcher::new();
        matcher
            .load(vec![jsonpath_rule(
                "test",
                "$.stationIds",
                PathMode::Partial,
                json!("ok"),
            )])
            .await;

        assert!(matcher
            .match_rule("test", &json!({"stationIds": [1, 2]}))
            .await
            .is_ok());
        assert!(matcher
            .match_rule("test", &json!({"other": 1}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_jsonpath_regexp_requires_all_nodes() {
        let matcher = MockMatcher::new();
        matcher
            .load(vec![jsonpath_rule(
                "test",
                "$.items[*].name",
                PathMode::Regexp("^ap.*$".to_string()),
                json!("ok"),
            )])
            .await;

        assert!(matcher
            .match_rule("test", &json!({"items": [{"name": "apple"}, {"name": "apricot"}]}))
            .await
            .is_ok());
        assert!(matcher
            .match_rule("test", &json!({"items": [{"name": "apple"}, {"name": "pear"}]}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_jsonpath_contains_first_node() {
        let matcher = MockMatcher::new();
        matcher
            .load(vec![jsonpath_rule(
                "test",
                "$.name",
                PathMode::Contains("ofu".to_string()),
                json!("ok"),
            )])
            .await;

        assert!(matcher
            .match_rule("test", &json!({"name": "tofu"}))
            .await
            .is_ok());
        assert!(matcher
            .match_rule("test", &json!({"name": "rice"}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_jsonpath_contains_on_non_string_node() {
        let matcher = MockMatcher::new();
        matcher
            .load(vec![jsonpath_rule(
                "test",
                "$.ids",
                PathMode::Contains("2,3".to_string()),
                json!("ok"),
            )])
            .await;

        // Non-string nodes are tested against their serialized form,
        // without surrounding quotes.
        assert!(matcher
            .match_rule("test", &json!({"ids": [1, 2, 3]}))
            .await
            .is_ok());
        assert!(matcher
            .match_rule("test", &json!({"ids": [4, 5]}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_multiple_patterns_all_must_hold() {
        let matcher = MockMatcher::new();
        matcher
            .load(vec![MockRule {
                request: RequestSpec {
                    method: "test".to_string(),
                    body_patterns: vec![
                        BodyPattern::JsonPath(JsonPathPattern {
                            expression: "$.name".to_string(),
                            mode: PathMode::Equals("lock1".to_string()),
                        }),
                        BodyPattern::JsonPath(JsonPathPattern {
                            expression: "$.duration".to_string(),
                            mode: PathMode::Equals("100".to_string()),
                        }),
                    ],
                },
                responses: vec![ResponseSpec::Body(json!("ok"))],
            }])
            .await;

        assert!(matcher
            .match_rule("test", &json!({"name": "lock1", "duration": 100}))
            .await
            .is_ok());
        assert!(matcher
            .match_rule("test", &json!({"name": "lock1", "duration": 200}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_structural_equality_on_object_node() {
        let matcher = MockMatcher::new();
        matcher
            .load(vec![jsonpath_rule(
                "test",
                "$.station",
                PathMode::Equals(r#"{"prop1": "val1", "name": "s1"}"#.to_string()),
                json!("ok"),
            )])
            .await;

        // Key order in the request differs from the pattern.
        assert!(matcher
            .match_rule("test", &json!({"station": {"name": "s1", "prop1": "val1"}}))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let matcher = MockMatcher::new();
        matcher
            .load(vec![
                jsonpath_rule("test", "$.name", PathMode::Partial, json!("first")),
                jsonpath_rule("test", "$.name", PathMode::Partial, json!("second")),
            ])
            .await;

        let matched = matcher
            .match_rule("test", &json!({"name": "x"}))
            .await
            .unwrap();
        assert_eq!(response_body(&matched), &json!("first"));
    }

    #[tokio::test]
    async fn test_match_is_deterministic() {
        let matcher = MockMatcher::new();
        matcher
            .load(vec![
                jsonpath_rule("test", "$.name", PathMode::Partial, json!("a")),
                jsonpath_rule("test", "$.name", PathMode::Partial, json!("b")),
            ])
            .await;

        for _ in 0..10 {
            let matched = matcher
                .match_rule("test", &json!({"name": "x"}))
                .await
                .unwrap();
            assert_eq!(response_body(&matched), &json!("a"));
        }
    }

    #[tokio::test]
    async fn test_empty_patterns_match_any_body() {
        let matcher = MockMatcher::new();
        matcher
            .load(vec![MockRule {
                request: RequestSpec {
                    method: "test".to_string(),
                    body_patterns: vec![],
                },
                responses: vec![ResponseSpec::Body(json!("ok"))],
            }])
            .await;

        assert!(matcher
            .match_rule("test", &json!({"anything": [1, 2, 3]}))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_bad_rule_skipped_next_rule_matches() {
        let matcher = MockMatcher::new();
        matcher
            .load(vec![
                // Invalid regex: evaluation error, skipped.
                jsonpath_rule("test", "$.name", PathMode::Regexp("[".to_string()), json!("bad")),
                jsonpath_rule("test", "$.name", PathMode::Partial, json!("good")),
            ])
            .await;

        let matched = matcher
            .match_rule("test", &json!({"name": "x"}))
            .await
            .unwrap();
        assert_eq!(response_body(&matched), &json!("good"));
    }

    #[tokio::test]
    async fn test_clear_empties_store() {
        let matcher = MockMatcher::new();
        matcher
            .load(vec![jsonpath_rule(
                "test",
                "$.name",
                PathMode::Partial,
                json!("ok"),
            )])
            .await;
        matcher.clear().await;

        assert!(matcher
            .match_rule("test", &json!({"name": "x"}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_add_mock_appends() {
        let matcher = MockMatcher::new();
        matcher
            .add_mock(jsonpath_rule("test", "$.name", PathMode::Partial, json!("ok")))
            .await;

        assert!(matcher
            .match_rule("test", &json!({"name": "x"}))
            .await
            .is_ok());
        assert_eq!(matcher.snapshot().await["test"].len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_method_not_matched() {
        let matcher = MockMatcher::new();
        assert!(matcher.match_rule("/nope", &json!({})).await.is_err());
    }
}
