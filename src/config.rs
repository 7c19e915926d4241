//! Mock rule files.
//!
//! Wire representation of mock rules as they appear in JSON/YAML documents on
//! disk or in runtime add-mock payloads, plus the conversion into the internal
//! [`crate::rule`] model. Response templating and pattern validation run here,
//! at registration time; configuration errors are fatal to startup.

use crate::rule::{
    parse_code_name, BodyPattern, JsonPathPattern, MockRule, PathMode, RequestSpec, ResponseSpec,
};
use crate::template;
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::debug;

/// A mock rule as written in a mock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MockDefinition {
    pub request: RequestDefinition,
    pub response: OneOrMany<ResponseDefinition>,
}

/// Accepts either a single entry or a sequence; mock files written for unary
/// methods commonly use the single-object form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestDefinition {
    /// Full method path, e.g. `/greet.Greeter/SayHello`.
    pub method: String,

    #[serde(default)]
    pub body_patterns: Vec<BodyPatternDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BodyPatternDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equal_to_json: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matches_jsonpath: Option<JsonPathDefinition>,
}

/// `matches_jsonpath` accepts a bare expression string (existence-only match)
/// or an object with exactly one comparison operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonPathDefinition {
    Expression(String),
    Operator {
        expression: String,
        #[serde(default)]
        eq: Option<String>,
        #[serde(default)]
        regexp: Option<String>,
        #[serde(default)]
        contains: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseDefinition {
    /// Literal JSON body.
    Body(Value),
    /// Template string resolved once at registration.
    BodyTemplate(String),
    /// Error status terminating the call.
    Status(StatusDefinition),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusDefinition {
    /// `google.rpc.Code` style name, e.g. `NOT_FOUND`.
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl MockDefinition {
    /// Convert the wire form into an immutable rule. Templates are rendered
    /// here, so a templated timestamp is frozen at registration time.
    pub fn into_rule(self) -> Result<MockRule> {
        if self.request.method.is_empty() {
            bail!("mock request method is required");
        }

        let mut body_patterns = Vec::new();
        for pattern in self.request.body_patterns {
            body_patterns.push(convert_pattern(pattern)?);
        }

        let mut responses = Vec::new();
        for response in self.response.into_vec() {
            responses.push(convert_response(response)?);
        }

        Ok(MockRule {
            request: RequestSpec {
                method: self.request.method,
                body_patterns,
            },
            responses,
        })
    }
}

fn convert_pattern(def: BodyPatternDefinition) -> Result<BodyPattern> {
    match (def.equal_to_json, def.matches_jsonpath) {
        (Some(doc), None) => Ok(BodyPattern::EqualToJson(doc)),
        (None, Some(jsonpath)) => Ok(BodyPattern::JsonPath(convert_jsonpath(jsonpath)?)),
        (None, None) => bail!("body pattern requires equal_to_json or matches_jsonpath"),
        (Some(_), Some(_)) => {
            bail!("body pattern cannot combine equal_to_json and matches_jsonpath")
        }
    }
}

fn convert_jsonpath(def: JsonPathDefinition) -> Result<JsonPathPattern> {
    let (expression, mode) = match def {
        JsonPathDefinition::Expression(expression) => (expression, PathMode::Partial),
        JsonPathDefinition::Operator {
            expression,
            eq,
            regexp,
            contains,
        } => {
            let mode = match (eq, regexp, contains) {
                (Some(v), None, None) => PathMode::Equals(v),
                (None, Some(v), None) => {
                    // Compile-check now so a bad pattern fails the load, not
                    // the first matching call.
                    regex::Regex::new(&v).with_context(|| format!("invalid regexp '{}'", v))?;
                    PathMode::Regexp(v)
                }
                (None, None, Some(v)) => PathMode::Contains(v),
                (None, None, None) => bail!(
                    "matches_jsonpath '{}' requires one of eq, regexp or contains",
                    expression
                ),
                _ => bail!(
                    "matches_jsonpath '{}' allows only one of eq, regexp or contains",
                    expression
                ),
            };
            (expression, mode)
        }
    };

    if expression.is_empty() {
        bail!("matches_jsonpath expression is required");
    }

    Ok(JsonPathPattern { expression, mode })
}

fn convert_response(def: ResponseDefinition) -> Result<ResponseSpec> {
    match def {
        ResponseDefinition::Body(body) => Ok(ResponseSpec::Body(body)),
        ResponseDefinition::BodyTemplate(tpl) => {
            let body = template::render(&tpl).context("response body template")?;
            Ok(ResponseSpec::Body(body))
        }
        ResponseDefinition::Status(status) => {
            let code = parse_code_name(&status.code)
                .ok_or_else(|| anyhow!("unknown status code name '{}'", status.code))?;
            Ok(ResponseSpec::Status {
                code,
                message: status.message,
            })
        }
    }
}

/// Load all mock rules under a directory, walking it recursively for
/// `.json`/`.yaml`/`.yml` files. File order is directory order; rule order
/// within a file is preserved.
pub fn load_dir(path: &Path) -> Result<Vec<MockRule>> {
    let mut rules = Vec::new();
    walk(path, &mut rules)?;
    Ok(rules)
}

fn walk(dir: &Path, rules: &mut Vec<MockRule>) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("reading mocks directory {}", dir.display()))?
        .collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.path());

    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            walk(&path, rules)?;
            continue;
        }
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if matches!(ext, "json" | "yaml" | "yml") {
            debug!(path = %path.display(), "loading mock file");
            rules.extend(load_file(&path)?);
        }
    }
    Ok(())
}

/// Load one mock file, which may hold a single rule or an array of rules.
pub fn load_file(path: &Path) -> Result<Vec<MockRule>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading mock file {}", path.display()))?;

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let defs: OneOrMany<MockDefinition> = if is_yaml {
        serde_yaml::from_str(&content)
            .with_context(|| format!("parsing mock file {}", path.display()))?
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("parsing mock file {}", path.display()))?
    };

    defs.into_vec()
        .into_iter()
        .map(|def| {
            def.into_rule()
                .with_context(|| format!("invalid mock in {}", path.display()))
        })
        .collect()
}

/// The always-present health-check rule, appended after user mocks so a
/// user-supplied rule for the same method wins first-match.
pub fn default_health_rule() -> MockRule {
    MockRule {
        request: RequestSpec {
            method: crate::descriptor::HEALTH_CHECK_METHOD.to_string(),
            body_patterns: vec![],
        },
        responses: vec![ResponseSpec::Body(serde_json::json!({"status": "SERVING"}))],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_parse_single_mock_json() {
        let src = r#"
        {
            "request": {
                "method": "/greet.Greeter/SayHello",
                "body_patterns": [
                    { "matches_jsonpath": { "expression": "$.name", "eq": "Bob" } }
                ]
            },
            "response": { "body": { "message": "hello Bob" } }
        }"#;
        let def: MockDefinition = serde_json::from_str(src).unwrap();
        let rule = def.into_rule().unwrap();

        assert_eq!(rule.request.method, "/greet.Greeter/SayHello");
        assert_eq!(rule.request.body_patterns.len(), 1);
        match &rule.responses[0] {
            ResponseSpec::Body(body) => assert_eq!(body["message"], "hello Bob"),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_parse_bare_expression_is_partial() {
        let src = r#"
        {
            "request": {
                "method": "/test.Svc/Call",
                "body_patterns": [ { "matches_jsonpath": "$.name" } ]
            },
            "response": [ { "body": {} } ]
        }"#;
        let rule: MockRule = serde_json::from_str::<MockDefinition>(src)
            .unwrap()
            .into_rule()
            .unwrap();

        match &rule.request.body_patterns[0] {
            BodyPattern::JsonPath(p) => {
                assert_eq!(p.expression, "$.name");
                assert!(matches!(p.mode, PathMode::Partial));
            }
            other => panic!("unexpected pattern: {:?}", other),
        }
    }

    #[test]
    fn test_parse_status_response() {
        let src = r#"
        {
            "request": { "method": "/test.Svc/Call" },
            "response": [
                { "body": { "name": "hello" } },
                { "status": { "code": "NOT_FOUND", "message": "user not found" } }
            ]
        }"#;
        let rule = serde_json::from_str::<MockDefinition>(src)
            .unwrap()
            .into_rule()
            .unwrap();

        assert_eq!(rule.responses.len(), 2);
        match &rule.responses[1] {
            ResponseSpec::Status { code, message } => {
                assert_eq!(*code, tonic::Code::NotFound);
                assert_eq!(message, "user not found");
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_operator_form_without_operator_rejected() {
        let src = r#"
        {
            "request": {
                "method": "/test.Svc/Call",
                "body_patterns": [ { "matches_jsonpath": { "expression": "$.name" } } ]
            },
            "response": { "body": {} }
        }"#;
        let err = serde_json::from_str::<MockDefinition>(src)
            .unwrap()
            .into_rule();
        assert!(err.is_err());
    }

    #[test]
    fn test_invalid_regexp_rejected_at_load() {
        let src = r#"
        {
            "request": {
                "method": "/test.Svc/Call",
                "body_patterns": [
                    { "matches_jsonpath": { "expression": "$.name", "regexp": "[" } }
                ]
            },
            "response": { "body": {} }
        }"#;
        assert!(serde_json::from_str::<MockDefinition>(src)
            .unwrap()
            .into_rule()
            .is_err());
    }

    #[test]
    fn test_unknown_status_code_rejected() {
        let src = r#"
        {
            "request": { "method": "/test.Svc/Call" },
            "response": { "status": { "code": "TEAPOT" } }
        }"#;
        assert!(serde_json::from_str::<MockDefinition>(src)
            .unwrap()
            .into_rule()
            .is_err());
    }

    #[test]
    fn test_body_template_rendered_at_registration() {
        let src = r#"
        {
            "request": { "method": "/test.Svc/Call" },
            "response": { "body_template": "{ \"ts\": \"{{ now_rfc3339 }}\" }" }
        }"#;
        let rule = serde_json::from_str::<MockDefinition>(src)
            .unwrap()
            .into_rule()
            .unwrap();

        match &rule.responses[0] {
            ResponseSpec::Body(body) => assert!(body["ts"].is_string()),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_load_yaml_file() {
        let yaml = r#"
request:
  method: /greet.Greeter/SayHello
  body_patterns:
    - matches_jsonpath:
        expression: $.name
        eq: Bob
response:
  - body:
      message: hello Bob
"#;
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let rules = load_file(file.path()).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].request.method, "/greet.Greeter/SayHello");
    }

    #[test]
    fn test_load_dir_with_array_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = json!([
            {
                "request": { "method": "/a.Svc/One", "body_patterns": [] },
                "response": { "body": {} }
            },
            {
                "request": { "method": "/a.Svc/Two" },
                "response": { "body": {} }
            }
        ]);
        std::fs::write(
            dir.path().join("mocks.json"),
            serde_json::to_string(&src).unwrap(),
        )
        .unwrap();

        let rules = load_dir(dir.path()).unwrap();
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn test_default_health_rule_matches_any_body() {
        let rule = default_health_rule();
        assert!(rule.request.body_patterns.is_empty());
        assert_eq!(rule.request.method, "/grpc.health.v1.Health/Check");
    }
}
