//! Internal mock rule model.
//!
//! Rules are immutable once stored; the wire representation in [`crate::config`]
//! is converted into these types at registration time.

use serde_json::Value;
use tonic::Code;

/// A single mock rule: a request predicate plus an ordered response sequence.
#[derive(Debug, Clone)]
pub struct MockRule {
    pub request: RequestSpec,
    /// Ordered, because streaming methods may emit multiple messages. A
    /// `Status` entry terminates the call wherever it occurs.
    pub responses: Vec<ResponseSpec>,
}

/// Request predicate for a rule. All body patterns must hold (AND); an empty
/// pattern list matches any body for the method.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    /// Full method path, e.g. `/greet.Greeter/SayHello`. Exact match, no wildcards.
    pub method: String,
    pub body_patterns: Vec<BodyPattern>,
}

/// A single predicate evaluated against the canonical JSON form of a request.
#[derive(Debug, Clone)]
pub enum BodyPattern {
    /// Request body must be structurally equal to the document.
    EqualToJson(Value),
    /// JSONPath selection compared per mode.
    JsonPath(JsonPathPattern),
}

#[derive(Debug, Clone)]
pub struct JsonPathPattern {
    pub expression: String,
    pub mode: PathMode,
}

/// Comparison applied to the nodes selected by a JSONPath expression.
/// Exactly one mode is active per pattern.
#[derive(Debug, Clone)]
pub enum PathMode {
    /// Existence only: holds iff the selection is non-empty.
    Partial,
    /// Case-insensitive equality for strings, numeric/bool/structural
    /// comparison otherwise. All selected nodes must satisfy it.
    Equals(String),
    /// Compiled regex must match every selected node (non-string nodes via
    /// their canonical string form).
    Regexp(String),
    /// Substring test against the first selected node only.
    Contains(String),
}

/// One entry of a rule's response sequence.
#[derive(Debug, Clone)]
pub enum ResponseSpec {
    /// JSON document deserialized into the method's output shape and written
    /// as one outbound message.
    Body(Value),
    /// Terminates the RPC with this status; nothing further is delivered.
    Status { code: Code, message: String },
}

/// Parse a `google.rpc.Code` style name (`NOT_FOUND`, `INVALID_ARGUMENT`, ...)
/// into a gRPC status code. Unknown names are configuration errors.
pub fn parse_code_name(name: &str) -> Option<Code> {
    let code = match name {
        "OK" => Code::Ok,
        "CANCELLED" => Code::Cancelled,
        "UNKNOWN" => Code::Unknown,
        "INVALID_ARGUMENT" => Code::InvalidArgument,
        "DEADLINE_EXCEEDED" => Code::DeadlineExceeded,
        "NOT_FOUND" => Code::NotFound,
        "ALREADY_EXISTS" => Code::AlreadyExists,
        "PERMISSION_DENIED" => Code::PermissionDenied,
        "RESOURCE_EXHAUSTED" => Code::ResourceExhausted,
        "FAILED_PRECONDITION" => Code::FailedPrecondition,
        "ABORTED" => Code::Aborted,
        "OUT_OF_RANGE" => Code::OutOfRange,
        "UNIMPLEMENTED" => Code::Unimplemented,
        "INTERNAL" => Code::Internal,
        "UNAVAILABLE" => Code::Unavailable,
        "DATA_LOSS" => Code::DataLoss,
        "UNAUTHENTICATED" => Code::Unauthenticated,
        _ => return None,
    };
    Some(code)
}
