//! gRPC Mimic
//!
//! A descriptor-driven gRPC mocking server. Point it at compiled proto
//! descriptor sets and a directory of mock definitions, and it serves every
//! declared method without generated code, matching incoming requests
//! against configurable JSON predicates and replaying stubbed responses.
//!
//! # Features
//!
//! - **Dynamic Dispatch**: Serve any method from descriptor sets alone,
//!   across all four streaming shapes
//! - **Request Matching**: Match request bodies with exact JSON comparison
//!   or JSONPath predicates (equality, regexp, containment)
//! - **Streamed Responses**: Replay response sequences for streaming
//!   methods, including mid-stream status termination
//! - **Response Templates**: Timestamp helpers rendered when mocks load
//! - **Health Checking**: Built-in `grpc.health.v1.Health` with a default
//!   `SERVING` mock that user rules can override
//! - **Server Reflection**: Mocked services are discoverable by grpcurl and
//!   friends straight from the loaded descriptors
//!
//! # Example Mock
//!
//! ```yaml
//! request:
//!   method: /greet.Greeter/SayHello
//!   body_patterns:
//!     - matches_jsonpath:
//!         expression: "$.name"
//!         eq: bob
//! response:
//!   body:
//!     message: "hello Bob"
//! ```

pub mod config;
pub mod descriptor;
pub mod dispatch;
pub mod json;
pub mod matcher;
pub mod reflection;
pub mod rule;
pub mod server;
pub mod template;
pub mod validator;

pub use dispatch::{Dispatcher, DynamicCodec};
pub use matcher::{MatchError, MockMatcher};
pub use rule::MockRule;
pub use server::MockServer;
