//! Dynamic dispatcher.
//!
//! Serves every method declared by the loaded descriptors through one generic
//! handler: read 0..N inbound messages, match once, write 0..N outbound
//! messages or abort with a status. The handler never needs compile-time
//! knowledge of concrete message types; `DynamicMessage` plus the method
//! descriptor carry the shape, and the streaming flags are the only
//! shape-specific behavior.

use crate::descriptor::{self, MethodRegistry};
use crate::matcher::{MatchError, MockMatcher};
use crate::reflection::{self, ReflectionHandler};
use crate::rule::{MockRule, ResponseSpec};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use http::HeaderValue;
use prost::Message;
use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor, MethodDescriptor};
use serde_json::Value;
use std::sync::Arc;
use tonic::body::Body;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::server::Grpc;
use tonic::{Status, Streaming};
use tonic_prost::ProstCodec;
use tonic_reflection::pb::v1::{ServerReflectionRequest, ServerReflectionResponse};
use tracing::{debug, error, warn};

/// Routes incoming calls to a per-method handler built from descriptors.
/// The matching engine is injected and shared with the runtime management
/// surface; the dispatcher itself holds no mutable state.
pub struct Dispatcher {
    registry: MethodRegistry,
    matcher: Arc<MockMatcher>,
    pool: DescriptorPool,
}

impl Dispatcher {
    pub fn new(registry: MethodRegistry, matcher: Arc<MockMatcher>, pool: DescriptorPool) -> Self {
        Self {
            registry,
            matcher,
            pool,
        }
    }

    /// Handle one HTTP/2 request carrying a gRPC call of any streaming shape.
    pub async fn handle(&self, req: http::Request<Body>) -> http::Response<Body> {
        let path = req.uri().path().to_owned();

        if path == reflection::V1_METHOD || path == reflection::V1ALPHA_METHOD {
            let handler = ReflectionHandler::new(self.pool.clone());
            let mut grpc = Grpc::new(
                ProstCodec::<ServerReflectionResponse, ServerReflectionRequest>::default(),
            );
            return grpc.streaming(handler, req).await;
        }

        let Some(method) = self.registry.get(&path) else {
            warn!(method = %path, "no descriptor registered for method");
            return status_response(Status::unimplemented(format!(
                "unimplemented mock for method: {path}"
            )));
        };

        debug!(method = %path, "grpc call");

        // All four shapes run through the streaming plumbing; the wire format
        // does not distinguish them.
        let handler = MockHandler {
            method: method.clone(),
            path,
            matcher: Arc::clone(&self.matcher),
        };
        let mut grpc = Grpc::new(DynamicCodec::new(method.input()));
        grpc.streaming(handler, req).await
    }
}

/// One handler instance per call, capturing the method descriptor and the
/// shared matching engine.
struct MockHandler {
    method: MethodDescriptor,
    path: String,
    matcher: Arc<MockMatcher>,
}

impl tonic::server::StreamingService<DynamicMessage> for MockHandler {
    type Response = DynamicMessage;
    type ResponseStream = BoxStream<'static, Result<DynamicMessage, Status>>;
    type Future = BoxFuture<'static, Result<tonic::Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: tonic::Request<Streaming<DynamicMessage>>) -> Self::Future {
        let method = self.method.clone();
        let path = self.path.clone();
        let matcher = Arc::clone(&self.matcher);

        Box::pin(async move {
            let mut inbound = request.into_inner();
            let doc = read_match_document(&mut inbound, &method).await?;
            debug!(method = %path, request = %doc, "matching request");

            let rule = match matcher.match_rule(&path, &doc).await {
                Ok(rule) => rule,
                Err(MatchError::NotMatched) => {
                    warn!(method = %path, "no mock matched");
                    return Err(Status::unimplemented(format!(
                        "unimplemented mock for method: {path}"
                    )));
                }
            };

            let outputs = synthesize_responses(&rule, &method, &path)?;
            let stream: Self::ResponseStream = Box::pin(tokio_stream::iter(outputs));
            Ok(tonic::Response::new(stream))
        })
    }
}

/// Read the inbound message(s) and produce the match document: the single
/// message's canonical JSON, or for client-streaming methods a JSON array of
/// every received message in order.
async fn read_match_document(
    inbound: &mut Streaming<DynamicMessage>,
    method: &MethodDescriptor,
) -> Result<Value, Status> {
    if method.is_client_streaming() {
        let mut items = Vec::new();
        while let Some(message) = inbound.message().await? {
            items.push(to_canonical(&message)?);
        }
        Ok(Value::Array(items))
    } else {
        let message = inbound
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("missing request message"))?;
        to_canonical(&message)
    }
}

fn to_canonical(message: &DynamicMessage) -> Result<Value, Status> {
    descriptor::message_to_canonical_json(message).map_err(|err| {
        error!(error = %err, "request json conversion failed");
        Status::internal("request json conversion failed")
    })
}

/// Turn a matched rule's response sequence into the outbound item list.
///
/// A `Status` entry terminates delivery wherever it occurs. Non-streaming
/// methods consume only the first entry; a rule with no entries is an
/// internal error for the call.
fn synthesize_responses(
    rule: &MockRule,
    method: &MethodDescriptor,
    path: &str,
) -> Result<Vec<Result<DynamicMessage, Status>>, Status> {
    if rule.responses.is_empty() {
        error!(method = %path, "matched mock has no response entries");
        return Err(Status::internal("matched mock has no response entries"));
    }

    let entries: &[ResponseSpec] = if method.is_server_streaming() {
        &rule.responses
    } else {
        &rule.responses[..1]
    };

    let mut outputs = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry {
            ResponseSpec::Status { code, message } => {
                outputs.push(Err(Status::new(*code, message.clone())));
                break;
            }
            ResponseSpec::Body(body) => {
                match descriptor::message_from_json(method.output(), body) {
                    Ok(message) => outputs.push(Ok(message)),
                    Err(err) => {
                        error!(
                            method = %path,
                            error = %err,
                            "mock response does not deserialize into output shape"
                        );
                        outputs.push(Err(Status::internal("mock response synthesis failed")));
                        break;
                    }
                }
            }
        }
    }

    Ok(outputs)
}

/// Trailers-only response for calls that never reach a handler.
fn status_response(status: Status) -> http::Response<Body> {
    let mut response = http::Response::new(Body::empty());
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/grpc"),
    );
    response
        .headers_mut()
        .insert("grpc-status", HeaderValue::from(status.code() as i32));
    if !status.message().is_empty() {
        let encoded = percent_encode_message(status.message());
        if let Ok(message) = HeaderValue::from_str(&encoded) {
            response.headers_mut().insert("grpc-message", message);
        }
    }
    response
}

/// Percent-encoding for the `grpc-message` trailer: bytes outside printable
/// ASCII, plus `%` itself, become `%XX`.
fn percent_encode_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for &byte in message.as_bytes() {
        match byte {
            0x20..=0x24 | 0x26..=0x7e => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Codec over dynamic messages. The encoder needs no descriptor (messages
/// carry their own); the decoder materializes the configured shape.
#[derive(Clone)]
pub struct DynamicCodec {
    decode: MessageDescriptor,
}

impl DynamicCodec {
    pub fn new(decode: MessageDescriptor) -> Self {
        Self { decode }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;
    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder {
            descriptor: self.decode.clone(),
        }
    }
}

pub struct DynamicEncoder;

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(&mut self, item: DynamicMessage, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        item.encode(dst)
            .map_err(|err| Status::internal(format!("message encoding: {err}")))
    }
}

pub struct DynamicDecoder {
    descriptor: MessageDescriptor,
}

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<DynamicMessage>, Status> {
        let message = DynamicMessage::decode(self.descriptor.clone(), src)
            .map_err(|err| Status::invalid_argument(format!("message decoding: {err}")))?;
        Ok(Some(message))
    }
}
