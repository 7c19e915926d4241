//! Server reflection.
//!
//! Answers `grpc.reflection.v1.ServerReflection` queries from the loaded
//! descriptor pool so clients such as grpcurl can discover the mocked
//! services without local protos. The `v1alpha` revision shares the wire
//! format, so the same handler serves both paths.

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use prost::Message;
use prost_reflect::{DescriptorPool, FileDescriptor};
use std::collections::HashSet;
use tonic::{Code, Status, Streaming};
use tonic_reflection::pb::v1::server_reflection_request::MessageRequest;
use tonic_reflection::pb::v1::server_reflection_response::MessageResponse;
use tonic_reflection::pb::v1::{
    ErrorResponse, FileDescriptorResponse, ListServiceResponse, ServerReflectionRequest,
    ServerReflectionResponse, ServiceResponse,
};

pub const V1_METHOD: &str = "/grpc.reflection.v1.ServerReflection/ServerReflectionInfo";
pub const V1ALPHA_METHOD: &str = "/grpc.reflection.v1alpha.ServerReflection/ServerReflectionInfo";

/// One handler instance per reflection call, over the startup-built pool.
pub struct ReflectionHandler {
    pool: DescriptorPool,
}

impl ReflectionHandler {
    pub fn new(pool: DescriptorPool) -> Self {
        Self { pool }
    }
}

impl tonic::server::StreamingService<ServerReflectionRequest> for ReflectionHandler {
    type Response = ServerReflectionResponse;
    type ResponseStream = BoxStream<'static, Result<ServerReflectionResponse, Status>>;
    type Future = BoxFuture<'static, Result<tonic::Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: tonic::Request<Streaming<ServerReflectionRequest>>) -> Self::Future {
        let pool = self.pool.clone();

        Box::pin(async move {
            let inbound = request.into_inner();
            // One response per request; lookup failures answer in-stream
            // rather than failing the RPC.
            let responses = inbound.map(move |request| {
                let request = request?;
                let message_response = match &request.message_request {
                    Some(message_request) => respond(&pool, message_request),
                    None => error_response(Code::InvalidArgument, "missing message_request"),
                };
                Ok(ServerReflectionResponse {
                    valid_host: request.host.clone(),
                    original_request: Some(request),
                    message_response: Some(message_response),
                })
            });
            let stream: Self::ResponseStream = Box::pin(responses);
            Ok(tonic::Response::new(stream))
        })
    }
}

fn respond(pool: &DescriptorPool, request: &MessageRequest) -> MessageResponse {
    match request {
        MessageRequest::ListServices(_) => {
            MessageResponse::ListServicesResponse(ListServiceResponse {
                service: pool
                    .services()
                    .map(|service| ServiceResponse {
                        name: service.full_name().to_string(),
                    })
                    .collect(),
            })
        }
        MessageRequest::FileByFilename(filename) => match pool.get_file_by_name(filename) {
            Some(file) => file_response(pool, file),
            None => error_response(Code::NotFound, &format!("file not found: {filename}")),
        },
        MessageRequest::FileContainingSymbol(symbol) => {
            match file_containing_symbol(pool, symbol) {
                Some(file) => file_response(pool, file),
                None => error_response(Code::NotFound, &format!("symbol not found: {symbol}")),
            }
        }
        MessageRequest::FileContainingExtension(_)
        | MessageRequest::AllExtensionNumbersOfType(_) => {
            error_response(Code::Unimplemented, "extensions are not supported")
        }
    }
}

fn file_containing_symbol(pool: &DescriptorPool, symbol: &str) -> Option<FileDescriptor> {
    if let Some(message) = pool.get_message_by_name(symbol) {
        return Some(message.parent_file());
    }
    if let Some(enum_descriptor) = pool.get_enum_by_name(symbol) {
        return Some(enum_descriptor.parent_file());
    }
    if let Some(service) = pool.get_service_by_name(symbol) {
        return Some(service.parent_file());
    }
    // Method symbols name their service in all but the last segment.
    let (service_name, method) = symbol.rsplit_once('.')?;
    let service = pool.get_service_by_name(service_name)?;
    let found = service
        .methods()
        .any(|m| m.name() == method)
        .then(|| service.parent_file());
    found
}

/// The requested file plus its transitive imports, encoded. Sending the
/// closure in one response saves the client a round-trip per import.
fn file_response(pool: &DescriptorPool, file: FileDescriptor) -> MessageResponse {
    let mut queue = vec![file];
    let mut seen = HashSet::new();
    let mut encoded = Vec::new();

    while let Some(file) = queue.pop() {
        if !seen.insert(file.name().to_string()) {
            continue;
        }
        let proto = file.file_descriptor_proto();
        encoded.push(proto.encode_to_vec().into());
        for dependency in &proto.dependency {
            if let Some(dep) = pool.get_file_by_name(dependency) {
                queue.push(dep);
            }
        }
    }

    MessageResponse::FileDescriptorResponse(FileDescriptorResponse {
        file_descriptor_proto: encoded,
    })
}

fn error_response(code: Code, message: &str) -> MessageResponse {
    MessageResponse::ErrorResponse(ErrorResponse {
        error_code: code as i32,
        error_message: message.to_string(),
    })
}
