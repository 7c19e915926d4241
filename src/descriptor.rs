//! Method descriptors.
//!
//! Loads compiled `FileDescriptorSet` files (produced by `protoc
//! --descriptor_set_out`) into a descriptor pool, indexes every method by its
//! full path, and synthesizes the `grpc.health.v1` descriptor so the server is
//! self-reporting healthy without user protos for it. The pool is built once
//! at startup and read-only afterwards.

use anyhow::{Context, Result};
use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor, MethodDescriptor};
use prost_types::{
    field_descriptor_proto::{Label, Type},
    DescriptorProto, EnumDescriptorProto, EnumValueDescriptorProto, FieldDescriptorProto,
    FileDescriptorProto, MethodDescriptorProto, ServiceDescriptorProto,
};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

pub const HEALTH_CHECK_METHOD: &str = "/grpc.health.v1.Health/Check";

const HEALTH_PROTO_NAME: &str = "grpc/health/v1/health.proto";

/// Load all descriptor-set files into one pool and register the health
/// descriptor unless a user proto already provides it.
pub fn load_descriptor_sets(paths: &[impl AsRef<Path>]) -> Result<DescriptorPool> {
    let mut pool = DescriptorPool::new();

    for path in paths {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading descriptor set {}", path.display()))?;
        pool.decode_file_descriptor_set(bytes.as_slice())
            .with_context(|| format!("decoding descriptor set {}", path.display()))?;
        info!(path = %path.display(), "loaded descriptor set");
    }

    if pool.get_file_by_name(HEALTH_PROTO_NAME).is_none() {
        pool.add_file_descriptor_proto(health_file_descriptor())
            .context("registering health check descriptor")?;
    }

    Ok(pool)
}

/// Index of every method in the pool by full path `/package.Service/Method`.
#[derive(Debug, Clone)]
pub struct MethodRegistry {
    methods: HashMap<String, MethodDescriptor>,
}

impl MethodRegistry {
    pub fn from_pool(pool: &DescriptorPool) -> Self {
        let mut methods = HashMap::new();
        for service in pool.services() {
            for method in service.methods() {
                let path = format!("/{}/{}", service.full_name(), method.name());
                methods.insert(path, method);
            }
        }
        Self { methods }
    }

    pub fn get(&self, path: &str) -> Option<&MethodDescriptor> {
        self.methods.get(path)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

/// Canonical JSON form of a message: original proto field names, field
/// defaults emitted explicitly so `equal_to_json` and `contains` predicates
/// see a stable shape.
pub fn message_to_canonical_json(message: &DynamicMessage) -> Result<Value> {
    let options = prost_reflect::SerializeOptions::new()
        .skip_default_fields(false)
        .use_proto_field_name(true);

    let mut buf = Vec::new();
    let mut serializer = serde_json::Serializer::new(&mut buf);
    message
        .serialize_with_options(&mut serializer, &options)
        .context("serializing message to canonical json")?;
    serde_json::from_slice(&buf).context("reparsing canonical json")
}

/// Deserialize a JSON document into a concrete message shape.
pub fn message_from_json(
    descriptor: MessageDescriptor,
    body: &Value,
) -> Result<DynamicMessage, serde_json::Error> {
    DynamicMessage::deserialize(descriptor, body.clone())
}

/// Hand-built `grpc/health/v1/health.proto`, mirroring the upstream file
/// closely enough for mocking: `Check` (unary) and `Watch` (server streaming).
pub(crate) fn health_file_descriptor() -> FileDescriptorProto {
    let request = DescriptorProto {
        name: Some("HealthCheckRequest".to_string()),
        field: vec![FieldDescriptorProto {
            name: Some("service".to_string()),
            number: Some(1),
            label: Some(Label::Optional as i32),
            r#type: Some(Type::String as i32),
            json_name: Some("service".to_string()),
            ..Default::default()
        }],
        ..Default::default()
    };

    let response = DescriptorProto {
        name: Some("HealthCheckResponse".to_string()),
        field: vec![FieldDescriptorProto {
            name: Some("status".to_string()),
            number: Some(1),
            label: Some(Label::Optional as i32),
            r#type: Some(Type::Enum as i32),
            type_name: Some(".grpc.health.v1.HealthCheckResponse.ServingStatus".to_string()),
            json_name: Some("status".to_string()),
            ..Default::default()
        }],
        enum_type: vec![EnumDescriptorProto {
            name: Some("ServingStatus".to_string()),
            value: vec![
                enum_value("UNKNOWN", 0),
                enum_value("SERVING", 1),
                enum_value("NOT_SERVING", 2),
                enum_value("SERVICE_UNKNOWN", 3),
            ],
            ..Default::default()
        }],
        ..Default::default()
    };

    let service = ServiceDescriptorProto {
        name: Some("Health".to_string()),
        method: vec![
            MethodDescriptorProto {
                name: Some("Check".to_string()),
                input_type: Some(".grpc.health.v1.HealthCheckRequest".to_string()),
                output_type: Some(".grpc.health.v1.HealthCheckResponse".to_string()),
                ..Default::default()
            },
            MethodDescriptorProto {
                name: Some("Watch".to_string()),
                input_type: Some(".grpc.health.v1.HealthCheckRequest".to_string()),
                output_type: Some(".grpc.health.v1.HealthCheckResponse".to_string()),
                server_streaming: Some(true),
                ..Default::default()
            },
        ],
        ..Default::default()
    };

    FileDescriptorProto {
        name: Some(HEALTH_PROTO_NAME.to_string()),
        package: Some("grpc.health.v1".to_string()),
        syntax: Some("proto3".to_string()),
        message_type: vec![request, response],
        service: vec![service],
        ..Default::default()
    }
}

fn enum_value(name: &str, number: i32) -> EnumValueDescriptorProto {
    EnumValueDescriptorProto {
        name: Some(name.to_string()),
        number: Some(number),
        ..Default::default()
    }
}
