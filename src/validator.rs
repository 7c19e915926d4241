//! Pre-serve mock validation.
//!
//! Catches configuration mistakes before the server accepts traffic: every
//! mocked method must exist in the loaded descriptors, and every body entry
//! must deserialize into the method's output message type.

use crate::descriptor::{self, MethodRegistry};
use crate::rule::{MockRule, ResponseSpec};
use anyhow::{anyhow, Context, Result};
use prost_reflect::MethodDescriptor;
use std::collections::HashMap;

pub struct MockValidator<'a> {
    registry: &'a MethodRegistry,
}

impl<'a> MockValidator<'a> {
    pub fn new(registry: &'a MethodRegistry) -> Self {
        Self { registry }
    }

    pub fn validate(&self, mocks: &HashMap<String, Vec<MockRule>>) -> Result<()> {
        for (method_path, rules) in mocks {
            let method = self.registry.get(method_path).ok_or_else(|| {
                anyhow!("method {method_path} not found in registered descriptors")
            })?;
            for (index, rule) in rules.iter().enumerate() {
                validate_rule(method, rule)
                    .with_context(|| format!("invalid mock [{index}] for {method_path}"))?;
            }
        }
        Ok(())
    }
}

fn validate_rule(method: &MethodDescriptor, rule: &MockRule) -> Result<()> {
    for response in &rule.responses {
        // Status entries carry no body to check.
        if let ResponseSpec::Body(body) = response {
            descriptor::message_from_json(method.output(), body).map_err(|err| {
                anyhow!(
                    "response does not deserialize into {}: {err}",
                    method.output().full_name()
                )
            })?;
        }
    }
    Ok(())
}
