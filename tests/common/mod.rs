//! Shared test utilities for integration tests.
//!
//! Models, handlers and entry point builders used across the resource and
//! Hook scenario tests.

#![allow(dead_code)] // These utilities are used by other integration test files

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cfn_extension_runtime::request::ResourceHandlerRequest;
use cfn_extension_runtime::{
    CallbackContext, CfnModel, ExtensionError, ExtensionResult, Hook, InvocationContext, ProgressEvent,
    Resource, RuntimeConfig, SessionProxy,
};
use cfn_extension_runtime_testing::fixtures::RESOURCE_TYPE;
use cfn_extension_runtime_testing::{invocation_context, MockServiceClients};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// =============================================================================
// Models
// =============================================================================

/// Resource model used by the scenario tests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, CfnModel)]
#[serde(rename_all = "PascalCase")]
pub struct Thing {
    pub id: Option<String>,
    pub name: Option<String>,
    pub size: Option<i64>,
    pub enabled: Option<bool>,
    pub tags: Option<Vec<Tag>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, CfnModel)]
#[serde(rename_all = "PascalCase")]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// Hook type configuration used by the scenario tests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, CfnModel)]
#[serde(rename_all = "camelCase")]
pub struct GuardConfiguration {
    pub max_buckets: Option<i64>,
    pub enforce_encryption: Option<bool>,
}

// =============================================================================
// Entry points
// =============================================================================

pub const PLENTY_OF_TIME: Duration = Duration::from_secs(900);

/// Configuration independent of the test process environment.
pub fn test_config() -> RuntimeConfig {
    RuntimeConfig::default()
}

pub fn context() -> InvocationContext {
    invocation_context(PLENTY_OF_TIME)
}

pub fn resource(clients: &Arc<MockServiceClients>) -> Resource<Thing> {
    Resource::new(RESOURCE_TYPE)
        .with_config(test_config())
        .with_service_clients(clients.clone())
}

pub fn hook(clients: &Arc<MockServiceClients>) -> Hook<GuardConfiguration> {
    Hook::new(cfn_extension_runtime_testing::fixtures::HOOK_TYPE)
        .with_config(test_config())
        .with_service_clients(clients.clone())
}

// =============================================================================
// Handlers
// =============================================================================

/// A CREATE handler that assigns an id and echoes the desired state.
pub async fn create_thing(
    _session: Option<SessionProxy>,
    request: ResourceHandlerRequest<Thing>,
    _context: CallbackContext,
) -> ExtensionResult<ProgressEvent<Thing>> {
    let mut model = request.desired_resource_state.unwrap_or_default();
    model.id = Some(format!("thing-{}", request.client_request_token));
    Ok(ProgressEvent::success(model))
}

/// Reads the attempt counter of a callback context.
pub fn attempt(context: &CallbackContext) -> i64 {
    context.get("attempt").and_then(Value::as_i64).unwrap_or(0)
}

/// A callback context holding an attempt counter.
pub fn attempt_context(attempt: i64) -> CallbackContext {
    let mut context = CallbackContext::new();
    context.insert("attempt".to_string(), json!(attempt));
    context
}

/// Counts handler calls.
#[derive(Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// A service error as the signed clients would report it.
pub fn throttled(service: &str) -> ExtensionError {
    ExtensionError::service(service, "Throttling", "Rate exceeded", Some(400))
}
