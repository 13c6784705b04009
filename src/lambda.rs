//! AWS Lambda integration.
//!
//! This module wires a [`Resource`] or [`Hook`] entry point into
//! `lambda_runtime` and installs the process-wide `tracing` subscriber.
//!
//! # Example
//!
//! ```rust,ignore
//! use cfn_extension_runtime::lambda::{init_tracing, run_resource};
//! use cfn_extension_runtime::{Action, Resource, RuntimeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), lambda_runtime::Error> {
//!     let config = RuntimeConfig::from_env();
//!     let resource = Resource::<BucketModel>::new("Example::Storage::Bucket")
//!         .with_config(config.clone())
//!         .handler(Action::Create, create_handler);
//!     init_tracing(&config, resource.log_delivery())?;
//!     run_resource(resource).await
//! }
//! ```

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lambda_runtime::{service_fn, LambdaEvent};
use serde_json::Value;
use tokio::time::Instant;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::RuntimeConfig;
use crate::error::{ExtensionError, ExtensionResult};
use crate::hook::Hook;
use crate::log_delivery::{ProviderLogDelivery, ProviderLogLayer};
use crate::model::Model;
use crate::resource::Resource;

/// What the entry points need to know about the running function invocation.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    function_arn: String,
    deadline: Instant,
}

impl InvocationContext {
    /// Creates a context that expires `remaining` from now.
    pub fn new(function_arn: impl Into<String>, remaining: Duration) -> Self {
        Self {
            function_arn: function_arn.into(),
            deadline: Instant::now() + remaining,
        }
    }

    /// Builds the context from the Lambda runtime's invocation context.
    pub fn from_lambda(context: &lambda_runtime::Context) -> Self {
        let deadline = UNIX_EPOCH + Duration::from_millis(context.deadline);
        let remaining = deadline
            .duration_since(SystemTime::now())
            .unwrap_or_default();
        Self::new(context.invoked_function_arn.clone(), remaining)
    }

    /// ARN of the function, used as the reinvocation target.
    pub fn function_arn(&self) -> &str {
        &self.function_arn
    }

    /// Time left before the function is stopped.
    pub fn remaining_time(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Installs the global subscriber: a `fmt` layer for the function's own
/// log stream and a [`ProviderLogLayer`] feeding `delivery`.
///
/// The filter comes from [`RuntimeConfig::log_level`], falling back to
/// `info` if the directive does not parse.
///
/// # Errors
///
/// Returns a validation error if a global subscriber is already installed.
pub fn init_tracing(config: &RuntimeConfig, delivery: &ProviderLogDelivery) -> ExtensionResult<()> {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(false),
        )
        .with(ProviderLogLayer::new(delivery.clone()))
        .try_init()
        .map_err(|e| ExtensionError::validation(format!("tracing subscriber already installed: {}", e)))
}

/// Serves resource invocations until the Lambda runtime shuts down.
pub async fn run_resource<M: Model, T: Model>(resource: Resource<M, T>) -> Result<(), lambda_runtime::Error> {
    let resource = Arc::new(resource);
    lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| {
        let resource = Arc::clone(&resource);
        async move {
            let (payload, context) = event.into_parts();
            let invocation = InvocationContext::from_lambda(&context);
            Ok::<Value, lambda_runtime::Error>(resource.handle(payload, &invocation).await)
        }
    }))
    .await
}

/// Serves simplified test events against a resource, as used by contract tests.
pub async fn run_resource_test<M: Model, T: Model>(
    resource: Resource<M, T>,
) -> Result<(), lambda_runtime::Error> {
    let resource = Arc::new(resource);
    lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| {
        let resource = Arc::clone(&resource);
        async move {
            let (payload, context) = event.into_parts();
            let invocation = InvocationContext::from_lambda(&context);
            let progress = resource.test_entrypoint(payload, &invocation).await;
            Ok::<Value, lambda_runtime::Error>(progress.to_wire(None)?)
        }
    }))
    .await
}

/// Serves Hook invocations until the Lambda runtime shuts down.
pub async fn run_hook<T: Model>(hook: Hook<T>) -> Result<(), lambda_runtime::Error> {
    let hook = Arc::new(hook);
    lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| {
        let hook = Arc::clone(&hook);
        async move {
            let (payload, context) = event.into_parts();
            let invocation = InvocationContext::from_lambda(&context);
            Ok::<Value, lambda_runtime::Error>(hook.handle(payload, &invocation).await)
        }
    }))
    .await
}

/// Serves simplified test events against a Hook.
pub async fn run_hook_test<T: Model>(hook: Hook<T>) -> Result<(), lambda_runtime::Error> {
    let hook = Arc::new(hook);
    lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| {
        let hook = Arc::clone(&hook);
        async move {
            let (payload, context) = event.into_parts();
            let invocation = InvocationContext::from_lambda(&context);
            let progress = hook.test_entrypoint(payload, &invocation).await;
            Ok::<Value, lambda_runtime::Error>(progress.to_wire(None)?)
        }
    }))
    .await
}
