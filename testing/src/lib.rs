//! Testing utilities for cfn-extension-runtime
//!
//! This crate provides tools for exercising resource and Hook entry points
//! in-process, without AWS.
//!
//! # Features
//!
//! - **Mock clients**: CloudWatch Events, Logs, metrics, KMS and remote
//!   payload mocks that record their calls and answer scripted responses
//! - **MockServiceClients**: a client factory handing out those mocks
//! - **Event builders**: complete resource and Hook events as CloudFormation
//!   sends them
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use cfn_extension_runtime::{Action, Resource};
//! use cfn_extension_runtime_testing::{invocation_context, MockServiceClients, ResourceEventBuilder};
//!
//! #[tokio::test]
//! async fn test_create() {
//!     let clients = Arc::new(MockServiceClients::new());
//!     let resource = Resource::new("Example::Test::Resource")
//!         .with_service_clients(clients.clone())
//!         .handler(Action::Create, create_handler);
//!
//!     let event = ResourceEventBuilder::new(Action::Create).build();
//!     let response = resource.handle(event, &invocation_context(Duration::from_secs(900))).await;
//!
//!     assert_eq!(response["status"], "SUCCESS");
//!     assert!(!clients.metrics.calls().is_empty());
//! }
//! ```

pub mod fixtures;
pub mod mock_client;

pub use fixtures::{credentials, invocation_context, HookEventBuilder, ResourceEventBuilder};
pub use mock_client::{
    EventsCall, LogsCall, MetricsCall, MockEventsClient, MockKeyDecryptor, MockLogsClient, MockMetricsClient,
    MockPayloadFetcher, MockServiceClients,
};
