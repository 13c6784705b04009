//! # CloudFormation Extension Runtime
//!
//! Invocation runtime for CloudFormation resource providers and Hooks
//! running on AWS Lambda.
//!
//! ## Overview
//!
//! CloudFormation invokes an extension's Lambda function with a JSON event
//! describing the requested action. This crate turns that event into a typed
//! request, runs the handler registered for the action, and turns the
//! handler's [`ProgressEvent`] back into the response CloudFormation expects.
//! Around the handler call it takes care of:
//!
//! - **Recasting**: CloudFormation sends every primitive property as a string;
//!   models are recast to their declared types before deserialization
//! - **Credentials**: caller and provider sessions are built from the event,
//!   decrypting them with KMS for Hooks
//! - **Reinvocation**: an IN_PROGRESS result is continued in-process when the
//!   remaining time allows, or scheduled through a one-shot CloudWatch Events
//!   rule otherwise
//! - **Metrics**: invocation, duration and exception metrics are published to
//!   CloudWatch under the provider's account
//! - **Log delivery**: handler logs are copied to the provider's log group
//!
//! ## Getting Started
//!
//! Add the dependency to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! cfn-extension-runtime = "0.1"
//! tokio = { version = "1", features = ["full"] }
//! serde = { version = "1", features = ["derive"] }
//! lambda_runtime = "0.13"
//! ```
//!
//! ### Resource Provider
//!
//! ```rust,ignore
//! use cfn_extension_runtime::lambda::{init_tracing, run_resource};
//! use cfn_extension_runtime::request::ResourceHandlerRequest;
//! use cfn_extension_runtime::session::SessionProxy;
//! use cfn_extension_runtime::{
//!     generate_resource_identifier, Action, CallbackContext, CfnModel, ExtensionError, ProgressEvent,
//!     Resource, RuntimeConfig,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Default, Serialize, Deserialize, CfnModel)]
//! #[serde(rename_all = "PascalCase")]
//! struct Bucket {
//!     id: Option<String>,
//!     versioned: Option<bool>,
//! }
//!
//! async fn create(
//!     _session: Option<SessionProxy>,
//!     request: ResourceHandlerRequest<Bucket>,
//!     _context: CallbackContext,
//! ) -> Result<ProgressEvent<Bucket>, ExtensionError> {
//!     let mut model = request.desired_resource_state.unwrap_or_default();
//!     model.id = Some(generate_resource_identifier(
//!         request.stack_id.as_deref().unwrap_or_default(),
//!         request.logical_resource_identifier.as_deref().unwrap_or_default(),
//!         &request.client_request_token,
//!         255,
//!     )?);
//!     Ok(ProgressEvent::success(model))
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), lambda_runtime::Error> {
//!     let config = RuntimeConfig::from_env();
//!     let resource = Resource::<Bucket>::new("Example::Storage::Bucket")
//!         .with_config(config.clone())
//!         .handler(Action::Create, create);
//!     init_tracing(&config, resource.log_delivery())?;
//!     run_resource(resource).await
//! }
//! ```
//!
//! ### Hook
//!
//! ```rust,ignore
//! use cfn_extension_runtime::lambda::run_hook;
//! use cfn_extension_runtime::{Hook, HookInvocationPoint, OperationStatus, ProgressEvent};
//!
//! let hook = Hook::<serde_json::Value>::new("Example::Guard::Hook").handler(
//!     HookInvocationPoint::CreatePreProvision,
//!     |_session, request, _context, _config| async move {
//!         let compliant = request.hook_context.target_model.is_some();
//!         Ok(ProgressEvent::new(if compliant {
//!             OperationStatus::Success
//!         } else {
//!             OperationStatus::Failed
//!         }))
//!     },
//! );
//! run_hook(hook).await
//! ```
//!
//! ## Continuing Work
//!
//! A handler that cannot finish within one attempt returns
//! [`ProgressEvent::in_progress`] with its callback context and a delay. The
//! runtime calls the handler again with that context, either after sleeping
//! locally or from a fresh invocation triggered by a scheduled rule. READ and
//! LIST handlers must complete synchronously.
//!
//! ## Module Organization
//!
//! - [`cipher`]: Credential decryption (plaintext and KMS)
//! - [`client`]: Signed clients for the AWS services the runtime calls
//! - [`config`]: Runtime tunables read from the environment
//! - [`error`]: Error type and its mapping to handler error codes
//! - [`hook`]: Hook entry point
//! - [`identifier`]: Physical resource identifier generation
//! - [`interface`]: Actions, statuses, error codes and progress events
//! - [`lambda`]: Lambda runtime glue and tracing setup
//! - [`log_delivery`]: Delivery of handler logs to the provider's log group
//! - [`metrics`]: CloudWatch metric publishing
//! - [`model`]: The [`Model`] trait implemented by resource models
//! - [`recast`]: Conversion of string-encoded properties
//! - [`registry`]: Handler traits and registration
//! - [`request`]: Wire request types and their handler-facing forms
//! - [`resource`]: Resource entry point
//! - [`scheduler`]: Reinvocation decisions and CloudWatch Events scheduling
//! - [`session`]: Credential-scoped sessions handed to handlers

extern crate self as cfn_extension_runtime;

pub mod cipher;
pub mod client;
pub mod config;
pub mod error;
pub mod hook;
pub mod identifier;
pub mod interface;
pub mod lambda;
pub mod log_delivery;
pub mod metrics;
pub mod model;
pub mod recast;
pub mod registry;
pub mod request;
pub mod resource;
pub mod scheduler;
pub mod session;

// Re-export main types at crate root
pub use cipher::{Cipher, Credentials, KmsCipher, PlaintextCipher};
pub use client::{AwsServiceClients, ServiceClients, SharedServiceClients};
pub use config::RuntimeConfig;
pub use error::{ExtensionError, ExtensionResult};
pub use hook::Hook;
pub use identifier::generate_resource_identifier;
pub use interface::{
    Action, CallbackContext, HandlerErrorCode, HookInvocationPoint, HookProgressEvent, HookStatus,
    OperationStatus, ProgressEvent,
};
pub use lambda::InvocationContext;
pub use log_delivery::ProviderLogDelivery;
pub use model::Model;
pub use recast::{FieldSchema, FieldType, ModelSchema};
pub use registry::{HookHandler, ResourceHandler};
pub use request::{HookHandlerRequest, ResourceHandlerRequest};
pub use resource::Resource;
pub use session::SessionProxy;

// Re-export macro if enabled
#[cfg(feature = "macros")]
pub use cfn_extension_runtime_macros::CfnModel;
