//! Handler registration and lookup.
//!
//! Handlers are registered explicitly per [`Action`] or
//! [`HookInvocationPoint`] when the entry point is built. Registering a
//! second handler for the same key replaces the first.
//!
//! Any `async` closure with the right signature is a handler:
//!
//! ```
//! use cfn_extension_runtime::registry::{HandlerRegistry, ResourceHandler};
//! use cfn_extension_runtime::{Action, CallbackContext, ExtensionError, ProgressEvent};
//! use cfn_extension_runtime::request::ResourceHandlerRequest;
//! use cfn_extension_runtime::session::SessionProxy;
//! use serde_json::Value;
//! use std::sync::Arc;
//!
//! let mut registry: HandlerRegistry<Action, dyn ResourceHandler<Value, Value>> = HandlerRegistry::new();
//! registry.register(
//!     Action::Read,
//!     Arc::new(|_session: Option<SessionProxy>, request: ResourceHandlerRequest<Value>, _context: CallbackContext| async move {
//!         Ok::<_, ExtensionError>(ProgressEvent::success(request.desired_resource_state.unwrap_or_default()))
//!     }),
//! );
//! assert!(registry.contains(Action::Read));
//! assert!(registry.get(Action::Create).is_err());
//! ```

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ExtensionError, ExtensionResult};
use crate::interface::{Action, CallbackContext, HookInvocationPoint, ProgressEvent};
use crate::request::{HookHandlerRequest, ResourceHandlerRequest};
use crate::session::SessionProxy;

/// A resource handler for one action.
#[async_trait]
pub trait ResourceHandler<M, T>: Send + Sync {
    /// Runs one attempt of the action.
    ///
    /// `session` is `None` when CloudFormation sent no usable caller
    /// credentials.
    async fn handle(
        &self,
        session: Option<SessionProxy>,
        request: ResourceHandlerRequest<M, T>,
        callback_context: CallbackContext,
    ) -> ExtensionResult<ProgressEvent<M>>;
}

#[async_trait]
impl<M, T, F, Fut> ResourceHandler<M, T> for F
where
    M: Send + 'static,
    T: Send + 'static,
    F: Fn(Option<SessionProxy>, ResourceHandlerRequest<M, T>, CallbackContext) -> Fut + Send + Sync,
    Fut: Future<Output = ExtensionResult<ProgressEvent<M>>> + Send + 'static,
{
    async fn handle(
        &self,
        session: Option<SessionProxy>,
        request: ResourceHandlerRequest<M, T>,
        callback_context: CallbackContext,
    ) -> ExtensionResult<ProgressEvent<M>> {
        (self)(session, request, callback_context).await
    }
}

/// A Hook handler for one invocation point.
#[async_trait]
pub trait HookHandler<T>: Send + Sync {
    /// Evaluates the target.
    async fn handle(
        &self,
        session: Option<SessionProxy>,
        request: HookHandlerRequest,
        callback_context: CallbackContext,
        type_configuration: Option<T>,
    ) -> ExtensionResult<ProgressEvent<Value>>;
}

#[async_trait]
impl<T, F, Fut> HookHandler<T> for F
where
    T: Send + 'static,
    F: Fn(Option<SessionProxy>, HookHandlerRequest, CallbackContext, Option<T>) -> Fut + Send + Sync,
    Fut: Future<Output = ExtensionResult<ProgressEvent<Value>>> + Send + 'static,
{
    async fn handle(
        &self,
        session: Option<SessionProxy>,
        request: HookHandlerRequest,
        callback_context: CallbackContext,
        type_configuration: Option<T>,
    ) -> ExtensionResult<ProgressEvent<Value>> {
        (self)(session, request, callback_context, type_configuration).await
    }
}

/// Handlers keyed by action or invocation point.
pub struct HandlerRegistry<K, H: ?Sized> {
    handlers: HashMap<K, Arc<H>>,
}

/// Registry of resource handlers.
pub type ResourceRegistry<M, T> = HandlerRegistry<Action, dyn ResourceHandler<M, T>>;

/// Registry of Hook handlers.
pub type HookRegistry<T> = HandlerRegistry<HookInvocationPoint, dyn HookHandler<T>>;

impl<K, H: ?Sized> Default for HandlerRegistry<K, H> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<K, H> HandlerRegistry<K, H>
where
    K: Copy + Eq + Hash + Display,
    H: ?Sized,
{
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `key`, returning the handler it replaced.
    pub fn register(&mut self, key: K, handler: Arc<H>) -> Option<Arc<H>> {
        self.handlers.insert(key, handler)
    }

    /// Looks up the handler for `key`.
    ///
    /// # Errors
    ///
    /// Returns an `InternalFailure` error `No handler for {key}` when nothing
    /// is registered.
    pub fn get(&self, key: K) -> ExtensionResult<Arc<H>> {
        self.handlers
            .get(&key)
            .cloned()
            .ok_or_else(|| ExtensionError::internal_failure(format!("No handler for {}", key)))
    }

    /// Returns true if a handler is registered for `key`.
    pub fn contains(&self, key: K) -> bool {
        self.handlers.contains_key(&key)
    }

    /// Returns the number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Rejects IN_PROGRESS results from READ and LIST handlers.
///
/// # Errors
///
/// Returns an `InternalFailure` error when a non-mutating action did not
/// complete synchronously.
pub fn ensure_synchronous<M>(action: Action, progress: &ProgressEvent<M>) -> ExtensionResult<()> {
    if progress.is_in_progress() && !action.is_mutating() {
        return Err(ExtensionError::internal_failure(
            "READ and LIST handlers must return synchronously.",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{HandlerErrorCode, OperationStatus};
    use crate::request::HookContext;
    use serde_json::json;

    fn request() -> ResourceHandlerRequest<Value> {
        ResourceHandlerRequest {
            client_request_token: "token".to_string(),
            desired_resource_state: Some(json!({"Name": "a"})),
            previous_resource_state: None,
            desired_resource_tags: None,
            previous_resource_tags: None,
            system_tags: None,
            previous_system_tags: None,
            aws_account_id: None,
            logical_resource_identifier: None,
            type_configuration: None,
            next_token: None,
            stack_id: None,
            region: None,
            aws_partition: None,
        }
    }

    #[tokio::test]
    async fn test_closure_handler_is_called() {
        let mut registry: ResourceRegistry<Value, Value> = HandlerRegistry::new();
        registry.register(
            Action::Create,
            Arc::new(|_s: Option<SessionProxy>, r: ResourceHandlerRequest<Value>, _c: CallbackContext| async move {
                Ok::<_, ExtensionError>(ProgressEvent::success(r.desired_resource_state.unwrap_or_default()))
            }),
        );

        let handler = registry.get(Action::Create).unwrap();
        let progress = handler.handle(None, request(), CallbackContext::new()).await.unwrap();
        assert_eq!(progress.status, OperationStatus::Success);
        assert_eq!(progress.resource_model, Some(json!({"Name": "a"})));
    }

    #[tokio::test]
    async fn test_register_last_wins() {
        let mut registry: ResourceRegistry<Value, Value> = HandlerRegistry::new();
        let first = registry.register(
            Action::Delete,
            Arc::new(|_s: Option<SessionProxy>, _r: ResourceHandlerRequest<Value>, _c: CallbackContext| async move {
                Ok::<_, ExtensionError>(ProgressEvent::new(OperationStatus::Success).with_message("first"))
            }),
        );
        assert!(first.is_none());
        let replaced = registry.register(
            Action::Delete,
            Arc::new(|_s: Option<SessionProxy>, _r: ResourceHandlerRequest<Value>, _c: CallbackContext| async move {
                Ok::<_, ExtensionError>(ProgressEvent::new(OperationStatus::Success).with_message("second"))
            }),
        );
        assert!(replaced.is_some());
        assert_eq!(registry.len(), 1);

        let progress = registry
            .get(Action::Delete)
            .unwrap()
            .handle(None, request(), CallbackContext::new())
            .await
            .unwrap();
        assert_eq!(progress.message, "second");
    }

    #[test]
    fn test_missing_handler() {
        let registry: HookRegistry<Value> = HandlerRegistry::new();
        let err = registry.get(HookInvocationPoint::DeletePreProvision).err().unwrap();
        assert_eq!(err.error_code(), HandlerErrorCode::InternalFailure);
        assert_eq!(err.to_string(), "No handler for DELETE_PRE_PROVISION");
    }

    #[tokio::test]
    async fn test_hook_closure_receives_type_configuration() {
        let mut registry: HookRegistry<Value> = HandlerRegistry::new();
        registry.register(
            HookInvocationPoint::CreatePreProvision,
            Arc::new(
                |_s: Option<SessionProxy>, _r: HookHandlerRequest, _c: CallbackContext, config: Option<Value>| async move {
                    let limit = config.and_then(|c| c["limit"].as_i64()).unwrap_or_default();
                    Ok::<_, ExtensionError>(ProgressEvent::new(OperationStatus::Success).with_message(limit.to_string()))
                },
            ),
        );
        let request = HookHandlerRequest {
            client_request_token: "token".to_string(),
            hook_context: HookContext::default(),
        };
        let progress = registry
            .get(HookInvocationPoint::CreatePreProvision)
            .unwrap()
            .handle(None, request, CallbackContext::new(), Some(json!({"limit": 3})))
            .await
            .unwrap();
        assert_eq!(progress.message, "3");
    }

    #[test]
    fn test_ensure_synchronous() {
        let waiting: ProgressEvent = ProgressEvent::in_progress(CallbackContext::new(), 5);
        assert!(ensure_synchronous(Action::Create, &waiting).is_ok());
        let err = ensure_synchronous(Action::List, &waiting).unwrap_err();
        assert_eq!(err.to_string(), "READ and LIST handlers must return synchronously.");
        assert!(ensure_synchronous(Action::Read, &ProgressEvent::success(json!({}))).is_ok());
    }
}
