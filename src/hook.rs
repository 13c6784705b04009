//! Hook entry point.
//!
//! [`Hook`] evaluates one Hook invocation event. Credentials arrive as
//! strings encrypted with the Hook's KMS key, and large target models
//! arrive by reference. An IN_PROGRESS result is continued in-process while
//! the remaining time allows; otherwise it is returned and CloudFormation
//! calls the Hook again.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::cipher::{cipher_for, Credentials};
use crate::client::{AwsServiceClients, SharedServiceClients};
use crate::config::RuntimeConfig;
use crate::error::{ExtensionError, ExtensionResult};
use crate::interface::{CallbackContext, HandlerErrorCode, HookInvocationPoint, HookProgressEvent, ProgressEvent};
use crate::lambda::InvocationContext;
use crate::log_delivery::{hook_stream_name, LogDestination, ProviderLogDelivery};
use crate::metrics::{MetricsPublisher, MetricsPublisherProxy};
use crate::model::Model;
use crate::registry::{HandlerRegistry, HookHandler, HookRegistry};
use crate::request::{HookHandlerRequest, HookInvocationRequest, HookTestEvent};
use crate::resource::run_isolated;
use crate::scheduler::{Continuation, ReinvocationPolicy};
use crate::session::SessionProxy;

/// Entry point for a Hook type.
///
/// `T` is the Hook's type configuration model, built from `hookModel`.
pub struct Hook<T = Value> {
    type_name: String,
    handlers: HookRegistry<T>,
    clients: SharedServiceClients,
    config: RuntimeConfig,
    log_delivery: ProviderLogDelivery,
}

/// Sessions decrypted from a Hook event.
struct HookSessions {
    caller: Option<SessionProxy>,
    provider: Option<SessionProxy>,
}

impl<T: Model> Hook<T> {
    /// Creates an entry point with no handlers, the production client
    /// factory and configuration read from the environment.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            handlers: HandlerRegistry::new(),
            clients: Arc::new(AwsServiceClients::new()),
            config: RuntimeConfig::from_env(),
            log_delivery: ProviderLogDelivery::new(),
        }
    }

    /// Registers the handler for `invocation_point`, replacing any earlier one.
    pub fn handler<H>(mut self, invocation_point: HookInvocationPoint, handler: H) -> Self
    where
        H: HookHandler<T> + 'static,
    {
        self.handlers.register(invocation_point, Arc::new(handler));
        self
    }

    /// Replaces the factory used to build AWS clients.
    pub fn with_service_clients(mut self, clients: SharedServiceClients) -> Self {
        self.clients = clients;
        self
    }

    /// Replaces the runtime configuration.
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Shares a log delivery handle.
    pub fn with_log_delivery(mut self, log_delivery: ProviderLogDelivery) -> Self {
        self.log_delivery = log_delivery;
        self
    }

    /// The Hook type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The log delivery handle used by this entry point.
    pub fn log_delivery(&self) -> &ProviderLogDelivery {
        &self.log_delivery
    }

    /// Handles one Hook event and returns the wire response.
    ///
    /// The `clientRequestToken` of the raw event is echoed even when the
    /// event could not be parsed.
    pub async fn handle(&self, event: Value, context: &InvocationContext) -> Value {
        let client_request_token = event
            .get("clientRequestToken")
            .and_then(Value::as_str)
            .map(str::to_string);

        let progress = match self.process(&event, context).await {
            Ok(progress) => progress,
            Err(e) => {
                tracing::error!(error = %e, error_code = %e.error_code(), "Hook handler error");
                e.to_progress_event()
            }
        };
        self.log_delivery.flush().await;

        HookProgressEvent::from_progress(progress, client_request_token)
            .to_wire()
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "Failed to serialize hook progress event");
                json!({
                    "hookStatus": "FAILED",
                    "errorCode": HandlerErrorCode::InternalFailure.as_str(),
                    "message": e.to_string(),
                })
            })
    }

    /// Handles a simplified test event and returns the progress event as is.
    ///
    /// Parse failures are reported as `InternalFailure`.
    pub async fn test_entrypoint(&self, event: Value, _context: &InvocationContext) -> ProgressEvent<Value> {
        let result = async {
            let (invocation_point, session, request, callback_context, type_configuration) = self
                .parse_test_request(&event)
                .map_err(|e| ExtensionError::internal_failure(e.to_string()))?;
            let handler = self.handlers.get(invocation_point)?;
            run_isolated(
                async move {
                    handler
                        .handle(session, request, callback_context, type_configuration)
                        .await
                },
                None,
            )
            .await
        }
        .await;

        result.unwrap_or_else(|e| {
            tracing::error!(error = %e, "Hook handler error");
            e.to_progress_event()
        })
    }

    #[allow(clippy::type_complexity)]
    fn parse_test_request(
        &self,
        event: &Value,
    ) -> ExtensionResult<(HookInvocationPoint, Option<SessionProxy>, HookHandlerRequest, CallbackContext, Option<T>)> {
        let test_event = HookTestEvent::deserialize(event)
            .map_err(|e| ExtensionError::invalid_request(format!("{} (HookTestEvent)", e)))?;
        let session = SessionProxy::from_credentials(Some(&test_event.credentials), test_event.region.as_deref());
        let request = test_event.to_handler_request()?;
        let type_configuration = T::from_raw(test_event.type_configuration.clone().unwrap_or_default())?;
        Ok((
            test_event.action_invocation_point,
            session,
            request,
            test_event.callback_context.unwrap_or_default(),
            type_configuration,
        ))
    }

    async fn process(&self, event: &Value, context: &InvocationContext) -> ExtensionResult<ProgressEvent<Value>> {
        let mut request = HookInvocationRequest::from_event(event)?;
        request
            .request_data
            .resolve_remote_payload(self.clients.payload_fetcher().as_ref())
            .await
            .map_err(|e| ExtensionError::invalid_request(e.to_string()))?;

        let sessions = self.decrypt_sessions(&request).await?;
        let invocation_point = request.action_invocation_point;
        let mut parsed_configuration = Some(T::from_raw(request.hook_model.clone().unwrap_or_default())?);
        let metrics = self.setup_observability(&request, sessions.provider.as_ref()).await;

        tracing::info!(
            invocation_point = %invocation_point,
            hook_type = %request.hook_type_name,
            target_name = %request.request_data.target_name,
            invocation = request.request_context.invocation,
            "Invoking hook handler"
        );

        let handler = self.handlers.get(invocation_point)?;
        let policy = ReinvocationPolicy::from_config(&self.config);
        let mut invocation = request.request_context.invocation;
        let mut callback_context = request.request_context.callback_context.clone().unwrap_or_default();

        loop {
            metrics
                .publish_invocation_metric(Utc::now(), invocation_point)
                .await
                .map_err(|e| ExtensionError::internal_failure(e.to_string()))?;

            let attempt_handler = Arc::clone(&handler);
            let session = sessions.caller.clone();
            let handler_request = request.to_handler_request();
            let attempt_context = callback_context.clone();
            let attempt_configuration = match parsed_configuration.take() {
                Some(configuration) => configuration,
                None => T::from_raw(request.hook_model.clone().unwrap_or_default())?,
            };
            let started = Instant::now();
            let outcome = run_isolated(
                async move {
                    attempt_handler
                        .handle(session, handler_request, attempt_context, attempt_configuration)
                        .await
                },
                None,
            )
            .await;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            let duration_published = metrics
                .publish_duration_metric(Utc::now(), invocation_point, elapsed_ms)
                .await;

            let progress = match outcome {
                Ok(progress) => progress,
                Err(e) => {
                    metrics.publish_exception_metric(Utc::now(), invocation_point, &e).await;
                    return Err(e);
                }
            };
            if let Err(e) = duration_published {
                if progress.error_code.is_none() {
                    return Err(ExtensionError::internal_failure(e.to_string()));
                }
            }
            if !progress.is_in_progress() {
                return Ok(progress);
            }

            match policy.decide(progress.callback_delay_seconds, context.remaining_time()) {
                Continuation::Local(sleep) => {
                    invocation += 1;
                    tracing::info!(
                        delay_seconds = progress.callback_delay_seconds,
                        invocation = invocation,
                        "Re-invoking hook handler locally"
                    );
                    tokio::time::sleep(sleep).await;
                    callback_context = progress.callback_context.unwrap_or_default();
                }
                Continuation::Remote { .. } => return Ok(progress),
            }
        }
    }

    async fn decrypt_sessions(&self, request: &HookInvocationRequest) -> ExtensionResult<HookSessions> {
        let data = &request.request_data;
        let cipher = cipher_for(
            data.hook_encryption_key_arn.as_deref(),
            data.hook_encryption_key_role.as_deref(),
            self.clients.as_ref(),
        )
        .await
        .map_err(|e| match e {
            ExtensionError::Encryption { .. } => e,
            other => ExtensionError::encryption(other.to_string()),
        })?;

        let caller: Option<Credentials> = cipher.decrypt_credentials(data.caller_credentials.as_deref()).await?;
        let provider: Option<Credentials> = cipher.decrypt_credentials(data.provider_credentials.as_deref()).await?;

        let region = region_from_arn(&request.stack_id);
        Ok(HookSessions {
            caller: SessionProxy::from_credentials(caller.as_ref(), region),
            provider: SessionProxy::from_credentials(provider.as_ref(), region),
        })
    }

    async fn setup_observability(
        &self,
        request: &HookInvocationRequest,
        provider_session: Option<&SessionProxy>,
    ) -> MetricsPublisherProxy {
        let mut metrics = MetricsPublisherProxy::new();
        let Some(session) = provider_session.filter(|_| !self.config.sam_local) else {
            self.log_delivery.detach().await;
            return metrics;
        };

        metrics.add_metrics_publisher(Some(MetricsPublisher::for_hook(
            self.clients.metrics(session),
            request.hook_type_name.clone(),
            &request.aws_account_id,
        )));

        match request
            .request_data
            .provider_log_group_name
            .as_deref()
            .filter(|group| !group.is_empty())
        {
            Some(group) => {
                let stream = hook_stream_name(
                    Some(request.stack_id.as_str()),
                    &request.client_request_token,
                    &request.aws_account_id,
                    &request.hook_type_name,
                );
                let destination = LogDestination::new(group, &stream, self.clients.logs(session), metrics.clone());
                self.log_delivery.attach(destination).await;
            }
            None => self.log_delivery.detach().await,
        }
        metrics
    }
}

/// Returns the region field of an ARN, if it has one.
///
/// # Examples
///
/// ```
/// use cfn_extension_runtime::hook::region_from_arn;
///
/// assert_eq!(
///     region_from_arn("arn:aws:cloudformation:us-west-2:123456789012:stack/s/1"),
///     Some("us-west-2")
/// );
/// assert_eq!(region_from_arn("not-an-arn"), None);
/// ```
pub fn region_from_arn(arn: &str) -> Option<&str> {
    let mut parts = arn.split(':');
    if parts.next() != Some("arn") {
        return None;
    }
    parts.nth(2).filter(|region| !region.is_empty())
}
