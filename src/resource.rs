//! Resource provider entry point.
//!
//! [`Resource`] turns one CloudFormation resource event into one wire
//! response. Each invocation:
//!
//! 1. Parses the event and builds sessions from the credential sets.
//! 2. Removes the timer that triggered it, if any.
//! 3. Points provider log delivery and metrics at the provider account.
//! 4. Runs the registered handler, on its own task and under a deadline
//!    for write actions.
//! 5. Continues an IN_PROGRESS result either locally, after sleeping, or
//!    through a CloudWatch Events timer.
//!
//! Every failure ends up as a FAILED progress event; nothing escapes to the
//! Lambda runtime.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::client::{AwsServiceClients, SharedServiceClients};
use crate::config::RuntimeConfig;
use crate::error::{ExtensionError, ExtensionResult};
use crate::interface::{Action, CallbackContext, HandlerErrorCode, ProgressEvent};
use crate::lambda::InvocationContext;
use crate::log_delivery::{resource_stream_name, LogDestination, ProviderLogDelivery};
use crate::metrics::{MetricsPublisher, MetricsPublisherProxy};
use crate::model::Model;
use crate::registry::{ensure_synchronous, HandlerRegistry, ResourceHandler, ResourceRegistry};
use crate::request::{HandlerRequest, ResourceHandlerRequest, TestEvent};
use crate::scheduler::{request_context_mut, CloudWatchScheduler, Continuation, ReinvocationPolicy};
use crate::session::SessionProxy;

/// Entry point for a resource type.
///
/// `M` is the resource model and `T` the type configuration model.
///
/// # Examples
///
/// ```
/// use cfn_extension_runtime::{Action, CallbackContext, ExtensionError, ProgressEvent, Resource};
/// use cfn_extension_runtime::request::ResourceHandlerRequest;
/// use cfn_extension_runtime::session::SessionProxy;
/// use serde_json::Value;
///
/// let resource: Resource = Resource::new("Example::Test::Thing").handler(
///     Action::Read,
///     |_session: Option<SessionProxy>, request: ResourceHandlerRequest<Value>, _context: CallbackContext| async move {
///         Ok::<_, ExtensionError>(ProgressEvent::success(request.desired_resource_state.unwrap_or_default()))
///     },
/// );
/// assert_eq!(resource.type_name(), "Example::Test::Thing");
/// ```
pub struct Resource<M = Value, T = Value> {
    type_name: String,
    handlers: ResourceRegistry<M, T>,
    clients: SharedServiceClients,
    config: RuntimeConfig,
    log_delivery: ProviderLogDelivery,
}

/// Outcome of one handler attempt inside the continuation loop.
enum Attempt<M> {
    Done(ProgressEvent<M>),
    Continue(CallbackContext),
}

impl<M: Model, T: Model> Resource<M, T> {
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

    /// Registers the handler for `action`, replacing any earlier one.
    pub fn handler<H>(mut self, action: Action, handler: H) -> Self
    where
        H: ResourceHandler<M, T> + 'static,
    {
        self.handlers.register(action, Arc::new(handler));
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

    /// Shares a log delivery handle, typically the one passed to
    /// [`init_tracing`](crate::lambda::init_tracing).
    pub fn with_log_delivery(mut self, log_delivery: ProviderLogDelivery) -> Self {
        self.log_delivery = log_delivery;
        self
    }

    /// The resource type name, e.g. `AWS::S3::Bucket`.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The log delivery handle used by this entry point.
    pub fn log_delivery(&self) -> &ProviderLogDelivery {
        &self.log_delivery
    }

    /// Handles one resource event and returns the wire response.
    pub async fn handle(&self, mut event: Value, context: &InvocationContext) -> Value {
        let bearer_token = event
            .get("bearerToken")
            .and_then(Value::as_str)
            .map(str::to_string);

        let progress = match self.process(&mut event, context).await {
            Ok(progress) => progress,
            Err(e) => {
                tracing::error!(error = %e, error_code = %e.error_code(), "Handler error");
                e.to_progress_event()
            }
        };
        self.log_delivery.flush().await;

        progress.to_wire(bearer_token.as_deref()).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to serialize progress event");
            failed_wire(&e.to_string(), bearer_token.as_deref())
        })
    }

    /// Handles a simplified test event and returns the progress event as is.
    ///
    /// Parse failures are reported as `InvalidRequest`. No metrics, log
    /// delivery or reinvocation take place.
    pub async fn test_entrypoint(&self, event: Value, _context: &InvocationContext) -> ProgressEvent<M> {
        let result = async {
            let (action, session, request, callback_context) = self.parse_test_request(&event)?;
            let handler = self.handlers.get(action)?;
            let progress = run_isolated(
                async move { handler.handle(session, request, callback_context).await },
                None,
            )
            .await?;
            ensure_synchronous(action, &progress)?;
            Ok::<_, ExtensionError>(progress)
        }
        .await;

        result.unwrap_or_else(|e| {
            tracing::error!(error = %e, "Handler error");
            e.to_progress_event()
        })
    }

    fn parse_test_request(
        &self,
        event: &Value,
    ) -> ExtensionResult<(Action, Option<SessionProxy>, ResourceHandlerRequest<M, T>, CallbackContext)> {
        let test_event = TestEvent::deserialize(event)
            .map_err(|e| ExtensionError::invalid_request(format!("{} (TestEvent)", e)))?;
        let session = SessionProxy::from_credentials(Some(&test_event.credentials), test_event.region.as_deref());
        let request = test_event
            .request
            .to_modelled()
            .map_err(|e| ExtensionError::invalid_request(e.to_string()))?;
        Ok((
            test_event.action,
            session,
            request,
            test_event.callback_context.unwrap_or_default(),
        ))
    }

    async fn process(&self, event: &mut Value, context: &InvocationContext) -> ExtensionResult<ProgressEvent<M>> {
        let request = HandlerRequest::from_event(event)?;
        let action = request.action;
        let data = &request.request_data;
        let region = Some(request.region.as_str());
        let sam_local = self.config.sam_local;

        let caller_session = SessionProxy::from_credentials(data.caller_credentials.as_ref(), region);
        let provider_session = SessionProxy::from_credentials(data.provider_credentials.as_ref(), region);
        let platform_session = SessionProxy::from_credentials(data.platform_credentials.as_ref(), region);

        let scheduler = platform_session
            .as_ref()
            .filter(|_| !sam_local)
            .map(|session| CloudWatchScheduler::new(self.clients.events(session)));
        if let Some(scheduler) = &scheduler {
            scheduler
                .cleanup(
                    request.request_context.cloud_watch_events_rule_name.as_deref(),
                    request.request_context.cloud_watch_events_target_id.as_deref(),
                )
                .await;
        }

        let metrics = self.setup_observability(&request, provider_session.as_ref()).await;

        tracing::info!(
            action = %action,
            resource_type = %self.type_name,
            invocation = request.request_context.invocation,
            "Invoking resource handler"
        );

        let handler = self.handlers.get(action)?;
        let policy = ReinvocationPolicy::from_config(&self.config);
        let mut invocation = request.request_context.invocation;
        let mut callback_context = request.request_context.callback_context.clone().unwrap_or_default();

        loop {
            let typed_request = request.to_unmodelled().to_modelled::<M, T>()?;
            let deadline = action
                .is_mutating()
                .then(|| context.remaining_time().saturating_sub(self.config.handler_deadline_buffer));

            metrics
                .publish_invocation_metric(Utc::now(), action)
                .await
                .map_err(|e| ExtensionError::internal_failure(e.to_string()))?;
            let started = Instant::now();
            let attempt_handler = Arc::clone(&handler);
            let session = caller_session.clone();
            let attempt_context = callback_context.clone();
            let outcome = run_isolated(
                async move { attempt_handler.handle(session, typed_request, attempt_context).await },
                deadline,
            )
            .await;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            let duration_published = metrics.publish_duration_metric(Utc::now(), action, elapsed_ms).await;

            let progress = match outcome {
                Ok(progress) => progress,
                Err(e) => {
                    metrics.publish_exception_metric(Utc::now(), action, &e).await;
                    if e.is_timeout() {
                        return self
                            .reschedule_after_timeout(event, &request, scheduler.as_ref(), context, callback_context, invocation, e)
                            .await;
                    }
                    return Err(e);
                }
            };
            ensure_synchronous(action, &progress)?;
            if let Err(e) = duration_published {
                if progress.error_code.is_none() {
                    return Err(ExtensionError::internal_failure(e.to_string()));
                }
            }

            match self
                .continue_in_progress(event, progress, &policy, scheduler.as_ref(), context, &mut invocation)
                .await?
            {
                Attempt::Done(progress) => return Ok(progress),
                Attempt::Continue(next_context) => callback_context = next_context,
            }
        }
    }

    /// Attaches log delivery and builds the metrics publishers when the
    /// provider account is known. Detaches a destination left over from an
    /// earlier invocation otherwise.
    async fn setup_observability(
        &self,
        request: &HandlerRequest,
        provider_session: Option<&SessionProxy>,
    ) -> MetricsPublisherProxy {
        let mut metrics = MetricsPublisherProxy::new();
        let provider_session = provider_session.filter(|_| !self.config.sam_local);
        let Some(session) = provider_session else {
            self.log_delivery.detach().await;
            return metrics;
        };

        metrics.add_metrics_publisher(Some(MetricsPublisher::new(
            self.clients.metrics(session),
            self.type_name.clone(),
        )));

        match request
            .request_data
            .provider_log_group_name
            .as_deref()
            .filter(|group| !group.is_empty())
        {
            Some(group) => {
                let stream = resource_stream_name(
                    request.stack_id.as_deref(),
                    request.request_data.logical_resource_id.as_deref(),
                    &request.aws_account_id,
                    &request.region,
                );
                let destination = LogDestination::new(group, &stream, self.clients.logs(session), metrics.clone());
                self.log_delivery.attach(destination).await;
            }
            None => self.log_delivery.detach().await,
        }
        metrics
    }

    /// Decides what happens after a handler attempt that did not fail.
    async fn continue_in_progress(
        &self,
        event: &mut Value,
        progress: ProgressEvent<M>,
        policy: &ReinvocationPolicy,
        scheduler: Option<&CloudWatchScheduler>,
        context: &InvocationContext,
        invocation: &mut u32,
    ) -> ExtensionResult<Attempt<M>> {
        if !progress.is_in_progress() {
            return Ok(Attempt::Done(progress));
        }

        *invocation += 1;
        let next_context = progress.callback_context.clone().unwrap_or_default();
        let delay = progress.callback_delay_seconds;

        match policy.decide(delay, context.remaining_time()) {
            Continuation::Local(sleep) => {
                tracing::info!(
                    delay_seconds = delay,
                    invocation = *invocation,
                    "Scheduling re-invoke locally"
                );
                tokio::time::sleep(sleep).await;
                Ok(Attempt::Continue(next_context))
            }
            Continuation::Remote { minutes } => {
                let Some(scheduler) = scheduler else {
                    if !self.config.sam_local {
                        tracing::warn!("No platform credentials, returning IN_PROGRESS without scheduling a re-invoke");
                    }
                    return Ok(Attempt::Done(progress));
                };
                record_continuation(event, *invocation, &next_context, None)?;
                tracing::info!(minutes = minutes, invocation = *invocation, "Scheduling re-invoke through CloudWatch Events");
                scheduler
                    .reschedule_after_minutes(context.function_arn(), minutes, event)
                    .await?;
                Ok(Attempt::Done(progress))
            }
        }
    }

    /// Hands a timed out write handler to a fresh invocation while the
    /// retry budget lasts, then reports `ServiceTimeout`.
    #[allow(clippy::too_many_arguments)]
    async fn reschedule_after_timeout(
        &self,
        event: &mut Value,
        request: &HandlerRequest,
        scheduler: Option<&CloudWatchScheduler>,
        context: &InvocationContext,
        callback_context: CallbackContext,
        invocation: u32,
        error: ExtensionError,
    ) -> ExtensionResult<ProgressEvent<M>> {
        let retries = request.request_context.timeout_retries;
        let Some(scheduler) = scheduler.filter(|_| retries < self.config.max_timeout_reschedules) else {
            tracing::error!(timeout_retries = retries, "Handler timed out, giving up");
            return Err(error);
        };

        tracing::warn!(timeout_retries = retries + 1, "Handler timed out, scheduling another attempt");
        record_continuation(event, invocation + 1, &callback_context, Some(retries + 1))?;
        scheduler
            .reschedule_after_minutes(context.function_arn(), 1, event)
            .await?;
        Ok(ProgressEvent::in_progress(callback_context, 60))
    }
}

/// Runs one handler attempt on its own task.
///
/// A panic becomes an `InternalFailure`; exceeding `deadline` aborts the
/// task and returns a timeout error.
pub(crate) async fn run_isolated<R, F>(attempt: F, deadline: Option<Duration>) -> ExtensionResult<R>
where
    R: Send + 'static,
    F: Future<Output = ExtensionResult<R>> + Send + 'static,
{
    let mut task = tokio::spawn(attempt);

    let joined = match deadline {
        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                task.abort();
                return Err(ExtensionError::timeout(format!(
                    "handler did not complete within {} ms",
                    limit.as_millis()
                )));
            }
        },
        None => task.await,
    };

    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(ExtensionError::internal_failure(panic_message(e.into_panic()))),
        Err(e) => Err(ExtensionError::internal_failure(e.to_string())),
    }
}

/// Extracts the message of a panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Writes the continuation state into the event that will be re-delivered.
fn record_continuation(
    event: &mut Value,
    invocation: u32,
    callback_context: &CallbackContext,
    timeout_retries: Option<u32>,
) -> ExtensionResult<()> {
    let request_context = request_context_mut(event)?;
    request_context.insert("invocation".to_string(), json!(invocation));
    request_context.insert(
        "callbackContext".to_string(),
        Value::Object(callback_context.clone()),
    );
    if let Some(retries) = timeout_retries {
        request_context.insert("timeoutRetries".to_string(), json!(retries));
    }
    Ok(())
}

/// Last-resort response when a progress event cannot be serialized.
fn failed_wire(message: &str, bearer_token: Option<&str>) -> Value {
    let mut wire = json!({
        "status": "FAILED",
        "errorCode": HandlerErrorCode::InternalFailure.as_str(),
        "message": message,
    });
    if let (Some(token), Some(fields)) = (bearer_token, wire.as_object_mut()) {
        fields.insert("bearerToken".to_string(), Value::String(token.to_string()));
    }
    wire
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_continuation() {
        let mut event = json!({"action": "CREATE", "requestContext": null});
        let mut context = CallbackContext::new();
        context.insert("attempt".to_string(), json!(2));

        record_continuation(&mut event, 3, &context, None).unwrap();
        assert_eq!(
            event["requestContext"],
            json!({"invocation": 3, "callbackContext": {"attempt": 2}})
        );

        record_continuation(&mut event, 4, &context, Some(1)).unwrap();
        assert_eq!(event["requestContext"]["timeoutRetries"], json!(1));
    }

    #[test]
    fn test_failed_wire() {
        assert_eq!(
            failed_wire("boom", Some("token")),
            json!({"status": "FAILED", "errorCode": "InternalFailure", "message": "boom", "bearerToken": "token"})
        );
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(5)), "handler panicked");
    }

    #[tokio::test]
    async fn test_run_isolated_contains_panics() {
        let err = run_isolated::<(), _>(
            async move {
                if true {
                    panic!("kaboom");
                }
                Ok(())
            },
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(err.error_code(), HandlerErrorCode::InternalFailure);
        assert_eq!(err.to_string(), "kaboom");
    }

    #[tokio::test]
    async fn test_run_isolated_passes_errors_through() {
        let err = run_isolated::<(), _>(async move { Err(ExtensionError::not_updatable("immutable")) }, None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), HandlerErrorCode::NotUpdatable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_isolated_deadline() {
        let err = run_isolated::<(), _>(
            async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            },
            Some(Duration::from_secs(10)),
        )
        .await
        .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.error_code(), HandlerErrorCode::ServiceTimeout);
    }
}
