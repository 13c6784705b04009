//! Core interface types shared by handler code and the runtime.
//!
//! This module defines the lifecycle enums, the error code taxonomy and the
//! [`ProgressEvent`] value that handlers return to report their state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ExtensionError, ExtensionResult};
use crate::model::strip_nulls;

/// Opaque continuation state a handler stashes between reinvocations.
pub type CallbackContext = Map<String, Value>;

/// Resource lifecycle operation requested by CloudFormation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// Create a new resource
    Create,
    /// Read the current state of a resource
    Read,
    /// Update an existing resource
    Update,
    /// Delete a resource
    Delete,
    /// List resources of this type
    List,
}

impl Action {
    /// All actions, in declaration order.
    pub const ALL: [Action; 5] = [
        Action::Create,
        Action::Read,
        Action::Update,
        Action::Delete,
        Action::List,
    ];

    /// Returns the wire name of this action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Read => "READ",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::List => "LIST",
        }
    }

    /// Returns true for actions that change the resource (CREATE, UPDATE, DELETE).
    pub fn is_mutating(&self) -> bool {
        matches!(self, Self::Create | Self::Update | Self::Delete)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ExtensionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| ExtensionError::invalid_request(format!("Unknown action '{}'", s)))
    }
}

/// Point in a stack operation at which a Hook is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HookInvocationPoint {
    /// Before a resource is created
    CreatePreProvision,
    /// Before a resource is updated
    UpdatePreProvision,
    /// Before a resource is deleted
    DeletePreProvision,
}

impl HookInvocationPoint {
    /// All invocation points, in declaration order.
    pub const ALL: [HookInvocationPoint; 3] = [
        HookInvocationPoint::CreatePreProvision,
        HookInvocationPoint::UpdatePreProvision,
        HookInvocationPoint::DeletePreProvision,
    ];

    /// Returns the wire name of this invocation point.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreatePreProvision => "CREATE_PRE_PROVISION",
            Self::UpdatePreProvision => "UPDATE_PRE_PROVISION",
            Self::DeletePreProvision => "DELETE_PRE_PROVISION",
        }
    }
}

impl fmt::Display for HookInvocationPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookInvocationPoint {
    type Err = ExtensionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|point| point.as_str() == s)
            .ok_or_else(|| {
                ExtensionError::invalid_request(format!("Unknown invocation point '{}'", s))
            })
    }
}

/// Status of a resource operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    /// The operation has not started
    Pending,
    /// The operation is still running and wants to be called again
    InProgress,
    /// The operation completed successfully
    Success,
    /// A Hook passed and asks CloudFormation to skip stack-level evaluation
    ChangeSetSuccessSkipStackHook,
    /// The operation failed
    Failed,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::InProgress => write!(f, "IN_PROGRESS"),
            Self::Success => write!(f, "SUCCESS"),
            Self::ChangeSetSuccessSkipStackHook => write!(f, "CHANGE_SET_SUCCESS_SKIP_STACK_HOOK"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Status of a Hook invocation, as reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HookStatus {
    /// The Hook has not started
    Pending,
    /// The Hook is still evaluating
    InProgress,
    /// The Hook passed
    Success,
    /// The Hook passed and stack-level evaluation should be skipped
    ChangeSetSuccessSkipStackHook,
    /// The Hook failed
    Failed,
}

impl From<OperationStatus> for HookStatus {
    fn from(status: OperationStatus) -> Self {
        match status {
            OperationStatus::Pending => Self::Pending,
            OperationStatus::InProgress => Self::InProgress,
            OperationStatus::Success => Self::Success,
            OperationStatus::ChangeSetSuccessSkipStackHook => Self::ChangeSetSuccessSkipStackHook,
            OperationStatus::Failed => Self::Failed,
        }
    }
}

/// Error codes reported to CloudFormation when an operation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandlerErrorCode {
    NotUpdatable,
    InvalidRequest,
    AccessDenied,
    InvalidCredentials,
    AlreadyExists,
    NotFound,
    ResourceConflict,
    Throttling,
    ServiceLimitExceeded,
    NotStabilized,
    GeneralServiceException,
    ServiceInternalError,
    ServiceTimeout,
    NetworkFailure,
    InternalFailure,
    InvalidTypeConfiguration,
    HandlerInternalFailure,
    NonCompliant,
    UnsupportedTarget,
    Unknown,
}

impl HandlerErrorCode {
    /// Returns the wire name of this error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotUpdatable => "NotUpdatable",
            Self::InvalidRequest => "InvalidRequest",
            Self::AccessDenied => "AccessDenied",
            Self::InvalidCredentials => "InvalidCredentials",
            Self::AlreadyExists => "AlreadyExists",
            Self::NotFound => "NotFound",
            Self::ResourceConflict => "ResourceConflict",
            Self::Throttling => "Throttling",
            Self::ServiceLimitExceeded => "ServiceLimitExceeded",
            Self::NotStabilized => "NotStabilized",
            Self::GeneralServiceException => "GeneralServiceException",
            Self::ServiceInternalError => "ServiceInternalError",
            Self::ServiceTimeout => "ServiceTimeout",
            Self::NetworkFailure => "NetworkFailure",
            Self::InternalFailure => "InternalFailure",
            Self::InvalidTypeConfiguration => "InvalidTypeConfiguration",
            Self::HandlerInternalFailure => "HandlerInternalFailure",
            Self::NonCompliant => "NonCompliant",
            Self::UnsupportedTarget => "UnsupportedTarget",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for HandlerErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Units used by the published CloudWatch metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StandardUnit {
    Count,
    Milliseconds,
}

impl fmt::Display for StandardUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count => write!(f, "Count"),
            Self::Milliseconds => write!(f, "Milliseconds"),
        }
    }
}

/// Metric names published around each handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricTypes {
    HandlerException,
    HandlerInvocationCount,
    HandlerInvocationDuration,
}

impl fmt::Display for MetricTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HandlerException => write!(f, "HandlerException"),
            Self::HandlerInvocationCount => write!(f, "HandlerInvocationCount"),
            Self::HandlerInvocationDuration => write!(f, "HandlerInvocationDuration"),
        }
    }
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

/// The state a handler reports back to the runtime.
///
/// `M` is the resource model type. Untyped handlers use the default,
/// [`serde_json::Value`].
///
/// # Examples
///
/// ```
/// use cfn_extension_runtime::{OperationStatus, ProgressEvent};
/// use serde_json::json;
///
/// let done = ProgressEvent::success(json!({"Name": "bucket"}));
/// assert_eq!(done.status, OperationStatus::Success);
///
/// let mut context = serde_json::Map::new();
/// context.insert("attempt".to_string(), json!(1));
/// let waiting: ProgressEvent = ProgressEvent::in_progress(context, 30);
/// assert!(waiting.is_in_progress());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent<M = Value> {
    /// Current status of the operation
    pub status: OperationStatus,

    /// Error code, set only when the status is FAILED
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_code: Option<HandlerErrorCode>,

    /// Human readable message
    #[serde(default)]
    pub message: String,

    /// Free-form result string
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<String>,

    /// Continuation state carried to the next invocation
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub callback_context: Option<CallbackContext>,

    /// Requested delay before the next invocation; zero means none
    #[serde(skip_serializing_if = "is_zero", default)]
    pub callback_delay_seconds: u32,

    /// The resource the handler worked on
    #[serde(skip_serializing_if = "Option::is_none", default = "Option::default")]
    pub resource_model: Option<M>,

    /// Resources returned by a LIST handler
    #[serde(skip_serializing_if = "Option::is_none", default = "Option::default")]
    pub resource_models: Option<Vec<M>>,

    /// Pagination token returned by a LIST handler
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub next_token: Option<String>,
}

impl<M> ProgressEvent<M> {
    /// Creates an event with the given status and no other fields set.
    pub fn new(status: OperationStatus) -> Self {
        Self {
            status,
            error_code: None,
            message: String::new(),
            result: None,
            callback_context: None,
            callback_delay_seconds: 0,
            resource_model: None,
            resource_models: None,
            next_token: None,
        }
    }

    /// Creates a SUCCESS event carrying the resource model.
    pub fn success(model: M) -> Self {
        Self::new(OperationStatus::Success).with_resource_model(model)
    }

    /// Creates an IN_PROGRESS event asking to be called again after `delay_seconds`.
    pub fn in_progress(callback_context: CallbackContext, delay_seconds: u32) -> Self {
        Self::new(OperationStatus::InProgress)
            .with_callback_context(callback_context)
            .with_callback_delay_seconds(delay_seconds)
    }

    /// Creates a FAILED event.
    pub fn failed(error_code: HandlerErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code: Some(error_code),
            message: message.into(),
            ..Self::new(OperationStatus::Failed)
        }
    }

    /// Sets the resource model.
    pub fn with_resource_model(mut self, model: M) -> Self {
        self.resource_model = Some(model);
        self
    }

    /// Sets the list of resource models returned by a LIST handler.
    pub fn with_resource_models(mut self, models: Vec<M>) -> Self {
        self.resource_models = Some(models);
        self
    }

    /// Sets the message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Sets the callback context.
    pub fn with_callback_context(mut self, callback_context: CallbackContext) -> Self {
        self.callback_context = Some(callback_context);
        self
    }

    /// Sets the callback delay.
    pub fn with_callback_delay_seconds(mut self, delay_seconds: u32) -> Self {
        self.callback_delay_seconds = delay_seconds;
        self
    }

    /// Sets the pagination token.
    pub fn with_next_token(mut self, next_token: impl Into<String>) -> Self {
        self.next_token = Some(next_token.into());
        self
    }

    /// Sets the free-form result string.
    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    /// Returns true if the handler wants to be called again.
    pub fn is_in_progress(&self) -> bool {
        self.status == OperationStatus::InProgress
    }

    /// Returns true if the event ends the operation.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self.status,
            OperationStatus::InProgress | OperationStatus::Pending
        )
    }

    /// Converts the model type of this event.
    pub fn map_model<N>(self, mut f: impl FnMut(M) -> N) -> ProgressEvent<N> {
        ProgressEvent {
            status: self.status,
            error_code: self.error_code,
            message: self.message,
            result: self.result,
            callback_context: self.callback_context,
            callback_delay_seconds: self.callback_delay_seconds,
            resource_model: self.resource_model.map(&mut f),
            resource_models: self
                .resource_models
                .map(|models| models.into_iter().map(&mut f).collect()),
            next_token: self.next_token,
        }
    }
}

impl<M: Serialize> ProgressEvent<M> {
    /// Serializes the event into the response shape expected by the control plane.
    ///
    /// Null fields are dropped, including null properties inside the
    /// resource models, and `bearerToken` is echoed when given.
    pub fn to_wire(&self, bearer_token: Option<&str>) -> ExtensionResult<Value> {
        let mut wire = serde_json::to_value(self)?;
        if let Value::Object(fields) = &mut wire {
            if let Some(model) = fields.get_mut("resourceModel") {
                strip_nulls(model);
            }
            if let Some(Value::Array(models)) = fields.get_mut("resourceModels") {
                models.iter_mut().for_each(strip_nulls);
            }
            if let Some(token) = bearer_token {
                fields.insert("bearerToken".to_string(), Value::String(token.to_string()));
            }
        }
        Ok(wire)
    }
}

/// The response shape returned to CloudFormation for a Hook invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookProgressEvent {
    pub hook_status: HookStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_code: Option<HandlerErrorCode>,
    #[serde(default)]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub callback_context: Option<CallbackContext>,
    #[serde(skip_serializing_if = "is_zero", default)]
    pub callback_delay_seconds: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client_request_token: Option<String>,
}

impl HookProgressEvent {
    /// Builds the Hook response from a handler's progress event.
    pub fn from_progress<M>(progress: ProgressEvent<M>, client_request_token: Option<String>) -> Self {
        Self {
            hook_status: progress.status.into(),
            error_code: progress.error_code,
            message: progress.message,
            callback_context: progress.callback_context,
            callback_delay_seconds: progress.callback_delay_seconds,
            result: progress.result,
            client_request_token,
        }
    }

    /// Creates a FAILED Hook response.
    pub fn failed(error_code: HandlerErrorCode, message: impl Into<String>) -> Self {
        Self::from_progress(ProgressEvent::<Value>::failed(error_code, message), None)
    }

    /// Serializes the response, dropping null fields.
    pub fn to_wire(&self) -> ExtensionResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_wire_names() {
        assert_eq!(serde_json::to_value(Action::Create).unwrap(), json!("CREATE"));
        assert_eq!("LIST".parse::<Action>().unwrap(), Action::List);
        assert!("create".parse::<Action>().is_err());
        assert!(Action::Delete.is_mutating());
        assert!(!Action::Read.is_mutating());
    }

    #[test]
    fn test_invocation_point_wire_names() {
        let point: HookInvocationPoint = serde_json::from_value(json!("UPDATE_PRE_PROVISION")).unwrap();
        assert_eq!(point, HookInvocationPoint::UpdatePreProvision);
        assert_eq!(point.to_string(), "UPDATE_PRE_PROVISION");
    }

    #[test]
    fn test_error_code_serializes_to_name() {
        assert_eq!(
            serde_json::to_value(HandlerErrorCode::ServiceLimitExceeded).unwrap(),
            json!("ServiceLimitExceeded")
        );
        assert_eq!(HandlerErrorCode::NonCompliant.to_string(), "NonCompliant");
    }

    #[test]
    fn test_failed_event_wire_shape() {
        let event: ProgressEvent = ProgressEvent::failed(HandlerErrorCode::NotFound, "gone");
        let wire = event.to_wire(None).unwrap();
        assert_eq!(
            wire,
            json!({"status": "FAILED", "errorCode": "NotFound", "message": "gone"})
        );
    }

    #[test]
    fn test_zero_delay_is_dropped() {
        let event: ProgressEvent = ProgressEvent::in_progress(CallbackContext::new(), 0);
        let wire = event.to_wire(None).unwrap();
        assert!(wire.get("callbackDelaySeconds").is_none());
        assert_eq!(wire["callbackContext"], json!({}));

        let delayed: ProgressEvent = ProgressEvent::in_progress(CallbackContext::new(), 5);
        assert_eq!(delayed.to_wire(None).unwrap()["callbackDelaySeconds"], json!(5));
    }

    #[test]
    fn test_model_nulls_are_stripped_and_token_echoed() {
        let event = ProgressEvent::success(json!({"Name": "a", "Arn": null, "Nested": {"X": null}}));
        let wire = event.to_wire(Some("token")).unwrap();
        assert_eq!(wire["resourceModel"], json!({"Name": "a", "Nested": {}}));
        assert_eq!(wire["bearerToken"], json!("token"));
        assert!(wire.get("errorCode").is_none());
    }

    #[test]
    fn test_list_models_are_stripped() {
        let event = ProgressEvent::new(OperationStatus::Success)
            .with_resource_models(vec![json!({"Id": "1", "Tag": null}), json!({"Id": "2"})])
            .with_next_token("next");
        let wire = event.to_wire(None).unwrap();
        assert_eq!(wire["resourceModels"], json!([{"Id": "1"}, {"Id": "2"}]));
        assert_eq!(wire["nextToken"], json!("next"));
    }

    #[test]
    fn test_hook_progress_event_from_progress() {
        let mut context = CallbackContext::new();
        context.insert("step".to_string(), json!(2));
        let progress: ProgressEvent = ProgressEvent::in_progress(context.clone(), 10).with_message("waiting");
        let hook = HookProgressEvent::from_progress(progress, Some("crt".to_string()));
        assert_eq!(hook.hook_status, HookStatus::InProgress);
        let wire = hook.to_wire().unwrap();
        assert_eq!(
            wire,
            json!({
                "hookStatus": "IN_PROGRESS",
                "message": "waiting",
                "callbackContext": {"step": 2},
                "callbackDelaySeconds": 10,
                "clientRequestToken": "crt"
            })
        );
    }

    #[test]
    fn test_skip_stack_hook_status_is_preserved() {
        let progress: ProgressEvent = ProgressEvent::new(OperationStatus::ChangeSetSuccessSkipStackHook);
        let hook = HookProgressEvent::from_progress(progress, None);
        assert_eq!(
            hook.to_wire().unwrap()["hookStatus"],
            json!("CHANGE_SET_SUCCESS_SKIP_STACK_HOOK")
        );
    }

    #[test]
    fn test_map_model() {
        let event = ProgressEvent::success(3).map_model(|n: i32| n.to_string());
        assert_eq!(event.resource_model.as_deref(), Some("3"));
    }
}
