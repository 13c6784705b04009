//! Request types.
//!
//! The wire types mirror the JSON events CloudFormation sends to the
//! function. They are deliberately lenient: unknown fields are ignored and
//! malformed credential sets become `None` instead of failing the request.
//! The typed requests are what handler code receives after recasting.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::cipher::{deserialize_optional_credentials, Credentials};
use crate::client::PayloadFetcher;
use crate::error::{ExtensionError, ExtensionResult};
use crate::interface::{Action, CallbackContext, HookInvocationPoint};
use crate::model::Model;

/// Tags keyed by tag name.
pub type Tags = HashMap<String, String>;

/// Returns the AWS partition of a region.
///
/// # Examples
///
/// ```
/// use cfn_extension_runtime::request::partition_for;
///
/// assert_eq!(partition_for("cn-north-1"), "aws-cn");
/// assert_eq!(partition_for("us-gov-west-1"), "aws-gov");
/// assert_eq!(partition_for("eu-west-1"), "aws");
/// ```
pub fn partition_for(region: &str) -> &'static str {
    if region.starts_with("cn") {
        "aws-cn"
    } else if region.starts_with("us-gov") {
        "aws-gov"
    } else {
        "aws"
    }
}

// ============================================================================
// Resource wire types
// ============================================================================

/// A resource invocation event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerRequest {
    pub action: Action,
    pub aws_account_id: String,
    pub bearer_token: String,
    pub region: String,
    pub request_data: RequestData,
    #[serde(default)]
    pub response_endpoint: Option<String>,
    #[serde(default)]
    pub stack_id: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub resource_type_version: Option<String>,
    #[serde(default, deserialize_with = "deserialize_or_default")]
    pub request_context: RequestContext,
    #[serde(default)]
    pub next_token: Option<String>,
}

impl HandlerRequest {
    /// Parses a raw resource event.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidRequest` error naming what was wrong with the event.
    pub fn from_event(event: &Value) -> ExtensionResult<Self> {
        Self::deserialize(event).map_err(|e| ExtensionError::invalid_request(e.to_string()))
    }

    /// Returns the request before its models are typed.
    pub fn to_unmodelled(&self) -> UnmodelledRequest {
        let data = &self.request_data;
        UnmodelledRequest {
            client_request_token: self.bearer_token.clone(),
            desired_resource_state: data.resource_properties.clone(),
            previous_resource_state: data.previous_resource_properties.clone(),
            desired_resource_tags: data.stack_tags.clone(),
            previous_resource_tags: data.previous_stack_tags.clone(),
            system_tags: data.system_tags.clone(),
            previous_system_tags: data.previous_system_tags.clone(),
            type_configuration: data.type_configuration.clone(),
            aws_account_id: Some(self.aws_account_id.clone()),
            logical_resource_identifier: data.logical_resource_id.clone(),
            next_token: self.next_token.clone(),
            stack_id: self.stack_id.clone(),
            region: Some(self.region.clone()),
        }
    }
}

/// The `requestData` block of a resource event.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestData {
    #[serde(default, deserialize_with = "deserialize_optional_credentials")]
    pub caller_credentials: Option<Credentials>,
    #[serde(default, deserialize_with = "deserialize_optional_credentials")]
    pub provider_credentials: Option<Credentials>,
    #[serde(default, deserialize_with = "deserialize_optional_credentials")]
    pub platform_credentials: Option<Credentials>,
    #[serde(default)]
    pub provider_log_group_name: Option<String>,
    #[serde(default)]
    pub logical_resource_id: Option<String>,
    #[serde(default)]
    pub resource_properties: Option<Value>,
    #[serde(default)]
    pub previous_resource_properties: Option<Value>,
    #[serde(default)]
    pub system_tags: Option<Tags>,
    #[serde(default)]
    pub previous_system_tags: Option<Tags>,
    #[serde(default)]
    pub stack_tags: Option<Tags>,
    #[serde(default)]
    pub previous_stack_tags: Option<Tags>,
    #[serde(default)]
    pub type_configuration: Option<Value>,
}

/// Reinvocation bookkeeping carried between invocations.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    /// Number of continuations so far
    #[serde(default)]
    pub invocation: u32,
    #[serde(default)]
    pub callback_context: Option<CallbackContext>,
    #[serde(default)]
    pub cloud_watch_events_rule_name: Option<String>,
    #[serde(default)]
    pub cloud_watch_events_target_id: Option<String>,
    /// Remote reinvocations already spent on timed out write handlers
    #[serde(default)]
    pub timeout_retries: u32,
}

/// The simplified event accepted by the resource test entry point.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestEvent {
    pub credentials: Credentials,
    pub action: Action,
    pub request: UnmodelledRequest,
    #[serde(default)]
    pub callback_context: Option<CallbackContext>,
    #[serde(default)]
    pub region: Option<String>,
}

/// A resource request whose models are still raw JSON.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmodelledRequest {
    pub client_request_token: String,
    #[serde(default)]
    pub desired_resource_state: Option<Value>,
    #[serde(default)]
    pub previous_resource_state: Option<Value>,
    #[serde(default)]
    pub desired_resource_tags: Option<Tags>,
    #[serde(default)]
    pub previous_resource_tags: Option<Tags>,
    #[serde(default)]
    pub system_tags: Option<Tags>,
    #[serde(default)]
    pub previous_system_tags: Option<Tags>,
    #[serde(default)]
    pub type_configuration: Option<Value>,
    #[serde(default)]
    pub aws_account_id: Option<String>,
    #[serde(default)]
    pub logical_resource_identifier: Option<String>,
    #[serde(default)]
    pub next_token: Option<String>,
    #[serde(default)]
    pub stack_id: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

impl UnmodelledRequest {
    /// Recasts and deserializes the resource and type configuration models.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidRequest` error if either model does not match its
    /// schema.
    pub fn to_modelled<M: Model, T: Model>(self) -> ExtensionResult<ResourceHandlerRequest<M, T>> {
        Ok(ResourceHandlerRequest {
            desired_resource_state: M::from_raw(self.desired_resource_state.unwrap_or_default())?,
            previous_resource_state: M::from_raw(self.previous_resource_state.unwrap_or_default())?,
            type_configuration: T::from_raw(self.type_configuration.unwrap_or_default())?,
            aws_partition: self.region.as_deref().map(|r| partition_for(r).to_string()),
            client_request_token: self.client_request_token,
            desired_resource_tags: self.desired_resource_tags,
            previous_resource_tags: self.previous_resource_tags,
            system_tags: self.system_tags,
            previous_system_tags: self.previous_system_tags,
            aws_account_id: self.aws_account_id,
            logical_resource_identifier: self.logical_resource_identifier,
            next_token: self.next_token,
            stack_id: self.stack_id,
            region: self.region,
        })
    }
}

/// The request handed to resource handler code.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceHandlerRequest<M, T = Value> {
    pub client_request_token: String,
    pub desired_resource_state: Option<M>,
    pub previous_resource_state: Option<M>,
    pub desired_resource_tags: Option<Tags>,
    pub previous_resource_tags: Option<Tags>,
    pub system_tags: Option<Tags>,
    pub previous_system_tags: Option<Tags>,
    pub aws_account_id: Option<String>,
    pub logical_resource_identifier: Option<String>,
    pub type_configuration: Option<T>,
    pub next_token: Option<String>,
    pub stack_id: Option<String>,
    pub region: Option<String>,
    pub aws_partition: Option<String>,
}

// ============================================================================
// Hook wire types
// ============================================================================

/// A Hook invocation event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookInvocationRequest {
    pub aws_account_id: String,
    pub stack_id: String,
    #[serde(default)]
    pub change_set_id: Option<String>,
    pub hook_type_name: String,
    pub hook_type_version: String,
    #[serde(default)]
    pub hook_model: Option<Value>,
    pub action_invocation_point: HookInvocationPoint,
    pub request_data: HookRequestData,
    #[serde(default, deserialize_with = "deserialize_or_default")]
    pub request_context: HookRequestContext,
    pub client_request_token: String,
}

impl HookInvocationRequest {
    /// Parses a raw Hook event.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidRequest` error naming what was wrong with the event.
    pub fn from_event(event: &Value) -> ExtensionResult<Self> {
        Self::deserialize(event).map_err(|e| ExtensionError::invalid_request(e.to_string()))
    }

    /// Builds the request handed to Hook handler code.
    pub fn to_handler_request(&self) -> HookHandlerRequest {
        HookHandlerRequest {
            client_request_token: self.client_request_token.clone(),
            hook_context: HookContext {
                aws_account_id: Some(self.aws_account_id.clone()),
                stack_id: Some(self.stack_id.clone()),
                change_set_id: self.change_set_id.clone(),
                hook_type_name: Some(self.hook_type_name.clone()),
                hook_type_version: Some(self.hook_type_version.clone()),
                invocation_point: Some(self.action_invocation_point),
                target_name: Some(self.request_data.target_name.clone()),
                target_type: Some(self.request_data.target_type.clone()),
                target_logical_id: Some(self.request_data.target_logical_id.clone()),
                target_model: self.request_data.target_model.clone(),
            },
        }
    }
}

/// The `requestData` block of a Hook event.
///
/// Credentials arrive as strings, possibly KMS-encrypted; they are
/// decrypted by a [`Cipher`](crate::cipher::Cipher).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookRequestData {
    pub target_name: String,
    pub target_type: String,
    pub target_logical_id: String,
    #[serde(default)]
    pub target_model: Option<Value>,
    /// URL of a target model too large to send inline
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default, deserialize_with = "deserialize_credential_blob")]
    pub caller_credentials: Option<String>,
    #[serde(default, deserialize_with = "deserialize_credential_blob")]
    pub provider_credentials: Option<String>,
    #[serde(default)]
    pub provider_log_group_name: Option<String>,
    #[serde(default)]
    pub hook_encryption_key_arn: Option<String>,
    #[serde(default)]
    pub hook_encryption_key_role: Option<String>,
}

impl HookRequestData {
    /// Returns true if the target model must be downloaded from `payload`.
    pub fn is_payload_remote(&self) -> bool {
        let has_model = match &self.target_model {
            None | Some(Value::Null) => false,
            Some(Value::Object(fields)) => !fields.is_empty(),
            Some(_) => true,
        };
        !has_model && self.payload.as_deref().is_some_and(|url| !url.is_empty())
    }

    /// Downloads the target model when it was sent by reference.
    ///
    /// The model is replaced only when the download succeeds with HTTP 200.
    pub async fn resolve_remote_payload(&mut self, fetcher: &dyn PayloadFetcher) -> ExtensionResult<()> {
        if !self.is_payload_remote() {
            return Ok(());
        }
        let Some(url) = self.payload.as_deref() else {
            return Ok(());
        };
        if let Some(model) = fetcher.fetch(url).await? {
            self.target_model = Some(model);
        }
        Ok(())
    }
}

/// Reinvocation bookkeeping of a Hook event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookRequestContext {
    #[serde(default = "first_invocation")]
    pub invocation: u32,
    #[serde(default)]
    pub callback_context: Option<CallbackContext>,
}

impl Default for HookRequestContext {
    fn default() -> Self {
        Self {
            invocation: first_invocation(),
            callback_context: None,
        }
    }
}

fn first_invocation() -> u32 {
    1
}

/// The simplified event accepted by the Hook test entry point.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookTestEvent {
    pub credentials: Credentials,
    pub action_invocation_point: HookInvocationPoint,
    pub request: Value,
    #[serde(default)]
    pub callback_context: Option<CallbackContext>,
    #[serde(default)]
    pub type_configuration: Option<Value>,
    #[serde(default)]
    pub region: Option<String>,
}

impl HookTestEvent {
    /// Builds the handler request from the `request` block.
    ///
    /// Fields nested under `hookContext` are merged with the top level.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidRequest` error if the block is not an object or
    /// has no `clientRequestToken`.
    pub fn to_handler_request(&self) -> ExtensionResult<HookHandlerRequest> {
        let Value::Object(request) = &self.request else {
            return Err(ExtensionError::invalid_request("request must be an object"));
        };
        let mut merged: Map<String, Value> = request.clone();
        if let Some(Value::Object(context)) = request.get("hookContext") {
            merged.extend(context.clone());
        }

        let client_request_token = merged
            .get("clientRequestToken")
            .and_then(Value::as_str)
            .ok_or_else(|| ExtensionError::invalid_request("missing field `clientRequestToken`"))?
            .to_string();
        let hook_context = HookContext::deserialize(Value::Object(merged))
            .map_err(|e| ExtensionError::invalid_request(e.to_string()))?;
        Ok(HookHandlerRequest {
            client_request_token,
            hook_context,
        })
    }
}

/// The request handed to Hook handler code.
#[derive(Debug, Clone, PartialEq)]
pub struct HookHandlerRequest {
    pub client_request_token: String,
    pub hook_context: HookContext,
}

/// What a Hook is being asked to evaluate.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookContext {
    #[serde(default)]
    pub aws_account_id: Option<String>,
    #[serde(default)]
    pub stack_id: Option<String>,
    #[serde(default)]
    pub change_set_id: Option<String>,
    #[serde(default)]
    pub hook_type_name: Option<String>,
    #[serde(default)]
    pub hook_type_version: Option<String>,
    #[serde(default)]
    pub invocation_point: Option<HookInvocationPoint>,
    #[serde(default)]
    pub target_name: Option<String>,
    #[serde(default)]
    pub target_type: Option<String>,
    #[serde(default)]
    pub target_logical_id: Option<String>,
    #[serde(default)]
    pub target_model: Option<Value>,
}

fn deserialize_or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Accepts a credential bundle sent either as a string or as an object.
fn deserialize_credential_blob<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(text)) if !text.is_empty() => Some(text),
        Some(value @ Value::Object(_)) => Some(value.to_string()),
        _ => None,
    })
}
