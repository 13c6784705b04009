//! Builders for invocation events as CloudFormation sends them.
//!
//! # Examples
//!
//! ```
//! use cfn_extension_runtime::Action;
//! use cfn_extension_runtime::request::HandlerRequest;
//! use cfn_extension_runtime_testing::ResourceEventBuilder;
//! use serde_json::json;
//!
//! let event = ResourceEventBuilder::new(Action::Update)
//!     .with_properties(json!({"Name": "new"}))
//!     .with_previous_properties(json!({"Name": "old"}))
//!     .build();
//! let request = HandlerRequest::from_event(&event).unwrap();
//! assert_eq!(request.action, Action::Update);
//! ```

use std::time::Duration;

use serde_json::{json, Value};

use cfn_extension_runtime::{Action, HookInvocationPoint, InvocationContext};

pub const ACCOUNT_ID: &str = "123456789012";
pub const REGION: &str = "us-east-1";
pub const STACK_ID: &str =
    "arn:aws:cloudformation:us-east-1:123456789012:stack/SampleStack/e722ae60-fe62-11e8-9a0e-0ae8cc519968";
pub const FUNCTION_ARN: &str = "arn:aws:lambda:us-east-1:123456789012:function:ProviderFunction";
pub const BEARER_TOKEN: &str = "ecba020e-b2e6-4742-a7d0-8a06ae7c4b2b";
pub const RESOURCE_TYPE: &str = "Example::Test::Resource";
pub const LOGICAL_RESOURCE_ID: &str = "MyResource";
pub const PROVIDER_LOG_GROUP: &str = "provider-logs";
pub const HOOK_TYPE: &str = "Example::Guard::Hook";
pub const HOOK_TOKEN: &str = "4b90a7e4-b790-456b-a937-0cfdfa211dfe";
pub const KEY_ARN: &str = "arn:aws:kms:us-east-1:123456789012:key/4b9a3d1e-7b57-4d4c-8e12-0b2c2a6f8f10";
pub const KEY_ROLE: &str = "arn:aws:iam::123456789012:role/HookDecryptRole";

/// A credential triple in wire form, distinguished by `tag`.
pub fn credentials(tag: &str) -> Value {
    json!({
        "accessKeyId": format!("{}AccessKey", tag),
        "secretAccessKey": format!("{}SecretKey", tag),
        "sessionToken": format!("{}SessionToken", tag),
    })
}

/// An invocation context with `remaining` time left.
pub fn invocation_context(remaining: Duration) -> InvocationContext {
    InvocationContext::new(FUNCTION_ARN, remaining)
}

fn set(target: &mut Value, key: &str, value: Value) {
    if let Value::Object(fields) = target {
        fields.insert(key.to_string(), value);
    }
}

fn remove(target: &mut Value, key: &str) {
    if let Value::Object(fields) = target {
        fields.remove(key);
    }
}

/// Builds resource invocation events.
#[derive(Debug, Clone)]
pub struct ResourceEventBuilder {
    event: Value,
}

impl ResourceEventBuilder {
    /// A complete event for `action` with all three credential sets.
    pub fn new(action: Action) -> Self {
        Self {
            event: json!({
                "awsAccountId": ACCOUNT_ID,
                "bearerToken": BEARER_TOKEN,
                "region": REGION,
                "action": action.as_str(),
                "responseEndpoint": "https://cloudformation.us-east-1.amazonaws.com",
                "resourceType": RESOURCE_TYPE,
                "resourceTypeVersion": "00000001",
                "stackId": STACK_ID,
                "requestData": {
                    "callerCredentials": credentials("caller"),
                    "providerCredentials": credentials("provider"),
                    "platformCredentials": credentials("platform"),
                    "providerLogGroupName": PROVIDER_LOG_GROUP,
                    "logicalResourceId": LOGICAL_RESOURCE_ID,
                    "resourceProperties": {},
                    "systemTags": {"aws:cloudformation:stack-name": "SampleStack"},
                    "stackTags": {"team": "storage"},
                },
                "requestContext": {},
            }),
        }
    }

    fn request_data(&mut self) -> &mut Value {
        if !self.event["requestData"].is_object() {
            self.event["requestData"] = json!({});
        }
        &mut self.event["requestData"]
    }

    /// Sets the desired resource properties.
    pub fn with_properties(mut self, properties: Value) -> Self {
        set(self.request_data(), "resourceProperties", properties);
        self
    }

    /// Sets the previous resource properties.
    pub fn with_previous_properties(mut self, properties: Value) -> Self {
        set(self.request_data(), "previousResourceProperties", properties);
        self
    }

    /// Sets the type configuration.
    pub fn with_type_configuration(mut self, configuration: Value) -> Self {
        set(self.request_data(), "typeConfiguration", configuration);
        self
    }

    /// Sets the request context.
    pub fn with_request_context(mut self, context: Value) -> Self {
        set(&mut self.event, "requestContext", context);
        self
    }

    /// Sets the pagination token of a LIST request.
    pub fn with_next_token(mut self, next_token: &str) -> Self {
        set(&mut self.event, "nextToken", json!(next_token));
        self
    }

    /// Drops the caller credentials.
    pub fn without_caller_credentials(mut self) -> Self {
        remove(self.request_data(), "callerCredentials");
        self
    }

    /// Drops the provider credentials, which disables metrics and log delivery.
    pub fn without_provider_credentials(mut self) -> Self {
        remove(self.request_data(), "providerCredentials");
        self
    }

    /// Drops the platform credentials, which disables external timers.
    pub fn without_platform_credentials(mut self) -> Self {
        remove(self.request_data(), "platformCredentials");
        self
    }

    /// Drops the provider log group.
    pub fn without_log_group(mut self) -> Self {
        remove(self.request_data(), "providerLogGroupName");
        self
    }

    /// Drops a top-level field.
    pub fn without(mut self, field: &str) -> Self {
        remove(&mut self.event, field);
        self
    }

    /// Returns the event.
    pub fn build(self) -> Value {
        self.event
    }
}

/// Builds Hook invocation events.
#[derive(Debug, Clone)]
pub struct HookEventBuilder {
    event: Value,
}

impl HookEventBuilder {
    /// A complete event for `invocation_point` with plaintext credentials.
    pub fn new(invocation_point: HookInvocationPoint) -> Self {
        Self {
            event: json!({
                "clientRequestToken": HOOK_TOKEN,
                "awsAccountId": ACCOUNT_ID,
                "stackId": STACK_ID,
                "changeSetId": "arn:aws:cloudformation:us-east-1:123456789012:changeSet/SampleChangeSet/1",
                "hookTypeName": HOOK_TYPE,
                "hookTypeVersion": "00000001",
                "hookModel": {},
                "actionInvocationPoint": invocation_point.as_str(),
                "requestData": {
                    "targetName": "AWS::S3::Bucket",
                    "targetType": "RESOURCE",
                    "targetLogicalId": "MyBucket",
                    "targetModel": {"resourceProperties": {"BucketName": "logs"}},
                    "callerCredentials": credentials("caller").to_string(),
                    "providerCredentials": credentials("provider").to_string(),
                    "providerLogGroupName": PROVIDER_LOG_GROUP,
                },
                "requestContext": {"invocation": 1, "callbackContext": null},
            }),
        }
    }

    fn request_data(&mut self) -> &mut Value {
        if !self.event["requestData"].is_object() {
            self.event["requestData"] = json!({});
        }
        &mut self.event["requestData"]
    }

    /// Sets the target model.
    pub fn with_target_model(mut self, model: Value) -> Self {
        set(self.request_data(), "targetModel", model);
        self
    }

    /// Sends the target model by reference instead of inline.
    pub fn with_remote_payload(mut self, url: &str) -> Self {
        let data = self.request_data();
        set(data, "targetModel", json!({}));
        set(data, "payload", json!(url));
        self
    }

    /// Replaces both credential strings with KMS ciphertext and configures
    /// the key used to decrypt them.
    pub fn with_encrypted_credentials(mut self, caller: &str, provider: &str) -> Self {
        let data = self.request_data();
        set(data, "callerCredentials", json!(caller));
        set(data, "providerCredentials", json!(provider));
        set(data, "hookEncryptionKeyArn", json!(KEY_ARN));
        set(data, "hookEncryptionKeyRole", json!(KEY_ROLE));
        self
    }

    /// Drops the provider credentials.
    pub fn without_provider_credentials(mut self) -> Self {
        remove(self.request_data(), "providerCredentials");
        self
    }

    /// Sets the Hook's type configuration.
    pub fn with_hook_model(mut self, model: Value) -> Self {
        set(&mut self.event, "hookModel", model);
        self
    }

    /// Sets the request context.
    pub fn with_request_context(mut self, context: Value) -> Self {
        set(&mut self.event, "requestContext", context);
        self
    }

    /// Drops a top-level field.
    pub fn without(mut self, field: &str) -> Self {
        remove(&mut self.event, field);
        self
    }

    /// Returns the event.
    pub fn build(self) -> Value {
        self.event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfn_extension_runtime::request::HookInvocationRequest;

    #[test]
    fn test_hook_event_parses() {
        let event = HookEventBuilder::new(HookInvocationPoint::UpdatePreProvision).build();
        let request = HookInvocationRequest::from_event(&event).unwrap();
        assert_eq!(request.action_invocation_point, HookInvocationPoint::UpdatePreProvision);
        assert_eq!(request.request_context.invocation, 1);
        assert!(!request.request_data.is_payload_remote());
    }

    #[test]
    fn test_remote_payload_event() {
        let event = HookEventBuilder::new(HookInvocationPoint::CreatePreProvision)
            .with_remote_payload("https://s3.amazonaws.com/payload")
            .build();
        let request = HookInvocationRequest::from_event(&event).unwrap();
        assert!(request.request_data.is_payload_remote());
    }

    #[test]
    fn test_without_removes_field() {
        let event = ResourceEventBuilder::new(Action::Create).without("requestData").build();
        assert!(event.get("requestData").is_none());
    }
}
