//! Integration tests for the Hook entry point.
//!
//! These tests drive [`Hook::handle`] with complete Hook events, including
//! KMS-encrypted credentials and target models sent by reference.

mod common;

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use cfn_extension_runtime::{
    CallbackContext, ExtensionError, HandlerErrorCode, HookHandlerRequest, HookInvocationPoint, OperationStatus,
    ProgressEvent, SessionProxy,
};
use cfn_extension_runtime::client::Dimension;
use cfn_extension_runtime::interface::MetricTypes;
use cfn_extension_runtime_testing::fixtures::{HOOK_TOKEN, HOOK_TYPE, KEY_ARN, KEY_ROLE, STACK_ID};
use cfn_extension_runtime_testing::{
    credentials, invocation_context, HookEventBuilder, LogsCall, MockKeyDecryptor, MockPayloadFetcher,
    MockServiceClients,
};
use serde_json::{json, Value};

use common::*;

fn encode(blob: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(blob)
}

async fn allow(
    _session: Option<SessionProxy>,
    _request: HookHandlerRequest,
    _context: CallbackContext,
    _configuration: Option<GuardConfiguration>,
) -> Result<ProgressEvent<Value>, ExtensionError> {
    Ok(ProgressEvent::new(OperationStatus::Success))
}

// =============================================================================
// Basic request flow
// =============================================================================

#[tokio::test]
async fn test_hook_success_wire_form() {
    let clients = Arc::new(MockServiceClients::new());
    let hook = hook(&clients).handler(
        HookInvocationPoint::CreatePreProvision,
        |session: Option<SessionProxy>,
         request: HookHandlerRequest,
         _c: CallbackContext,
         configuration: Option<GuardConfiguration>| async move {
            let session = session.ok_or_else(|| ExtensionError::access_denied("no session"))?;
            assert_eq!(session.credentials().access_key_id, "callerAccessKey");
            assert_eq!(session.region(), Some("us-east-1"));

            let context = request.hook_context;
            assert_eq!(context.invocation_point, Some(HookInvocationPoint::CreatePreProvision));
            assert_eq!(context.target_name.as_deref(), Some("AWS::S3::Bucket"));
            assert_eq!(context.target_logical_id.as_deref(), Some("MyBucket"));
            assert_eq!(
                context.target_model,
                Some(json!({"resourceProperties": {"BucketName": "logs"}}))
            );

            let configuration = configuration.unwrap_or_default();
            assert_eq!(configuration.max_buckets, Some(3));
            assert_eq!(configuration.enforce_encryption, Some(true));
            Ok::<_, ExtensionError>(ProgressEvent::<Value>::new(OperationStatus::Success).with_message("compliant"))
        },
    );

    let event = HookEventBuilder::new(HookInvocationPoint::CreatePreProvision)
        .with_hook_model(json!({"maxBuckets": "3", "enforceEncryption": "true"}))
        .build();
    let response = hook.handle(event, &context()).await;

    assert_eq!(
        response,
        json!({
            "hookStatus": "SUCCESS",
            "message": "compliant",
            "clientRequestToken": HOOK_TOKEN,
        })
    );
    let calls = clients.metrics.calls();
    assert!(!calls.is_empty());
    assert!(calls
        .iter()
        .all(|call| call.namespace == "AWS/CloudFormation/123456789012/Example/Guard/Hook"));
}

#[tokio::test]
async fn test_hook_non_compliant() {
    let clients = Arc::new(MockServiceClients::new());
    let hook = hook(&clients).handler(
        HookInvocationPoint::UpdatePreProvision,
        |_s: Option<SessionProxy>, _r: HookHandlerRequest, _c: CallbackContext, _t: Option<GuardConfiguration>| async move {
            Err::<ProgressEvent<Value>, _>(ExtensionError::non_compliant("bucket is not encrypted"))
        },
    );

    let response = hook
        .handle(HookEventBuilder::new(HookInvocationPoint::UpdatePreProvision).build(), &context())
        .await;

    assert_eq!(response["hookStatus"], "FAILED");
    assert_eq!(response["errorCode"], "NonCompliant");
    assert_eq!(response["message"], "bucket is not encrypted");
    assert_eq!(response["clientRequestToken"], HOOK_TOKEN);
}

#[tokio::test]
async fn test_skip_stack_hook_status_is_kept() {
    let clients = Arc::new(MockServiceClients::new());
    let hook = hook(&clients).handler(
        HookInvocationPoint::CreatePreProvision,
        |_s: Option<SessionProxy>, _r: HookHandlerRequest, _c: CallbackContext, _t: Option<GuardConfiguration>| async move {
            Ok::<_, ExtensionError>(ProgressEvent::<Value>::new(OperationStatus::ChangeSetSuccessSkipStackHook))
        },
    );

    let response = hook
        .handle(HookEventBuilder::new(HookInvocationPoint::CreatePreProvision).build(), &context())
        .await;

    assert_eq!(response["hookStatus"], "CHANGE_SET_SUCCESS_SKIP_STACK_HOOK");
}

#[tokio::test]
async fn test_unregistered_invocation_point() {
    let clients = Arc::new(MockServiceClients::new());
    let hook = hook(&clients).handler(HookInvocationPoint::CreatePreProvision, allow);

    let response = hook
        .handle(HookEventBuilder::new(HookInvocationPoint::DeletePreProvision).build(), &context())
        .await;

    assert_eq!(response["hookStatus"], "FAILED");
    assert_eq!(response["errorCode"], "InternalFailure");
    assert_eq!(response["message"], "No handler for DELETE_PRE_PROVISION");
    assert_eq!(response["clientRequestToken"], HOOK_TOKEN);
}

#[tokio::test]
async fn test_malformed_event_keeps_client_request_token() {
    let clients = Arc::new(MockServiceClients::new());
    let hook = hook(&clients).handler(HookInvocationPoint::CreatePreProvision, allow);

    let event = HookEventBuilder::new(HookInvocationPoint::CreatePreProvision)
        .without("requestData")
        .build();
    let response = hook.handle(event, &context()).await;

    assert_eq!(response["hookStatus"], "FAILED");
    assert_eq!(response["errorCode"], "InvalidRequest");
    assert_eq!(response["clientRequestToken"], HOOK_TOKEN);
}

// =============================================================================
// Credentials
// =============================================================================

#[tokio::test]
async fn test_kms_encrypted_credentials_are_decrypted() {
    let decryptor = MockKeyDecryptor::new()
        .with_plaintext(b"caller-blob".to_vec(), credentials("caller").to_string().into_bytes())
        .with_plaintext(b"provider-blob".to_vec(), credentials("provider").to_string().into_bytes());
    let clients = Arc::new(MockServiceClients::new().with_key_decryptor(decryptor));
    let hook = hook(&clients).handler(
        HookInvocationPoint::CreatePreProvision,
        |session: Option<SessionProxy>, _r: HookHandlerRequest, _c: CallbackContext, _t: Option<GuardConfiguration>| async move {
            let session = session.ok_or_else(|| ExtensionError::access_denied("no session"))?;
            assert_eq!(session.credentials().secret_access_key, "callerSecretKey");
            Ok::<_, ExtensionError>(ProgressEvent::<Value>::new(OperationStatus::Success))
        },
    );

    let event = HookEventBuilder::new(HookInvocationPoint::CreatePreProvision)
        .with_encrypted_credentials(&encode(b"caller-blob"), &encode(b"provider-blob"))
        .build();
    let response = hook.handle(event, &context()).await;

    assert_eq!(response["hookStatus"], "SUCCESS");
    assert_eq!(
        clients.decryptor_requests(),
        vec![(KEY_ARN.to_string(), KEY_ROLE.to_string())]
    );
    let decrypted: Vec<Vec<u8>> = clients
        .key_decryptor
        .calls()
        .into_iter()
        .map(|(key_id, ciphertext)| {
            assert_eq!(key_id, KEY_ARN);
            ciphertext
        })
        .collect();
    assert_eq!(decrypted, vec![b"caller-blob".to_vec(), b"provider-blob".to_vec()]);
    assert!(!clients.metrics.calls().is_empty());
}

#[tokio::test]
async fn test_undecryptable_credentials_are_access_denied() {
    let clients = Arc::new(MockServiceClients::new());
    let hook = hook(&clients).handler(HookInvocationPoint::CreatePreProvision, allow);

    let event = HookEventBuilder::new(HookInvocationPoint::CreatePreProvision)
        .with_encrypted_credentials(&encode(b"unknown"), &encode(b"unknown"))
        .build();
    let response = hook.handle(event, &context()).await;

    assert_eq!(response["hookStatus"], "FAILED");
    assert_eq!(response["errorCode"], "AccessDenied");
}

#[tokio::test]
async fn test_no_provider_credentials_publishes_nothing() {
    let clients = Arc::new(MockServiceClients::new());
    let hook = hook(&clients).handler(HookInvocationPoint::CreatePreProvision, allow);

    let event = HookEventBuilder::new(HookInvocationPoint::CreatePreProvision)
        .without_provider_credentials()
        .build();
    let response = hook.handle(event, &context()).await;

    assert_eq!(response["hookStatus"], "SUCCESS");
    assert!(clients.metrics.calls().is_empty());
    assert!(!hook.log_delivery().is_attached());
}

// =============================================================================
// Remote payloads
// =============================================================================

#[tokio::test]
async fn test_remote_payload_is_downloaded() {
    let url = "https://payloads.s3.amazonaws.com/hook/target.json";
    let fetcher = MockPayloadFetcher::new()
        .with_document(url, json!({"resourceProperties": {"BucketName": "remote"}}));
    let clients = Arc::new(MockServiceClients::new().with_payload_fetcher(fetcher));
    let hook = hook(&clients).handler(
        HookInvocationPoint::CreatePreProvision,
        |_s: Option<SessionProxy>, request: HookHandlerRequest, _c: CallbackContext, _t: Option<GuardConfiguration>| async move {
            assert_eq!(
                request.hook_context.target_model,
                Some(json!({"resourceProperties": {"BucketName": "remote"}}))
            );
            Ok::<_, ExtensionError>(ProgressEvent::<Value>::new(OperationStatus::Success))
        },
    );

    let event = HookEventBuilder::new(HookInvocationPoint::CreatePreProvision)
        .with_remote_payload(url)
        .build();
    let response = hook.handle(event, &context()).await;

    assert_eq!(response["hookStatus"], "SUCCESS");
    assert_eq!(clients.payload_fetcher.calls(), vec![url.to_string()]);
}

#[tokio::test]
async fn test_unreachable_payload_is_invalid_request() {
    let clients = Arc::new(MockServiceClients::new());
    let hook = hook(&clients).handler(HookInvocationPoint::CreatePreProvision, allow);

    let event = HookEventBuilder::new(HookInvocationPoint::CreatePreProvision)
        .with_remote_payload("https://payloads.s3.amazonaws.com/missing")
        .build();
    let response = hook.handle(event, &context()).await;

    assert_eq!(response["hookStatus"], "FAILED");
    assert_eq!(response["errorCode"], "InvalidRequest");
}

// =============================================================================
// Continuation
// =============================================================================

async fn evaluate_in_steps(
    _session: Option<SessionProxy>,
    _request: HookHandlerRequest,
    context: CallbackContext,
    _configuration: Option<GuardConfiguration>,
) -> Result<ProgressEvent<Value>, ExtensionError> {
    let next = attempt(&context) + 1;
    if next >= 3 {
        return Ok(ProgressEvent::new(OperationStatus::Success).with_message(format!("done after {}", next)));
    }
    Ok(ProgressEvent::in_progress(attempt_context(next), 2))
}

#[tokio::test(start_paused = true)]
async fn test_hook_continues_locally() {
    let clients = Arc::new(MockServiceClients::new());
    let hook = hook(&clients).handler(HookInvocationPoint::CreatePreProvision, evaluate_in_steps);

    let response = hook
        .handle(HookEventBuilder::new(HookInvocationPoint::CreatePreProvision).build(), &context())
        .await;

    assert_eq!(response["hookStatus"], "SUCCESS");
    assert_eq!(response["message"], "done after 3");
}

#[tokio::test(start_paused = true)]
async fn test_hook_returns_in_progress_when_out_of_time() {
    let clients = Arc::new(MockServiceClients::new());
    let hook = hook(&clients).handler(HookInvocationPoint::CreatePreProvision, evaluate_in_steps);

    let response = hook
        .handle(
            HookEventBuilder::new(HookInvocationPoint::CreatePreProvision).build(),
            &invocation_context(Duration::from_secs(30)),
        )
        .await;

    assert_eq!(response["hookStatus"], "IN_PROGRESS");
    assert_eq!(response["callbackContext"], json!({"attempt": 1}));
    assert_eq!(response["callbackDelaySeconds"], 2);
    assert!(clients.events.calls().is_empty());
}

#[tokio::test]
async fn test_hook_resumes_from_request_context() {
    let clients = Arc::new(MockServiceClients::new());
    let hook = hook(&clients).handler(HookInvocationPoint::CreatePreProvision, evaluate_in_steps);

    let event = HookEventBuilder::new(HookInvocationPoint::CreatePreProvision)
        .with_request_context(json!({"invocation": 3, "callbackContext": {"attempt": 2}}))
        .build();
    let response = hook.handle(event, &context()).await;

    assert_eq!(response["hookStatus"], "SUCCESS");
    assert_eq!(response["message"], "done after 3");
}

// =============================================================================
// Log delivery
// =============================================================================

#[tokio::test]
async fn test_hook_logs_go_to_request_stream() {
    let clients = Arc::new(MockServiceClients::new());
    let hook = hook(&clients).handler(HookInvocationPoint::CreatePreProvision, allow);

    hook.handle(HookEventBuilder::new(HookInvocationPoint::CreatePreProvision).build(), &context())
        .await;
    hook.log_delivery().enqueue("evaluating".to_string());
    hook.log_delivery().flush().await;

    let expected_stream = format!("{}/{}", STACK_ID, HOOK_TOKEN).replace(':', "__");
    let streams: Vec<String> = clients
        .logs
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            LogsCall::PutLogEvents { stream, .. } => Some(stream),
            _ => None,
        })
        .collect();
    assert_eq!(streams, vec![expected_stream]);
}

#[tokio::test]
async fn test_provider_session_drives_metrics_and_logs() {
    let clients = Arc::new(MockServiceClients::new());
    let hook = hook(&clients).handler(HookInvocationPoint::CreatePreProvision, allow);

    let response = hook
        .handle(HookEventBuilder::new(HookInvocationPoint::CreatePreProvision).build(), &context())
        .await;

    assert_eq!(response["hookStatus"], "SUCCESS");
    assert!(hook.log_delivery().is_attached());

    let sessions = clients.sessions();
    assert!(!sessions.is_empty());
    for session in &sessions {
        assert_eq!(session.credentials().access_key_id, "providerAccessKey");
        assert_eq!(session.region(), Some("us-east-1"));
    }

    let data = clients.metrics.data();
    let invocation = data
        .iter()
        .find(|datum| datum.metric_name == MetricTypes::HandlerInvocationCount)
        .expect("invocation metric published");
    assert_eq!(
        invocation.dimensions,
        vec![
            Dimension::new("DimensionKeyInvocationPointType", "CREATE_PRE_PROVISION"),
            Dimension::new("DimensionKeyHookType", HOOK_TYPE),
        ]
    );
}

// =============================================================================
// Test entry point
// =============================================================================

#[tokio::test]
async fn test_hook_test_entrypoint() {
    let clients = Arc::new(MockServiceClients::new());
    let hook = hook(&clients).handler(
        HookInvocationPoint::CreatePreProvision,
        |session: Option<SessionProxy>,
         request: HookHandlerRequest,
         _c: CallbackContext,
         configuration: Option<GuardConfiguration>| async move {
            assert!(session.is_some());
            assert_eq!(request.client_request_token, "token-1");
            assert_eq!(request.hook_context.target_name.as_deref(), Some("AWS::S3::Bucket"));
            assert_eq!(configuration.and_then(|c| c.max_buckets), Some(5));
            Ok::<_, ExtensionError>(ProgressEvent::<Value>::new(OperationStatus::Success))
        },
    );

    let event = json!({
        "credentials": credentials("test"),
        "actionInvocationPoint": "CREATE_PRE_PROVISION",
        "request": {
            "clientRequestToken": "token-1",
            "hookContext": {
                "targetName": "AWS::S3::Bucket",
                "targetModel": {"resourceProperties": {}},
            },
        },
        "typeConfiguration": {"maxBuckets": "5"},
    });
    let progress = hook.test_entrypoint(event, &context()).await;

    assert_eq!(progress.status, OperationStatus::Success);
    assert!(clients.metrics.calls().is_empty());
}

#[tokio::test]
async fn test_hook_test_entrypoint_malformed_event() {
    let clients = Arc::new(MockServiceClients::new());
    let hook = hook(&clients).handler(HookInvocationPoint::CreatePreProvision, allow);

    let progress = hook
        .test_entrypoint(json!({"actionInvocationPoint": "CREATE_PRE_PROVISION"}), &context())
        .await;

    assert_eq!(progress.status, OperationStatus::Failed);
    assert_eq!(progress.error_code, Some(HandlerErrorCode::InternalFailure));
}
