//! Mock AWS clients for driving the entry points without AWS.
//!
//! Every mock records the calls made to it and answers from a queue of
//! scripted responses, falling back to success when the queue is empty.
//!
//! # Examples
//!
//! ```
//! use cfn_extension_runtime::client::MetricsClient;
//! use cfn_extension_runtime::ExtensionError;
//! use cfn_extension_runtime_testing::MockMetricsClient;
//!
//! # tokio_test::block_on(async {
//! let client = MockMetricsClient::new()
//!     .with_response(Ok(()))
//!     .with_response(Err(ExtensionError::service("CloudWatch", "Throttling", "slow down", Some(400))));
//!
//! assert!(client.put_metric_data("AWS/CloudFormation/A/B", &[]).await.is_ok());
//! assert!(client.put_metric_data("AWS/CloudFormation/A/B", &[]).await.is_err());
//! assert!(client.put_metric_data("AWS/CloudFormation/A/B", &[]).await.is_ok());
//! assert_eq!(client.calls().len(), 3);
//! # });
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use cfn_extension_runtime::client::{
    EventTarget, EventsClient, InputLogEvent, KeyDecryptor, LogsClient, MetricDatum, MetricsClient,
    PayloadFetcher, ServiceClients,
};
use cfn_extension_runtime::{ExtensionError, ExtensionResult, SessionProxy};

/// Scripted responses, consumed front to back.
#[derive(Debug, Default)]
struct ResponseQueue {
    responses: Mutex<VecDeque<ExtensionResult<()>>>,
}

impl ResponseQueue {
    fn push(&self, response: ExtensionResult<()>) {
        self.responses
            .lock()
            .expect("response queue lock poisoned")
            .push_back(response);
    }

    fn next(&self) -> ExtensionResult<()> {
        self.responses
            .lock()
            .expect("response queue lock poisoned")
            .pop_front()
            .unwrap_or(Ok(()))
    }
}

fn record<T>(calls: &Mutex<Vec<T>>, call: T) {
    calls.lock().expect("call log lock poisoned").push(call);
}

fn snapshot<T: Clone>(calls: &Mutex<Vec<T>>) -> Vec<T> {
    calls.lock().expect("call log lock poisoned").clone()
}

// ============================================================================
// CloudWatch Events
// ============================================================================

/// A call made to [`MockEventsClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum EventsCall {
    PutRule {
        name: String,
        schedule_expression: String,
        state: String,
    },
    PutTargets {
        rule: String,
        targets: Vec<EventTarget>,
    },
    RemoveTargets {
        rule: String,
        ids: Vec<String>,
    },
    DeleteRule {
        name: String,
        force: bool,
    },
}

/// Mock CloudWatch Events client.
#[derive(Debug, Default)]
pub struct MockEventsClient {
    calls: Mutex<Vec<EventsCall>>,
    responses: ResponseQueue,
}

impl MockEventsClient {
    /// Creates a client that accepts every call.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the response of the next call.
    pub fn with_response(self, response: ExtensionResult<()>) -> Self {
        self.responses.push(response);
        self
    }

    /// Queues the response of the next call on a shared client.
    pub fn push_response(&self, response: ExtensionResult<()>) {
        self.responses.push(response);
    }

    /// All calls made so far.
    pub fn calls(&self) -> Vec<EventsCall> {
        snapshot(&self.calls)
    }

    /// Rules created so far, with their schedule expressions.
    pub fn scheduled_rules(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EventsCall::PutRule {
                    name,
                    schedule_expression,
                    ..
                } => Some((name, schedule_expression)),
                _ => None,
            })
            .collect()
    }

    /// Targets attached so far.
    pub fn targets(&self) -> Vec<EventTarget> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EventsCall::PutTargets { targets, .. } => Some(targets),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Names of the rules deleted so far.
    pub fn deleted_rules(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EventsCall::DeleteRule { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventsClient for MockEventsClient {
    async fn put_rule(&self, name: &str, schedule_expression: &str, state: &str) -> ExtensionResult<()> {
        record(
            &self.calls,
            EventsCall::PutRule {
                name: name.to_string(),
                schedule_expression: schedule_expression.to_string(),
                state: state.to_string(),
            },
        );
        self.responses.next()
    }

    async fn put_targets(&self, rule: &str, targets: &[EventTarget]) -> ExtensionResult<()> {
        record(
            &self.calls,
            EventsCall::PutTargets {
                rule: rule.to_string(),
                targets: targets.to_vec(),
            },
        );
        self.responses.next()
    }

    async fn remove_targets(&self, rule: &str, ids: &[String]) -> ExtensionResult<()> {
        record(
            &self.calls,
            EventsCall::RemoveTargets {
                rule: rule.to_string(),
                ids: ids.to_vec(),
            },
        );
        self.responses.next()
    }

    async fn delete_rule(&self, name: &str, force: bool) -> ExtensionResult<()> {
        record(
            &self.calls,
            EventsCall::DeleteRule {
                name: name.to_string(),
                force,
            },
        );
        self.responses.next()
    }
}

// ============================================================================
// CloudWatch Logs
// ============================================================================

/// A call made to [`MockLogsClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum LogsCall {
    CreateLogGroup {
        group: String,
    },
    CreateLogStream {
        group: String,
        stream: String,
    },
    PutLogEvents {
        group: String,
        stream: String,
        events: Vec<InputLogEvent>,
        sequence_token: Option<String>,
    },
}

/// Mock CloudWatch Logs client.
#[derive(Debug, Default)]
pub struct MockLogsClient {
    calls: Mutex<Vec<LogsCall>>,
    responses: ResponseQueue,
}

impl MockLogsClient {
    /// Creates a client that accepts every call.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the response of the next call.
    pub fn with_response(self, response: ExtensionResult<()>) -> Self {
        self.responses.push(response);
        self
    }

    /// Queues the response of the next call on a shared client.
    pub fn push_response(&self, response: ExtensionResult<()>) {
        self.responses.push(response);
    }

    /// All calls made so far.
    pub fn calls(&self) -> Vec<LogsCall> {
        snapshot(&self.calls)
    }

    /// Every message delivered so far, in order.
    pub fn messages(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                LogsCall::PutLogEvents { events, .. } => Some(events),
                _ => None,
            })
            .flatten()
            .map(|event| event.message)
            .collect()
    }

    /// Streams created so far, as `(group, stream)` pairs.
    pub fn streams(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                LogsCall::CreateLogStream { group, stream } => Some((group, stream)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl LogsClient for MockLogsClient {
    async fn create_log_group(&self, group: &str) -> ExtensionResult<()> {
        record(
            &self.calls,
            LogsCall::CreateLogGroup {
                group: group.to_string(),
            },
        );
        self.responses.next()
    }

    async fn create_log_stream(&self, group: &str, stream: &str) -> ExtensionResult<()> {
        record(
            &self.calls,
            LogsCall::CreateLogStream {
                group: group.to_string(),
                stream: stream.to_string(),
            },
        );
        self.responses.next()
    }

    async fn put_log_events(
        &self,
        group: &str,
        stream: &str,
        events: &[InputLogEvent],
        sequence_token: Option<&str>,
    ) -> ExtensionResult<Option<String>> {
        let call_number = self.calls().len();
        record(
            &self.calls,
            LogsCall::PutLogEvents {
                group: group.to_string(),
                stream: stream.to_string(),
                events: events.to_vec(),
                sequence_token: sequence_token.map(str::to_string),
            },
        );
        self.responses.next()?;
        Ok(Some(format!("sequence-{}", call_number)))
    }
}

// ============================================================================
// CloudWatch metrics
// ============================================================================

/// A `PutMetricData` call made to [`MockMetricsClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsCall {
    pub namespace: String,
    pub data: Vec<MetricDatum>,
}

/// Mock CloudWatch metrics client.
#[derive(Debug, Default)]
pub struct MockMetricsClient {
    calls: Mutex<Vec<MetricsCall>>,
    responses: ResponseQueue,
}

impl MockMetricsClient {
    /// Creates a client that accepts every call.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the response of the next call.
    pub fn with_response(self, response: ExtensionResult<()>) -> Self {
        self.responses.push(response);
        self
    }

    /// Queues the response of the next call on a shared client.
    pub fn push_response(&self, response: ExtensionResult<()>) {
        self.responses.push(response);
    }

    /// All calls made so far.
    pub fn calls(&self) -> Vec<MetricsCall> {
        snapshot(&self.calls)
    }

    /// Every data point published so far.
    pub fn data(&self) -> Vec<MetricDatum> {
        self.calls().into_iter().flat_map(|call| call.data).collect()
    }
}

#[async_trait]
impl MetricsClient for MockMetricsClient {
    async fn put_metric_data(&self, namespace: &str, data: &[MetricDatum]) -> ExtensionResult<()> {
        record(
            &self.calls,
            MetricsCall {
                namespace: namespace.to_string(),
                data: data.to_vec(),
            },
        );
        self.responses.next()
    }
}

// ============================================================================
// KMS
// ============================================================================

/// Mock KMS decryptor with a fixed ciphertext to plaintext table.
#[derive(Debug, Default)]
pub struct MockKeyDecryptor {
    plaintexts: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    calls: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MockKeyDecryptor {
    /// Creates a decryptor that knows no ciphertext.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `ciphertext` decrypt to `plaintext`.
    pub fn with_plaintext(self, ciphertext: impl Into<Vec<u8>>, plaintext: impl Into<Vec<u8>>) -> Self {
        self.plaintexts
            .lock()
            .expect("plaintext table lock poisoned")
            .insert(ciphertext.into(), plaintext.into());
        self
    }

    /// All `(key_id, ciphertext)` pairs decrypted so far.
    pub fn calls(&self) -> Vec<(String, Vec<u8>)> {
        snapshot(&self.calls)
    }
}

#[async_trait]
impl KeyDecryptor for MockKeyDecryptor {
    async fn decrypt(&self, key_id: &str, ciphertext: &[u8]) -> ExtensionResult<Vec<u8>> {
        record(&self.calls, (key_id.to_string(), ciphertext.to_vec()));
        self.plaintexts
            .lock()
            .expect("plaintext table lock poisoned")
            .get(ciphertext)
            .cloned()
            .ok_or_else(|| {
                ExtensionError::service(
                    "KMS",
                    "InvalidCiphertextException",
                    "ciphertext not recognised",
                    Some(400),
                )
            })
    }
}

// ============================================================================
// Remote payloads
// ============================================================================

/// Mock payload fetcher serving fixed documents.
#[derive(Debug, Default)]
pub struct MockPayloadFetcher {
    documents: Mutex<HashMap<String, Option<Value>>>,
    calls: Mutex<Vec<String>>,
}

impl MockPayloadFetcher {
    /// Creates a fetcher that serves nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `document` at `url`.
    pub fn with_document(self, url: impl Into<String>, document: Value) -> Self {
        self.documents
            .lock()
            .expect("document table lock poisoned")
            .insert(url.into(), Some(document));
        self
    }

    /// Answers `url` with a non-200 status.
    pub fn with_missing(self, url: impl Into<String>) -> Self {
        self.documents
            .lock()
            .expect("document table lock poisoned")
            .insert(url.into(), None);
        self
    }

    /// URLs fetched so far.
    pub fn calls(&self) -> Vec<String> {
        snapshot(&self.calls)
    }
}

#[async_trait]
impl PayloadFetcher for MockPayloadFetcher {
    async fn fetch(&self, url: &str) -> ExtensionResult<Option<Value>> {
        record(&self.calls, url.to_string());
        self.documents
            .lock()
            .expect("document table lock poisoned")
            .get(url)
            .cloned()
            .ok_or_else(|| ExtensionError::internal_failure(format!("connection refused: {}", url)))
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Client factory handing out the same mocks for every session.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use cfn_extension_runtime::Resource;
/// use cfn_extension_runtime_testing::MockServiceClients;
///
/// let clients = Arc::new(MockServiceClients::new());
/// let resource: Resource = Resource::new("Example::Test::Thing").with_service_clients(clients.clone());
/// assert!(clients.events.calls().is_empty());
/// ```
#[derive(Debug, Default)]
pub struct MockServiceClients {
    pub events: Arc<MockEventsClient>,
    pub logs: Arc<MockLogsClient>,
    pub metrics: Arc<MockMetricsClient>,
    pub key_decryptor: Arc<MockKeyDecryptor>,
    pub payload_fetcher: Arc<MockPayloadFetcher>,
    decryptor_requests: Mutex<Vec<(String, String)>>,
    sessions: Mutex<Vec<SessionProxy>>,
}

impl MockServiceClients {
    /// Creates a factory with fresh mocks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the events mock.
    pub fn with_events(mut self, events: MockEventsClient) -> Self {
        self.events = Arc::new(events);
        self
    }

    /// Replaces the logs mock.
    pub fn with_logs(mut self, logs: MockLogsClient) -> Self {
        self.logs = Arc::new(logs);
        self
    }

    /// Replaces the metrics mock.
    pub fn with_metrics(mut self, metrics: MockMetricsClient) -> Self {
        self.metrics = Arc::new(metrics);
        self
    }

    /// Replaces the KMS mock.
    pub fn with_key_decryptor(mut self, key_decryptor: MockKeyDecryptor) -> Self {
        self.key_decryptor = Arc::new(key_decryptor);
        self
    }

    /// Replaces the payload mock.
    pub fn with_payload_fetcher(mut self, payload_fetcher: MockPayloadFetcher) -> Self {
        self.payload_fetcher = Arc::new(payload_fetcher);
        self
    }

    /// `(key_arn, role_arn)` pairs a KMS client was requested for.
    pub fn decryptor_requests(&self) -> Vec<(String, String)> {
        snapshot(&self.decryptor_requests)
    }

    /// Sessions clients were built for, in order.
    pub fn sessions(&self) -> Vec<SessionProxy> {
        snapshot(&self.sessions)
    }
}

#[async_trait]
impl ServiceClients for MockServiceClients {
    fn events(&self, session: &SessionProxy) -> Arc<dyn EventsClient> {
        record(&self.sessions, session.clone());
        self.events.clone()
    }

    fn logs(&self, session: &SessionProxy) -> Arc<dyn LogsClient> {
        record(&self.sessions, session.clone());
        self.logs.clone()
    }

    fn metrics(&self, session: &SessionProxy) -> Arc<dyn MetricsClient> {
        record(&self.sessions, session.clone());
        self.metrics.clone()
    }

    async fn key_decryptor(&self, key_arn: &str, role_arn: &str) -> ExtensionResult<Arc<dyn KeyDecryptor>> {
        record(
            &self.decryptor_requests,
            (key_arn.to_string(), role_arn.to_string()),
        );
        Ok(self.key_decryptor.clone())
    }

    fn payload_fetcher(&self) -> Arc<dyn PayloadFetcher> {
        self.payload_fetcher.clone()
    }
}
