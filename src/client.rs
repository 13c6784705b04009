//! AWS service clients used by the runtime.
//!
//! The runtime talks to a handful of AWS APIs: CloudWatch Events for
//! reinvocation timers, CloudWatch Logs for provider log delivery,
//! CloudWatch for metrics and KMS for Hook credential decryption. Each is
//! reached through a small trait so entry points can be driven by mocks in
//! tests, with a SigV4-signed `reqwest` implementation for production use.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use aws_credential_types::provider::ProvideCredentials;
use aws_sigv4::http_request::{sign, SignableBody, SignableRequest, SigningSettings};
use aws_sigv4::sign::v4;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ExtensionError, ExtensionResult};
use crate::interface::{MetricTypes, StandardUnit};
use crate::session::SessionProxy;

/// Timeout for connecting to and reading a remote Hook payload.
pub const REMOTE_PAYLOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Retries made for a remote Hook payload after the first attempt.
pub const REMOTE_PAYLOAD_RETRY_LIMIT: u32 = 3;

/// HTTP statuses that make a remote payload fetch retry.
pub const REMOTE_PAYLOAD_RETRY_STATUSES: [u16; 4] = [500, 502, 503, 504];

/// A target attached to a CloudWatch Events rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventTarget {
    /// Target ID, unique within the rule
    pub id: String,
    /// ARN of the function to invoke
    pub arn: String,
    /// JSON input passed to the function
    pub input: String,
}

/// CloudWatch Events operations used by the reinvocation scheduler.
#[async_trait]
pub trait EventsClient: Send + Sync {
    /// Creates or updates a scheduled rule.
    async fn put_rule(&self, name: &str, schedule_expression: &str, state: &str) -> ExtensionResult<()>;

    /// Attaches targets to a rule.
    async fn put_targets(&self, rule: &str, targets: &[EventTarget]) -> ExtensionResult<()>;

    /// Detaches targets from a rule.
    async fn remove_targets(&self, rule: &str, ids: &[String]) -> ExtensionResult<()>;

    /// Deletes a rule.
    async fn delete_rule(&self, name: &str, force: bool) -> ExtensionResult<()>;
}

/// A single log line sent to CloudWatch Logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputLogEvent {
    /// Milliseconds since the epoch
    pub timestamp: i64,
    /// The log line
    pub message: String,
}

/// CloudWatch Logs operations used by provider log delivery.
#[async_trait]
pub trait LogsClient: Send + Sync {
    /// Creates a log group.
    async fn create_log_group(&self, group: &str) -> ExtensionResult<()>;

    /// Creates a log stream inside a group.
    async fn create_log_stream(&self, group: &str, stream: &str) -> ExtensionResult<()>;

    /// Uploads a batch of log events, returning the next sequence token.
    async fn put_log_events(
        &self,
        group: &str,
        stream: &str,
        events: &[InputLogEvent],
        sequence_token: Option<&str>,
    ) -> ExtensionResult<Option<String>>;
}

/// A metric dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimension {
    /// Dimension name
    pub name: String,
    /// Dimension value
    pub value: String,
}

impl Dimension {
    /// Creates a dimension.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A single metric data point.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDatum {
    /// Metric name
    pub metric_name: MetricTypes,
    /// Dimensions of the data point
    pub dimensions: Vec<Dimension>,
    /// Unit of `value`
    pub unit: StandardUnit,
    /// The measured value
    pub value: f64,
    /// When the measurement was taken
    pub timestamp: DateTime<Utc>,
}

/// CloudWatch metrics operations.
#[async_trait]
pub trait MetricsClient: Send + Sync {
    /// Publishes data points into a namespace.
    async fn put_metric_data(&self, namespace: &str, data: &[MetricDatum]) -> ExtensionResult<()>;
}

/// KMS decryption.
#[async_trait]
pub trait KeyDecryptor: Send + Sync {
    /// Decrypts `ciphertext` with the key identified by `key_id`.
    async fn decrypt(&self, key_id: &str, ciphertext: &[u8]) -> ExtensionResult<Vec<u8>>;
}

/// Fetches Hook target models that were too large to send inline.
#[async_trait]
pub trait PayloadFetcher: Send + Sync {
    /// Downloads the payload at `url`.
    ///
    /// Returns `Ok(None)` when the server answered with a non-200 status.
    async fn fetch(&self, url: &str) -> ExtensionResult<Option<Value>>;
}

/// Factory for the clients the entry points need.
///
/// Production code uses [`AwsServiceClients`]; tests substitute mocks.
#[async_trait]
pub trait ServiceClients: Send + Sync {
    /// CloudWatch Events client for the given session.
    fn events(&self, session: &SessionProxy) -> Arc<dyn EventsClient>;

    /// CloudWatch Logs client for the given session.
    fn logs(&self, session: &SessionProxy) -> Arc<dyn LogsClient>;

    /// CloudWatch metrics client for the given session.
    fn metrics(&self, session: &SessionProxy) -> Arc<dyn MetricsClient>;

    /// KMS client that assumes `role_arn` before decrypting with `key_arn`.
    async fn key_decryptor(&self, key_arn: &str, role_arn: &str) -> ExtensionResult<Arc<dyn KeyDecryptor>>;

    /// Remote payload fetcher.
    fn payload_fetcher(&self) -> Arc<dyn PayloadFetcher>;
}

/// Shared reference to a client factory.
pub type SharedServiceClients = Arc<dyn ServiceClients>;

/// Returns the default endpoint of an AWS service in a region.
pub fn service_endpoint(endpoint_prefix: &str, region: &str) -> String {
    if region.starts_with("cn-") {
        format!("https://{}.{}.amazonaws.com.cn", endpoint_prefix, region)
    } else {
        format!("https://{}.{}.amazonaws.com", endpoint_prefix, region)
    }
}

/// A minimal SigV4-signed client for the AWS JSON and query protocols.
pub struct SignedServiceClient {
    http_client: reqwest::Client,
    credentials_provider: Arc<dyn ProvideCredentials>,
    service: &'static str,
    region: String,
    endpoint_url: String,
}

impl SignedServiceClient {
    /// Creates a client for `service` in `region`.
    pub fn new(
        http_client: reqwest::Client,
        credentials_provider: Arc<dyn ProvideCredentials>,
        service: &'static str,
        region: impl Into<String>,
    ) -> Self {
        let region = region.into();
        Self {
            http_client,
            credentials_provider,
            service,
            endpoint_url: service_endpoint(service, &region),
            region,
        }
    }

    /// Sends requests to `endpoint_url` instead of the public endpoint.
    pub fn with_endpoint_url(mut self, endpoint_url: impl Into<String>) -> Self {
        self.endpoint_url = endpoint_url.into();
        self
    }

    /// Signs a request and returns the headers to attach to it.
    async fn sign_request(
        &self,
        method: &str,
        uri: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> ExtensionResult<Vec<(String, String)>> {
        let credentials = self
            .credentials_provider
            .provide_credentials()
            .await
            .map_err(|e| self.client_error(format!("Failed to get AWS credentials: {}", e)))?;

        let identity = credentials.into();
        let signing_settings = SigningSettings::default();
        let signing_params = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.region)
            .name(self.service)
            .time(SystemTime::now())
            .settings(signing_settings)
            .build()
            .map_err(|e| self.client_error(format!("Failed to build signing params: {}", e)))?;

        let signable_request = SignableRequest::new(
            method,
            uri,
            headers.iter().copied(),
            SignableBody::Bytes(body),
        )
        .map_err(|e| self.client_error(format!("Failed to create signable request: {}", e)))?;

        let (signing_instructions, _signature) = sign(signable_request, &signing_params.into())
            .map_err(|e| self.client_error(format!("Failed to sign request: {}", e)))?
            .into_parts();

        let mut temp_request = http::Request::builder()
            .method(method)
            .uri(uri)
            .body(())
            .map_err(|e| self.client_error(format!("Failed to build temp request: {}", e)))?;

        signing_instructions.apply_to_request_http1x(&mut temp_request);

        Ok(temp_request
            .headers()
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_str().unwrap_or("").to_string()))
            .collect())
    }

    async fn send(&self, headers: &[(&str, &str)], body: Vec<u8>) -> ExtensionResult<(u16, String)> {
        let uri = format!("{}/", self.endpoint_url.trim_end_matches('/'));
        let signed_headers = self.sign_request("POST", &uri, headers, &body).await?;

        let mut request = self.http_client.post(&uri).body(body);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        for (name, value) in signed_headers {
            request = request.header(&name, &value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ExtensionError::service(self.service, "NetworkError", format!("HTTP request failed: {}", e), None))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ExtensionError::service(self.service, "NetworkError", format!("Failed to read response body: {}", e), None))?;
        Ok((status, text))
    }

    /// Calls an AWS JSON 1.1 operation such as `AWSEvents.PutRule`.
    pub async fn call_json(&self, target: &str, body: &Value) -> ExtensionResult<Value> {
        let payload = serde_json::to_vec(body)?;
        let headers = [
            ("content-type", "application/x-amz-json-1.1"),
            ("x-amz-target", target),
        ];
        let (status, text) = self.send(&headers, payload).await?;

        if !(200..300).contains(&status) {
            return Err(self.json_error(status, &text));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    /// Calls an AWS query protocol operation with form parameters.
    pub async fn call_query(&self, params: &[(String, String)]) -> ExtensionResult<String> {
        let form = params
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let headers = [("content-type", "application/x-www-form-urlencoded; charset=utf-8")];
        let (status, text) = self.send(&headers, form.into_bytes()).await?;

        if !(200..300).contains(&status) {
            let error = QueryError::parse(&text);
            let code = error.code.as_deref().unwrap_or("UnknownError");
            let message = error.message.as_deref().unwrap_or(text.as_str());
            return Err(ExtensionError::service(self.service, code, message, Some(status)));
        }
        Ok(text)
    }

    fn json_error(&self, status: u16, text: &str) -> ExtensionError {
        let body: Value = serde_json::from_str(text).unwrap_or(Value::Null);
        let code = body
            .get("__type")
            .and_then(Value::as_str)
            .map(|t| t.rsplit('#').next().unwrap_or(t))
            .unwrap_or("UnknownError");
        let message = body
            .get("message")
            .or_else(|| body.get("Message"))
            .and_then(Value::as_str)
            .unwrap_or(text);
        ExtensionError::service(self.service, code, message, Some(status))
    }

    fn client_error(&self, message: String) -> ExtensionError {
        ExtensionError::service(self.service, "ClientError", message, None)
    }
}

/// `Code` and `Message` of a query protocol error body.
#[derive(Debug, Default, PartialEq)]
struct QueryError {
    code: Option<String>,
    message: Option<String>,
}

impl QueryError {
    /// Reads the first `Code` and `Message` elements, ignoring namespaces
    /// and attributes. Malformed XML yields whatever was read before it.
    fn parse(text: &str) -> Self {
        let mut reader = Reader::from_str(text);
        reader.trim_text(true);

        let mut error = Self::default();
        let mut current: Option<Vec<u8>> = None;
        loop {
            match reader.read_event() {
                Ok(XmlEvent::Start(start)) => current = Some(start.local_name().as_ref().to_vec()),
                Ok(XmlEvent::Text(content)) => {
                    let slot = match current.as_deref() {
                        Some(b"Code") => &mut error.code,
                        Some(b"Message") => &mut error.message,
                        _ => continue,
                    };
                    if slot.is_none() {
                        *slot = content.unescape().ok().map(|value| value.into_owned());
                    }
                }
                Ok(XmlEvent::End(_)) => current = None,
                Ok(XmlEvent::Eof) | Err(_) => break,
                Ok(_) => {}
            }
        }
        error
    }
}

#[async_trait]
impl EventsClient for SignedServiceClient {
    async fn put_rule(&self, name: &str, schedule_expression: &str, state: &str) -> ExtensionResult<()> {
        self.call_json(
            "AWSEvents.PutRule",
            &json!({"Name": name, "ScheduleExpression": schedule_expression, "State": state}),
        )
        .await?;
        Ok(())
    }

    async fn put_targets(&self, rule: &str, targets: &[EventTarget]) -> ExtensionResult<()> {
        let response = self
            .call_json("AWSEvents.PutTargets", &json!({"Rule": rule, "Targets": targets}))
            .await?;
        let failed = response.get("FailedEntryCount").and_then(Value::as_u64).unwrap_or(0);
        if failed > 0 {
            let message = response["FailedEntries"][0]["ErrorMessage"]
                .as_str()
                .unwrap_or("target rejected");
            return Err(ExtensionError::service(self.service, "FailedEntry", message, Some(200)));
        }
        Ok(())
    }

    async fn remove_targets(&self, rule: &str, ids: &[String]) -> ExtensionResult<()> {
        self.call_json("AWSEvents.RemoveTargets", &json!({"Rule": rule, "Ids": ids}))
            .await?;
        Ok(())
    }

    async fn delete_rule(&self, name: &str, force: bool) -> ExtensionResult<()> {
        self.call_json("AWSEvents.DeleteRule", &json!({"Name": name, "Force": force}))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LogsClient for SignedServiceClient {
    async fn create_log_group(&self, group: &str) -> ExtensionResult<()> {
        self.call_json("Logs_20140328.CreateLogGroup", &json!({"logGroupName": group}))
            .await?;
        Ok(())
    }

    async fn create_log_stream(&self, group: &str, stream: &str) -> ExtensionResult<()> {
        self.call_json(
            "Logs_20140328.CreateLogStream",
            &json!({"logGroupName": group, "logStreamName": stream}),
        )
        .await?;
        Ok(())
    }

    async fn put_log_events(
        &self,
        group: &str,
        stream: &str,
        events: &[InputLogEvent],
        sequence_token: Option<&str>,
    ) -> ExtensionResult<Option<String>> {
        let mut body = json!({"logGroupName": group, "logStreamName": stream, "logEvents": events});
        if let Some(token) = sequence_token {
            body["sequenceToken"] = Value::String(token.to_string());
        }
        let response = self.call_json("Logs_20140328.PutLogEvents", &body).await?;
        Ok(response
            .get("nextSequenceToken")
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}

#[async_trait]
impl MetricsClient for SignedServiceClient {
    async fn put_metric_data(&self, namespace: &str, data: &[MetricDatum]) -> ExtensionResult<()> {
        let mut params = vec![
            ("Action".to_string(), "PutMetricData".to_string()),
            ("Version".to_string(), "2010-08-01".to_string()),
            ("Namespace".to_string(), namespace.to_string()),
        ];
        for (i, datum) in data.iter().enumerate() {
            let prefix = format!("MetricData.member.{}", i + 1);
            params.push((format!("{}.MetricName", prefix), datum.metric_name.to_string()));
            params.push((format!("{}.Unit", prefix), datum.unit.to_string()));
            params.push((format!("{}.Value", prefix), datum.value.to_string()));
            params.push((
                format!("{}.Timestamp", prefix),
                datum.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            ));
            for (j, dimension) in datum.dimensions.iter().enumerate() {
                let dim_prefix = format!("{}.Dimensions.member.{}", prefix, j + 1);
                params.push((format!("{}.Name", dim_prefix), dimension.name.clone()));
                params.push((format!("{}.Value", dim_prefix), dimension.value.clone()));
            }
        }
        self.call_query(&params).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyDecryptor for SignedServiceClient {
    async fn decrypt(&self, key_id: &str, ciphertext: &[u8]) -> ExtensionResult<Vec<u8>> {
        let engine = base64::engine::general_purpose::STANDARD;
        let response = self
            .call_json(
                "TrentService.Decrypt",
                &json!({"KeyId": key_id, "CiphertextBlob": engine.encode(ciphertext)}),
            )
            .await?;
        let plaintext = response
            .get("Plaintext")
            .and_then(Value::as_str)
            .ok_or_else(|| ExtensionError::serdes("KMS Decrypt response has no Plaintext"))?;
        engine
            .decode(plaintext)
            .map_err(|e| ExtensionError::serdes(format!("KMS Decrypt returned invalid base64: {}", e)))
    }
}

/// Downloads remote Hook payloads with a bounded retry policy.
pub struct HttpPayloadFetcher {
    http_client: reqwest::Client,
    retry_limit: u32,
    retry_backoff: Duration,
}

impl HttpPayloadFetcher {
    /// Creates a fetcher with a 10 second timeout and three retries.
    pub fn new() -> ExtensionResult<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(REMOTE_PAYLOAD_TIMEOUT)
            .timeout(REMOTE_PAYLOAD_TIMEOUT)
            .build()
            .map_err(|e| ExtensionError::service("payload", "ClientError", e.to_string(), None))?;
        Ok(Self::with_client(http_client))
    }

    /// Creates a fetcher around an existing HTTP client.
    pub fn with_client(http_client: reqwest::Client) -> Self {
        Self {
            http_client,
            retry_limit: REMOTE_PAYLOAD_RETRY_LIMIT,
            retry_backoff: Duration::from_secs(1),
        }
    }

    /// Sets the delay before the first retry; later retries double it.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

#[async_trait]
impl PayloadFetcher for HttpPayloadFetcher {
    async fn fetch(&self, url: &str) -> ExtensionResult<Option<Value>> {
        let mut attempt = 0;
        loop {
            let retry_error = match self.http_client.get(url).send().await {
                Ok(response) if response.status().as_u16() == 200 => {
                    let payload = response
                        .json::<Value>()
                        .await
                        .map_err(|e| ExtensionError::serdes(format!("Remote payload is not JSON: {}", e)))?;
                    return Ok(Some(payload));
                }
                Ok(response) if REMOTE_PAYLOAD_RETRY_STATUSES.contains(&response.status().as_u16()) => {
                    ExtensionError::service(
                        "payload",
                        "ServerError",
                        format!("Remote payload request returned {}", response.status()),
                        Some(response.status().as_u16()),
                    )
                }
                Ok(response) => {
                    tracing::warn!(status = %response.status(), "Remote payload request was not successful");
                    return Ok(None);
                }
                Err(e) => ExtensionError::service("payload", "NetworkError", e.to_string(), None),
            };

            if attempt >= self.retry_limit {
                return Err(retry_error);
            }
            let delay = self.retry_backoff * 2u32.pow(attempt);
            attempt += 1;
            tracing::debug!(attempt = attempt, delay_ms = delay.as_millis() as u64, "Retrying remote payload fetch");
            tokio::time::sleep(delay).await;
        }
    }
}

/// Production client factory.
#[derive(Clone, Default)]
pub struct AwsServiceClients {
    http_client: reqwest::Client,
    endpoint_url: Option<String>,
}

impl AwsServiceClients {
    /// Creates a factory that talks to the public AWS endpoints.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends every request to `endpoint_url`, e.g. a local emulator.
    pub fn with_endpoint_url(mut self, endpoint_url: impl Into<String>) -> Self {
        self.endpoint_url = Some(endpoint_url.into());
        self
    }

    fn client(
        &self,
        credentials_provider: Arc<dyn ProvideCredentials>,
        service: &'static str,
        region: &str,
    ) -> SignedServiceClient {
        let client = SignedServiceClient::new(self.http_client.clone(), credentials_provider, service, region);
        match &self.endpoint_url {
            Some(url) => client.with_endpoint_url(url.clone()),
            None => client,
        }
    }

    fn session_client(&self, session: &SessionProxy, service: &'static str) -> SignedServiceClient {
        let region = session.region().unwrap_or("us-east-1");
        self.client(session.credentials_provider(), service, region)
    }
}

#[async_trait]
impl ServiceClients for AwsServiceClients {
    fn events(&self, session: &SessionProxy) -> Arc<dyn EventsClient> {
        Arc::new(self.session_client(session, "events"))
    }

    fn logs(&self, session: &SessionProxy) -> Arc<dyn LogsClient> {
        Arc::new(self.session_client(session, "logs"))
    }

    fn metrics(&self, session: &SessionProxy) -> Arc<dyn MetricsClient> {
        Arc::new(self.session_client(session, "monitoring"))
    }

    async fn key_decryptor(&self, key_arn: &str, role_arn: &str) -> ExtensionResult<Arc<dyn KeyDecryptor>> {
        let base_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        let region = key_arn
            .split(':')
            .nth(3)
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .or_else(|| base_config.region().map(|r| r.to_string()))
            .unwrap_or_else(|| "us-east-1".to_string());

        let provider = aws_config::sts::AssumeRoleProvider::builder(role_arn)
            .session_name(uuid::Uuid::new_v4().to_string())
            .configure(&base_config)
            .build()
            .await;

        Ok(Arc::new(self.client(Arc::new(provider), "kms", &region)))
    }

    fn payload_fetcher(&self) -> Arc<dyn PayloadFetcher> {
        match HttpPayloadFetcher::new() {
            Ok(fetcher) => Arc::new(fetcher),
            Err(e) => {
                tracing::warn!(error = %e, "Falling back to an HTTP client without timeouts");
                Arc::new(HttpPayloadFetcher::with_client(self.http_client.clone()))
            }
        }
    }
}
