//! CloudWatch metrics published around handler invocations.
//!
//! Every failure is logged. Invocation and duration metrics also report the
//! first failure to the caller, which decides whether the invocation can
//! still succeed; exception and log delivery metrics are fire and forget.

use std::fmt::Display;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::client::{Dimension, MetricDatum, MetricsClient};
use crate::error::{ExtensionError, ExtensionResult};
use crate::interface::{MetricTypes, StandardUnit};

/// Dimension naming the action or invocation point.
pub const DIMENSION_ACTION_TYPE: &str = "DimensionKeyActionType";
/// Dimension naming the kind of error.
pub const DIMENSION_EXCEPTION_TYPE: &str = "DimensionKeyExceptionType";
/// Dimension naming the resource type.
pub const DIMENSION_RESOURCE_TYPE: &str = "DimensionKeyResourceType";
/// Dimension naming the invocation point of a Hook.
pub const DIMENSION_INVOCATION_POINT_TYPE: &str = "DimensionKeyInvocationPointType";
/// Dimension naming the Hook type.
pub const DIMENSION_HOOK_TYPE: &str = "DimensionKeyHookType";

/// Action dimension value used for log delivery failures.
pub const LOG_DELIVERY_ACTION: &str = "ProviderLogDelivery";

/// Publishes metrics for one extension type into its namespace.
#[derive(Clone)]
pub struct MetricsPublisher {
    client: Arc<dyn MetricsClient>,
    namespace: String,
    type_name: String,
    action_dimension: &'static str,
    type_dimension: &'static str,
}

impl MetricsPublisher {
    /// Creates a publisher for a resource type.
    ///
    /// The namespace is `AWS/CloudFormation/` followed by the type name with
    /// `::` replaced by `/`.
    pub fn new(client: Arc<dyn MetricsClient>, type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        Self {
            client,
            namespace: Self::make_namespace(&type_name),
            type_name,
            action_dimension: DIMENSION_ACTION_TYPE,
            type_dimension: DIMENSION_RESOURCE_TYPE,
        }
    }

    /// Creates a publisher for a Hook type, namespaced by account.
    pub fn for_hook(
        client: Arc<dyn MetricsClient>,
        hook_type_name: impl Into<String>,
        account_id: &str,
    ) -> Self {
        let type_name = hook_type_name.into();
        Self {
            client,
            namespace: format!("AWS/CloudFormation/{}/{}", account_id, type_name.replace("::", "/")),
            type_name,
            action_dimension: DIMENSION_INVOCATION_POINT_TYPE,
            type_dimension: DIMENSION_HOOK_TYPE,
        }
    }

    /// Returns the metrics namespace for a type name.
    pub fn make_namespace(type_name: &str) -> String {
        format!("AWS/CloudFormation/{}", type_name.replace("::", "/"))
    }

    /// Returns the namespace this publisher writes to.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Publishes a single data point.
    pub async fn publish_metric(
        &self,
        metric_name: MetricTypes,
        dimensions: Vec<Dimension>,
        unit: StandardUnit,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> ExtensionResult<()> {
        let datum = MetricDatum {
            metric_name,
            dimensions,
            unit,
            value,
            timestamp,
        };
        self.client.put_metric_data(&self.namespace, &[datum]).await
    }

    /// Counts a handler error.
    pub async fn publish_exception_metric(
        &self,
        timestamp: DateTime<Utc>,
        action: impl Display,
        error: &ExtensionError,
    ) -> ExtensionResult<()> {
        let dimensions = vec![
            Dimension::new(self.action_dimension, action.to_string()),
            Dimension::new(DIMENSION_EXCEPTION_TYPE, error.kind_name()),
            Dimension::new(self.type_dimension, self.type_name.clone()),
        ];
        self.publish_metric(MetricTypes::HandlerException, dimensions, StandardUnit::Count, 1.0, timestamp)
            .await
    }

    /// Counts a handler invocation.
    pub async fn publish_invocation_metric(
        &self,
        timestamp: DateTime<Utc>,
        action: impl Display,
    ) -> ExtensionResult<()> {
        let dimensions = vec![
            Dimension::new(self.action_dimension, action.to_string()),
            Dimension::new(self.type_dimension, self.type_name.clone()),
        ];
        self.publish_metric(
            MetricTypes::HandlerInvocationCount,
            dimensions,
            StandardUnit::Count,
            1.0,
            timestamp,
        )
        .await
    }

    /// Records how long a handler ran.
    pub async fn publish_duration_metric(
        &self,
        timestamp: DateTime<Utc>,
        action: impl Display,
        milliseconds: f64,
    ) -> ExtensionResult<()> {
        let dimensions = vec![
            Dimension::new(self.action_dimension, action.to_string()),
            Dimension::new(self.type_dimension, self.type_name.clone()),
        ];
        self.publish_metric(
            MetricTypes::HandlerInvocationDuration,
            dimensions,
            StandardUnit::Milliseconds,
            milliseconds,
            timestamp,
        )
        .await
    }

    /// Counts a failure to deliver provider logs.
    pub async fn publish_log_delivery_exception_metric(
        &self,
        timestamp: DateTime<Utc>,
        error: &ExtensionError,
    ) -> ExtensionResult<()> {
        self.publish_exception_metric(timestamp, LOG_DELIVERY_ACTION, error)
            .await
    }
}

/// Fans metric calls out to every registered publisher.
///
/// An empty proxy is valid and publishes nothing, which is what an
/// invocation without provider credentials gets.
#[derive(Clone, Default)]
pub struct MetricsPublisherProxy {
    publishers: Vec<MetricsPublisher>,
}

impl MetricsPublisherProxy {
    /// Creates an empty proxy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a publisher; `None` is ignored.
    pub fn add_metrics_publisher(&mut self, publisher: Option<MetricsPublisher>) {
        if let Some(publisher) = publisher {
            self.publishers.push(publisher);
        }
    }

    /// Returns true if no publisher is registered.
    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }

    fn log_failure(result: ExtensionResult<()>) {
        if let Err(e) = result {
            tracing::error!(error = %e, "An error occurred while publishing metrics");
        }
    }

    fn keep_first(first_error: &mut Option<ExtensionError>, result: ExtensionResult<()>) {
        if let Err(e) = result {
            tracing::error!(error = %e, "An error occurred while publishing metrics");
            first_error.get_or_insert(e);
        }
    }

    /// See [`MetricsPublisher::publish_exception_metric`].
    pub async fn publish_exception_metric(
        &self,
        timestamp: DateTime<Utc>,
        action: impl Display,
        error: &ExtensionError,
    ) {
        let action = action.to_string();
        for publisher in &self.publishers {
            Self::log_failure(publisher.publish_exception_metric(timestamp, &action, error).await);
        }
    }

    /// See [`MetricsPublisher::publish_invocation_metric`].
    ///
    /// Every publisher is tried; the first failure is returned.
    pub async fn publish_invocation_metric(
        &self,
        timestamp: DateTime<Utc>,
        action: impl Display,
    ) -> ExtensionResult<()> {
        let action = action.to_string();
        let mut first_error = None;
        for publisher in &self.publishers {
            Self::keep_first(
                &mut first_error,
                publisher.publish_invocation_metric(timestamp, &action).await,
            );
        }
        first_error.map_or(Ok(()), Err)
    }

    /// See [`MetricsPublisher::publish_duration_metric`].
    ///
    /// Every publisher is tried; the first failure is returned.
    pub async fn publish_duration_metric(
        &self,
        timestamp: DateTime<Utc>,
        action: impl Display,
        milliseconds: f64,
    ) -> ExtensionResult<()> {
        let action = action.to_string();
        let mut first_error = None;
        for publisher in &self.publishers {
            Self::keep_first(
                &mut first_error,
                publisher
                    .publish_duration_metric(timestamp, &action, milliseconds)
                    .await,
            );
        }
        first_error.map_or(Ok(()), Err)
    }

    /// See [`MetricsPublisher::publish_log_delivery_exception_metric`].
    pub async fn publish_log_delivery_exception_metric(
        &self,
        timestamp: DateTime<Utc>,
        error: &ExtensionError,
    ) {
        for publisher in &self.publishers {
            Self::log_failure(
                publisher
                    .publish_log_delivery_exception_metric(timestamp, error)
                    .await,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingMetrics {
        calls: Mutex<Vec<(String, Vec<MetricDatum>)>>,
        fail: bool,
    }

    #[async_trait]
    impl MetricsClient for RecordingMetrics {
        async fn put_metric_data(&self, namespace: &str, data: &[MetricDatum]) -> ExtensionResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push((namespace.to_string(), data.to_vec()));
            if self.fail {
                return Err(ExtensionError::service("monitoring", "InternalServiceError", "", Some(500)));
            }
            Ok(())
        }
    }

    impl RecordingMetrics {
        fn service_code_of(&self, result: ExtensionResult<()>) -> Option<String> {
            result.err().and_then(|e| e.service_code().map(str::to_string))
        }
    }

    const RESOURCE_TYPE: &str = "Aa::Bb::Cc";

    fn timestamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0).unwrap()
    }

    fn dims(pairs: &[(&str, &str)]) -> Vec<Dimension> {
        pairs.iter().map(|(k, v)| Dimension::new(*k, *v)).collect()
    }

    #[test]
    fn test_make_namespace() {
        assert_eq!(MetricsPublisher::make_namespace(RESOURCE_TYPE), "AWS/CloudFormation/Aa/Bb/Cc");
    }

    #[tokio::test]
    async fn test_publish_exception_metric() {
        let client = Arc::new(RecordingMetrics::default());
        let mut proxy = MetricsPublisherProxy::new();
        proxy.add_metrics_publisher(Some(MetricsPublisher::new(client.clone(), RESOURCE_TYPE)));

        let error = ExtensionError::not_found(RESOURCE_TYPE, "id");
        proxy
            .publish_exception_metric(timestamp(), crate::Action::Create, &error)
            .await;

        let calls = client.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (namespace, data) = &calls[0];
        assert_eq!(namespace, "AWS/CloudFormation/Aa/Bb/Cc");
        assert_eq!(
            data[0],
            MetricDatum {
                metric_name: MetricTypes::HandlerException,
                dimensions: dims(&[
                    (DIMENSION_ACTION_TYPE, "CREATE"),
                    (DIMENSION_EXCEPTION_TYPE, "NotFound"),
                    (DIMENSION_RESOURCE_TYPE, RESOURCE_TYPE),
                ]),
                unit: StandardUnit::Count,
                value: 1.0,
                timestamp: timestamp(),
            }
        );
    }

    #[tokio::test]
    async fn test_publish_invocation_and_duration_metrics() {
        let client = Arc::new(RecordingMetrics::default());
        let mut proxy = MetricsPublisherProxy::new();
        proxy.add_metrics_publisher(Some(MetricsPublisher::new(client.clone(), RESOURCE_TYPE)));

        proxy
            .publish_invocation_metric(timestamp(), crate::Action::Create)
            .await
            .unwrap();
        proxy
            .publish_duration_metric(timestamp(), crate::Action::Create, 100.0)
            .await
            .unwrap();

        let calls = client.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1[0].metric_name, MetricTypes::HandlerInvocationCount);
        assert_eq!(
            calls[0].1[0].dimensions,
            dims(&[(DIMENSION_ACTION_TYPE, "CREATE"), (DIMENSION_RESOURCE_TYPE, RESOURCE_TYPE)])
        );
        assert_eq!(calls[1].1[0].metric_name, MetricTypes::HandlerInvocationDuration);
        assert_eq!(calls[1].1[0].unit, StandardUnit::Milliseconds);
        assert_eq!(calls[1].1[0].value, 100.0);
    }

    #[tokio::test]
    async fn test_publish_log_delivery_exception_metric() {
        let client = Arc::new(RecordingMetrics::default());
        let publisher = MetricsPublisher::new(client.clone(), RESOURCE_TYPE);
        let error = ExtensionError::service("logs", "AccessDeniedException", "no", Some(400));
        publisher
            .publish_log_delivery_exception_metric(timestamp(), &error)
            .await
            .unwrap();

        let calls = client.calls.lock().unwrap();
        assert_eq!(
            calls[0].1[0].dimensions,
            dims(&[
                (DIMENSION_ACTION_TYPE, LOG_DELIVERY_ACTION),
                (DIMENSION_EXCEPTION_TYPE, "AccessDeniedException"),
                (DIMENSION_RESOURCE_TYPE, RESOURCE_TYPE),
            ])
        );
    }

    #[tokio::test]
    async fn test_hook_publisher_dimensions() {
        let client = Arc::new(RecordingMetrics::default());
        let publisher = MetricsPublisher::for_hook(client.clone(), "My::Hook::Type", "123456789012");
        assert_eq!(publisher.namespace(), "AWS/CloudFormation/123456789012/My/Hook/Type");

        publisher
            .publish_invocation_metric(timestamp(), crate::HookInvocationPoint::CreatePreProvision)
            .await
            .unwrap();
        let calls = client.calls.lock().unwrap();
        assert_eq!(
            calls[0].1[0].dimensions,
            dims(&[
                (DIMENSION_INVOCATION_POINT_TYPE, "CREATE_PRE_PROVISION"),
                (DIMENSION_HOOK_TYPE, "My::Hook::Type"),
            ])
        );
    }

    #[tokio::test]
    async fn test_proxy_tries_every_publisher() {
        let client = Arc::new(RecordingMetrics {
            fail: true,
            ..Default::default()
        });
        let mut proxy = MetricsPublisherProxy::new();
        proxy.add_metrics_publisher(Some(MetricsPublisher::new(client.clone(), RESOURCE_TYPE)));
        proxy.add_metrics_publisher(Some(MetricsPublisher::new(client.clone(), "Dd::Ee::Ff")));

        let result = proxy.publish_invocation_metric(timestamp(), crate::Action::Read).await;
        assert_eq!(client.service_code_of(result), Some("InternalServiceError".to_string()));
        assert_eq!(client.calls.lock().unwrap().len(), 2);

        proxy
            .publish_exception_metric(timestamp(), crate::Action::Read, &ExtensionError::throttling("slow"))
            .await;
        assert_eq!(client.calls.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_add_none_is_ignored() {
        let mut proxy = MetricsPublisherProxy::new();
        proxy.add_metrics_publisher(None);
        assert!(proxy.is_empty());
    }
}
