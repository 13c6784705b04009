//! Delivery of handler logs to the provider's CloudWatch Logs group.
//!
//! A single [`ProviderLogDelivery`] lives for the whole process. The
//! [`ProviderLogLayer`] installed into the `tracing` subscriber forwards
//! formatted events to it, and a background task uploads them with
//! `PutLogEvents`. Warm containers reuse the same delivery: attaching again
//! only refreshes the destination and client.

use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};

use crate::client::{InputLogEvent, LogsClient};
use crate::error::{ExtensionError, ExtensionResult};
use crate::metrics::MetricsPublisherProxy;

/// How long [`ProviderLogDelivery::flush`] waits for pending uploads.
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

const SEQUENCE_TOKEN_RETRIES: usize = 3;

/// Targets never forwarded to the provider, to keep the uploader from
/// logging about its own uploads.
tokio::task_local! {
    /// Set while the uploader is delivering; events raised inside it are
    /// never forwarded.
    static UPLOADING: ();
}

const IGNORED_TARGET_PREFIXES: [&str; 5] = [
    module_path!(),
    "hyper",
    "h2",
    "reqwest",
    "rustls",
];

/// Where provider logs go and how to get them there.
#[derive(Clone)]
pub struct LogDestination {
    /// Provider log group
    pub group: String,
    /// Log stream inside the group, with `:` already replaced
    pub stream: String,
    /// Client authenticated as the provider
    pub client: Arc<dyn LogsClient>,
    /// Metrics used to report delivery failures
    pub metrics: MetricsPublisherProxy,
}

impl LogDestination {
    /// Creates a destination; `:` in the stream name is replaced by `__`.
    pub fn new(
        group: impl Into<String>,
        stream: &str,
        client: Arc<dyn LogsClient>,
        metrics: MetricsPublisherProxy,
    ) -> Self {
        Self {
            group: group.into(),
            stream: stream.replace(':', "__"),
            client,
            metrics,
        }
    }
}

/// Log stream for a resource invocation.
///
/// Uses `{stack_id}/{logical_id}` when both are known, otherwise
/// `{account}-{region}`.
pub fn resource_stream_name(
    stack_id: Option<&str>,
    logical_resource_id: Option<&str>,
    account_id: &str,
    region: &str,
) -> String {
    match (stack_id, logical_resource_id) {
        (Some(stack), Some(logical)) => format!("{}/{}", stack, logical),
        _ => format!("{}-{}", account_id, region),
    }
}

/// Log stream for a Hook invocation.
///
/// Uses `{stack_id}/{client_request_token}` when the stack is known,
/// otherwise `{account}-{hook_type_name}`.
pub fn hook_stream_name(
    stack_id: Option<&str>,
    client_request_token: &str,
    account_id: &str,
    hook_type_name: &str,
) -> String {
    match stack_id.filter(|s| !s.is_empty()) {
        Some(stack) => format!("{}/{}", stack, client_request_token),
        None => format!("{}-{}", account_id, hook_type_name),
    }
}

enum LogCommand {
    Event(InputLogEvent),
    Flush(oneshot::Sender<()>),
}

struct DestinationState {
    destination: LogDestination,
    sequence_token: Option<String>,
}

struct Inner {
    attached: AtomicBool,
    sender: mpsc::UnboundedSender<LogCommand>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<LogCommand>>>,
    state: Arc<tokio::sync::Mutex<Option<DestinationState>>>,
}

/// Process-wide provider log delivery handle.
#[derive(Clone)]
pub struct ProviderLogDelivery {
    inner: Arc<Inner>,
}

impl Default for ProviderLogDelivery {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderLogDelivery {
    /// Creates a detached delivery. Nothing is forwarded until [`attach`](Self::attach).
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                attached: AtomicBool::new(false),
                sender,
                receiver: Mutex::new(Some(receiver)),
                state: Arc::new(tokio::sync::Mutex::new(None)),
            }),
        }
    }

    /// Points delivery at `destination`.
    ///
    /// The upload task is spawned on the first call. Later calls replace the
    /// destination and client in place. Returns true on the first attach.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn attach(&self, destination: LogDestination) -> bool {
        {
            let mut state = self.inner.state.lock().await;
            let keep_token = state.as_ref().is_some_and(|current| {
                current.destination.group == destination.group
                    && current.destination.stream == destination.stream
            });
            let sequence_token = if keep_token {
                state.as_mut().and_then(|current| current.sequence_token.take())
            } else {
                None
            };
            *state = Some(DestinationState {
                destination,
                sequence_token,
            });
        }

        let receiver = self
            .inner
            .receiver
            .lock()
            .ok()
            .and_then(|mut receiver| receiver.take());
        let first = receiver.is_some();
        if let Some(receiver) = receiver {
            tokio::spawn(run_uploader(receiver, Arc::clone(&self.inner.state)));
        }
        self.inner.attached.store(true, Ordering::SeqCst);
        first
    }

    /// Stops forwarding events and forgets the destination.
    pub async fn detach(&self) {
        self.inner.attached.store(false, Ordering::SeqCst);
        *self.inner.state.lock().await = None;
    }

    /// Returns true while events are being forwarded.
    pub fn is_attached(&self) -> bool {
        self.inner.attached.load(Ordering::SeqCst)
    }

    /// Queues a log line for upload. Dropped when detached.
    pub fn enqueue(&self, message: String) {
        if !self.is_attached() {
            return;
        }
        let event = InputLogEvent {
            timestamp: Utc::now().timestamp_millis(),
            message,
        };
        let _ = self.inner.sender.send(LogCommand::Event(event));
    }

    /// Waits until every queued line has been uploaded, up to [`FLUSH_TIMEOUT`].
    pub async fn flush(&self) {
        if !self.is_attached() {
            return;
        }
        let (ack, done) = oneshot::channel();
        if self.inner.sender.send(LogCommand::Flush(ack)).is_err() {
            return;
        }
        let _ = tokio::time::timeout(FLUSH_TIMEOUT, done).await;
    }
}

async fn run_uploader(
    mut receiver: mpsc::UnboundedReceiver<LogCommand>,
    state: Arc<tokio::sync::Mutex<Option<DestinationState>>>,
) {
    while let Some(command) = receiver.recv().await {
        let mut batch = Vec::new();
        let mut acks = Vec::new();
        let mut next = Some(command);
        while let Some(command) = next {
            match command {
                LogCommand::Event(event) => batch.push(event),
                LogCommand::Flush(ack) => acks.push(ack),
            }
            next = receiver.try_recv().ok();
        }

        if !batch.is_empty() {
            let snapshot = state.lock().await.as_ref().map(|current| DestinationState {
                destination: current.destination.clone(),
                sequence_token: current.sequence_token.clone(),
            });
            if let Some(mut current) = snapshot {
                UPLOADING.scope((), upload(&mut current, &batch)).await;
                if let Some(latest) = state.lock().await.as_mut() {
                    if latest.destination.group == current.destination.group
                        && latest.destination.stream == current.destination.stream
                    {
                        latest.sequence_token = current.sequence_token;
                    }
                }
            }
        }

        for ack in acks {
            let _ = ack.send(());
        }
    }
}

async fn upload(current: &mut DestinationState, batch: &[InputLogEvent]) {
    if let Err(e) = deliver(current, batch).await {
        tracing::warn!(error = %e, "Failed to deliver provider logs");
        current
            .destination
            .metrics
            .publish_log_delivery_exception_metric(Utc::now(), &e)
            .await;
    }
}

async fn deliver(state: &mut DestinationState, events: &[InputLogEvent]) -> ExtensionResult<()> {
    let mut token_retries = 0;
    let mut recreated = false;

    loop {
        let destination = &state.destination;
        let result = destination
            .client
            .put_log_events(
                &destination.group,
                &destination.stream,
                events,
                state.sequence_token.as_deref(),
            )
            .await;

        match result {
            Ok(next_token) => {
                state.sequence_token = next_token;
                return Ok(());
            }
            Err(e) if is_sequence_token_error(&e) && token_retries < SEQUENCE_TOKEN_RETRIES => {
                token_retries += 1;
                state.sequence_token = e.to_string().rsplit(' ').next().map(str::to_string);
            }
            Err(e) if e.is_not_found() && !recreated => {
                recreated = true;
                if e.to_string().contains("log group does not exist") {
                    ignore_already_exists(destination.client.create_log_group(&destination.group).await)?;
                }
                ignore_already_exists(
                    destination
                        .client
                        .create_log_stream(&destination.group, &destination.stream)
                        .await,
                )?;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_sequence_token_error(error: &ExtensionError) -> bool {
    matches!(
        error.service_code(),
        Some("InvalidSequenceTokenException") | Some("DataAlreadyAcceptedException")
    )
}

fn ignore_already_exists(result: ExtensionResult<()>) -> ExtensionResult<()> {
    match result {
        Err(e) if e.is_already_exists() => Ok(()),
        other => other,
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }
}

/// `tracing` layer that forwards events to a [`ProviderLogDelivery`].
#[derive(Clone)]
pub struct ProviderLogLayer {
    delivery: ProviderLogDelivery,
}

impl ProviderLogLayer {
    /// Creates a layer feeding `delivery`.
    pub fn new(delivery: ProviderLogDelivery) -> Self {
        Self { delivery }
    }
}

impl<S: Subscriber> tracing_subscriber::Layer<S> for ProviderLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        if !self.delivery.is_attached() || UPLOADING.try_with(|_| ()).is_ok() {
            return;
        }
        let target = event.metadata().target();
        if IGNORED_TARGET_PREFIXES
            .iter()
            .any(|prefix| target.starts_with(prefix))
        {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let line = format!(
            "{} {} {}: {}{}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            event.metadata().level(),
            target,
            visitor.message,
            visitor.fields
        );
        self.delivery.enqueue(line);
    }
}
