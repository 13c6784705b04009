//! Reinvocation scheduling.
//!
//! [`ReinvocationPolicy`] decides whether an IN_PROGRESS handler is called
//! again inside the current function invocation or handed to an external
//! one-shot timer. [`CloudWatchScheduler`] arms and removes those timers as
//! CloudWatch Events rules.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::client::{EventTarget, EventsClient};
use crate::config::RuntimeConfig;
use crate::error::{ExtensionError, ExtensionResult};

/// Key in `requestContext` holding the rule that triggered this invocation.
pub const RULE_NAME_KEY: &str = "cloudWatchEventsRuleName";

/// Key in `requestContext` holding the target that triggered this invocation.
pub const TARGET_ID_KEY: &str = "cloudWatchEventsTargetId";

/// How an IN_PROGRESS handler continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Sleep for the duration and call the handler again in-process.
    Local(Duration),
    /// Arm an external timer firing after this many minutes.
    Remote {
        /// Whole minutes until the timer fires, at least one
        minutes: u32,
    },
}

/// Chooses between local and remote continuation.
#[derive(Debug, Clone)]
pub struct ReinvocationPolicy {
    threshold: Duration,
    invocation_budget: Duration,
    safety_factor: f64,
    min_local_delay: Duration,
}

impl ReinvocationPolicy {
    /// Builds the policy from the runtime configuration.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            threshold: config.local_callback_threshold,
            invocation_budget: config.invocation_budget,
            safety_factor: config.delay_safety_factor,
            min_local_delay: config.min_local_delay,
        }
    }

    /// Decides how to continue after a handler asked for `delay_seconds`.
    ///
    /// Continues locally only when the delay is below the threshold and the
    /// remaining time covers the padded delay plus one more handler run. A
    /// zero delay still sleeps for the minimum local delay so a handler
    /// cannot spin.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use cfn_extension_runtime::config::RuntimeConfig;
    /// use cfn_extension_runtime::scheduler::{Continuation, ReinvocationPolicy};
    ///
    /// let policy = ReinvocationPolicy::from_config(&RuntimeConfig::default());
    /// assert_eq!(
    ///     policy.decide(5, Duration::from_secs(900)),
    ///     Continuation::Local(Duration::from_secs(5))
    /// );
    /// assert_eq!(
    ///     policy.decide(5, Duration::from_secs(30)),
    ///     Continuation::Remote { minutes: 1 }
    /// );
    /// assert_eq!(
    ///     policy.decide(150, Duration::from_secs(900)),
    ///     Continuation::Remote { minutes: 3 }
    /// );
    /// ```
    pub fn decide(&self, delay_seconds: u32, remaining: Duration) -> Continuation {
        let delay = Duration::from_secs(u64::from(delay_seconds));
        let local_delay = delay.max(self.min_local_delay);
        let needed = local_delay.mul_f64(self.safety_factor) + self.invocation_budget;

        if delay < self.threshold && remaining > needed {
            Continuation::Local(local_delay)
        } else {
            Continuation::Remote {
                minutes: delay_seconds.div_ceil(60).max(1),
            }
        }
    }
}

/// Formats the cron expression for a timer `minutes` from `now`, plus one
/// minute of slack.
///
/// # Examples
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use cfn_extension_runtime::scheduler::min_to_cron;
///
/// let now = Utc.with_ymd_and_hms(2014, 10, 22, 12, 30, 15).unwrap();
/// assert_eq!(min_to_cron(1, now), "cron('32 12 22 10 ? 2014')");
/// ```
pub fn min_to_cron(minutes: u32, now: DateTime<Utc>) -> String {
    let schedule_time = now + chrono::Duration::minutes(i64::from(minutes) + 1);
    schedule_time.format("cron('%M %H %d %m ? %Y')").to_string()
}

/// Returns the `requestContext` object of a raw event, creating it if needed.
///
/// # Errors
///
/// Returns a validation error if the event is not a JSON object.
pub fn request_context_mut(event: &mut Value) -> ExtensionResult<&mut Map<String, Value>> {
    let fields = event
        .as_object_mut()
        .ok_or_else(|| ExtensionError::validation("request event must be a JSON object"))?;
    let context = fields
        .entry("requestContext")
        .or_insert_with(|| Value::Object(Map::new()));
    if !context.is_object() {
        *context = Value::Object(Map::new());
    }
    context
        .as_object_mut()
        .ok_or_else(|| ExtensionError::validation("requestContext must be a JSON object"))
}

/// Arms and removes CloudWatch Events reinvocation timers.
#[derive(Clone)]
pub struct CloudWatchScheduler {
    client: Arc<dyn EventsClient>,
}

impl CloudWatchScheduler {
    /// Creates a scheduler backed by `client`.
    pub fn new(client: Arc<dyn EventsClient>) -> Self {
        Self { client }
    }

    /// Schedules `function_arn` to be invoked with `request` after
    /// `minutes_from_now` minutes (at least one).
    ///
    /// The generated rule name and target id are written into
    /// `request.requestContext` before the request is serialized into the
    /// timer, so the next invocation can clean them up. Returns the rule name.
    pub async fn reschedule_after_minutes(
        &self,
        function_arn: &str,
        minutes_from_now: u32,
        request: &mut Value,
    ) -> ExtensionResult<String> {
        let cron = min_to_cron(minutes_from_now.max(1), Utc::now());
        let id = uuid::Uuid::new_v4().simple().to_string();
        let rule_name = format!("reinvoke-handler-{}", id);
        let target_id = format!("reinvoke-target-{}", id);

        let context = request_context_mut(request)?;
        context.insert(RULE_NAME_KEY.to_string(), Value::String(rule_name.clone()));
        context.insert(TARGET_ID_KEY.to_string(), Value::String(target_id.clone()));
        let input = serde_json::to_string(request)?;

        tracing::info!(cron = %cron, id = %id, "Scheduling re-invoke");
        self.client.put_rule(&rule_name, &cron, "ENABLED").await?;
        self.client
            .put_targets(
                &rule_name,
                &[EventTarget {
                    id: target_id,
                    arn: function_arn.to_string(),
                    input,
                }],
            )
            .await?;
        Ok(rule_name)
    }

    /// Removes a timer. Never fails; errors are logged.
    ///
    /// The target is removed only when both names are known; the rule is
    /// deleted whenever its name is known.
    pub async fn cleanup(&self, rule_name: Option<&str>, target_id: Option<&str>) {
        let rule_name = rule_name.filter(|r| !r.is_empty());
        let target_id = target_id.filter(|t| !t.is_empty());

        if let (Some(rule), Some(target)) = (rule_name, target_id) {
            if let Err(e) = self.client.remove_targets(rule, &[target.to_string()]).await {
                tracing::error!(target_id = %target, error = %e, "Error cleaning CloudWatchEvents Target");
            }
        }
        if let Some(rule) = rule_name {
            if let Err(e) = self.client.delete_rule(rule, true).await {
                tracing::error!(rule_name = %rule, error = %e, "Error cleaning CloudWatchEvents");
            }
        }
    }
}
