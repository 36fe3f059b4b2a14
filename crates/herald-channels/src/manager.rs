use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::FutureExt;
use herald_core::{ChannelConfig, DeliveryConfig, DeliveryStatus};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    channel::SendParams,
    error::{ChannelError, DeliveryError, ErrorCode},
    format::format_for_channel,
    registry::ChannelRegistry,
    types::{DeliveryReport, DeliveryRequest, DeliveryResult, RenderedMessage, SendOutcome},
};

/// Retry schedule for transient send failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    ///
    /// `base * 2^(attempt-1)` capped at `max_delay`; a server-provided
    /// `retry_after` replaces the computed value but is capped the same way.
    pub fn backoff(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.max_delay);
        }
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Fans a [`DeliveryRequest`] out over (recipient, channel) units.
///
/// At most `parallelism` units are in flight; transient failures are retried
/// per unit according to the [`RetryPolicy`]. One unit's failure never stops
/// the others.
pub struct DeliveryManager {
    registry: Arc<ChannelRegistry>,
    policy: RetryPolicy,
    parallelism: usize,
}

struct Unit {
    index: usize,
    recipient: usize,
    channel: String,
}

impl DeliveryManager {
    pub fn new(registry: Arc<ChannelRegistry>, config: &DeliveryConfig) -> Self {
        Self {
            registry,
            policy: RetryPolicy::from_config(config),
            parallelism: config.parallelism(),
        }
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn available_channels(&self) -> Vec<String> {
        self.registry.names()
    }

    pub fn calculate_backoff(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        self.policy.backoff(attempt, retry_after)
    }

    /// Validate every listed channel against its config before scheduling work.
    pub fn validate_channel_configs(
        &self,
        channels: &[String],
        configs: &HashMap<String, ChannelConfig>,
    ) -> Result<(), ChannelError> {
        for name in channels {
            self.registry.validate_config(name, configs.get(name))?;
        }
        Ok(())
    }

    /// Deliver the request's message to every (recipient, channel) pair.
    ///
    /// Rejects requests that name channels but no recipients or recipients
    /// but no channels; an entirely empty request reports `Delivered` with
    /// zero units. Once `cancel` fires no further units are dispatched and
    /// in-flight ones stop at their next send or backoff; every unit still
    /// shows up in the report.
    pub async fn deliver(
        &self,
        cancel: &CancellationToken,
        request: DeliveryRequest,
    ) -> Result<DeliveryReport, DeliveryError> {
        let started_at = Utc::now();
        let clock = Instant::now();

        if request.recipients.is_empty() && !request.channels.is_empty() {
            return Err(DeliveryError::NoRecipients {
                channels: request.channels.len(),
            });
        }
        if request.channels.is_empty() && !request.recipients.is_empty() {
            return Err(DeliveryError::NoChannels {
                recipients: request.recipients.len(),
            });
        }

        let request = Arc::new(request);
        let total = request.unit_count();
        info!(
            delivery_id = %request.delivery_id,
            recipients = request.recipients.len(),
            channels = request.channels.len(),
            units = total,
            "starting delivery"
        );

        // One formatted copy per channel.
        let mut formatted: HashMap<String, Arc<RenderedMessage>> = HashMap::new();
        for name in &request.channels {
            if let Some(channel) = self.registry.get(name) {
                formatted
                    .entry(name.clone())
                    .or_insert_with(|| Arc::new(format_for_channel(channel.as_ref(), &request.message)));
            }
        }

        let units: Vec<Unit> = (0..request.recipients.len())
            .flat_map(|r| {
                request
                    .channels
                    .iter()
                    .map(move |c| (r, c.clone()))
            })
            .enumerate()
            .map(|(index, (recipient, channel))| Unit {
                index,
                recipient,
                channel,
            })
            .collect();

        let mut slots: Vec<Option<DeliveryResult>> = vec![None; total];
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut tasks = JoinSet::new();

        for unit in units {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                slots[unit.index] = Some(DeliveryResult::failure(
                    request.recipients[unit.recipient].clone(),
                    unit.channel,
                    ErrorCode::Cancelled,
                    "delivery cancelled before dispatch",
                    0,
                ));
                continue;
            };

            let registry = Arc::clone(&self.registry);
            let request = Arc::clone(&request);
            let message = formatted.get(&unit.channel).cloned();
            let cancel = cancel.clone();
            let policy = self.policy;
            tasks.spawn(async move {
                let _permit = permit;
                let index = unit.index;
                let recipient = request.recipients[unit.recipient].clone();
                let channel = unit.channel.clone();
                let run = run_unit(&registry, &request, unit, message, &cancel, policy);
                let result = match AssertUnwindSafe(run).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => {
                        error!(channel = %channel, "delivery channel panicked");
                        DeliveryResult::failure(recipient, channel, ErrorCode::Unknown, "channel panicked", 1)
                    }
                };
                (index, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => error!(error = %e, "delivery task failed to join"),
            }
        }

        let results: Vec<DeliveryResult> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    let recipient = index / request.channels.len().max(1);
                    let channel = index % request.channels.len().max(1);
                    DeliveryResult::failure(
                        request.recipients[recipient].clone(),
                        request.channels[channel].clone(),
                        ErrorCode::Unknown,
                        "delivery task lost",
                        0,
                    )
                })
            })
            .collect();

        let successful = results.iter().filter(|r| r.success).count();
        let failed = results.len() - successful;
        let status = DeliveryStatus::from_counts(successful, failed);
        let completed_at = Utc::now();
        let duration_ms = clock.elapsed().as_millis() as u64;

        info!(
            delivery_id = %request.delivery_id,
            status = %status,
            successful,
            failed,
            duration_ms,
            "delivery finished"
        );

        Ok(DeliveryReport {
            delivery_id: request.delivery_id.clone(),
            status,
            total_recipients: total,
            successful_deliveries: successful,
            failed_deliveries: failed,
            results,
            started_at,
            completed_at,
            duration_ms,
        })
    }
}

/// Send one unit, retrying transient failures until the policy is exhausted
/// or the token fires.
async fn run_unit(
    registry: &ChannelRegistry,
    request: &DeliveryRequest,
    unit: Unit,
    message: Option<Arc<RenderedMessage>>,
    cancel: &CancellationToken,
    policy: RetryPolicy,
) -> DeliveryResult {
    let recipient = &request.recipients[unit.recipient];
    let (Some(channel), Some(message)) = (registry.get(&unit.channel), message) else {
        warn!(channel = %unit.channel, "channel not registered");
        return DeliveryResult::failure(
            recipient.clone(),
            unit.channel.clone(),
            ErrorCode::InvalidConfig,
            format!("channel {} is not registered", unit.channel),
            0,
        );
    };
    let config = request.channel_configs.get(&unit.channel);

    if let Err(e) = channel.validate_config(config) {
        warn!(channel = %unit.channel, error = %e, "channel configuration rejected");
        return DeliveryResult::failure(recipient.clone(), unit.channel, e.error_code(), e.to_string(), 0);
    }

    let params = SendParams {
        delivery_id: &request.delivery_id,
        recipient,
        message: &message,
        config,
        cancel,
    };

    let mut attempts = 0;
    loop {
        attempts += 1;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => SendOutcome::cancelled(),
            outcome = channel.send(params) => outcome,
        };

        if outcome.success {
            debug!(channel = %unit.channel, target = %recipient.target, attempts, "unit delivered");
            return DeliveryResult::from_outcome(recipient.clone(), unit.channel, outcome, attempts);
        }

        let retryable = outcome.transient && attempts <= policy.max_retries && !cancel.is_cancelled();
        if !retryable {
            warn!(
                channel = %unit.channel,
                target = %recipient.target,
                attempts,
                code = ?outcome.error_code,
                error = outcome.error_message.as_deref().unwrap_or(""),
                "unit failed"
            );
            return DeliveryResult::from_outcome(recipient.clone(), unit.channel, outcome, attempts);
        }

        let delay = policy.backoff(attempts, outcome.retry_after);
        warn!(
            channel = %unit.channel,
            target = %recipient.target,
            attempt = attempts,
            max = policy.max_retries + 1,
            delay_ms = delay.as_millis() as u64,
            error = outcome.error_message.as_deref().unwrap_or(""),
            "transient send failure, retrying with backoff"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return DeliveryResult::from_outcome(
                    recipient.clone(),
                    unit.channel,
                    SendOutcome::cancelled(),
                    attempts,
                );
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy(1_000, 30_000);
        assert_eq!(p.backoff(1, None), Duration::from_secs(1));
        assert_eq!(p.backoff(2, None), Duration::from_secs(2));
        assert_eq!(p.backoff(3, None), Duration::from_secs(4));
        assert_eq!(p.backoff(5, None), Duration::from_secs(16));
        assert_eq!(p.backoff(6, None), Duration::from_secs(30));
        assert_eq!(p.backoff(40, None), Duration::from_secs(30));
    }

    #[test]
    fn retry_after_overrides_but_is_capped() {
        let p = policy(1_000, 30_000);
        assert_eq!(p.backoff(1, Some(Duration::from_secs(7))), Duration::from_secs(7));
        assert_eq!(p.backoff(1, Some(Duration::from_secs(120))), Duration::from_secs(30));
    }

    #[test]
    fn policy_from_config() {
        let p = RetryPolicy::from_config(&DeliveryConfig::default());
        assert_eq!(p.max_retries, 3);
        assert_eq!(p.base_delay, Duration::from_secs(1));
        assert_eq!(p.max_delay, Duration::from_secs(30));
    }
}
