//! Channel health: fatal error classification and persisted status changes.

use relay_core::{Channel, ChannelStatus, Datastore, Notifier, OpenAIError, RelayResult};
use std::sync::Arc;
use tracing::{info, warn};

const FATAL_TYPES: &[&str] = &[
    "insufficient_quota",
    "authentication_error",
    "permission_error",
    "forbidden",
];

const FATAL_CODES: &[&str] = &["invalid_api_key", "account_deactivated"];

const FATAL_PREFIXES: &[&str] = &[
    "Your credit balance is too low",
    "This organization has been disabled.",
];

const FATAL_FRAGMENTS: &[&str] = &["credit", "balance", "Access denied"];

/// Whether an upstream failure means the channel credentials are unusable.
///
/// Rate limiting and transient failures never qualify; they are cooled down.
#[must_use]
pub fn should_disable_channel(error: &OpenAIError, status: u16) -> bool {
    if status == 401 {
        return true;
    }
    if FATAL_TYPES.contains(&error.error_type.as_str()) {
        return true;
    }
    if FATAL_CODES.contains(&error.code_str()) {
        return true;
    }
    has_fatal_message(&error.message)
}

fn has_fatal_message(message: &str) -> bool {
    FATAL_PREFIXES.iter().any(|p| message.starts_with(p))
        || FATAL_FRAGMENTS.iter().any(|f| message.contains(f))
}

/// Whether a probe result allows a disabled channel back into rotation
#[must_use]
pub fn should_enable_channel(probe: &RelayResult<()>) -> bool {
    probe.is_ok()
}

/// Channel health switches
#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    /// Disable channels on fatal errors
    pub automatic_disable: bool,
    /// Re-enable auto-disabled channels whose probe succeeds
    pub automatic_enable: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            automatic_disable: true,
            automatic_enable: false,
        }
    }
}

/// Applies health decisions to the datastore and notifies operators
#[derive(Clone)]
pub struct ChannelHealth {
    store: Arc<dyn Datastore>,
    notifier: Arc<dyn Notifier>,
    config: HealthConfig,
}

impl ChannelHealth {
    /// Create a health manager
    #[must_use]
    pub fn new(store: Arc<dyn Datastore>, notifier: Arc<dyn Notifier>, config: HealthConfig) -> Self {
        Self {
            store,
            notifier,
            config,
        }
    }

    /// Health switches
    #[must_use]
    pub fn config(&self) -> HealthConfig {
        self.config
    }

    /// Disable `channel` if `error` is fatal and automatic disabling is on.
    ///
    /// Returns whether the channel transitioned to auto-disabled. Disabling is
    /// idempotent; only the transition sends a notification.
    pub async fn report_failure(&self, channel: &Channel, error: &OpenAIError, status: u16) -> RelayResult<bool> {
        if !self.config.automatic_disable || !should_disable_channel(error, status) {
            return Ok(false);
        }
        self.disable(channel, &error.message).await
    }

    /// Mark `channel` auto-disabled and notify on transition
    pub async fn disable(&self, channel: &Channel, reason: &str) -> RelayResult<bool> {
        let changed = self
            .store
            .update_channel_status(channel.id, ChannelStatus::AutoDisabled)
            .await?;
        if changed {
            warn!(channel_id = channel.id, channel = %channel.name, reason = %reason, "Channel disabled");
            let subject = format!("Channel \"{}\" (#{}) has been disabled", channel.name, channel.id);
            let body = format!(
                "Channel \"{}\" (#{}) has been disabled, reason: {reason}",
                channel.name, channel.id
            );
            self.notify_detached(subject, body);
        }
        Ok(changed)
    }

    /// Re-enable an auto-disabled channel whose probe succeeded.
    ///
    /// Manually disabled channels are never touched.
    pub async fn report_probe(&self, channel: &Channel, probe: &RelayResult<()>) -> RelayResult<bool> {
        if !self.config.automatic_enable
            || channel.status != ChannelStatus::AutoDisabled
            || !should_enable_channel(probe)
        {
            return Ok(false);
        }
        let changed = self
            .store
            .update_channel_status(channel.id, ChannelStatus::Enabled)
            .await?;
        if changed {
            info!(channel_id = channel.id, channel = %channel.name, "Channel re-enabled");
            let subject = format!("Channel \"{}\" (#{}) has been enabled", channel.name, channel.id);
            let body = format!("Channel \"{}\" (#{}) passed its health probe", channel.name, channel.id);
            self.notify_detached(subject, body);
        }
        Ok(changed)
    }

    fn notify_detached(&self, subject: String, body: String) {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&subject, &body).await {
                warn!(error = %e, "Failed to send channel notification");
            }
        });
    }
}

impl std::fmt::Debug for ChannelHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHealth")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
