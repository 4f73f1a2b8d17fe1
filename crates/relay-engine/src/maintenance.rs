//! Background channel maintenance: health probes and balance refresh.

use relay_core::{Channel, ChannelStatus, ChatCompletionRequest, ChatMessage, RelayError, RelayResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::RelayEngine;

/// Outcome of one probe sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Channels probed
    pub tested: usize,
    /// Channels auto-disabled by this sweep
    pub disabled: usize,
    /// Channels re-enabled by this sweep
    pub enabled: usize,
}

impl RelayEngine {
    /// Send a one-token chat through `channel` and record its response time
    pub async fn test_channel(&self, channel: &Channel) -> RelayResult<Duration> {
        let model = channel
            .test_model
            .clone()
            .filter(|m| !m.is_empty())
            .or_else(|| channel.models.iter().find(|m| !m.ends_with('*')).cloned())
            .ok_or_else(|| RelayError::channel_config(format!("channel #{} has no testable model", channel.id)))?;

        let adaptor = self.factory.create(channel)?;
        let chat = adaptor.chat().ok_or_else(|| RelayError::unsupported("chat completions"))?;
        let request = ChatCompletionRequest::builder()
            .model(adaptor.model_mapping(&model)?)
            .message(ChatMessage::user("hi"))
            .max_tokens(1)
            .build()?;

        let started = Instant::now();
        chat.chat_completion(&request).await?;
        let elapsed = started.elapsed();

        let millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.store.update_channel_response_time(channel.id, millis).await?;
        debug!(channel_id = channel.id, model = %model, millis, "Channel probe passed");
        Ok(elapsed)
    }

    /// Probe every channel that is not manually disabled.
    ///
    /// Enabled channels failing with a fatal upstream error are disabled;
    /// auto-disabled channels that pass are re-enabled when allowed.
    pub async fn sweep_channels(&self) -> RelayResult<SweepReport> {
        let mut report = SweepReport::default();
        for channel in self.store.list_channels().await? {
            if channel.status == ChannelStatus::ManuallyDisabled {
                continue;
            }
            report.tested += 1;
            let probe = self.test_channel(&channel).await.map(|_| ());

            match (&probe, channel.status) {
                (Err(RelayError::Upstream { status, error }), ChannelStatus::Enabled) => {
                    if self.health.report_failure(&channel, error, *status).await? {
                        self.selector.set_status(channel.id, ChannelStatus::AutoDisabled);
                        self.metrics.record_channel_disabled();
                        report.disabled += 1;
                    }
                }
                (_, ChannelStatus::AutoDisabled) => {
                    if self.health.report_probe(&channel, &probe).await? {
                        self.selector.set_status(channel.id, ChannelStatus::Enabled);
                        report.enabled += 1;
                    }
                }
                _ => {}
            }
            if let Err(e) = &probe {
                debug!(channel_id = channel.id, error = %e, "Channel probe failed");
            }
        }
        info!(
            tested = report.tested,
            disabled = report.disabled,
            enabled = report.enabled,
            "Channel sweep finished"
        );
        Ok(report)
    }

    /// Refresh stored balances for channels whose provider reports one
    pub async fn update_balances(&self) -> RelayResult<usize> {
        let mut updated = 0;
        for channel in self.store.list_channels().await? {
            if channel.status == ChannelStatus::ManuallyDisabled {
                continue;
            }
            let adaptor = match self.factory.create(&channel) {
                Ok(adaptor) => adaptor,
                Err(e) => {
                    warn!(channel_id = channel.id, error = %e, "Skipping balance refresh");
                    continue;
                }
            };
            let Some(balance) = adaptor.balance() else {
                continue;
            };
            match balance.balance().await {
                Ok(amount) => {
                    self.store.update_channel_balance(channel.id, amount).await?;
                    updated += 1;
                }
                Err(e) => warn!(channel_id = channel.id, error = %e, "Balance query failed"),
            }
        }
        Ok(updated)
    }
}

/// Run the probe and balance sweeps on their intervals
pub fn spawn_maintenance(
    engine: Arc<RelayEngine>,
    test_interval: Option<Duration>,
    balance_interval: Option<Duration>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    if let Some(period) = test_interval {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = engine.sweep_channels().await {
                    warn!(error = %e, "Channel sweep failed");
                }
            }
        }));
    }

    if let Some(period) = balance_interval {
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match engine.update_balances().await {
                    Ok(updated) => debug!(updated, "Channel balances refreshed"),
                    Err(e) => warn!(error = %e, "Balance refresh failed"),
                }
            }
        }));
    }

    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, openai_channel};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ok_body() -> serde_json::Value {
        json!({
            "id": "x", "object": "chat.completion", "created": 1, "model": "gpt-3.5-turbo",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "h"}, "finish_reason": "length"}],
            "usage": {"prompt_tokens": 8, "completion_tokens": 1, "total_tokens": 9}
        })
    }

    #[tokio::test]
    async fn test_probe_sends_one_token_chat() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/c1/v1/chat/completions"))
            .and(body_partial_json(json!({"model": "gpt-3.5-turbo", "max_tokens": 1})))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .expect(1)
            .mount(&server)
            .await;
        let h = harness(vec![openai_channel(1, &server.uri())], 0).await;
        let channel = h.engine.selector().channel(1).unwrap();

        h.engine.test_channel(&channel).await.unwrap();
        assert!(h.store.usage_logs().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_disables_and_reenables() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/c1/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"message": "Incorrect API key provided", "type": "invalid_request_error", "code": "invalid_api_key"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/c2/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .mount(&server)
            .await;
        let channels = vec![
            openai_channel(1, &server.uri()),
            openai_channel(2, &server.uri()).with_status(ChannelStatus::AutoDisabled),
            openai_channel(3, &server.uri()).with_status(ChannelStatus::ManuallyDisabled),
        ];
        let h = harness(channels, 0).await;

        let report = h.engine.sweep_channels().await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                tested: 2,
                disabled: 1,
                enabled: 1
            }
        );
        assert_eq!(h.store.channel_status(1), Some(ChannelStatus::AutoDisabled));
        assert_eq!(h.store.channel_status(2), Some(ChannelStatus::Enabled));
        assert_eq!(h.store.channel_status(3), Some(ChannelStatus::ManuallyDisabled));
        assert_eq!(h.engine.selector().channel(2).unwrap().status, ChannelStatus::Enabled);
    }
}
