//! Chat and legacy completion relays.

use bytes::Bytes;
use relay_core::{
    Adaptor, ChatCompletionRequest, ChatCompletionResponse, CompletionRequest, CompletionResponse,
    RelayError, RelayResult, StreamChunk,
};
use relay_resilience::{fingerprint, CachedResponse};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;

use crate::context::{RelayContext, RelayKind};
use crate::engine::{Attempted, RelayEngine, Route};
use crate::stream::{metered_sse, CacheSlot, PrimedStream, SseStream, StreamMeter};
use crate::usage::reconcile_usage;

/// Relayed chat or completion output
pub enum RelayOutput {
    /// Complete JSON body
    Json(Bytes),
    /// SSE frames, ending with `[DONE]` on a clean finish
    Stream(SseStream),
}

impl std::fmt::Debug for RelayOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(body) => f.debug_tuple("Json").field(&body.len()).finish(),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl RelayEngine {
    /// Relay `POST /v1/chat/completions`
    pub async fn chat(&self, ctx: &RelayContext, request: ChatCompletionRequest) -> RelayResult<RelayOutput> {
        request.validate()?;
        let cache_key = self.cache_key(ctx, &request)?;
        if let Some(hit) = self.replay(cache_key.as_deref()).await {
            return Ok(hit);
        }

        let prompt_tokens = self.counter.count_messages(&request.messages, &request.model);
        let route = Route::new(RelayKind::Chat, &request.model).with_tools(request.has_tools());

        if request.stream {
            let include_usage = request.include_usage();
            return self
                .relay_stream(ctx, &route, prompt_tokens, include_usage, cache_key, |adaptor, model| {
                    let mut upstream = request.clone();
                    upstream.model = model;
                    async move {
                        let chat = adaptor.chat().ok_or_else(|| RelayError::unsupported(RelayKind::Chat.action()))?;
                        PrimedStream::prime(chat.chat_completion_stream(&upstream).await?).await
                    }
                })
                .await;
        }

        let counter = Arc::clone(&self.counter);
        let attempted = self
            .relay_buffered(
                ctx,
                &route,
                prompt_tokens,
                |adaptor: Arc<dyn Adaptor>, model| {
                    let mut upstream = request.clone();
                    upstream.model = model;
                    async move {
                        let chat = adaptor.chat().ok_or_else(|| RelayError::unsupported(RelayKind::Chat.action()))?;
                        chat.chat_completion(&upstream).await
                    }
                },
                |response: &mut ChatCompletionResponse| {
                    response.model.clone_from(&route.model);
                    let usage = reconcile_usage(response.usage, prompt_tokens, || {
                        counter.count_text(&response.text(), &route.model)
                    });
                    response.usage = Some(usage);
                    usage
                },
            )
            .await?;
        let usage = attempted.value.usage.unwrap_or_default();
        self.finish_buffered(ctx, &route, cache_key, attempted, usage.prompt_tokens, usage.completion_tokens)
            .await
    }

    /// Relay `POST /v1/completions`
    pub async fn completion(&self, ctx: &RelayContext, request: CompletionRequest) -> RelayResult<RelayOutput> {
        request.validate()?;
        let cache_key = self.cache_key(ctx, &request)?;
        if let Some(hit) = self.replay(cache_key.as_deref()).await {
            return Ok(hit);
        }

        let prompt_tokens = self.counter.count_text(&request.prompt_text(), &request.model);
        let route = Route::new(RelayKind::Completion, &request.model);

        if request.stream {
            let include_usage = request.include_usage();
            return self
                .relay_stream(ctx, &route, prompt_tokens, include_usage, cache_key, |adaptor, model| {
                    let mut upstream = request.clone();
                    upstream.model = model;
                    async move {
                        let completion = adaptor
                            .completion()
                            .ok_or_else(|| RelayError::unsupported(RelayKind::Completion.action()))?;
                        PrimedStream::prime(completion.completion_stream(&upstream).await?).await
                    }
                })
                .await;
        }

        let counter = Arc::clone(&self.counter);
        let attempted = self
            .relay_buffered(
                ctx,
                &route,
                prompt_tokens,
                |adaptor: Arc<dyn Adaptor>, model| {
                    let mut upstream = request.clone();
                    upstream.model = model;
                    async move {
                        let completion = adaptor
                            .completion()
                            .ok_or_else(|| RelayError::unsupported(RelayKind::Completion.action()))?;
                        completion.completion(&upstream).await
                    }
                },
                |response: &mut CompletionResponse| {
                    response.model.clone_from(&route.model);
                    let usage = reconcile_usage(response.usage, prompt_tokens, || {
                        counter.count_text(&response.delta_text(), &route.model)
                    });
                    response.usage = Some(usage);
                    usage
                },
            )
            .await?;
        let usage = attempted.value.usage.unwrap_or_default();
        self.finish_buffered(ctx, &route, cache_key, attempted, usage.prompt_tokens, usage.completion_tokens)
            .await
    }

    /// Cache key when both the relay and the token opt in
    fn cache_key<R: Serialize>(&self, ctx: &RelayContext, request: &R) -> RelayResult<Option<String>> {
        if !self.cache.is_enabled() || !ctx.token.chat_cache {
            return Ok(None);
        }
        let normalized = serde_json::to_string(request).map_err(|e| RelayError::internal(e.to_string()))?;
        Ok(Some(fingerprint(ctx.token.user_id, ctx.token.id, &normalized)))
    }

    async fn replay(&self, key: Option<&str>) -> Option<RelayOutput> {
        let hit = self.cache.get(key?).await?;
        self.metrics.record_cache_hit();
        let body = Bytes::from(hit.response);
        Some(if hit.is_stream {
            RelayOutput::Stream(Box::pin(futures::stream::once(async move { body })))
        } else {
            RelayOutput::Json(body)
        })
    }

    async fn finish_buffered<T: Serialize>(
        &self,
        ctx: &RelayContext,
        route: &Route,
        cache_key: Option<String>,
        attempted: Attempted<T>,
        prompt_tokens: u32,
        completion_tokens: u32,
    ) -> RelayResult<RelayOutput> {
        let body = serde_json::to_vec(&attempted.value).map_err(|e| RelayError::internal(e.to_string()))?;
        if let Some(key) = cache_key {
            let entry = CachedResponse {
                user_id: ctx.token.user_id,
                token_id: ctx.token.id,
                channel_id: attempted.channel.id,
                model: route.model.clone(),
                prompt_tokens,
                completion_tokens,
                is_stream: false,
                response: String::from_utf8_lossy(&body).into_owned(),
            };
            self.cache.put(&key, &entry).await;
        }
        Ok(RelayOutput::Json(Bytes::from(body)))
    }

    async fn relay_stream<C, F, Fut>(
        &self,
        ctx: &RelayContext,
        route: &Route,
        prompt_tokens: u32,
        include_usage: bool,
        cache_key: Option<String>,
        invoke: F,
    ) -> RelayResult<RelayOutput>
    where
        C: StreamChunk,
        F: Fn(Arc<dyn Adaptor>, String) -> Fut,
        Fut: Future<Output = RelayResult<PrimedStream<C>>>,
    {
        let reservation = self.reserve(ctx, &route.model, prompt_tokens).await?;
        let attempted = match self.dispatch(ctx, route, invoke).await {
            Ok(attempted) => attempted,
            Err(e) => {
                self.refund(ctx, reservation).await;
                return Err(e);
            }
        };

        let meter = StreamMeter::new(
            reservation,
            ctx.request_id.clone(),
            attempted.channel.id,
            route.model.clone(),
            Arc::clone(&self.counter),
            Arc::clone(&self.metrics),
        );
        let slot = cache_key.map(|key| CacheSlot {
            cache: self.cache.clone(),
            key,
            user_id: ctx.token.user_id,
            token_id: ctx.token.id,
        });
        Ok(RelayOutput::Stream(metered_sse(attempted.value, meter, include_usage, slot)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{channel, chat_body, collect, harness, openai_channel, sse_body};
    use pretty_assertions::assert_eq;
    use relay_core::ChannelStatus;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chat_ok() -> serde_json::Value {
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-3.5-turbo",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hello!"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        })
    }

    fn json_body(output: RelayOutput) -> serde_json::Value {
        match output {
            RelayOutput::Json(body) => serde_json::from_slice(&body).unwrap(),
            RelayOutput::Stream(_) => panic!("expected a JSON body"),
        }
    }

    #[tokio::test]
    async fn test_buffered_chat_settles_true_cost() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/c1/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_ok()))
            .expect(1)
            .mount(&server)
            .await;
        let h = harness(vec![openai_channel(1, &server.uri())], 2).await;
        let ctx = RelayContext::new(h.token(1_000));

        let body = json_body(h.engine.chat(&ctx, chat_body(false)).await.unwrap());
        assert_eq!(body["choices"][0]["message"]["content"], "Hello!");

        // 10 * 0.75 + 5 * 1.0 = 12.5, rounded up
        assert_eq!(h.store.token_quota(1), Some(987));
        let logs = h.store.usage_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].quota, 13);
        assert_eq!(logs[0].channel_id, 1);
        assert_eq!(h.store.channel_used_quota(1), 13);
    }

    #[tokio::test]
    async fn test_failover_to_lower_priority_channel() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/c1/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "error": {"message": "upstream exploded", "type": "server_error"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/c2/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_ok()))
            .expect(1)
            .mount(&server)
            .await;
        let channels = vec![
            openai_channel(1, &server.uri()).with_priority(10),
            openai_channel(2, &server.uri()).with_priority(0),
        ];
        let h = harness(channels, 2).await;
        let ctx = RelayContext::new(h.token(1_000));

        h.engine.chat(&ctx, chat_body(false)).await.unwrap();

        assert_eq!(h.store.channel_status(1), Some(ChannelStatus::Enabled));
        assert!(h.engine.selector().is_cooling_down(1));
        assert_eq!(h.store.usage_logs()[0].channel_id, 2);
        assert_eq!(h.store.token_quota(1), Some(987));
    }

    #[tokio::test]
    async fn test_retry_budget_bounds_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "error": {"message": "down", "type": "server_error"}
            })))
            .expect(2)
            .mount(&server)
            .await;
        let channels = (1..=3).map(|id| openai_channel(id, &server.uri())).collect();
        let h = harness(channels, 1).await;
        let ctx = RelayContext::new(h.token(1_000));

        let err = h.engine.chat(&ctx, chat_body(false)).await.unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert_eq!(h.store.token_quota(1), Some(1_000));
        assert!(h.store.usage_logs().is_empty());
    }

    #[tokio::test]
    async fn test_fatal_error_disables_channel_and_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/c1/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"message": "Incorrect API key provided", "type": "invalid_request_error", "code": "invalid_api_key"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/c2/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_ok()))
            .expect(1)
            .mount(&server)
            .await;
        let channels = vec![
            openai_channel(1, &server.uri()).with_priority(10),
            openai_channel(2, &server.uri()),
        ];
        let h = harness(channels, 2).await;
        let ctx = RelayContext::new(h.token(1_000));

        h.engine.chat(&ctx, chat_body(false)).await.unwrap();

        assert_eq!(h.store.channel_status(1), Some(ChannelStatus::AutoDisabled));
        let cached = h.engine.selector().channel(1).unwrap();
        assert_eq!(cached.status, ChannelStatus::AutoDisabled);
    }

    #[tokio::test]
    async fn test_bad_request_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"message": "messages is too long", "type": "invalid_request_error", "param": "messages"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        let channels = vec![openai_channel(1, &server.uri()), openai_channel(2, &server.uri())];
        let h = harness(channels, 3).await;
        let ctx = RelayContext::new(h.token(1_000));

        let err = h.engine.chat(&ctx, chat_body(false)).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.to_string(), "messages is too long");
        assert!(!h.engine.selector().is_cooling_down(1));
        assert!(!h.engine.selector().is_cooling_down(2));
        assert_eq!(h.store.token_quota(1), Some(1_000));
    }

    #[tokio::test]
    async fn test_cached_response_replayed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_ok()))
            .expect(1)
            .mount(&server)
            .await;
        let h = harness(vec![openai_channel(1, &server.uri())], 0).await;
        let mut token = h.token(1_000);
        token.chat_cache = true;
        let ctx = RelayContext::new(token);

        let RelayOutput::Json(first) = h.engine.chat(&ctx, chat_body(false)).await.unwrap() else {
            panic!("expected JSON");
        };
        let RelayOutput::Json(second) = h.engine.chat(&ctx, chat_body(false)).await.unwrap() else {
            panic!("expected JSON");
        };
        assert_eq!(first, second);
        assert_eq!(h.store.usage_logs().len(), 1);
        assert_eq!(h.store.token_quota(1), Some(987));
    }

    #[tokio::test]
    async fn test_stream_frames_and_settlement() {
        let server = MockServer::start().await;
        let body = sse_body(&[
            json!({"id": "c", "object": "chat.completion.chunk", "created": 1, "model": "gpt-3.5-turbo",
                   "choices": [{"index": 0, "delta": {"content": "Hel"}, "finish_reason": null}]}),
            json!({"id": "c", "object": "chat.completion.chunk", "created": 1, "model": "gpt-3.5-turbo",
                   "choices": [{"index": 0, "delta": {"content": "lo"}, "finish_reason": "stop"}]}),
            json!({"id": "c", "object": "chat.completion.chunk", "created": 1, "model": "gpt-3.5-turbo",
                   "choices": [], "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}}),
        ]);
        Mock::given(method("POST"))
            .and(path("/c1/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;
        let h = harness(vec![openai_channel(1, &server.uri())], 0).await;
        let ctx = RelayContext::new(h.token(1_000));

        let RelayOutput::Stream(stream) = h.engine.chat(&ctx, chat_body(true)).await.unwrap() else {
            panic!("expected a stream");
        };
        let text = collect(stream).await;
        let frames: Vec<&str> = text.split("\n\n").filter(|f| !f.is_empty()).collect();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].contains("\"Hel\""));
        assert!(!text.contains("\"usage\""));
        assert_eq!(frames[2], "data: [DONE]");

        assert_eq!(h.store.token_quota(1), Some(987));
        let logs = h.store.usage_logs();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].is_stream);
    }

    #[tokio::test]
    async fn test_include_usage_synthesizes_usage_chunk() {
        let server = MockServer::start().await;
        let body = sse_body(&[json!({"id": "c", "object": "chat.completion.chunk", "created": 1, "model": "gpt-3.5-turbo",
            "choices": [{"index": 0, "delta": {"content": "Hello there"}, "finish_reason": "stop"}]})]);
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;
        let h = harness(
            vec![channel(1, &server.uri(), relay_core::ProviderType::Custom)],
            0,
        )
        .await;
        let ctx = RelayContext::new(h.token(1_000));
        let mut request = chat_body(true);
        request.stream_options = Some(relay_core::StreamOptions { include_usage: true });

        let RelayOutput::Stream(stream) = h.engine.chat(&ctx, request).await.unwrap() else {
            panic!("expected a stream");
        };
        let text = collect(stream).await;
        let frames: Vec<&str> = text.split("\n\n").filter(|f| !f.is_empty()).collect();
        assert_eq!(frames.len(), 3);
        let usage: serde_json::Value = serde_json::from_str(frames[1].trim_start_matches("data: ")).unwrap();
        assert_eq!(usage["choices"], json!([]));
        assert_eq!(usage["usage"]["completion_tokens"], 3);
        assert_eq!(frames[2], "data: [DONE]");
    }

    #[tokio::test]
    async fn test_mapped_model_sent_upstream_caller_model_billed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"model": "gpt-35-turbo-0613"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_ok()))
            .expect(1)
            .mount(&server)
            .await;
        let channel = openai_channel(1, &server.uri())
            .with_model_mapping(r#"{"gpt-3.5-turbo": "gpt-35-turbo-0613"}"#);
        let h = harness(vec![channel], 0).await;
        let ctx = RelayContext::new(h.token(1_000));

        h.engine.chat(&ctx, chat_body(false)).await.unwrap();
        assert_eq!(h.store.usage_logs()[0].model, "gpt-3.5-turbo");
    }

    #[tokio::test]
    async fn test_caller_model_restored_in_buffered_response() {
        let server = MockServer::start().await;
        let mut upstream = chat_ok();
        upstream["model"] = json!("gpt-35-turbo-0613");
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(upstream))
            .mount(&server)
            .await;
        let channel = openai_channel(1, &server.uri())
            .with_model_mapping(r#"{"gpt-3.5-turbo": "gpt-35-turbo-0613"}"#);
        let h = harness(vec![channel], 0).await;
        let ctx = RelayContext::new(h.token(1_000));

        let body = json_body(h.engine.chat(&ctx, chat_body(false)).await.unwrap());
        assert_eq!(body["model"], "gpt-3.5-turbo");
    }

    #[tokio::test]
    async fn test_caller_model_restored_in_stream_chunks() {
        let server = MockServer::start().await;
        let body = sse_body(&[
            json!({"id": "c", "object": "chat.completion.chunk", "created": 1, "model": "gpt-35-turbo-0613",
                   "choices": [{"index": 0, "delta": {"content": "Hi"}, "finish_reason": "stop"}]}),
        ]);
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;
        let channel = openai_channel(1, &server.uri())
            .with_model_mapping(r#"{"gpt-3.5-turbo": "gpt-35-turbo-0613"}"#);
        let h = harness(vec![channel], 0).await;
        let ctx = RelayContext::new(h.token(1_000));
        let mut request = chat_body(true);
        request.stream_options = Some(relay_core::StreamOptions { include_usage: true });

        let RelayOutput::Stream(stream) = h.engine.chat(&ctx, request).await.unwrap() else {
            panic!("expected a stream");
        };
        let text = collect(stream).await;
        assert!(!text.contains("gpt-35-turbo-0613"));
        let frames: Vec<serde_json::Value> = text
            .split("\n\n")
            .filter_map(|f| f.strip_prefix("data: "))
            .filter(|f| *f != "[DONE]")
            .map(|f| serde_json::from_str(f).unwrap())
            .collect();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f["model"] == "gpt-3.5-turbo"));
    }

    #[tokio::test]
    async fn test_unpriced_model_never_reaches_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_ok()))
            .expect(0)
            .mount(&server)
            .await;
        let channel = openai_channel(1, &server.uri()).with_models(["mystery-model"]);
        let h = harness(vec![channel], 0).await;
        let ctx = RelayContext::new(h.token(1_000));
        let mut request = chat_body(false);
        request.model = "mystery-model".to_string();

        let err = h.engine.chat(&ctx, request).await.unwrap_err();
        assert!(matches!(err, RelayError::PricingNotFound { .. }));
    }

    #[tokio::test]
    async fn test_insufficient_quota_never_reaches_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_ok()))
            .expect(0)
            .mount(&server)
            .await;
        let h = harness(vec![openai_channel(1, &server.uri())], 0).await;
        let ctx = RelayContext::new(h.token(1));

        let err = h.engine.chat(&ctx, chat_body(false)).await.unwrap_err();
        assert!(matches!(err, RelayError::QuotaExceeded { .. }));
        assert_eq!(h.store.token_quota(1), Some(1));
    }

    #[tokio::test]
    async fn test_pinned_request_does_not_fail_over() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/c2/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_json(json!({
                "error": {"message": "overloaded", "type": "server_error"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/c1/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_ok()))
            .expect(0)
            .mount(&server)
            .await;
        let channels = vec![openai_channel(1, &server.uri()), openai_channel(2, &server.uri())];
        let h = harness(channels, 3).await;
        let ctx = RelayContext::new(h.token(1_000)).with_pinned_channel(Some(2));

        let err = h.engine.chat(&ctx, chat_body(false)).await.unwrap_err();
        assert_eq!(err.status_code(), 503);
        assert_eq!(err.to_string(), "overloaded");
    }

    #[tokio::test]
    async fn test_completion_relay() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/c1/v1/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "cmpl-1", "object": "text_completion", "created": 1, "model": "gpt-3.5-turbo-instruct",
                "choices": [{"text": " world", "index": 0, "finish_reason": "stop"}]
            })))
            .expect(1)
            .mount(&server)
            .await;
        let channel = openai_channel(1, &server.uri()).with_models(["gpt-3.5-turbo-instruct"]);
        let h = harness(vec![channel], 0).await;
        let ctx = RelayContext::new(h.token(1_000));
        let request: CompletionRequest = serde_json::from_value(json!({
            "model": "gpt-3.5-turbo-instruct",
            "prompt": "hello"
        }))
        .unwrap();

        let body = json_body(h.engine.completion(&ctx, request).await.unwrap());
        // usage filled in from estimates: prompt 2, completion 2
        assert_eq!(body["usage"]["total_tokens"], 4);
        assert_eq!(h.store.usage_logs().len(), 1);
    }
}
