use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{Config, API_KEY_ENV_VAR};
use crate::decoder::{Decoded, StreamDecoder};
use crate::error::ConfigError;
use crate::lines::LineBuffer;
use crate::render::TokenSink;

/// The body of a streaming completion request.
///
/// The model is not part of the body; it selects the engine in the request URL.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(skip)]
    pub model: String,
    pub stream: bool,
    pub logprobs: u32,
}

impl CompletionRequest {
    pub fn new(
        prompt: impl Into<String>,
        temperature: f32,
        max_tokens: u32,
        model: impl Into<String>,
    ) -> Self {
        CompletionRequest {
            prompt: prompt.into(),
            max_tokens,
            temperature,
            model: model.into(),
            stream: true,
            logprobs: 1,
        }
    }
}

/// What happened over the course of one `generate` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationSummary {
    // number of tokens handed to the sink
    pub tokens: usize,

    // false if the body ended before the server sent the end of stream marker
    pub terminated: bool,
}

/// `ApiClient` talks to an OpenAI compatible engines completion endpoint.
///
/// The client streams the response, decodes every event with a `StreamDecoder` and
/// forwards each token to the `TokenSink` passed in by the caller.
pub struct ApiClient {
    // The base URL, without a trailing '/v1'
    api: String,

    // The bearer token sent with every request
    api_key: String,

    http: Client,
}

impl ApiClient {
    /// Creates a client for the API at `api`; an empty `api_key` is rejected.
    pub fn new(api: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ConfigError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ConfigError::MissingApiKey(API_KEY_ENV_VAR));
        }

        // no timeout is configured; a generation streams for as long as the server keeps sending
        Ok(ApiClient {
            api: api.into(),
            api_key,
            http: Client::new(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        ApiClient::new(&config.api, &config.api_key)
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "{}/v1/engines/{}/completions",
            self.api.trim_end_matches('/'),
            model
        )
    }

    /// Sends the completion request and streams the generated tokens into `sink`.
    ///
    /// The prompt is handed to the sink before the request goes out. Each line of the response
    /// body is one event for the decoder; as soon as the end of stream marker arrives the
    /// response is dropped and the connection released.
    ///
    /// # Returns:
    /// - `Result<GenerationSummary>`: Returns the summary if the stream was processed, or an Err
    ///   if the request failed, the server replied with a non-success status, the body could not
    ///   be read, an event could not be decoded, or the sink failed to write.
    pub async fn generate<S: TokenSink>(
        &self,
        request: &CompletionRequest,
        sink: &mut S,
    ) -> Result<GenerationSummary> {
        sink.prompt(&request.prompt)?;

        let url = self.endpoint(&request.model);
        debug!(
            %url,
            max_tokens = request.max_tokens,
            temperature = request.temperature,
            "sending completion request"
        );

        let mut response = self
            .http
            .post(url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(request)
            .send()
            .await?;
        if !response.status().is_success() {
            let error_message = format!(
                "API request failed with status {}: {}",
                response.status(),
                response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unable to read response body".to_string())
            );
            return Err(anyhow!(error_message));
        }

        let mut decoder = StreamDecoder::new();
        let mut summary = GenerationSummary {
            tokens: 0,
            terminated: false,
        };
        let mut lines = LineBuffer::new();

        while let Some(chunk) = response.chunk().await? {
            lines.extend(&chunk);

            // Process complete lines from the buffer
            while let Some(line) = lines.next_line()? {
                if feed_line(&mut decoder, line, sink, &mut summary)? {
                    summary.terminated = decoder.is_finished();
                    info!(tokens = summary.tokens, "generation finished");
                    return Ok(summary);
                }
            }
        }

        // the body may end without a trailing newline
        let rest = lines.remainder();
        if !rest.is_empty() && feed_line(&mut decoder, rest, sink, &mut summary)? {
            summary.terminated = decoder.is_finished();
            info!(tokens = summary.tokens, "generation finished");
            return Ok(summary);
        }

        warn!(
            tokens = summary.tokens,
            "response ended without an end of stream marker"
        );
        Ok(summary)
    }
}

/// Decodes one line of the response body and forwards its tokens to the sink.
/// Returns true once the stream has terminated.
fn feed_line<S: TokenSink>(
    decoder: &mut StreamDecoder,
    line: &[u8],
    sink: &mut S,
    summary: &mut GenerationSummary,
) -> Result<bool> {
    let line = std::str::from_utf8(line)
        .map_err(|e| anyhow!("stream line is not valid UTF-8: {}", e))?
        .trim_end_matches(['\r', '\n']);

    match decoder.decode(line)? {
        Decoded::Tokens(events) => {
            for event in &events {
                sink.token(event)?;
            }
            summary.tokens += events.len();
            Ok(false)
        }
        Decoded::Done => Ok(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{DecodeError, TokenEvent};
    use mockito::Matcher;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::io;

    #[derive(Debug, Default)]
    struct Recorder {
        prompt: Option<String>,
        events: Vec<TokenEvent>,
    }

    impl TokenSink for Recorder {
        fn prompt(&mut self, prompt: &str) -> io::Result<()> {
            self.prompt = Some(prompt.to_string());
            Ok(())
        }

        fn token(&mut self, event: &TokenEvent) -> io::Result<()> {
            self.events.push(event.clone());
            Ok(())
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new("Say hi", 0.7, 16, "davinci")
    }

    #[test]
    fn request_body_matches_wire_format() {
        let body = serde_json::to_value(request()).unwrap();
        assert_eq!(
            body,
            json!({
                "prompt": "Say hi",
                "max_tokens": 16,
                "temperature": 0.7f32,
                "stream": true,
                "logprobs": 1,
            })
        );
    }

    #[test]
    fn endpoint_includes_model() {
        let client = ApiClient::new("https://api.example.com/", "k").unwrap();
        assert_eq!(
            client.endpoint("curie"),
            "https://api.example.com/v1/engines/curie/completions"
        );
    }

    #[test]
    fn empty_api_key_is_rejected() {
        for key in ["", "  "] {
            let err = ApiClient::new("https://api.example.com", key).err().unwrap();
            assert!(matches!(err, ConfigError::MissingApiKey(API_KEY_ENV_VAR)));
        }
    }

    #[tokio::test]
    async fn streams_tokens_until_done() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/engines/davinci/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_header("content-type", "application/json")
            .match_body(Matcher::PartialJson(json!({
                "prompt": "Say hi",
                "stream": true,
                "logprobs": 1,
            })))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(concat!(
                "data: {\"choices\":[{\"logprobs\":{\"top_logprobs\":[{\"Hi\":-0.05}]}}]}\n\n",
                "data: [DONE]\n\n",
            ))
            .create_async()
            .await;

        let client = ApiClient::new(server.url(), "sk-test").unwrap();
        let mut recorder = Recorder::default();
        let summary = client.generate(&request(), &mut recorder).await.unwrap();

        mock.assert_async().await;
        assert_eq!(recorder.prompt.as_deref(), Some("Say hi"));
        assert_eq!(recorder.events, vec![TokenEvent::new("Hi", -0.05)]);
        assert_eq!(
            summary,
            GenerationSummary {
                tokens: 1,
                terminated: true
            }
        );
    }

    #[tokio::test]
    async fn events_after_done_are_ignored() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/engines/davinci/completions")
            .with_body(concat!(
                "data: {\"choices\":[{\"logprobs\":{\"top_logprobs\":[{\" a\":-0.1},{\" b\":-0.9}]}}]}\n",
                "data: [DONE]\n",
                "data: {\"choices\":[{\"logprobs\":{\"top_logprobs\":[{\" late\":-0.1}]}}]}\n",
            ))
            .create_async()
            .await;

        let client = ApiClient::new(server.url(), "k").unwrap();
        let mut recorder = Recorder::default();
        let summary = client.generate(&request(), &mut recorder).await.unwrap();

        let tokens: Vec<&str> = recorder.events.iter().map(|e| e.token.as_str()).collect();
        assert_eq!(tokens, vec![" a", " b"]);
        assert_eq!(summary.tokens, 2);
        assert!(summary.terminated);
    }

    #[tokio::test]
    async fn malformed_event_aborts_generation() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/engines/davinci/completions")
            .with_body(concat!(
                "data: {\"choices\":[{\"logprobs\":{\"top_logprobs\":[{\"ok\":-0.1}]}}]}\n",
                "data: {not json}\n",
                "data: [DONE]\n",
            ))
            .create_async()
            .await;

        let client = ApiClient::new(server.url(), "k").unwrap();
        let mut recorder = Recorder::default();
        let err = client.generate(&request(), &mut recorder).await.unwrap_err();

        let decode_err = err.downcast_ref::<DecodeError>().unwrap();
        assert_eq!(decode_err.raw(), "data: {not json}");
        assert_eq!(recorder.events, vec![TokenEvent::new("ok", -0.1)]);
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/engines/davinci/completions")
            .with_status(401)
            .with_body("{\"error\":{\"message\":\"Incorrect API key provided\"}}")
            .create_async()
            .await;

        let client = ApiClient::new(server.url(), "bad").unwrap();
        let mut recorder = Recorder::default();
        let err = client.generate(&request(), &mut recorder).await.unwrap_err();

        let message = err.to_string();
        assert!(message.contains("401"), "{message}");
        assert!(message.contains("Incorrect API key provided"), "{message}");
        assert!(recorder.events.is_empty());
    }

    #[tokio::test]
    async fn missing_done_marker_still_returns() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/engines/davinci/completions")
            .with_body("data: {\"choices\":[{\"logprobs\":{\"top_logprobs\":[{\"end\":-0.2}]}}]}")
            .create_async()
            .await;

        let client = ApiClient::new(server.url(), "k").unwrap();
        let mut recorder = Recorder::default();
        let summary = client.generate(&request(), &mut recorder).await.unwrap();

        assert_eq!(recorder.events, vec![TokenEvent::new("end", -0.2)]);
        assert_eq!(
            summary,
            GenerationSummary {
                tokens: 1,
                terminated: false
            }
        );
    }

    #[tokio::test]
    async fn comment_and_event_lines_are_skipped() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/engines/davinci/completions")
            .with_body(concat!(
                ": OPENROUTER PROCESSING\n\n",
                "event: completion\n",
                "data: {\"choices\":[{\"logprobs\":{\"top_logprobs\":[{\"Hey\":-0.3}]}}]}\n\n",
                ": keep-alive\n",
                "data: [DONE]\n\n",
            ))
            .create_async()
            .await;

        let client = ApiClient::new(server.url(), "k").unwrap();
        let mut recorder = Recorder::default();
        let summary = client.generate(&request(), &mut recorder).await.unwrap();

        assert_eq!(recorder.events, vec![TokenEvent::new("Hey", -0.3)]);
        assert!(summary.terminated);
    }

    #[tokio::test]
    async fn endless_line_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let huge = format!("data: {}", "x".repeat(crate::lines::MAX_LINE_BYTES + 1));
        server
            .mock("POST", "/v1/engines/davinci/completions")
            .with_body(huge)
            .create_async()
            .await;

        let client = ApiClient::new(server.url(), "k").unwrap();
        let mut recorder = Recorder::default();
        let err = client.generate(&request(), &mut recorder).await.unwrap_err();

        assert!(err.to_string().contains("without a newline"), "{err}");
        assert!(recorder.events.is_empty());
    }
}
