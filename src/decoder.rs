use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, trace};

/// Every server-sent event line starts with this marker.
pub const DATA_PREFIX: &str = "data: ";

/// The literal the server sends in place of JSON once generation is complete.
pub const DONE_MARKER: &str = "[DONE]";

/// Event stream fields other than `data` that may appear between events.
const IGNORED_FIELDS: [&str; 3] = ["event", "id", "retry"];

/// Payloads shorter than this (in characters) are checked for `DONE_MARKER`.
pub const DONE_LENGTH_THRESHOLD: usize = 10;

/// A single generated token along with the natural-log probability the model assigned to it.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenEvent {
    pub token: String,
    pub logprob: f64,
}

impl TokenEvent {
    pub fn new(token: impl Into<String>, logprob: f64) -> Self {
        TokenEvent {
            token: token.into(),
            logprob,
        }
    }

    /// The linear probability, `exp(logprob)`.
    pub fn probability(&self) -> f64 {
        self.logprob.exp()
    }
}

/// The outcome of feeding one chunk to the decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Zero or more tokens, in generation order.
    Tokens(Vec<TokenEvent>),

    /// The server signalled the end of the stream. Nothing follows this.
    Done,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("stream chunk is missing the 'data: ' prefix: {raw}")]
    MissingPrefix { raw: String },

    #[error("failed to parse JSON: {source}\nRaw chunk: {raw}")]
    Json {
        raw: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unexpected completion shape ({reason})\nRaw chunk: {raw}")]
    Shape { raw: String, reason: String },

    #[error("expected exactly one token per top_logprobs entry, found {entries}\nRaw chunk: {raw}")]
    Cardinality { raw: String, entries: usize },

    #[error("API request failed with code {code:?}: {message}\nRaw chunk: {raw}")]
    Api {
        raw: String,
        code: Option<serde_json::Value>,
        message: String,
    },
}

impl DecodeError {
    /// The chunk text exactly as it was handed to the decoder.
    pub fn raw(&self) -> &str {
        match self {
            DecodeError::MissingPrefix { raw }
            | DecodeError::Json { raw, .. }
            | DecodeError::Shape { raw, .. }
            | DecodeError::Cardinality { raw, .. }
            | DecodeError::Api { raw, .. } => raw,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    logprobs: Option<Logprobs>,
}

#[derive(Debug, Deserialize)]
struct Logprobs {
    top_logprobs: Option<Vec<HashMap<String, f64>>>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponseContainer {
    error: ErrorResponse,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    message: String,
    // some providers send a number here, others a string
    code: Option<serde_json::Value>,
}

/// `StreamDecoder` turns the text chunks of a streaming completion response into `TokenEvent`s.
///
/// Each chunk must hold one complete event: the `DATA_PREFIX` followed by either a JSON
/// completion object or the `DONE_MARKER`. Once the marker has been seen the decoder latches
/// and reports `Decoded::Done` for anything else it is given.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    finished: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        StreamDecoder::default()
    }

    /// Returns true once the termination marker has been decoded.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Decodes a single chunk.
    ///
    /// # Returns
    /// - `Decoded::Tokens` with the chunk's tokens in the order they appear in `top_logprobs`.
    ///   Empty chunks, event stream comments and `event`/`id`/`retry` lines produce an empty list.
    /// - `Decoded::Done` if the chunk is the short termination marker, or if the stream was
    ///   already finished.
    /// - `DecodeError` for anything malformed; nothing is emitted for that chunk.
    pub fn decode(&mut self, chunk: &str) -> Result<Decoded, DecodeError> {
        if self.finished {
            trace!("ignoring chunk received after end of stream");
            return Ok(Decoded::Done);
        }

        if chunk.trim().is_empty() || is_ignored_field(chunk) {
            return Ok(Decoded::Tokens(Vec::new()));
        }

        let Some(text) = chunk.strip_prefix(DATA_PREFIX) else {
            return Err(DecodeError::MissingPrefix {
                raw: chunk.to_string(),
            });
        };

        // Only short payloads are treated as the end marker; a longer one is assumed to be JSON.
        if text.chars().count() < DONE_LENGTH_THRESHOLD && text.contains(DONE_MARKER) {
            debug!("end of stream marker received");
            self.finished = true;
            return Ok(Decoded::Done);
        }

        let parsed = match serde_json::from_str::<CompletionChunk>(text) {
            Ok(parsed) => parsed,
            Err(e) => {
                return Err(match serde_json::from_str::<ErrorResponseContainer>(text) {
                    Ok(container) => DecodeError::Api {
                        raw: chunk.to_string(),
                        code: container.error.code,
                        message: container.error.message,
                    },
                    Err(_) => DecodeError::Json {
                        raw: chunk.to_string(),
                        source: e,
                    },
                });
            }
        };

        let shape_error = |reason: &str| DecodeError::Shape {
            raw: chunk.to_string(),
            reason: reason.to_string(),
        };

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| shape_error("no completion choices"))?;
        let top_logprobs = choice
            .logprobs
            .ok_or_else(|| shape_error("choice has no logprobs"))?
            .top_logprobs
            .ok_or_else(|| shape_error("logprobs has no top_logprobs"))?;

        let mut events = Vec::with_capacity(top_logprobs.len());
        for mapping in top_logprobs {
            if mapping.len() != 1 {
                return Err(DecodeError::Cardinality {
                    raw: chunk.to_string(),
                    entries: mapping.len(),
                });
            }
            if let Some((token, logprob)) = mapping.into_iter().next() {
                events.push(TokenEvent { token, logprob });
            }
        }

        trace!(count = events.len(), "decoded tokens from chunk");
        Ok(Decoded::Tokens(events))
    }
}

/// Server-sent event comments (`: keep-alive`) and the non-data fields carry nothing to decode.
fn is_ignored_field(chunk: &str) -> bool {
    match chunk.split_once(':') {
        Some(("", _)) => true,
        Some((name, _)) => IGNORED_FIELDS.contains(&name),
        None => false,
    }
}
