//! Safe Rust API: load a model, generate text, unload.
//!
//! [`LlamaModel`] owns one model and one context. Calls are serialized by an
//! internal mutex, so a `LlamaModel` can be shared across threads.
//!
//! ```no_run
//! use llama_bridge::api::{ContextParams, GenerateOptions, LlamaModel};
//!
//! let model = LlamaModel::load("model.gguf", ContextParams::default())?;
//! let text = model.generate("Once upon a time", &GenerateOptions::default())?;
//! println!("{}", text);
//! # Ok::<(), llama_bridge::BridgeError>(())
//! ```

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::config::available_threads;
use crate::engine::{EvalStatus, LoadedModel, SamplingConfig, Session};
use crate::error::BridgeError;

/// Context settings for [`LlamaModel::load`].
#[derive(Debug, Clone)]
pub struct ContextParams {
    pub n_ctx: usize,
    pub n_threads: usize,
    pub sampling: SamplingConfig,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 4096,
            n_threads: available_threads(),
            sampling: SamplingConfig::default(),
        }
    }
}

/// Limits for one generation call.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Upper bound on generated tokens.
    pub max_tokens: usize,
    /// Prompts that tokenize (BOS included) to more tokens are rejected.
    pub max_prompt_tokens: usize,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            max_prompt_tokens: 1024,
        }
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model produced its end-of-sequence token.
    Eos,
    /// `max_tokens` were generated.
    MaxTokens,
    /// Evaluating the next token failed or the context filled up.
    EvalStopped,
    /// The sampler had nothing to sample.
    NoToken,
    /// The streaming callback returned `false`.
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::Eos => "eos",
            StopReason::MaxTokens => "max_tokens",
            StopReason::EvalStopped => "eval_stopped",
            StopReason::NoToken => "no_token",
            StopReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Generated text plus bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutput {
    pub text: String,
    /// Generated ids, prompt excluded.
    pub token_ids: Vec<u32>,
    pub prompt_tokens: usize,
    pub stop_reason: StopReason,
}

/// A loaded model with its own context.
pub struct LlamaModel {
    session: Mutex<Option<Session>>,
}

impl fmt::Debug for LlamaModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlamaModel")
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl LlamaModel {
    pub fn load(path: impl AsRef<Path>, params: ContextParams) -> Result<Self, BridgeError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(BridgeError::ModelNotFound(path.display().to_string()));
        }
        let model = LoadedModel::load(path).map_err(|e| {
            error!(path = %path.display(), error = %e, "model load failed");
            BridgeError::ModelLoadFailed(e.to_string())
        })?;
        if params.n_ctx == 0 {
            return Err(BridgeError::ContextCreationFailed("n_ctx must be positive".into()));
        }
        let session = Session::new(Arc::new(model), params.n_ctx, params.n_threads.max(1), params.sampling)
            .map_err(|e| BridgeError::ContextCreationFailed(e.to_string()))?;
        info!(path = %path.display(), n_ctx = params.n_ctx, "LlamaModel ready");
        Ok(Self {
            session: Mutex::new(Some(session)),
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Release the model and context. Later calls return `InvalidState`.
    pub fn unload(&self) {
        if self.session.lock().take().is_some() {
            info!("LlamaModel unloaded");
        }
    }

    /// Tokenize with BOS, as `generate` does.
    pub fn tokenize(&self, text: &str) -> Result<Vec<u32>, BridgeError> {
        self.with_session(|s| Ok(s.model().tokenize(text, true)))
    }

    /// Piece text of a token, lossily decoded.
    pub fn token_to_piece(&self, token: u32) -> Result<String, BridgeError> {
        self.with_session(|s| {
            s.model()
                .token_bytes(token)
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .ok_or_else(|| BridgeError::InferenceFailed(format!("token {} out of range", token)))
        })
    }

    pub fn n_vocab(&self) -> Result<usize, BridgeError> {
        self.with_session(|s| Ok(s.model().n_vocab()))
    }

    pub fn n_ctx(&self) -> Result<usize, BridgeError> {
        self.with_session(|s| Ok(s.n_ctx()))
    }

    pub fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String, BridgeError> {
        self.generate_full(prompt, options).map(|o| o.text)
    }

    pub fn generate_full(&self, prompt: &str, options: &GenerateOptions) -> Result<GenerationOutput, BridgeError> {
        self.generate_stream(prompt, options, |_| true)
    }

    /// Generate, handing each non-empty piece to `callback` as it is
    /// produced. Returning `false` from the callback stops generation.
    ///
    /// Pieces are split on UTF-8 boundaries, so a character spread over
    /// several byte tokens arrives in one piece.
    pub fn generate_stream(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        mut callback: impl FnMut(&str) -> bool,
    ) -> Result<GenerationOutput, BridgeError> {
        self.with_session(|session| run_generation(session, prompt, options, &mut callback))
    }

    fn with_session<T>(&self, f: impl FnOnce(&mut Session) -> Result<T, BridgeError>) -> Result<T, BridgeError> {
        let mut guard = self.session.lock();
        let session = guard
            .as_mut()
            .ok_or_else(|| BridgeError::InvalidState("Model is not loaded".into()))?;
        f(session)
    }
}

fn run_generation(
    session: &mut Session,
    prompt: &str,
    options: &GenerateOptions,
    callback: &mut dyn FnMut(&str) -> bool,
) -> Result<GenerationOutput, BridgeError> {
    let model = Arc::clone(session.model());
    let prompt_ids = model.tokenize(prompt, true);
    if prompt_ids.is_empty() || prompt_ids.len() > options.max_prompt_tokens {
        return Err(BridgeError::InferenceFailed(format!(
            "Failed to tokenize prompt or too many tokens ({} tokens, limit {})",
            prompt_ids.len(),
            options.max_prompt_tokens
        )));
    }

    session.clear();
    let status = session.eval(&prompt_ids, 0);
    if status != EvalStatus::Ok {
        return Err(BridgeError::InferenceFailed(format!(
            "Failed to evaluate tokens: {}",
            status.as_code()
        )));
    }

    let eos = model.eos();
    let mut n_past = prompt_ids.len();
    let mut token_ids = Vec::new();
    let mut text = Utf8Stream::default();
    let mut stop_reason = StopReason::MaxTokens;

    for _ in 0..options.max_tokens {
        let Some(token) = session.sample() else {
            stop_reason = StopReason::NoToken;
            break;
        };
        if Some(token) == eos {
            debug!("EOS token received, stopping generation");
            stop_reason = StopReason::Eos;
            break;
        }
        token_ids.push(token);

        let piece = text.push(model.token_bytes(token).unwrap_or_default());
        if !piece.is_empty() && !callback(&piece) {
            stop_reason = StopReason::Cancelled;
            break;
        }

        let status = session.eval(&[token], n_past);
        if status != EvalStatus::Ok {
            if status.as_code() < 0 {
                error!(code = status.as_code(), "evaluation failed during generation");
            }
            stop_reason = StopReason::EvalStopped;
            break;
        }
        n_past += 1;
    }

    let text = close_stream(text, stop_reason, callback);

    debug!(generated = token_ids.len(), %stop_reason, "generation finished");
    Ok(GenerationOutput {
        text,
        token_ids,
        prompt_tokens: prompt_ids.len(),
        stop_reason,
    })
}

/// Final text of a generation. An unfinished UTF-8 sequence is flushed to
/// the callback as U+FFFD, unless the callback cancelled, in which case it
/// is dropped so the text matches what the callback received.
fn close_stream(
    mut text: Utf8Stream,
    stop_reason: StopReason,
    callback: &mut dyn FnMut(&str) -> bool,
) -> String {
    if stop_reason == StopReason::Cancelled {
        text.discard();
    } else {
        let tail = text.finish();
        if !tail.is_empty() {
            callback(&tail);
        }
    }
    text.into_string()
}

/// Reassembles UTF-8 text from token bytes that may split characters.
#[derive(Default)]
struct Utf8Stream {
    pending: Vec<u8>,
    out: String,
}

impl Utf8Stream {
    /// Add bytes; returns the newly completed text.
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut emitted = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    emitted.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    emitted.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                        Some(bad) => {
                            emitted.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                    }
                }
            }
        }
        self.out.push_str(&emitted);
        emitted
    }

    /// Flush an unfinished sequence as a replacement character.
    fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        self.pending.clear();
        let tail = char::REPLACEMENT_CHARACTER.to_string();
        self.out.push_str(&tail);
        tail
    }

    /// Drop an unfinished sequence.
    fn discard(&mut self) {
        self.pending.clear();
    }

    fn into_string(self) -> String {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{tiny_llama, BOS_ID};

    fn load(dir: &tempfile::TempDir) -> LlamaModel {
        let path = tiny_llama(dir.path());
        let params = ContextParams {
            n_ctx: 32,
            n_threads: 1,
            ..ContextParams::default()
        };
        LlamaModel::load(&path, params).unwrap()
    }

    #[test]
    fn test_defaults() {
        let params = ContextParams::default();
        assert_eq!(params.n_ctx, 4096);
        assert!(params.n_threads >= 1);
        let options = GenerateOptions::default();
        assert_eq!(options.max_tokens, 512);
        assert_eq!(options.max_prompt_tokens, 1024);
    }

    #[test]
    fn test_model_not_found() {
        let err = LlamaModel::load("/nonexistent/model.gguf", ContextParams::default()).unwrap_err();
        assert_eq!(err.to_string(), "Model file not found at: /nonexistent/model.gguf");
    }

    #[test]
    fn test_load_failed_on_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.gguf");
        std::fs::write(&path, b"garbage").unwrap();
        let err = LlamaModel::load(&path, ContextParams::default()).unwrap_err();
        assert!(matches!(err, BridgeError::ModelLoadFailed(_)), "{:?}", err);
    }

    #[test]
    fn test_zero_ctx() {
        let dir = tempfile::tempdir().unwrap();
        let path = tiny_llama(dir.path());
        let params = ContextParams {
            n_ctx: 0,
            ..ContextParams::default()
        };
        let err = LlamaModel::load(&path, params).unwrap_err();
        assert!(matches!(err, BridgeError::ContextCreationFailed(_)));
    }

    #[test]
    fn test_ctx_too_large_to_allocate() {
        let dir = tempfile::tempdir().unwrap();
        let path = tiny_llama(dir.path());
        let params = ContextParams {
            n_ctx: usize::MAX / 2,
            ..ContextParams::default()
        };
        let err = LlamaModel::load(&path, params).unwrap_err();
        assert!(matches!(err, BridgeError::ContextCreationFailed(_)), "{:?}", err);
    }

    #[test]
    fn test_generate_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let model = load(&dir);
        let options = GenerateOptions {
            max_tokens: 8,
            ..GenerateOptions::default()
        };
        let a = model.generate_full("hello", &options).unwrap();
        let b = model.generate_full("hello", &options).unwrap();
        assert_eq!(a.token_ids, b.token_ids);
        assert_eq!(a.text, b.text);
        assert_eq!(a.prompt_tokens, 2);
        assert!(a.token_ids.len() <= 8);
        if a.stop_reason == StopReason::MaxTokens {
            assert_eq!(a.token_ids.len(), 8);
        }
    }

    #[test]
    fn test_stream_matches_generate() {
        let dir = tempfile::tempdir().unwrap();
        let model = load(&dir);
        let options = GenerateOptions {
            max_tokens: 6,
            ..GenerateOptions::default()
        };
        let mut streamed = String::new();
        let out = model
            .generate_stream("hello world", &options, |piece| {
                streamed.push_str(piece);
                true
            })
            .unwrap();
        assert_eq!(streamed, out.text);
        assert_eq!(model.generate("hello world", &options).unwrap(), out.text);
    }

    #[test]
    fn test_stream_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let model = load(&dir);
        let mut calls = 0;
        let out = model
            .generate_stream("hello", &GenerateOptions::default(), |_| {
                calls += 1;
                false
            })
            .unwrap();
        assert!(calls <= 1);
        if out.stop_reason == StopReason::Cancelled {
            assert_eq!(calls, 1);
            assert_eq!(out.token_ids.len(), 1);
        }
    }

    #[test]
    fn test_prompt_too_long() {
        let dir = tempfile::tempdir().unwrap();
        let model = load(&dir);
        let options = GenerateOptions {
            max_tokens: 4,
            max_prompt_tokens: 2,
        };
        let err = model.generate("hello world hello", &options).unwrap_err();
        assert!(matches!(err, BridgeError::InferenceFailed(_)));
    }

    #[test]
    fn test_prompt_larger_than_context() {
        let dir = tempfile::tempdir().unwrap();
        let path = tiny_llama(dir.path());
        let params = ContextParams {
            n_ctx: 2,
            n_threads: 1,
            ..ContextParams::default()
        };
        let model = LlamaModel::load(&path, params).unwrap();
        let err = model.generate("hello world hello", &GenerateOptions::default()).unwrap_err();
        assert_eq!(err.to_string(), "Inference failed: Failed to evaluate tokens: 1");
    }

    #[test]
    fn test_generation_stops_at_context_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = tiny_llama(dir.path());
        let params = ContextParams {
            n_ctx: 4,
            n_threads: 1,
            ..ContextParams::default()
        };
        let model = LlamaModel::load(&path, params).unwrap();
        let out = model.generate_full("hello", &GenerateOptions::default()).unwrap();
        // Two prompt tokens leave room for two more evals.
        assert!(out.token_ids.len() <= 3);
        assert!(matches!(out.stop_reason, StopReason::EvalStopped | StopReason::Eos));
    }

    #[test]
    fn test_unload() {
        let dir = tempfile::tempdir().unwrap();
        let model = load(&dir);
        assert!(model.is_loaded());
        assert_eq!(model.tokenize("hello").unwrap()[0], BOS_ID);
        model.unload();
        assert!(!model.is_loaded());
        let err = model.generate("hello", &GenerateOptions::default()).unwrap_err();
        assert_eq!(err.to_string(), "Invalid state: Model is not loaded");
        model.unload();
    }

    #[test]
    fn test_utf8_stream() {
        let mut s = Utf8Stream::default();
        assert_eq!(s.push(b" h"), " h");
        assert_eq!(s.push(&[0xC3]), "");
        assert_eq!(s.push(&[0xA9]), "é");
        assert_eq!(s.push(&[0xFF, b'a']), "\u{FFFD}a");
        assert_eq!(s.push(&[0xE2, 0x82]), "");
        assert_eq!(s.finish(), "\u{FFFD}");
        assert_eq!(s.into_string(), " hé\u{FFFD}a\u{FFFD}");
    }

    #[test]
    fn test_cancel_drops_unfinished_char() {
        let mut received = String::new();
        let mut s = Utf8Stream::default();
        received.push_str(&s.push(b"ab"));
        assert_eq!(s.push(&[0xE2, 0x82]), "");
        let text = close_stream(s, StopReason::Cancelled, &mut |piece: &str| {
            received.push_str(piece);
            true
        });
        assert_eq!(text, "ab");
        assert_eq!(text, received);
    }

    #[test]
    fn test_stop_flushes_unfinished_char() {
        let mut received = String::new();
        let mut s = Utf8Stream::default();
        received.push_str(&s.push(b"ab"));
        s.push(&[0xC3]);
        let text = close_stream(s, StopReason::MaxTokens, &mut |piece: &str| {
            received.push_str(piece);
            true
        });
        assert_eq!(text, "ab\u{FFFD}");
        assert_eq!(text, received);
    }

    #[test]
    fn test_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LlamaModel>();
    }
}
