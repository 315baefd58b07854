//! Loaded models and inference sessions.
//!
//! [`LoadedModel`] is the immutable part: configuration, weights, tokenizer
//! and the per-token C strings handed out across the C boundary. It is shared
//! behind an `Arc`. [`Session`] is one context: a KV cache, a backend with
//! its thread count, the logits of the last evaluated token and the sampler
//! state.

use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, warn};

use crate::backend::CpuBackend;
use crate::error::InferenceError;
use crate::gguf::GgufFile;
use crate::model::{model_forward_step, KvCache, ModelConfig, ModelWeights};
use crate::tokenizer::{create_tokenizer_from_gguf, BpeTokenizer, Tokenizer};

use super::sampler::{sample_token, SamplingConfig, XorShiftRng};

/// A model loaded from a GGUF file.
pub struct LoadedModel {
    path: PathBuf,
    name: String,
    config: ModelConfig,
    weights: ModelWeights,
    tokenizer: BpeTokenizer,
    /// One NUL-terminated piece per token id, built at load time so the
    /// pointers stay stable for the life of the model.
    pieces: Vec<CString>,
}

impl LoadedModel {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, InferenceError> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading model");

        let gguf = GgufFile::open(path)?;
        let config = ModelConfig::from_gguf(&gguf)?;
        let tokenizer = create_tokenizer_from_gguf(&gguf)?;
        if tokenizer.vocab_size() != config.vocab_size {
            return Err(InferenceError::Model(format!(
                "tokenizer has {} tokens but the model expects {}",
                tokenizer.vocab_size(),
                config.vocab_size
            )));
        }
        let weights = ModelWeights::from_gguf(&gguf, &config)?;

        let pieces = (0..tokenizer.vocab_size() as u32)
            .map(|id| piece_cstring(tokenizer.token_piece(id).unwrap_or_default()))
            .collect();

        let name = gguf
            .get_str("general.name")
            .map(str::to_string)
            .or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_default();

        info!(
            name = %name,
            arch = config.arch.name(),
            vocab_size = config.vocab_size,
            n_ctx_train = config.max_seq_len,
            "Model loaded"
        );

        Ok(Self {
            path: path.to_path_buf(),
            name,
            config,
            weights,
            tokenizer,
            pieces,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> &BpeTokenizer {
        &self.tokenizer
    }

    pub fn n_vocab(&self) -> usize {
        self.config.vocab_size
    }

    pub fn eos(&self) -> Option<u32> {
        self.tokenizer.eos_token_id()
    }

    /// Encode `text`, with BOS first when `add_bos` is set and the
    /// vocabulary has one. EOS is never appended.
    pub fn tokenize(&self, text: &str, add_bos: bool) -> Vec<u32> {
        let body = self.tokenizer.encode(text, false);
        match self.tokenizer.bos_token_id() {
            Some(bos) if add_bos => std::iter::once(bos).chain(body).collect(),
            _ => body,
        }
    }

    /// The piece text of a token, owned by the model.
    pub fn token_cstr(&self, id: u32) -> Option<&CStr> {
        self.pieces.get(id as usize).map(CString::as_c_str)
    }

    /// Raw piece bytes of a token.
    pub fn token_bytes(&self, id: u32) -> Option<&[u8]> {
        self.token_cstr(id).map(CStr::to_bytes)
    }
}

/// A piece as a C string. An embedded NUL ends the piece, so `<0x00>`
/// becomes the empty string.
fn piece_cstring(mut bytes: Vec<u8>) -> CString {
    if let Some(nul) = bytes.iter().position(|&b| b == 0) {
        bytes.truncate(nul);
    }
    CString::new(bytes).unwrap_or_default()
}

/// Outcome of [`Session::eval`], with the `llama_decode` return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalStatus {
    Ok,
    /// `n_past + n_tokens > n_ctx`.
    ContextFull,
    InvalidInput,
    ComputeFailed,
}

impl EvalStatus {
    pub fn as_code(self) -> i32 {
        match self {
            EvalStatus::Ok => 0,
            EvalStatus::ContextFull => 1,
            EvalStatus::InvalidInput => -1,
            EvalStatus::ComputeFailed => -2,
        }
    }
}

/// One inference context over a shared model.
pub struct Session {
    model: Arc<LoadedModel>,
    cache: KvCache,
    backend: CpuBackend,
    /// Logits of the last token of the last successful eval.
    logits: Option<Vec<f32>>,
    sampling: SamplingConfig,
    rng: XorShiftRng,
}

impl Session {
    pub fn new(
        model: Arc<LoadedModel>,
        n_ctx: usize,
        n_threads: usize,
        sampling: SamplingConfig,
    ) -> Result<Self, InferenceError> {
        if n_ctx == 0 {
            return Err(InferenceError::Model("n_ctx must be positive".into()));
        }
        if n_ctx > model.config.max_seq_len {
            warn!(
                n_ctx,
                n_ctx_train = model.config.max_seq_len,
                "n_ctx exceeds the trained context length"
            );
        }
        let cache = KvCache::new(&model.config, n_ctx)?;
        let backend = CpuBackend::with_threads(n_threads);
        let seed = sampling.seed.unwrap_or_else(clock_seed);
        debug!(n_ctx, n_threads = backend.n_threads(), seed, "Session created");

        Ok(Self {
            model,
            cache,
            backend,
            logits: None,
            sampling,
            rng: XorShiftRng::new(seed),
        })
    }

    pub fn model(&self) -> &Arc<LoadedModel> {
        &self.model
    }

    pub fn n_ctx(&self) -> usize {
        self.cache.capacity()
    }

    /// Positions currently held in the KV cache.
    pub fn n_past(&self) -> usize {
        self.cache.len()
    }

    pub fn n_threads(&self) -> usize {
        self.backend.n_threads()
    }

    pub fn sampling(&self) -> &SamplingConfig {
        &self.sampling
    }

    pub fn has_logits(&self) -> bool {
        self.logits.is_some()
    }

    /// Evaluate `tokens` at positions `n_past..`.
    ///
    /// An `n_past` below the cached length rewinds the cache first. Rejected
    /// calls leave the session unchanged; a compute failure keeps the
    /// positions that were cached before the call but drops the logits.
    pub fn eval(&mut self, tokens: &[u32], n_past: usize) -> EvalStatus {
        if tokens.is_empty() {
            debug!("eval rejected: no tokens");
            return EvalStatus::InvalidInput;
        }
        if n_past > self.cache.len() {
            debug!(n_past, cached = self.cache.len(), "eval rejected: n_past beyond cache");
            return EvalStatus::InvalidInput;
        }
        let n_vocab = self.model.n_vocab();
        if let Some(&bad) = tokens.iter().find(|&&t| t as usize >= n_vocab) {
            debug!(token = bad, n_vocab, "eval rejected: token out of range");
            return EvalStatus::InvalidInput;
        }
        if n_past + tokens.len() > self.n_ctx() {
            debug!(n_past, n_tokens = tokens.len(), n_ctx = self.n_ctx(), "eval: context full");
            return EvalStatus::ContextFull;
        }

        if n_past < self.cache.len() {
            self.cache.truncate(n_past);
            self.logits = None;
        }

        let model = &self.model;
        match model_forward_step(tokens, &model.weights, &model.config, &self.backend, &mut self.cache) {
            Ok(logits) => {
                self.logits = Some(logits);
                EvalStatus::Ok
            }
            Err(e) => {
                error!(error = %e, n_past, n_tokens = tokens.len(), "eval failed");
                self.cache.truncate(self.cache.len());
                self.logits = None;
                EvalStatus::ComputeFailed
            }
        }
    }

    /// Next token from the stored logits. `None` before the first
    /// successful eval and after [`clear`](Self::clear).
    pub fn sample(&mut self) -> Option<u32> {
        let logits = self.logits.as_deref()?;
        sample_token(logits, &self.sampling, &mut self.rng)
    }

    /// Reset the cache to position 0 and drop pending logits.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.logits = None;
    }
}

fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
}
