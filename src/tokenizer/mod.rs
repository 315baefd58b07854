//! Tokenizer trait and construction from GGUF metadata.
//!
//! GGUF files embed their vocabulary under `tokenizer.ggml.*`. The
//! [`create_tokenizer_from_gguf`] factory reads it and builds a
//! [`BpeTokenizer`] in score mode (`model = "llama"`) or rank mode
//! (`model = "gpt2"`).

pub mod bpe;

pub use bpe::{BpeTokenizer, MergeMode};

use tracing::{debug, warn};

use crate::error::InferenceError;
use crate::gguf::GgufFile;

/// A tokenizer that converts text to token IDs and back.
///
/// Implementations are shared between sessions, so they must be
/// `Send + Sync`.
pub trait Tokenizer: Send + Sync {
    /// Encode text into a sequence of token IDs.
    ///
    /// When `add_special_tokens` is true, BOS (and EOS, if the vocabulary
    /// asks for it) are added.
    fn encode(&self, text: &str, add_special_tokens: bool) -> Vec<u32>;

    /// Decode a sequence of token IDs back into text. Special tokens are
    /// skipped.
    fn decode(&self, ids: &[u32]) -> String;

    /// Raw bytes of a single token as it appears in generated text.
    /// `None` for an id outside the vocabulary.
    fn token_piece(&self, id: u32) -> Option<Vec<u8>>;

    fn vocab_size(&self) -> usize;

    fn bos_token_id(&self) -> Option<u32>;

    fn eos_token_id(&self) -> Option<u32>;

    fn pad_token_id(&self) -> Option<u32>;
}

/// GGUF `tokenizer.ggml.token_type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Undefined,
    Normal,
    Unknown,
    Control,
    UserDefined,
    Unused,
    Byte,
}

impl TokenType {
    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => TokenType::Normal,
            2 => TokenType::Unknown,
            3 => TokenType::Control,
            4 => TokenType::UserDefined,
            5 => TokenType::Unused,
            6 => TokenType::Byte,
            _ => TokenType::Undefined,
        }
    }
}

/// Special token ids and whether encoding adds BOS/EOS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpecialTokens {
    pub bos: Option<u32>,
    pub eos: Option<u32>,
    pub pad: Option<u32>,
    pub unk: Option<u32>,
    pub add_bos: bool,
    pub add_eos: bool,
}

/// Build a tokenizer from the vocabulary embedded in a GGUF file.
pub fn create_tokenizer_from_gguf(gguf: &GgufFile) -> Result<BpeTokenizer, InferenceError> {
    let model = gguf.get_str("tokenizer.ggml.model").unwrap_or("llama");

    let tokens: Vec<String> = gguf
        .get_str_array("tokenizer.ggml.tokens")
        .ok_or_else(|| InferenceError::MissingKey("tokenizer.ggml.tokens".into()))?
        .into_iter()
        .map(str::to_string)
        .collect();
    if tokens.is_empty() {
        return Err(InferenceError::Tokenizer("vocabulary is empty".into()));
    }
    let n_vocab = tokens.len();

    let token_types: Vec<TokenType> = gguf
        .get_int_array("tokenizer.ggml.token_type")
        .map(|v| v.into_iter().map(TokenType::from_i64).collect())
        .unwrap_or_default();

    let (scores, merges, default_add_bos) = match model {
        "llama" => {
            let scores = gguf.get_f32_array("tokenizer.ggml.scores").unwrap_or_else(|| {
                warn!("GGUF has no tokenizer.ggml.scores, merging with zero scores");
                vec![0.0; n_vocab]
            });
            (scores, Vec::new(), true)
        }
        "gpt2" => {
            let merges: Vec<String> = gguf
                .get_str_array("tokenizer.ggml.merges")
                .ok_or_else(|| InferenceError::MissingKey("tokenizer.ggml.merges".into()))?
                .into_iter()
                .map(str::to_string)
                .collect();
            if merges.is_empty() {
                return Err(InferenceError::Tokenizer("gpt2 tokenizer has no merges".into()));
            }
            (vec![0.0; n_vocab], merges, false)
        }
        other => {
            return Err(InferenceError::Tokenizer(format!(
                "unsupported tokenizer model '{}'",
                other
            )))
        }
    };

    let id = |key: &str| -> Option<u32> {
        let id = gguf.get_u32(key)?;
        if (id as usize) < n_vocab {
            Some(id)
        } else {
            warn!(key, id, n_vocab, "special token id outside vocabulary, ignoring");
            None
        }
    };
    let special = SpecialTokens {
        bos: id("tokenizer.ggml.bos_token_id"),
        eos: id("tokenizer.ggml.eos_token_id"),
        pad: id("tokenizer.ggml.padding_token_id"),
        unk: id("tokenizer.ggml.unknown_token_id"),
        add_bos: gguf
            .get_bool("tokenizer.ggml.add_bos_token")
            .unwrap_or(default_add_bos),
        add_eos: gguf.get_bool("tokenizer.ggml.add_eos_token").unwrap_or(false),
    };

    debug!(model, n_vocab, ?special, "Creating tokenizer from GGUF");
    Ok(BpeTokenizer::new(tokens, scores, token_types, merges, special))
}
