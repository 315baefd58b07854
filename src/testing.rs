// Fixture models for unit tests.

use std::path::{Path, PathBuf};

use crate::gguf::writer::GgufWriter;
use crate::gguf::GgufValue;

pub(crate) const HIDDEN: usize = 32;
pub(crate) const N_LAYERS: usize = 2;
pub(crate) const N_HEADS: usize = 4;
pub(crate) const N_KV_HEADS: usize = 2;
pub(crate) const FFN: usize = 64;

pub(crate) const UNK_ID: u32 = 0;
pub(crate) const BOS_ID: u32 = 1;
pub(crate) const EOS_ID: u32 = 2;

/// Plain SentencePiece pieces. Every prefix of "▁hello" and "▁world" is
/// present so score-based merging can build both words.
const PIECES: &[&str] = &[
    "▁", "h", "e", "l", "o", "w", "r", "d", "▁h", "▁he", "▁hel", "▁hell", "▁hello", "▁w", "▁wo",
    "▁wor", "▁worl", "▁world",
];

/// `(tokens, scores, token_types)` of the fixture vocabulary.
pub(crate) fn vocab() -> (Vec<String>, Vec<f32>, Vec<i32>) {
    let mut tokens = vec!["<unk>".to_string(), "<s>".to_string(), "</s>".to_string()];
    let mut scores = vec![0.0, 0.0, 0.0];
    let mut types = vec![2, 3, 3];
    for b in 0..=255u8 {
        tokens.push(format!("<0x{:02X}>", b));
        scores.push(0.0);
        types.push(6);
    }
    for piece in PIECES {
        tokens.push(piece.to_string());
        scores.push(piece.chars().count() as f32 - 10.0);
        types.push(1);
    }
    (tokens, scores, types)
}

pub(crate) fn token_id(piece: &str) -> u32 {
    vocab()
        .0
        .iter()
        .position(|t| t == piece)
        .map(|i| i as u32)
        .unwrap_or_else(|| panic!("fixture vocab has no piece {:?}", piece))
}

/// Deterministic weights in [-scale, scale).
pub(crate) fn pseudo_random(n: usize, seed: u32, scale: f32) -> Vec<f32> {
    let mut s = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..n)
        .map(|_| {
            s = s.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            ((s >> 8) as f32 / (1u32 << 24) as f32 * 2.0 - 1.0) * scale
        })
        .collect()
}

/// A two-layer llama small enough to run in a unit test.
pub(crate) struct TinyLlama {
    pub arch: &'static str,
    pub context_length: u32,
    /// Omit `output.weight` so the embedding is reused.
    pub tied_output: bool,
    /// Store `blk.0.attn_q.weight` as Q8_0.
    pub quantize_attn_q: bool,
}

impl Default for TinyLlama {
    fn default() -> Self {
        Self {
            arch: "llama",
            context_length: 64,
            tied_output: true,
            quantize_attn_q: true,
        }
    }
}

impl TinyLlama {
    pub(crate) fn writer(&self) -> GgufWriter {
        let (tokens, scores, types) = vocab();
        let vocab_size = tokens.len();
        let arch = self.arch;
        let head_dim = HIDDEN / N_HEADS;
        let kv_dim = N_KV_HEADS * head_dim;

        let mut w = GgufWriter::new();
        w.set_str("general.architecture", arch)
            .set_str("general.name", "tiny-llama")
            .set_u32(format!("{}.context_length", arch), self.context_length)
            .set_u32(format!("{}.embedding_length", arch), HIDDEN as u32)
            .set_u32(format!("{}.block_count", arch), N_LAYERS as u32)
            .set_u32(format!("{}.feed_forward_length", arch), FFN as u32)
            .set_u32(format!("{}.attention.head_count", arch), N_HEADS as u32)
            .set_u32(format!("{}.attention.head_count_kv", arch), N_KV_HEADS as u32)
            .set_f32(format!("{}.attention.layer_norm_rms_epsilon", arch), 1e-5)
            .set_f32(format!("{}.rope.freq_base", arch), 10000.0)
            .set_str("tokenizer.ggml.model", "llama")
            .set_str_array("tokenizer.ggml.tokens", &tokens)
            .set(
                "tokenizer.ggml.scores",
                GgufValue::Array(scores.into_iter().map(GgufValue::F32).collect()),
            )
            .set(
                "tokenizer.ggml.token_type",
                GgufValue::Array(types.into_iter().map(GgufValue::I32).collect()),
            )
            .set_u32("tokenizer.ggml.unknown_token_id", UNK_ID)
            .set_u32("tokenizer.ggml.bos_token_id", BOS_ID)
            .set_u32("tokenizer.ggml.eos_token_id", EOS_ID)
            .set_bool("tokenizer.ggml.add_bos_token", true);

        let mut seed = 1;
        let mut next = |n: usize| {
            seed += 1;
            pseudo_random(n, seed, 0.2)
        };

        // Infallible for these shapes.
        let add = |w: &mut GgufWriter, name: String, shape: &[usize], v: Vec<f32>| {
            w.add_f32_tensor(name, shape, &v)
                .map(|_| ())
                .unwrap_or_else(|e| panic!("fixture tensor: {}", e));
        };

        add(&mut w, "token_embd.weight".into(), &[vocab_size, HIDDEN], next(vocab_size * HIDDEN));
        add(&mut w, "output_norm.weight".into(), &[HIDDEN], vec![1.0; HIDDEN]);
        if !self.tied_output {
            add(&mut w, "output.weight".into(), &[vocab_size, HIDDEN], next(vocab_size * HIDDEN));
        }
        for i in 0..N_LAYERS {
            let p = format!("blk.{}", i);
            add(&mut w, format!("{}.attn_norm.weight", p), &[HIDDEN], vec![1.0; HIDDEN]);
            let q = next(HIDDEN * HIDDEN);
            if i == 0 && self.quantize_attn_q {
                w.add_q8_0_tensor(format!("{}.attn_q.weight", p), &[HIDDEN, HIDDEN], &q)
                    .map(|_| ())
                    .unwrap_or_else(|e| panic!("fixture tensor: {}", e));
            } else {
                add(&mut w, format!("{}.attn_q.weight", p), &[HIDDEN, HIDDEN], q);
            }
            add(&mut w, format!("{}.attn_k.weight", p), &[kv_dim, HIDDEN], next(kv_dim * HIDDEN));
            add(&mut w, format!("{}.attn_v.weight", p), &[kv_dim, HIDDEN], next(kv_dim * HIDDEN));
            add(&mut w, format!("{}.attn_output.weight", p), &[HIDDEN, HIDDEN], next(HIDDEN * HIDDEN));
            add(&mut w, format!("{}.ffn_norm.weight", p), &[HIDDEN], vec![1.0; HIDDEN]);
            add(&mut w, format!("{}.ffn_gate.weight", p), &[FFN, HIDDEN], next(FFN * HIDDEN));
            add(&mut w, format!("{}.ffn_up.weight", p), &[FFN, HIDDEN], next(FFN * HIDDEN));
            add(&mut w, format!("{}.ffn_down.weight", p), &[HIDDEN, FFN], next(HIDDEN * FFN));
        }
        w
    }

    pub(crate) fn write(&self, dir: &Path) -> PathBuf {
        let path = dir.join(format!("tiny-{}-{}.gguf", self.arch, self.context_length));
        self.writer()
            .write_to_file(&path)
            .unwrap_or_else(|e| panic!("failed to write fixture: {}", e));
        path
    }
}

/// Default tiny llama written into `dir`.
pub(crate) fn tiny_llama(dir: &Path) -> PathBuf {
    TinyLlama::default().write(dir)
}
