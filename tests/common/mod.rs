//! Shared fixture: a tiny two-layer llama written as GGUF.
//!
//! Vocabulary: `<unk>`, `<s>`, `</s>`, 256 `<0xNN>` byte tokens, then
//! SentencePiece pieces for "hello" and "world".

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use llama_bridge::gguf::writer::GgufWriter;
use llama_bridge::gguf::GgufValue;

pub const HIDDEN: usize = 32;
pub const N_LAYERS: usize = 2;
pub const N_HEADS: usize = 4;
pub const N_KV_HEADS: usize = 2;
pub const FFN: usize = 64;

pub const BOS_ID: i32 = 1;
pub const EOS_ID: i32 = 2;

const PIECES: &[&str] = &[
    "▁", "h", "e", "l", "o", "w", "r", "d", "▁h", "▁he", "▁hel", "▁hell", "▁hello", "▁w", "▁wo",
    "▁wor", "▁worl", "▁world",
];

pub fn vocab() -> Vec<String> {
    let mut tokens = vec!["<unk>".to_string(), "<s>".to_string(), "</s>".to_string()];
    tokens.extend((0..=255u8).map(|b| format!("<0x{:02X}>", b)));
    tokens.extend(PIECES.iter().map(|p| p.to_string()));
    tokens
}

pub fn n_vocab() -> usize {
    vocab().len()
}

pub fn token_id(piece: &str) -> i32 {
    vocab()
        .iter()
        .position(|t| t == piece)
        .map(|i| i as i32)
        .unwrap_or_else(|| panic!("no piece {:?}", piece))
}

fn weights(n: usize, seed: u32) -> Vec<f32> {
    let mut s = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..n)
        .map(|_| {
            s = s.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            ((s >> 8) as f32 / (1u32 << 24) as f32 * 2.0 - 1.0) * 0.2
        })
        .collect()
}

pub fn tiny_llama_writer() -> GgufWriter {
    let tokens = vocab();
    let n_vocab = tokens.len();
    let scores: Vec<GgufValue> = (0..n_vocab)
        .map(|i| {
            let score = if i < 3 + 256 {
                0.0
            } else {
                tokens[i].chars().count() as f32 - 10.0
            };
            GgufValue::F32(score)
        })
        .collect();
    let types: Vec<GgufValue> = (0..n_vocab)
        .map(|i| GgufValue::I32(match i {
            0 => 2,
            1 | 2 => 3,
            i if i < 3 + 256 => 6,
            _ => 1,
        }))
        .collect();

    let head_dim = HIDDEN / N_HEADS;
    let kv_dim = N_KV_HEADS * head_dim;

    let mut w = GgufWriter::new();
    w.set_str("general.architecture", "llama")
        .set_str("general.name", "tiny-llama")
        .set_u32("llama.context_length", 64)
        .set_u32("llama.embedding_length", HIDDEN as u32)
        .set_u32("llama.block_count", N_LAYERS as u32)
        .set_u32("llama.feed_forward_length", FFN as u32)
        .set_u32("llama.attention.head_count", N_HEADS as u32)
        .set_u32("llama.attention.head_count_kv", N_KV_HEADS as u32)
        .set_f32("llama.attention.layer_norm_rms_epsilon", 1e-5)
        .set_f32("llama.rope.freq_base", 10000.0)
        .set_str("tokenizer.ggml.model", "llama")
        .set_str_array("tokenizer.ggml.tokens", &tokens)
        .set("tokenizer.ggml.scores", GgufValue::Array(scores))
        .set("tokenizer.ggml.token_type", GgufValue::Array(types))
        .set_u32("tokenizer.ggml.unknown_token_id", 0)
        .set_u32("tokenizer.ggml.bos_token_id", BOS_ID as u32)
        .set_u32("tokenizer.ggml.eos_token_id", EOS_ID as u32)
        .set_bool("tokenizer.ggml.add_bos_token", true);

    let mut seed = 100;
    let mut next = |n: usize| {
        seed += 1;
        weights(n, seed)
    };

    w.add_f32_tensor("token_embd.weight", &[n_vocab, HIDDEN], &next(n_vocab * HIDDEN))
        .unwrap();
    w.add_f32_tensor("output_norm.weight", &[HIDDEN], &[1.0; HIDDEN]).unwrap();
    for i in 0..N_LAYERS {
        let p = format!("blk.{}", i);
        w.add_f32_tensor(format!("{}.attn_norm.weight", p), &[HIDDEN], &[1.0; HIDDEN])
            .unwrap();
        if i == 0 {
            w.add_q8_0_tensor(format!("{}.attn_q.weight", p), &[HIDDEN, HIDDEN], &next(HIDDEN * HIDDEN))
                .unwrap();
        } else {
            w.add_f32_tensor(format!("{}.attn_q.weight", p), &[HIDDEN, HIDDEN], &next(HIDDEN * HIDDEN))
                .unwrap();
        }
        w.add_f32_tensor(format!("{}.attn_k.weight", p), &[kv_dim, HIDDEN], &next(kv_dim * HIDDEN))
            .unwrap();
        w.add_f32_tensor(format!("{}.attn_v.weight", p), &[kv_dim, HIDDEN], &next(kv_dim * HIDDEN))
            .unwrap();
        w.add_f32_tensor(format!("{}.attn_output.weight", p), &[HIDDEN, HIDDEN], &next(HIDDEN * HIDDEN))
            .unwrap();
        w.add_f32_tensor(format!("{}.ffn_norm.weight", p), &[HIDDEN], &[1.0; HIDDEN])
            .unwrap();
        w.add_f32_tensor(format!("{}.ffn_gate.weight", p), &[FFN, HIDDEN], &next(FFN * HIDDEN))
            .unwrap();
        w.add_f32_tensor(format!("{}.ffn_up.weight", p), &[FFN, HIDDEN], &next(FFN * HIDDEN))
            .unwrap();
        w.add_f32_tensor(format!("{}.ffn_down.weight", p), &[HIDDEN, FFN], &next(HIDDEN * FFN))
            .unwrap();
    }
    w
}

/// Write `tiny.gguf` into `dir`.
pub fn write_tiny_llama(dir: &Path) -> PathBuf {
    let path = dir.join("tiny.gguf");
    tiny_llama_writer().write_to_file(&path).unwrap();
    path
}
