// Token sampling from a logits row.
//
// Greedy (argmax) by default. With a positive temperature: temperature
// scaling, then top-k, then softmax, then top-p, then a categorical draw
// from a seeded XorShift RNG.

use serde::Deserialize;

/// Sampling policy for a context.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// 0.0 = greedy.
    pub temperature: f32,
    /// 0 = disabled.
    pub top_k: usize,
    /// 1.0 = disabled.
    pub top_p: f32,
    /// RNG seed. `None` derives one per context.
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            seed: None,
        }
    }
}

impl SamplingConfig {
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }
}

/// XorShift64 generator.
#[derive(Debug, Clone)]
pub struct XorShiftRng {
    state: u64,
}

impl XorShiftRng {
    /// A zero seed is replaced by 1; XorShift never leaves the zero state.
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Uniform in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// Index of the largest logit; the first one wins ties. NaN never wins.
pub fn argmax(logits: &[f32]) -> Option<u32> {
    let mut best: Option<(u32, f32)> = None;
    for (i, &v) in logits.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i as u32, v)),
        }
    }
    best.map(|(i, _)| i).or(if logits.is_empty() { None } else { Some(0) })
}

/// Pick the next token. `None` only when `logits` is empty.
pub fn sample_token(logits: &[f32], config: &SamplingConfig, rng: &mut XorShiftRng) -> Option<u32> {
    if logits.is_empty() {
        return None;
    }
    if config.is_greedy() {
        return argmax(logits);
    }

    let mut candidates: Vec<(u32, f32)> = logits
        .iter()
        .enumerate()
        .filter(|(_, l)| !l.is_nan())
        .map(|(i, &l)| (i as u32, l / config.temperature))
        .collect();
    if candidates.is_empty() {
        return argmax(logits);
    }

    // Descending by logit; stable so equal logits keep id order.
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
    if config.top_k > 0 && config.top_k < candidates.len() {
        candidates.truncate(config.top_k);
    }

    let max_logit = candidates[0].1;
    let mut probs: Vec<(u32, f32)> = candidates
        .iter()
        .map(|&(id, l)| (id, (l - max_logit).exp()))
        .collect();
    normalize(&mut probs);

    if config.top_p < 1.0 {
        let mut cumulative = 0.0f32;
        let mut keep = probs.len();
        for (i, &(_, p)) in probs.iter().enumerate() {
            cumulative += p;
            if cumulative >= config.top_p {
                keep = i + 1;
                break;
            }
        }
        probs.truncate(keep.max(1));
        normalize(&mut probs);
    }

    let r = rng.next_f32();
    let mut cumulative = 0.0f32;
    for &(id, p) in &probs {
        cumulative += p;
        if r < cumulative {
            return Some(id);
        }
    }
    // Rounding left the cumulative sum just under 1.0.
    probs.last().map(|&(id, _)| id)
}

fn normalize(probs: &mut [(u32, f32)]) {
    let sum: f32 = probs.iter().map(|p| p.1).sum();
    if sum > 0.0 {
        for p in probs.iter_mut() {
            p.1 /= sum;
        }
    }
}
