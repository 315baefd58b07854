//! BPE tokenizer for SentencePiece and GPT-2 style vocabularies.
//!
//! Two merge strategies:
//! - **Score-based (SentencePiece):** a pair may merge when the concatenation
//!   is itself a vocabulary entry; the entry's score ranks the merge. Used by
//!   llama and mistral GGUF files (`tokenizer.ggml.model = "llama"`).
//! - **Rank-based (GPT-2):** explicit `"left right"` merge rules ranked by
//!   position. Text is first mapped byte-by-byte onto the GPT-2 printable
//!   alphabet (`Ġ` for space and so on).
//!
//! SentencePiece text uses `\u{2581}` (LOWER ONE EIGHTH BLOCK) as the
//! word-boundary marker, and unknown characters fall back to `<0xNN>` byte
//! tokens.

use std::collections::HashMap;

use tracing::debug;

use super::{SpecialTokens, TokenType, Tokenizer};

/// The SentencePiece word-boundary marker character.
const SPIECE_UNDERLINE: char = '\u{2581}';

/// How merge priority is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    Scores,
    Ranks,
}

/// BPE tokenizer over a GGUF vocabulary.
pub struct BpeTokenizer {
    /// Token string -> token ID. First occurrence wins on duplicates.
    token_to_id: HashMap<String, u32>,
    id_to_token: Vec<String>,
    /// Log-probabilities, used in score mode.
    scores: Vec<f32>,
    token_types: Vec<TokenType>,
    /// (left, right) -> rank, used in rank mode.
    merge_ranks: HashMap<(String, String), u32>,
    mode: MergeMode,
    special: SpecialTokens,
    /// GPT-2 byte -> printable char table (rank mode).
    byte_encoder: Vec<char>,
    byte_decoder: HashMap<char, u8>,
}

impl BpeTokenizer {
    /// Build a tokenizer from vocabulary data.
    ///
    /// Non-empty `merges` selects rank-based merging; otherwise scores are
    /// used. `token_types` shorter than `tokens` is padded with
    /// [`TokenType::Normal`].
    pub fn new(
        tokens: Vec<String>,
        scores: Vec<f32>,
        mut token_types: Vec<TokenType>,
        merges: Vec<String>,
        special: SpecialTokens,
    ) -> Self {
        let mode = if merges.is_empty() {
            MergeMode::Scores
        } else {
            MergeMode::Ranks
        };

        let mut token_to_id = HashMap::with_capacity(tokens.len());
        for (i, tok) in tokens.iter().enumerate() {
            token_to_id.entry(tok.clone()).or_insert(i as u32);
        }
        token_types.resize(tokens.len(), TokenType::Normal);

        let mut merge_ranks = HashMap::new();
        for (rank, line) in merges.iter().enumerate() {
            if let Some((left, right)) = line.split_once(' ') {
                merge_ranks
                    .entry((left.to_string(), right.to_string()))
                    .or_insert(rank as u32);
            }
        }

        let byte_encoder = gpt2_byte_encoder();
        let byte_decoder = byte_encoder
            .iter()
            .enumerate()
            .map(|(b, &c)| (c, b as u8))
            .collect();

        debug!(
            vocab_size = tokens.len(),
            merge_count = merge_ranks.len(),
            ?mode,
            "BPE tokenizer initialized"
        );

        Self {
            token_to_id,
            id_to_token: tokens,
            scores,
            token_types,
            merge_ranks,
            mode,
            special,
            byte_encoder,
            byte_decoder,
        }
    }

    pub fn mode(&self) -> MergeMode {
        self.mode
    }

    pub fn token_type(&self, id: u32) -> Option<TokenType> {
        self.token_types.get(id as usize).copied()
    }

    /// Id of `text` if it is a token that plain text may produce.
    fn lookup_mergeable(&self, text: &str) -> Option<u32> {
        let id = *self.token_to_id.get(text)?;
        match self.token_types[id as usize] {
            TokenType::Normal | TokenType::UserDefined | TokenType::Undefined => Some(id),
            _ => None,
        }
    }

    /// Encode one pre-tokenized piece.
    ///
    /// 1. Split into UTF-8 characters as initial symbols (a linked list).
    /// 2. Seed every adjacent pair that forms a valid merge into a work queue.
    /// 3. Repeatedly apply the best merge, re-seeding the merged symbol's
    ///    neighbours.
    /// 4. Map the surviving symbols to ids, with fallback for unknowns.
    fn encode_word(&self, word: &str, output: &mut Vec<u32>) {
        if word.is_empty() {
            return;
        }
        if let Some(id) = self.lookup_mergeable(word) {
            output.push(id);
            return;
        }

        let n_chars = word.chars().count();
        let mut symbols: Vec<Symbol> = word
            .chars()
            .enumerate()
            .map(|(i, c)| Symbol {
                text: c.to_string(),
                prev: i.checked_sub(1),
                next: if i + 1 < n_chars { Some(i + 1) } else { None },
                merged: false,
            })
            .collect();

        let mut work_queue: Vec<Bigram> = (1..symbols.len())
            .filter_map(|i| self.make_bigram(&symbols, i - 1, i))
            .collect();
        // Best merge sits at the end so it can be popped.
        work_queue.sort_by(compare_bigrams);

        while let Some(bigram) = work_queue.pop() {
            let (left, right) = (bigram.left, bigram.right);
            if symbols[left].merged || symbols[right].merged {
                continue;
            }
            // Stale entry: one side changed since the pair was queued.
            let current = format!("{}{}", symbols[left].text, symbols[right].text);
            if current != bigram.text {
                continue;
            }

            symbols[left].text = current;
            symbols[right].merged = true;
            symbols[left].next = symbols[right].next;
            if let Some(next) = symbols[right].next {
                symbols[next].prev = Some(left);
            }

            let neighbours = [
                symbols[left].prev.map(|p| (p, left)),
                symbols[left].next.map(|n| (left, n)),
            ];
            for (l, r) in neighbours.into_iter().flatten() {
                if let Some(bg) = self.make_bigram(&symbols, l, r) {
                    let pos = work_queue
                        .binary_search_by(|other| compare_bigrams(other, &bg))
                        .unwrap_or_else(|pos| pos);
                    work_queue.insert(pos, bg);
                }
            }
        }

        // Symbol 0 is never merged away; walk the list from it.
        let mut idx = Some(0);
        while let Some(i) = idx {
            let sym = &symbols[i];
            match self.lookup_mergeable(&sym.text) {
                Some(id) => output.push(id),
                None => self.fallback(&sym.text, output),
            }
            idx = sym.next;
        }
    }

    /// A queued merge for symbols `left` and `right`, if the pair may merge.
    fn make_bigram(&self, symbols: &[Symbol], left: usize, right: usize) -> Option<Bigram> {
        let left_text = &symbols[left].text;
        let right_text = &symbols[right].text;
        let merged_text = format!("{}{}", left_text, right_text);

        let priority = match self.mode {
            MergeMode::Scores => {
                let id = self.lookup_mergeable(&merged_text)?;
                let score = self.scores.get(id as usize).copied().unwrap_or(f32::NEG_INFINITY);
                // Higher score merges first.
                OrderedFloat(-(score as f64))
            }
            MergeMode::Ranks => {
                let rank = self
                    .merge_ranks
                    .get(&(left_text.clone(), right_text.clone()))?;
                OrderedFloat(*rank as f64)
            }
        };
        Some(Bigram {
            left,
            right,
            text: merged_text,
            priority,
        })
    }

    /// Encode a symbol with no vocabulary entry.
    ///
    /// Score mode emits `<0xNN>` byte tokens. Rank mode symbols are already
    /// byte-mapped characters, so each character is looked up on its own.
    /// Anything still unknown becomes the unknown token, when there is one.
    fn fallback(&self, text: &str, output: &mut Vec<u32>) {
        match self.mode {
            MergeMode::Scores => {
                for byte in text.bytes() {
                    let byte_token = format!("<0x{:02X}>", byte);
                    match self.token_to_id.get(&byte_token) {
                        Some(&id) => output.push(id),
                        None => output.extend(self.special.unk),
                    }
                }
            }
            MergeMode::Ranks => {
                let mut buf = [0u8; 4];
                for c in text.chars() {
                    match self.lookup_mergeable(c.encode_utf8(&mut buf)) {
                        Some(id) => output.push(id),
                        None => output.extend(self.special.unk),
                    }
                }
            }
        }
    }

    /// Split text into pieces for BPE.
    ///
    /// Score mode: one piece, spaces replaced by `▁` and a `▁` prefix added.
    /// Rank mode: GPT-2 word split, each piece byte-mapped.
    fn pre_tokenize(&self, text: &str) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }
        match self.mode {
            MergeMode::Scores => {
                let mut processed = String::with_capacity(text.len() + 3);
                processed.push(SPIECE_UNDERLINE);
                for c in text.chars() {
                    processed.push(if c == ' ' { SPIECE_UNDERLINE } else { c });
                }
                vec![processed]
            }
            MergeMode::Ranks => gpt_pre_tokenize(text)
                .into_iter()
                .map(|piece| piece.bytes().map(|b| self.byte_encoder[b as usize]).collect())
                .collect(),
        }
    }

    fn is_special(&self, id: u32) -> bool {
        Some(id) == self.special.bos || Some(id) == self.special.eos || Some(id) == self.special.pad
    }
}

impl Tokenizer for BpeTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Vec<u32> {
        let mut output = Vec::new();
        if add_special_tokens && self.special.add_bos {
            output.extend(self.special.bos);
        }
        for piece in self.pre_tokenize(text) {
            self.encode_word(&piece, &mut output);
        }
        if add_special_tokens && self.special.add_eos {
            output.extend(self.special.eos);
        }
        output
    }

    fn decode(&self, ids: &[u32]) -> String {
        let mut bytes = Vec::new();
        for &id in ids {
            if self.is_special(id) || self.token_type(id) == Some(TokenType::Control) {
                continue;
            }
            if let Some(piece) = self.token_piece(id) {
                bytes.extend_from_slice(&piece);
            }
        }
        let text = String::from_utf8_lossy(&bytes);
        // Drop the space that came from the leading `▁`.
        match (self.mode, text.strip_prefix(' ')) {
            (MergeMode::Scores, Some(rest)) => rest.to_string(),
            _ => text.into_owned(),
        }
    }

    fn token_piece(&self, id: u32) -> Option<Vec<u8>> {
        let token = self.id_to_token.get(id as usize)?;
        let ty = self.token_types[id as usize];
        if matches!(ty, TokenType::Byte | TokenType::Undefined) {
            if let Some(b) = parse_byte_token(token) {
                return Some(vec![b]);
            }
        }
        if matches!(ty, TokenType::Control | TokenType::Unknown | TokenType::Unused) {
            return Some(token.as_bytes().to_vec());
        }
        Some(match self.mode {
            MergeMode::Scores => token.replace(SPIECE_UNDERLINE, " ").into_bytes(),
            MergeMode::Ranks => {
                let mut out = Vec::with_capacity(token.len());
                let mut buf = [0u8; 4];
                for c in token.chars() {
                    match self.byte_decoder.get(&c) {
                        Some(&b) => out.push(b),
                        None => out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes()),
                    }
                }
                out
            }
        })
    }

    fn vocab_size(&self) -> usize {
        self.id_to_token.len()
    }

    fn bos_token_id(&self) -> Option<u32> {
        self.special.bos
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.special.eos
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.special.pad
    }
}

/// `<0xNN>` -> NN
fn parse_byte_token(token: &str) -> Option<u8> {
    let hex = token.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

/// GPT-2's reversible byte -> printable character table.
///
/// Printable Latin-1 bytes map to themselves; the rest are shifted to
/// code points 256 and up in byte order.
fn gpt2_byte_encoder() -> Vec<char> {
    let printable = |b: u32| {
        (b'!' as u32..=b'~' as u32).contains(&b) || (0xA1..=0xAC).contains(&b) || (0xAE..=0xFF).contains(&b)
    };
    let mut shifted = 0u32;
    (0..256u32)
        .map(|b| {
            let code = if printable(b) {
                b
            } else {
                shifted += 1;
                255 + shifted
            };
            char::from_u32(code).unwrap_or('\u{FFFD}')
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Internal types
// ---------------------------------------------------------------------------

/// A symbol in the BPE linked list.
#[derive(Clone, Debug)]
struct Symbol {
    text: String,
    prev: Option<usize>,
    next: Option<usize>,
    merged: bool,
}

/// A candidate merge.
#[derive(Clone, Debug)]
struct Bigram {
    left: usize,
    right: usize,
    text: String,
    /// Negated score or merge rank; lower merges first.
    priority: OrderedFloat,
}

/// Sort order with the best merge last. Ties go to the leftmost pair.
fn compare_bigrams(a: &Bigram, b: &Bigram) -> std::cmp::Ordering {
    b.priority.cmp(&a.priority).then_with(|| b.left.cmp(&a.left))
}

/// Total ordering for f64 (NaN sorts last).
#[derive(Clone, Copy, Debug)]
struct OrderedFloat(f64);

impl PartialEq for OrderedFloat {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for OrderedFloat {}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

// ---------------------------------------------------------------------------
// GPT-2 pre-tokenization (no regex dependency)
// ---------------------------------------------------------------------------

/// GPT-2-style word split.
///
/// 1. English contractions ('s, 't, 're, 've, 'm, 'll, 'd) are their own pieces.
/// 2. Whitespace attaches to the following word.
/// 3. Letters, digits and other characters form separate runs.
fn gpt_pre_tokenize(text: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let mut i = 0;

    while i < len {
        let mut piece = String::new();
        while i < len && chars[i].is_whitespace() {
            piece.push(chars[i]);
            i += 1;
        }
        if i < len {
            accumulate_word(&chars, &mut i, &mut piece, &mut pieces);
        }
        if !piece.is_empty() {
            pieces.push(piece);
        }
    }

    pieces
}

/// Extend `piece` with characters of one category, splitting off
/// contractions. `i` is advanced past consumed characters.
fn accumulate_word(chars: &[char], i: &mut usize, piece: &mut String, pieces: &mut Vec<String>) {
    let len = chars.len();
    let cat = char_category(chars[*i]);

    while *i < len && !chars[*i].is_whitespace() {
        // Checked before the category test: `'` is Other inside a Letter run.
        if chars[*i] == '\'' && cat == CharCategory::Letter {
            match try_contraction(chars, *i) {
                Some((contraction, consumed)) => {
                    if !piece.is_empty() {
                        pieces.push(std::mem::take(piece));
                    }
                    pieces.push(contraction);
                    *i += consumed;
                    continue;
                }
                None => break,
            }
        }
        if char_category(chars[*i]) != cat {
            break;
        }
        piece.push(chars[*i]);
        *i += 1;
    }

    // A lone non-letter run that stopped on nothing consumable still moves on.
    if piece.is_empty() && *i < len && !chars[*i].is_whitespace() {
        piece.push(chars[*i]);
        *i += 1;
    }
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum CharCategory {
    Letter,
    Digit,
    Other,
}

fn char_category(ch: char) -> CharCategory {
    if ch.is_alphabetic() {
        CharCategory::Letter
    } else if ch.is_ascii_digit() {
        CharCategory::Digit
    } else {
        CharCategory::Other
    }
}

/// Match a contraction at `i` (an apostrophe). Returns the text and the
/// number of characters consumed.
fn try_contraction(chars: &[char], i: usize) -> Option<(String, usize)> {
    if chars.get(i) != Some(&'\'') {
        return None;
    }
    let next = chars.get(i + 1)?.to_ascii_lowercase();
    if matches!(next, 's' | 't' | 'm' | 'd') {
        return Some((chars[i..i + 2].iter().collect(), 2));
    }
    let next2 = chars.get(i + 2)?.to_ascii_lowercase();
    match (next, next2) {
        ('r', 'e') | ('v', 'e') | ('l', 'l') => Some((chars[i..i + 3].iter().collect(), 3)),
        _ => None,
    }
}
