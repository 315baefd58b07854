//! Helpers for the `llama-bridge-generate` binary.

use std::io::{self, Read};
use std::path::PathBuf;

use crate::logging;

/// Install stderr logging unless `quiet`. `RUST_LOG` overrides the
/// default `warn` level.
pub fn init_logging(quiet: bool) {
    if !quiet {
        logging::init_subscriber("warn");
    }
}

/// Where the prompt comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptSource {
    Text(String),
    File(PathBuf),
    Stdin,
}

impl PromptSource {
    /// Pick a source from the CLI flags. An inline prompt wins over a file,
    /// and a file over stdin.
    pub fn from_flags(prompt: Option<String>, file: Option<PathBuf>, stdin: bool) -> Option<Self> {
        match (prompt, file) {
            (Some(text), _) => Some(PromptSource::Text(text)),
            (None, Some(path)) => Some(PromptSource::File(path)),
            (None, None) if stdin => Some(PromptSource::Stdin),
            (None, None) => None,
        }
    }

    pub fn read(self) -> Result<String, String> {
        match self {
            PromptSource::Text(text) => Ok(text),
            PromptSource::File(path) => std::fs::read_to_string(&path)
                .map_err(|e| format!("Failed to read file '{}': {}", path.display(), e)),
            PromptSource::Stdin => {
                let mut buf = String::new();
                io::stdin()
                    .read_to_string(&mut buf)
                    .map_err(|e| format!("Failed to read stdin: {}", e))?;
                Ok(buf)
            }
        }
    }
}

/// One `id<TAB>piece` line per token, with control characters escaped.
pub fn format_token_table(tokens: &[(u32, String)]) -> String {
    tokens
        .iter()
        .map(|(id, piece)| format!("{}\t{:?}\n", id, piece))
        .collect()
}
