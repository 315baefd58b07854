//! llama-bridge-generate: run a GGUF llama model through the safe API.

use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

use clap::Parser;
use serde::Serialize;

use llama_bridge::api::{ContextParams, GenerateOptions, GenerationOutput, LlamaModel};
use llama_bridge::cli::{self, PromptSource};
use llama_bridge::config::available_threads;
use llama_bridge::engine::SamplingConfig;

#[derive(Parser)]
#[command(name = "llama-bridge-generate", version, about = "Generate text from a GGUF llama model")]
struct Args {
    /// Path to the GGUF file
    #[arg(short = 'm', long)]
    model: PathBuf,

    /// Prompt text
    #[arg(short = 'p', long, conflicts_with_all = ["file", "stdin"])]
    prompt: Option<String>,

    /// Read the prompt from a file
    #[arg(short = 'f', long, conflicts_with = "stdin")]
    file: Option<PathBuf>,

    /// Read the prompt from stdin
    #[arg(long)]
    stdin: bool,

    /// Maximum tokens to generate
    #[arg(short = 'n', long, default_value_t = 512)]
    max_tokens: usize,

    /// Context length
    #[arg(short = 'c', long, default_value_t = 4096)]
    ctx: usize,

    /// Worker threads (default: available parallelism)
    #[arg(short = 't', long)]
    threads: Option<usize>,

    /// Temperature (0.0 = greedy)
    #[arg(long, default_value_t = 0.0)]
    temp: f32,

    /// Top-k sampling (0 = disabled)
    #[arg(long, default_value_t = 0)]
    top_k: usize,

    /// Top-p (nucleus) sampling
    #[arg(long, default_value_t = 1.0)]
    top_p: f32,

    /// Random seed for sampling
    #[arg(short = 's', long)]
    seed: Option<u64>,

    /// Print prompt token ids and pieces instead of generating
    #[arg(long)]
    tokenize: bool,

    /// Print a JSON summary instead of streaming text
    #[arg(long)]
    json: bool,

    /// Suppress logging
    #[arg(short = 'q', long)]
    quiet: bool,
}

#[derive(Serialize)]
struct JsonOutput<'a> {
    model: String,
    prompt: &'a str,
    #[serde(flatten)]
    output: &'a GenerationOutput,
    load_ms: f64,
    generate_ms: f64,
    tokens_per_sec: f64,
    sampling: SamplingOutput,
}

#[derive(Serialize)]
struct SamplingOutput {
    temperature: f32,
    top_k: usize,
    top_p: f32,
    seed: Option<u64>,
}

fn main() {
    let args = Args::parse();
    cli::init_logging(args.quiet);

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let source = PromptSource::from_flags(args.prompt.clone(), args.file.clone(), args.stdin)
        .ok_or("No input provided. Use --prompt, --file, or --stdin")?;
    let prompt = source.read()?;

    let sampling = SamplingConfig {
        temperature: args.temp,
        top_k: args.top_k,
        top_p: args.top_p,
        seed: args.seed,
    };
    let params = ContextParams {
        n_ctx: args.ctx,
        n_threads: args.threads.unwrap_or_else(available_threads),
        sampling: sampling.clone(),
    };

    let load_start = Instant::now();
    let model = LlamaModel::load(&args.model, params)?;
    let load_ms = load_start.elapsed().as_secs_f64() * 1000.0;

    if args.tokenize {
        let ids = model.tokenize(&prompt)?;
        let rows = ids
            .iter()
            .map(|&id| Ok((id, model.token_to_piece(id)?)))
            .collect::<Result<Vec<_>, llama_bridge::BridgeError>>()?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        } else {
            print!("{}", cli::format_token_table(&rows));
        }
        return Ok(());
    }

    let options = GenerateOptions {
        max_tokens: args.max_tokens,
        ..GenerateOptions::default()
    };

    let gen_start = Instant::now();
    let output = if args.json {
        model.generate_full(&prompt, &options)?
    } else {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let output = model.generate_stream(&prompt, &options, |piece| {
            // A closed pipe stops generation.
            out.write_all(piece.as_bytes()).and_then(|_| out.flush()).is_ok()
        })?;
        writeln!(out)?;
        output
    };
    let generate_ms = gen_start.elapsed().as_secs_f64() * 1000.0;

    if args.json {
        let tokens_per_sec = if generate_ms > 0.0 {
            output.token_ids.len() as f64 / (generate_ms / 1000.0)
        } else {
            0.0
        };
        let json = JsonOutput {
            model: args.model.display().to_string(),
            prompt: &prompt,
            output: &output,
            load_ms,
            generate_ms,
            tokens_per_sec,
            sampling: SamplingOutput {
                temperature: sampling.temperature,
                top_k: sampling.top_k,
                top_p: sampling.top_p,
                seed: sampling.seed,
            },
        };
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else {
        eprintln!(
            "[{} prompt tokens, {} generated, stop: {}, {:.1} ms]",
            output.prompt_tokens,
            output.token_ids.len(),
            output.stop_reason,
            generate_ms
        );
    }

    Ok(())
}
