use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use nano_batch::{logging, Engine, EngineConfig, GenerateConfig, StreamRequest, SyntheticBackend};

#[derive(Parser, Debug)]
#[command(name = "nano-batch")]
#[command(about = "Run synthetic requests through the continuous-batching engine")]
struct Args {
    /// Engine configuration JSON (defaults apply to missing fields)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of generation requests to submit
    #[arg(short, long, default_value = "8")]
    num_requests: usize,

    /// Input tokens per request
    #[arg(long, default_value = "32")]
    prompt_len: usize,

    /// Leading tokens shared by every request (e.g. a system prompt)
    #[arg(long, default_value = "0")]
    shared_prefix_len: usize,

    /// Maximum tokens to generate per request
    #[arg(long, default_value = "16")]
    max_new_tokens: usize,

    /// Also submit one embedding request per generation request
    #[arg(long)]
    embeddings: bool,

    /// Synthetic vocabulary size
    #[arg(long, default_value = "1024")]
    vocab_size: usize,

    /// Default log level (RUST_LOG overrides)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();
    logging::init(&args.log_level);

    if let Err(err) = run(&args) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> nano_batch::Result<()> {
    let config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    let vocab = args.vocab_size.max(1) as u32;
    let engine = Engine::new(config, Box::new(SyntheticBackend::new(args.vocab_size.max(1), 64)))?;

    let shared: Vec<u32> = (0..args.shared_prefix_len as u32).map(|t| t % vocab).collect();
    let mut handles = Vec::new();
    for i in 0..args.num_requests {
        let mut tokens = shared.clone();
        tokens.extend(
            (0..args.prompt_len.saturating_sub(shared.len()) as u32)
                .map(|t| (t * 31 + i as u32 * 7 + 1) % vocab),
        );
        let mut request = StreamRequest::generate(tokens.clone(), GenerateConfig::greedy(args.max_new_tokens));
        if args.shared_prefix_len > 0 {
            request = request.with_prefix_len(args.shared_prefix_len);
        }
        handles.push(("generate", engine.enqueue(request)));
        if args.embeddings {
            handles.push(("embed", engine.enqueue(StreamRequest::embedding(tokens))));
        }
    }

    for (kind, handle) in &handles {
        match handle.wait_finish() {
            Ok(output) => println!(
                "[{kind} {}] {:?} after {} rounds, reused {}/{} input tokens, {:.2?}: {}",
                handle.id(),
                output.finish_reason,
                output.iter_count,
                output.reuse_len,
                output.input_len,
                output.cost,
                match &output.embedding {
                    Some(embedding) => format!("embedding[{}]", embedding.len()),
                    None => format!("{:?}", output.output_ids),
                }
            ),
            Err(err) => println!("[{kind} {}] failed: {err}", handle.id()),
        }
    }

    let stats = engine.cache_stats();
    info!(
        free = stats.free,
        used = stats.used,
        cached_prefixes = stats.cached_prefixes,
        "all requests done"
    );
    engine.stop();
    Ok(())
}
