mod backend;
mod cli;
mod model;
mod orchestrator;
mod text_summary;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Diagnostics go to stderr so they never interleave with JSON on stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Cli::parse();
    let json = args.json;

    // Exit explicitly: the stdin reader used by `watch` would otherwise keep the runtime alive.
    match cli::run(args).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            if json {
                println!("{}", serde_json::json!({ "error": format!("{e:#}") }));
            } else {
                eprintln!("error: {e:#}");
            }
            std::process::exit(1);
        }
    }
}
