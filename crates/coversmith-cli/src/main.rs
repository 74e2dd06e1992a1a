use anyhow::Result;
use clap::{Parser, Subcommand};
use coversmith_contracts::presets;
use coversmith_contracts::request::{GenerationRequest, QualityTier};
use coversmith_engine::{Materializer, ProviderConfig, OUTPUT_DIR_ENV};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "coversmith", version, about = "AI cover image generator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate one image and print the outcome record as JSON.
    Generate(GenerateArgs),
    /// List the known format presets.
    Formats,
    /// List registered providers and their configuration state.
    Providers,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    /// Image description passed to the provider.
    #[arg(long)]
    prompt: String,
    /// Format preset key (see `coversmith formats`).
    #[arg(long, default_value = "ghost-banner")]
    format: String,
    /// Provider to dispatch to.
    #[arg(long, default_value = "gemini")]
    provider: String,
    /// Quality tier: standard or high.
    #[arg(long, default_value = "standard")]
    quality: QualityTier,
    /// Optional style hint appended to the prompt.
    #[arg(long)]
    style: Option<String>,
    /// Optional title embedded into the saved image.
    #[arg(long)]
    title: Option<String>,
    /// Output file or directory. Defaults to the directory named by
    /// COVERSMITH_OUTPUT_DIR, falling back to ./generated-images.
    #[arg(long)]
    out: Option<String>,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("coversmith error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Formats => {
            print_formats();
            Ok(0)
        }
        Command::Providers => {
            print_providers();
            Ok(0)
        }
    }
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let config = ProviderConfig::from_env();
    let materializer = Materializer::new(&config, args.provider);

    let request = GenerationRequest {
        prompt: args.prompt,
        format_key: args.format,
        quality: args.quality,
        style: args.style,
        title: args.title,
    };
    let outcome = materializer.materialize(&request, args.out.as_deref());

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(if outcome.success { 0 } else { 1 })
}

fn print_formats() {
    for preset in presets::all() {
        let ratio = if preset.native_aspect_ratio {
            preset.aspect_ratio.clone()
        } else {
            format!("{} (via {})", preset.aspect_ratio, preset.provider_aspect_ratio)
        };
        println!(
            "{:<20} {:>4}x{:<4} {:<16} {}",
            preset.key,
            preset.width,
            preset.height,
            ratio,
            preset.description
        );
    }
    println!();
    println!("Override the output directory with {OUTPUT_DIR_ENV}.");
}

fn print_providers() {
    let config = ProviderConfig::from_env();
    let materializer = Materializer::new(&config, "dryrun");
    let registry = materializer.providers();
    for name in registry.names() {
        let Some(provider) = registry.get(&name) else {
            continue;
        };
        let (max_width, max_height) = provider.max_resolution();
        let state = if provider.is_configured() {
            "configured"
        } else {
            "not configured"
        };
        println!(
            "{:<10} {:<16} max {}x{}  ratios: {}",
            name,
            state,
            max_width,
            max_height,
            provider.supported_aspect_ratios().join(", ")
        );
    }
}
