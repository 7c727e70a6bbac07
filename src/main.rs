use clap::{Parser, Subcommand};
use mdfsort::{inspect_file, sort_file, SortOptions};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mdfsort", about = "Reorganize MDF measurement files into sorted form")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rewrite a file so every channel group owns a contiguous record section
    Sort {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Assert that compressed data sections were already inflated
        #[arg(long)]
        unzip: bool,
    },
    /// Show the identification header and resolved block statistics
    Info {
        input: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {

        // ── Sort ─────────────────────────────────────────────────────────────
        Commands::Sort { input, output, unzip } => {
            let opts = SortOptions { input: input.clone(), output: output.clone(), unzip };
            let summary = sort_file(&opts)?;
            println!("Sorted: {} → {}", input.display(), output.display());
            println!("  MDF version     {}", summary.version);
            println!("  Resolver passes {}", summary.passes);
            println!("  Blocks written  {}", summary.blocks_written);
            println!("  Bytes written   {}", summary.bytes_written);
            println!("  Groups split    {}", summary.groups_split);
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input } => {
            let report = inspect_file(&input)?;
            println!("── MDF file ─────────────────────────────────────────────");
            println!("  Path            {}", input.display());
            println!("  Version         {} ({})", report.version, report.version_str);
            println!("  Family          {:?}", report.family);
            println!("  Byte order      {:?}", report.endian);
            println!("  Resolver passes {}", report.passes);
            println!("  Blocks          {}", report.blocks);
            println!("  Interleaved     {}", report.interleaved_groups);
            println!("  Blocks by tag:");
            for (tag, count) in &report.tag_counts {
                println!("    {:<4} {}", tag, count);
            }
        }
    }

    Ok(())
}
