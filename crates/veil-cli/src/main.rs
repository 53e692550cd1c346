//! Veil CLI
//!
//! CLI tool for compiling filter lists, inspecting snapshots and previewing
//! the declarative rules a configuration produces.

mod fetch;
mod rules;
mod snapshot;

use std::path::Path;

use clap::{Parser, Subcommand};

use veil_core::RequestDetails;
use veil_engine::{FilterIndex, MatchDecision};

#[derive(Parser)]
#[command(name = "veil-cli")]
#[command(about = "Veil filter list compiler and tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile filter lists into an engine snapshot
    Compile {
        /// Input filter list files; each becomes a list named after its stem
        #[arg(short, long, required = true)]
        input: Vec<String>,

        /// Output snapshot file
        #[arg(short, long, default_value = "main.veil")]
        output: String,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate an engine snapshot
    Validate {
        /// Snapshot file to validate
        #[arg(short, long)]
        input: String,
    },

    /// Dump snapshot info
    Info {
        /// Snapshot file to inspect
        #[arg(short, long)]
        input: String,
    },

    /// Match one request against a snapshot or list files
    Match {
        /// Snapshot file
        #[arg(short, long, conflicts_with = "list")]
        snapshot: Option<String>,

        /// Filter list files, compiled on the fly
        #[arg(short, long)]
        list: Vec<String>,

        /// Request URL
        #[arg(short, long)]
        url: String,

        /// Page URL that initiated the request
        #[arg(long)]
        source: Option<String>,

        /// Resource type, e.g. script or main_frame
        #[arg(short = 't', long = "type", default_value = "other")]
        request_type: String,
    },

    /// Validate custom filter text
    CheckCustom {
        /// File with one filter per line
        #[arg(short, long)]
        input: String,

        /// Allow restricted scriptlets
        #[arg(long)]
        trusted_scriptlets: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the declarative rules for a configuration
    Rules {
        /// Configuration JSON; defaults apply when omitted
        #[arg(short, long)]
        config: Option<String>,

        /// Fixes rules JSON
        #[arg(long)]
        fixes: Option<String>,

        /// Prebuilt rulesets the host ships
        #[arg(long, value_delimiter = ',', default_value = "ads,tracking,annoyances,fixes")]
        rulesets: Vec<String>,

        /// Pretty-print JSON
        #[arg(long)]
        pretty: bool,
    },

    /// Download lists from a remote base URL
    Fetch {
        /// Base URL serving `<name>.txt`
        #[arg(short, long)]
        base_url: String,

        /// List names
        #[arg(short, long, value_delimiter = ',', required = true)]
        lists: Vec<String>,

        /// Output directory
        #[arg(short, long, default_value = "lists")]
        output: String,

        /// Also write prebuilt snapshots
        #[arg(long)]
        compile: bool,

        /// Per-list timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Compile {
            input,
            output,
            verbose,
        } => cmd_compile(&input, &output, verbose),
        Commands::Validate { input } => cmd_validate(&input),
        Commands::Info { input } => cmd_info(&input),
        Commands::Match {
            snapshot,
            list,
            url,
            source,
            request_type,
        } => cmd_match(snapshot.as_deref(), &list, &url, source.as_deref(), &request_type),
        Commands::CheckCustom {
            input,
            trusted_scriptlets,
            json,
        } => rules::run_check_custom(&input, trusted_scriptlets, json),
        Commands::Rules {
            config,
            fixes,
            rulesets,
            pretty,
        } => rules::run_rules(rules::RulesOptions {
            config_path: config,
            fixes_path: fixes,
            rulesets,
            pretty,
        }),
        Commands::Fetch {
            base_url,
            lists,
            output,
            compile,
            timeout,
        } => fetch::run_fetch(fetch::FetchOptions {
            base_url,
            lists,
            output_dir: output,
            timeout_secs: timeout,
            compile,
        }),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn cmd_compile(inputs: &[String], output: &str, verbose: bool) -> Result<(), String> {
    let (engine, stats) = snapshot::compile_engine(inputs, verbose)?;
    let bytes = engine
        .serialize()
        .map_err(|e| format!("Failed to encode snapshot: {}", e))?;

    veil_engine::Engine::deserialize(&bytes)
        .map_err(|e| format!("Generated snapshot failed validation: {}", e))?;
    snapshot::write_snapshot(Path::new(output), &bytes)?;

    println!("Compiled {} filter lists to '{}'", stats.lists, output);
    println!("  Lines:    {}", stats.lines);
    println!(
        "  Filters:  {} network, {} cosmetic ({} skipped)",
        stats.network, stats.cosmetic, stats.skipped
    );
    println!(
        "  Size:     {} bytes ({:.1} KB)",
        bytes.len(),
        bytes.len() as f64 / 1024.0
    );
    println!("  Time:     {:.1}ms", stats.total_ms);

    Ok(())
}

fn cmd_validate(input: &str) -> Result<(), String> {
    let bytes = snapshot::read_snapshot(Path::new(input))?;
    let info = veil_engine::snapshot::inspect(&bytes)
        .map_err(|e| format!("Invalid snapshot: {}", e))?;
    veil_engine::Engine::deserialize(&bytes).map_err(|e| format!("Invalid snapshot: {}", e))?;

    println!("Snapshot '{}' is valid", input);
    println!("  Version:     {}", info.version);
    println!("  CRC32:       {:08x}", info.crc32);
    println!("  Size:        {} bytes", bytes.len());

    Ok(())
}

fn cmd_info(input: &str) -> Result<(), String> {
    let bytes = snapshot::read_snapshot(Path::new(input))?;
    let info = veil_engine::snapshot::inspect(&bytes)
        .map_err(|e| format!("Invalid snapshot: {}", e))?;
    let engine = veil_engine::Engine::deserialize(&bytes)
        .map_err(|e| format!("Invalid snapshot: {}", e))?;
    let stats = engine.stats();

    println!("Snapshot: {}", input);
    println!("  Version:     {}", info.version);
    println!("  Payload:     {} bytes", info.payload_len);
    println!(
        "  Total size:  {} bytes ({:.1} KB)",
        bytes.len(),
        bytes.len() as f64 / 1024.0
    );
    println!();

    println!("Lists:");
    for list in engine.lists() {
        println!(
            "  {:<16} {:>7} network {:>7} cosmetic  digest {:016x}",
            list.name(),
            list.network_filters().len(),
            list.cosmetic_filters().len(),
            list.digest()
        );
    }
    println!();
    println!("Total:");
    println!("  Network:     {}", stats.network);
    println!("  Cosmetic:    {}", stats.cosmetic);

    Ok(())
}

fn cmd_match(
    snapshot_path: Option<&str>,
    lists: &[String],
    url: &str,
    source: Option<&str>,
    request_type: &str,
) -> Result<(), String> {
    let engine = match snapshot_path {
        Some(path) => snapshot::load_engine(Path::new(path))?,
        None => snapshot::compile_engine(lists, false)?.0,
    };

    let request = RequestDetails::new(url, source, request_type).to_request();
    let result = engine.match_request(&request);

    let decision = match result.decision {
        MatchDecision::Allow => "allow",
        MatchDecision::Block => "block",
        MatchDecision::Redirect => "redirect",
    };
    println!("{decision}");
    if let Some(filter) = &result.filter {
        println!("  Filter:      {}", filter);
    }
    if let Some(list) = &result.list {
        println!("  List:        {}", list);
    }
    if let Some(redirect) = &result.redirect {
        println!("  Redirect:    {} ({})", redirect.resource, redirect.path);
    }

    Ok(())
}
