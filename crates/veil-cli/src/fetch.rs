use std::fs;
use std::path::Path;
use std::time::Duration;

use veil_core::sources::{list_file, snapshot_file, HttpListSource, ListSource};
use veil_engine::Engine;

use crate::snapshot;

pub struct FetchOptions {
    pub base_url: String,
    pub lists: Vec<String>,
    pub output_dir: String,
    pub timeout_secs: u64,
    /// Also write a prebuilt snapshot next to each list
    pub compile: bool,
}

pub fn run_fetch(opts: FetchOptions) -> Result<(), String> {
    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| format!("Failed to start tokio runtime: {}", e))?;
    runtime.block_on(fetch_async(opts))
}

async fn fetch_async(opts: FetchOptions) -> Result<(), String> {
    if opts.lists.is_empty() {
        return Err("No lists specified".to_string());
    }
    let source = HttpListSource::new(&opts.base_url, Duration::from_secs(opts.timeout_secs))
        .map_err(|e| format!("Invalid base URL '{}': {}", opts.base_url, e))?;
    let dir = Path::new(&opts.output_dir);
    fs::create_dir_all(dir).map_err(|e| format!("Failed to create '{}': {}", dir.display(), e))?;

    let mut failed = 0usize;
    for name in &opts.lists {
        let text = match source.fetch_text(&list_file(name)).await {
            Ok(text) => text,
            Err(e) => {
                eprintln!("  {}: {}", name, e);
                failed += 1;
                continue;
            }
        };

        let path = dir.join(list_file(name));
        fs::write(&path, &text)
            .map_err(|e| format!("Failed to write '{}': {}", path.display(), e))?;
        print!("  {} - {} lines", name, text.lines().count());

        if opts.compile {
            let bytes = Engine::compile(name, &text)
                .serialize()
                .map_err(|e| format!("Failed to encode '{}': {}", name, e))?;
            snapshot::write_snapshot(&dir.join(snapshot_file(name)), &bytes)?;
            print!(", snapshot {} bytes", bytes.len());
        }
        println!();
    }

    if failed > 0 {
        return Err(format!("{} of {} list(s) could not be fetched", failed, opts.lists.len()));
    }
    Ok(())
}
