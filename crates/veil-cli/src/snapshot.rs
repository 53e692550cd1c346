use std::fs;
use std::path::Path;
use std::time::Instant;

use veil_engine::Engine;

#[derive(Debug, Clone)]
pub struct CompileStats {
    pub lists: usize,
    pub lines: usize,
    pub network: usize,
    pub cosmetic: usize,
    pub skipped: usize,
    pub total_ms: f64,
}

/// Engine name for a list file: its stem, so `ads.txt` becomes `ads`.
pub fn list_name(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Compile each input into a leaf engine and merge them.
pub fn compile_engine(inputs: &[String], verbose: bool) -> Result<(Engine, CompileStats), String> {
    if inputs.is_empty() {
        return Err("No input files specified".to_string());
    }

    let start = Instant::now();
    let mut leaves = Vec::with_capacity(inputs.len());
    let mut lines = 0usize;
    let mut skipped = 0usize;

    for (idx, path) in inputs.iter().enumerate() {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read '{}': {}", path, e))?;
        let name = list_name(path);
        let (engine, errors) = Engine::compile_with_errors(&name, &content);

        let line_count = content.lines().count();
        lines += line_count;
        skipped += errors.len();

        if verbose {
            let stats = engine.stats();
            println!(
                "  [{}] {} - {} lines, {} network, {} cosmetic, {} skipped",
                idx,
                name,
                line_count,
                stats.network,
                stats.cosmetic,
                errors.len()
            );
            for error in errors.iter().take(5) {
                println!("        line {}: {} ({})", error.line, error.filter, error.error);
            }
        }

        leaves.push(engine);
    }

    let engine = if leaves.len() == 1 {
        leaves.remove(0)
    } else {
        Engine::merge(&leaves)
    };
    let stats = engine.stats();

    Ok((
        engine,
        CompileStats {
            lists: inputs.len(),
            lines,
            network: stats.network,
            cosmetic: stats.cosmetic,
            skipped,
            total_ms: start.elapsed().as_secs_f64() * 1000.0,
        },
    ))
}

pub fn write_snapshot(path: &Path, bytes: &[u8]) -> Result<(), String> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create '{}': {}", parent.display(), e))?;
    }
    fs::write(path, bytes).map_err(|e| format!("Failed to write '{}': {}", path.display(), e))?;
    Ok(())
}

pub fn read_snapshot(path: &Path) -> Result<Vec<u8>, String> {
    fs::read(path).map_err(|e| format!("Failed to read '{}': {}", path.display(), e))
}

pub fn load_engine(path: &Path) -> Result<Engine, String> {
    let bytes = read_snapshot(path)?;
    Engine::deserialize(&bytes).map_err(|e| format!("Invalid snapshot '{}': {}", path.display(), e))
}
