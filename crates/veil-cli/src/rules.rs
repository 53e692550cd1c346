//! Declarative rule output for a configuration, computed offline against an
//! in-memory host.

use std::fs;
use std::sync::Arc;

use serde_json::json;
use veil_core::custom_filters;
use veil_core::dnr::{Rule, RuleFamily, RuleSynchronizer, SyncReport};
use veil_core::sources::{ListSource, StaticListSource, FIXES_FILE};
use veil_core::testing::MemoryHost;
use veil_core::trust::NoTrackerDb;
use veil_core::{Config, DeclarativeHost};

pub struct RulesOptions {
    pub config_path: Option<String>,
    pub fixes_path: Option<String>,
    pub rulesets: Vec<String>,
    pub pretty: bool,
}

fn read(path: &str) -> Result<String, String> {
    fs::read_to_string(path).map_err(|e| format!("Failed to read '{}': {}", path, e))
}

pub fn run_rules(opts: RulesOptions) -> Result<(), String> {
    let config: Config = match &opts.config_path {
        Some(path) => serde_json::from_str(&read(path)?)
            .map_err(|e| format!("Invalid config '{}': {}", path, e))?,
        None => Config::default(),
    };
    let fixes: Option<Arc<dyn ListSource>> = match &opts.fixes_path {
        Some(path) => Some(Arc::new(StaticListSource::new().with_file(FIXES_FILE, read(path)?))),
        None => None,
    };

    let rulesets: Vec<&str> = opts.rulesets.iter().map(String::as_str).collect();
    let host = Arc::new(MemoryHost::new().with_rulesets(&rulesets));
    let synchronizer = RuleSynchronizer::new(host.clone(), Arc::new(NoTrackerDb), fixes);

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| format!("Failed to start tokio runtime: {}", e))?;
    let report = runtime.block_on(synchronizer.sync(&config, None));
    if let Some(failure) = report.failures.first() {
        return Err(format!("Rule sync failed at {:?}: {}", failure.step, failure.reason));
    }

    let rules: Vec<Rule> = RuleFamily::ALL
        .into_iter()
        .flat_map(|family| host.rules_in(family))
        .collect();
    let enabled = runtime
        .block_on(host.enabled_rulesets())
        .map_err(|e| format!("Rule sync failed: {}", e))?;

    let rejected = rejected_rules(&report);
    let output = json!({
        "enabledRulesets": enabled,
        "rules": rules,
        "conversionErrors": report.conversion_errors,
        "fixesDropped": report.fixes_dropped,
        "rejected": rejected,
    });
    let text = if opts.pretty {
        serde_json::to_string_pretty(&output)
    } else {
        serde_json::to_string(&output)
    }
    .map_err(|e| format!("Failed to encode rules: {}", e))?;
    println!("{text}");
    Ok(())
}

fn rejected_rules(report: &SyncReport) -> Vec<serde_json::Value> {
    report
        .families
        .iter()
        .flat_map(|family| {
            family
                .rejected
                .iter()
                .map(move |r| json!({"family": family.family, "rule": r.rule, "reason": r.reason}))
        })
        .collect()
}

/// Validate a custom filter file the way the settings page would.
pub fn run_check_custom(
    input: &str,
    trusted_scriptlets: bool,
    as_json: bool,
) -> Result<(), String> {
    let text = read(input)?;
    let (report, _) = custom_filters::compile(&text, trusted_scriptlets);

    if as_json {
        let text = serde_json::to_string_pretty(&report)
            .map_err(|e| format!("Failed to encode report: {}", e))?;
        println!("{text}");
        return Ok(());
    }

    println!("Custom filters: {}", input);
    println!("  Network:     {}", report.network_filters);
    println!("  Cosmetic:    {}", report.cosmetic_filters);
    println!("  DNR rules:   {}", report.dnr_rules);
    for error in &report.errors {
        println!("  line {}: {} ({})", error.line, error.filter, error.reason);
    }
    for error in &report.dnr_errors {
        println!("  no declarative form: {} ({})", error.filter, error.reason);
    }

    if report.errors.is_empty() {
        Ok(())
    } else {
        Err(format!("{} invalid line(s)", report.errors.len()))
    }
}
