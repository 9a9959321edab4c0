//! genui: side-by-side comparison harness for the preview sandbox tiers.
//!
//! This CLI provides tools for:
//! - Listing the built-in example candidates
//! - Sanitizing and statically validating generated component source
//! - Rendering a candidate on one tier and interacting with it
//! - Comparing all three tiers on the same candidate
//! - Printing the nested-context and host page security policy

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use genui_sandbox::catalog;
use genui_sandbox::{
    sanitize, validate, CapabilityDenylist, ExecutionResult, HostEnvironment, HostSecurityHeaders, PreviewConfig,
    PreviewRenderer, Tier, ValidationVerdict,
};
use serde_json::json;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Component name used when neither the example nor `--component` names one;
/// unbound names fall back to the candidate's default export.
const FALLBACK_COMPONENT: &str = "Component";

#[derive(Parser)]
#[command(name = "genui")]
#[command(author, version, about = "Preview sandbox comparison harness", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// JSON file with engine and isolation settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the built-in example candidates
    Examples,

    /// Strip markdown fences and print the candidate
    Sanitize {
        /// Example key, file path, or - for stdin
        input: String,
    },

    /// Run the static policy validator
    Validate {
        /// Example key, file path, or - for stdin
        input: String,

        /// Print the verdict as JSON
        #[arg(long)]
        json: bool,
    },

    /// Render a candidate on one tier
    Render {
        /// Example key, file path, or - for stdin
        input: String,

        /// Tier (original|enhanced|isolated, or unsafe|validated|secure)
        #[arg(short, long, default_value = "isolated")]
        tier: Tier,

        /// Component to render
        #[arg(short, long)]
        component: Option<String>,

        /// Click the element with this label after rendering (repeatable)
        #[arg(long)]
        click: Vec<String>,

        /// Advance the component's timers by this many milliseconds
        #[arg(long)]
        advance: Option<u64>,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Render a candidate on every tier and compare
    Compare {
        /// Example key, file path, or - for stdin
        input: String,

        /// Component to render
        #[arg(short, long)]
        component: Option<String>,

        /// Click the element with this label after rendering (repeatable)
        #[arg(long)]
        click: Vec<String>,
    },

    /// Print the nested-context policy, host headers and denylist
    Policy,
}

/// A candidate as loaded from the command line.
struct Input {
    raw: String,
    component: String,
    label: String,
}

fn load_input(input: &str, component: Option<String>) -> Result<Input> {
    if let Some(entry) = catalog::find(input) {
        return Ok(Input {
            raw: entry.source.to_string(),
            component: component.unwrap_or_else(|| entry.component.to_string()),
            label: format!("example '{}'", entry.key),
        });
    }
    let raw = if input == "-" {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text).context("Failed to read stdin")?;
        text
    } else {
        std::fs::read_to_string(input).with_context(|| format!("Failed to read {input} (not a file or example key)"))?
    };
    Ok(Input {
        raw,
        component: component.unwrap_or_else(|| FALLBACK_COMPONENT.to_string()),
        label: input.to_string(),
    })
}

fn load_config(path: Option<&PathBuf>) -> Result<PreviewConfig> {
    match path {
        Some(path) => {
            let config = PreviewConfig::load(path).with_context(|| format!("Failed to load config {}", path.display()))?;
            info!(path = %path.display(), "loaded config");
            Ok(config)
        }
        None => Ok(PreviewConfig::default()),
    }
}

/// Host page with something worth stealing.
fn demo_host() -> Arc<HostEnvironment> {
    HostEnvironment::builder()
        .local_item("authToken", "demo-secret-token")
        .session_item("csrf", "demo-csrf")
        .cookie("session", "demo-session-id")
        .build()
}

fn cmd_examples() -> Result<()> {
    println!("=== Built-in Examples ===");
    println!();
    for entry in catalog::ALL.iter() {
        println!("  {:<10} {:<20} {}", entry.key, entry.component, entry.description);
    }
    println!();
    println!("Use the key wherever a command takes <INPUT>.");
    Ok(())
}

fn cmd_sanitize(input: String) -> Result<()> {
    let input = load_input(&input, None)?;
    println!("{}", sanitize(&input.raw));
    Ok(())
}

fn cmd_validate(input: String, as_json: bool) -> Result<()> {
    let input = load_input(&input, None)?;
    let verdict = validate(&sanitize(&input.raw));
    if as_json {
        println!("{}", serde_json::to_string_pretty(&verdict)?);
        return Ok(());
    }
    match verdict {
        ValidationVerdict::Accepted => println!("accepted: {}", input.label),
        ValidationVerdict::Rejected { reason, offending_token } => {
            println!("rejected: {} ({reason}: {offending_token})", input.label)
        }
    }
    Ok(())
}

/// Apply clicks and timer advances; returns the first interaction failure.
fn interact(result: &mut ExecutionResult, clicks: &[String], advance: Option<u64>) -> Option<String> {
    let surface = result.surface_mut()?;
    for label in clicks {
        debug!(label = %label, "clicking");
        if let Err(failure) = surface.click_text(label) {
            return Some(format!("click {label:?}: {failure}"));
        }
    }
    if let Some(ms) = advance {
        if let Err(failure) = surface.advance_timers(ms) {
            return Some(format!("advance {ms} ms: {failure}"));
        }
    }
    None
}

fn markup(result: &ExecutionResult) -> Option<Result<String, String>> {
    result
        .surface()
        .map(|surface| surface.snapshot().map(|tree| tree.to_markup()).map_err(|f| f.to_string()))
}

fn print_exposure(renderer: &PreviewRenderer) {
    let host = renderer.host();
    let accesses = host.accesses();
    let egress = host.egress();
    println!("  Host evaluations:  {}", host.evaluations());
    println!("  Host accesses:     {}", accesses.len());
    for access in &accesses {
        println!("    - {} {}", access.capability, access.detail);
    }
    println!("  Egress requests:   {}", egress.len());
    for request in &egress {
        println!("    - {} {} {}", request.method, request.url, request.body.as_deref().unwrap_or(""));
    }
    if let Some(isolated) = renderer.isolated() {
        let journal = isolated.journal();
        for entry in journal.console() {
            println!("  Frame console:     [{}] {}", entry.level, entry.message);
        }
        for violation in journal.violations() {
            println!("  CSP violation:     {} refused {}", violation.directive, violation.blocked_uri);
        }
    }
}

async fn cmd_render(
    config: PreviewConfig,
    input: String,
    tier: Tier,
    component: Option<String>,
    clicks: Vec<String>,
    advance: Option<u64>,
    as_json: bool,
) -> Result<()> {
    let input = load_input(&input, component)?;
    let renderer = PreviewRenderer::builder()
        .tier(tier)
        .host(demo_host())
        .config(config)
        .build()
        .with_context(|| format!("Failed to mount tier {tier}"))?;

    let mut result = renderer.render_generated(&input.raw, &input.component).await;
    let interaction = interact(&mut result, &clicks, advance);
    let output = markup(&result);

    if as_json {
        let host = renderer.host();
        let report = json!({
            "tier": tier,
            "component": input.component,
            "status": result.status(),
            "failure": result.failure(),
            "markup": output.as_ref().and_then(|m| m.as_ref().ok()),
            "interactionError": interaction,
            "host": {
                "evaluations": host.evaluations(),
                "accesses": host.accesses(),
                "egress": host.egress(),
            },
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("=== {} on tier {} ===", input.label, tier);
    println!("  {}", tier.description());
    println!();
    println!("  Status:            {}", result.status());
    if let Some(failure) = result.failure() {
        println!("  Failure:           {}", failure.message);
    }
    if let Some(error) = &interaction {
        println!("  Interaction:       {error}");
    }
    match output {
        Some(Ok(markup)) => println!("  Output:            {markup}"),
        Some(Err(error)) => println!("  Output:            <unavailable: {error}>"),
        None => {}
    }
    println!();
    print_exposure(&renderer);
    Ok(())
}

async fn cmd_compare(config: PreviewConfig, input: String, component: Option<String>, clicks: Vec<String>) -> Result<()> {
    let input = load_input(&input, component)?;
    println!("=== Tier comparison: {} ({}) ===", input.label, input.component);

    for tier in Tier::ALL {
        let renderer = PreviewRenderer::builder()
            .tier(tier)
            .host(demo_host())
            .config(config.clone())
            .build()
            .with_context(|| format!("Failed to mount tier {tier}"))?;
        let mut result = renderer.render_generated(&input.raw, &input.component).await;
        let interaction = interact(&mut result, &clicks, None);

        println!();
        println!("--- {tier}: {} ---", tier.description());
        println!("  Status:            {}", result.status());
        if let Some(failure) = result.failure() {
            println!("  Failure:           {}", failure.message);
        }
        if let Some(error) = &interaction {
            println!("  Interaction:       {error}");
        }
        if let Some(Ok(markup)) = markup(&result) {
            println!("  Output:            {markup}");
        }
        print_exposure(&renderer);
    }
    Ok(())
}

fn cmd_policy(config: PreviewConfig) -> Result<()> {
    let policy = &config.isolation.policy;
    println!("=== Nested Context ===");
    for (name, value) in policy.iframe_attributes() {
        println!("  {name}=\"{value}\"");
    }
    println!("  Content-Security-Policy: {}", policy.csp_header());
    println!("  Reply timeout:     {} ms", config.isolation.reply_timeout_ms);
    println!("  Render budget:     {} ms", config.isolation.render_budget_ms);
    println!();
    println!("=== Host Page Headers ===");
    for (name, value) in HostSecurityHeaders::standard().iter() {
        println!("  {name}: {value}");
    }
    println!();
    println!("=== Static Denylist ===");
    for rule in CapabilityDenylist::standard().rules() {
        println!("  {rule}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Examples => cmd_examples(),
        Commands::Sanitize { input } => cmd_sanitize(input),
        Commands::Validate { input, json } => cmd_validate(input, json),
        Commands::Render {
            input,
            tier,
            component,
            click,
            advance,
            json,
        } => cmd_render(config, input, tier, component, click, advance, json).await,
        Commands::Compare { input, component, click } => cmd_compare(config, input, component, click).await,
        Commands::Policy => cmd_policy(config),
    }
}
