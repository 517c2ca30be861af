//! nplbridge CLI: operator surface over the bridge kernel.
//!
//! Every command boots an in-process kernel from the config file and the
//! `NPL_*` environment, runs once, and exits. Ctrl+C cancels in-flight
//! engine calls.

mod cli;
mod ui;

use crate::cli::{Cli, Commands};
use clap::Parser;
use nplbridge_kernel::config::load_config;
use nplbridge_kernel::error::KernelResult;
use nplbridge_kernel::{BridgeKernel, InstanceQuery};
use nplbridge_types::config::BridgeConfig;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = load_config(cli.config.as_deref());

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            ui::error(&format!("Failed to start async runtime: {e}"));
            std::process::exit(1);
        }
    };

    let code = rt.block_on(async move {
        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nInterrupted.");
                on_interrupt.cancel();
            }
        });

        match run(cli.command, config, &cancel).await {
            Ok(code) => code,
            Err(e) => {
                ui::error(&e.to_string());
                1
            }
        }
    });
    std::process::exit(code);
}

async fn run(
    command: Commands,
    config: BridgeConfig,
    cancel: &CancellationToken,
) -> KernelResult<i32> {
    let kernel = BridgeKernel::boot(config)?;
    match command {
        Commands::Packages => cmd_packages(&kernel, cancel).await,
        Commands::Tools { packages, verbose } => {
            cmd_tools(&kernel, &packages, verbose, cancel).await
        }
        Commands::Invoke { tool, args, agent } => {
            cmd_invoke(&kernel, &agent, &tool, &args, cancel).await
        }
        Commands::Get {
            package,
            protocol,
            id,
            agent,
        } => {
            let instance = kernel
                .get_instance(&agent, &package, &protocol, &id, cancel)
                .await?;
            print_json(&instance);
            Ok(0)
        }
        Commands::Query {
            package,
            protocol,
            page,
            size,
            filters,
            agent,
        } => {
            let mut query = InstanceQuery::default().page(page).size(size);
            for filter in &filters {
                let Some((name, value)) = filter.split_once('=') else {
                    ui::error(&format!("--filter expects name=value, got '{filter}'"));
                    return Ok(2);
                };
                query = query.filter(name.trim(), value.trim());
            }
            let result = kernel
                .query_instances(&agent, &package, &protocol, &query, cancel)
                .await?;
            print_json(&result);
            Ok(0)
        }
        Commands::Health => Ok(cmd_health(&kernel).await),
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_packages(kernel: &BridgeKernel, cancel: &CancellationToken) -> KernelResult<i32> {
    let packages = kernel.describe_packages(None, cancel).await?;
    ui::heading("Packages", Some(packages.len()));
    for package in &packages {
        ui::field(&package.package_name, &package.spec_url, None);
    }
    Ok(0)
}

async fn cmd_tools(
    kernel: &BridgeKernel,
    packages: &[String],
    verbose: bool,
    cancel: &CancellationToken,
) -> KernelResult<i32> {
    let filter = (!packages.is_empty()).then_some(packages);
    let tools = kernel.list_compiled_tools(filter, cancel).await?;
    ui::heading("Tools", Some(tools.len()));
    for tool in &tools {
        let params: Vec<(String, String, bool)> = tool
            .parameters()
            .iter()
            .map(|p| (p.flattened_name.clone(), p.primitive_type.to_string(), p.required))
            .collect();
        ui::tool_signature(tool.name(), &params);
        if verbose {
            for line in tool.description().lines() {
                println!("        {line}");
            }
            println!();
        }
    }
    if tools.is_empty() {
        ui::hint("check NPL_PACKAGES or the engine's Swagger UI");
    }
    Ok(0)
}

async fn cmd_invoke(
    kernel: &BridgeKernel,
    agent: &str,
    tool: &str,
    args: &str,
    cancel: &CancellationToken,
) -> KernelResult<i32> {
    let input: Value = match serde_json::from_str(args) {
        Ok(v) => v,
        Err(e) => {
            ui::error(&format!("--args is not valid JSON: {e}"));
            return Ok(2);
        }
    };
    let result = kernel.invoke_tool(agent, tool, &input, cancel).await?;
    print_json(&result);
    Ok(0)
}

fn print_json(value: &Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

async fn cmd_health(kernel: &BridgeKernel) -> i32 {
    let report = kernel.health().await;
    let healthy = report.is_healthy();
    ui::heading("Engine", None);
    ui::field("URL", &report.engine.url, None);
    let status = format!("{:?}", report.engine.status).to_lowercase();
    ui::field("Status", &status, Some(healthy));
    ui::field("Latency", &format!("{} ms", report.engine.latency_ms), None);
    if let Some(code) = report.engine.http_status {
        ui::field("HTTP", &code.to_string(), None);
    }
    if let Some(detail) = &report.engine.detail {
        ui::field("Detail", detail, None);
    }

    println!();
    ui::heading("Authentication", None);
    ui::field("Provider", &report.auth.provider, None);
    let held = if report.auth.authenticated { "held" } else { "none yet" };
    ui::field("Credential", held, Some(report.auth.authenticated));
    if let Some(expires) = report.auth.expires_at {
        ui::field("Expires", &expires.to_rfc3339(), None);
    }

    if healthy {
        println!();
        ui::ok("Engine is healthy");
        0
    } else {
        1
    }
}
