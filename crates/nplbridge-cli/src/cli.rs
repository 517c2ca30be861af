//! Clap CLI definitions for nplbridge.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  nplbridge packages                          List deployed NPL packages
  nplbridge tools --package commerce          Show the tools compiled for a package
  nplbridge invoke commerce_Product_create --args '{\"name\":\"Pump\",\"price\":1200}'
  nplbridge get commerce Product 3f2a...       Read one protocol instance
  nplbridge query commerce Product --size 5   Page through a protocol's instances
  nplbridge health                            Probe the engine and the identity provider

\x1b[1;36mEnvironment:\x1b[0m
  NPL_ENGINE_URL, NPL_TOKEN, NPL_USERNAME, NPL_PASSWORD, NPL_PACKAGES, RUST_LOG";

/// nplbridge: typed agent tools over an NPL protocol engine.
#[derive(Parser)]
#[command(name = "nplbridge", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file (TOML or YAML).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List deployed packages.
    Packages,
    /// List compiled tools.
    Tools {
        /// Restrict to these packages (repeatable).
        #[arg(long = "package", short = 'p')]
        packages: Vec<String>,
        /// Print full descriptions and parameters.
        #[arg(long, short = 'v')]
        verbose: bool,
    },
    /// Invoke a tool and print its JSON result.
    Invoke {
        /// Tool name, e.g. commerce_Product_create.
        tool: String,
        /// Arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
        /// Agent identity whose memory records the result.
        #[arg(long, default_value = "cli")]
        agent: String,
    },
    /// Read one protocol instance.
    Get {
        /// Package name, e.g. commerce.
        package: String,
        /// Protocol type, e.g. Product.
        protocol: String,
        /// Instance id.
        id: String,
        /// Agent identity whose memory records the instance.
        #[arg(long, default_value = "cli")]
        agent: String,
    },
    /// List one page of a protocol's instances.
    Query {
        package: String,
        protocol: String,
        /// Zero-based page index.
        #[arg(long, default_value_t = 0)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        size: u32,
        /// Extra query parameter as name=value (repeatable).
        #[arg(long = "filter", short = 'f')]
        filters: Vec<String>,
        #[arg(long, default_value = "cli")]
        agent: String,
    },
    /// Check engine reachability and authentication.
    Health,
}
