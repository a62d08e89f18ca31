//! CLI command definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use playop_core::ParamSet;

/// playop - playbook operator
#[derive(Parser, Debug)]
#[command(name = "playop")]
#[command(version)]
#[command(about = "Reconcile declared resources by running idempotent provisioning playbooks")]
#[command(
    long_about = "playop watches a directory of resource manifests and, for every change, runs the playbook registered for the resource kind with the resolved parameters, recording the outcome on the resource status."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct Common {
    /// Controller configuration file (TOML or JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Parameter override, above spec values (repeatable)
    #[arg(short = 'e', long = "extra-var", value_name = "KEY=VALUE", value_parser = parse_extra_var)]
    pub extra_vars: Vec<(String, String)>,
}

impl Common {
    /// Overrides as a parameter set.
    pub fn overrides(&self) -> ParamSet {
        self.extra_vars
            .iter()
            .map(|(key, value)| (key.clone(), value.clone().into()))
            .collect()
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the controller against a manifest directory
    Run {
        #[command(flatten)]
        common: Common,

        /// Directory of YAML resource manifests
        #[arg(short, long, default_value = "manifests")]
        manifests: PathBuf,

        /// Manifest poll interval in milliseconds
        #[arg(long, default_value_t = 2000)]
        poll_interval_ms: u64,

        /// Worker count (overrides configuration)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Print the resolved parameters for a manifest, secrets masked
    Resolve {
        #[command(flatten)]
        common: Common,

        /// Manifest file
        manifest: PathBuf,

        /// Resolve for this action instead of the manifest's own
        #[arg(short, long)]
        action: Option<String>,
    },
}

fn parse_extra_var(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}
