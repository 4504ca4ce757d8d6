// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
mod commands;
mod format;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rumi_core::CancellationToken;
use rumi_kernel::{KernelCore, KernelOptions};
use tracing_subscriber::EnvFilter;

/// Exit code for runtime errors.
const EXIT_RUNTIME_ERROR: i32 = 1;
/// Exit code for usage / argument errors (clap exits with 2 automatically).
#[allow(dead_code)]
const EXIT_USAGE_ERROR: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "rumi", version, about = "rumi Kernel operator CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML configuration file. Defaults to the built-in config.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Highest-precedence Flow/Modifier search-path root.
    #[arg(long, global = true, default_value = "flows")]
    flows_dir: PathBuf,

    /// Print machine-readable JSON instead of human-formatted text.
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Pack approval lifecycle.
    Pack {
        #[command(subcommand)]
        action: PackAction,
    },
    /// Capability-handler candidate lifecycle.
    Capability {
        #[command(subcommand)]
        action: CandidateAction,
    },
    /// Pip requirement candidate lifecycle.
    Pip {
        #[command(subcommand)]
        action: CandidateAction,
    },
    /// Network and capability grant issuance.
    Grant {
        #[command(subcommand)]
        action: GrantAction,
    },
    /// SharedDict token operations.
    Dict {
        #[command(subcommand)]
        action: DictAction,
    },
    /// Flow listing and execution.
    Flow {
        #[command(subcommand)]
        action: FlowAction,
    },
    /// Audit log inspection.
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
}

#[derive(Subcommand, Debug)]
enum PackAction {
    /// Rescan the ecosystem root for new or drifted Packs.
    Scan,
    /// List every known Pack and its approval state.
    List,
    /// Show the approval state of a single Pack.
    Status {
        /// Pack identifier.
        pack_id: String,
    },
    /// Approve a Pack and start its broker listener pair.
    Approve {
        /// Pack identifier.
        pack_id: String,
    },
    /// Reject a Pack.
    Reject {
        /// Pack identifier.
        pack_id: String,
        /// Why this Pack was rejected.
        #[arg(long)]
        reason: String,
    },
    /// Re-verify an Approved Pack's manifest against its current file tree.
    Verify {
        /// Pack identifier.
        pack_id: String,
    },
}

#[derive(Subcommand, Debug)]
enum CandidateAction {
    /// Rescan for candidates.
    Scan,
    /// List every tracked candidate and its state.
    List,
    /// Approve a candidate.
    Approve {
        /// Candidate key, as reported by `scan`/`list`.
        key: String,
    },
    /// Reject a candidate.
    Reject {
        /// Candidate key, as reported by `scan`/`list`.
        key: String,
        /// Why this candidate was rejected.
        #[arg(long)]
        reason: String,
    },
    /// Clear strikes/cooldown on a blocked candidate.
    Unblock {
        /// Candidate key, as reported by `scan`/`list`.
        key: String,
    },
}

#[derive(Subcommand, Debug)]
enum GrantAction {
    /// Issue (or replace) a signed network grant for a Pack.
    Network {
        /// Pack identifier.
        pack_id: String,
        /// Allowed domain. Repeat for multiple.
        #[arg(long = "domain")]
        domains: Vec<String>,
        /// Allowed port. Repeat for multiple.
        #[arg(long = "port")]
        ports: Vec<u16>,
        /// Identity of the operator issuing the grant.
        #[arg(long, default_value = "operator")]
        by: String,
    },
    /// Revoke a Pack's network grant.
    RevokeNetwork {
        /// Pack identifier.
        pack_id: String,
    },
    /// Grant a capability permission to a principal, independent of any
    /// candidate install/trust state.
    Capability {
        /// Principal (Pack or handler) identifier.
        principal_id: String,
        /// Permission identifier.
        permission_id: String,
        /// Identity of the operator issuing the grant.
        #[arg(long, default_value = "operator")]
        by: String,
    },
}

#[derive(Subcommand, Debug)]
enum DictAction {
    /// Propose a `(namespace, token) -> value` rule.
    Propose {
        /// Dictionary namespace.
        namespace: String,
        /// Token within the namespace.
        token: String,
        /// Value (or `@other_token` alias) to bind.
        value: String,
        /// Identity proposing the rule.
        #[arg(long, default_value = "operator")]
        provenance: String,
    },
    /// Resolve a token, following its chain to a terminal value.
    Resolve {
        /// Dictionary namespace.
        namespace: String,
        /// Token within the namespace.
        token: String,
    },
    /// Explain the resolution chain for a token without resolving it.
    Explain {
        /// Dictionary namespace.
        namespace: String,
        /// Token within the namespace.
        token: String,
    },
    /// List every rule bound under a namespace.
    List {
        /// Dictionary namespace.
        namespace: String,
    },
    /// Remove a `(namespace, token)` rule.
    Remove {
        /// Dictionary namespace.
        namespace: String,
        /// Token within the namespace.
        token: String,
    },
}

#[derive(Subcommand, Debug)]
enum FlowAction {
    /// List every reachable Flow.
    List,
    /// Run a Flow to completion.
    Run {
        /// Flow identifier.
        flow_id: String,
        /// JSON object passed as the Flow's top-level inputs.
        #[arg(long, default_value = "{}")]
        input: String,
    },
}

#[derive(Subcommand, Debug)]
enum AuditAction {
    /// Print the most recent audit entries across every category.
    Tail {
        /// Number of entries to print.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug { EnvFilter::new("rumi=debug") } else { EnvFilter::new("rumi=info") };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = run(cli).await;

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = rumi_config::load_config(cli.config.as_deref())
        .with_context(|| "failed to load configuration")?;
    let options = KernelOptions { flows_dir: cli.flows_dir };
    let kernel = KernelCore::start(config, options).await.with_context(|| "failed to start kernel")?;

    let outcome = dispatch(&kernel, cli.command, cli.json).await;
    kernel.shutdown().await;
    outcome
}

async fn dispatch(kernel: &KernelCore, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::Pack { action } => commands::pack(kernel, action, json).await,
        Commands::Capability { action } => commands::capability(kernel, action, json).await,
        Commands::Pip { action } => commands::pip(kernel, action, json).await,
        Commands::Grant { action } => commands::grant(kernel, action).await,
        Commands::Dict { action } => commands::dict(kernel, action, json).await,
        Commands::Flow { action } => commands::flow(kernel, action, json, CancellationToken::new()).await,
        Commands::Audit { action } => commands::audit(kernel, action, json).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_without_error() {
        Cli::command().debug_assert();
    }

    #[test]
    fn pack_approve_requires_pack_id() {
        let err = Cli::try_parse_from(["rumi", "pack", "approve"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn grant_network_accepts_repeated_domains() {
        let cli = Cli::try_parse_from([
            "rumi",
            "grant",
            "network",
            "pk1",
            "--domain",
            "a.example",
            "--domain",
            "b.example",
        ])
        .unwrap();
        match cli.command {
            Commands::Grant { action: GrantAction::Network { domains, .. } } => {
                assert_eq!(domains, vec!["a.example", "b.example"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
