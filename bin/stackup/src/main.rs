//! stackup deploys a graph of interdependent contracts, resolving addresses as it goes.

mod cli;
mod render;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use cli::{Cli, Command, DeployArgs, PlanArgs, StatusArgs};
use stackup_deploy::{
    AbortSignal, Deployer, DeployerBuilder, DeploymentGraph, EXIT_ABORTED, FailurePolicy,
    FileRegistry, ResourceRegistry, RunReport,
};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    match cli.command {
        Command::Deploy(args) => deploy(args).await,
        Command::Plan(args) => plan(args).map(|()| ExitCode::SUCCESS),
        Command::Status(args) => status(args).map(|()| ExitCode::SUCCESS),
    }
}

async fn deploy(args: DeployArgs) -> Result<ExitCode> {
    let deployer = resolve_deployer(&args).await?;

    if args.save_config {
        let path = deployer.save_config()?;
        tracing::info!(path = %path.display(), "Configuration written");
    }

    // The first ctrl+c lets in-flight calls finish, a second one exits right away.
    let abort = AbortSignal::new();
    let signal = abort.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if !signal.abort("interrupted (ctrl+c)") {
                tracing::warn!("Interrupted again, exiting without waiting for in-flight calls");
                std::process::exit(i32::from(EXIT_ABORTED));
            }
        }
    });

    let wiring_exit = deployer.wiring_exit;
    let report = deployer.deploy(&abort).await?;

    if let Some(path) = &args.report {
        write_report(&report, path)?;
    }

    println!("{report}");

    let code = report.exit_code(wiring_exit);
    if code != 0 {
        tracing::warn!(code, "Deployment did not complete cleanly");
    }
    Ok(ExitCode::from(code))
}

/// Load the configuration file if one is given, otherwise build one from the flags.
async fn resolve_deployer(args: &DeployArgs) -> Result<Deployer> {
    if let Some(config_path) = &args.config {
        let mut deployer = Deployer::load_from_file(config_path)?;

        tracing::info!(
            config_path = %config_path.display(),
            network = %deployer.network.name,
            deployments = %deployer.deployments.display(),
            steps = deployer.steps.len(),
            "Loading deployment from config file..."
        );

        if let Some(network) = &args.network {
            deployer.network.name = network.clone();
        }
        if let Some(rpc_url) = &args.rpc_url {
            deployer.network.rpc_url = rpc_url
                .parse()
                .context(format!("Invalid RPC URL: {rpc_url}"))?;
        }
        if let Some(chain_id) = args.chain_id {
            deployer.network.chain_id = Some(chain_id);
        }
        if let Some(account) = args.deployer {
            deployer.network.deployer = Some(account);
        }
        if let Some(artifacts) = &args.artifacts {
            deployer.artifacts = artifacts.clone();
        }
        if let Some(deployments) = &args.deployments {
            deployer.deployments = deployments.clone();
        }
        if let Some(policy) = args.wiring_exit {
            deployer.wiring_exit = policy;
        }
        apply_run_flags(args, &mut deployer);

        return Ok(deployer);
    }

    let graph_path = args
        .graph
        .as_ref()
        .context("Either --config or --graph must be provided")?;
    let graph = DeploymentGraph::load_from_file(graph_path)?;

    let mut builder = DeployerBuilder::new(args.network_or_default()).graph(graph);

    if let Some(rpc_url) = &args.rpc_url {
        builder = builder.rpc_url(rpc_url);
    }
    if let Some(chain_id) = args.chain_id {
        builder = builder.chain_id(chain_id);
    }
    if let Some(account) = args.deployer {
        builder = builder.deployer(account);
    }
    if let Some(artifacts) = &args.artifacts {
        builder = builder.artifacts(artifacts);
    }
    if let Some(deployments) = &args.deployments {
        builder = builder.deployments(deployments);
    }
    if let Some(policy) = args.wiring_exit {
        builder = builder.wiring_exit(policy);
    }

    let mut deployer = builder.build().await?;
    apply_run_flags(args, &mut deployer);
    Ok(deployer)
}

fn apply_run_flags(args: &DeployArgs, deployer: &mut Deployer) {
    if args.redeploy {
        deployer.run.force_redeploy = true;
    }
    if args.continue_on_failure {
        deployer.run.failure_policy = FailurePolicy::ContinueIndependent;
    }
    if let Some(concurrency) = args.concurrency {
        deployer.run.max_concurrency = concurrency;
    }
    if let Some(timeout) = args.step_timeout {
        deployer.run.step_timeout_secs = Some(timeout);
    }
}

fn write_report(report: &RunReport, path: &std::path::Path) -> Result<()> {
    let content = serde_json::to_string_pretty(report).context("Failed to serialize run report")?;
    std::fs::write(path, content)
        .context(format!("Failed to write run report to {}", path.display()))?;
    tracing::info!(path = %path.display(), "Run report written");
    Ok(())
}

/// Load and validate the graph `plan` renders.
fn load_plan_graph(args: &PlanArgs) -> Result<DeploymentGraph> {
    let graph = match (&args.config, &args.graph) {
        (Some(config), _) => Deployer::load_from_file(config)?.graph(),
        (None, Some(graph)) => DeploymentGraph::load_from_file(graph)?,
        (None, None) => anyhow::bail!("Either --config or --graph must be provided"),
    };

    graph.validate().context("Invalid deployment graph")?;
    Ok(graph)
}

fn plan(args: PlanArgs) -> Result<()> {
    let graph = load_plan_graph(&args)?;

    let waves = graph.schedule(args.concurrency);
    println!(
        "{} steps in {} waves (concurrency {})",
        graph.len(),
        waves.len(),
        args.concurrency.max(1)
    );
    println!("{}", render::plan_table(&graph, &waves));
    Ok(())
}

fn status(args: StatusArgs) -> Result<()> {
    if !args.deployments.is_dir() {
        println!(
            "No deployments recorded under {}",
            args.deployments.display()
        );
        return Ok(());
    }

    let registry = FileRegistry::open(&args.deployments)?;
    let entries = registry.list(&args.network)?;

    if entries.is_empty() {
        println!("No deployments recorded for network {}", args.network);
        return Ok(());
    }

    println!("Network: {} ({} deployments)", args.network, entries.len());
    println!("{}", render::status_table(&entries));
    Ok(())
}
