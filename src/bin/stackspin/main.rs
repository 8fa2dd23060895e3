mod cli;

use stackspin::stack::paths::absolute_path;
use stackspin::{
    cancel_pair, open_store, CommandInvoker, Coordinator, LockStoreKind, RunConfig, Stack,
    YamlConfigProvider,
};
use std::sync::Arc;

fn main() {
    use clap::Parser;
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("STACKSPIN_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime\n{e}");
            std::process::exit(1);
        }
    };

    match runtime.block_on(dispatch(cli)) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            for error in e.chain() {
                eprintln!("{error}")
            }
            std::process::exit(1);
        }
    }
}

/// Returns whether the command fully succeeded
async fn dispatch(cli: cli::Cli) -> anyhow::Result<bool> {
    let config = load_config(&cli)?;

    match cli.command {
        cli::Command::Plan(plan_cli) => {
            let stack = Stack::discover(&cli.root, &config, &[], &YamlConfigProvider)?;
            let plan = if plan_cli.reverse {
                stack.plan().reversed()
            } else {
                stack.plan().clone()
            };
            match plan_cli.format {
                cli::OutputFormat::Text => print!("{plan}"),
                cli::OutputFormat::Json => {
                    serde_json::to_writer_pretty(std::io::stdout(), &plan)?;
                    println!();
                }
            }
            Ok(true)
        }
        cli::Command::Graph => {
            let stack = Stack::discover(&cli.root, &config, &[], &YamlConfigProvider)?;
            print!("{}", stack.graph());
            Ok(true)
        }
        cli::Command::Run(run_cli) => run(&cli.root, config, run_cli).await,
    }
}

fn load_config(cli: &cli::Cli) -> anyhow::Result<RunConfig> {
    let file_config = match &cli.config {
        Some(path) => RunConfig::from_yaml_file(path)?,
        None => RunConfig::default(),
    };

    let flags = RunConfig {
        max_parallel_modules: cli.parallelism,
        non_interactive: cli.non_interactive,
        ..Default::default()
    };

    let mut config = RunConfig::merge(&file_config, &flags)?;
    if let Some(path) = &cli.lock_db {
        config.lock.store = LockStoreKind::Sqlite { path: path.clone() };
    }
    if cli.memory_locks {
        config.lock.store = LockStoreKind::Memory;
    }
    Ok(config)
}

async fn run(
    root: &std::path::Path,
    config: RunConfig,
    run_cli: cli::RunCommand,
) -> anyhow::Result<bool> {
    let stack = Stack::discover(root, &config, &run_cli.tool_args, &YamlConfigProvider)?;
    let store_kind = config.lock.store.resolve_against(&absolute_path(root)?);
    tracing::debug!(store = ?store_kind, "Opening lock store");
    let lock_store = open_store(&store_kind).await?;

    let (cancel, signal) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing modules in flight");
            cancel.cancel();
        }
    });

    let coordinator =
        Coordinator::new(config, Arc::new(CommandInvoker), lock_store).with_cancel(signal);
    let report = if run_cli.reverse {
        stack.run_reverse(&coordinator).await
    } else {
        stack.run(&coordinator).await
    };

    serde_json::to_writer_pretty(std::io::stdout(), &report)?;
    println!();
    eprintln!("{}", report.summary());

    Ok(report.is_success())
}
