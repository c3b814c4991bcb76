// src/lib.rs

pub mod channel;
pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod execution;
pub mod logging;
pub mod ports;
pub mod session;
pub mod types;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use crate::cli::{CliArgs, Command};
use crate::config::loader::load_and_validate;
use crate::config::model::ConfigFile;
use crate::engine::{
    ManagerConfig, ManagerDeps, NoLocator, SuiteTreeMapper, TestManager, TestNode, TestTarget, TestTree,
    TracingNotifier,
};
use crate::exec::{CommandLauncher, CommandRunTrigger};
use crate::session::ConsoleResultSink;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - the test manager with the shell launcher and trigger
/// - the requested subcommand
/// - Ctrl-C handling (for `serve`)
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_and_validate(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;
    let base_dir = config_root_dir(&args.config);

    let sink = Arc::new(ConsoleResultSink::default());
    let manager = build_manager(&cfg, base_dir.as_deref(), Arc::clone(&sink));

    let outcome = match args.command {
        Command::Discover => discover(&manager).await,
        Command::Run { names } => run_named(&manager, names, &sink).await,
        Command::Serve => serve(&manager).await,
    };

    if let Err(err) = manager.stop().await {
        warn!(error = %err, "stopping test server");
    }
    outcome
}

fn build_manager(
    cfg: &ConfigFile,
    base_dir: Option<&Path>,
    sink: Arc<ConsoleResultSink>,
) -> TestManager {
    let mut config = ManagerConfig::from_config(cfg);
    let cwd = config
        .launch
        .cwd
        .take()
        .map(|cwd| match base_dir {
            Some(base) if cwd.is_relative() => base.join(cwd),
            _ => cwd,
        })
        .or_else(|| base_dir.map(Path::to_path_buf));
    config.launch.cwd = cwd.clone();

    let trigger = CommandRunTrigger {
        template: cfg.run.trigger.clone(),
        cwd,
        env: cfg.server.env.clone(),
        allow_failure_exit: cfg.run.allow_failure_exit,
    };

    TestManager::new(
        config,
        ManagerDeps {
            launcher: Arc::new(CommandLauncher),
            trigger: Arc::new(trigger),
            mapper: Arc::new(SuiteTreeMapper::new(NoLocator)),
            notifier: Arc::new(TracingNotifier),
            results: sink,
        },
    )
}

/// Directory holding the config file, when it is not the current one.
fn config_root_dir(config_path: &Path) -> Option<std::path::PathBuf> {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Some(parent.to_path_buf()),
        _ => None,
    }
}

async fn discover(manager: &TestManager) -> Result<()> {
    let tree = manager.discover_tests().await?;
    print_tree(&tree);
    Ok(())
}

async fn run_named(manager: &TestManager, names: Vec<String>, sink: &ConsoleResultSink) -> Result<()> {
    let targets: Vec<TestTarget> = names
        .into_iter()
        .map(|name| TestTarget::suite(name.clone(), name))
        .collect();
    manager.run_tests(&targets).await?;

    match sink.last_summary() {
        Some(summary) if summary.failed > 0 => bail!("{} test(s) failed", summary.failed),
        Some(summary) if summary.total() == 0 => {
            warn!("no tests matched the requested names");
            Ok(())
        }
        _ => Ok(()),
    }
}

async fn serve(manager: &TestManager) -> Result<()> {
    let info = manager.start().await?;
    println!(
        "test server running: port {}, event port {}{}",
        info.primary_port,
        info.event_port,
        info.debug_port
            .map(|p| format!(", debug port {p}"))
            .unwrap_or_default()
    );

    tokio::signal::ctrl_c()
        .await
        .context("listening for Ctrl-C")?;
    info!("Ctrl-C received; stopping test server");
    Ok(())
}

fn print_tree(tree: &TestTree) {
    fn print_node(node: &TestNode, depth: usize) {
        let indent = "  ".repeat(depth);
        match node.location.as_ref() {
            Some(loc) => println!("{indent}{} ({}:{})", node.label, loc.file.display(), loc.line),
            None => println!("{indent}{}", node.label),
        }
        for child in &node.children {
            print_node(child, depth + 1);
        }
    }

    if tree.is_empty() {
        println!("no tests found");
        return;
    }
    for root in &tree.roots {
        print_node(root, 0);
    }
    println!("\n{} tests", tree.test_count());
    debug!("discovery output complete");
}
