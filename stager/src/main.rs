//! Stager CLI: catalog repositories and drive agent sessions that prepare
//! them for test generation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use stager::catalog::Catalog;
use stager::core::plan::Plan;
use stager::io::agent::CodexGateway;
use stager::io::config::load_config;
use stager::io::ledger::{PLAN_DIR, PLAN_FILE};
use stager::io::sandbox::MountNamespaceRunner;
use stager::session::{RepoSource, SessionStore};
use stager::{exit_codes, logging, prepare};

#[derive(Parser)]
#[command(
    name = "stager",
    version,
    about = "Stage third-party repositories for agent-driven test generation"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a catalog entry and its build session for `owner/repo`.
    New { project: String },
    /// Drive the build session until the repository is prepared.
    Build { project: String },
    /// Generate tests for one target (`path` or `path:symbol`) in a fork of
    /// the build session.
    Test { project: String, target: String },
    /// Detect the build system at `path`, write `.stager/plan.json`, and
    /// execute the preparation steps (idempotent; intended to run inside a
    /// build session).
    Prepare {
        #[arg(default_value = ".")]
        path: PathBuf,
    },
    /// Run the test commands declared in `.stager/plan.json` at `path`.
    RunTests {
        #[arg(default_value = ".")]
        path: PathBuf,
    },
}

fn main() {
    logging::init();
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(exit_codes::INVALID);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::New { project } => cmd_new(&project),
        Command::Build { project } => cmd_build(&project),
        Command::Test { project, target } => cmd_test(&project, &target),
        Command::Prepare { path } => cmd_prepare(&path),
        Command::RunTests { path } => cmd_run_tests(&path),
    }
}

struct Runtime {
    store: SessionStore,
    catalog: Catalog,
    gateway: CodexGateway<MountNamespaceRunner>,
}

fn runtime() -> Result<Runtime> {
    let home = dirs::home_dir().context("cannot determine home directory")?;
    let cfg = load_config(&home.join(".stager").join("config.toml"), &home)?;
    Ok(Runtime {
        store: SessionStore::new(
            cfg.sessions_root,
            cfg.archive_root,
            cfg.apparent_root,
            Duration::from_secs(cfg.run_timeout_secs),
        ),
        catalog: Catalog::new(cfg.catalog_root),
        gateway: CodexGateway::new(MountNamespaceRunner, cfg.agent.api_key),
    })
}

fn cmd_new(project: &str) -> Result<()> {
    let source = RepoSource::github(project)?;
    let rt = runtime()?;
    let id = rt.catalog.catalog_new(&rt.store, &source)?;
    println!("created catalog entry {project} with build session {id}");
    Ok(())
}

fn cmd_build(project: &str) -> Result<()> {
    let source = RepoSource::github(project)?;
    let rt = runtime()?;
    let id = rt.catalog.catalog_build(&rt.store, &rt.gateway, &source)?;
    println!("built {project} in session {id}");
    Ok(())
}

fn cmd_test(project: &str, target: &str) -> Result<()> {
    let source = RepoSource::github(project)?;
    let rt = runtime()?;
    let id = rt
        .catalog
        .catalog_test(&rt.store, &rt.gateway, &source, target)?;
    println!("finished target {target} of {project} in session {id}");
    Ok(())
}

fn cmd_prepare(path: &Path) -> Result<()> {
    let root = path
        .canonicalize()
        .with_context(|| format!("resolve {}", path.display()))?;
    let plan = prepare::prepare_repo(&root)?;
    println!(
        "prepared {} ({} plan, {} test command(s))",
        root.display(),
        serde_json::to_value(plan.kind)?.as_str().unwrap_or("?"),
        plan.test.len()
    );
    Ok(())
}

fn cmd_run_tests(path: &Path) -> Result<()> {
    let root = path
        .canonicalize()
        .with_context(|| format!("resolve {}", path.display()))?;
    let plan_path = root.join(PLAN_DIR).join(PLAN_FILE);
    let contents = std::fs::read_to_string(&plan_path)
        .with_context(|| format!("read plan {} (run `stager prepare` first)", plan_path.display()))?;
    let plan: Plan = serde_json::from_str(&contents)
        .with_context(|| format!("parse plan {}", plan_path.display()))?;
    let output = prepare::run_tests(&root, &plan)?;
    print!("{}", String::from_utf8_lossy(&output.stdout));
    eprint!("{}", String::from_utf8_lossy(&output.stderr));
    Ok(())
}
