//! `cellsmith run`: run a cell image and, optionally, its dependencies.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use cellsmith_common::config::CellsmithConfig;
use cellsmith_common::error::{CellsmithError, Result};
use cellsmith_deps::engine::{Engine, RunOutcome, RunPlan, RunRequest};
use cellsmith_deps::render;
use cellsmith_image::store::LocalImageStore;
use cellsmith_runtime::kubectl::KubectlClient;
use cellsmith_runtime::starter::ImageStarter;
use clap::Args;

use crate::output::{self, BOLD, CYAN, DIM, GREEN, RESET, YELLOW};

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Cell image to run, `[registry/]org/name:version`.
    pub image: String,

    /// Name of the instance to create; generated when omitted.
    #[arg(short = 'n', long = "name")]
    pub name: Option<String>,

    /// Resolve and start the full dependency tree.
    #[arg(short = 'd', long)]
    pub start_dependencies: bool,

    /// Share generated dependency instances created from the same image.
    #[arg(short = 's', long)]
    pub share_instances: bool,

    /// Link an alias to an instance, `[parent.]alias:instance`.
    #[arg(short = 'l', long = "link", value_name = "LINK")]
    pub links: Vec<String>,

    /// Environment variable for an instance, `[instance.]KEY=value`.
    #[arg(short = 'e', long = "env", value_name = "ENV")]
    pub env: Vec<String>,

    /// Skip the confirmation prompt.
    #[arg(short = 'y', long)]
    pub assume_yes: bool,
}

/// Executes the `run` command.
///
/// # Errors
///
/// Returns an error if configuration cannot be loaded, the run is declined,
/// or any resolution, validation, or start phase fails.
pub fn execute(args: RunArgs) -> anyhow::Result<()> {
    let total_start = Instant::now();
    let config = CellsmithConfig::load()?;
    let engine = build_engine(&config)?;

    let assume_yes = args.assume_yes;
    let request = RunRequest {
        image: args.image,
        instance: args.name,
        start_dependencies: args.start_dependencies,
        share_instances: args.share_instances,
        links: args.links,
        env: args.env,
    };

    let runtime = tokio::runtime::Runtime::new()?;
    let outcome = runtime.block_on(engine.run(request, |plan| confirm(plan, assume_yes)))?;

    report(&outcome, total_start);
    Ok(())
}

fn build_engine(config: &CellsmithConfig) -> anyhow::Result<Engine> {
    let store = Arc::new(LocalImageStore::new(config));
    let kubectl = Arc::new(KubectlClient::from_config(config)?);
    let starter = Arc::new(ImageStarter::new(store.clone(), kubectl.clone(), config));
    Ok(Engine::new(store, kubectl.clone(), kubectl, starter, config))
}

/// Shows the plan and asks whether to go on.
fn confirm(plan: &RunPlan<'_>, assume_yes: bool) -> Result<bool> {
    eprintln!();
    eprintln!("  {BOLD}Main instance:{RESET} {} {DIM}({}){RESET}", plan.instance, plan.image);
    for warning in plan.warnings {
        eprintln!("  {YELLOW}Warning:{RESET} {warning}");
    }

    eprintln!();
    for line in output::instance_table(&render::instance_rows(plan.tree)) {
        eprintln!("  {line}");
    }
    eprintln!();
    eprintln!("  {BOLD}Dependency Tree:{RESET}");
    for line in render::tree_lines(plan.tree) {
        eprintln!("    {line}");
    }
    eprintln!();

    if assume_yes {
        return Ok(true);
    }
    eprint!("  Do you wish to continue with starting above Cell instances (Y/n)? ");
    let _ = std::io::stderr().flush();

    read_answer(&mut std::io::stdin().lock())
}

/// Reads one answer line. An empty line accepts, end of input declines.
fn read_answer(reader: &mut impl BufRead) -> Result<bool> {
    let mut answer = String::new();
    let read = reader
        .read_line(&mut answer)
        .map_err(|source| CellsmithError::Io {
            path: PathBuf::from("<stdin>"),
            source,
        })?;
    if read == 0 {
        return Ok(false);
    }
    Ok(matches!(answer.trim(), "" | "y" | "Y" | "yes" | "Yes"))
}

fn report(outcome: &RunOutcome, total_start: Instant) {
    eprintln!();
    eprintln!(
        "  {GREEN}{BOLD}Started {}{RESET} instance(s) in {:.1}s:",
        outcome.report.started.len(),
        total_start.elapsed().as_secs_f64()
    );
    eprintln!();
    for started in &outcome.report.started {
        let took = (started.ready_at - started.started_at).num_milliseconds();
        eprintln!(
            "    {GREEN}●{RESET} {BOLD}{}{RESET} {DIM}[{}]{RESET} {CYAN}{}{RESET} {DIM}ready in {}{RESET}",
            started.instance,
            started.image,
            started.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            output::format_millis(took),
        );
    }
    eprintln!();
    eprintln!(
        "  Instance {BOLD}{}{RESET} from image {} is up.",
        outcome.instance, outcome.image
    );
}
