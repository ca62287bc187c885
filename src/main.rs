//! pipemesh - Main Entry Point
//!
//! One binary for every role: running a pipeline locally (`load`), hosting
//! jobs (`serve`) and driving deployments across hosts (`deploy`, `run`,
//! `kill`, ...).

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use pipemesh::config::Settings;
use pipemesh::deploy::{DistributedPlanner, ParallelRewriter};
use pipemesh::jobs::{Job, JobDaemon, LoaderCommand, Orchestrator, StatusLine, TcpTransport};
use pipemesh::pipeline::{extract_hosts, Loader, ModuleRegistry, PipelineGraph};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DAEMON_LOG_FILE: &str = "pipemesh-daemon.log";

#[derive(Parser, Debug)]
#[command(name = "pipemesh", version, about = "Dataflow pipelines across hosts")]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build and run a pipeline description in this process
    Load {
        #[arg(long)]
        json: PathBuf,
    },
    /// Run the job daemon
    Serve(ServeArgs),
    /// List the module types compiled into this binary
    Types,
    /// Print the effective settings, or write them out
    Config {
        /// Write to the settings file instead of printing
        #[arg(long)]
        write: bool,
    },
    /// Write the pipeline with `#parallel` modules expanded
    Gen(RemoteArgs),
    /// Verify, create and start the pipeline on every host
    Deploy(RemoteArgs),
    /// Deploy, wait for Enter, then kill and clear
    Run(RemoteArgs),
    /// Kill a job on one host
    Kill(RemoteArgs),
    /// Kill a job on every host of a description
    Killall(RemoteArgs),
    /// Clear a job on one host, or on every host of `--json`
    Clear(RemoteArgs),
    /// Report whether a job runs on one host
    Isrunning(RemoteArgs),
    /// List the jobs of one host
    List(RemoteArgs),
    /// List the module types of one host
    Modules(RemoteArgs),
    /// Write every host's sub-pipeline to a file
    Dumpconfig(RemoteArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Directory for job descriptions and their output; must exist
    #[arg(long)]
    outputdir: Option<PathBuf>,

    #[arg(long)]
    port: Option<u16>,

    /// Loader executable, called with `--json <file>`
    #[arg(long)]
    loaderpath: Option<PathBuf>,

    /// Run this description once as job `testid`, stop on Enter
    #[arg(long)]
    check: Option<PathBuf>,

    /// Also log to a daily rolling file in the output directory
    #[arg(long)]
    logfile: bool,
}

#[derive(Args, Debug)]
struct RemoteArgs {
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Daemon port
    #[arg(long)]
    port: Option<u16>,

    /// First port for network bridges
    #[arg(long)]
    baseport: Option<u16>,

    /// Pipeline description
    #[arg(long)]
    json: Option<PathBuf>,

    #[arg(long)]
    outputjson: Option<PathBuf>,

    #[arg(long)]
    jobid: Option<String>,
}

impl RemoteArgs {
    fn json(&self, command: &str) -> anyhow::Result<&Path> {
        match &self.json {
            Some(path) => Ok(path),
            None => bail!("{} command requires json parameter", command),
        }
    }

    fn jobid(&self, command: &str) -> anyhow::Result<&str> {
        match &self.jobid {
            Some(id) => Ok(id),
            None => bail!("{} command requires jobid parameter", command),
        }
    }

    fn jobid_or_new(&self) -> String {
        self.jobid
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    fn json_stem(&self) -> String {
        self.json
            .as_deref()
            .and_then(Path::file_stem)
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    let file_log_dir = match &cli.command {
        Commands::Serve(args) if args.logfile || settings.daemon.log_to_file => Some(
            args.outputdir
                .clone()
                .unwrap_or_else(|| settings.daemon.output_dir.clone()),
        ),
        _ => None,
    };
    let _guard = init_logging(&settings.logging.filter, file_log_dir.as_deref());

    run(cli, settings).inspect_err(|e| tracing::error!("{:#}", e))
}

/// Stderr logging, plus a daily rolling file when `file_dir` is set.
fn init_logging(default_filter: &str, file_dir: Option<&Path>) -> Option<WorkerGuard> {
    let (file_layer, guard) = match file_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, DAEMON_LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    guard
}

fn run(cli: Cli, settings: Settings) -> anyhow::Result<()> {
    let registry = Arc::new(ModuleRegistry::with_builtins());
    match cli.command {
        Commands::Load { json } => {
            let graph = PipelineGraph::from_file(&json)?;
            Loader::run_to_completion(registry, &graph)
                .with_context(|| format!("running {:?}", json))?;
        }
        Commands::Serve(args) => serve(args, &settings, registry)?,
        Commands::Types => {
            for name in registry.list_types() {
                if let Some(factory) = registry.factory(&name) {
                    let marker = if factory.can_be_source() { " [source]" } else { "" };
                    println!("{:<16}{}{}", name, factory.description(), marker);
                }
            }
        }
        Commands::Config { write } => {
            if write {
                let path = cli
                    .config
                    .or_else(pipemesh::config::default_settings_path)
                    .context("cannot determine settings location")?;
                settings.save(&path)?;
                println!("Settings written to {}", path.display());
            } else {
                print!("{}", settings.to_toml_string()?);
            }
        }
        Commands::Gen(args) => {
            let graph = load_expanded(args.json("gen")?)?;
            let jobid = args.jobid_or_new();
            let file = args.outputjson.clone().unwrap_or_else(|| {
                PathBuf::from(format!(
                    "output_{}_{}_{}.json",
                    jobid,
                    args.json_stem(),
                    args.host
                ))
            });
            std::fs::write(&file, graph.to_json_pretty()?)
                .with_context(|| format!("writing {:?}", file))?;
            println!("Done generating local config: {}", file.display());
        }
        Commands::Deploy(args) => {
            deploy(&args, &settings, false)?;
        }
        Commands::Run(args) => {
            deploy(&args, &settings, true)?;
        }
        Commands::Kill(args) => {
            let jobid = args.jobid("kill")?;
            let orchestrator = orchestrator(&args, &settings)?;
            println!("{}", orchestrator.kill_status(&args.host, jobid));
        }
        Commands::Killall(args) => {
            let hosts = hosts_of(args.json("killall")?)?;
            let jobid = args.jobid("killall")?;
            print_lines(&orchestrator(&args, &settings)?.kill_all(&hosts, jobid));
        }
        Commands::Clear(args) => {
            let jobid = args.jobid("clear")?;
            let orchestrator = orchestrator(&args, &settings)?;
            match &args.json {
                Some(json) => print_lines(&orchestrator.clear_all(&hosts_of(json)?, jobid)),
                None => println!("{}", orchestrator.clear_status(&args.host, jobid)),
            }
        }
        Commands::Isrunning(args) => {
            let jobid = args.jobid("isrunning")?;
            println!("{}", orchestrator(&args, &settings)?.running_status(&args.host, jobid));
        }
        Commands::List(args) => {
            print_lines(&orchestrator(&args, &settings)?.list_status(&args.host));
        }
        Commands::Modules(args) => {
            let modules = orchestrator(&args, &settings)?.modules(&args.host)?;
            if !modules.is_empty() {
                println!("{}", modules.join(","));
            }
        }
        Commands::Dumpconfig(args) => {
            let graph = load_expanded(args.json("dumpconfig")?)?;
            let jobid = args.jobid_or_new();
            let plan = planner(&args, &settings).plan(&graph)?;
            for (host, config) in plan.iter() {
                let file = format!("{}_{}_{}.json", jobid, args.json_stem(), host);
                std::fs::write(&file, config.to_json_pretty()?)
                    .with_context(|| format!("writing {}", file))?;
                println!("{}", file);
            }
        }
    }
    Ok(())
}

fn serve(args: ServeArgs, settings: &Settings, registry: Arc<ModuleRegistry>) -> anyhow::Result<()> {
    let output_dir = args
        .outputdir
        .unwrap_or_else(|| settings.daemon.output_dir.clone());
    let loader = match args.loaderpath.or_else(|| settings.daemon.loader_path.clone()) {
        Some(path) => {
            let path = path
                .canonicalize()
                .with_context(|| format!("invalid loader path {:?}", path))?;
            LoaderCommand::new(path)
        }
        None => LoaderCommand::new(std::env::current_exe()?).arg("load"),
    };
    let mut daemon = JobDaemon::new(loader.clone(), &output_dir, registry)?;

    if let Some(check) = args.check {
        let json = std::fs::read_to_string(&check)
            .with_context(|| format!("reading {:?}", check))?;
        tracing::info!("testing with file {:?}", check);
        let mut job = Job::create(loader, daemon.output_dir(), "testid", &json)?;
        job.start()?;
        println!("Press Enter to terminate...");
        wait_for_enter();
        job.kill();
        job.clear();
        return Ok(());
    }

    let port = args.port.unwrap_or(settings.daemon.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("cannot listen on port {}", port))?;
        daemon.serve(listener, std::future::pending()).await?;
        Ok::<(), anyhow::Error>(())
    })
}

fn deploy(args: &RemoteArgs, settings: &Settings, wait: bool) -> anyhow::Result<()> {
    let command = if wait { "run" } else { "deploy" };
    let graph = load_expanded(args.json(command)?)?;
    let jobid = args.jobid_or_new();
    let plan = planner(args, settings).plan(&graph)?;
    let orchestrator = orchestrator(args, settings)?;

    println!("Deploying pipeline jobs");
    print_lines(&orchestrator.deploy(&plan, &jobid)?);

    if wait {
        println!("[Press enter to stop execution...]");
        wait_for_enter();
        print_lines(&orchestrator.stop(&plan.hosts(), &jobid));
    }
    Ok(())
}

fn load_expanded(json: &Path) -> anyhow::Result<PipelineGraph> {
    let graph = PipelineGraph::from_file(json)?;
    graph.validate()?;
    Ok(ParallelRewriter::new().rewrite(&graph)?)
}

fn hosts_of(json: &Path) -> anyhow::Result<std::collections::BTreeSet<String>> {
    let text = std::fs::read_to_string(json).with_context(|| format!("reading {:?}", json))?;
    Ok(extract_hosts(&text)?)
}

fn planner(args: &RemoteArgs, settings: &Settings) -> DistributedPlanner {
    DistributedPlanner::new(args.baseport.unwrap_or(settings.deploy.base_port))
}

fn orchestrator(args: &RemoteArgs, settings: &Settings) -> anyhow::Result<Orchestrator<TcpTransport>> {
    let transport = TcpTransport::new(settings.deploy.request_timeout())?;
    Ok(Orchestrator::new(
        transport,
        args.port.unwrap_or(settings.deploy.port),
    ))
}

fn print_lines(lines: &[StatusLine]) {
    for line in lines {
        println!("{}", line);
    }
}

fn wait_for_enter() {
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);
}
