//! retest CLI - change-aware detection test orchestration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use retest::config::{self, BackendConfig, Config};
use retest::content::{ContentIndex, ContentItem};
use retest::instance::docker::DockerBackend;
use retest::instance::remote::RemoteHostBackend;
use retest::instance::{InstanceManager, LifecycleManager, RestApi};
use retest::report::{JunitReport, ResultCollector, print_summary};
use retest::resolver::{ChangeSetResolver, SelectionMode};
use retest::scheduler::{SchedulerConfig, TestScheduler};
use retest::vcs::GitCli;

#[derive(Parser)]
#[command(name = "retest")]
#[command(about = "Change-aware test orchestration for detection content", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "retest.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Select content and run its tests
    Run {
        /// Override the selection mode (all, selected, changed)
        #[arg(short, long)]
        mode: Option<String>,

        /// Override the number of test instances
        #[arg(short, long)]
        instances: Option<usize>,

        /// Content file to test; implies `--mode selected` when no mode is given
        #[arg(short, long = "detection")]
        detections: Vec<PathBuf>,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,
    },

    /// Show the content a run would test, without running anything
    Resolve {
        /// Override the selection mode (all, selected, changed)
        #[arg(short, long)]
        mode: Option<String>,

        /// Content file to select
        #[arg(short, long = "detection")]
        detections: Vec<PathBuf>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            mode,
            instances,
            detections,
            junit,
        } => {
            let mut config = load(&cli.config)?;
            apply_selection(&mut config, mode, detections);
            if let Some(instances) = instances {
                config.retest.instances = instances.max(1);
            }
            let code = run_tests(config, junit).await?;
            std::process::exit(code);
        }
        Commands::Resolve {
            mode,
            detections,
            format,
        } => {
            let mut config = load(&cli.config)?;
            apply_selection(&mut config, mode, detections);
            resolve_content(&config, format).await
        }
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(),
    }
}

fn load(path: &Path) -> Result<Config> {
    let mut config = config::load_config(path)?;
    config.content.root = std::path::absolute(&config.content.root).with_context(|| {
        format!(
            "Failed to resolve content root {}",
            config.content.root.display()
        )
    })?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

fn apply_selection(config: &mut Config, mode: Option<String>, detections: Vec<PathBuf>) {
    if !detections.is_empty() {
        config.selection.detections = detections;
        if mode.is_none() {
            config.retest.mode = SelectionMode::Selected.to_string();
        }
    }
    if let Some(mode) = mode {
        config.retest.mode = mode;
    }
}

async fn select(config: &Config) -> Result<Vec<ContentItem>> {
    let mode: SelectionMode = config.retest.mode.parse()?;
    let index = ContentIndex::load(&config.content.manifest, &config.content.root)?;
    info!(
        "Loaded {} content item(s) from {}",
        index.len(),
        config.content.manifest.display()
    );

    let git = GitCli::new(config.repo_path());
    let items = ChangeSetResolver::new(Some(&git), &config.content.root)
        .with_layout(config.content.layout.clone())
        .with_filter(config.content.filter.clone())
        .resolve(
            mode,
            &index,
            &config.change_range(),
            &config.selection.detections,
        )
        .await?;
    Ok(items)
}

async fn run_tests(config: Config, junit_override: Option<PathBuf>) -> Result<i32> {
    let items = select(&config).await?;

    match &config.backend {
        BackendConfig::Docker(docker) => {
            let backend = DockerBackend::new(docker.clone())?;
            let api = RestApi::new(&config.instance.api)?;
            let manager = LifecycleManager::new(backend, api, config.instance.clone());
            run_with(&config, &manager, items, junit_override).await
        }
        BackendConfig::Remote(remote) => {
            let backend = RemoteHostBackend::new(remote);
            let api = RestApi::new(&config.instance.api)?;
            let manager = LifecycleManager::new(backend, api, config.instance.clone());
            run_with(&config, &manager, items, junit_override).await
        }
    }
}

async fn run_with<M: InstanceManager>(
    config: &Config,
    manager: &M,
    items: Vec<ContentItem>,
    junit_override: Option<PathBuf>,
) -> Result<i32> {
    info!("Using backend: {}", manager.name());

    let token = CancellationToken::new();
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; tearing down instances");
            ctrl_c.cancel();
        }
    });

    let scheduler = TestScheduler::new(manager, SchedulerConfig::from_config(&config.retest))
        .with_cancellation_token(token);
    let mut collector = ResultCollector::new();
    let stats = scheduler.run(items, &mut collector).await?;
    info!(
        "{} instance(s) became ready, {} infrastructure retry(ies)",
        stats.instances_ready, stats.retries
    );

    print_summary(&collector);

    if config.report.junit || junit_override.is_some() {
        let path = junit_override.unwrap_or_else(|| config.report.junit_path());
        JunitReport::new(&collector).write_to(&path)?;
        info!("Wrote JUnit report to {}", path.display());
    }

    Ok(collector.exit_code())
}

async fn resolve_content(config: &Config, format: Format) -> Result<()> {
    let items = select(config).await?;

    match format {
        Format::Json => {
            let json = serde_json::to_string_pretty(&items)?;
            println!("{}", json);
        }
        Format::Text => {
            println!("Selected {} content item(s):", items.len());
            for item in &items {
                let status = console::style(item.status.to_string()).dim();
                println!("  {} [{}]", item.path.display(), status);
            }
        }
    }

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            if let Err(e) = config.retest.mode.parse::<SelectionMode>() {
                eprintln!("Configuration error: {}", e);
                std::process::exit(1);
            }

            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Mode: {}", config.retest.mode);
            println!("  Instances: {}", config.retest.instances);
            println!("  Job timeout: {}s", config.retest.job_timeout_secs);
            println!("  Retry count: {}", config.retest.retry_count);
            println!("  Manifest: {}", config.content.manifest.display());

            let backend = match &config.backend {
                BackendConfig::Docker(docker) => format!("docker ({})", docker.image),
                BackendConfig::Remote(remote) => {
                    format!("remote ({} host(s))", remote.hosts.len())
                }
            };
            println!("  Backend: {}", backend);

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config() -> Result<()> {
    let path = PathBuf::from("retest.toml");
    if path.exists() {
        eprintln!("retest.toml already exists. Remove it first or edit manually.");
        std::process::exit(1);
    }

    std::fs::write(&path, config::EXAMPLE_CONFIG)?;
    println!("Created retest.toml");
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  retest run");

    Ok(())
}
