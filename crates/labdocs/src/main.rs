use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use labdocs_core::audit::{AuditReader, TableStrictness};
use labdocs_core::bookstack::{BookStackApi, BookStackClient, BookStackClientConfig};
use labdocs_core::bootstrap::{
    BootstrapOptions, DEFAULT_ADMIN_EMAIL, DEFAULT_ADMIN_PASSWORD, DEFAULT_CREDENTIALS_FILENAME,
    DEFAULT_TOKEN_NAME, run_bootstrap,
};
use labdocs_core::config::{LabDocsConfig, load_config};
use labdocs_core::context::{DocsContext, build_context};
use labdocs_core::notify::send_notification;
use labdocs_core::render::TemplateRenderer;
use labdocs_core::runner::run_audit;
use labdocs_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, resolve_audit_script, resolve_paths,
    resolve_results_dir,
};
use labdocs_core::sync::{SyncOptions, SyncStats, unconfigured_api_stats, update_docs};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "labdocs",
    version,
    about = "Sync homelab audit results into BookStack documentation"
)]
struct Cli {
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_name = "DIR")]
    templates: Option<PathBuf>,
    #[arg(short, long, help = "Run the audit script before updating")]
    audit: bool,
    #[arg(short, long, help = "Update BookStack pages from audit results")]
    update: bool,
    #[arg(short = 'n', long, help = "Log intended changes without writing them")]
    dry_run: bool,
    #[arg(long, help = "Send a Discord summary after updating")]
    notify: bool,
    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Render one template against the current audit results.
    Render(RenderArgs),
    /// Print the template context built from the current audit results.
    Context,
    /// Create the configured books and chapters and an API token via the web UI.
    Bootstrap(BootstrapArgs),
}

#[derive(Debug, Args)]
struct RenderArgs {
    template: String,
}

#[derive(Debug, Args)]
struct BootstrapArgs {
    #[arg(long, help = "BookStack base URL (defaults to bookstack.url)")]
    url: Option<String>,
    #[arg(long, env = "BOOKSTACK_ADMIN_EMAIL", default_value = DEFAULT_ADMIN_EMAIL)]
    email: String,
    #[arg(
        long,
        env = "BOOKSTACK_ADMIN_PASSWORD",
        default_value = DEFAULT_ADMIN_PASSWORD,
        hide_env_values = true
    )]
    password: String,
    #[arg(long, default_value = DEFAULT_TOKEN_NAME)]
    token_name: String,
    #[arg(long, value_name = "PATH", help = "Where to write the credentials YAML")]
    credentials: Option<PathBuf>,
    #[arg(long, help = "Leave the config file's token fields untouched")]
    no_config_update: bool,
}

fn main() -> Result<ExitCode> {
    let _ = dotenvy::dotenv();
    let mut cli = Cli::parse();
    init_tracing(cli.verbose);

    let paths = resolve_paths(
        &PathOverrides {
            config: cli.config.clone(),
            templates_dir: cli.templates.clone(),
        },
        &ResolutionContext::from_process()?,
    );
    debug!("resolved paths\n{}", paths.diagnostics());

    let mut config = load_config(&paths.config_path)?;
    config.apply_env_overrides();

    match cli.command.take() {
        Some(Commands::Render(args)) => run_render(&config, &paths, &args.template),
        Some(Commands::Context) => run_context(&config, &paths),
        Some(Commands::Bootstrap(args)) => run_bootstrap_command(&config, &paths, args),
        None => run_updater(&cli, &config, &paths),
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run_updater(cli: &Cli, config: &LabDocsConfig, paths: &ResolvedPaths) -> Result<ExitCode> {
    if cli.audit {
        let Some(script) = resolve_audit_script(config, paths)? else {
            error!("Audit failed: audit.script is not configured");
            return Ok(ExitCode::FAILURE);
        };
        if let Err(err) = run_audit(&script, Duration::from_secs(config.audit.timeout_secs)) {
            error!("Audit failed: {err:#}");
            return Ok(ExitCode::FAILURE);
        }
    }

    let mut stats = SyncStats::default();
    if cli.update {
        let context = load_context(config, paths)?;
        let renderer = TemplateRenderer::new(&paths.templates_dir);
        let options = SyncOptions {
            dry_run: cli.dry_run,
        };
        stats = match (config.bookstack_url(), config.api_credentials()) {
            (Some(url), Some(credentials)) => {
                let mut client =
                    BookStackClient::new(BookStackClientConfig::new(&url, credentials))?;
                let stats = update_docs(&mut client, &config.books, &renderer, &context, &options);
                debug!(requests = client.request_count(), "BookStack session done");
                stats
            }
            _ => unconfigured_api_stats(&config.missing_api_settings()),
        };
        info!("Update complete: {stats}");
    }

    if cli.notify
        && let Err(err) = send_notification(config, &stats)
    {
        warn!("Failed to send notification: {err:#}");
    }

    Ok(if stats.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn run_render(config: &LabDocsConfig, paths: &ResolvedPaths, template: &str) -> Result<ExitCode> {
    let context = load_context(config, paths)?;
    let renderer = TemplateRenderer::new(&paths.templates_dir);
    let markdown = renderer.render(template, &context)?;
    println!("{markdown}");
    Ok(ExitCode::SUCCESS)
}

fn run_context(config: &LabDocsConfig, paths: &ResolvedPaths) -> Result<ExitCode> {
    let context = load_context(config, paths)?;
    let json =
        serde_json::to_string_pretty(&context).context("failed to serialize docs context")?;
    println!("{json}");
    Ok(ExitCode::SUCCESS)
}

fn run_bootstrap_command(
    config: &LabDocsConfig,
    paths: &ResolvedPaths,
    args: BootstrapArgs,
) -> Result<ExitCode> {
    let Some(url) = args.url.or_else(|| config.bookstack_url()) else {
        bail!("BookStack URL is required: pass --url or set bookstack.url");
    };
    let options = BootstrapOptions {
        url,
        email: args.email,
        password: args.password,
        token_name: args.token_name,
        credentials_path: args
            .credentials
            .unwrap_or_else(|| paths.config_dir().join(DEFAULT_CREDENTIALS_FILENAME)),
        config_path: (!args.no_config_update).then(|| paths.config_path.clone()),
    };
    let report = run_bootstrap(&options, &config.books)?;
    if report.failures > 0 {
        warn!("{} book or chapter creations failed", report.failures);
    }
    Ok(ExitCode::SUCCESS)
}

fn load_context(config: &LabDocsConfig, paths: &ResolvedPaths) -> Result<DocsContext> {
    let results_dir = resolve_results_dir(config, paths)?;
    let strictness = TableStrictness::from_strict_flag(config.audit.strict);
    debug!(
        "reading audit results from {} ({strictness:?})",
        results_dir.display()
    );
    build_context(&AuditReader::new(results_dir, strictness))
}
