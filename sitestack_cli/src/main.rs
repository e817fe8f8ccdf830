//! `sitestack`: synthesize, deploy, publish, verify and tear down the
//! static site of one environment.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sitestack::config::DEFAULT_CONFIG_FILE;
use sitestack::resources::HostedZone;
use sitestack::verify::{verify, UreqProbe};
use sitestack::{compose, resolve, AwsProvider, Provisioner, SiteConfig};

#[derive(Parser)]
#[command(name = "sitestack")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Provision a static single page application per environment", long_about = None)]
struct Cli {
    /// Site configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Context value as key=value, eg: -c app-environment=dev. Repeatable
    #[arg(short = 'c', long = "context", global = true)]
    context: Vec<String>,

    /// .env style file with context values
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and reports
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the CloudFormation templates and a manifest without deploying
    Synth {
        /// Output directory
        #[arg(short, long, default_value = "sitestack.out")]
        out: PathBuf,

        /// Hosted zone id to use instead of looking it up
        #[arg(long)]
        zone_id: Option<String>,
    },

    /// Deploy both stacks, then publish the artifacts
    Deploy {
        /// Only provision, do not upload artifacts
        #[arg(long)]
        skip_publish: bool,
    },

    /// Upload the artifacts to an already deployed environment
    Publish,

    /// Probe the live site
    Verify {
        /// Per request timeout in seconds
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },

    /// Delete the web stack, then the certificate stack
    Destroy {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },
}

fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}

async fn aws_provider(config: &SiteConfig) -> AwsProvider {
    AwsProvider::from_env().await.with_wait_timeout(config.deploy.stack_timeout())
}

fn print_report<T: Serialize + std::fmt::Debug>(json: bool, report: &T) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report).context("Failed to serialize report")?);
    } else {
        println!("{:#?}", report);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json, level);

    let config = SiteConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {:?}", cli.config))?;
    let context = config.provisioning_context(cli.env_file.as_deref(), cli.context.as_slice())?;
    // fails before anything is declared or any provider call is made
    let environment = resolve(&context)?;
    info!(environment = %environment, "resolved environment");

    match cli.command {
        Commands::Synth { out, zone_id: Some(zone_id) } => {
            let zone = HostedZone::new(zone_id, &config.site.apex_domain);
            let app = compose(&config, &environment, &zone)?;
            let written = app.synth(&out)?;
            print_report(cli.json, &app.manifest()?)?;
            info!(files = written.len(), out = ?out, "synthesized templates");
        }
        Commands::Synth { out, zone_id: None } => {
            let provider = aws_provider(&config).await;
            let app = Provisioner::new(&provider, &config).synth(&environment, &out).await?;
            print_report(cli.json, &app.manifest()?)?;
        }
        Commands::Deploy { skip_publish } => {
            let provider = aws_provider(&config).await;
            let report = Provisioner::new(&provider, &config)
                .deploy_from_context(&context, !skip_publish)
                .await
                .with_context(|| format!("Failed to deploy environment {environment}"))?;
            print_report(cli.json, &report)?;
        }
        Commands::Publish => {
            let provider = aws_provider(&config).await;
            let report = Provisioner::new(&provider, &config)
                .publish(&environment)
                .await
                .with_context(|| format!("Failed to publish environment {environment}"))?;
            print_report(cli.json, &report)?;
        }
        Commands::Verify { timeout_secs } => {
            let provider = aws_provider(&config).await;
            let web = Provisioner::new(&provider, &config).web_outputs(&environment).await?;
            let entry_document = config.site.entry_document.clone();
            let report = tokio::task::spawn_blocking(move || {
                verify(&UreqProbe::new(Duration::from_secs(timeout_secs)), &web, &entry_document)
            })
            .await
            .context("Verification task panicked")??;
            print_report(cli.json, &report)?;
            if !report.passed() {
                let names: Vec<&str> = report.failures().iter().map(|c| c.name).collect();
                bail!("Verification failed: {}", names.join(", "));
            }
        }
        Commands::Destroy { yes } => {
            if !yes {
                bail!("Refusing to delete environment {environment} without --yes");
            }
            let provider = aws_provider(&config).await;
            Provisioner::new(&provider, &config)
                .destroy(&environment)
                .await
                .with_context(|| format!("Failed to destroy environment {environment}"))?;
            info!(environment = %environment, "environment destroyed");
        }
    }
    Ok(())
}
