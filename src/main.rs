use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use common::models::Operation;
use common::types::InstanceKey;
use config::ConfigManager;
use logging::LogSettings;
use model_hub::{BundleSource, ModelHub, ModelRequest};

/// Bound on waiting for a cancelled instance to settle
const CANCEL_SETTLE_LIMIT: Duration = Duration::from_secs(30);

/// Model Hub - model bundle materialization and deployment
#[derive(Parser, Debug)]
#[command(name = "model-hub")]
#[command(about = "Materialize model bundles and deploy them to an inference server", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file; otherwise discovered and overridden by MODEL_HUB_* variables
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Interval between operation status polls, in milliseconds
    #[arg(long, global = true, default_value = "500")]
    poll_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct InstanceArgs {
    /// Owner scope
    owner: String,

    /// Model id
    model: String,

    /// Instance id
    instance: String,
}

impl InstanceArgs {
    fn key(&self) -> Result<InstanceKey> {
        Ok(InstanceKey::new(&self.owner, &self.model, &self.instance)?)
    }
}

#[derive(clap::Args, Debug)]
struct SourceArgs {
    /// Tar archive, plain or gzip-compressed
    #[arg(long)]
    archive: Option<PathBuf>,

    /// Bundle directory
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Git repository URL
    #[arg(long)]
    git: Option<String>,

    /// Branch or tag of the git repository
    #[arg(long = "ref", requires = "git")]
    reference: Option<String>,
}

impl SourceArgs {
    fn source(self) -> Result<BundleSource> {
        match (self.archive, self.dir, self.git) {
            (Some(path), None, None) => Ok(BundleSource::Archive(path)),
            (None, Some(path), None) => Ok(BundleSource::Directory(path)),
            (None, None, Some(url)) => Ok(BundleSource::Git {
                url,
                reference: self.reference,
            }),
            _ => bail!("exactly one of --archive, --dir or --git is required"),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Materialize a bundle as a new model instance
    Create {
        #[command(flatten)]
        instance: InstanceArgs,

        #[command(flatten)]
        source: SourceArgs,

        /// Deploy the instance once created
        #[arg(long)]
        deploy: bool,
    },

    /// Replace the bundle of an OFFLINE or ERROR instance
    Update {
        #[command(flatten)]
        instance: InstanceArgs,

        #[command(flatten)]
        source: SourceArgs,
    },

    /// Load an instance on the inference server
    Deploy {
        #[command(flatten)]
        instance: InstanceArgs,
    },

    /// Unload an instance from the inference server
    Undeploy {
        #[command(flatten)]
        instance: InstanceArgs,
    },

    /// Remove an instance that is not deployed
    Delete {
        #[command(flatten)]
        instance: InstanceArgs,
    },

    /// Show one instance, or all of them
    Status {
        /// Owner scope
        owner: Option<String>,

        /// Model id
        #[arg(requires = "owner")]
        model: Option<String>,

        /// Instance id
        #[arg(requires = "model")]
        instance: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_manager = match &cli.config {
        Some(path) => ConfigManager::from_file(path),
        None => ConfigManager::new(),
    }
    .context("failed to load configuration")?;
    let config_manager = Arc::new(config_manager);

    let settings = LogSettings::from_config(&config_manager)?;
    let _guard = logging::init(&settings)?;

    let hub = ModelHub::new(config_manager)?;

    let reconciled = hub.reconcile().await?;
    if reconciled > 0 {
        info!("Reconciled {} instances left transitioning", reconciled);
    }

    let poll_interval = Duration::from_millis(cli.poll_ms);

    match cli.command {
        Commands::Create { instance, source, deploy } => {
            let key = instance.key()?;
            let request = ModelRequest {
                key: key.clone(),
                source: source.source()?,
                deploy_requested: deploy,
            };
            let name = hub.create_model(request).await?;
            finish(&hub, &name, &key, poll_interval).await
        }
        Commands::Update { instance, source } => {
            let updated = hub.update_model(&instance.key()?, &source.source()?).await?;
            print_json(&updated)
        }
        Commands::Deploy { instance } => {
            let key = instance.key()?;
            let name = hub.deploy(&key).await?;
            finish(&hub, &name, &key, poll_interval).await
        }
        Commands::Undeploy { instance } => {
            let key = instance.key()?;
            let name = hub.undeploy(&key).await?;
            finish(&hub, &name, &key, poll_interval).await
        }
        Commands::Delete { instance } => {
            let key = instance.key()?;
            hub.delete_model(&key).await?;
            println!("deleted {}", key);
            Ok(())
        }
        Commands::Status { owner, model, instance } => match (owner, model, instance) {
            (Some(owner), Some(model), Some(instance)) => {
                let key = InstanceKey::new(&owner, &model, &instance)?;
                print_json(&hub.get_instance(&key).await?)
            }
            (None, None, None) => print_json(&hub.list_instances().await?),
            _ => bail!("status takes either no arguments or OWNER MODEL INSTANCE"),
        },
    }
}

/// Polls an operation until done; Ctrl+C cancels it
///
/// After a cancel the process stays up until the instance has left
/// TRANSITIONING, since the workflow runs in this process.
async fn finish(hub: &ModelHub, name: &str, key: &InstanceKey, poll_interval: Duration) -> Result<()> {
    println!("{}", name);

    let operation = tokio::select! {
        result = hub.wait_operation(name, poll_interval) => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; cancelling {}", name);
            hub.cancel_operation(name).await?;
            match hub.wait_stable(key, poll_interval, CANCEL_SETTLE_LIMIT).await {
                Ok(instance) => info!("Instance {} settled at {}", key, instance.state),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("Instance {} did not settle: {}", key, e),
            }
            hub.get_operation(name).await?
        }
    };

    report(&operation)
}

fn report(operation: &Operation) -> Result<()> {
    print_json(operation)?;
    match &operation.error {
        Some(error) => bail!("{} failed: {}: {}", operation.name, error.kind, error.message),
        None => Ok(()),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
