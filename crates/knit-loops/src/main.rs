//! knit-loops - run lifecycle loop process
//!
//! Runs one phase of the lifecycle until its policy stops it or a signal
//! arrives.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use eyre::WrapErr;
use knit_core::{Config, HookConfig, LoopType};
use knit_loops::error::LoopError;
use knit_loops::filewatch;
use knit_loops::kube::KubeClient;
use knit_loops::policy::Policy;
use knit_loops::storage::Storage;
use knit_loops::{start_loop, Environment, LoopManifest};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "knit-loops", about = "Run lifecycle loop", version)]
struct Cli {
    /// Phase to run: projection, initialize, run_management, finishing,
    /// garbage_collection or housekeeping
    #[arg(long = "type", env = "KNIT_LOOP_TYPE")]
    kind: LoopType,

    /// forever, forever:<cooldown> or backlog; append `,until-error` to
    /// stop on the first failure
    #[arg(long, env = "KNIT_LOOP_POLICY", default_value = "forever:30s")]
    policy: Policy,

    /// key=value config file
    #[arg(long, env = "KNIT_LOOPS_CONFIG")]
    config: Option<PathBuf>,

    /// YAML lifecycle hook file
    #[arg(long, env = "KNIT_HOOK_CONFIG")]
    hooks: Option<PathBuf>,

    /// Override `db_path` from the config file
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Override `namespace` from the config file
    #[arg(long)]
    namespace: Option<String>,
}

impl Cli {
    /// Files whose modification stops the loop so a restart picks them up.
    fn watched(&self) -> Vec<PathBuf> {
        self.config.iter().chain(self.hooks.iter()).cloned().collect()
    }

    fn config(&self) -> eyre::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .wrap_err_with(|| format!("loading {}", path.display()))?,
            None => Config::default(),
        };
        if let Some(db_path) = &self.db_path {
            config.db_path.clone_from(db_path);
        }
        if let Some(namespace) = &self.namespace {
            config.namespace.clone_from(namespace);
        }
        Ok(config)
    }

    fn hooks(&self) -> eyre::Result<HookConfig> {
        match &self.hooks {
            Some(path) => HookConfig::from_file(path)
                .wrap_err_with(|| format!("loading {}", path.display())),
            None => Ok(HookConfig::default()),
        }
    }
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = cli.config()?;
    let hooks = cli.hooks()?;
    let watched = cli.watched();
    let manifest = LoopManifest {
        kind: cli.kind,
        policy: cli.policy,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(run(config, hooks, manifest, &watched))
}

async fn run(
    config: Config,
    hooks: HookConfig,
    manifest: LoopManifest,
    watched: &[PathBuf],
) -> eyre::Result<()> {
    let storage = Storage::new(&config.db_path)
        .await
        .wrap_err_with(|| format!("opening {}", config.db_path.display()))?;
    storage.migrate_embedded().await?;

    let kube = Arc::new(KubeClient::from_config(&config)?);
    let http = reqwest::Client::builder()
        .timeout(config.webhook_timeout())
        .build()?;

    let env = Environment {
        storage: Arc::new(storage),
        workers: Arc::clone(&kube) as _,
        volumes: Arc::clone(&kube) as _,
        pods: kube,
        hooks,
        http,
        debounce: config.debounce(),
        cycle_timeout: config.cycle_timeout(),
    };

    let token = CancellationToken::new();
    let _watch = filewatch::cancel_on_modify(&token, watched).wrap_err("watching config files")?;
    info!(kind = %manifest.kind, policy = %manifest.policy, "starting loop");

    let result = {
        let looping = start_loop(&token, &manifest, &env);
        tokio::pin!(looping);

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;

            tokio::select! {
                result = &mut looping => result,
                _ = sigint.recv() => {
                    info!("received SIGINT, stopping loop");
                    token.cancel();
                    looping.await
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, stopping loop");
                    token.cancel();
                    looping.await
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                result = &mut looping => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("received Ctrl+C, stopping loop");
                    token.cancel();
                    looping.await
                }
            }
        }
    };

    match result {
        Ok(()) | Err(LoopError::Cancelled) => {
            info!(kind = %manifest.kind, "loop stopped");
            Ok(())
        }
        Err(e) => {
            error!(kind = %manifest.kind, "loop failed: {e}");
            Err(e.into())
        }
    }
}
