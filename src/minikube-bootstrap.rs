use std::convert::TryFrom;
use std::sync::Arc;

use bootstrapper::binaries::DirectoryCache;
use bootstrapper::config::{Config, Target};
use bootstrapper::driver::{ssh_runner, ExistingMachine};
use bootstrapper::Bootstrapper;
use command_runner::{KicRunner, LocalRunner, Runner};
use kube::config::{KubeConfigOptions, Kubeconfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = Config::new_from_flags(env!("CARGO_PKG_VERSION"))?;

    let runner: Arc<dyn Runner> = match &config.target {
        Target::Local => Arc::new(LocalRunner::new()),
        Target::Oci { binary, container } => Arc::new(KicRunner::new(binary, container)),
        Target::Ssh {
            host,
            port,
            user,
            key_path,
        } => Arc::new(ssh_runner(&ExistingMachine {
            ip: host.clone(),
            ssh_port: *port,
            ssh_user: user.clone(),
            ssh_key: key_path.clone(),
        })?),
    };

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let mut bootstrapper = Bootstrapper::new(runner, Arc::new(DirectoryCache::new(&config.cache_dir)))
        .with_cancellation(cancel);
    if let Some(path) = &config.kubeconfig {
        let kubeconfig = Kubeconfig::read_from(path)?;
        let kube_config =
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
        bootstrapper = bootstrapper.with_client(kube::Client::try_from(kube_config)?);
    }

    if config.delete {
        return bootstrapper.delete_cluster(&config.cluster).await;
    }
    bootstrapper.reconcile(&config.cluster).await?;
    if let Some(interval) = config.addon_reconcile_interval {
        bootstrapper
            .spawn_addon_reconciler(&config.cluster, interval)
            .await?;
    }
    Ok(())
}

async fn cancel_on_signal(token: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("signal received, cancelling");
            token.cancel();
        }
        Err(e) => warn!(error = %e, "unable to listen for ctrl-c"),
    }
}
