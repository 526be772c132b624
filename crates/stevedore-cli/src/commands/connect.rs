//! Connect command - open a tunnel, or list connect targets

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use stevedore_core::{ResourceKind, TunnelConfig, TunnelSpec, is_service_url};
use stevedore_kube::{ConnectLabelLookup, KubeCluster, Tunnel, shutdown_signal};

use crate::display;
use crate::error::{CliError, Result};

/// Load configuration from `path`, or the default location
fn load_config(path: Option<&Path>) -> Result<TunnelConfig> {
    let config = match path {
        Some(p) => TunnelConfig::load_from(p)?,
        None => TunnelConfig::load()?,
    };
    tracing::debug!(?config, "loaded tunnel configuration");
    Ok(config)
}

/// Build the spec for a connect invocation
///
/// An in-cluster service URL as target replaces the flags entirely and
/// leaves no target to look up.
fn build_spec(
    target: Option<&str>,
    name: Option<&str>,
    namespace: Option<&str>,
    kind: &str,
    local_port: u16,
    remote_port: u16,
    config: &TunnelConfig,
) -> Result<(TunnelSpec, String)> {
    let target = target.unwrap_or_default();

    if is_service_url(target) {
        let mut spec = TunnelSpec::from_service_url(target)?;
        spec.local_port = local_port;
        return Ok((spec, String::new()));
    }

    let kind: ResourceKind = kind.parse()?;
    let spec = TunnelSpec::new(
        namespace.unwrap_or(&config.namespace),
        kind,
        name.unwrap_or_default(),
        local_port,
        remote_port,
    );
    Ok((spec, target.to_string()))
}

fn spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Run the connect command
#[allow(clippy::too_many_arguments)]
pub async fn run(
    target: Option<&str>,
    name: Option<&str>,
    namespace: Option<&str>,
    kind: &str,
    local_port: u16,
    remote_port: u16,
    cli_only: bool,
    config_path: Option<&Path>,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    let (spec, target) = build_spec(target, name, namespace, kind, local_port, remote_port, &config)?;
    config.auto_open = !cli_only;

    let cluster = KubeCluster::connect().await.map_err(CliError::cluster)?;
    let tunnel = Tunnel::with_cluster(Arc::new(cluster), spec).with_config(config);

    let label = if target.is_empty() {
        tunnel.spec().resource_ref()
    } else {
        target.clone()
    };
    let pb = spinner(format!("Opening tunnel to {}", label));

    let connected = tokio::select! {
        connected = tunnel.connect(&target) => connected,
        _ = shutdown_signal() => {
            pb.finish_and_clear();
            tunnel.close();
            tunnel.join().await;
            return Ok(());
        }
    };
    pb.finish_and_clear();
    connected?;

    eprintln!(
        "{} Tunnel to {} open on {}. Press Ctrl-C to close it.",
        style("✓").green().bold(),
        style(&label).cyan(),
        tunnel.endpoint().unwrap_or_default()
    );

    tunnel.serve_until(shutdown_signal()).await;
    eprintln!("{} Tunnel closed", style("✓").green());
    Ok(())
}

/// Run the connect list command
pub async fn list(output_json: bool) -> Result<()> {
    let cluster = KubeCluster::connect().await.map_err(CliError::cluster)?;
    let connections = ConnectLabelLookup::new(Arc::new(cluster))
        .connect_strings()
        .await?;

    if output_json {
        println!("{}", serde_json::to_string_pretty(&connections)?);
        return Ok(());
    }

    print!("{}", display::connect_table(&connections));
    Ok(())
}
