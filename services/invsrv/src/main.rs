//! Inverter Service (invsrv)
//!
//! Polls Voltx/Solplanet hybrid inverters over Modbus TCP.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common::bootstrap_args::ServiceArgs;
use common::service_bootstrap::{self, ServiceInfo};
use common::{logging, shutdown};
use invsrv::coordinator::{describe_values, DEFAULT_WORKER_TIMEOUT};
use invsrv::entity::{DeviceKind, EntitySet};
use invsrv::{Coordinator, InvsrvConfig, RegisterMap, TelemetrySource, WriteTarget};

const SERVICE_NAME: &str = "invsrv";

#[derive(Parser, Debug)]
#[command(name = SERVICE_NAME, version, about = "Modbus TCP inverter polling service")]
struct Cli {
    #[command(flatten)]
    service: ServiceArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Poll every configured device until Ctrl+C or SIGTERM (default)
    Run,
    /// Poll one device once and print the snapshot as JSON
    Read {
        #[arg(short, long)]
        device: String,
    },
    /// Write one value and print the refreshed snapshot
    Write {
        #[arg(short, long)]
        device: String,
        /// Writable key (e.g. chpwr) or holding-register address (e.g. 1152)
        #[arg(short, long)]
        target: String,
        #[arg(long, allow_negative_numbers = true)]
        value: f64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.clone().unwrap_or(Command::Run);

    let service_info = ServiceInfo::new(
        SERVICE_NAME,
        "Modbus TCP polling service for Voltx/Solplanet hybrid inverters",
    )
    .with_version(env!("CARGO_PKG_VERSION"));

    let config_path = PathBuf::from(cli.service.config_path(SERVICE_NAME));
    let config = InvsrvConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let long_running = matches!(command, Command::Run) && !cli.service.validate;
    service_bootstrap::init_logging(
        &service_info,
        &cli.service,
        config.service.log_dir.as_deref(),
        Some(config.service.log_level.as_str()),
        long_running,
    )?;
    if long_running && !cli.service.no_color {
        service_bootstrap::print_startup_banner(&service_info);
    }

    config.validate()?;
    let map = Arc::new(RegisterMap::voltx_asw()?);

    if cli.service.validate {
        info!(
            "Configuration valid: {} device(s), {} register blocks",
            config.devices.len(),
            map.blocks().len()
        );
        return Ok(());
    }

    match command {
        Command::Run => run(config, config_path, cli.service.clone(), map).await,
        Command::Read { device } => {
            let coordinator = coordinator_for(&config, &device, map)?;
            let snapshot = coordinator.first_refresh().await?;
            println!("{}", serde_json::to_string_pretty(snapshot.as_ref())?);
            Ok(())
        },
        Command::Write {
            device,
            target,
            value,
        } => {
            let map_blocks = map.blocks().len();
            let coordinator = coordinator_for(&config, &device, map)?;
            let target: WriteTarget = target.parse()?;
            let mut updates = coordinator.subscribe();
            coordinator.write(target.clone(), value).await?;
            info!("Wrote {} = {} on {}", target, value, device);

            // Wait for the post-write refresh; a failed one publishes nothing
            let bound = DEFAULT_WORKER_TIMEOUT * map_blocks as u32;
            let snapshot = match tokio::time::timeout(bound, updates.recv()).await {
                Ok(Ok(snapshot)) => snapshot,
                _ => coordinator
                    .snapshot()
                    .ok_or_else(|| anyhow!("post-write refresh of {} failed", device))?,
            };
            println!("{}", serde_json::to_string_pretty(snapshot.as_ref())?);
            Ok(())
        },
    }
}

fn coordinator_for(
    config: &InvsrvConfig,
    name: &str,
    map: Arc<RegisterMap>,
) -> anyhow::Result<Coordinator> {
    let device = config
        .device(name)
        .ok_or_else(|| anyhow!("device '{}' is not configured", name))?;
    Ok(Coordinator::for_device(device.clone(), map))
}

async fn run(
    config: InvsrvConfig,
    config_path: PathBuf,
    args: ServiceArgs,
    map: Arc<RegisterMap>,
) -> anyhow::Result<()> {
    let token = shutdown::shutdown_token();
    let mut coordinators = HashMap::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    for device in &config.devices {
        let coordinator = Coordinator::for_device(device.clone(), Arc::clone(&map));

        // A device is only exposed once it has produced data
        match coordinator.first_refresh().await {
            Ok(snapshot) => info!(
                "Device {} online: {} values ({} blocks failed)",
                device.name,
                snapshot.len(),
                snapshot.failed_blocks.len()
            ),
            Err(e) => {
                error!("{}; device not started", e);
                continue;
            },
        }

        tasks.push(coordinator.start(token.child_token()));
        tasks.push(spawn_entity_logger(coordinator.clone(), token.child_token()));
        coordinators.insert(device.name.clone(), coordinator);
    }

    if coordinators.is_empty() {
        return Err(anyhow!("no device completed its first poll"));
    }
    info!(
        "{} of {} device(s) running",
        coordinators.len(),
        config.devices.len()
    );

    #[cfg(unix)]
    tasks.push(spawn_reload_on_sighup(
        config_path,
        args,
        config.service.log_level.clone(),
        coordinators.clone(),
        token.child_token(),
    ));
    #[cfg(not(unix))]
    let _ = (config_path, args);

    token.cancelled().await;
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Task ended abnormally: {}", e);
        }
    }
    for (name, coordinator) in &coordinators {
        info!("Device {} final stats: {:?}", name, coordinator.stats());
    }
    info!("Service shutdown complete");
    Ok(())
}

/// Log every snapshot change through the sensor adapters
fn spawn_entity_logger(coordinator: Coordinator, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let source: Arc<dyn TelemetrySource> = Arc::new(coordinator.clone());
        let entities = EntitySet::discover(Arc::clone(&source));
        let device = coordinator.device().clone();
        info!(
            "Device {}: {} sensors, {} numbers, {} selects",
            device.name,
            entities.sensors.len(),
            entities.numbers.len(),
            entities.selects.len()
        );
        for kind in [DeviceKind::Inverter, DeviceKind::Battery] {
            debug!(
                "Device {}: {} {} sensors",
                device.name,
                entities.sensors_for(kind).count(),
                kind
            );
        }

        let mut updates = source.subscribe();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                update = updates.recv() => match update {
                    Ok(snapshot) => {
                        for kind in [DeviceKind::Inverter, DeviceKind::Battery] {
                            let states: Vec<String> = entities
                                .sensors_for(kind)
                                .map(|s| format!("{}={}", s.description().name, s.state()))
                                .collect();
                            info!(
                                "{} [{}]: {}",
                                kind.device_name(&device.host, device.unit_id),
                                kind.model(),
                                states.join(", ")
                            );
                        }
                        debug!("Device {} raw: {}", device.name, describe_values(&snapshot));
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Device {} logger skipped {} snapshots", device.name, n);
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

/// Re-read the config on SIGHUP; apply log level and poll intervals in place
///
/// The log filter only changes when `service.log_level` itself changed.
#[cfg(unix)]
fn spawn_reload_on_sighup(
    config_path: PathBuf,
    args: ServiceArgs,
    mut applied_level: String,
    coordinators: HashMap<String, Coordinator>,
    token: CancellationToken,
) -> JoinHandle<()> {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(sig) => sig,
            Err(e) => {
                warn!("SIGHUP handler unavailable: {}", e);
                return;
            },
        };

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = hangup.recv() => {},
            }

            info!("SIGHUP: reloading {}", config_path.display());
            let config = match InvsrvConfig::load(&config_path).and_then(|c| {
                c.validate()?;
                Ok(c)
            }) {
                Ok(config) => config,
                Err(e) => {
                    error!("Reload rejected: {}", e);
                    continue;
                },
            };

            let configured = config.service.log_level.clone();
            let directive = service_bootstrap::reload_directive(
                SERVICE_NAME,
                &args,
                &applied_level,
                &configured,
            );
            if let Some(directive) = directive {
                match logging::set_log_level(&directive) {
                    Ok(()) => debug!("Log filter now {}", logging::get_log_level()),
                    Err(e) => warn!("{}", e),
                }
            }
            applied_level = configured;
            for device in &config.devices {
                match coordinators.get(&device.name) {
                    Some(coordinator) if coordinator.poll_interval() != device.poll_interval() => {
                        if let Err(e) = coordinator.set_poll_interval(device.poll_interval()) {
                            warn!("Device {}: {}", device.name, e);
                        }
                    },
                    Some(_) => {},
                    None => warn!(
                        "Device {} added in config; restart required to poll it",
                        device.name
                    ),
                }
            }
        }
    })
}
