use std::{env, sync::Arc, time::Duration};
use tokio::time::{interval, Instant};
use tracing::{error, info, warn};
use wearlink::{
    ble,
    logging::{self, LoggingConfig},
    BleTransport, Device, DeviceFamily, Result, SessionRegistry, SessionUpdate, WearlinkError,
};

fn parse_family(name: &str) -> Result<DeviceFamily> {
    match name {
        "band" => Ok(DeviceFamily::Band),
        "earbuds" => Ok(DeviceFamily::Earbuds),
        "headphones" => Ok(DeviceFamily::Headphones),
        "tag" => Ok(DeviceFamily::Tag),
        other => Err(WearlinkError::InvalidParameters(format!(
            "unknown family '{other}', expected band, earbuds, headphones or tag"
        ))),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(&LoggingConfig {
        default_directive: "wearlink=info".to_string(),
        ..LoggingConfig::default()
    })?;

    let args: Vec<String> = env::args().skip(1).collect();
    let [address, family] = args.as_slice() else {
        info!("Usage: session_monitor <address> <band|earbuds|headphones|tag>");
        info!("Nearby devices:");
        for found in ble::scan(ble::DEFAULT_SCAN_TIMEOUT_MS).await? {
            println!(
                "  {}  {:24}  {:>4} dBm",
                found.address,
                found.name.as_deref().unwrap_or("(unnamed)"),
                found.rssi.unwrap_or_default()
            );
        }
        return Ok(());
    };

    let registry = SessionRegistry::default();
    let transport = Arc::new(BleTransport::new(address).await?);
    let session = registry
        .add(Device::new(address.as_str(), parse_family(family)?), transport)
        .await?;
    let mut updates = session.subscribe();

    if let Err(e) = session.connect().await {
        error!("Failed to connect: {}", e);
        info!("Will keep retrying in the background");
    }

    let capabilities = session.capabilities();
    info!("Capabilities: {:?}", capabilities);

    let mut status_interval = interval(Duration::from_secs(10));
    let start_time = Instant::now();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = status_interval.tick() => {
                let device = session.device().await;
                let elapsed = start_time.elapsed().as_secs();
                println!("\nStatus ({:02}:{:02})", elapsed / 60, elapsed % 60);
                println!("  State:    {}", device.state);
                println!(
                    "  Firmware: {}",
                    device.firmware_version.as_deref().unwrap_or("unknown")
                );
                for (index, battery) in &device.batteries {
                    match battery.level {
                        Some(level) => println!("  Battery {index}: {level}% ({})", battery.state),
                        None => println!("  Battery {index}: unknown ({})", battery.state),
                    }
                }
            }
            update = updates.recv() => match update {
                Ok(SessionUpdate::TransportFailure { reason, .. }) => {
                    warn!("Link lost: {}", reason);
                }
                Ok(SessionUpdate::AuthenticationFailed { reason, .. }) => {
                    error!("Authentication failed: {}", reason);
                }
                Ok(update) => info!("{:?}", update),
                Err(e) => warn!("Missed updates: {}", e),
            },
        }
    }

    info!("Disconnecting...");
    registry.shutdown_all().await;
    Ok(())
}
