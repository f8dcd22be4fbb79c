//! Development harness: scan for the car, connect, and run a short drive.
//! The real frontend links against the library; this binary exists to
//! exercise the stack against hardware from a terminal.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use autonav_bridge::core::bluetooth::constants::DEFAULT_BOUNDED_SCAN;
use autonav_bridge::{BridgeState, LinkConfig, setup_logging};
use log::info;
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let config = LinkConfig::from_env().context("link configuration")?;
    let bridge = BridgeState::new(config).await?;

    info!("Scanning for {:?}...", DEFAULT_BOUNDED_SCAN);
    bridge.scan_for(DEFAULT_BOUNDED_SCAN).await?;
    sleep(DEFAULT_BOUNDED_SCAN).await;

    let discovered = bridge.discovered().await;
    if discovered.is_empty() {
        return Err(anyhow!("no peripherals discovered"));
    }
    // The same snapshot shape a frontend would consume.
    println!("{}", serde_json::to_string_pretty(&discovered)?);

    // CAR_ID selects a peripheral; otherwise the strongest signal wins.
    let target = match std::env::var("CAR_ID") {
        Ok(id) => id,
        Err(_) => discovered
            .iter()
            .max_by_key(|p| p.rssi.unwrap_or(i16::MIN))
            .map(|p| p.id.clone())
            .expect("non-empty discovery set"),
    };

    info!("Connecting to {}...", target);
    bridge.connect_to(&target).await?;

    // Creep forward, then stop.
    bridge.session.set_speed(2)?;
    sleep(Duration::from_millis(300)).await;
    bridge
        .session
        .press_direction(
            autonav_bridge::core::bluetooth::Direction::Up,
            autonav_bridge::core::gesture::PressKind::Short,
        )
        .await?;
    sleep(Duration::from_secs(1)).await;
    bridge.session.emergency_stop().await?;

    bridge.dispose().await;
    Ok(())
}
