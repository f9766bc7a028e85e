//! Single-threaded run loop.
//!
//! One `select!` drives everything: ERD client activity, the MQTT event
//! loop, the bridge's next timer deadline and Ctrl-C. Timers are brought up
//! to date before every event so expiries and completions are seen in the
//! order they happened.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::bridge::Bridge;
use crate::catalog::ErdCatalog;
use crate::config::Config;
use crate::erd_client::SimulatedAppliance;
use crate::mqtt::MqttClientAdapter;
use crate::store::SqliteStore;
use crate::timer::Ticks;

pub fn load_catalog(config: &Config) -> anyhow::Result<ErdCatalog> {
    let catalog = match &config.catalog_path {
        Some(path) => {
            tracing::info!("Loading ERD catalog from {}", path.display());
            ErdCatalog::load(path)?
        }
        None => ErdCatalog::builtin(),
    };
    catalog.validate(config.bridge.polling_list_capacity)?;
    Ok(catalog)
}

fn ticks_since(start: Instant) -> Ticks {
    start.elapsed().as_millis() as Ticks
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let catalog = load_catalog(&config)?;
    tracing::info!(
        "Catalog: {} common, {} energy, {} appliance types",
        catalog.common().len(),
        catalog.energy().len(),
        catalog.appliance_count()
    );

    let (activity_tx, mut activity_rx) = mpsc::unbounded_channel();
    let appliance = SimulatedAppliance::new(&config.appliance, config.client_address, activity_tx);
    let (gateway, mut eventloop) = MqttClientAdapter::connect(
        &config.mqtt,
        &config.device_id,
        config.bridge.polling_list_capacity,
    );
    tracing::info!(
        "MQTT broker {}:{}, topics under {}/{}",
        config.mqtt.host,
        config.mqtt.port,
        config.mqtt.topic_prefix,
        config.device_id
    );
    let store = SqliteStore::new(&config.storage.path);

    let start = Instant::now();
    let mut bridge = Bridge::new(config.bridge.clone(), catalog, appliance, gateway, store);

    let reconnect_delay = Duration::from_millis(config.mqtt.reconnect_delay_ms);
    let mut mqtt_resume: Option<Instant> = None;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let deadline = bridge
            .next_deadline()
            .map(|ticks| start + Duration::from_millis(ticks));

        tokio::select! {
            Some(activity) = activity_rx.recv() => {
                bridge.run_timers(ticks_since(start));
                bridge.on_erd_activity(activity);
            }
            event = eventloop.poll(), if mqtt_resume.is_none() => match event {
                Ok(event) => {
                    bridge.run_timers(ticks_since(start));
                    if let Some(gateway_event) = bridge.gateway().handle_event(&event) {
                        bridge.on_gateway_event(gateway_event);
                    }
                }
                Err(e) => {
                    tracing::warn!("MQTT connection error: {}, retrying in {:?}", e, reconnect_delay);
                    mqtt_resume = Some(Instant::now() + reconnect_delay);
                }
            },
            _ = sleep_until(mqtt_resume), if mqtt_resume.is_some() => {
                mqtt_resume = None;
            }
            _ = sleep_until(deadline) => {
                bridge.run_timers(ticks_since(start));
            }
            _ = &mut shutdown => {
                tracing::info!(
                    "Shutting down in {:?}: appliance type {} at 0x{:02X}, {} ERDs polled, last {:?}",
                    bridge.state(),
                    bridge.appliance_type(),
                    bridge.host_address(),
                    bridge.polling_list().len(),
                    bridge.last_polled_erd()
                );
                break;
            }
        }
    }

    Ok(())
}
