use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod batch;
mod config;
mod health;
mod netwatch;
mod replay;
mod retry;
mod sensors;
mod session;
mod status;
mod store;
mod types;
mod upload;

use config::Config;
use netwatch::SysClassNet;
use replay::OfflineReplayer;
use retry::RetryPolicy;
use sensors::camera::CameraSource;
use sensors::flow::FlowSource;
use sensors::gps::GpsSource;
use sensors::imu::ImuSource;
use sensors::sim;
use session::SessionController;
use status::{FixedDockSensor, UnixSocketIndicator};
use store::OfflineStore;
use upload::{BatchSender, BatchSink, UploadClient};

const LED_SOCKET: &str = "/tmp/led.sock";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scout_session=info".into()),
        )
        .init();

    // Config and identity are the only fatal startup requirements.
    let config = Config::load()?;
    let device_id = config::load_device_id()?;
    let ingest_url = config.ingest_url()?;
    info!(%device_id, %ingest_url, "session manager starting");

    let store = Arc::new(
        OfflineStore::open(&config.offline_dir).context("opening offline store")?,
    );
    let client = Arc::new(
        UploadClient::new(
            ingest_url,
            device_id,
            config.sleep_interval,
            RetryPolicy::upload(),
            Arc::clone(&store),
        )
        .context("building upload client")?,
    );

    let cancel = CancellationToken::new();

    let replayer = OfflineReplayer::new(
        Arc::clone(&store),
        Arc::clone(&client) as Arc<dyn BatchSender>,
        Duration::from_secs(config.offline_replay_secs),
        config.offline_file_retry_cap,
    );
    let replay_task = tokio::spawn(replayer.run(cancel.clone()));

    // Hardware backends plug in through the factory seams; this build wires
    // the simulated set so the pipeline runs off-target end to end.
    let gps = GpsSource::spawn(sim::nmea_factory()).await;
    let imu = if config.imu {
        Some(ImuSource::spawn(sim::imu_factory(), config.imu_rate_per_second).await)
    } else {
        None
    };
    let flow = if config.flow_meter {
        Some(FlowSource::spawn(sim::pulse_factory()).await)
    } else {
        None
    };
    let camera = config
        .camera
        .then(|| CameraSource::new(sim::grabber_factory()));

    let controller = SessionController::new(
        config,
        gps,
        imu,
        flow,
        camera,
        Arc::clone(&client) as Arc<dyn BatchSink>,
        Box::new(SysClassNet::new()),
        Box::new(UnixSocketIndicator::new(LED_SOCKET)),
        Box::new(FixedDockSensor(true)),
    );
    let session_task = tokio::spawn(controller.run(cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");
    cancel.cancel();

    // The session loop flushes its partial batch and drains uploads itself.
    let _ = session_task.await;
    let _ = replay_task.await;
    info!("session manager stopped");
    Ok(())
}
