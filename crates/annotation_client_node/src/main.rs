mod collaborators;
mod config;
mod rate_meter;

use crate::{
    collaborators::{GroundPlane, LoggingSink, SyntheticCamera},
    config::Config,
    rate_meter::RateMeter,
};
use annotation_stream::{
    capture,
    message::SessionEvent,
    placement,
    projection::CameraResolution,
    session::Session,
};
use anyhow::Result;
use clap::Parser;
use futures::{future, prelude::*};
use log::{info, warn};
use std::{fs, path::PathBuf, sync::Arc, time::Duration};

#[derive(Debug, Clone, Parser)]
struct Opts {
    #[clap(long)]
    pub config: PathBuf,
}

#[async_std::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opts = Opts::parse();
    let config: Config = {
        let text = fs::read_to_string(&opts.config)?;
        json5::from_str(&text)?
    };
    let resolution = CameraResolution {
        width: config.resolution.0,
        height: config.resolution.1,
    };

    // Init the rate meter
    let meter = Arc::new(RateMeter::new_secs());

    let session = Session::connect(&config.address, config.port).await?;
    let (handle, batch_rx, event_rx) = session.start();

    // Start the capture cycle against the synthetic camera.
    let capture_future = capture::run(
        SyntheticCamera::new(config.resolution, meter.clone()),
        handle.clone(),
        Duration::from_millis(config.capture_interval_ms),
    );

    // Forward batches to the placement worker, counting them on the way.
    let (fwd_tx, fwd_rx) = flume::bounded(2);
    let forward_future = {
        let meter = meter.clone();
        batch_rx
            .into_stream()
            .inspect(move |_| meter.bump_batch())
            .map(Ok)
            .forward(fwd_tx.into_sink())
            .map(|_result| ())
    };

    // Start the placement worker; it exclusively owns the sink.
    let placement_future = placement::start(
        fwd_rx,
        resolution,
        GroundPlane { max_range: 15.0 },
        LoggingSink::default(),
    );

    // React to session failure the way the real UI would: tell the user
    // to supply a fresh server address.
    let event_future = async move {
        if let Ok(SessionEvent::ConnectionFailed(err)) = event_rx.recv_async().await {
            warn!(
                "connection failed ({}); enter a new server address to reconnect",
                err
            );
        }
    };

    let rate_printing_future = {
        let meter = meter.clone();

        async move {
            meter
                .rate_stream()
                .for_each(|rates| async move {
                    info!(
                        "capture rate {} frames/s, detection rate {} batches/s",
                        rates.frames, rates.batches
                    );
                })
                .await;
        }
    };

    // Run until the session ends; the rate printers never finish on
    // their own.
    let work_future = async {
        futures::join!(
            capture_future,
            forward_future,
            placement_future,
            event_future
        );
    };
    futures::pin_mut!(work_future, rate_printing_future);
    future::select(work_future, rate_printing_future).await;

    info!("session ended");
    Ok(())
}
