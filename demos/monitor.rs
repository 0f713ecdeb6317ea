//! Live camera monitor
//!
//! Prints every tracked camera ten times a second until interrupted.
//!
//! ```text
//! cargo run --example monitor -- [config.yaml]
//! cargo run --example monitor -- --simulate
//! ```
//!
//! With `--simulate` the monitor binds an ephemeral port and feeds it from
//! two simulated rigs. Set `RUST_LOG=stype_link=debug` for ingestion logs.

use anyhow::Context;
use futures::StreamExt;
use std::net::SocketAddr;
use stype_link::{
    BridgeConfig, Orientation, ProtocolVersion, RigSimulator, StypeLink, SubjectId, UpdateRate, WireFormat,
};
use tokio::net::UdpSocket;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let arg = std::env::args().nth(1);
    let simulate = arg.as_deref() == Some("--simulate");
    let config = match arg.as_deref() {
        Some("--simulate") => BridgeConfig { format: WireFormat::Envelope, ..BridgeConfig::udp("127.0.0.1", 0) },
        Some(path) => BridgeConfig::load(path).with_context(|| format!("loading {path}"))?,
        None => BridgeConfig::default(),
    };

    let mut connection = StypeLink::connect(config).await.context("starting tracking connection")?;
    info!(status = %connection.status(), local_addr = ?connection.local_addr(), "monitor running");

    if simulate {
        let target = connection.local_addr().context("simulation needs a UDP connection")?;
        tokio::spawn(async move {
            if let Err(e) = run_rigs(target).await {
                tracing::error!(error = %e, "simulated rigs stopped");
            }
        });
    }

    let mut updates = Box::pin(connection.subscribe(UpdateRate::Max(10)));
    while let Some(cameras) = updates.next().await {
        for camera in cameras {
            let Some(tracking) = camera.tracking else { continue };
            let [x, y, z] = tracking.position;
            let heading = match tracking.orientation {
                Orientation::Euler { pan, tilt, .. } => format!("pan {pan:7.2} tilt {tilt:6.2}"),
                Orientation::Quaternion { x, y, z, w } => format!("q [{x:.3} {y:.3} {z:.3} {w:.3}]"),
            };
            let fov = camera.lens.map(|l| l.field_of_view).unwrap_or_default();
            println!(
                "{:<10} {} t={:9.3}s pos [{x:6.2} {y:6.2} {z:6.2}] {heading} fov {fov:5.1} dropped {}",
                camera.display_name(),
                camera.device_time.timecode,
                camera.timestamp,
                camera.stats.dropped,
            );
        }
    }

    let stats = connection.stats();
    connection.disconnect().await;
    info!(frames = stats.frames, decode_errors = stats.decode_errors, "monitor stopped");
    Ok(())
}

/// Two rigs at 60 and 50 packets a second, each on its own socket.
async fn run_rigs(target: SocketAddr) -> anyhow::Result<()> {
    let rigs = [RigSimulator::new(SubjectId(1), 60), RigSimulator::new(SubjectId(2), 25).with_rates(50, 25)];
    let tasks: Vec<_> = rigs.into_iter().map(|rig| tokio::spawn(run_rig(rig, target))).collect();
    for task in tasks {
        task.await??;
    }
    Ok(())
}

async fn run_rig(mut rig: RigSimulator, target: SocketAddr) -> anyhow::Result<()> {
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let mut ticker = tokio::time::interval(rig.period());
    loop {
        ticker.tick().await;
        socket.send_to(&rig.next_envelope(ProtocolVersion::V1)?, target).await?;
    }
}
