//! Loopback demo: a "simulator" and a "viewer" client exchange a reliable chat
//! message and an xfer download over 127.0.0.1.

use anyhow::Context;
use bytes::Bytes;
use slv_lludp::config::{load_network_settings, SETTINGS_FILE};
use slv_lludp::networking::transport::TransportConfig;
use slv_lludp::networking::xfer::{MemorySource, XferRequest, XferSource};
use slv_lludp::networking::{CircuitOptions, Client, ClientEvent, FieldValue, Schema};
use slv_lludp::utils::logging::{init_logging, log_system_info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

const DEMO_FILE: &str = "demo_asset.bin";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut settings = load_network_settings(SETTINGS_FILE);
    settings.transport = TransportConfig::loopback();
    init_logging(&settings.logging)?;
    log_system_info();

    let schema = Schema::builtin()?;
    let payload: Bytes = (0..4096u32).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into();
    let source: Arc<dyn XferSource> = Arc::new(MemorySource::new().with_file(DEMO_FILE, payload.clone()));

    let (simulator, mut sim_events) = Client::bind_with(settings.clone(), schema.clone(), Some(source)).await?;
    simulator.accept_circuits(true);
    let (viewer, mut viewer_events) = Client::bind_with(settings, schema.clone(), None).await?;

    let options = CircuitOptions::new(0x1234_5678, simulator.local_addr(), Uuid::new_v4(), Uuid::new_v4());
    let circuit = viewer.connect(options).await?;
    info!("Viewer {} opened circuit to simulator {}", viewer.local_addr(), simulator.local_addr());

    let mut chat = schema.message("ChatFromViewer")?;
    chat.append(
        "AgentData",
        [("AgentID", FieldValue::Uuid(Uuid::new_v4())), ("SessionID", FieldValue::Uuid(Uuid::new_v4()))],
    )?;
    chat.append(
        "ChatData",
        [("Message", FieldValue::text("hello from the demo")), ("Type", FieldValue::U8(1)), ("Channel", FieldValue::S32(0))],
    )?;
    let sequence = circuit.send_and_wait(chat, Duration::from_secs(10)).await?;
    info!("Chat packet {} acknowledged", sequence);

    let chat = wait_for_message(&mut sim_events, "ChatFromViewer").await?;
    let text = chat.get("ChatData", "Message")?.as_string()?;
    info!("Simulator heard: {:?}", text);

    let pending = viewer.request_transfer(simulator.local_addr(), XferRequest::file(DEMO_FILE)).await?;
    let id = pending.id();
    let data = tokio::time::timeout(Duration::from_secs(30), pending.wait())
        .await
        .context("xfer timed out")??;
    anyhow::ensure!(data == payload, "xfer {} returned different bytes", id);
    info!("Xfer {} delivered {} bytes intact", id, data.len());

    let stats = circuit.stats().await;
    info!(
        "Viewer circuit: sent={} received={} resent={} rtt={:?}",
        stats.packets_sent, stats.packets_received, stats.packets_resent, stats.rtt
    );

    viewer.shutdown().await;
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(500), viewer_events.recv()).await {
        info!("Viewer event: {:?}", event);
    }
    simulator.shutdown().await;
    Ok(())
}

async fn wait_for_message(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    name: &str,
) -> anyhow::Result<slv_lludp::Message> {
    let deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => anyhow::bail!("no {} received", name),
            event = events.recv() => match event {
                Some(ClientEvent::Message { message, .. }) if message.name() == name => return Ok(message),
                Some(other) => info!("Simulator event: {:?}", other),
                None => {
                    warn!("Event channel closed");
                    anyhow::bail!("event channel closed");
                }
            },
        }
    }
}
