// ============================
// meshroom-client/src/driver.rs
// ============================
//! Event loop tying signaling, transports and timers to the mesh.
use crate::error::ClientError;
use crate::join::JoinRequest;
use crate::media::{acquire_local_media, MediaDevices};
use crate::mesh::{MeshConfig, MeshEvents, MeshTopology};
use crate::signaling::{SignalSink, SignalingClient};
use crate::transport::TransportFactory;
use meshroom_common::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use tracing::{error, info};

/// A mesh wired to a live signaling connection
pub struct ConnectedMesh<F: TransportFactory> {
    pub mesh: MeshTopology<F, mpsc::UnboundedSender<ClientMessage>>,
    pub events: MeshEvents,
    pub inbound: mpsc::UnboundedReceiver<ServerMessage>,
}

/// Acquire local media, connect to `url` and send the join request.
/// Media failures only downgrade; connection failures are returned.
pub async fn connect_mesh<F, D>(
    url: &str,
    request: JoinRequest,
    factory: F,
    devices: &mut D,
    config: MeshConfig,
) -> Result<ConnectedMesh<F>, ClientError>
where
    F: TransportFactory,
    D: MediaDevices,
{
    let media = acquire_local_media(devices, config.media_timeout).await;
    let client = SignalingClient::connect(url).await?;
    client.join(request)?;

    let (outbound, inbound) = client.into_parts();
    let (mesh, events) = MeshTopology::new(config, factory, outbound, media);
    Ok(ConnectedMesh { mesh, events, inbound })
}

/// Drive `mesh` until the server connection ends. Every server message is
/// passed on to `observer` after the mesh has handled it.
pub async fn run_mesh<F, S>(
    mesh: &mut MeshTopology<F, S>,
    inbound: &mut mpsc::UnboundedReceiver<ServerMessage>,
    events: &mut MeshEvents,
    observer: &mpsc::UnboundedSender<ServerMessage>,
) -> Result<(), ClientError>
where
    F: TransportFactory,
    S: SignalSink,
{
    let result = loop {
        let step = tokio::select! {
            msg = inbound.recv() => {
                let Some(msg) = msg else {
                    info!("signaling connection closed");
                    break Ok(());
                };
                let handled = mesh.handle_server_message(msg.clone()).await;
                let _ = observer.send(msg);
                handled
            },
            Some(event) = events.transport.recv() => mesh.handle_transport_event(event).await,
            Some(timer) = events.timers.recv() => mesh.handle_timer(timer).await,
        };
        if let Err(e) = step {
            error!("mesh loop stopped: {e}");
            break Err(e);
        }
    };

    // Sessions and local tracks are released however the loop ended
    mesh.shutdown().await;
    result
}
