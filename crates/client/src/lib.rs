// ============================
// meshroom-client/src/lib.rs
// ============================
//! Client side of `meshroom`: per-peer negotiation and the full-mesh
//! topology, over an abstract peer-connection transport.

pub mod driver;
pub mod error;
pub mod join;
pub mod media;
pub mod mesh;
pub mod retry;
pub mod session;
pub mod signaling;
pub mod transport;

#[cfg(test)]
pub(crate) mod fakes;

pub use driver::{connect_mesh, run_mesh, ConnectedMesh};
pub use error::{ClientError, MediaAccessError, NegotiationError};
pub use join::{generate_room_id, JoinRequest};
pub use media::{acquire_local_media, acquire_screen, LocalMedia, MediaConstraints, MediaDevices, MediaProfile};
pub use mesh::{MeshConfig, MeshEvents, MeshTopology, OfferPolicy};
pub use retry::RetryPolicy;
pub use session::{PeerConnectionSession, Role, SessionState};
pub use signaling::{SignalSink, SignalingClient};
pub use transport::{PeerTransport, TransportFactory};
