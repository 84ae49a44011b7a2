pub mod connection;
pub mod listener;
pub mod proxy;
pub mod router;
pub mod tls;

pub use connection::PeerConnection;
pub use listener::TransportListener;
pub use proxy::{ProxyState, SignalCounter};
pub use router::PeerRouter;
