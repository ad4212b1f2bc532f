pub mod codec;
pub mod connection;
pub mod data_channel;
pub mod ice;
pub mod loopback;
pub mod media;
pub mod rendezvous;
pub mod rtc;
pub mod transport;
pub mod types;

pub use loopback::LoopbackProvider;
pub use rendezvous::Rendezvous;
pub use rtc::{RtcProvider, Signal};
pub use transport::{event_channel, DataLink, EventReceiver, EventSender, MediaLink, PeerEvent, PeerProvider};
pub use types::{LinkId, PeerId, RemoteStream, ServerConfig};
