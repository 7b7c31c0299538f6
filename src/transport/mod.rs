pub mod socket;
pub mod stream;
pub mod tcp;
pub mod tls;
pub mod traits;
pub mod websocket;

pub use socket::SocketBackend;
pub use stream::{StreamBackend, StreamReturn};
pub use tcp::TcpConnector;
pub use traits::{BoxedStream, ChannelBackend, TransportConnector, TransportStream};
pub use websocket::WebSocketBackend;
