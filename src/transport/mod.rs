pub mod error;
pub mod tcp;
pub mod traits;

pub use error::TransportError;
pub use tcp::TcpTransport;
pub use traits::{Connection, Outcome, RequestHandle, TransportHandle};
