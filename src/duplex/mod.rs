mod connection;
pub mod proto_msg;
mod request;

pub use connection::{DuplexChannel, DuplexError, DuplexSettings};
pub use proto_msg::ProtoMsg;
pub use request::InboundRequest;
