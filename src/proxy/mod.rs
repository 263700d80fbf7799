//! Proxy layer — forwarding admitted requests to the model server

pub mod dispatcher;
pub mod streaming;

pub use dispatcher::{DispatchBody, DispatchRequest, DispatchResponse, Dispatcher, ForwardBody};
pub use streaming::RelayStream;
