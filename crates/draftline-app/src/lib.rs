// Library root: the async side of draftline (configuration, transports,
// connection management and the live draft session). The binary and the
// integration tests build on these modules.

pub mod api;
pub mod config;
pub mod connection;
pub mod heartbeat;
pub mod session;
pub mod transport;
pub mod updates;
