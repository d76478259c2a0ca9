//! The threads of the RPC service
//!
//! * rpc_server     : answer requests on the 0MQ REP socket
//! * signal_handler : turn SIGINT/SIGTERM into the stop flag

pub mod rpc_server;
pub mod signal_handler;

pub use rpc_server::{
    rpc_server,
    handle_request,
};
pub use signal_handler::signal_handler;
