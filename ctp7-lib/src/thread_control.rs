//! Thread control structures

use std::fmt;

/// Send runtime information
/// to threads via shared memory
/// (Arc(Mutex)
#[derive(Default, Debug, Clone)]
pub struct ThreadControl {
  /// Stop ALL threads
  pub stop_flag                  : bool,
  /// alive indicator for the rpc server thread
  pub thread_rpc_server_active   : bool,
  /// number of requests the server has answered
  pub n_requests_served          : u64,
  /// number of responses which carried an error
  pub n_requests_failed          : u64,
}

impl ThreadControl {
  pub fn new() -> Self {
    Self {
      stop_flag                  : false,
      thread_rpc_server_active   : false,
      n_requests_served          : 0,
      n_requests_failed          : 0,
    }
  }
}

impl fmt::Display for ThreadControl {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = String::from("<ThreadControl:");
    repr        += "\n    -- program status:";
    repr        += &(format!("\n  stop flag : {}", self.stop_flag));
    repr        += "\n    -- reported thread activity:";
    repr        += &(format!("\n  rpc server     : {}", self.thread_rpc_server_active));
    repr        += &(format!("\n  served         : {}", self.n_requests_served));
    repr        += &(format!("\n  failed         : {}>", self.n_requests_failed));
    write!(f, "{}", repr)
  }
}
