//! Answer RPC requests on a 0MQ REP socket
//!
//! A request is a JSON object
//! {"module" : "vfat3", "method" : "dacScan", "params" : {...}},
//! the reply is the JSON of the response message.

use std::sync::{
    Arc,
    Mutex,
};

use serde_json::Value;

use ctp7_lib::{
    ModuleManager,
    RpcError,
    RpcMessage,
};
use ctp7_lib::thread_control::ThreadControl;

/// Time the socket waits for a request before
/// looking at the stop flag again
pub const RECV_TIMEOUT_MS : i32 = 500;

#[derive(Debug, serde::Deserialize)]
struct RpcRequest {
  module : String,
  method : String,
  #[serde(default)]
  params : Value,
}

/// Decode a request, dispatch it and encode the response.
///
/// Undecodable requests get a response with only the
/// error key.
pub fn handle_request<E>(mgr : &ModuleManager<E>, env : &E, bytes : &[u8]) -> RpcMessage {
  let request = match serde_json::from_slice::<RpcRequest>(bytes) {
    Err(err) => {
      error!("Unable to decode request! {}", err);
      let mut response = RpcMessage::new();
      response.set_error(&RpcError::MalformedRequest(err.to_string()).to_string());
      return response;
    }
    Ok(request) => request
  };
  let params = match RpcMessage::from_value(request.params) {
    Err(err) => {
      error!("Request for {}.{} carries no usable params! {}", request.module, request.method, err);
      let mut response = RpcMessage::new();
      response.set_error(&err.to_string());
      return response;
    }
    Ok(params) => params
  };
  debug!("Request {}.{} {}", request.module, request.method, params);
  mgr.dispatch(env, &request.module, &request.method, &params)
}

/// Serve requests until the stop flag is set
///
/// # Arguments
///
/// * address        : the address to bind to, e.g. tcp://0.0.0.0:30000
/// * mgr            : all registered methods
/// * env            : what the methods get handed
/// * thread_control : stop flag and bookkeeping
pub fn rpc_server<E>(address        : &str,
                     mgr            : &ModuleManager<E>,
                     env            : &E,
                     thread_control : Arc<Mutex<ThreadControl>>) -> Result<(), zmq::Error> {
  let ctx    = zmq::Context::new();
  let socket = ctx.socket(zmq::REP)?;
  socket.set_rcvtimeo(RECV_TIMEOUT_MS)?;
  socket.bind(address)?;
  info!("0MQ REP socket bound to {}, serving {} methods", address, mgr.len());
  match thread_control.lock() {
    Ok(mut tc) => {
      tc.thread_rpc_server_active = true;
    }
    Err(err) => {
      error!("Can't acquire lock for ThreadControl! {err}");
    }
  }
  loop {
    match thread_control.lock() {
      Ok(tc) => {
        if tc.stop_flag {
          info!("Received stop signal. Will stop the rpc server!");
          break;
        }
      }
      Err(err) => {
        error!("Can't acquire lock for ThreadControl! {err}");
      }
    }
    let bytes = match socket.recv_bytes(0) {
      Err(zmq::Error::EAGAIN) => continue,
      Err(err) => {
        error!("Receiving from the REP socket failed! {err}");
        continue;
      }
      Ok(bytes) => bytes
    };
    let response = handle_request(mgr, env, &bytes);
    if let Err(err) = socket.send(response.to_json().as_bytes(), 0) {
      error!("Unable to send response! {err}");
    }
    match thread_control.lock() {
      Ok(mut tc) => {
        tc.n_requests_served += 1;
        if response.has_error() {
          tc.n_requests_failed += 1;
        }
      }
      Err(err) => {
        error!("Can't acquire lock for ThreadControl! {err}");
      }
    }
  }
  match thread_control.lock() {
    Ok(mut tc) => {
      tc.thread_rpc_server_active = false;
    }
    Err(err) => {
      error!("Can't acquire lock for ThreadControl! {err}");
    }
  }
  Ok(())
}
