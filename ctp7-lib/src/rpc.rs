//! Keyed request/response messages and the module registry
//!
//! Every RPC call carries a request message with typed
//! getters and produces a response message with typed
//! setters. The "error" key is the universal failure
//! channel, "warning" reports non-fatal anomalies.
//!
//! On the wire a message is a flat JSON object.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;

use serde_json::{
    Map,
    Value,
};

/// Key of the failure channel of a response
pub const ERROR_KEY   : &str = "error";
/// Key for non-fatal anomalies in a response
pub const WARNING_KEY : &str = "warning";

#[derive(Debug, Clone, PartialEq)]
pub enum RpcError {
  KeyNotFound(String),
  WrongType(String),
  ValueOutOfRange(String),
  UnknownMethod(String),
  MalformedRequest(String),
}

impl RpcError {
  pub fn to_string(&self) -> String {
    match self {
      RpcError::KeyNotFound(key)      => {return format!("KeyNotFound ({})", key);},
      RpcError::WrongType(key)        => {return format!("WrongType ({})", key);},
      RpcError::ValueOutOfRange(key)  => {return format!("ValueOutOfRange ({})", key);},
      RpcError::UnknownMethod(name)   => {return format!("UnknownMethod ({})", name);},
      RpcError::MalformedRequest(msg) => {return format!("MalformedRequest ({})", msg);},
    }
  }
}

impl fmt::Display for RpcError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let repr = self.to_string();
    write!(f, "<RpcError: {}>", repr)
  }
}

impl Error for RpcError {
}

/// A flat, keyed RPC message
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RpcMessage {
  fields : Map<String, Value>,
}

impl RpcMessage {
  pub fn new() -> Self {
    Self {
      fields : Map::new(),
    }
  }

  pub fn get_key_exists(&self, key : &str) -> bool {
    self.fields.contains_key(key)
  }

  fn get_value(&self, key : &str) -> Result<&Value, RpcError> {
    self.fields.get(key).ok_or(RpcError::KeyNotFound(String::from(key)))
  }

  pub fn get_word(&self, key : &str) -> Result<u32, RpcError> {
    let value = self.get_value(key)?;
    let word  = value.as_u64().ok_or(RpcError::WrongType(String::from(key)))?;
    u32::try_from(word).map_err(|_| RpcError::ValueOutOfRange(String::from(key)))
  }

  /// Get a word, or the default if the key is not present
  pub fn get_word_or(&self, key : &str, default : u32) -> Result<u32, RpcError> {
    if self.get_key_exists(key) {
      self.get_word(key)
    } else {
      Ok(default)
    }
  }

  /// Flags are sent as words, anything non-zero is true
  pub fn get_flag(&self, key : &str) -> Result<bool, RpcError> {
    match self.get_value(key)? {
      Value::Bool(b) => Ok(*b),
      _              => Ok(self.get_word(key)? != 0),
    }
  }

  pub fn get_flag_or(&self, key : &str, default : bool) -> Result<bool, RpcError> {
    if self.get_key_exists(key) {
      self.get_flag(key)
    } else {
      Ok(default)
    }
  }

  pub fn get_string(&self, key : &str) -> Result<String, RpcError> {
    let value = self.get_value(key)?;
    value.as_str()
      .map(String::from)
      .ok_or(RpcError::WrongType(String::from(key)))
  }

  pub fn get_word_array(&self, key : &str) -> Result<Vec<u32>, RpcError> {
    let value  = self.get_value(key)?;
    let array  = value.as_array().ok_or(RpcError::WrongType(String::from(key)))?;
    let mut words = Vec::<u32>::with_capacity(array.len());
    for v in array {
      let w = v.as_u64().ok_or(RpcError::WrongType(String::from(key)))?;
      words.push(u32::try_from(w).map_err(|_| RpcError::ValueOutOfRange(String::from(key)))?);
    }
    Ok(words)
  }

  pub fn get_word_array_size(&self, key : &str) -> Result<usize, RpcError> {
    let value = self.get_value(key)?;
    value.as_array()
      .map(|a| a.len())
      .ok_or(RpcError::WrongType(String::from(key)))
  }

  pub fn get_binarydata(&self, key : &str) -> Result<Vec<u8>, RpcError> {
    let value  = self.get_value(key)?;
    let array  = value.as_array().ok_or(RpcError::WrongType(String::from(key)))?;
    let mut bytes = Vec::<u8>::with_capacity(array.len());
    for v in array {
      let b = v.as_u64().ok_or(RpcError::WrongType(String::from(key)))?;
      bytes.push(u8::try_from(b).map_err(|_| RpcError::ValueOutOfRange(String::from(key)))?);
    }
    Ok(bytes)
  }

  pub fn get_binarydata_size(&self, key : &str) -> Result<usize, RpcError> {
    self.get_word_array_size(key)
  }

  pub fn set_word(&mut self, key : &str, value : u32) {
    self.fields.insert(String::from(key), Value::from(value));
  }

  pub fn set_string(&mut self, key : &str, value : &str) {
    self.fields.insert(String::from(key), Value::from(value));
  }

  /// Non-finite values are stored as null
  pub fn set_float(&mut self, key : &str, value : f64) {
    self.fields.insert(String::from(key), Value::from(value));
  }

  pub fn get_float(&self, key : &str) -> Result<f64, RpcError> {
    let value = self.get_value(key)?;
    value.as_f64().ok_or(RpcError::WrongType(String::from(key)))
  }

  pub fn set_word_array(&mut self, key : &str, values : &[u32]) {
    self.fields.insert(String::from(key), Value::from(values.to_vec()));
  }

  pub fn set_binarydata(&mut self, key : &str, bytes : &[u8]) {
    self.fields.insert(String::from(key), Value::from(bytes.to_vec()));
  }

  /// Report a failure to the caller
  pub fn set_error(&mut self, msg : &str) {
    self.set_string(ERROR_KEY, msg);
  }

  /// Report a non-fatal anomaly to the caller
  pub fn set_warning(&mut self, msg : &str) {
    self.set_string(WARNING_KEY, msg);
  }

  pub fn error(&self) -> Option<&str> {
    self.fields.get(ERROR_KEY).and_then(|v| v.as_str())
  }

  pub fn warning(&self) -> Option<&str> {
    self.fields.get(WARNING_KEY).and_then(|v| v.as_str())
  }

  pub fn has_error(&self) -> bool {
    self.get_key_exists(ERROR_KEY)
  }

  pub fn keys(&self) -> Vec<String> {
    self.fields.keys().cloned().collect()
  }

  pub fn to_json(&self) -> String {
    // a map of json values always serializes
    serde_json::to_string(&self.fields).unwrap_or(String::from("{}"))
  }

  pub fn from_json(json : &str) -> Result<Self, RpcError> {
    match serde_json::from_str::<Map<String, Value>>(json) {
      Err(err)   => Err(RpcError::MalformedRequest(err.to_string())),
      Ok(fields) => Ok(Self { fields })
    }
  }

  /// Build a message from a JSON object value
  pub fn from_value(value : Value) -> Result<Self, RpcError> {
    match value {
      Value::Object(fields) => Ok(Self { fields }),
      Value::Null           => Ok(Self::new()),
      _                     => Err(RpcError::MalformedRequest(String::from("params is not an object")))
    }
  }
}

impl fmt::Display for RpcMessage {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<RpcMessage: {}>", self.to_json())
  }
}

/// The signature of an RPC method. The environment
/// `E` carries whatever the modules need to reach
/// the hardware.
pub type RpcMethod<E> = fn(&E, &RpcMessage, &mut RpcMessage);

/// Registry of all methods the service offers,
/// keyed by "module.method"
pub struct ModuleManager<E> {
  methods : HashMap<String, RpcMethod<E>>,
}

impl<E> ModuleManager<E> {
  pub fn new() -> Self {
    Self {
      methods : HashMap::new(),
    }
  }

  pub fn register_method(&mut self, module : &str, method : &str, func : RpcMethod<E>) {
    let key = format!("{}.{}", module, method);
    if self.methods.insert(key.clone(), func).is_some() {
      warn!("Method {} was registered twice, the last registration wins!", key);
    } else {
      debug!("Registered method {}", key);
    }
  }

  pub fn is_registered(&self, module : &str, method : &str) -> bool {
    self.methods.contains_key(&format!("{}.{}", module, method))
  }

  /// All registered methods, sorted
  pub fn methods(&self) -> Vec<String> {
    let mut names : Vec<String> = self.methods.keys().cloned().collect();
    names.sort();
    names
  }

  pub fn len(&self) -> usize {
    self.methods.len()
  }

  pub fn is_empty(&self) -> bool {
    self.methods.is_empty()
  }

  /// Call a registered method. Unknown methods
  /// are reported through the error key
  pub fn dispatch(&self, env : &E, module : &str, method : &str, request : &RpcMessage) -> RpcMessage {
    let mut response = RpcMessage::new();
    let key = format!("{}.{}", module, method);
    match self.methods.get(&key) {
      None => {
        error!("Request for unknown method {}", key);
        response.set_error(&RpcError::UnknownMethod(key).to_string());
      }
      Some(func) => {
        trace!("Dispatching {}", key);
        func(env, request, &mut response);
      }
    }
    response
  }
}

impl<E> Default for ModuleManager<E> {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn echo(_env : &(), request : &RpcMessage, response : &mut RpcMessage) {
    match request.get_word("value") {
      Err(err) => response.set_error(&err.to_string()),
      Ok(v)    => response.set_word("value", v),
    }
  }

  #[test]
  fn typed_getters() {
    let msg = RpcMessage::from_json(r#"{"ohN": 3, "reg_name": "CFG_RUN", "data": [1,2,3], "big": 4294967296}"#).unwrap();
    assert_eq!(msg.get_word("ohN").unwrap(), 3);
    assert_eq!(msg.get_string("reg_name").unwrap(), "CFG_RUN");
    assert_eq!(msg.get_word_array("data").unwrap(), vec![1,2,3]);
    assert_eq!(msg.get_word_array_size("data").unwrap(), 3);
    assert_eq!(msg.get_word("big"), Err(RpcError::ValueOutOfRange(String::from("big"))));
    assert_eq!(msg.get_word("nope"), Err(RpcError::KeyNotFound(String::from("nope"))));
    assert_eq!(msg.get_word("reg_name"), Err(RpcError::WrongType(String::from("reg_name"))));
    assert_eq!(msg.get_word_or("mask", 0xff000000).unwrap(), 0xff000000);
  }

  #[test]
  fn dispatch_reports_unknown_methods() {
    let mut mgr = ModuleManager::<()>::new();
    mgr.register_method("test", "echo", echo);
    let mut req = RpcMessage::new();
    req.set_word("value", 42);
    let rsp = mgr.dispatch(&(), "test", "echo", &req);
    assert!(!rsp.has_error());
    assert_eq!(rsp.get_word("value").unwrap(), 42);
    let rsp = mgr.dispatch(&(), "test", "nothere", &req);
    assert!(rsp.error().unwrap().contains("test.nothere"));
  }
}
