//! Raw memory access by address, the "memory" and
//! "extras" RPC modules

use ctp7_lib::{
    ModuleManager,
    RpcError,
    RpcMessage,
};

use crate::errors::ModuleError;
use crate::memory::check_aligned;
use crate::service::{
    respond,
    ModuleEnv,
};

/// Largest number of words a single request may ask for
pub const MAX_REQUEST_WORDS : u32 = 16384;

fn check_count(count : usize) -> Result<(), ModuleError> {
  if count > MAX_REQUEST_WORDS as usize {
    return Err(ModuleError::SizeLimit(format!("Requested {} words, at most {} are allowed", count, MAX_REQUEST_WORDS)));
  }
  Ok(())
}

/// Consecutive words in a single transfer
fn mread(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let count   = request.get_word("count")?;
    let address = request.get_word("address")?;
    check_count(count as usize)?;
    check_aligned(address)?;
    let mut data = vec![0u32; count as usize];
    if let Err(err) = env.hub.read(address, &mut data) {
      info!("read memsvc error: {}", env.hub.last_error());
      return Err(err.into());
    }
    response.set_word_array("data", &data);
    Ok(())
  });
}

fn mwrite(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |_response| {
    let count   = request.get_word_array_size("data")?;
    let address = request.get_word("address")?;
    check_count(count)?;
    check_aligned(address)?;
    let data    = request.get_word_array("data")?;
    if let Err(err) = env.hub.write(address, &data) {
      info!("write memsvc error: {}", env.hub.last_error());
      return Err(err.into());
    }
    Ok(())
  });
}

/// count single word reads of the same address
fn mblockread(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let count   = request.get_word("count")?;
    let address = request.get_word("address")?;
    check_count(count as usize)?;
    check_aligned(address)?;
    let mut data = vec![0u32; count as usize];
    for word in data.iter_mut() {
      let mut single = [0u32; 1];
      env.hub.read(address, &mut single)?;
      *word = single[0];
    }
    response.set_word_array("data", &data);
    Ok(())
  });
}

/// One word from each of a list of addresses
fn mlistread(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let count     = request.get_word("count")?;
    let addresses = request.get_word_array("addresses")?;
    if addresses.len() < count as usize {
      return Err(RpcError::ValueOutOfRange(String::from("count")).into());
    }
    check_count(count as usize)?;
    let addresses = &addresses[..count as usize];
    for address in addresses {
      check_aligned(*address)?;
    }
    let mut data = Vec::<u32>::with_capacity(count as usize);
    for address in addresses {
      let mut single = [0u32; 1];
      env.hub.read(*address, &mut single)?;
      data.push(single[0]);
    }
    response.set_word_array("data", &data);
    Ok(())
  });
}

pub fn module_init(mgr : &mut ModuleManager<ModuleEnv>) {
  mgr.register_method("memory", "mread", mread);
  mgr.register_method("memory", "mwrite", mwrite);
  mgr.register_method("extras", "blockread", mblockread);
  mgr.register_method("extras", "listread", mlistread);
}
