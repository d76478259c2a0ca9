//! Glue between the RPC module manager and the
//! register access layer
//!
//! Every module entry point has the same shape: build an
//! access context from the module environment, do the
//! work, and render any error into the response.

use std::sync::{
    Mutex,
    MutexGuard,
};

use ctp7_lib::{
    Ctp7Settings,
    ModuleManager,
    RpcMessage,
};

use crate::access::{
    AccessContext,
    PollSettings,
};
use crate::directory::RegisterDirectory;
use crate::errors::ModuleError;
use crate::memhub::MemHub;

/// What every RPC method gets handed
pub struct ModuleEnv {
  pub hub      : MemHub,
  pub settings : Ctp7Settings,
  directory    : Mutex<RegisterDirectory>,
}

impl ModuleEnv {
  pub fn new(hub : MemHub, settings : Ctp7Settings) -> Self {
    let path      = settings.address_table_path();
    let directory = RegisterDirectory::new(&path.to_string_lossy(), settings.map_size_mb);
    Self {
      hub,
      settings,
      directory : Mutex::new(directory),
    }
  }

  pub fn poll_settings(&self) -> PollSettings {
    PollSettings::new(self.settings.poll_interval_us, self.settings.max_poll_iterations)
  }

  /// The register store shared by all calls. It is
  /// held until the guard goes out of scope.
  pub fn directory(&self) -> MutexGuard<'_, RegisterDirectory> {
    match self.directory.lock() {
      Ok(directory) => directory,
      Err(poisoned) => {
        warn!("A previous call panicked while holding the register store!");
        poisoned.into_inner()
      }
    }
  }

  /// Everything needed to access registers for the
  /// duration of a single call
  pub fn context<'a>(&'a self, response : &'a mut RpcMessage) -> Result<AccessContext<'a>, ModuleError> {
    Ok(AccessContext::new(&self.hub, self.directory(), response, self.poll_settings())?)
  }
}

/// Run the body of an RPC method. An error ends up
/// in the "error" key of the response.
pub fn respond<F>(response : &mut RpcMessage, body : F)
  where F : FnOnce(&mut RpcMessage) -> Result<(), ModuleError> {
  if let Err(err) = body(response) {
    error!("{}", err);
    response.set_error(&err.to_string());
  }
}

/// Register the methods of all modules. Only call
/// this with an opened memory hub, a module without
/// hardware access must not offer any methods.
pub fn register_all_modules(mgr : &mut ModuleManager<ModuleEnv>) {
  crate::extras::module_init(mgr);
  crate::utils::module_init(mgr);
  crate::optohybrid::module_init(mgr);
  crate::vfat3::module_init(mgr);
  crate::gbt::module_init(mgr);
  crate::sca::module_init(mgr);
  crate::daq::module_init(mgr);
  crate::ttc::module_init(mgr);
  crate::blaster_ram::module_init(mgr);
  crate::calibration::module_init(mgr);
  info!("Registered {} methods", mgr.len());
}
