//! # The CTP7 RPC service
//!
//! Opens the memory hub, registers the methods of all
//! modules and answers requests on a 0MQ REP socket
//! until it receives SIGINT or SIGTERM.
//!
use std::thread;
use std::sync::{
    Arc,
    Mutex,
};
use std::process::exit;

#[macro_use] extern crate log;

use clap::Parser;

use colored::Colorize;

use ctp7_lib::{
    init_env_logger,
    Ctp7Settings,
    ModuleManager,
};
use ctp7_lib::thread_control::ThreadControl;

use ctp7_modules::access::insert_field;
use ctp7_modules::directory::RegisterDirectory;
use ctp7_modules::memhub::MemHub;
use ctp7_modules::memory::{
    MemoryDevice,
    MappedDevice,
    SimulatedDevice,
};
use ctp7_modules::service::{
    ModuleEnv,
    register_all_modules,
};
use ctp7_modules::threads::{
    rpc_server,
    signal_handler,
};
use ctp7_modules::utils::FW_MAJOR_REG;

cfg_if::cfg_if! {
  if #[cfg(target_arch = "arm")] {
    /// The service runs on the Zynq of the CTP7
    const ON_BOARD : bool = true;
  } else {
    const ON_BOARD : bool = false;
  }
}

#[derive(Parser, Debug)]
#[command(author = "GEM DAQ", version, about, long_about = None)]
struct Args {
  /// A .toml file with the service settings. Without it,
  /// the defaults (and $GEM_PATH) are used
  #[arg(short, long)]
  config   : Option<String>,
  /// Bind the REP socket to this address instead of the
  /// one from the settings, e.g. tcp://0.0.0.0:30000
  #[arg(short, long)]
  address  : Option<String>,
  /// Serve against an in-memory register space instead
  /// of the memory device. For testing without hardware.
  #[arg(long, default_value_t = false)]
  simulate : bool,
  /// Print the settings and the list of methods
  #[arg(short, long, default_value_t = false)]
  verbose  : bool,
}

/// Prepare the in-memory register space, so that the
/// firmware version check passes
fn simulated_device(settings : &Ctp7Settings) -> SimulatedDevice {
  let device = SimulatedDevice::new();
  let path   = settings.address_table_path();
  let lookup = RegisterDirectory::open(&path.to_string_lossy(), settings.map_size_mb)
    .and_then(|mut dir| dir.lookup(FW_MAJOR_REG));
  match lookup {
    Err(err) => {
      warn!("Can not preset the firmware version of the simulated device! {}", err);
    }
    Ok(desc) => {
      device.preset(desc.address, insert_field(0, desc.mask, 3));
    }
  }
  device
}

fn main() {
  init_env_logger();
  let args = Args::parse();

  let mut settings = match &args.config {
    None         => Ctp7Settings::new(),
    Some(config) => {
      match Ctp7Settings::from_toml(config.clone()) {
        Err(err) => {
          error!("Unable to load settings from {}! {}", config, err);
          exit(1);
        }
        Ok(settings) => settings
      }
    }
  };
  if let Some(address) = &args.address {
    settings.server_address = address.clone();
  }

  println!("-----------------------------------------------");
  println!(" ** Welcome to ctp7-rpcsvc *****");
  println!(" .. register access and calibration scans for the GEM CTP7");
  println!("-----------------------------------------------");
  println!(" => Register store {}", settings.address_table_path().display());
  println!(" => Will BIND the REP socket to {}", settings.server_address);
  if args.simulate {
    println!(" => {}", String::from("Running against a SIMULATED register space!").yellow().bold());
  }
  println!("-----------------------------------------------");
  if args.verbose {
    println!("{}", settings);
  }

  let device : Arc<dyn MemoryDevice> = if args.simulate {
    Arc::new(simulated_device(&settings))
  } else {
    if !ON_BOARD {
      warn!("Not running on the CTP7, {} is most likely not the AMC register space!", settings.memory_device);
    }
    let device = MappedDevice::new(&settings.memory_device);
    if let Err(err) = device.probe() {
      error!("Unable to access the memory device! {}", err);
    }
    Arc::new(device)
  };

  let thread_control = Arc::new(Mutex::new(ThreadControl::new()));
  let tc_signals     = Arc::clone(&thread_control);
  let _signals = thread::Builder::new()
    .name("signal-handler".into())
    .spawn(move || {
      signal_handler(tc_signals);
    });

  let served = match MemHub::open(&settings.semaphore_name, device) {
    Err(err) => {
      // no hardware access, so no methods. Requests
      // get answered with an error
      error!("Unable to open the memory hub! {} No module will be registered!", err);
      let mgr = ModuleManager::<()>::new();
      rpc_server(&settings.server_address, &mgr, &(), Arc::clone(&thread_control))
    }
    Ok(hub) => {
      let env     = ModuleEnv::new(hub, settings.clone());
      let mut mgr = ModuleManager::<ModuleEnv>::new();
      register_all_modules(&mut mgr);
      if args.verbose {
        for method in mgr.methods() {
          println!(" -- {}", method);
        }
      }
      rpc_server(&settings.server_address, &mgr, &env, Arc::clone(&thread_control))
    }
  };
  if let Err(err) = served {
    error!("The rpc server failed! {}", err);
    exit(1);
  }
  match thread_control.lock() {
    Ok(tc) => {
      info!("Shutting down. {}", tc);
    }
    Err(err) => {
      error!("Can't acquire lock for ThreadControl! {err}");
    }
  };
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn command_line() {
    let args = Args::try_parse_from(["ctp7-service", "--simulate", "-a", "tcp://127.0.0.1:30001"]).unwrap();
    assert!(args.simulate);
    assert!(!args.verbose);
    assert_eq!(args.address.as_deref(), Some("tcp://127.0.0.1:30001"));
    assert!(args.config.is_none());
    assert!(Args::try_parse_from(["ctp7-service", "--no-such-flag"]).is_err());
  }
}
