//! Read (and optionally write) registers by name,
//! through the same access layer the service uses

use std::sync::Arc;
use std::process::exit;

#[macro_use] extern crate log;

use clap::Parser;

use ctp7_lib::{
    init_env_logger,
    Ctp7Settings,
    RpcMessage,
};

use ctp7_modules::memhub::MemHub;
use ctp7_modules::memory::MappedDevice;
use ctp7_modules::service::ModuleEnv;

#[derive(Parser, Debug)]
#[command(author = "GEM DAQ", version, about, long_about = None)]
struct Args {
  /// Full register names, e.g. GEM_AMC.GEM_SYSTEM.RELEASE.MAJOR
  #[arg(required = true)]
  registers : Vec<String>,
  /// A .toml file with the service settings
  #[arg(short, long)]
  config    : Option<String>,
  /// Write this value to every register before reading it back
  #[arg(short, long)]
  write     : Option<u32>,
}

fn main() {
  init_env_logger();
  let args = Args::parse();
  let settings = match &args.config {
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
  let device = Arc::new(MappedDevice::new(&settings.memory_device));
  let hub = match MemHub::open(&settings.semaphore_name, device) {
    Err(err) => {
      error!("Unable to open the memory hub! {}", err);
      exit(1);
    }
    Ok(hub) => hub
  };
  let env = ModuleEnv::new(hub, settings);
  let mut response = RpcMessage::new();
  let mut la = match env.context(&mut response) {
    Err(err) => {
      error!("Unable to open the register store! {}", err);
      exit(1);
    }
    Ok(la) => la
  };
  for reg_name in &args.registers {
    let desc = match la.lookup(reg_name) {
      Err(err) => {
        println!("=> {} : {}", reg_name, err);
        continue;
      }
      Ok(desc) => desc
    };
    println!("=> {}", desc);
    if let Some(value) = args.write {
      match la.write_reg(reg_name, value) {
        Err(err) => println!("=> -- write {:#010x} failed! {}", value, err),
        Ok(_)    => println!("=> -- wrote {:#010x}", value),
      }
    }
    match la.try_read_reg(reg_name) {
      Err(err)  => println!("=> -- read failed! {}", err),
      Ok(value) => println!("=> -- {:#010x} ({})", value, value),
    }
  }
}
