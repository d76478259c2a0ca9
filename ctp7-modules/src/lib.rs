//! # Register access and calibration modules for the GEM CTP7
//!
//! The CTP7 AMC hosts the GEM back-end firmware. Its
//! registers are mapped into the physical memory of the
//! Zynq and addressed by name through the register store.
//! On top of that sit the hardware control modules
//! (OptoHybrid, VFAT3, GBT, SCA, DAQ, TTC) and the
//! calibration scans, all offered as RPC methods.
//!
//! Every method goes through the same chain
//!
//! request -> ModuleEnv -> AccessContext -> MemHub -> MemoryDevice
//!
pub mod memory;
pub mod memhub;
pub mod errors;
pub mod directory;
pub mod addrtable;
pub mod registers;
pub mod masks;
pub mod access;
pub mod service;
pub mod threads;

pub mod utils;
pub mod extras;
pub mod sca;
pub mod gbt;
pub mod daq;
pub mod ttc;
pub mod blaster_ram;
pub mod optohybrid;
pub mod vfat3;
pub mod calibration;

extern crate clap;
#[macro_use] extern crate log;

pub use service::{
    ModuleEnv,
    register_all_modules,
};
