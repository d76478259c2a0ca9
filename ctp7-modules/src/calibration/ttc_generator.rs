//! Internal trigger generation
//!
//! VFAT3 systems use the TTC generator of the AMC, which
//! replaces the backplane TTC stream for the whole AMC.
//! VFAT2 systems use the T1 controller of each OptoHybrid.

use std::fmt;

use crate::access::AccessContext;
use crate::errors::ModuleError;
use crate::registers::RegisterName;
use crate::utils::{
    check_oh_index,
    fw_version_check,
    FirmwareVersion,
};

pub const TTC_GENERATOR : &str = "GEM_AMC.TTC.GENERATOR";

/// What the T1 controller sends
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum T1Mode {
  /// A single kind of T1 signal
  Single        = 0,
  /// CalPulse followed by L1A
  CalPulseL1A   = 1,
  Pattern       = 2,
}

impl TryFrom<u32> for T1Mode {
  type Error = ModuleError;

  fn try_from(value : u32) -> Result<Self, Self::Error> {
    match value {
      0 => Ok(T1Mode::Single),
      1 => Ok(T1Mode::CalPulseL1A),
      2 => Ok(T1Mode::Pattern),
      _ => Err(ModuleError::InvalidParameter(format!("Unknown T1 controller mode {}", value)))
    }
  }
}

/// The T1 signal sent in T1Mode::Single
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum T1Type {
  L1A      = 0,
  CalPulse = 1,
  Resync   = 2,
  BC0      = 3,
}

impl TryFrom<u32> for T1Type {
  type Error = ModuleError;

  fn try_from(value : u32) -> Result<Self, Self::Error> {
    match value {
      0 => Ok(T1Type::L1A),
      1 => Ok(T1Type::CalPulse),
      2 => Ok(T1Type::Resync),
      3 => Ok(T1Type::BC0),
      _ => Err(ModuleError::InvalidParameter(format!("Unknown T1 signal type {}", value)))
    }
  }
}

/// Settings of the trigger generator. Mode and type
/// only matter for the T1 controller.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TtcGenConfig {
  pub mode         : T1Mode,
  pub t1_type      : T1Type,
  /// BX between CalPulse and L1A
  pub pulse_delay  : u32,
  /// BX between two L1As
  pub l1a_interval : u32,
  /// 0 means no limit
  pub n_pulses     : u32,
  pub enable       : bool,
}

impl fmt::Display for TtcGenConfig {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = String::from("<TtcGenConfig:");
    repr += &(format!("\n  mode         : {:?}", self.mode));
    repr += &(format!("\n  type         : {:?}", self.t1_type));
    repr += &(format!("\n  pulse delay  : {}", self.pulse_delay));
    repr += &(format!("\n  L1A interval : {}", self.l1a_interval));
    repr += &(format!("\n  pulses       : {}", self.n_pulses));
    repr += &(format!("\n  enable       : {}>", self.enable));
    write!(f, "{}", repr)
  }
}

fn t1_controller(oh : u32, field : &str) -> RegisterName {
  RegisterName::optohybrid(oh, &format!("T1Controller.{}", field))
}

/// Configure the AMC TTC generator
pub fn ttc_gen_conf_v3(la : &mut AccessContext, config : &TtcGenConfig) -> Result<(), ModuleError> {
  la.write_reg(&format!("{}.RESET", TTC_GENERATOR), 0x1)?;
  la.write_reg(&format!("{}.CYCLIC_L1A_GAP", TTC_GENERATOR), config.l1a_interval)?;
  la.write_reg(&format!("{}.CYCLIC_CALPULSE_TO_L1A_GAP", TTC_GENERATOR), config.pulse_delay)?;
  la.write_reg(&format!("{}.CYCLIC_L1A_COUNT", TTC_GENERATOR), config.n_pulses)?;
  la.write_reg(&format!("{}.ENABLE", TTC_GENERATOR), config.enable as u32)?;
  Ok(())
}

fn toggle_t1_controller(la : &mut AccessContext, oh : u32, enable : bool) -> Result<(), ModuleError> {
  let running = la.try_read_reg(t1_controller(oh, "MONITOR").as_str())? != 0;
  if running != enable {
    la.write_reg(t1_controller(oh, "TOGGLE").as_str(), 0x1)?;
  }
  Ok(())
}

/// Configure the trigger generator, and start or
/// stop it according to config.enable
pub fn ttc_gen_conf(la : &mut AccessContext, oh : u32, config : &TtcGenConfig) -> Result<(), ModuleError> {
  check_oh_index(la, oh)?;
  debug!("Configuring the trigger generator for OH {}: {}", oh, config);
  match fw_version_check(la, "ttcGenConf")? {
    FirmwareVersion::V3  => ttc_gen_conf_v3(la, config),
    FirmwareVersion::V2b => {
      la.write_reg(t1_controller(oh, "RESET").as_str(), 0x1)?;
      la.write_reg(t1_controller(oh, "MODE").as_str(), config.mode as u32)?;
      la.write_reg(t1_controller(oh, "TYPE").as_str(), config.t1_type as u32)?;
      la.write_reg(t1_controller(oh, "DELAY").as_str(), config.pulse_delay)?;
      la.write_reg(t1_controller(oh, "INTERVAL").as_str(), config.l1a_interval)?;
      la.write_reg(t1_controller(oh, "NUMBER").as_str(), config.n_pulses)?;
      toggle_t1_controller(la, oh, config.enable)
    }
  }
}

/// Start or stop the trigger generator. On VFAT3
/// systems this affects all links of the AMC.
pub fn ttc_gen_toggle(la : &mut AccessContext, oh : u32, enable : bool) -> Result<(), ModuleError> {
  check_oh_index(la, oh)?;
  match fw_version_check(la, "ttcGenToggle")? {
    FirmwareVersion::V3  => {
      la.write_reg(&format!("{}.ENABLE", TTC_GENERATOR), enable as u32)?;
      Ok(())
    }
    FirmwareVersion::V2b => toggle_t1_controller(la, oh, enable),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn t1_codes() {
    assert_eq!(T1Mode::try_from(1).unwrap(), T1Mode::CalPulseL1A);
    assert!(T1Mode::try_from(3).is_err());
    assert_eq!(T1Type::try_from(3).unwrap() as u32, 3);
    assert!(T1Type::try_from(4).is_err());
    assert_eq!(t1_controller(2, "MODE").as_str(), "GEM_AMC.OH.OH2.T1Controller.MODE");
  }
}
