//! Structured register names
//!
//! All per-lane registers are addressed through these
//! builders, so that reading and writing the same logical
//! register can never drift apart.

use std::fmt;

/// A fully qualified register name, e.g.
/// GEM_AMC.OH.OH3.GEB.VFAT12.CFG_RUN
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegisterName(String);

impl RegisterName {
  /// Anything below GEM_AMC, e.g. "TTC.CTRL.L1A_ENABLE"
  pub fn amc(field : &str) -> Self {
    RegisterName(format!("GEM_AMC.{}", field))
  }

  /// A register of an OptoHybrid
  pub fn optohybrid(oh : u32, field : &str) -> Self {
    RegisterName(format!("GEM_AMC.OH.OH{}.{}", oh, field))
  }

  /// A VFAT3 register, seen through the GEB
  pub fn vfat(oh : u32, vfat : u32, field : &str) -> Self {
    RegisterName(format!("GEM_AMC.OH.OH{}.GEB.VFAT{}.{}", oh, vfat, field))
  }

  /// A per channel VFAT3 register
  pub fn vfat_channel(oh : u32, vfat : u32, channel : u32, field : &str) -> Self {
    RegisterName(format!("GEM_AMC.OH.OH{}.GEB.VFAT{}.VFAT_CHANNELS.CHANNEL{}.{}", oh, vfat, channel, field))
  }

  /// A register of a VFAT2
  pub fn vfat2(oh : u32, vfat : u32, field : &str) -> Self {
    RegisterName(format!("GEM_AMC.OH.OH{}.GEB.VFATS.VFAT{}.{}", oh, vfat, field))
  }

  /// A per channel register of the VFAT2 generation
  pub fn vfat2_channel(oh : u32, vfat : u32, channel : u32) -> Self {
    RegisterName(format!("GEM_AMC.OH.OH{}.GEB.VFATS.VFAT{}.VFATChannels.ChanReg{}", oh, vfat, channel))
  }

  /// Link status of a VFAT, as seen by the AMC
  pub fn vfat_link(oh : u32, vfat : u32, field : &str) -> Self {
    RegisterName(format!("GEM_AMC.OH_LINKS.OH{}.VFAT{}.{}", oh, vfat, field))
  }

  /// Trigger counters of the OptoHybrid FPGA
  pub fn oh_trigger(oh : u32, field : &str) -> Self {
    RegisterName(format!("GEM_AMC.OH.OH{}.FPGA.TRIG.{}", oh, field))
  }

  /// Firmware scan controller of an OptoHybrid
  pub fn scan_controller(oh : u32, scan : &str, field : &str) -> Self {
    RegisterName(format!("GEM_AMC.OH.OH{}.ScanController.{}.{}", oh, scan, field))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for RegisterName {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl AsRef<str> for RegisterName {
  fn as_ref(&self) -> &str {
    &self.0
  }
}

impl From<&str> for RegisterName {
  fn from(name : &str) -> Self {
    RegisterName(String::from(name))
  }
}

impl From<String> for RegisterName {
  fn from(name : String) -> Self {
    RegisterName(name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builders() {
    assert_eq!(RegisterName::vfat(3, 12, "CFG_RUN").as_str(), "GEM_AMC.OH.OH3.GEB.VFAT12.CFG_RUN");
    assert_eq!(RegisterName::vfat_link(0, 23, "SYNC_ERR_CNT").as_str(), "GEM_AMC.OH_LINKS.OH0.VFAT23.SYNC_ERR_CNT");
    assert_eq!(RegisterName::vfat_channel(1, 2, 127, "MASK").as_str(),
               "GEM_AMC.OH.OH1.GEB.VFAT2.VFAT_CHANNELS.CHANNEL127.MASK");
    assert_eq!(RegisterName::optohybrid(11, "FPGA.TRIG.CTRL.VFAT_MASK").to_string(),
               "GEM_AMC.OH.OH11.FPGA.TRIG.CTRL.VFAT_MASK");
    assert_eq!(RegisterName::vfat2(0, 5, "ContReg0").as_str(), "GEM_AMC.OH.OH0.GEB.VFATS.VFAT5.ContReg0");
  }
}
