//! Lane masks
//!
//! Two polarities are in use by the callers:
//!
//! * `mask`/`vfatMask` words: a set bit *disables* the VFAT
//! * `ohMask` words: a set bit *enables* the OptoHybrid
//!
//! Each polarity has its own type. Converting between
//! them is always explicit.

use std::fmt;

use ctp7_lib::constants::{
    OH_PER_AMC,
    VFATS_PER_OH,
};

fn width_bits(width : u32) -> u32 {
  if width >= 32 {
    u32::MAX
  } else {
    (1u32 << width) - 1
  }
}

/// Bit set = lane is masked out
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DisabledLaneSet {
  bits  : u32,
  width : u32,
}

impl DisabledLaneSet {
  /// A VFAT mask of one OptoHybrid (24 lanes)
  pub fn vfats(bits : u32) -> Self {
    Self { bits, width : VFATS_PER_OH }
  }

  /// Nothing masked
  pub fn none(width : u32) -> Self {
    Self { bits : 0, width }
  }

  /// The raw mask word, as the firmware expects it
  pub fn bits(&self) -> u32 {
    self.bits
  }

  pub fn is_masked(&self, lane : u32) -> bool {
    lane >= self.width || (self.bits >> lane) & 0x1 == 1
  }

  pub fn is_enabled(&self, lane : u32) -> bool {
    !self.is_masked(lane)
  }

  /// Mask an additional lane
  pub fn mask(&mut self, lane : u32) {
    if lane < 32 {
      self.bits |= 1 << lane;
    }
  }

  /// All lanes which participate
  pub fn enabled(&self) -> EnabledLaneSet {
    EnabledLaneSet {
      bits  : !self.bits & width_bits(self.width),
      width : self.width,
    }
  }

  pub fn enabled_lanes(&self) -> Vec<u32> {
    self.enabled().lanes()
  }

  pub fn n_enabled(&self) -> usize {
    self.enabled().len()
  }
}

impl fmt::Display for DisabledLaneSet {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<DisabledLaneSet: {:#010x}>", self.bits)
  }
}

/// Bit set = lane participates
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EnabledLaneSet {
  bits  : u32,
  width : u32,
}

impl EnabledLaneSet {
  /// An OptoHybrid mask (12 lanes)
  pub fn ohs(bits : u32) -> Self {
    Self { bits : bits & width_bits(OH_PER_AMC), width : OH_PER_AMC }
  }

  /// A set of VFATs of one OptoHybrid
  pub fn vfats(bits : u32) -> Self {
    Self { bits : bits & width_bits(VFATS_PER_OH), width : VFATS_PER_OH }
  }

  pub fn bits(&self) -> u32 {
    self.bits
  }

  pub fn contains(&self, lane : u32) -> bool {
    lane < self.width && (self.bits >> lane) & 0x1 == 1
  }

  pub fn insert(&mut self, lane : u32) {
    if lane < self.width {
      self.bits |= 1 << lane;
    }
  }

  pub fn lanes(&self) -> Vec<u32> {
    (0..self.width).filter(|l| self.contains(*l)).collect()
  }

  pub fn len(&self) -> usize {
    self.bits.count_ones() as usize
  }

  pub fn is_empty(&self) -> bool {
    self.bits == 0
  }

  /// True if every lane of other is also in self
  pub fn is_superset(&self, other : &EnabledLaneSet) -> bool {
    other.bits & !self.bits == 0
  }

  /// The same set of lanes in the masking polarity.
  /// Bits beyond the lane width are set (masked).
  pub fn disabled(&self) -> DisabledLaneSet {
    DisabledLaneSet {
      bits  : !self.bits,
      width : self.width,
    }
  }
}

impl fmt::Display for EnabledLaneSet {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<EnabledLaneSet: {:#x}>", self.bits)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_vfat_mask_enables_all() {
    let mask = DisabledLaneSet::vfats(0xff00_0000);
    assert_eq!(mask.n_enabled(), 24);
    assert_eq!(mask.enabled().bits(), 0x00ff_ffff);
  }

  #[test]
  fn polarity_conversion() {
    let mask = DisabledLaneSet::vfats(0xff00_0000 | !0b1001 & 0x00ff_ffff);
    assert_eq!(mask.enabled_lanes(), vec![0, 3]);
    let enabled = mask.enabled();
    assert_eq!(enabled.disabled().enabled(), enabled);
    let ohs = EnabledLaneSet::ohs(0xffff);
    assert_eq!(ohs.len(), 12);
    assert!(!ohs.contains(12));
  }
}
