//! SBIT rate scans
//!
//! The trigger counters of the OptoHybrid FPGA count the
//! SBITs of each VFAT and the clusters built from them.
//! The serial scan measures the cluster rate of a single
//! VFAT, the parallel scan all unmasked VFATs at once.

use std::thread;
use std::time::Duration;

use ctp7_lib::constants::VFATS_PER_OH;

use crate::access::AccessContext;
use crate::calibration::{
    check_channel,
    check_scan_register,
    run_restoring,
    DacRange,
    RegisterSnapshot,
    ALL_CHANNELS,
};
use crate::errors::ModuleError;
use crate::masks::DisabledLaneSet;
use crate::registers::RegisterName;
use crate::utils::{
    check_oh_index,
    check_vfats_synchronized,
    fw_version_check,
    FirmwareVersion,
};
use crate::vfat3::set_single_chan_mask;

/// The counters of the parallel scan are free running,
/// the window is one second and a bit
pub const RATE_WINDOW : Duration = Duration::from_millis(1005);

/// The VFAT masks with exactly one unmasked VFAT,
/// indexed by its position
pub const SINGLE_VFAT_MASKS : [u32; 24] = [
  0xfffffe, 0xfffffd, 0xfffffb, 0xfffff7,
  0xffffef, 0xffffdf, 0xffffbf, 0xffff7f,
  0xfffeff, 0xfffdff, 0xfffbff, 0xfff7ff,
  0xffefff, 0xffdfff, 0xffbfff, 0xff7fff,
  0xfeffff, 0xfdffff, 0xfbffff, 0xf7ffff,
  0xefffff, 0xdfffff, 0xbfffff, 0x7fffff,
];

/// Results of a rate scan. per_vfat is only filled by
/// the parallel scan, indexed by vfat * points + point
/// index. VFATs outside the mask are never written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SbitRates {
  pub dac_values : Vec<u32>,
  pub per_vfat   : Vec<u32>,
  /// Rate of the whole OptoHybrid in Hz
  pub overall    : Vec<u32>,
}

/// The only unmasked VFAT of a mask
pub fn single_vfat_of_mask(mask : DisabledLaneSet) -> Option<u32> {
  let bits = mask.bits() & 0x00ff_ffff;
  SINGLE_VFAT_MASKS.iter().position(|m| *m == bits).map(|pos| pos as u32)
}

fn require_v3(la : &mut AccessContext, caller : &str) -> Result<(), ModuleError> {
  match fw_version_check(la, caller)? {
    FirmwareVersion::V3  => Ok(()),
    FirmwareVersion::V2b => Err(ModuleError::VersionMismatch(format!("{} is only supported for VFAT3 based systems", caller))),
  }
}

/// Keep the masked VFATs out of the trigger, optionally
/// restricted to a single channel
fn prepare_trigger(la       : &mut AccessContext,
                   saved    : &mut RegisterSnapshot,
                   oh       : u32,
                   mask     : DisabledLaneSet,
                   ch       : u32,
                   scan_reg : &str) -> Result<(), ModuleError> {
  saved.override_reg(la, RegisterName::oh_trigger(oh, "CTRL.VFAT_MASK").as_str(), mask.bits() & 0x00ff_ffff)?;
  for vfat in mask.enabled_lanes() {
    saved.save(la, RegisterName::vfat(oh, vfat, scan_reg).as_str())?;
    if ch != ALL_CHANNELS {
      set_single_chan_mask(la, saved, oh, vfat, ch)?;
    }
  }
  Ok(())
}

/// Measure the SBIT rate of the one unmasked VFAT of
/// mask, wait_time milliseconds per scan point.
///
/// # Arguments
///
/// * invert_vfat_pos : older firmware counts the VFAT
///                     positions from the other end
pub fn sbit_rate_scan(la              : &mut AccessContext,
                      oh              : u32,
                      mask            : DisabledLaneSet,
                      invert_vfat_pos : bool,
                      ch              : u32,
                      range           : &DacRange,
                      scan_reg        : &str,
                      wait_time       : u32) -> Result<SbitRates, ModuleError> {
  check_oh_index(la, oh)?;
  check_scan_register(scan_reg)?;
  check_channel(ch)?;
  if wait_time == 0 {
    return Err(ModuleError::InvalidParameter(String::from("waitTime must not be 0")));
  }
  let pos  = single_vfat_of_mask(mask)
    .ok_or(ModuleError::InvalidParameter(format!("{} does not leave exactly one VFAT unmasked", mask)))?;
  let vfat = if invert_vfat_pos { VFATS_PER_OH - 1 - pos } else { pos };
  require_v3(la, "sbitRateScan")?;
  let vfat_mask = DisabledLaneSet::vfats(SINGLE_VFAT_MASKS[vfat as usize]);
  check_vfats_synchronized(la, oh, vfat_mask)?;
  info!("Measuring the SBIT rate of VFAT {} on OH {} over {}", vfat, oh, range);
  run_restoring(la, |la, saved| {
    prepare_trigger(la, saved, oh, vfat_mask, ch, scan_reg)?;
    let mut rates = SbitRates::default();
    for dac in range.values() {
      la.write_reg(RegisterName::vfat(oh, vfat, scan_reg).as_str(), dac)?;
      la.write_reg(RegisterName::oh_trigger(oh, "CNT.RESET").as_str(), 0x1)?;
      thread::sleep(Duration::from_millis(wait_time as u64));
      let count = la.try_read_reg(RegisterName::oh_trigger(oh, "CNT.CLUSTER_COUNT").as_str())?;
      rates.dac_values.push(dac);
      rates.overall.push((count as u64 * 1000 / wait_time as u64).min(u32::MAX as u64) as u32);
    }
    Ok(rates)
  })
}

/// Measure the SBIT rates of all unmasked VFATs at the
/// same time, one second per scan point
pub fn sbit_rate_scan_parallel(la       : &mut AccessContext,
                               oh       : u32,
                               mask     : DisabledLaneSet,
                               ch       : u32,
                               range    : &DacRange,
                               scan_reg : &str) -> Result<SbitRates, ModuleError> {
  check_oh_index(la, oh)?;
  check_scan_register(scan_reg)?;
  check_channel(ch)?;
  require_v3(la, "sbitRateScanParallel")?;
  check_vfats_synchronized(la, oh, mask)?;
  let lanes = mask.enabled_lanes();
  info!("Measuring the SBIT rates of {} VFATs on OH {} over {}", lanes.len(), oh, range);
  run_restoring(la, |la, saved| {
    prepare_trigger(la, saved, oh, mask, ch, scan_reg)?;
    let points    = range.points();
    let mut rates = SbitRates {
      dac_values : Vec::with_capacity(points),
      per_vfat   : vec![0u32; VFATS_PER_OH as usize * points],
      overall    : Vec::with_capacity(points),
    };
    for dac in range.values() {
      let k = range.point_index(dac);
      for vfat in lanes.iter() {
        la.write_reg(RegisterName::vfat(oh, *vfat, scan_reg).as_str(), dac)?;
      }
      la.write_reg(RegisterName::oh_trigger(oh, "CNT.RESET").as_str(), 0x1)?;
      thread::sleep(RATE_WINDOW);
      for vfat in lanes.iter() {
        let sbits = la.try_read_reg(RegisterName::oh_trigger(oh, &format!("CNT.VFAT{}_SBITS", vfat)).as_str())?;
        rates.per_vfat[*vfat as usize * points + k] = sbits;
      }
      rates.dac_values.push(dac);
      rates.overall.push(la.try_read_reg(RegisterName::oh_trigger(oh, "CNT.CLUSTER_COUNT").as_str())?);
    }
    Ok(rates)
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn single_vfat_masks() {
    for (vfat, m) in SINGLE_VFAT_MASKS.iter().enumerate() {
      assert_eq!(DisabledLaneSet::vfats(*m).enabled_lanes(), vec![vfat as u32]);
    }
    assert_eq!(single_vfat_of_mask(DisabledLaneSet::vfats(0xff7fffff)), Some(23));
    assert_eq!(single_vfat_of_mask(DisabledLaneSet::vfats(0xfffffc)), None);
    assert_eq!(single_vfat_of_mask(DisabledLaneSet::vfats(0)), None);
  }
}
