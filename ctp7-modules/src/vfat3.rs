//! VFAT3 calibration pulse, channel masks and the
//! DAC monitor scan. The "vfat3" RPC module.

use std::thread;
use std::time::Duration;

use ctp7_lib::{
    ModuleManager,
    RpcMessage,
};
use ctp7_lib::constants::{
    CHANNELS_PER_VFAT,
    DEFAULT_VFAT_MASK,
    VFATS_PER_OH,
};

use crate::access::AccessContext;
use crate::calibration::{
    check_channel,
    run_restoring,
    DacRange,
    RegisterSnapshot,
    ALL_CHANNELS,
};
use crate::errors::ModuleError;
use crate::masks::{
    DisabledLaneSet,
    EnabledLaneSet,
};
use crate::registers::RegisterName;
use crate::service::{
    respond,
    ModuleEnv,
};
use crate::utils::{
    check_oh_index,
    check_vfats_synchronized,
    existing_ohs,
    fw_version_check,
    get_oh_vfat_mask,
    FirmwareVersion,
};

/// AMC side monitor of the VFAT data stream
pub const DAQ_MONITOR : &str = "GEM_AMC.GEM_TESTS.VFAT_DAQ_MONITOR";

/// The monitored DACs of a VFAT3: monitor select,
/// DAC register, and its range
pub const DAC_MONITOR_MAP : [(u32, &str, u32, u32); 18] = [
  // ADC measures a current
  ( 1, "CFG_CAL_DAC",          0, 0xff),
  ( 2, "CFG_BIAS_PRE_I_BIT",   0, 0xff),
  ( 3, "CFG_BIAS_PRE_I_BLCC",  0, 0x3f),
  ( 4, "CFG_BIAS_PRE_I_BSF",   0, 0x3f),
  ( 5, "CFG_BIAS_SH_I_BFCAS",  0, 0xff),
  ( 6, "CFG_BIAS_SH_I_BDIFF",  0, 0xff),
  ( 7, "CFG_BIAS_SD_I_BDIFF",  0, 0xff),
  ( 8, "CFG_BIAS_SD_I_BFCAS",  0, 0xff),
  ( 9, "CFG_BIAS_SD_I_BSF",    0, 0x3f),
  (10, "CFG_BIAS_CFD_DAC_1",   0, 0x3f),
  (11, "CFG_BIAS_CFD_DAC_2",   0, 0x3f),
  (12, "CFG_HYST",             0, 0x3f),
  (14, "CFG_THR_ARM_DAC",      0, 0xff),
  (15, "CFG_THR_ZCC_DAC",      0, 0xff),
  // ADC measures a voltage
  (33, "CFG_CAL_DAC",          0, 0xff),
  (34, "CFG_BIAS_PRE_VREF",    0, 0xff),
  (35, "CFG_THR_ARM_DAC",      0, 0xff),
  (36, "CFG_THR_ZCC_DAC",      0, 0xff),
];

/// Register and range of a monitored DAC
pub fn dac_monitor_info(dac_select : u32) -> Option<(&'static str, DacRange)> {
  DAC_MONITOR_MAP.iter()
    .find(|(select, _, _, _)| *select == dac_select)
    .map(|(_, reg, min, max)| (*reg, DacRange { min : *min, max : *max, step : 1 }))
}

/// One point of a DAC scan, as a single word
///
/// bits [7:0] DAC value, [17:8] ADC value,
/// [22:18] VFAT, [26:23] OptoHybrid
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DacScanPoint {
  pub dac  : u32,
  pub adc  : u32,
  pub vfat : u32,
  pub oh   : u32,
}

impl DacScanPoint {
  pub fn pack(&self) -> u32 {
    ((self.oh & 0xf) << 23) | ((self.vfat & 0x1f) << 18) | ((self.adc & 0x3ff) << 8) | (self.dac & 0xff)
  }

  pub fn unpack(word : u32) -> Self {
    Self {
      dac  : word & 0xff,
      adc  : (word >> 8) & 0x3ff,
      vfat : (word >> 18) & 0x1f,
      oh   : (word >> 23) & 0xf,
    }
  }
}

fn require_v3(la : &mut AccessContext, caller : &str) -> Result<(), ModuleError> {
  match fw_version_check(la, caller)? {
    FirmwareVersion::V3  => Ok(()),
    FirmwareVersion::V2b => Err(ModuleError::VersionMismatch(format!("{} is only supported for VFAT3 based systems", caller))),
  }
}

/// Switch the calibration pulse of channel ch on or off
/// for every unmasked VFAT. Switching off with ch ==
/// ALL_CHANNELS clears the pulse of all channels.
///
/// # Arguments
///
/// * current_pulse    : current instead of voltage pulse
/// * cal_scale_factor : pulse height for the current pulse,
///                      0 = 25%, 1 = 50%, 2 = 75%, 3 = 100%
pub fn conf_cal_pulse(la               : &mut AccessContext,
                      oh               : u32,
                      mask             : DisabledLaneSet,
                      ch               : u32,
                      toggle_on        : bool,
                      current_pulse    : bool,
                      cal_scale_factor : u32) -> Result<(), ModuleError> {
  check_oh_index(la, oh)?;
  check_channel(ch)?;
  require_v3(la, "confCalPulse")?;
  if ch == ALL_CHANNELS {
    if toggle_on {
      return Err(ModuleError::InvalidParameter(
        String::from("The calibration pulse can only be switched on for a single channel")));
    }
    for vfat in mask.enabled_lanes() {
      for chan in 0..CHANNELS_PER_VFAT {
        la.write_reg(RegisterName::vfat_channel(oh, vfat, chan, "CALPULSE_ENABLE").as_str(), 0x0)?;
      }
    }
    return Ok(());
  }
  if cal_scale_factor > 0x3 {
    return Err(ModuleError::InvalidParameter(format!("calScaleFactor {} is out of range [0, 3]", cal_scale_factor)));
  }
  for vfat in mask.enabled_lanes() {
    let pulse = RegisterName::vfat_channel(oh, vfat, ch, "CALPULSE_ENABLE");
    if toggle_on {
      la.write_reg(pulse.as_str(), 0x1)?;
      if current_pulse {
        la.write_reg(RegisterName::vfat(oh, vfat, "CFG_CAL_MODE").as_str(), 0x2)?;
        la.write_reg(RegisterName::vfat(oh, vfat, "CFG_CAL_SEL_POL").as_str(), 0x0)?;
        la.write_reg(RegisterName::vfat(oh, vfat, "CFG_CAL_FS").as_str(), cal_scale_factor)?;
      } else {
        la.write_reg(RegisterName::vfat(oh, vfat, "CFG_CAL_MODE").as_str(), 0x1)?;
      }
    } else {
      la.write_reg(pulse.as_str(), 0x0)?;
      la.write_reg(RegisterName::vfat(oh, vfat, "CFG_CAL_MODE").as_str(), 0x0)?;
    }
  }
  Ok(())
}

/// Save the calibration pulse settings conf_cal_pulse
/// is about to change
pub fn save_cal_pulse(la : &mut AccessContext, saved : &mut RegisterSnapshot, oh : u32, mask : DisabledLaneSet, ch : u32) -> Result<(), ModuleError> {
  for vfat in mask.enabled_lanes() {
    saved.save(la, RegisterName::vfat_channel(oh, vfat, ch, "CALPULSE_ENABLE").as_str())?;
    for field in ["CFG_CAL_MODE", "CFG_CAL_SEL_POL", "CFG_CAL_FS"] {
      saved.save(la, RegisterName::vfat(oh, vfat, field).as_str())?;
    }
  }
  Ok(())
}

/// Mask every channel of a VFAT but ch. The previous
/// masks go into saved, restoring saved undoes this.
pub fn set_single_chan_mask(la    : &mut AccessContext,
                            saved : &mut RegisterSnapshot,
                            oh    : u32,
                            vfat  : u32,
                            ch    : u32) -> Result<(), ModuleError> {
  if ch >= CHANNELS_PER_VFAT {
    return Err(ModuleError::InvalidParameter(format!("Channel {} does not exist", ch)));
  }
  for chan in 0..CHANNELS_PER_VFAT {
    saved.override_reg(la, RegisterName::vfat_channel(oh, vfat, chan, "MASK").as_str(), (chan != ch) as u32)?;
  }
  Ok(())
}

/// Point the AMC DAQ monitor at an OptoHybrid, and at
/// a single channel or the OR of all of them
pub fn dac_mon_conf(la : &mut AccessContext, saved : &mut RegisterSnapshot, oh : u32, ch : u32) -> Result<(), ModuleError> {
  check_channel(ch)?;
  let ctrl = |field : &str| format!("{}.CTRL.{}", DAQ_MONITOR, field);
  saved.override_reg(la, &ctrl("ENABLE"), 0x0)?;
  la.write_reg(&ctrl("RESET"), 0x1)?;
  saved.override_reg(la, &ctrl("OH_SELECT"), oh)?;
  if ch == ALL_CHANNELS {
    saved.override_reg(la, &ctrl("VFAT_CHANNEL_GLOBAL_OR"), 0x1)?;
  } else {
    saved.override_reg(la, &ctrl("VFAT_CHANNEL_GLOBAL_OR"), 0x0)?;
    saved.override_reg(la, &ctrl("VFAT_CHANNEL_SELECT"), ch)?;
  }
  Ok(())
}

fn read_adc(la : &mut AccessContext, oh : u32, vfat : u32, use_ext_ref_adc : bool) -> Result<u32, ModuleError> {
  let (update, cached) = if use_ext_ref_adc {
    ("ADC1_UPDATE", "ADC1_CACHED")
  } else {
    ("ADC0_UPDATE", "ADC0_CACHED")
  };
  // reading the update register starts a conversion
  la.try_read_reg(RegisterName::vfat(oh, vfat, update).as_str())?;
  thread::sleep(Duration::from_micros(20));
  Ok(la.try_read_reg(RegisterName::vfat(oh, vfat, cached).as_str())?)
}

/// Sweep a monitored DAC over its full range and read
/// the ADC of every unmasked VFAT for each value.
///
/// # Returns
///
/// VFATS_PER_OH * points packed `DacScanPoint`s, indexed
/// by vfat * points + point index. Masked VFATs stay 0.
pub fn dac_scan(la              : &mut AccessContext,
                oh              : u32,
                dac_select      : u32,
                dac_step        : u32,
                mask            : DisabledLaneSet,
                use_ext_ref_adc : bool) -> Result<Vec<u32>, ModuleError> {
  check_oh_index(la, oh)?;
  let (dac_reg, full) = dac_monitor_info(dac_select)
    .ok_or(ModuleError::InvalidParameter(format!("Monitoring select value {} is not a known DAC", dac_select)))?;
  let range = DacRange::new(full.min, full.max, dac_step)?;
  require_v3(la, "dacScan")?;
  check_vfats_synchronized(la, oh, mask)?;
  info!("Scanning DAC {} of OH {} over {}", dac_reg, oh, range);
  let lanes = mask.enabled_lanes();
  run_restoring(la, |la, saved| {
    for vfat in lanes.iter() {
      saved.override_reg(la, RegisterName::vfat(oh, *vfat, "CFG_MONITOR_SELECT").as_str(), dac_select)?;
      saved.save(la, RegisterName::vfat(oh, *vfat, dac_reg).as_str())?;
    }
    let points   = range.points();
    let mut data = vec![0u32; VFATS_PER_OH as usize * points];
    for dac in range.values() {
      let k = range.point_index(dac);
      for vfat in lanes.iter() {
        la.write_reg(RegisterName::vfat(oh, *vfat, dac_reg).as_str(), dac)?;
        let adc = read_adc(la, oh, *vfat, use_ext_ref_adc)?;
        data[*vfat as usize * points + k] = DacScanPoint { dac, adc, vfat : *vfat, oh }.pack();
      }
    }
    Ok(data)
  })
}

/// dac_scan for every OptoHybrid in oh_mask the firmware
/// has, VFATs which are not synchronized are left out.
/// The results of the OptoHybrids are concatenated.
pub fn dac_scan_multilink(la              : &mut AccessContext,
                          oh_mask         : EnabledLaneSet,
                          dac_select      : u32,
                          dac_step        : u32,
                          use_ext_ref_adc : bool) -> Result<Vec<u32>, ModuleError> {
  let mut data = Vec::<u32>::new();
  for oh in existing_ohs(la, oh_mask)? {
    let mask = get_oh_vfat_mask(la, oh)?;
    data.extend(dac_scan(la, oh, dac_select, dac_step, mask, use_ext_ref_adc)?);
  }
  Ok(data)
}

fn rpc_conf_cal_pulse(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh               = request.get_word("ohN")?;
    let mask             = DisabledLaneSet::vfats(request.get_word_or("mask", DEFAULT_VFAT_MASK)?);
    let ch               = request.get_word("ch")?;
    let toggle_on        = request.get_flag("toggleOn")?;
    let current_pulse    = request.get_flag_or("currentPulse", false)?;
    let cal_scale_factor = request.get_word_or("calScaleFactor", 0x3)?;
    let mut la           = env.context(response)?;
    conf_cal_pulse(&mut la, oh, mask, ch, toggle_on, current_pulse, cal_scale_factor)
  });
}

fn rpc_dac_scan(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh              = request.get_word("ohN")?;
    let dac_select      = request.get_word("dacSelect")?;
    let dac_step        = request.get_word_or("dacStep", 1)?;
    let mask            = DisabledLaneSet::vfats(request.get_word_or("mask", DEFAULT_VFAT_MASK)?);
    let use_ext_ref_adc = request.get_flag_or("useExtRefADC", false)?;
    let mut la          = env.context(response)?;
    let data            = dac_scan(&mut la, oh, dac_select, dac_step, mask, use_ext_ref_adc)?;
    la.response.set_word_array("dacScanResults", &data);
    Ok(())
  });
}

fn rpc_dac_scan_multilink(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh_mask         = EnabledLaneSet::ohs(request.get_word_or("ohMask", 0xfff)?);
    let dac_select      = request.get_word("dacSelect")?;
    let dac_step        = request.get_word_or("dacStep", 1)?;
    let use_ext_ref_adc = request.get_flag_or("useExtRefADC", false)?;
    let mut la          = env.context(response)?;
    let data            = dac_scan_multilink(&mut la, oh_mask, dac_select, dac_step, use_ext_ref_adc)?;
    la.response.set_word_array("dacScanResultsAll", &data);
    Ok(())
  });
}

pub fn module_init(mgr : &mut ModuleManager<ModuleEnv>) {
  mgr.register_method("vfat3", "confCalPulse", rpc_conf_cal_pulse);
  mgr.register_method("vfat3", "dacScan", rpc_dac_scan);
  mgr.register_method("vfat3", "dacScanMultiLink", rpc_dac_scan_multilink);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn dac_point_packing() {
    let point = DacScanPoint { dac : 0xab, adc : 0x3ff, vfat : 23, oh : 11 };
    let word  = point.pack();
    assert_eq!(word & 0xff, 0xab);
    assert_eq!((word >> 18) & 0x1f, 23);
    assert_eq!(DacScanPoint::unpack(word), point);
    // out of range fields do not leak into their neighbours
    let wide = DacScanPoint { dac : 0x1ff, adc : 0, vfat : 0, oh : 0 }.pack();
    assert_eq!(wide, 0xff);
  }

  #[test]
  fn monitor_map() {
    let (reg, range) = dac_monitor_info(12).unwrap();
    assert_eq!(reg, "CFG_HYST");
    assert_eq!(range.max, 0x3f);
    assert_eq!(dac_monitor_info(33).unwrap().0, "CFG_CAL_DAC");
    assert!(dac_monitor_info(13).is_none());
    assert!(dac_monitor_info(0).is_none());
  }
}
