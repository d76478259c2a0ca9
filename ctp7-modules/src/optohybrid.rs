//! OptoHybrid level operations, the "optohybrid" RPC module
//!
//! Broadcast access to the VFATs of an OptoHybrid and
//! the firmware scan controller of the v2b OptoHybrid.

use std::fmt;

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
use crate::calibration::DacRange;
use crate::errors::ModuleError;
use crate::masks::DisabledLaneSet;
use crate::registers::RegisterName;
use crate::service::{
    respond,
    ModuleEnv,
};
use crate::utils::{
    check_oh_index,
    fw_version_check,
    FirmwareVersion,
};

/// VFAT2 control register 0 in run and in sleep mode
const VFAT2_RUN_MODE   : u32 = 0x37;
const VFAT2_SLEEP_MODE : u32 = 0x36;

/// Trim DAC bits of a VFAT2 channel register
const VFAT2_TRIM_BITS  : u32 = 0x3f;

/// Modes of the firmware scan controller
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ScanMode {
  Threshold           = 0,
  ThresholdPerChannel = 1,
  Latency             = 2,
  SCurve              = 3,
  ThresholdTracking   = 4,
}

impl TryFrom<u32> for ScanMode {
  type Error = ModuleError;

  fn try_from(value : u32) -> Result<Self, Self::Error> {
    match value {
      0 => Ok(ScanMode::Threshold),
      1 => Ok(ScanMode::ThresholdPerChannel),
      2 => Ok(ScanMode::Latency),
      3 => Ok(ScanMode::SCurve),
      4 => Ok(ScanMode::ThresholdTracking),
      _ => Err(ModuleError::InvalidParameter(format!("Unknown scan mode {}", value)))
    }
  }
}

/// Which VFATs the scan controller runs on
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScanTarget {
  /// All unmasked VFATs at once
  Ultra(DisabledLaneSet),
  /// A single VFAT
  Single(u32),
}

impl ScanTarget {
  pub fn controller(&self) -> &'static str {
    match self {
      ScanTarget::Ultra(_)  => "ULTRA",
      ScanTarget::Single(_) => "THLAT",
    }
  }
}

fn controller_name(use_ultra : bool) -> &'static str {
  if use_ultra {
    "ULTRA"
  } else {
    "THLAT"
  }
}

/// Everything the scan controller needs to know
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ScanModuleConfig {
  pub mode    : ScanMode,
  pub target  : ScanTarget,
  pub channel : u32,
  pub nevts   : u32,
  pub range   : DacRange,
}

/// The configuration as read back from the controller
#[derive(Debug, Clone, Default)]
pub struct ScanConfiguration {
  pub controller : String,
  pub mode       : u32,
  pub min        : u32,
  pub max        : u32,
  pub step       : u32,
  pub channel    : u32,
  pub ntrigs     : u32,
  pub status     : u32,
  /// MASK for the ultra scan, CHIP otherwise
  pub target     : u32,
}

impl ScanConfiguration {
  pub fn set_response(&self, response : &mut RpcMessage) {
    response.set_word("MODE", self.mode);
    response.set_word("MIN", self.min);
    response.set_word("MAX", self.max);
    response.set_word("STEP", self.step);
    response.set_word("CHAN", self.channel);
    response.set_word("NTRIGS", self.ntrigs);
    response.set_word("MONITOR.STATUS", self.status);
    if self.controller == "ULTRA" {
      response.set_word("MASK", self.target);
    } else {
      response.set_word("CHIP", self.target);
    }
  }
}

impl fmt::Display for ScanConfiguration {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = String::from("<ScanConfiguration:");
    repr += &(format!("\n  controller : {}", self.controller));
    repr += &(format!("\n  mode       : {}", self.mode));
    repr += &(format!("\n  range      : [{}, {}] step {}", self.min, self.max, self.step));
    repr += &(format!("\n  channel    : {}", self.channel));
    repr += &(format!("\n  ntrigs     : {}", self.ntrigs));
    repr += &(format!("\n  status     : {}", self.status));
    repr += &(format!("\n  target     : {:#x}>", self.target));
    write!(f, "{}", repr)
  }
}

/// Write value to reg_name of every unmasked VFAT
pub fn broadcast_write(la       : &mut AccessContext,
                       oh       : u32,
                       reg_name : &str,
                       value    : u32,
                       mask     : DisabledLaneSet) -> Result<(), ModuleError> {
  check_oh_index(la, oh)?;
  match fw_version_check(la, "broadcastWrite")? {
    FirmwareVersion::V3 => {
      for vfat in mask.enabled_lanes() {
        la.write_reg(RegisterName::vfat(oh, vfat, reg_name).as_str(), value)?;
      }
    }
    FirmwareVersion::V2b => {
      let base = RegisterName::optohybrid(oh, "GEB.Broadcast");
      la.write_reg(&format!("{}.Reset", base), 0)?;
      la.write_reg(&format!("{}.Mask", base), mask.bits())?;
      la.write_reg(&format!("{}.Request.{}", base, reg_name), value)?;
      la.poll_reg(&format!("{}.Running", base), |running| running == 0)?;
    }
  }
  Ok(())
}

/// Read reg_name of every VFAT. Masked VFATs read as 0.
pub fn broadcast_read(la       : &mut AccessContext,
                      oh       : u32,
                      reg_name : &str,
                      mask     : DisabledLaneSet) -> Result<Vec<u32>, ModuleError> {
  check_oh_index(la, oh)?;
  let version  = fw_version_check(la, "broadcastRead")?;
  let mut data = vec![0u32; VFATS_PER_OH as usize];
  for vfat in mask.enabled_lanes() {
    let reg = match version {
      FirmwareVersion::V3  => RegisterName::vfat(oh, vfat, reg_name),
      FirmwareVersion::V2b => RegisterName::vfat2(oh, vfat, reg_name),
    };
    data[vfat as usize] = la.read_reg(reg.as_str());
  }
  Ok(data)
}

/// Put all unmasked VFATs into run (or sleep) mode
pub fn set_all_vfats_run_mode(la : &mut AccessContext, oh : u32, mask : DisabledLaneSet, run : bool) -> Result<(), ModuleError> {
  match fw_version_check(la, "setAllVFATsToRunMode")? {
    FirmwareVersion::V3  => broadcast_write(la, oh, "CFG_RUN", run as u32, mask),
    FirmwareVersion::V2b => {
      let cont_reg0 = if run { VFAT2_RUN_MODE } else { VFAT2_SLEEP_MODE };
      broadcast_write(la, oh, "ContReg0", cont_reg0, mask)
    }
  }
}

fn scan_running(la : &mut AccessContext, oh : u32, controller : &str) -> Result<bool, ModuleError> {
  Ok(la.try_read_reg(RegisterName::scan_controller(oh, controller, "MONITOR.STATUS").as_str())? > 0)
}

/// Program the scan controller. A running scan is
/// never reconfigured.
pub fn configure_scan_module(la : &mut AccessContext, oh : u32, config : &ScanModuleConfig) -> Result<(), ModuleError> {
  check_oh_index(la, oh)?;
  if config.channel >= CHANNELS_PER_VFAT {
    return Err(ModuleError::InvalidParameter(format!("Channel {} does not exist", config.channel)));
  }
  let controller = config.target.controller();
  if scan_running(la, oh, controller)? {
    return Err(ModuleError::ScanController(String::from("Scan is already running, not starting a new scan")));
  }
  let reg = |field : &str| RegisterName::scan_controller(oh, controller, field);
  la.write_reg(reg("RESET").as_str(), 0x1)?;
  la.write_reg(reg("MODE").as_str(), config.mode as u32)?;
  match config.target {
    ScanTarget::Ultra(mask)  => la.write_reg(reg("MASK").as_str(), mask.bits())?,
    ScanTarget::Single(vfat) => {
      if vfat >= VFATS_PER_OH {
        return Err(ModuleError::InvalidParameter(format!("VFAT {} does not exist", vfat)));
      }
      la.write_reg(reg("CHIP").as_str(), vfat)?
    }
  }
  la.write_reg(reg("CHAN").as_str(), config.channel)?;
  la.write_reg(reg("NTRIGS").as_str(), config.nevts)?;
  la.write_reg(reg("MIN").as_str(), config.range.min)?;
  la.write_reg(reg("MAX").as_str(), config.range.max)?;
  la.write_reg(reg("STEP").as_str(), config.range.step)?;
  debug!("Configured {} scan of OH {}: {:?}", controller, oh, config);
  Ok(())
}

pub fn get_scan_configuration(la : &mut AccessContext, oh : u32, use_ultra : bool) -> Result<ScanConfiguration, ModuleError> {
  check_oh_index(la, oh)?;
  let controller = controller_name(use_ultra);
  let reg = |field : &str| RegisterName::scan_controller(oh, controller, field);
  let target_field = if use_ultra { "MASK" } else { "CHIP" };
  Ok(ScanConfiguration {
    controller : String::from(controller),
    mode       : la.try_read_reg(reg("MODE").as_str())?,
    min        : la.try_read_reg(reg("MIN").as_str())?,
    max        : la.try_read_reg(reg("MAX").as_str())?,
    step       : la.try_read_reg(reg("STEP").as_str())?,
    channel    : la.try_read_reg(reg("CHAN").as_str())?,
    ntrigs     : la.try_read_reg(reg("NTRIGS").as_str())?,
    status     : la.try_read_reg(reg("MONITOR.STATUS").as_str())?,
    target     : la.try_read_reg(reg(target_field).as_str())?,
  })
}

/// Start a configured scan. Refused while a scan is
/// running or the controller flags its configuration.
pub fn start_scan_module(la : &mut AccessContext, oh : u32, use_ultra : bool) -> Result<(), ModuleError> {
  check_oh_index(la, oh)?;
  let controller = controller_name(use_ultra);
  if scan_running(la, oh, controller)? {
    return Err(ModuleError::ScanController(String::from("Scan is already running, not starting a new scan")));
  }
  let error_reg = RegisterName::scan_controller(oh, controller, "MONITOR.ERROR");
  if la.try_read_reg(error_reg.as_str())? > 0 {
    return Err(ModuleError::ScanController(String::from("Error in scan configuration, scan will not be started")));
  }
  la.write_reg(RegisterName::scan_controller(oh, controller, "START").as_str(), 0x1)?;
  if la.try_read_reg(error_reg.as_str())? > 0 || !scan_running(la, oh, controller)? {
    let msg = format!("Scan failed to start, ERROR {} STATUS {}",
                      la.read_reg(error_reg.as_str()),
                      la.read_reg(RegisterName::scan_controller(oh, controller, "MONITOR.STATUS").as_str()));
    warn!("{}", msg);
    la.response.set_warning(&msg);
  }
  Ok(())
}

/// Wait for the ultra scan to finish and collect its
/// results, indexed by vfat * points + point index
pub fn get_ultra_scan_results(la : &mut AccessContext, oh : u32, range : &DacRange) -> Result<Vec<u32>, ModuleError> {
  check_oh_index(la, oh)?;
  la.poll_reg(RegisterName::scan_controller(oh, "ULTRA", "MONITOR.STATUS").as_str(), |status| status == 0)?;
  let points   = range.points();
  let mut data = vec![0u32; VFATS_PER_OH as usize * points];
  for dac in range.values() {
    let k = range.point_index(dac);
    for vfat in 0..VFATS_PER_OH {
      let reg = RegisterName::scan_controller(oh, "ULTRA", &format!("RESULTS.VFAT{}", vfat));
      data[vfat as usize * points + k] = la.try_read_reg(reg.as_str())?;
    }
  }
  Ok(data)
}

/// Wait for a single VFAT scan to finish and collect
/// its results, one per scan point
pub fn get_single_scan_results(la : &mut AccessContext, oh : u32, range : &DacRange) -> Result<Vec<u32>, ModuleError> {
  check_oh_index(la, oh)?;
  la.poll_reg(RegisterName::scan_controller(oh, "THLAT", "MONITOR.STATUS").as_str(), |status| status == 0)?;
  let mut data = Vec::<u32>::with_capacity(range.points());
  for _ in range.values() {
    data.push(la.try_read_reg(RegisterName::scan_controller(oh, "THLAT", "RESULTS").as_str())?);
  }
  Ok(data)
}

/// Switch the calibration pulse off for channels
/// ch_min..=ch_max of every unmasked VFAT
pub fn stop_cal_pulse_2_all_channels(la     : &mut AccessContext,
                                     oh     : u32,
                                     mask   : DisabledLaneSet,
                                     ch_min : u32,
                                     ch_max : u32) -> Result<(), ModuleError> {
  check_oh_index(la, oh)?;
  if ch_min > ch_max || ch_max >= CHANNELS_PER_VFAT {
    return Err(ModuleError::InvalidParameter(format!("Invalid channel range [{}, {}]", ch_min, ch_max)));
  }
  let version = fw_version_check(la, "stopCalPulse2AllChannels")?;
  for vfat in mask.enabled_lanes() {
    for ch in ch_min..=ch_max {
      match version {
        FirmwareVersion::V3 => {
          la.write_reg(RegisterName::vfat_channel(oh, vfat, ch, "CALPULSE_ENABLE").as_str(), 0x0)?;
        }
        FirmwareVersion::V2b => {
          // everything but the trim DAC goes
          let reg  = RegisterName::vfat2_channel(oh, vfat, ch);
          let trim = VFAT2_TRIM_BITS & la.try_read_reg(reg.as_str())?;
          la.write_reg(reg.as_str(), trim)?;
        }
      }
    }
  }
  Ok(())
}

fn request_mask(request : &RpcMessage) -> Result<DisabledLaneSet, ModuleError> {
  Ok(DisabledLaneSet::vfats(request.get_word_or("mask", DEFAULT_VFAT_MASK)?))
}

fn rpc_broadcast_write(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh       = request.get_word("ohN")?;
    let reg_name = request.get_string("reg_name")?;
    let value    = request.get_word("value")?;
    let mask     = request_mask(request)?;
    let mut la   = env.context(response)?;
    broadcast_write(&mut la, oh, &reg_name, value, mask)
  });
}

fn rpc_broadcast_read(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh       = request.get_word("ohN")?;
    let reg_name = request.get_string("reg_name")?;
    let mask     = request_mask(request)?;
    let mut la   = env.context(response)?;
    let data     = broadcast_read(&mut la, oh, &reg_name, mask)?;
    la.response.set_word_array("data", &data);
    Ok(())
  });
}

fn rpc_set_all_vfats_to_run_mode(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh     = request.get_word("ohN")?;
    let mask   = request_mask(request)?;
    let mut la = env.context(response)?;
    set_all_vfats_run_mode(&mut la, oh, mask, true)
  });
}

fn rpc_set_all_vfats_to_sleep_mode(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh     = request.get_word("ohN")?;
    let mask   = request_mask(request)?;
    let mut la = env.context(response)?;
    set_all_vfats_run_mode(&mut la, oh, mask, false)
  });
}

fn rpc_configure_scan_module(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh        = request.get_word("ohN")?;
    let use_ultra = request.get_flag_or("useUltra", false)?;
    let target    = if use_ultra {
      ScanTarget::Ultra(request_mask(request)?)
    } else {
      ScanTarget::Single(request.get_word("vfatN")?)
    };
    let config    = ScanModuleConfig {
      mode    : ScanMode::try_from(request.get_word("scanmode")?)?,
      target,
      channel : request.get_word("ch")?,
      nevts   : request.get_word("nevts")?,
      range   : DacRange::from_request(request)?,
    };
    let mut la    = env.context(response)?;
    configure_scan_module(&mut la, oh, &config)
  });
}

fn rpc_print_scan_configuration(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh        = request.get_word("ohN")?;
    let use_ultra = request.get_flag_or("useUltra", false)?;
    let mut la    = env.context(response)?;
    let config    = get_scan_configuration(&mut la, oh, use_ultra)?;
    info!("OH {}: {}", oh, config);
    config.set_response(la.response);
    Ok(())
  });
}

fn rpc_start_scan_module(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh        = request.get_word("ohN")?;
    let use_ultra = request.get_flag_or("useUltra", false)?;
    let mut la    = env.context(response)?;
    start_scan_module(&mut la, oh, use_ultra)
  });
}

fn rpc_get_ultra_scan_results(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh     = request.get_word("ohN")?;
    let range  = DacRange::from_request(request)?;
    let mut la = env.context(response)?;
    let data   = get_ultra_scan_results(&mut la, oh, &range)?;
    la.response.set_word_array("data", &data);
    Ok(())
  });
}

fn rpc_stop_cal_pulse_2_all_channels(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh     = request.get_word("ohN")?;
    let mask   = request_mask(request)?;
    let ch_min = request.get_word_or("ch_min", 0)?;
    let ch_max = request.get_word_or("ch_max", CHANNELS_PER_VFAT - 1)?;
    let mut la = env.context(response)?;
    stop_cal_pulse_2_all_channels(&mut la, oh, mask, ch_min, ch_max)
  });
}

pub fn module_init(mgr : &mut ModuleManager<ModuleEnv>) {
  mgr.register_method("optohybrid", "broadcastWrite", rpc_broadcast_write);
  mgr.register_method("optohybrid", "broadcastRead", rpc_broadcast_read);
  mgr.register_method("optohybrid", "setAllVFATsToRunMode", rpc_set_all_vfats_to_run_mode);
  mgr.register_method("optohybrid", "setAllVFATsToSleepMode", rpc_set_all_vfats_to_sleep_mode);
  mgr.register_method("optohybrid", "configureScanModule", rpc_configure_scan_module);
  mgr.register_method("optohybrid", "printScanConfiguration", rpc_print_scan_configuration);
  mgr.register_method("optohybrid", "startScanModule", rpc_start_scan_module);
  mgr.register_method("optohybrid", "getUltraScanResults", rpc_get_ultra_scan_results);
  mgr.register_method("optohybrid", "stopCalPulse2AllChannels", rpc_stop_cal_pulse_2_all_channels);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn scan_modes() {
    assert_eq!(ScanMode::try_from(3).unwrap(), ScanMode::SCurve);
    assert!(ScanMode::try_from(5).is_err());
    assert_eq!(ScanTarget::Single(3).controller(), "THLAT");
    assert_eq!(ScanTarget::Ultra(DisabledLaneSet::vfats(0)).controller(), "ULTRA");
  }
}
