//! Calibration scans, the "calibration" RPC module
//!
//! All scans go through the same steps:
//!
//! * check the firmware version and the scan parameters
//! * check that the requested VFATs are synchronized,
//!   save every register the scan is going to override
//! * sweep the scan register and collect the counters
//! * write the saved registers back
//!
//! The last step runs whatever happened before, see
//! `run_restoring`.

pub mod gen_scan;
pub mod sbit_monitor;
pub mod sbit_rate;
pub mod ttc_generator;

use std::fmt;

use ctp7_lib::{
    ModuleManager,
    RpcMessage,
};
use ctp7_lib::constants::{
    CHANNELS_PER_VFAT,
    DEFAULT_VFAT_MASK,
};

use crate::access::AccessContext;
use crate::errors::ModuleError;
use crate::masks::DisabledLaneSet;
use crate::service::{
    respond,
    ModuleEnv,
};

use gen_scan::{
    gen_channel_scan,
    gen_scan,
    GenScanConfig,
};
use sbit_monitor::sbit_read_out;
use sbit_rate::{
    sbit_rate_scan,
    sbit_rate_scan_parallel,
};
use ttc_generator::{
    ttc_gen_conf,
    ttc_gen_toggle,
    T1Mode,
    T1Type,
    TtcGenConfig,
};

/// Channel number which stands for "all channels"
pub const ALL_CHANNELS : u32 = CHANNELS_PER_VFAT;

/// The widest VFAT3 DAC has 10 bits
pub const MAX_SCAN_POINTS : u32 = 1024;

/// The values a scan register runs through,
/// min and max included
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DacRange {
  pub min  : u32,
  pub max  : u32,
  pub step : u32,
}

impl DacRange {
  pub fn new(min : u32, max : u32, step : u32) -> Result<Self, ModuleError> {
    if step == 0 {
      return Err(ModuleError::InvalidParameter(String::from("The DAC step must not be 0")));
    }
    if min > max {
      return Err(ModuleError::InvalidParameter(format!("dacMin ({}) is larger than dacMax ({})", min, max)));
    }
    let points = ((max - min) / step).checked_add(1);
    match points {
      Some(n) if n <= MAX_SCAN_POINTS => (),
      _ => {
        return Err(ModuleError::InvalidParameter(
          format!("[{}, {}] step {} has more than {} scan points", min, max, step, MAX_SCAN_POINTS)));
      }
    }
    Ok(Self {
      min,
      max,
      step,
    })
  }

  /// Number of scan points
  pub fn points(&self) -> usize {
    (self.max.saturating_sub(self.min) / self.step.max(1)) as usize + 1
  }

  pub fn values(&self) -> impl Iterator<Item = u32> {
    (self.min..=self.max).step_by(self.step as usize)
  }

  /// Position of a value in the sweep
  pub fn point_index(&self, value : u32) -> usize {
    ((value - self.min) / self.step) as usize
  }

  /// Read the range from the usual dacMin, dacMax
  /// and dacStep keys
  pub fn from_request(request : &RpcMessage) -> Result<Self, ModuleError> {
    DacRange::new(request.get_word("dacMin")?,
                  request.get_word("dacMax")?,
                  request.get_word_or("dacStep", 1)?)
  }
}

impl fmt::Display for DacRange {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<DacRange: [{}, {}] step {}>", self.min, self.max, self.step)
  }
}

/// Registers saved before a scan overrides them
#[derive(Debug, Clone, Default)]
pub struct RegisterSnapshot {
  saved : Vec<(String, u32)>,
}

impl RegisterSnapshot {
  pub fn new() -> Self {
    Self::default()
  }

  /// Remember the current value of a register. A
  /// register is only saved the first time.
  pub fn save(&mut self, la : &mut AccessContext, reg_name : &str) -> Result<u32, ModuleError> {
    if let Some((_, value)) = self.saved.iter().find(|(name, _)| name == reg_name) {
      return Ok(*value);
    }
    let value = la.try_read_reg(reg_name)?;
    self.saved.push((String::from(reg_name), value));
    Ok(value)
  }

  /// Save a register, then write value to it
  pub fn override_reg(&mut self, la : &mut AccessContext, reg_name : &str, value : u32) -> Result<(), ModuleError> {
    self.save(la, reg_name)?;
    la.write_reg(reg_name, value)?;
    Ok(())
  }

  /// Write everything back, newest first. All registers
  /// are attempted, the first failure is returned.
  pub fn restore(&self, la : &mut AccessContext) -> Result<(), ModuleError> {
    let mut first_err : Option<ModuleError> = None;
    for (name, value) in self.saved.iter().rev() {
      if let Err(err) = la.write_reg(name, *value) {
        error!("Unable to restore {} to {:#x}! {}", name, value, err);
        if first_err.is_none() {
          first_err = Some(err.into());
        }
      }
    }
    match first_err {
      Some(err) => Err(err),
      None      => Ok(())
    }
  }

  pub fn len(&self) -> usize {
    self.saved.len()
  }

  pub fn is_empty(&self) -> bool {
    self.saved.is_empty()
  }
}

/// Run body with a fresh snapshot, and restore the
/// snapshot afterwards no matter how body ended.
/// An error of body takes precedence over an error
/// of the restore.
pub fn run_restoring<T, F>(la : &mut AccessContext, body : F) -> Result<T, ModuleError>
  where F : FnOnce(&mut AccessContext, &mut RegisterSnapshot) -> Result<T, ModuleError> {
  let mut snapshot = RegisterSnapshot::new();
  let result       = body(la, &mut snapshot);
  if !snapshot.is_empty() {
    debug!("Restoring {} registers", snapshot.len());
  }
  let restored     = snapshot.restore(la);
  let value        = result?;
  restored?;
  Ok(value)
}

/// Scan registers are single fields of a VFAT,
/// e.g. CFG_THR_ARM_DAC
pub fn check_scan_register(scan_reg : &str) -> Result<(), ModuleError> {
  if scan_reg.is_empty()
    || !scan_reg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
    return Err(ModuleError::InvalidParameter(format!("'{}' is not a valid scan register", scan_reg)));
  }
  Ok(())
}

/// Refuse channels beyond ALL_CHANNELS
pub fn check_channel(ch : u32) -> Result<(), ModuleError> {
  if ch > ALL_CHANNELS {
    return Err(ModuleError::InvalidParameter(
      format!("Channel {} does not exist, use {} for all channels", ch, ALL_CHANNELS)));
  }
  Ok(())
}

fn request_gen_scan_config(request : &RpcMessage) -> Result<GenScanConfig, ModuleError> {
  Ok(GenScanConfig {
    mask             : DisabledLaneSet::vfats(request.get_word_or("mask", DEFAULT_VFAT_MASK)?),
    channel          : request.get_word_or("ch", ALL_CHANNELS)?,
    use_cal_pulse    : request.get_flag_or("useCalPulse", false)?,
    current_pulse    : request.get_flag_or("currentPulse", false)?,
    cal_scale_factor : request.get_word_or("calScaleFactor", 0x3)?,
    nevts            : request.get_word("nevts")?,
    range            : DacRange::from_request(request)?,
    scan_reg         : request.get_string("scanReg")?,
    use_ultra        : request.get_flag_or("useUltra", true)?,
    use_ext_trig     : request.get_flag_or("useExtTrig", false)?,
    l1a_interval     : request.get_word_or("L1Ainterval", gen_scan::DEFAULT_L1A_INTERVAL)?,
    pulse_delay      : request.get_word_or("pulseDelay", gen_scan::DEFAULT_PULSE_DELAY)?,
  })
}

fn rpc_gen_scan(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh     = request.get_word("ohN")?;
    let config = request_gen_scan_config(request)?;
    let mut la = env.context(response)?;
    let data   = gen_scan(&mut la, oh, &config)?;
    la.response.set_word_array("data", &data);
    Ok(())
  });
}

fn rpc_gen_channel_scan(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh     = request.get_word("ohN")?;
    let config = request_gen_scan_config(request)?;
    let mut la = env.context(response)?;
    let data   = gen_channel_scan(&mut la, oh, &config)?;
    la.response.set_word_array("data", &data);
    Ok(())
  });
}

fn rpc_sbit_rate_scan(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh          = request.get_word("ohN")?;
    let mask        = DisabledLaneSet::vfats(request.get_word("maskOh")?);
    let ch          = request.get_word_or("ch", ALL_CHANNELS)?;
    let range       = DacRange::from_request(request)?;
    let scan_reg    = request.get_string("scanReg")?;
    let is_parallel = request.get_flag_or("isParallel", false)?;
    let mut la      = env.context(response)?;
    if is_parallel {
      let rates = sbit_rate_scan_parallel(&mut la, oh, mask, ch, &range, &scan_reg)?;
      la.response.set_word_array("outDataDacValue", &rates.dac_values);
      la.response.set_word_array("outDataVFATRate", &rates.per_vfat);
      la.response.set_word_array("outDataCTP7Rate", &rates.overall);
    } else {
      let invert    = request.get_flag_or("invertVFATPos", false)?;
      let wait_time = request.get_word_or("waitTime", 1000)?;
      let rates     = sbit_rate_scan(&mut la, oh, mask, invert, ch, &range, &scan_reg, wait_time)?;
      la.response.set_word_array("outDataDacValue", &rates.dac_values);
      la.response.set_word_array("outDataCTP7Rate", &rates.overall);
    }
    Ok(())
  });
}

fn rpc_sbit_read_out(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh           = request.get_word("ohN")?;
    let acquire_time = request.get_word("acquireTime")?;
    let mut la       = env.context(response)?;
    let readout      = sbit_read_out(&mut la, oh, acquire_time)?;
    la.response.set_word_array("storedSbits", &readout.clusters);
    la.response.set_word("maxNetworkSizeReached", readout.size_limited as u32);
    Ok(())
  });
}

fn rpc_ttc_gen_conf(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh     = request.get_word("ohN")?;
    let config = TtcGenConfig {
      mode         : T1Mode::try_from(request.get_word_or("mode", 0)?)?,
      t1_type      : T1Type::try_from(request.get_word_or("type", 0)?)?,
      pulse_delay  : request.get_word("pulseDelay")?,
      l1a_interval : request.get_word("L1Ainterval")?,
      n_pulses     : request.get_word_or("nPulses", 0)?,
      enable       : request.get_flag("enable")?,
    };
    let mut la = env.context(response)?;
    ttc_gen_conf(&mut la, oh, &config)
  });
}

fn rpc_ttc_gen_toggle(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh     = request.get_word("ohN")?;
    let enable = request.get_flag("enable")?;
    let mut la = env.context(response)?;
    ttc_gen_toggle(&mut la, oh, enable)
  });
}

pub fn module_init(mgr : &mut ModuleManager<ModuleEnv>) {
  mgr.register_method("calibration", "genScan", rpc_gen_scan);
  mgr.register_method("calibration", "genChannelScan", rpc_gen_channel_scan);
  mgr.register_method("calibration", "sbitRateScan", rpc_sbit_rate_scan);
  mgr.register_method("calibration", "sbitReadOut", rpc_sbit_read_out);
  mgr.register_method("calibration", "ttcGenConf", rpc_ttc_gen_conf);
  mgr.register_method("calibration", "ttcGenToggle", rpc_ttc_gen_toggle);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn dac_range_points() {
    let range = DacRange::new(10, 12, 1).unwrap();
    assert_eq!(range.points(), 3);
    assert_eq!(range.values().collect::<Vec<u32>>(), vec![10, 11, 12]);
    let range = DacRange::new(0, 10, 3).unwrap();
    assert_eq!(range.points(), 4);
    assert_eq!(range.values().last(), Some(9));
    assert_eq!(range.point_index(9), 3);
    assert!(DacRange::new(0, 10, 0).is_err());
    assert!(DacRange::new(11, 10, 1).is_err());
  }

  #[test]
  fn dac_range_too_wide() {
    assert!(DacRange::new(0, u32::MAX, 1).is_err());
    assert!(DacRange::new(0, MAX_SCAN_POINTS, 1).is_err());
    let range = DacRange::new(0, MAX_SCAN_POINTS - 1, 1).unwrap();
    assert_eq!(range.points(), MAX_SCAN_POINTS as usize);
    let range = DacRange::new(0, u32::MAX, 1 << 24).unwrap();
    assert_eq!(range.points(), 256);
    assert_eq!(range.values().count(), 256);
  }

  #[test]
  fn scan_register_names() {
    assert!(check_scan_register("CFG_THR_ARM_DAC").is_ok());
    assert!(check_scan_register("").is_err());
    assert!(check_scan_register("CFG_RUN.X").is_err());
    assert!(check_scan_register("CFG RUN").is_err());
  }
}
