//! The generic DAC scan
//!
//! A VFAT register is swept while the AMC DAQ monitor
//! counts how often the selected channel (or any channel)
//! fired for nevts triggers. The results of a scan over
//! L unmasked VFATs and N scan points are L * N counters,
//! the counter of the i-th unmasked VFAT at scan point k
//! sits at i * N + k.

use ctp7_lib::constants::CHANNELS_PER_VFAT;

use crate::access::AccessContext;
use crate::calibration::{
    check_channel,
    check_scan_register,
    run_restoring,
    DacRange,
    ALL_CHANNELS,
};
use crate::calibration::ttc_generator::{
    ttc_gen_conf_v3,
    T1Mode,
    T1Type,
    TtcGenConfig,
    TTC_GENERATOR,
};
use crate::errors::ModuleError;
use crate::masks::DisabledLaneSet;
use crate::optohybrid::{
    configure_scan_module,
    get_single_scan_results,
    get_ultra_scan_results,
    start_scan_module,
    ScanMode,
    ScanModuleConfig,
    ScanTarget,
};
use crate::registers::RegisterName;
use crate::ttc::{
    ttc_counter_reset,
    TtcCommand,
};
use crate::utils::{
    check_oh_index,
    check_vfats_synchronized,
    fw_version_check,
    FirmwareVersion,
};
use crate::vfat3::{
    conf_cal_pulse,
    dac_mon_conf,
    save_cal_pulse,
    set_single_chan_mask,
    DAQ_MONITOR,
};

/// BX between two generated L1As
pub const DEFAULT_L1A_INTERVAL : u32 = 250;
/// BX between CalPulse and L1A
pub const DEFAULT_PULSE_DELAY  : u32 = 40;

#[derive(Debug, Clone, PartialEq)]
pub struct GenScanConfig {
  pub mask             : DisabledLaneSet,
  /// ALL_CHANNELS for the OR of all channels
  pub channel          : u32,
  pub use_cal_pulse    : bool,
  pub current_pulse    : bool,
  pub cal_scale_factor : u32,
  /// Triggers per scan point
  pub nevts            : u32,
  pub range            : DacRange,
  /// Field of the VFAT to sweep, e.g. CFG_THR_ARM_DAC
  pub scan_reg         : String,
  /// v2b only: scan all VFATs at once
  pub use_ultra        : bool,
  /// Count backplane L1As instead of generating triggers
  pub use_ext_trig     : bool,
  pub l1a_interval     : u32,
  pub pulse_delay      : u32,
}

/// The v2b scan controller knows the register to scan
/// from its mode
fn v2b_scan_mode(config : &GenScanConfig) -> ScanMode {
  if config.scan_reg.to_lowercase().contains("latency") {
    ScanMode::Latency
  } else if config.use_cal_pulse {
    ScanMode::SCurve
  } else if config.channel != ALL_CHANNELS {
    ScanMode::ThresholdPerChannel
  } else {
    ScanMode::Threshold
  }
}

fn monitor_ctrl(field : &str) -> String {
  format!("{}.CTRL.{}", DAQ_MONITOR, field)
}

/// Count the hits of a single scan point
fn take_point(la : &mut AccessContext, config : &GenScanConfig) -> Result<(), ModuleError> {
  la.write_reg(&monitor_ctrl("RESET"), 0x1)?;
  if config.use_ext_trig {
    ttc_counter_reset(la)?;
    la.write_reg(&monitor_ctrl("ENABLE"), 0x1)?;
    let nevts = config.nevts;
    la.poll_reg(&format!("GEM_AMC.TTC.CMD_COUNTERS.{}", TtcCommand::L1A.counter_name()), |n| n >= nevts)?;
  } else {
    la.write_reg(&monitor_ctrl("ENABLE"), 0x1)?;
    la.write_reg(&format!("{}.CYCLIC_START", TTC_GENERATOR), 0x1)?;
    la.poll_reg(&format!("{}.CYCLIC_RUNNING", TTC_GENERATOR), |running| running == 0)?;
  }
  la.write_reg(&monitor_ctrl("ENABLE"), 0x0)?;
  Ok(())
}

fn gen_scan_v3(la : &mut AccessContext, oh : u32, config : &GenScanConfig, lanes : &[u32]) -> Result<Vec<u32>, ModuleError> {
  check_vfats_synchronized(la, oh, config.mask)?;
  run_restoring(la, |la, saved| {
    dac_mon_conf(la, saved, oh, config.channel)?;
    for vfat in lanes {
      saved.save(la, RegisterName::vfat(oh, *vfat, &config.scan_reg).as_str())?;
      if config.channel != ALL_CHANNELS {
        set_single_chan_mask(la, saved, oh, *vfat, config.channel)?;
      }
    }
    if config.use_cal_pulse {
      save_cal_pulse(la, saved, oh, config.mask, config.channel)?;
      conf_cal_pulse(la, oh, config.mask, config.channel, true, config.current_pulse, config.cal_scale_factor)?;
    }
    if !config.use_ext_trig {
      for field in ["ENABLE", "CYCLIC_L1A_GAP", "CYCLIC_CALPULSE_TO_L1A_GAP", "CYCLIC_L1A_COUNT"] {
        saved.save(la, &format!("{}.{}", TTC_GENERATOR, field))?;
      }
      let mode = if config.use_cal_pulse { T1Mode::CalPulseL1A } else { T1Mode::Single };
      ttc_gen_conf_v3(la, &TtcGenConfig {
        mode,
        t1_type      : T1Type::L1A,
        pulse_delay  : config.pulse_delay,
        l1a_interval : config.l1a_interval,
        n_pulses     : config.nevts,
        enable       : true,
      })?;
    }
    let points   = config.range.points();
    let mut data = vec![0u32; lanes.len() * points];
    for dac in config.range.values() {
      let k = config.range.point_index(dac);
      for vfat in lanes {
        la.write_reg(RegisterName::vfat(oh, *vfat, &config.scan_reg).as_str(), dac)?;
      }
      take_point(la, config)?;
      for (pos, vfat) in lanes.iter().enumerate() {
        data[pos * points + k] = la.try_read_reg(&format!("{}.VFAT{}.CHANNEL_FIRE_COUNT", DAQ_MONITOR, vfat))?;
      }
      trace!("{} = {} done", config.scan_reg, dac);
    }
    Ok(data)
  })
}

fn gen_scan_v2b(la : &mut AccessContext, oh : u32, config : &GenScanConfig, lanes : &[u32]) -> Result<Vec<u32>, ModuleError> {
  let points   = config.range.points();
  let mut data = vec![0u32; lanes.len() * points];
  let mut scan = ScanModuleConfig {
    mode    : v2b_scan_mode(config),
    target  : ScanTarget::Ultra(config.mask),
    channel : if config.channel == ALL_CHANNELS { 0 } else { config.channel },
    nevts   : config.nevts,
    range   : config.range,
  };
  if config.use_ultra {
    configure_scan_module(la, oh, &scan)?;
    start_scan_module(la, oh, true)?;
    let ultra = get_ultra_scan_results(la, oh, &config.range)?;
    for (pos, vfat) in lanes.iter().enumerate() {
      let from = *vfat as usize * points;
      data[pos * points..(pos + 1) * points].copy_from_slice(&ultra[from..from + points]);
    }
  } else {
    for (pos, vfat) in lanes.iter().enumerate() {
      scan.target = ScanTarget::Single(*vfat);
      configure_scan_module(la, oh, &scan)?;
      start_scan_module(la, oh, false)?;
      let single = get_single_scan_results(la, oh, &config.range)?;
      data[pos * points..(pos + 1) * points].copy_from_slice(&single);
    }
  }
  Ok(data)
}

/// Sweep config.scan_reg over config.range for all
/// unmasked VFATs of an OptoHybrid
pub fn gen_scan(la : &mut AccessContext, oh : u32, config : &GenScanConfig) -> Result<Vec<u32>, ModuleError> {
  check_oh_index(la, oh)?;
  check_scan_register(&config.scan_reg)?;
  check_channel(config.channel)?;
  if config.nevts == 0 {
    return Err(ModuleError::InvalidParameter(String::from("nevts must not be 0")));
  }
  if config.use_cal_pulse && config.channel == ALL_CHANNELS {
    return Err(ModuleError::InvalidParameter(String::from("The calibration pulse needs a single channel")));
  }
  let lanes = config.mask.enabled_lanes();
  if lanes.is_empty() {
    return Err(ModuleError::InvalidParameter(format!("All VFATs are masked by {}", config.mask)));
  }
  info!("Scanning {} of OH {} over {} for {} VFATs", config.scan_reg, oh, config.range, lanes.len());
  match fw_version_check(la, "genScan")? {
    FirmwareVersion::V3  => gen_scan_v3(la, oh, config, &lanes),
    FirmwareVersion::V2b => gen_scan_v2b(la, oh, config, &lanes),
  }
}

/// gen_scan for every channel in turn. The scan of
/// channel ch starts at ch * L * N.
pub fn gen_channel_scan(la : &mut AccessContext, oh : u32, config : &GenScanConfig) -> Result<Vec<u32>, ModuleError> {
  let mut data = Vec::<u32>::new();
  let mut per_channel = config.clone();
  for ch in 0..CHANNELS_PER_VFAT {
    per_channel.channel = ch;
    data.extend(gen_scan(la, oh, &per_channel)?);
  }
  Ok(data)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config(scan_reg : &str) -> GenScanConfig {
    GenScanConfig {
      mask             : DisabledLaneSet::vfats(0),
      channel          : ALL_CHANNELS,
      use_cal_pulse    : false,
      current_pulse    : false,
      cal_scale_factor : 3,
      nevts            : 100,
      range            : DacRange::new(0, 10, 1).unwrap(),
      scan_reg         : String::from(scan_reg),
      use_ultra        : true,
      use_ext_trig     : false,
      l1a_interval     : DEFAULT_L1A_INTERVAL,
      pulse_delay      : DEFAULT_PULSE_DELAY,
    }
  }

  #[test]
  fn v2b_modes() {
    assert_eq!(v2b_scan_mode(&config("Latency")), ScanMode::Latency);
    assert_eq!(v2b_scan_mode(&config("VThreshold1")), ScanMode::Threshold);
    let mut scurve = config("VCal");
    scurve.use_cal_pulse = true;
    scurve.channel       = 5;
    assert_eq!(v2b_scan_mode(&scurve), ScanMode::SCurve);
    scurve.use_cal_pulse = false;
    assert_eq!(v2b_scan_mode(&scurve), ScanMode::ThresholdPerChannel);
  }
}
