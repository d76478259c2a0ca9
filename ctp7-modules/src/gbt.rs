//! GBTx configuration through the IC slow control path,
//! and the elink phase scan. The "gbt" RPC module.
//!
//! GBTx registers are 8 bit wide. Every VFAT is connected
//! to one elink of one of the three GBTx of an OptoHybrid,
//! the phase of an elink is triplicated over 3 registers.

use std::thread;
use std::time::Duration;

use ctp7_lib::{
    ModuleManager,
    RpcMessage,
};
use ctp7_lib::constants::{
    GBTS_PER_OH,
    GBT_CONFIG_SIZE,
    GBT_PHASE_MAX,
    GBT_PHASE_MIN,
    VFATS_PER_OH,
};

use crate::access::AccessContext;
use crate::errors::ModuleError;
use crate::registers::RegisterName;
use crate::service::{
    respond,
    ModuleEnv,
};
use crate::utils::{
    check_oh_index,
    repeated_reg_read,
};

const IC_BASE : &str = "GEM_AMC.SLOW_CONTROL.IC";
const LINK_RESET : &str = "GEM_AMC.GEM_SYSTEM.CTRL.LINK_RESET";

/// Number of distinct phase values of an elink
pub const N_PHASES : usize = 16;

/// GBTx (0-2) each VFAT is connected to
pub const VFAT_TO_GBT : [u32; 24] = [
  1, 1, 1, 1, 1, 1, 1, 0, 1, 2, 2, 2,
  0, 0, 0, 0, 1, 2, 2, 2, 2, 2, 2, 0
];

/// Elink of its GBTx each VFAT is connected to
pub const VFAT_TO_ELINK : [usize; 24] = [
  5, 9, 2, 3, 1, 8, 6, 6, 4, 1, 5, 4,
  3, 2, 1, 0, 7, 8, 6, 7, 2, 3, 9, 8
];

/// The 3 phase registers of each elink
pub const ELINK_TO_REGISTERS : [[u16; 3]; 10] = [
  [ 69,  73,  77],
  [ 67,  71,  75],
  [ 93,  97, 101],
  [ 91,  95,  99],
  [117, 121, 125],
  [115, 119, 123],
  [141, 145, 149],
  [139, 143, 147],
  [165, 169, 173],
  [163, 167, 171],
];

fn check_phase(phase : u8) -> Result<(), ModuleError> {
  if !(GBT_PHASE_MIN..=GBT_PHASE_MAX).contains(&phase) {
    return Err(ModuleError::InvalidParameter(
      format!("The phase parameter supplied ({}) is outside the range [{},{}].", phase, GBT_PHASE_MIN, GBT_PHASE_MAX)));
  }
  Ok(())
}

/// Write a single register of a GBTx
pub fn write_gbt_reg(la      : &mut AccessContext,
                     oh      : u32,
                     gbt     : u32,
                     address : u16,
                     value   : u8) -> Result<(), ModuleError> {
  if gbt >= GBTS_PER_OH {
    return Err(ModuleError::InvalidParameter(
      format!("The gbtN parameter supplied ({}) is larger than the number of GBT's per OH ({}).", gbt, GBTS_PER_OH)));
  }
  if address as u32 >= GBT_CONFIG_SIZE {
    return Err(ModuleError::InvalidParameter(
      format!("GBT has {} writable addresses while the provided address is {}.", GBT_CONFIG_SIZE - 1, address)));
  }
  la.write_reg(&format!("{}.READ_WRITE_LENGTH", IC_BASE), 1)?;
  la.write_reg(&format!("{}.GBTX_LINK_SELECT", IC_BASE), oh * GBTS_PER_OH + gbt)?;
  la.write_reg(&format!("{}.ADDRESS", IC_BASE), address as u32)?;
  la.write_reg(&format!("{}.WRITE_DATA", IC_BASE), value as u32)?;
  la.write_reg(&format!("{}.EXECUTE_WRITE", IC_BASE), 1)?;
  Ok(())
}

/// Write the full configuration of a GBTx, register
/// by register
pub fn write_gbt_config(la : &mut AccessContext, oh : u32, gbt : u32, config : &[u8]) -> Result<(), ModuleError> {
  info!("Writing the configuration of OH #{} - GBTX #{}.", oh, gbt);
  check_oh_index(la, oh)?;
  if gbt >= GBTS_PER_OH {
    return Err(ModuleError::InvalidParameter(
      format!("The gbtN parameter supplied ({}) exceeds the number of GBT's per OH ({}).", gbt, GBTS_PER_OH)));
  }
  if config.len() != GBT_CONFIG_SIZE as usize {
    return Err(ModuleError::InvalidParameter(
      format!("The provided configuration has not the correct size. It is {} bytes long while it should be {} bytes long.",
              config.len(), GBT_CONFIG_SIZE)));
  }
  for (address, value) in config.iter().enumerate() {
    write_gbt_reg(la, oh, gbt, address as u16, *value)?;
  }
  Ok(())
}

/// Write the phase of the elink of a VFAT
pub fn write_gbt_phase(la : &mut AccessContext, oh : u32, vfat : u32, phase : u8) -> Result<(), ModuleError> {
  check_oh_index(la, oh)?;
  if vfat >= VFATS_PER_OH {
    return Err(ModuleError::InvalidParameter(
      format!("The vfatN parameter supplied ({}) exceeds the number of VFAT's per OH ({}).", vfat, VFATS_PER_OH)));
  }
  check_phase(phase)?;
  let gbt = VFAT_TO_GBT[vfat as usize];
  debug!("Writing {} to the VFAT #{} phase of GBT #{}, on OH #{}.", phase, vfat, gbt, oh);
  for address in ELINK_TO_REGISTERS[VFAT_TO_ELINK[vfat as usize]] {
    write_gbt_reg(la, oh, gbt, address, phase)?;
  }
  Ok(())
}

/// Parameters of a GBT phase scan
#[derive(Debug, Copy, Clone)]
pub struct PhaseScanConfig {
  pub n_resets     : u32,
  pub phase_min    : u8,
  pub phase_max    : u8,
  pub phase_step   : u8,
  pub n_ver_reads  : u32,
}

/// Scan all elink phases of an OptoHybrid.
///
/// For every phase the links are reset n_resets times.
/// A VFAT counts as good for a reset if it is synchronized
/// and reading CFG_RUN, HW_ID_VER and HW_ID n_ver_reads
/// times each gives no slow control error.
///
/// # Returns
///
/// The good counts, indexed by vfat * N_PHASES + phase.
/// Picking the best phase is up to the caller.
pub fn scan_gbt_phases(la : &mut AccessContext, oh : u32, config : &PhaseScanConfig) -> Result<Vec<u32>, ModuleError> {
  info!("Scanning the phases for OH #{}.", oh);
  check_oh_index(la, oh)?;
  check_phase(config.phase_min)?;
  check_phase(config.phase_max)?;
  if config.phase_step == 0 {
    return Err(ModuleError::InvalidParameter(String::from("The phase step must not be 0")));
  }
  let mut results = vec![0u32; VFATS_PER_OH as usize * N_PHASES];
  let mut phase   = config.phase_min;
  while phase <= config.phase_max {
    for vfat in 0..VFATS_PER_OH {
      write_gbt_phase(la, oh, vfat, phase)?;
    }
    thread::sleep(Duration::from_millis(10));
    for _ in 0..config.n_resets {
      la.write_reg(LINK_RESET, 1)?;
      thread::sleep(Duration::from_millis(10));
      for vfat in 0..VFATS_PER_OH {
        if la.try_read_reg(RegisterName::vfat_link(oh, vfat, "SYNC_ERR_CNT").as_str())? != 0 {
          continue;
        }
        let mut good = true;
        for field in ["CFG_RUN", "HW_ID_VER", "HW_ID"] {
          let errs = repeated_reg_read(la, RegisterName::vfat(oh, vfat, field).as_str(), true, config.n_ver_reads)?;
          if errs.sum != 0 {
            good = false;
            break;
          }
        }
        if good {
          results[vfat as usize * N_PHASES + phase as usize] += 1;
        }
      }
    }
    phase = match phase.checked_add(config.phase_step) {
      Some(next) => next,
      None       => break
    };
  }
  Ok(results)
}

fn request_u8(request : &RpcMessage, key : &str) -> Result<u8, ModuleError> {
  let word = request.get_word(key)?;
  u8::try_from(word).map_err(|_| ModuleError::InvalidParameter(format!("{} = {} does not fit into 8 bits", key, word)))
}

fn rpc_write_gbt_config(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh     = request.get_word("ohN")?;
    let gbt    = request.get_word("gbtN")?;
    let config = request.get_binarydata("config")?;
    let mut la = env.context(response)?;
    write_gbt_config(&mut la, oh, gbt, &config)
  });
}

fn rpc_write_gbt_phase(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh     = request.get_word("ohN")?;
    let vfat   = request.get_word("vfatN")?;
    let phase  = request_u8(request, "phase")?;
    let mut la = env.context(response)?;
    write_gbt_phase(&mut la, oh, vfat, phase)
  });
}

fn rpc_write_gbt_reg(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh      = request.get_word("ohN")?;
    let gbt     = request.get_word("gbtN")?;
    let address = request.get_word("address")?;
    let value   = request_u8(request, "value")?;
    let address = u16::try_from(address)
      .map_err(|_| ModuleError::InvalidParameter(format!("GBT address {} is out of range", address)))?;
    let mut la  = env.context(response)?;
    check_oh_index(&mut la, oh)?;
    write_gbt_reg(&mut la, oh, gbt, address, value)
  });
}

fn rpc_scan_gbt_phases(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh     = request.get_word("ohN")?;
    let config = PhaseScanConfig {
      n_resets    : request.get_word("nResets")?,
      phase_min   : request_u8(request, "phaseMin")?,
      phase_max   : request_u8(request, "phaseMax")?,
      phase_step  : request_u8(request, "phaseStep")?,
      n_ver_reads : request.get_word_or("nVerificationReads", env.settings.verification_reads)?,
    };
    let mut la  = env.context(response)?;
    let results = scan_gbt_phases(&mut la, oh, &config)?;
    for vfat in 0..VFATS_PER_OH as usize {
      la.response.set_word_array(&format!("OH{}.VFAT{}", oh, vfat),
                                 &results[vfat * N_PHASES..(vfat + 1) * N_PHASES]);
    }
    la.response.set_word_array("results", &results);
    Ok(())
  });
}

pub fn module_init(mgr : &mut ModuleManager<ModuleEnv>) {
  mgr.register_method("gbt", "writeGBTReg", rpc_write_gbt_reg);
  mgr.register_method("gbt", "writeGBTConfig", rpc_write_gbt_config);
  mgr.register_method("gbt", "writeGBTPhase", rpc_write_gbt_phase);
  mgr.register_method("gbt", "scanGBTPhases", rpc_scan_gbt_phases);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn elink_tables() {
    for vfat in 0..24 {
      assert!(VFAT_TO_GBT[vfat] < GBTS_PER_OH);
      for address in ELINK_TO_REGISTERS[VFAT_TO_ELINK[vfat]] {
        assert!((address as u32) < GBT_CONFIG_SIZE);
      }
    }
    // VFAT 0 sits on elink 5 of GBT 1
    assert_eq!(ELINK_TO_REGISTERS[VFAT_TO_ELINK[0]], [115, 119, 123]);
  }

  #[test]
  fn phase_range() {
    assert!(check_phase(0).is_ok());
    assert!(check_phase(15).is_ok());
    assert!(check_phase(16).is_err());
  }
}
