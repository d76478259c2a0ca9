//! AMC TTC control and counters, the "ttc" RPC module

use std::fmt;
use std::thread;
use std::time::Duration;

use ctp7_lib::{
    ModuleManager,
    RpcMessage,
};

use crate::access::AccessContext;
use crate::errors::ModuleError;
use crate::service::{
    respond,
    ModuleEnv,
};

const TTC_CTRL   : &str = "GEM_AMC.TTC.CTRL";
const TTC_CLK    : &str = "GEM_AMC.TTC.STATUS.CLK";
const TTC_CMDS   : &str = "GEM_AMC.TTC.CMD_COUNTERS";

/// Number of PLL lock reads if the caller does not ask for any
pub const PLL_LOCK_READ_ATTEMPTS : u32 = 10;

/// TTC commands with a firmware counter
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum TtcCommand {
  L1A       = 0x1,
  BC0       = 0x2,
  EC0       = 0x3,
  Resync    = 0x4,
  OC0       = 0x5,
  HardReset = 0x6,
  CalPulse  = 0x7,
  Start     = 0x8,
  Stop      = 0x9,
  TestSync  = 0xa,
}

impl TtcCommand {
  pub const ALL : [TtcCommand; 10] = [
    TtcCommand::L1A,
    TtcCommand::BC0,
    TtcCommand::EC0,
    TtcCommand::Resync,
    TtcCommand::OC0,
    TtcCommand::HardReset,
    TtcCommand::CalPulse,
    TtcCommand::Start,
    TtcCommand::Stop,
    TtcCommand::TestSync,
  ];

  /// Name of the counter register
  pub fn counter_name(&self) -> &'static str {
    match self {
      TtcCommand::L1A       => "L1A",
      TtcCommand::BC0       => "BC0",
      TtcCommand::EC0       => "EC0",
      TtcCommand::Resync    => "RESYNC",
      TtcCommand::OC0       => "OC0",
      TtcCommand::HardReset => "HARD_RESET",
      TtcCommand::CalPulse  => "CALPULSE",
      TtcCommand::Start     => "START",
      TtcCommand::Stop      => "STOP",
      TtcCommand::TestSync  => "TEST_SYNC",
    }
  }
}

impl TryFrom<u8> for TtcCommand {
  type Error = ModuleError;

  fn try_from(value : u8) -> Result<Self, Self::Error> {
    TtcCommand::ALL.iter()
      .find(|cmd| **cmd as u8 == value)
      .copied()
      .ok_or(ModuleError::InvalidParameter(format!("Unknown TTC command {:#x}", value)))
  }
}

impl fmt::Display for TtcCommand {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<TtcCommand: {}>", self.counter_name())
  }
}

pub fn ttc_mmcm_reset(la : &mut AccessContext) -> Result<(), ModuleError> {
  la.write_reg(&format!("{}.MMCM_RESET", TTC_CTRL), 0x1)?;
  Ok(())
}

pub fn ttc_counter_reset(la : &mut AccessContext) -> Result<(), ModuleError> {
  la.write_reg(&format!("{}.CNT_RESET", TTC_CTRL), 0x1)?;
  Ok(())
}

pub fn get_l1a_enable(la : &mut AccessContext) -> Result<bool, ModuleError> {
  Ok(la.try_read_reg(&format!("{}.L1A_ENABLE", TTC_CTRL))? != 0)
}

pub fn set_l1a_enable(la : &mut AccessContext, enable : bool) -> Result<(), ModuleError> {
  la.write_reg(&format!("{}.L1A_ENABLE", TTC_CTRL), enable as u32)?;
  Ok(())
}

/// Reset the PLL read_attempts times and count how
/// often it came back locked
pub fn check_pll_lock(la : &mut AccessContext, read_attempts : u32) -> Result<u32, ModuleError> {
  let mut lock_cnt = 0u32;
  for _ in 0..read_attempts {
    la.write_reg(&format!("{}.PA_MANUAL_PLL_RESET", TTC_CTRL), 0x1)?;
    thread::sleep(Duration::from_micros(100));
    if la.try_read_reg(&format!("{}.PHASE_LOCKED", TTC_CLK))? != 0 {
      lock_cnt += 1;
    }
  }
  Ok(lock_cnt)
}

/// 0 attempts gives the firmware mean, otherwise the
/// instantaneous phase is averaged over the reads
fn phase_mean(la : &mut AccessContext, prefix : &str, read_attempts : u32) -> Result<f64, ModuleError> {
  if read_attempts == 0 {
    return Ok(la.try_read_reg(&format!("{}.{}_PM_PHASE_MEAN", TTC_CLK, prefix))? as f64);
  }
  let mut sum = 0.0f64;
  for _ in 0..read_attempts {
    sum += la.try_read_reg(&format!("{}.{}_PM_PHASE", TTC_CLK, prefix))? as f64;
  }
  Ok(sum / read_attempts as f64)
}

pub fn get_mmcm_phase_mean(la : &mut AccessContext, read_attempts : u32) -> Result<f64, ModuleError> {
  phase_mean(la, "TTC", read_attempts)
}

pub fn get_gth_phase_mean(la : &mut AccessContext, read_attempts : u32) -> Result<f64, ModuleError> {
  phase_mean(la, "GTH", read_attempts)
}

/// Single or double bit error count of the TTC decoder
pub fn get_ttc_error_count(la : &mut AccessContext, single : bool) -> Result<u32, ModuleError> {
  let reg = if single {
    "GEM_AMC.TTC.STATUS.TTC_SINGLE_ERROR_CNT"
  } else {
    "GEM_AMC.TTC.STATUS.TTC_DOUBLE_ERROR_CNT"
  };
  Ok(la.try_read_reg(reg)?)
}

pub fn get_ttc_counter(la : &mut AccessContext, cmd : TtcCommand) -> Result<u32, ModuleError> {
  Ok(la.try_read_reg(&format!("{}.{}", TTC_CMDS, cmd.counter_name()))?)
}

pub fn get_l1a_id(la : &mut AccessContext) -> Result<u32, ModuleError> {
  Ok(la.try_read_reg("GEM_AMC.TTC.L1A_ID")?)
}

pub fn get_l1a_rate(la : &mut AccessContext) -> Result<u32, ModuleError> {
  Ok(la.try_read_reg("GEM_AMC.TTC.L1A_RATE")?)
}

fn rpc_ttc_mmcm_reset(env : &ModuleEnv, _request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let mut la = env.context(response)?;
    ttc_mmcm_reset(&mut la)
  });
}

fn rpc_ttc_counter_reset(env : &ModuleEnv, _request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let mut la = env.context(response)?;
    ttc_counter_reset(&mut la)
  });
}

fn rpc_get_l1a_enable(env : &ModuleEnv, _request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let mut la  = env.context(response)?;
    let enabled = get_l1a_enable(&mut la)?;
    la.response.set_word("result", enabled as u32);
    Ok(())
  });
}

fn rpc_set_l1a_enable(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let enable = request.get_flag("enable")?;
    let mut la = env.context(response)?;
    set_l1a_enable(&mut la, enable)
  });
}

fn rpc_check_pll_lock(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let read_attempts = request.get_word_or("readAttempts", PLL_LOCK_READ_ATTEMPTS)?;
    let mut la        = env.context(response)?;
    let lock_cnt      = check_pll_lock(&mut la, read_attempts)?;
    la.response.set_word("result", lock_cnt);
    Ok(())
  });
}

fn rpc_get_mmcm_phase_mean(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let read_attempts = request.get_word_or("readAttempts", 0)?;
    let mut la        = env.context(response)?;
    let mean          = get_mmcm_phase_mean(&mut la, read_attempts)?;
    la.response.set_float("result", mean);
    Ok(())
  });
}

fn rpc_get_gth_phase_mean(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let read_attempts = request.get_word_or("readAttempts", 0)?;
    let mut la        = env.context(response)?;
    let mean          = get_gth_phase_mean(&mut la, read_attempts)?;
    la.response.set_float("result", mean);
    Ok(())
  });
}

fn rpc_get_ttc_error_count(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let single = request.get_flag("single")?;
    let mut la = env.context(response)?;
    let errors = get_ttc_error_count(&mut la, single)?;
    la.response.set_word("result", errors);
    Ok(())
  });
}

/// Without a command all counters are reported,
/// each under its own name
fn rpc_get_ttc_counter(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let cmd = if request.get_key_exists("cmd") {
      let word = request.get_word("cmd")?;
      Some(TtcCommand::try_from(u8::try_from(word).unwrap_or(u8::MAX))?)
    } else {
      None
    };
    let mut la = env.context(response)?;
    match cmd {
      Some(cmd) => {
        let count = get_ttc_counter(&mut la, cmd)?;
        la.response.set_word("result", count);
      }
      None => {
        for cmd in TtcCommand::ALL {
          let count = get_ttc_counter(&mut la, cmd)?;
          la.response.set_word(cmd.counter_name(), count);
        }
      }
    }
    Ok(())
  });
}

fn rpc_get_l1a_id(env : &ModuleEnv, _request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let mut la = env.context(response)?;
    let l1a_id = get_l1a_id(&mut la)?;
    la.response.set_word("result", l1a_id);
    Ok(())
  });
}

fn rpc_get_l1a_rate(env : &ModuleEnv, _request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let mut la = env.context(response)?;
    let rate   = get_l1a_rate(&mut la)?;
    la.response.set_word("result", rate);
    Ok(())
  });
}

pub fn module_init(mgr : &mut ModuleManager<ModuleEnv>) {
  mgr.register_method("ttc", "ttcMMCMReset", rpc_ttc_mmcm_reset);
  mgr.register_method("ttc", "ttcCounterReset", rpc_ttc_counter_reset);
  mgr.register_method("ttc", "getL1AEnable", rpc_get_l1a_enable);
  mgr.register_method("ttc", "setL1AEnable", rpc_set_l1a_enable);
  mgr.register_method("ttc", "checkPLLLock", rpc_check_pll_lock);
  mgr.register_method("ttc", "getMMCMPhaseMean", rpc_get_mmcm_phase_mean);
  mgr.register_method("ttc", "getGTHPhaseMean", rpc_get_gth_phase_mean);
  mgr.register_method("ttc", "getTTCErrorCount", rpc_get_ttc_error_count);
  mgr.register_method("ttc", "getTTCCounter", rpc_get_ttc_counter);
  mgr.register_method("ttc", "getL1AID", rpc_get_l1a_id);
  mgr.register_method("ttc", "getL1ARate", rpc_get_l1a_rate);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ttc_commands() {
    for cmd in TtcCommand::ALL {
      assert_eq!(TtcCommand::try_from(cmd as u8).unwrap(), cmd);
    }
    assert!(TtcCommand::try_from(0).is_err());
    assert!(TtcCommand::try_from(0xb).is_err());
    assert_eq!(TtcCommand::HardReset.counter_name(), "HARD_RESET");
  }
}
