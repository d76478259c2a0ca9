//! AMC DAQ link control, the "daq" RPC module

use std::fmt;

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

const DAQ_CONTROL     : &str = "GEM_AMC.DAQ.CONTROL";
const DAQ_STATUS      : &str = "GEM_AMC.DAQ.STATUS";
const DAQ_EXT_CONTROL : &str = "GEM_AMC.DAQ.EXT_CONTROL";
const DAQ_EXT_STATUS  : &str = "GEM_AMC.DAQ.EXT_STATUS";

/// Default number of clock cycles to wait after the
/// last L1A before closing the input
pub const DEFAULT_INPUT_TIMEOUT : u32 = 0x100;
/// Default timeout for the data available signal
pub const DEFAULT_DAV_TIMEOUT   : u32 = 0x500;

/// Enable the DAQ link for the inputs in enable_mask
pub fn enable_daq_link(la : &mut AccessContext, enable_mask : u32) -> Result<(), ModuleError> {
  debug!("Enabling DAQ link, input mask {:#x}", enable_mask);
  la.write_reg(&format!("{}.INPUT_ENABLE_MASK", DAQ_CONTROL), enable_mask)?;
  la.write_reg(&format!("{}.DAQ_ENABLE", DAQ_CONTROL), 0x1)?;
  Ok(())
}

pub fn disable_daq_link(la : &mut AccessContext) -> Result<(), ModuleError> {
  la.write_reg(&format!("{}.INPUT_ENABLE_MASK", DAQ_CONTROL), 0x0)?;
  la.write_reg(&format!("{}.DAQ_ENABLE", DAQ_CONTROL), 0x0)?;
  Ok(())
}

pub fn set_zs(la : &mut AccessContext, enable : bool) -> Result<(), ModuleError> {
  la.write_reg(&format!("{}.ZERO_SUPPRESSION_EN", DAQ_CONTROL), enable as u32)?;
  Ok(())
}

pub fn disable_zs(la : &mut AccessContext) -> Result<(), ModuleError> {
  set_zs(la, false)
}

pub fn set_daq_link_input_timeout(la : &mut AccessContext, input_to : u32) -> Result<(), ModuleError> {
  la.write_reg(&format!("{}.INPUT_TIMEOUT", DAQ_EXT_CONTROL), input_to)?;
  Ok(())
}

/// Reset the DAQ link and bring it back into a
/// disabled state with the given timeouts
pub fn reset_daq_link(la : &mut AccessContext, dav_to : u32, tts_override : u32) -> Result<(), ModuleError> {
  debug!("Resetting DAQ link, DAV timeout {:#x}", dav_to);
  la.write_reg(&format!("{}.RESET", DAQ_CONTROL), 0x1)?;
  la.write_reg(&format!("{}.RESET", DAQ_CONTROL), 0x0)?;
  disable_daq_link(la)?;
  la.write_reg(&format!("{}.DAV_TIMEOUT", DAQ_CONTROL), dav_to)?;
  let tts_reg = format!("{}.TTS_OVERRIDE", DAQ_CONTROL);
  if la.exists(&tts_reg) {
    la.write_reg(&tts_reg, tts_override)?;
  }
  set_daq_link_input_timeout(la, DEFAULT_INPUT_TIMEOUT)
}

pub fn set_daq_link_run_type(la : &mut AccessContext, run_type : u32) -> Result<(), ModuleError> {
  la.write_reg(&format!("{}.RUN_TYPE", DAQ_EXT_CONTROL), run_type)?;
  Ok(())
}

/// Set one of the three run parameters
pub fn set_daq_link_run_parameter(la : &mut AccessContext, par_n : u8, value : u8) -> Result<(), ModuleError> {
  if !(1..=3).contains(&par_n) {
    return Err(ModuleError::InvalidParameter(
      format!("Attempting to set DAQ link run parameter {}: outside expectation (1-3)", par_n)));
  }
  la.write_reg(&format!("{}.RUN_PARAM{}", DAQ_EXT_CONTROL, par_n), value as u32)?;
  Ok(())
}

/// Set all run parameters at once
pub fn set_daq_link_run_parameters(la : &mut AccessContext, params : u32) -> Result<(), ModuleError> {
  la.write_reg(&format!("{}.RUN_PARAMS", DAQ_EXT_CONTROL), params)?;
  Ok(())
}

fn status_flag(la : &mut AccessContext, field : &str) -> Result<bool, ModuleError> {
  Ok(la.try_read_reg(&format!("{}.{}", DAQ_STATUS, field))? != 0)
}

/// Snapshot of the DAQ link state
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct DAQLinkStatus {
  pub link_ready         : bool,
  pub clock_locked       : bool,
  pub ttc_ready          : bool,
  pub tts_state          : u8,
  pub almost_full        : bool,
  pub l1a_fifo_empty     : bool,
  pub l1a_fifo_near_full : bool,
  pub l1a_fifo_full      : bool,
  pub l1a_fifo_underflow : bool,
  pub events_sent        : u32,
  pub l1a_id             : u32,
  pub input_mask         : u32,
  pub dav_timeout        : u32,
  pub max_dav_timer      : u32,
  pub last_dav_timer     : u32,
  pub input_timeout      : u32,
  pub run_type           : u32,
  pub run_params         : u32,
}

impl DAQLinkStatus {
  pub fn read(la : &mut AccessContext) -> Result<Self, ModuleError> {
    let link_ready         = status_flag(la, "DAQ_LINK_RDY")?;
    let clock_locked       = status_flag(la, "DAQ_CLK_LOCKED")?;
    let ttc_ready          = status_flag(la, "TTC_RDY")?;
    let almost_full        = status_flag(la, "DAQ_ALMOST_FULL")?;
    let l1a_fifo_empty     = status_flag(la, "L1A_FIFO_IS_EMPTY")?;
    let l1a_fifo_near_full = status_flag(la, "L1A_FIFO_IS_NEAR_FULL")?;
    let l1a_fifo_full      = status_flag(la, "L1A_FIFO_IS_FULL")?;
    let l1a_fifo_underflow = status_flag(la, "L1A_FIFO_IS_UNDERFLOW")?;
    Ok(Self {
      link_ready,
      clock_locked,
      ttc_ready,
      tts_state      : (la.try_read_reg(&format!("{}.TTS_STATE", DAQ_STATUS))? & 0xf) as u8,
      almost_full,
      l1a_fifo_empty,
      l1a_fifo_near_full,
      l1a_fifo_full,
      l1a_fifo_underflow,
      events_sent    : la.try_read_reg(&format!("{}.EVT_SENT", DAQ_EXT_STATUS))?,
      l1a_id         : la.try_read_reg(&format!("{}.L1AID", DAQ_EXT_STATUS))?,
      input_mask     : la.try_read_reg(&format!("{}.INPUT_ENABLE_MASK", DAQ_CONTROL))?,
      dav_timeout    : la.try_read_reg(&format!("{}.DAV_TIMEOUT", DAQ_CONTROL))?,
      max_dav_timer  : la.try_read_reg(&format!("{}.MAX_DAV_TIMER", DAQ_EXT_STATUS))?,
      last_dav_timer : la.try_read_reg(&format!("{}.LAST_DAV_TIMER", DAQ_EXT_STATUS))?,
      input_timeout  : la.try_read_reg(&format!("{}.INPUT_TIMEOUT", DAQ_EXT_CONTROL))?,
      run_type       : la.try_read_reg(&format!("{}.RUN_TYPE", DAQ_EXT_CONTROL))?,
      run_params     : la.try_read_reg(&format!("{}.RUN_PARAMS", DAQ_EXT_CONTROL))?,
    })
  }

  pub fn set_response(&self, response : &mut RpcMessage) {
    response.set_word("daqLinkReady",      self.link_ready as u32);
    response.set_word("daqClockLocked",    self.clock_locked as u32);
    response.set_word("daqTTCReady",       self.ttc_ready as u32);
    response.set_word("daqTTSState",       self.tts_state as u32);
    response.set_word("daqAlmostFull",     self.almost_full as u32);
    response.set_word("l1aFIFOIsEmpty",    self.l1a_fifo_empty as u32);
    response.set_word("l1aFIFOIsAlmostFull", self.l1a_fifo_near_full as u32);
    response.set_word("l1aFIFOIsFull",     self.l1a_fifo_full as u32);
    response.set_word("l1aFIFOIsUnderflow", self.l1a_fifo_underflow as u32);
    response.set_word("eventsSent",        self.events_sent);
    response.set_word("l1aID",             self.l1a_id);
    response.set_word("inputMask",         self.input_mask);
    response.set_word("davTimeout",        self.dav_timeout);
    response.set_word("maxDAVTimer",       self.max_dav_timer);
    response.set_word("lastDAVTimer",      self.last_dav_timer);
    response.set_word("inputTimeout",      self.input_timeout);
    response.set_word("runType",           self.run_type);
    response.set_word("runParams",         self.run_params);
  }
}

impl fmt::Display for DAQLinkStatus {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = String::from("<DAQLinkStatus:");
    repr += &(format!("\n  link ready     : {}", self.link_ready));
    repr += &(format!("\n  clock locked   : {}", self.clock_locked));
    repr += &(format!("\n  TTC ready      : {}", self.ttc_ready));
    repr += &(format!("\n  TTS state      : {:#x}", self.tts_state));
    repr += &(format!("\n  almost full    : {}", self.almost_full));
    repr += &(format!("\n  L1A FIFO [empty|near full|full|underflow] : {} {} {} {}",
                      self.l1a_fifo_empty, self.l1a_fifo_near_full, self.l1a_fifo_full, self.l1a_fifo_underflow));
    repr += &(format!("\n  events sent    : {}", self.events_sent));
    repr += &(format!("\n  L1A ID         : {}", self.l1a_id));
    repr += &(format!("\n  input mask     : {:#x}", self.input_mask));
    repr += &(format!("\n  DAV timeout    : {:#x} (max {} last {})", self.dav_timeout, self.max_dav_timer, self.last_dav_timer));
    repr += &(format!("\n  input timeout  : {:#x}", self.input_timeout));
    repr += &(format!("\n  run type       : {:#x} params {:#x}>", self.run_type, self.run_params));
    write!(f, "{}", repr)
  }
}

fn rpc_enable_daq_link(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let enable_mask = request.get_word("enableMask")?;
    let mut la      = env.context(response)?;
    enable_daq_link(&mut la, enable_mask)
  });
}

fn rpc_disable_daq_link(env : &ModuleEnv, _request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let mut la = env.context(response)?;
    disable_daq_link(&mut la)
  });
}

fn rpc_set_zs(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let enable = request.get_flag("enable")?;
    let mut la = env.context(response)?;
    set_zs(&mut la, enable)
  });
}

fn rpc_disable_zs(env : &ModuleEnv, _request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let mut la = env.context(response)?;
    disable_zs(&mut la)
  });
}

fn rpc_reset_daq_link(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let dav_to       = request.get_word_or("davTO", DEFAULT_DAV_TIMEOUT)?;
    let tts_override = request.get_word_or("ttsOverride", 0x0)?;
    let mut la       = env.context(response)?;
    reset_daq_link(&mut la, dav_to, tts_override)
  });
}

fn rpc_set_daq_link_input_timeout(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let input_to = request.get_word_or("inputTO", DEFAULT_INPUT_TIMEOUT)?;
    let mut la   = env.context(response)?;
    set_daq_link_input_timeout(&mut la, input_to)
  });
}

fn rpc_set_daq_link_run_type(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let run_type = request.get_word("rtype")?;
    let mut la   = env.context(response)?;
    set_daq_link_run_type(&mut la, run_type)
  });
}

fn rpc_set_daq_link_run_parameter(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let par_n = request.get_word("parN")?;
    let value = request.get_word("rparam")?;
    let par_n = u8::try_from(par_n).unwrap_or(u8::MAX);
    let value = u8::try_from(value)
      .map_err(|_| ModuleError::InvalidParameter(format!("Run parameter value {} does not fit into 8 bits", value)))?;
    let mut la = env.context(response)?;
    set_daq_link_run_parameter(&mut la, par_n, value)
  });
}

fn rpc_set_daq_link_run_parameters(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let params = request.get_word("rparams")?;
    let mut la = env.context(response)?;
    set_daq_link_run_parameters(&mut la, params)
  });
}

fn rpc_get_daq_link_status(env : &ModuleEnv, _request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let mut la = env.context(response)?;
    let status = DAQLinkStatus::read(&mut la)?;
    debug!("{}", status);
    status.set_response(la.response);
    Ok(())
  });
}

pub fn module_init(mgr : &mut ModuleManager<ModuleEnv>) {
  mgr.register_method("daq", "enableDAQLink", rpc_enable_daq_link);
  mgr.register_method("daq", "disableDAQLink", rpc_disable_daq_link);
  mgr.register_method("daq", "setZS", rpc_set_zs);
  mgr.register_method("daq", "disableZS", rpc_disable_zs);
  mgr.register_method("daq", "resetDAQLink", rpc_reset_daq_link);
  mgr.register_method("daq", "setDAQLinkInputTimeout", rpc_set_daq_link_input_timeout);
  mgr.register_method("daq", "setDAQLinkRunType", rpc_set_daq_link_run_type);
  mgr.register_method("daq", "setDAQLinkRunParameter", rpc_set_daq_link_run_parameter);
  mgr.register_method("daq", "setDAQLinkRunParameters", rpc_set_daq_link_run_parameters);
  mgr.register_method("daq", "getDAQLinkStatus", rpc_get_daq_link_status);
}
