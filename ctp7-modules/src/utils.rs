//! Register utilities shared by all modules, and
//! the "utils" RPC module
//!
//! * firmware version gate
//! * slow control error counters and repeated reads
//! * link synchronization masks
//! * address table update

use std::fmt;
use std::ops::{
    Add,
    AddAssign,
};

use ctp7_lib::{
    ModuleManager,
    RpcMessage,
};
use ctp7_lib::constants::{
    ALL_VFATS_BITS,
    OH_PER_AMC,
    VFATS_PER_OH,
};

use crate::access::AccessContext;
use crate::addrtable::parse_address_table;
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

pub const FW_MAJOR_REG : &str = "GEM_AMC.GEM_SYSTEM.RELEASE.MAJOR";
pub const NUM_OF_OH_REG : &str = "GEM_AMC.GEM_SYSTEM.CONFIG.NUM_OF_OH";
const SLOW_CONTROL_BASE : &str = "GEM_AMC.SLOW_CONTROL.VFAT3";

/// The two firmware generations with diverging
/// register semantics
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FirmwareVersion {
  /// VFAT3 based systems
  V3,
  /// VFAT2 based systems
  V2b,
}

impl fmt::Display for FirmwareVersion {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      FirmwareVersion::V3  => write!(f, "v3"),
      FirmwareVersion::V2b => write!(f, "v2b"),
    }
  }
}

/// Read the firmware major version.
///
/// # Arguments
///
/// * caller : name of the operation, for the error message
pub fn fw_version_check(la : &mut AccessContext, caller : &str) -> Result<FirmwareVersion, ModuleError> {
  let major = la.try_read_reg(FW_MAJOR_REG)?;
  match major {
    3 => Ok(FirmwareVersion::V3),
    1 => Ok(FirmwareVersion::V2b),
    _ => {
      let msg = format!("Unexpected value for system release major: {}, {} is not supported for this firmware", major, caller);
      error!("{}", msg);
      Err(ModuleError::VersionMismatch(msg))
    }
  }
}

/// Number of OptoHybrids the firmware was built for.
/// Without the register, all of them.
pub fn num_of_oh(la : &mut AccessContext) -> Result<u32, ModuleError> {
  if la.exists(NUM_OF_OH_REG) {
    Ok(la.try_read_reg(NUM_OF_OH_REG)?.min(OH_PER_AMC))
  } else {
    Ok(OH_PER_AMC)
  }
}

/// Refuse OptoHybrid indices the AMC does not have
pub fn check_oh_index(la : &mut AccessContext, oh : u32) -> Result<(), ModuleError> {
  let oh_max = num_of_oh(la)?;
  if oh >= oh_max {
    return Err(ModuleError::InvalidParameter(
      format!("The ohN parameter supplied ({}) exceeds the number of OH's supported by the CTP7 ({}).", oh, oh_max)));
  }
  Ok(())
}

/// Error counters of the VFAT3 slow control.
/// Adding two of them saturates.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SlowControlErrorCounters {
  pub crc               : u32,
  pub packet            : u32,
  pub bitstuffing       : u32,
  pub timeout           : u32,
  pub axi_strobe        : u32,
  pub sum               : u32,
  pub transaction_count : u32,
}

impl SlowControlErrorCounters {
  pub fn new() -> Self {
    Self::default()
  }

  /// Recompute the sum of all error counters
  pub fn sum_errors(&mut self) {
    self.sum = self.crc
      .saturating_add(self.packet)
      .saturating_add(self.bitstuffing)
      .saturating_add(self.timeout)
      .saturating_add(self.axi_strobe);
  }

  /// Read the current counters from the firmware
  pub fn read(la : &mut AccessContext) -> Result<Self, ModuleError> {
    let mut counters = Self {
      crc               : la.try_read_reg(&format!("{}.CRC_ERROR_CNT", SLOW_CONTROL_BASE))?,
      packet            : la.try_read_reg(&format!("{}.PACKET_ERROR_CNT", SLOW_CONTROL_BASE))?,
      bitstuffing       : la.try_read_reg(&format!("{}.BITSTUFFING_ERROR_CNT", SLOW_CONTROL_BASE))?,
      timeout           : la.try_read_reg(&format!("{}.TIMEOUT_ERROR_CNT", SLOW_CONTROL_BASE))?,
      axi_strobe        : la.try_read_reg(&format!("{}.AXI_STROBE_ERROR_CNT", SLOW_CONTROL_BASE))?,
      sum               : 0,
      transaction_count : la.try_read_reg(&format!("{}.TRANSACTION_CNT", SLOW_CONTROL_BASE))?,
    };
    counters.sum_errors();
    Ok(counters)
  }

  pub fn set_response(&self, response : &mut RpcMessage) {
    response.set_word("CRC_ERROR_CNT"        , self.crc);
    response.set_word("PACKET_ERROR_CNT"     , self.packet);
    response.set_word("BITSTUFFING_ERROR_CNT", self.bitstuffing);
    response.set_word("TIMEOUT_ERROR_CNT"    , self.timeout);
    response.set_word("AXI_STROBE_ERROR_CNT" , self.axi_strobe);
    response.set_word("SUM"                  , self.sum);
    response.set_word("nTransactions"        , self.transaction_count);
  }
}

impl Add for SlowControlErrorCounters {
  type Output = SlowControlErrorCounters;

  fn add(self, other : SlowControlErrorCounters) -> SlowControlErrorCounters {
    SlowControlErrorCounters {
      crc               : self.crc.saturating_add(other.crc),
      packet            : self.packet.saturating_add(other.packet),
      bitstuffing       : self.bitstuffing.saturating_add(other.bitstuffing),
      timeout           : self.timeout.saturating_add(other.timeout),
      axi_strobe        : self.axi_strobe.saturating_add(other.axi_strobe),
      sum               : self.sum.saturating_add(other.sum),
      transaction_count : self.transaction_count.saturating_add(other.transaction_count),
    }
  }
}

impl AddAssign for SlowControlErrorCounters {
  fn add_assign(&mut self, other : SlowControlErrorCounters) {
    *self = *self + other;
  }
}

impl fmt::Display for SlowControlErrorCounters {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = String::from("<SlowControlErrorCounters:");
    repr += &(format!("\n  crc          : {}", self.crc));
    repr += &(format!("\n  packet       : {}", self.packet));
    repr += &(format!("\n  bitstuffing  : {}", self.bitstuffing));
    repr += &(format!("\n  timeout      : {}", self.timeout));
    repr += &(format!("\n  axi strobe   : {}", self.axi_strobe));
    repr += &(format!("\n  sum          : {}", self.sum));
    repr += &(format!("\n  transactions : {}>", self.transaction_count));
    write!(f, "{}", repr)
  }
}

/// Read a register n_reads times and report the slow
/// control errors which occured meanwhile.
///
/// The firmware counters are reset before every read,
/// the counts of the single reads add up (saturating).
pub fn repeated_reg_read(la               : &mut AccessContext,
                         reg_name         : &str,
                         break_on_failure : bool,
                         n_reads          : u32) -> Result<SlowControlErrorCounters, ModuleError> {
  let mut total = SlowControlErrorCounters::new();
  for _ in 0..n_reads {
    la.write_reg(&format!("{}.CNT_RESET", SLOW_CONTROL_BASE), 0x1)?;
    if let Err(err) = la.try_read_reg(reg_name) {
      debug!("Read of {} failed! {}", reg_name, err);
    }
    let counters = SlowControlErrorCounters::read(la)?;
    total += counters;
    if break_on_failure && counters.sum > 0 {
      warn!("Slow control errors while reading {}, stopping", reg_name);
      break;
    }
  }
  Ok(total)
}

/// All VFATs of an OptoHybrid which have seen sync errors
pub fn get_oh_vfat_mask(la : &mut AccessContext, oh : u32) -> Result<DisabledLaneSet, ModuleError> {
  let mut mask = DisabledLaneSet::none(VFATS_PER_OH);
  for vfat in 0..VFATS_PER_OH {
    let sync_errs = la.try_read_reg(RegisterName::vfat_link(oh, vfat, "SYNC_ERR_CNT").as_str())?;
    if sync_errs > 0 {
      mask.mask(vfat);
    }
  }
  Ok(mask)
}

/// The OptoHybrids of oh_mask which the firmware has
pub fn existing_ohs(la : &mut AccessContext, oh_mask : EnabledLaneSet) -> Result<Vec<u32>, ModuleError> {
  let n_ohs = num_of_oh(la)?;
  let (ohs, missing) : (Vec<u32>, Vec<u32>) = oh_mask.lanes().into_iter().partition(|oh| *oh < n_ohs);
  if !missing.is_empty() {
    debug!("Firmware has {} OHs, skipping {:?}", n_ohs, missing);
  }
  Ok(ohs)
}

/// One VFAT mask per OptoHybrid. OptoHybrids which are
/// not in oh_mask, or not in the firmware, have all
/// their VFATs masked.
pub fn get_oh_vfat_mask_multilink(la : &mut AccessContext, oh_mask : EnabledLaneSet) -> Result<Vec<u32>, ModuleError> {
  let mut masks = vec![ALL_VFATS_BITS; OH_PER_AMC as usize];
  for oh in existing_ohs(la, oh_mask)? {
    masks[oh as usize] = get_oh_vfat_mask(la, oh)?.bits();
  }
  Ok(masks)
}

/// Make sure that all requested VFATs are synchronized
pub fn check_vfats_synchronized(la : &mut AccessContext, oh : u32, requested : DisabledLaneSet) -> Result<(), ModuleError> {
  let not_sync  = get_oh_vfat_mask(la, oh)?;
  let good      = not_sync.enabled();
  if !good.is_superset(&requested.enabled()) {
    let msg = format!("One of the unmasked VFATs is not Synced. goodVFATs: {:#x}\tnotmask: {:#x}",
                      good.bits(), requested.enabled().bits());
    error!("{}", msg);
    return Err(ModuleError::NotSynchronized(msg));
  }
  Ok(())
}

fn rpc_update_address_table(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let at_xml      = request.get_string("at_xml")?;
    let descriptors = parse_address_table(&at_xml)?;
    let n_regs      = env.directory().rebuild(&descriptors)?;
    response.set_word("n_registers", n_regs as u32);
    Ok(())
  });
}

fn rpc_read_reg_from_db(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let reg_name = request.get_string("reg_name")?;
    let desc     = env.directory().lookup(&reg_name)?;
    response.set_word("address", desc.address);
    response.set_word("mask", desc.mask);
    response.set_word("size", desc.size);
    response.set_string("permissions", &desc.permissions.to_perm_string());
    response.set_string("mode", desc.mode.as_str());
    Ok(())
  });
}

fn rpc_repeated_reg_read(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let reg_name         = request.get_string("reg_name")?;
    let break_on_failure = request.get_flag("breakOnFailure")?;
    let n_reads          = request.get_word("nReads")?;
    let mut la           = env.context(response)?;
    let counters         = repeated_reg_read(&mut la, &reg_name, break_on_failure, n_reads)?;
    counters.set_response(la.response);
    Ok(())
  });
}

fn rpc_get_oh_vfat_mask(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh     = request.get_word("ohN")?;
    let mut la = env.context(response)?;
    check_oh_index(&mut la, oh)?;
    let mask   = get_oh_vfat_mask(&mut la, oh)?;
    la.response.set_word("vfatMask", mask.bits());
    Ok(())
  });
}

fn rpc_get_oh_vfat_mask_multilink(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh_mask = EnabledLaneSet::ohs(request.get_word_or("ohMask", 0xfff)?);
    let mut la  = env.context(response)?;
    let masks   = get_oh_vfat_mask_multilink(&mut la, oh_mask)?;
    la.response.set_word_array("ohVfatMaskArray", &masks);
    Ok(())
  });
}

pub fn module_init(mgr : &mut ModuleManager<ModuleEnv>) {
  mgr.register_method("utils", "update_address_table", rpc_update_address_table);
  mgr.register_method("utils", "readRegFromDB", rpc_read_reg_from_db);
  mgr.register_method("utils", "repeatedRegRead", rpc_repeated_reg_read);
  mgr.register_method("utils", "getOHVFATMask", rpc_get_oh_vfat_mask);
  mgr.register_method("utils", "getOHVFATMaskMultiLink", rpc_get_oh_vfat_mask_multilink);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn saturating_sum() {
    let a = SlowControlErrorCounters { crc : 0xffff_fff0, sum : 0xffff_fff0, ..Default::default() };
    let b = SlowControlErrorCounters { crc : 0x20, sum : 0x20, transaction_count : 5, ..Default::default() };
    let c = a + b;
    assert_eq!(c.crc, 0xffff_ffff);
    assert_eq!(c.sum, 0xffff_ffff);
    assert_eq!(c.transaction_count, 5);
    let d = b + b;
    assert_eq!(d.crc, 0x40);
    assert_eq!(d.sum, 0x40);
  }

  #[test]
  fn sum_of_errors_saturates() {
    let mut counters = SlowControlErrorCounters {
      crc : u32::MAX, packet : 1, bitstuffing : 2, ..Default::default()
    };
    counters.sum_errors();
    assert_eq!(counters.sum, u32::MAX);
  }
}
