//! Configuration blaster RAMs, the "blaster" RPC module
//!
//! The firmware keeps the full configuration of the GBTx,
//! OptoHybrid FPGAs and VFATs of every link in three RAMs
//! and writes it to the front-ends on demand. Blobs are
//! laid out per OptoHybrid, only the OptoHybrids of the
//! link mask are part of a blob.

use ctp7_lib::{
    ModuleManager,
    RpcMessage,
};
use ctp7_lib::constants::{
    GBTS_PER_OH,
    GBT_SINGLE_RAM_SIZE,
    OH_SINGLE_RAM_SIZE,
    VFATS_PER_OH,
    VFAT_SINGLE_RAM_SIZE,
};

use crate::access::AccessContext;
use crate::errors::ModuleError;
use crate::masks::EnabledLaneSet;
use crate::memory::SIZEOF_U32;
use crate::service::{
    respond,
    ModuleEnv,
};

const BLASTER_RAM    : &str = "GEM_AMC.CONFIG_BLASTER.RAM";
const BLASTER_STATUS : &str = "GEM_AMC.CONFIG_BLASTER.STATUS";

bitflags::bitflags! {
  /// The blaster RAMs
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct BlasterType : u8 {
    const GBT        = 0x1;
    const OPTOHYBRID = 0x2;
    const VFAT       = 0x4;
    const ALL        = 0x7;
  }
}

impl BlasterType {
  /// Words of one OptoHybrid in a single RAM
  pub fn words_per_oh(&self) -> Result<usize, ModuleError> {
    match *self {
      BlasterType::GBT        => Ok(GBTS_PER_OH as usize * GBT_SINGLE_RAM_SIZE),
      BlasterType::OPTOHYBRID => Ok(OH_SINGLE_RAM_SIZE),
      BlasterType::VFAT       => Ok(VFATS_PER_OH as usize * VFAT_SINGLE_RAM_SIZE),
      _                       => Err(ModuleError::InvalidParameter(format!("{:?} is not a single blaster RAM", self)))
    }
  }

  /// Words of one part (a GBTx, a VFAT) inside the
  /// block of an OptoHybrid
  pub fn words_per_part(&self) -> Result<usize, ModuleError> {
    match *self {
      BlasterType::GBT        => Ok(GBT_SINGLE_RAM_SIZE),
      BlasterType::OPTOHYBRID => Ok(OH_SINGLE_RAM_SIZE),
      BlasterType::VFAT       => Ok(VFAT_SINGLE_RAM_SIZE),
      _                       => Err(ModuleError::InvalidParameter(format!("{:?} is not a single blaster RAM", self)))
    }
  }

  fn ram_name(&self) -> &'static str {
    match *self {
      BlasterType::GBT        => "GBT",
      BlasterType::OPTOHYBRID => "OH_FPGA",
      _                       => "VFAT",
    }
  }

  fn status_name(&self) -> &'static str {
    match *self {
      BlasterType::GBT        => "GBT_RAM_SIZE",
      BlasterType::OPTOHYBRID => "OH_RAM_SIZE",
      _                       => "VFAT_RAM_SIZE",
    }
  }

  /// The single RAMs in blob order
  pub fn singles(&self) -> Vec<BlasterType> {
    [BlasterType::GBT, BlasterType::OPTOHYBRID, BlasterType::VFAT]
      .into_iter()
      .filter(|t| self.contains(*t))
      .collect()
  }
}

/// Size of a RAM in words as reported by the firmware,
/// if the firmware reports it
pub fn get_ram_max_size(la : &mut AccessContext, ram : BlasterType) -> Result<Option<u32>, ModuleError> {
  let reg = format!("{}.{}", BLASTER_STATUS, ram.status_name());
  if !la.exists(&reg) {
    return Ok(None);
  }
  Ok(Some(la.try_read_reg(&reg)?))
}

/// Address of a part of the block of an OptoHybrid
pub fn get_ram_base_addr(la : &mut AccessContext, ram : BlasterType, oh : u32, part : u32) -> Result<u32, ModuleError> {
  let desc   = la.lookup(&format!("{}.{}_OH{}", BLASTER_RAM, ram.ram_name(), oh))?;
  let offset = part as usize * ram.words_per_part()? * SIZEOF_U32;
  Ok(desc.address.wrapping_add(offset as u32))
}

/// Expected length of a blob for the given RAMs and links
pub fn blob_size(ram : BlasterType, oh_mask : EnabledLaneSet) -> Result<usize, ModuleError> {
  let mut size = 0usize;
  for single in ram.singles() {
    size += single.words_per_oh()? * oh_mask.len();
  }
  Ok(size)
}

fn check_blob(la : &mut AccessContext, ram : BlasterType, blob_len : usize, oh_mask : EnabledLaneSet) -> Result<(), ModuleError> {
  let expected = blob_size(ram, oh_mask)?;
  if blob_len != expected {
    return Err(ModuleError::SizeLimit(
      format!("Blob of {} words does not match the {} words expected for {:?} and OH mask {:#x}",
              blob_len, expected, ram, oh_mask.bits())));
  }
  for single in ram.singles() {
    if let Some(max_size) = get_ram_max_size(la, single)? {
      let needed = single.words_per_oh()? * oh_mask.len();
      if needed > max_size as usize {
        return Err(ModuleError::SizeLimit(
          format!("{} words do not fit into the {} RAM of {} words", needed, single.ram_name(), max_size)));
      }
    }
  }
  Ok(())
}

/// Write a blob into one or more RAMs. With several RAMs,
/// the blob holds all GBT blocks, then all OptoHybrid
/// blocks, then all VFAT blocks.
pub fn write_conf_ram(la : &mut AccessContext, ram : BlasterType, blob : &[u32], oh_mask : EnabledLaneSet) -> Result<(), ModuleError> {
  debug!("Writing {} words to blaster RAM {:?} for {}", blob.len(), ram, oh_mask);
  check_blob(la, ram, blob.len(), oh_mask)?;
  let mut pos = 0usize;
  for single in ram.singles() {
    let n_words = single.words_per_oh()?;
    for oh in oh_mask.lanes() {
      let base = get_ram_base_addr(la, single, oh, 0)?;
      la.hub.write(base, &blob[pos..pos + n_words])?;
      pos += n_words;
    }
  }
  Ok(())
}

/// Read back the blob write_conf_ram would have written
pub fn read_conf_ram(la : &mut AccessContext, ram : BlasterType, oh_mask : EnabledLaneSet) -> Result<Vec<u32>, ModuleError> {
  let mut blob = vec![0u32; blob_size(ram, oh_mask)?];
  let mut pos  = 0usize;
  for single in ram.singles() {
    let n_words = single.words_per_oh()?;
    for oh in oh_mask.lanes() {
      let base = get_ram_base_addr(la, single, oh, 0)?;
      la.hub.read(base, &mut blob[pos..pos + n_words])?;
      pos += n_words;
    }
  }
  Ok(blob)
}

fn request_type(request : &RpcMessage) -> Result<BlasterType, ModuleError> {
  let word = request.get_word("type")?;
  let bits = u8::try_from(word).unwrap_or(0);
  match BlasterType::from_bits(bits) {
    Some(ram) if !ram.is_empty() => Ok(ram),
    _ => Err(ModuleError::InvalidParameter(format!("Unknown blaster RAM type {:#x}", word)))
  }
}

fn write_ram_rpc(env : &ModuleEnv, ram : Option<BlasterType>, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let ram     = match ram {
      Some(ram) => ram,
      None      => request_type(request)?
    };
    let blob    = request.get_word_array("blob")?;
    let oh_mask = EnabledLaneSet::ohs(request.get_word_or("ohMask", 0xfff)?);
    let mut la  = env.context(response)?;
    write_conf_ram(&mut la, ram, &blob, oh_mask)
  });
}

fn rpc_write_conf_ram(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  write_ram_rpc(env, None, request, response);
}

fn rpc_write_gbt_conf_ram(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  write_ram_rpc(env, Some(BlasterType::GBT), request, response);
}

fn rpc_write_optohybrid_conf_ram(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  write_ram_rpc(env, Some(BlasterType::OPTOHYBRID), request, response);
}

fn rpc_write_vfat_conf_ram(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  write_ram_rpc(env, Some(BlasterType::VFAT), request, response);
}

fn rpc_read_conf_ram(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let ram     = request_type(request)?;
    let oh_mask = EnabledLaneSet::ohs(request.get_word_or("ohMask", 0xfff)?);
    let mut la  = env.context(response)?;
    let blob    = read_conf_ram(&mut la, ram, oh_mask)?;
    la.response.set_word_array("blob", &blob);
    Ok(())
  });
}

pub fn module_init(mgr : &mut ModuleManager<ModuleEnv>) {
  mgr.register_method("blaster", "writeConfRAM", rpc_write_conf_ram);
  mgr.register_method("blaster", "writeGBTConfRAM", rpc_write_gbt_conf_ram);
  mgr.register_method("blaster", "writeOptoHybridConfRAM", rpc_write_optohybrid_conf_ram);
  mgr.register_method("blaster", "writeVFATConfRAM", rpc_write_vfat_conf_ram);
  mgr.register_method("blaster", "readConfRAM", rpc_read_conf_ram);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn blob_layout() {
    let two_ohs = EnabledLaneSet::ohs(0b101);
    assert_eq!(blob_size(BlasterType::GBT, two_ohs).unwrap(), 2 * 3 * 92);
    assert_eq!(blob_size(BlasterType::VFAT, two_ohs).unwrap(), 2 * 24 * 74);
    assert_eq!(blob_size(BlasterType::ALL, two_ohs).unwrap(), 2 * (276 + 200 + 1776));
    assert_eq!(BlasterType::ALL.singles(), vec![BlasterType::GBT, BlasterType::OPTOHYBRID, BlasterType::VFAT]);
    assert!(BlasterType::ALL.words_per_oh().is_err());
  }
}
