//! Register access by name
//!
//! An `AccessContext` is built at the start of every RPC
//! invocation. It locks the register directory of the
//! service and holds a read transaction on it for the
//! whole call, next to the response the call will
//! eventually send. The transaction is aborted and the
//! lock released when the context goes out of scope.
//!
//! All physical transfers go through the `MemHub`.
//!
//! Masks select a bit field of a register. Reads return
//! the field shifted down to bit 0, writes of a field
//! leave the other bits of the register untouched.

use std::sync::MutexGuard;
use std::time::Duration;
use std::thread;

use ctp7_lib::RpcMessage;
use ctp7_lib::constants::DEADDEAD;

use crate::directory::{
    AccessMode,
    RegisterDescriptor,
    RegisterDirectory,
};
use crate::errors::{
    ModuleError,
    RegisterError,
};
use crate::memhub::MemHub;
use crate::memory::SIZEOF_U32;

/// Restrict a word to the bits of mask. Applying it
/// twice changes nothing.
pub fn apply_mask(word : u32, mask : u32) -> u32 {
  word & mask
}

/// Position of the lowest set bit of the mask
pub fn mask_shift(mask : u32) -> u32 {
  if mask == 0 {
    0
  } else {
    mask.trailing_zeros()
  }
}

/// Extract the field selected by mask
pub fn extract_field(word : u32, mask : u32) -> u32 {
  apply_mask(word, mask) >> mask_shift(mask)
}

/// Put value into the field selected by mask,
/// keeping everything else of word
pub fn insert_field(word : u32, mask : u32, value : u32) -> u32 {
  (word & !mask) | (value.wrapping_shl(mask_shift(mask)) & mask)
}

/// How long and how often to poll hardware
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct PollSettings {
  pub interval       : Duration,
  pub max_iterations : u64,
}

impl PollSettings {
  pub fn new(interval_us : u64, max_iterations : u64) -> Self {
    Self {
      interval       : Duration::from_micros(interval_us),
      max_iterations,
    }
  }
}

impl Default for PollSettings {
  fn default() -> Self {
    Self::new(1000, 100000)
  }
}

/// Everything a single RPC invocation needs to
/// talk to the hardware
pub struct AccessContext<'a> {
  pub hub      : &'a MemHub,
  pub response : &'a mut RpcMessage,
  pub poll     : PollSettings,
  directory    : MutexGuard<'a, RegisterDirectory>,
}

impl<'a> AccessContext<'a> {
  /// Start the read transaction on the directory
  pub fn new(hub       : &'a MemHub,
             mut directory : MutexGuard<'a, RegisterDirectory>,
             response  : &'a mut RpcMessage,
             poll      : PollSettings) -> Result<Self, RegisterError> {
    directory.begin_read()?;
    Ok(Self {
      hub,
      response,
      poll,
      directory,
    })
  }

  pub fn directory(&mut self) -> &mut RegisterDirectory {
    &mut *self.directory
  }

  /// Resolve a name, without touching the hardware
  pub fn lookup(&mut self, reg_name : &str) -> Result<RegisterDescriptor, RegisterError> {
    Ok(self.directory.lookup(reg_name)?)
  }

  /// Check if a register is known. Directory failures
  /// count as "does not exist"
  pub fn exists(&mut self, reg_name : &str) -> bool {
    match self.directory.exists(reg_name) {
      Ok(known) => known,
      Err(err)  => {
        warn!("Unable to query directory for {}! {}", reg_name, err);
        false
      }
    }
  }

  /// Read a word, without any mask
  pub fn read_raw(&self, address : u32) -> Result<u32, RegisterError> {
    let mut data = [0u32; 1];
    self.hub.read(address, &mut data)?;
    Ok(data[0])
  }

  /// Write a word, without any mask
  pub fn write_raw(&self, address : u32, value : u32) -> Result<(), RegisterError> {
    self.hub.write(address, &[value])
  }

  /// Read the whole word of a register
  pub fn read_raw_reg(&mut self, reg_name : &str) -> Result<u32, RegisterError> {
    let desc = self.lookup(reg_name)?;
    if !desc.is_readable() {
      return Err(RegisterError::PermissionDenied(format!("{} is not readable", reg_name)));
    }
    self.read_raw(desc.address)
  }

  /// Read the field of a register
  pub fn try_read_reg(&mut self, reg_name : &str) -> Result<u32, RegisterError> {
    let desc = self.lookup(reg_name)?;
    if !desc.is_readable() {
      return Err(RegisterError::PermissionDenied(format!("{} is not readable", reg_name)));
    }
    let word = self.read_raw(desc.address)?;
    Ok(extract_field(word, desc.mask))
  }

  /// Read the field of a register. Failures are logged,
  /// put into the response and yield 0xdeaddead.
  pub fn read_reg(&mut self, reg_name : &str) -> u32 {
    match self.try_read_reg(reg_name) {
      Ok(value) => value,
      Err(err)  => {
        error!("Reading {} failed! {}", reg_name, err);
        self.response.set_error(&format!("Error reading register {}: {}", reg_name, err.to_string()));
        DEADDEAD
      }
    }
  }

  /// Write the field of a register. A partial mask
  /// needs a read-modify-write.
  pub fn write_reg(&mut self, reg_name : &str, value : u32) -> Result<(), RegisterError> {
    let desc = self.lookup(reg_name)?;
    if !desc.is_writable() {
      return Err(RegisterError::PermissionDenied(format!("{} is not writable", reg_name)));
    }
    if desc.mask == u32::MAX {
      return self.write_raw(desc.address, value);
    }
    let current = if desc.is_readable() {
      self.read_raw(desc.address)?
    } else {
      0
    };
    self.write_raw(desc.address, insert_field(current, desc.mask, value))
  }

  fn check_block(desc : &RegisterDescriptor, size : usize, offset : u32) -> Result<(), RegisterError> {
    match desc.mode {
      AccessMode::Fifo => Ok(()),
      AccessMode::Single => {
        if size == 1 && offset == 0 && desc.mask == u32::MAX {
          Ok(())
        } else {
          Err(RegisterError::BlockSizeViolation(
            format!("{} is a single register, block transfer of {} words at offset {} is not allowed", desc.name, size, offset)))
        }
      }
      AccessMode::Block => {
        if size as u64 + offset as u64 > desc.size as u64 {
          Err(RegisterError::BlockSizeViolation(
            format!("{} words at offset {} exceed the {} words of {}", size, offset, desc.size, desc.name)))
        } else {
          Ok(())
        }
      }
    }
  }

  /// Read size words. Fifos are read at the same address
  /// size times, blocks from consecutive addresses.
  pub fn read_block(&mut self, reg_name : &str, size : usize, offset : u32) -> Result<Vec<u32>, RegisterError> {
    let desc = self.lookup(reg_name)?;
    if !desc.is_readable() {
      return Err(RegisterError::PermissionDenied(format!("{} is not readable", reg_name)));
    }
    Self::check_block(&desc, size, offset)?;
    let mut data = vec![0u32; size];
    if desc.mode == AccessMode::Fifo {
      for word in data.iter_mut() {
        *word = self.read_raw(desc.address)?;
      }
    } else {
      let start = desc.address.wrapping_add(offset.wrapping_mul(SIZEOF_U32 as u32));
      self.hub.read(start, &mut data)?;
    }
    Ok(data)
  }

  /// Write all values, following the same rules as read_block
  pub fn write_block(&mut self, reg_name : &str, values : &[u32], offset : u32) -> Result<(), RegisterError> {
    let desc = self.lookup(reg_name)?;
    if !desc.is_writable() {
      return Err(RegisterError::PermissionDenied(format!("{} is not writable", reg_name)));
    }
    Self::check_block(&desc, values.len(), offset)?;
    if desc.mode == AccessMode::Fifo {
      for value in values {
        self.write_raw(desc.address, *value)?;
      }
      Ok(())
    } else {
      let start = desc.address.wrapping_add(offset.wrapping_mul(SIZEOF_U32 as u32));
      self.hub.write(start, values)
    }
  }

  /// Poll a register until accept returns true for
  /// its value, sleeping the poll interval in between.
  ///
  /// # Returns
  ///
  /// The last value read, or MeasurementTimeout once
  /// the iteration bound is reached
  pub fn poll_reg<F>(&mut self, reg_name : &str, accept : F) -> Result<u32, ModuleError>
    where F : Fn(u32) -> bool {
    for _ in 0..self.poll.max_iterations {
      let value = self.try_read_reg(reg_name)?;
      if accept(value) {
        return Ok(value);
      }
      thread::sleep(self.poll.interval);
    }
    Err(ModuleError::MeasurementTimeout(format!("{} did not reach its target after {} polls of {:?}",
                                                reg_name, self.poll.max_iterations, self.poll.interval)))
  }
}

impl Drop for AccessContext<'_> {
  fn drop(&mut self) {
    self.directory.end_read();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn mask_idempotence() {
    let words = [0u32, 1, 0x1ff, 0xdead_beef, u32::MAX, 0x8000_0001];
    let masks = [0u32, 0xff, 0xff00, 0x1, 0x8000_0000, u32::MAX, 0x0ff0_0f0f];
    for w in words {
      for m in masks {
        assert_eq!(apply_mask(apply_mask(w, m), m), apply_mask(w, m));
      }
    }
  }

  #[test]
  fn field_access() {
    assert_eq!(extract_field(0x1ff, 0xff), 0xff);
    assert_eq!(extract_field(0x0000_3c00, 0x0000_ff00), 0x3c);
    assert_eq!(insert_field(0xffff_ffff, 0x0000_ff00, 0x12), 0xffff_12ff);
    assert_eq!(insert_field(0, 0x1, 0x3), 0x1);
    assert_eq!(mask_shift(0), 0);
  }
}
