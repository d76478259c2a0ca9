//! Raw access to the memory mapped register space
//!
//! The AMC firmware maps its registers into the
//! physical address space of the Zynq. We access them
//! through /dev/mem. All words are 32bit, addresses
//! are byte addresses and consecutive words are 4
//! bytes apart.
//!
//! Besides the real device, there is a simulated
//! device which keeps the register space in memory.
//! It serves the `--simulate` mode of the service
//! and the tests.

extern crate memmap;

use std::collections::HashMap;
use std::error::Error;
use std::fs::File;
use std::sync::Mutex;
use std::sync::atomic::{
    AtomicUsize,
    Ordering,
};
use std::time::Duration;
use std::thread;

use memmap::{Mmap,
             MmapMut};

use crate::errors::RegisterError;

/// The size of a 32bit unsigned int in byte
/// (all words in registers are u32)
pub const SIZEOF_U32 : usize = 4;

/// mmap offsets need to be page aligned
pub const PAGE_SIZE  : u32   = 4096;

/// Anything which can transfer words to and from
/// the register space.
///
/// Implementations do not serialize access, this
/// is the job of the `MemHub`.
pub trait MemoryDevice : Send + Sync {
  /// Read data.len() consecutive words starting at address
  fn read(&self, address : u32, data : &mut [u32]) -> Result<(), RegisterError>;
  /// Write consecutive words starting at address
  fn write(&self, address : u32, data : &[u32]) -> Result<(), RegisterError>;
}

/// Words live at multiples of SIZEOF_U32
pub fn check_aligned(address : u32) -> Result<(), RegisterError> {
  if address as usize % SIZEOF_U32 != 0 {
    return Err(RegisterError::Unaligned(address));
  }
  Ok(())
}

/// Split an address into the page aligned mmap
/// offset and the remaining byte offset
fn page_split(addr : u32) -> (u32, usize) {
  let page = addr & !(PAGE_SIZE - 1);
  (page, (addr - page) as usize)
}

/// Allow READ access to the memory registers
///
/// Remember we have a 32bit system
///
/// # Returns
///
/// The map together with the byte offset of addr
/// inside the map
pub fn map_physical_mem_read(addr_space : &str,
                             addr       : u32,
                             len        : usize) -> Result<(Mmap, usize), Box<dyn Error>> {
  let (page, offset) = page_split(addr);
  let m = unsafe {
    memmap::MmapOptions::new()
      .offset(page as u64)
      .len(len + offset)
      .map(&File::open(addr_space)?)?
    };
  Ok((m, offset))
}

/// Allow WRITE access to the memory registers
///
/// # Arguments
///
/// addr : The memory address (address8) the register
///        is mapped to.
pub fn map_physical_mem_write(addr_space : &str,
                              addr       : u32,
                              len        : usize)
  -> Result<(MmapMut, usize), Box<dyn Error>> {
  let (page, offset) = page_split(addr);
  let m = unsafe {
    memmap::MmapOptions::new()
      .offset(page as u64)
      .len(len + offset)
      .map_mut(&File::options()
        .read(true)
        .write(true)
        .open(addr_space)?)?
    };
  Ok((m, offset))
}

/// The physical register space, mapped
/// through a memory device file (/dev/mem)
#[derive(Debug, Clone)]
pub struct MappedDevice {
  pub addr_space : String,
}

impl MappedDevice {
  pub fn new(addr_space : &str) -> Self {
    Self {
      addr_space : String::from(addr_space),
    }
  }

  /// Check that the device file can be opened at all
  pub fn probe(&self) -> Result<(), RegisterError> {
    match File::options().read(true).write(true).open(&self.addr_space) {
      Err(err) => Err(RegisterError::MMapFail(format!("{}: {}", self.addr_space, err))),
      Ok(_)    => Ok(())
    }
  }
}

impl MemoryDevice for MappedDevice {
  fn read(&self, address : u32, data : &mut [u32]) -> Result<(), RegisterError> {
    check_aligned(address)?;
    let (m, offset) = match map_physical_mem_read(&self.addr_space, address, data.len()*SIZEOF_U32) {
      Ok(m) => m,
      Err(err) => {
        error!("Failed to mmap: {:?}", err);
        return Err(RegisterError::MMapFail(err.to_string()));
      }
    };
    let p = unsafe { m.as_ptr().add(offset) } as *const u32;
    for (k, word) in data.iter_mut().enumerate() {
      unsafe {
        *word = std::ptr::read_volatile(p.add(k));
      }
    }
    Ok(())
  }

  fn write(&self, address : u32, data : &[u32]) -> Result<(), RegisterError> {
    trace!("Attempting to write {} words at addr {:#010x}", data.len(), address);
    check_aligned(address)?;
    let (mut m, offset) = match map_physical_mem_write(&self.addr_space, address, data.len()*SIZEOF_U32) {
      Ok(m) => m,
      Err(err) => {
        warn!("Failed to mmap! {:?}", err);
        return Err(RegisterError::MMapFail(err.to_string()));
      }
    };
    let p = unsafe { m.as_mut_ptr().add(offset) } as *mut u32;
    for (k, word) in data.iter().enumerate() {
      unsafe {
        std::ptr::write_volatile(p.add(k), *word);
      }
    }
    Ok(())
  }
}

/// Compute the value a simulated register returns
/// from the current register space and its address
pub type ReadHook = Box<dyn Fn(&HashMap<u32, u32>, u32) -> u32 + Send + Sync>;

/// A register space which lives in memory.
///
/// Unwritten addresses read as 0. Individual addresses
/// can be given a read hook, or be configured to fail.
/// Each transfer is recorded, and the device keeps
/// track of how many transfers were in flight at the
/// same time.
#[derive(Default)]
pub struct SimulatedDevice {
  memory        : Mutex<HashMap<u32, u32>>,
  hooks         : Mutex<HashMap<u32, ReadHook>>,
  failing       : Mutex<Vec<u32>>,
  writes        : Mutex<Vec<(u32, u32)>>,
  reads         : AtomicUsize,
  in_flight     : AtomicUsize,
  max_in_flight : AtomicUsize,
  latency       : Option<Duration>,
}

impl SimulatedDevice {
  pub fn new() -> Self {
    Self::default()
  }

  /// Every transfer takes at least this long. Used
  /// to provoke overlapping transfers
  pub fn with_latency(latency : Duration) -> Self {
    let mut dev = Self::default();
    dev.latency = Some(latency);
    dev
  }

  /// Set the content of an address, without recording a write
  pub fn preset(&self, address : u32, value : u32) {
    if let Ok(mut mem) = self.memory.lock() {
      mem.insert(address, value);
    }
  }

  /// Current content of an address, ignoring hooks
  pub fn peek(&self, address : u32) -> u32 {
    match self.memory.lock() {
      Ok(mem) => *mem.get(&address).unwrap_or(&0),
      Err(_)  => 0
    }
  }

  pub fn set_read_hook(&self, address : u32, hook : ReadHook) {
    if let Ok(mut hooks) = self.hooks.lock() {
      hooks.insert(address, hook);
    }
  }

  /// Any transfer touching this address fails
  pub fn fail_at(&self, address : u32) {
    if let Ok(mut failing) = self.failing.lock() {
      failing.push(address);
    }
  }

  /// All writes in the order they happened
  pub fn writes(&self) -> Vec<(u32, u32)> {
    match self.writes.lock() {
      Ok(w)  => w.clone(),
      Err(_) => Vec::new()
    }
  }

  /// All values written to a single address
  pub fn writes_to(&self, address : u32) -> Vec<u32> {
    self.writes().into_iter().filter(|(a,_)| *a == address).map(|(_,v)| v).collect()
  }

  pub fn n_reads(&self) -> usize {
    self.reads.load(Ordering::SeqCst)
  }

  /// The largest number of transfers which
  /// were ever in flight at the same time
  pub fn max_in_flight(&self) -> usize {
    self.max_in_flight.load(Ordering::SeqCst)
  }

  fn enter(&self) {
    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    if let Some(latency) = self.latency {
      thread::sleep(latency);
    }
  }

  fn leave(&self) {
    self.in_flight.fetch_sub(1, Ordering::SeqCst);
  }

  fn check_failing(&self, address : u32, n_words : usize) -> Result<(), RegisterError> {
    let failing = self.failing.lock().map_err(|e| RegisterError::DeviceTransfer(e.to_string()))?;
    let end = address as u64 + (n_words * SIZEOF_U32) as u64;
    for f in failing.iter() {
      if (*f as u64) >= address as u64 && (*f as u64) < end {
        return Err(RegisterError::DeviceTransfer(format!("simulated transfer failure at {:#010x}", f)));
      }
    }
    Ok(())
  }
}

impl MemoryDevice for SimulatedDevice {
  fn read(&self, address : u32, data : &mut [u32]) -> Result<(), RegisterError> {
    self.enter();
    let result = (|| {
      check_aligned(address)?;
      self.check_failing(address, data.len())?;
      let mem   = self.memory.lock().map_err(|e| RegisterError::DeviceTransfer(e.to_string()))?;
      let hooks = self.hooks.lock().map_err(|e| RegisterError::DeviceTransfer(e.to_string()))?;
      for (k, word) in data.iter_mut().enumerate() {
        let addr = address.wrapping_add((k * SIZEOF_U32) as u32);
        *word = match hooks.get(&addr) {
          Some(hook) => hook(&mem, addr),
          None       => *mem.get(&addr).unwrap_or(&0),
        };
      }
      self.reads.fetch_add(data.len(), Ordering::SeqCst);
      Ok(())
    })();
    self.leave();
    result
  }

  fn write(&self, address : u32, data : &[u32]) -> Result<(), RegisterError> {
    self.enter();
    let result = (|| {
      check_aligned(address)?;
      self.check_failing(address, data.len())?;
      let mut mem    = self.memory.lock().map_err(|e| RegisterError::DeviceTransfer(e.to_string()))?;
      let mut writes = self.writes.lock().map_err(|e| RegisterError::DeviceTransfer(e.to_string()))?;
      for (k, word) in data.iter().enumerate() {
        let addr = address.wrapping_add((k * SIZEOF_U32) as u32);
        mem.insert(addr, *word);
        writes.push((addr, *word));
      }
      Ok(())
    })();
    self.leave();
    result
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn page_split_aligns() {
    assert_eq!(page_split(0x6440_1234), (0x6440_1000, 0x234));
    assert_eq!(page_split(0x1000), (0x1000, 0));
  }

  #[test]
  fn simulated_block_transfer() {
    let dev = SimulatedDevice::new();
    dev.write(0x100, &[1,2,3]).unwrap();
    let mut data = [0u32; 3];
    dev.read(0x100, &mut data).unwrap();
    assert_eq!(data, [1,2,3]);
    assert_eq!(dev.peek(0x108), 3);
    assert_eq!(dev.writes_to(0x104), vec![2]);
  }

  #[test]
  fn simulated_hooks_and_failures() {
    let dev = SimulatedDevice::new();
    dev.preset(0x10, 5);
    dev.set_read_hook(0x20, Box::new(|mem, _| mem.get(&0x10).unwrap_or(&0) * 2));
    let mut data = [0u32; 1];
    dev.read(0x20, &mut data).unwrap();
    assert_eq!(data[0], 10);
    dev.fail_at(0x30);
    assert!(dev.read(0x2c, &mut [0u32; 2]).is_err());
    assert!(dev.write(0x30, &[1]).is_err());
  }

  #[test]
  fn unaligned_words_are_refused() {
    let dev = SimulatedDevice::new();
    assert_eq!(dev.write(0x102, &[1]), Err(RegisterError::Unaligned(0x102)));
    assert_eq!(dev.read(0x101, &mut [0u32; 1]), Err(RegisterError::Unaligned(0x101)));
    assert!(dev.writes().is_empty());
    assert!(check_aligned(0x6440_0004).is_ok());
  }
}
