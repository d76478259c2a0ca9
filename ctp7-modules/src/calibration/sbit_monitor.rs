//! Readout of the SBIT monitor
//!
//! The monitor of the AMC trigger block keeps the 8
//! clusters an OptoHybrid sent in one clock cycle, and
//! the distance of these clusters to the last L1A. Each
//! monitor cluster is a 16 bit word, bits [10:0] are the
//! SBIT address and bits [14:12] the cluster size.
//! Addresses beyond the last SBIT mark empty slots.

use std::fmt;
use std::thread;
use std::time::{
    Duration,
    Instant,
};

use ctp7_lib::constants::SBITS_PER_OH;

use crate::access::AccessContext;
use crate::calibration::run_restoring;
use crate::errors::ModuleError;
use crate::utils::{
    check_oh_index,
    fw_version_check,
    FirmwareVersion,
};

pub const SBIT_MONITOR : &str = "GEM_AMC.TRIGGER.SBIT_MONITOR";

/// Cluster slots of the monitor
pub const CLUSTERS_PER_READOUT : usize = 8;

/// 4095 clock cycles of 25 ns
pub const MONITOR_WINDOW : Duration = Duration::from_nanos(102_400);

/// L1A delays are cut at 12 bits, the monitor
/// window does not last longer
pub const MAX_L1A_DELAY : u32 = 0xfff;

/// Readouts stop before the result grows beyond
/// what fits into a single reply
pub const MAX_NETWORK_BYTES : usize = 65000;

/// A cluster as stored in the result of a readout
///
/// bits [10:0] address, [13:11] size,
/// [26:14] L1A delay
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SbitCluster {
  pub address   : u32,
  pub size      : u32,
  pub l1a_delay : u32,
}

impl SbitCluster {
  /// Decode a monitor cluster word
  pub fn from_monitor(word : u32, l1a_delay : u32) -> Self {
    Self {
      address   : word & 0x7ff,
      size      : (word >> 12) & 0x7,
      l1a_delay : l1a_delay.min(MAX_L1A_DELAY),
    }
  }

  /// Empty slots carry an address beyond the last SBIT
  pub fn is_valid(&self) -> bool {
    self.address < SBITS_PER_OH
  }

  pub fn pack(&self) -> u32 {
    (self.address & 0x7ff) | ((self.size & 0x7) << 11) | ((self.l1a_delay & 0x1fff) << 14)
  }

  pub fn unpack(word : u32) -> Self {
    Self {
      address   : word & 0x7ff,
      size      : (word >> 11) & 0x7,
      l1a_delay : (word >> 14) & 0x1fff,
    }
  }

  /// Position of the VFAT which sent the cluster
  pub fn vfat(&self) -> Option<u32> {
    if !self.is_valid() {
      return None;
    }
    Some(7 - self.address / 192 + ((self.address % 192) / 64) * 8)
  }
}

impl fmt::Display for SbitCluster {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<SbitCluster: address {} size {} L1A delay {} valid {}>",
           self.address, self.size, self.l1a_delay, self.is_valid())
  }
}

/// Result of an SBIT readout
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SbitReadout {
  /// Packed clusters, CLUSTERS_PER_READOUT per readout
  pub clusters     : Vec<u32>,
  /// The readout stopped early, more data would not
  /// have fit into the reply
  pub size_limited : bool,
}

impl SbitReadout {
  pub fn n_readouts(&self) -> usize {
    self.clusters.len() / CLUSTERS_PER_READOUT
  }

  pub fn n_valid(&self) -> usize {
    self.clusters.iter().filter(|w| SbitCluster::unpack(**w).is_valid()).count()
  }
}

fn monitor(field : &str) -> String {
  format!("{}.{}", SBIT_MONITOR, field)
}

/// Read out the SBIT monitor for an OptoHybrid during
/// acquire_time seconds.
///
/// The monitor is reset, and read out after one window.
/// Every readout adds CLUSTERS_PER_READOUT words.
pub fn sbit_read_out(la : &mut AccessContext, oh : u32, acquire_time : u32) -> Result<SbitReadout, ModuleError> {
  check_oh_index(la, oh)?;
  match fw_version_check(la, "sbitReadOut")? {
    FirmwareVersion::V3  => (),
    FirmwareVersion::V2b => {
      return Err(ModuleError::VersionMismatch(String::from("sbitReadOut is only supported for VFAT3 based systems")));
    }
  }
  info!("Reading out the SBIT monitor of OH {} for {} s", oh, acquire_time);
  let acquire  = Duration::from_secs(acquire_time as u64);
  let max_size = MAX_NETWORK_BYTES / std::mem::size_of::<u32>();
  run_restoring(la, |la, saved| {
    saved.override_reg(la, &monitor("OH_SELECT"), oh)?;
    let mut readout = SbitReadout::default();
    let start = Instant::now();
    while start.elapsed() < acquire {
      if readout.clusters.len() + CLUSTERS_PER_READOUT > max_size {
        warn!("SBIT readout of OH {} stopped after {} readouts, the reply is full", oh, readout.n_readouts());
        readout.size_limited = true;
        break;
      }
      la.write_reg(&monitor("RESET"), 0x1)?;
      thread::sleep(MONITOR_WINDOW);
      let l1a_delay = la.try_read_reg(&monitor("L1A_DELAY"))?;
      for slot in 0..CLUSTERS_PER_READOUT {
        let word = la.try_read_reg(&monitor(&format!("CLUSTER{}", slot)))?;
        readout.clusters.push(SbitCluster::from_monitor(word, l1a_delay).pack());
      }
    }
    debug!("SBIT readout of OH {}: {} readouts, {} valid clusters", oh, readout.n_readouts(), readout.n_valid());
    Ok(readout)
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cluster_words() {
    // address 13, size 2
    let cluster = SbitCluster::from_monitor(0x200d, 0xffff_ffff);
    assert_eq!(cluster.address, 13);
    assert_eq!(cluster.size, 2);
    assert_eq!(cluster.l1a_delay, MAX_L1A_DELAY);
    assert!(cluster.is_valid());
    assert_eq!(SbitCluster::unpack(cluster.pack()), cluster);
    assert!(!SbitCluster::from_monitor(0x7ff, 0).is_valid());
    assert!(!SbitCluster::from_monitor(1536, 0).is_valid());
  }

  #[test]
  fn vfat_positions() {
    assert_eq!(SbitCluster { address : 0, size : 0, l1a_delay : 0 }.vfat(), Some(7));
    assert_eq!(SbitCluster { address : 64, size : 0, l1a_delay : 0 }.vfat(), Some(15));
    assert_eq!(SbitCluster { address : 1535, size : 0, l1a_delay : 0 }.vfat(), Some(16));
    assert_eq!(SbitCluster { address : 2000, size : 0, l1a_delay : 0 }.vfat(), None);
  }
}
