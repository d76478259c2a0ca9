//! Settings of the CTP7 RPC service
//!
//! Where to find the register store, which memory
//! device to map, how long to poll and so on.
//!
//! Settings can be written to and read from a
//! .toml file. Values which are not given in the
//! file fall back to their defaults.

use std::fs::File;
use std::io::{
    Write,
    Read,
};
use std::fmt;
use std::error::Error;
use std::path::PathBuf;

extern crate toml;

use crate::constants::{
    GEM_PATH_ENV,
    ADDRESS_TABLE_STORE,
    MEMHUB_SEMAPHORE,
    DEFAULT_MAP_SIZE_MB,
};

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum SettingsError {
  FileNotFound,
  TomlDecodingError,
  TomlEncodingError,
  WriteFailed,
}

impl SettingsError {
  pub fn to_string(&self) -> String {
    match self {
      SettingsError::FileNotFound      => {return String::from("FileNotFound");},
      SettingsError::TomlDecodingError => {return String::from("TomlDecodingError");},
      SettingsError::TomlEncodingError => {return String::from("TomlEncodingError");},
      SettingsError::WriteFailed       => {return String::from("WriteFailed");},
    }
  }
}

impl fmt::Display for SettingsError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let repr = self.to_string();
    write!(f, "<SettingsError: {}>", repr)
  }
}

impl Error for SettingsError {
}

/// Configuration of the RPC service on the CTP7
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Ctp7Settings {
  /// Directory holding the register store and
  /// hardware dumps. Defaults to $GEM_PATH
  pub gem_path              : String,
  /// Name of the register store inside gem_path
  pub address_table         : String,
  /// Memory device which gets mapped for register access
  pub memory_device         : String,
  /// Name of the POSIX semaphore which serializes
  /// access to the memory device
  pub semaphore_name        : String,
  /// Maximum size of the register store in MiB
  pub map_size_mb           : u64,
  /// 0MQ address the service binds its REP socket to
  pub server_address        : String,
  /// Sleep between two polls of a hardware
  /// counter or status register (microseconds)
  pub poll_interval_us      : u64,
  /// Give up polling after this many iterations
  pub max_poll_iterations   : u64,
  /// Number of reads in verification loops, e.g.
  /// the GBT phase scan
  pub verification_reads    : u32,
}

impl Ctp7Settings {
  pub fn new() -> Self {
    let gem_path = std::env::var(GEM_PATH_ENV).unwrap_or(String::from("/mnt/persistent/gemdaq"));
    Self {
      gem_path,
      address_table         : String::from(ADDRESS_TABLE_STORE),
      memory_device         : String::from("/dev/mem"),
      semaphore_name        : String::from(MEMHUB_SEMAPHORE),
      map_size_mb           : DEFAULT_MAP_SIZE_MB,
      server_address        : String::from("tcp://0.0.0.0:30000"),
      poll_interval_us      : 1000,
      max_poll_iterations   : 100000,
      verification_reads    : 100,
    }
  }

  /// Full path of the register store
  pub fn address_table_path(&self) -> PathBuf {
    let mut path = PathBuf::from(&self.gem_path);
    path.push(&self.address_table);
    path
  }

  /// Write the settings to a toml file
  pub fn to_toml(&self, mut filename : String) -> Result<(), SettingsError> {
    if !filename.ends_with(".toml") {
      filename += ".toml";
    }
    info!("Will write to file {}!", filename);
    let toml_string = match toml::to_string_pretty(&self) {
      Err(err) => {
        error!("Unable to serialize toml! {err}");
        return Err(SettingsError::TomlEncodingError);
      }
      Ok(toml_string) => toml_string
    };
    match File::create(&filename) {
      Err(err) => {
        error!("Unable to open file {}! {}", filename, err);
        Err(SettingsError::WriteFailed)
      }
      Ok(mut file) => {
        match file.write_all(toml_string.as_bytes()) {
          Err(err) => {
            error!("Unable to write to file {}! {}", filename, err);
            Err(SettingsError::WriteFailed)
          }
          Ok(_)    => {
            debug!("Wrote settings to {}!", filename);
            Ok(())
          }
        }
      }
    }
  }

  /// Read settings from a toml file
  pub fn from_toml(filename : String) -> Result<Ctp7Settings, SettingsError> {
    match File::open(&filename) {
      Err(err) => {
        error!("Unable to open {}! {}", filename, err);
        return Err(SettingsError::FileNotFound);
      }
      Ok(mut file) => {
        let mut toml_string = String::from("");
        match file.read_to_string(&mut toml_string) {
          Err(err) => {
            error!("Unable to read {}! {}", filename, err);
            return Err(SettingsError::TomlDecodingError);
          }
          Ok(_) => {
            match toml::from_str(&toml_string) {
              Err(err) => {
                error!("Can't interpret toml! {}", err);
                return Err(SettingsError::TomlDecodingError);
              }
              Ok(settings) => {
                return Ok(settings);
              }
            }
          }
        }
      }
    }
  }
}

impl fmt::Display for Ctp7Settings {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let disp : String;
    match toml::to_string(self) {
      Err(err) => {
        error!("Serialization error! {err}");
        disp = String::from("-- SERIALIZATION ERROR! --");
      }
      Ok(_disp) => {
        disp = _disp;
      }
    }
    write!(f, "<Ctp7Settings :\n{}>", disp)
  }
}

impl Default for Ctp7Settings {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn store_path_joins_gem_path() {
    let mut settings = Ctp7Settings::new();
    settings.gem_path = String::from("/tmp/gem");
    assert_eq!(settings.address_table_path(), PathBuf::from("/tmp/gem/address_table.mdb"));
  }

  #[test]
  fn partial_toml_uses_defaults() {
    let settings : Ctp7Settings = toml::from_str("poll_interval_us = 5\n").unwrap();
    assert_eq!(settings.poll_interval_us, 5);
    assert_eq!(settings.map_size_mb, DEFAULT_MAP_SIZE_MB);
    assert_eq!(settings.semaphore_name, "/memhub");
  }
}
