//! Error types of the register access, directory and
//! module layers.
//!
//! None of them ever crosses the RPC boundary as such.
//! A module entry point renders them into the "error"
//! key of the response.

use std::error::Error;
use std::fmt;

use ctp7_lib::RpcError;

/// Failures of the physical access path and of the
/// masked/typed register access built on top of it
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterError {
  /// The register name is not in the directory
  NotFound(String),
  /// Access mode not allowed by the register permissions
  PermissionDenied(String),
  /// Block transfer overruns the declared size
  BlockSizeViolation(String),
  /// The device driver failed to transfer a word
  DeviceTransfer(String),
  /// Unable to map the memory device
  MMapFail(String),
  /// The hub semaphore was found in an invalid state
  SemaphoreCorruption(i32),
  /// Creating/acquiring/releasing the semaphore failed
  SemaphoreFailure(String),
  /// The directory could not be queried
  Directory(String),
  /// Word access at an address which is not a multiple of 4
  Unaligned(u32),
}

impl RegisterError {
  pub fn to_string(&self) -> String {
    match self {
      RegisterError::NotFound(name) => {
        return format!("Register {} not found", name);
      },
      RegisterError::PermissionDenied(msg) => {
        return format!("Permission denied: {}", msg);
      },
      RegisterError::BlockSizeViolation(msg) => {
        return format!("Block size violation: {}", msg);
      },
      RegisterError::DeviceTransfer(msg) => {
        return format!("memsvc error: {}", msg);
      },
      RegisterError::MMapFail(msg) => {
        return format!("Unable to map memory device: {}", msg);
      },
      RegisterError::SemaphoreCorruption(value) => {
        return format!("Invalid semaphore value = {}. Probably it was messed up by a dying process. Please clean up this semaphore (/dev/shm/sem.memhub)", value);
      },
      RegisterError::SemaphoreFailure(msg) => {
        return format!("Semaphore failure: {}", msg);
      },
      RegisterError::Directory(msg) => {
        return format!("Register directory failure: {}", msg);
      },
      RegisterError::Unaligned(address) => {
        return format!("Address {:#010x} is not word aligned", address);
      },
    }
  }
}

impl fmt::Display for RegisterError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let repr = self.to_string();
    write!(f, "<RegisterError: {}>", repr)
  }
}

impl Error for RegisterError {
}

/// Failures of the persistent register directory
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryError {
  /// The store could not be opened or created
  Open(String),
  /// A query against the store failed
  Query(String),
  /// No descriptor with this name
  NotFound(String),
  /// The stored value does not decode as a descriptor
  MalformedDescriptor(String),
  /// The store hit its maximum size during a rebuild
  SizeCeiling(u64),
  /// The address table description could not be parsed
  AddressTable(String),
}

impl DirectoryError {
  pub fn to_string(&self) -> String {
    match self {
      DirectoryError::Open(msg)                => {return format!("Unable to open register store: {}", msg);},
      DirectoryError::Query(msg)               => {return format!("Register store query failed: {}", msg);},
      DirectoryError::NotFound(name)           => {return format!("Register {} not found", name);},
      DirectoryError::MalformedDescriptor(val) => {return format!("Malformed register descriptor '{}'", val);},
      DirectoryError::SizeCeiling(mb)          => {return format!("Register store exceeds its maximum size of {} MiB", mb);},
      DirectoryError::AddressTable(msg)        => {return format!("XML parser failed: {}", msg);},
    }
  }
}

impl fmt::Display for DirectoryError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let repr = self.to_string();
    write!(f, "<DirectoryError: {}>", repr)
  }
}

impl Error for DirectoryError {
}

impl From<DirectoryError> for RegisterError {
  fn from(err : DirectoryError) -> Self {
    match &err {
      DirectoryError::NotFound(name) => RegisterError::NotFound(name.clone()),
      _                              => RegisterError::Directory(err.to_string()),
    }
  }
}

/// Everything a module entry point can report back
/// to the caller
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleError {
  Register(RegisterError),
  Directory(DirectoryError),
  Request(RpcError),
  /// Firmware major version not supported by the operation
  VersionMismatch(String),
  /// Requested lanes are not link synchronized
  NotSynchronized(String),
  /// Bounded poll ran out of iterations
  MeasurementTimeout(String),
  /// A parameter is out of its allowed range
  InvalidParameter(String),
  /// Result would exceed the transport size ceiling
  SizeLimit(String),
  /// The firmware scan controller refused the request
  ScanController(String),
}

impl ModuleError {
  pub fn to_string(&self) -> String {
    match self {
      ModuleError::Register(err)           => {return err.to_string();},
      ModuleError::Directory(err)          => {return err.to_string();},
      ModuleError::Request(err)            => {return format!("Malformed request: {}", err.to_string());},
      ModuleError::VersionMismatch(msg)    => {return msg.clone();},
      ModuleError::NotSynchronized(msg)    => {return msg.clone();},
      ModuleError::MeasurementTimeout(msg) => {return format!("Measurement timed out: {}", msg);},
      ModuleError::InvalidParameter(msg)   => {return msg.clone();},
      ModuleError::SizeLimit(msg)          => {return msg.clone();},
      ModuleError::ScanController(msg)     => {return msg.clone();},
    }
  }
}

impl fmt::Display for ModuleError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let repr = self.to_string();
    write!(f, "<ModuleError: {}>", repr)
  }
}

impl Error for ModuleError {
}

impl From<RegisterError> for ModuleError {
  fn from(err : RegisterError) -> Self {
    ModuleError::Register(err)
  }
}

impl From<DirectoryError> for ModuleError {
  fn from(err : DirectoryError) -> Self {
    ModuleError::Directory(err)
  }
}

impl From<RpcError> for ModuleError {
  fn from(err : RpcError) -> Self {
    ModuleError::Request(err)
  }
}
