//! Mediated access to the shared register space
//!
//! Several processes on the board talk to the same
//! hardware. Every word transfer is wrapped into a
//! critical section guarded by a named POSIX semaphore,
//! so at most one transfer is in flight at any time,
//! across all processes.
//!
//! If the process gets killed while it holds the
//! semaphore, the termination handler gives it back
//! before exiting. Otherwise every other process on
//! the board would deadlock on its next access.

use std::ffi::CString;
use std::io;
use std::sync::{
    Arc,
    Mutex,
};
use std::sync::atomic::{
    AtomicBool,
    Ordering,
};

use signal_hook::SigId;
use signal_hook::consts::signal::{
    SIGABRT,
    SIGINT,
    SIGTERM,
};

use crate::errors::RegisterError;
use crate::memory::MemoryDevice;

/// Owner read/write, group read/write
const SEM_PERMS : libc::c_uint = 0o660;
const SEM_INIT  : libc::c_uint = 1;

/// The signals we try to survive with a
/// consistent semaphore. SIGSEGV, SIGILL and SIGFPE
/// can not be hooked safely and are left alone.
const GUARDED_SIGNALS : [libc::c_int;3] = [SIGABRT, SIGINT, SIGTERM];

/// State shared with the termination handlers
struct HubState {
  sem  : *mut libc::sem_t,
  busy : AtomicBool,
}

// sem_t is designed to be used from several threads
// (and processes), the pointer itself is never changed
// after open
unsafe impl Send for HubState {}
unsafe impl Sync for HubState {}

impl HubState {
  fn value(&self) -> Result<i32, RegisterError> {
    let mut value : libc::c_int = 0;
    let rc = unsafe { libc::sem_getvalue(self.sem, &mut value) };
    if rc != 0 {
      return Err(RegisterError::SemaphoreFailure(format!("sem_getvalue: {}", io::Error::last_os_error())));
    }
    Ok(value)
  }

  /// Runs in signal context. Only async-signal-safe
  /// calls in here!
  fn on_termination(&self) {
    if !self.busy.load(Ordering::SeqCst) {
      return;
    }
    let mut value : libc::c_int = 0;
    unsafe {
      libc::sem_getvalue(self.sem, &mut value);
      if value == 0 {
        libc::sem_post(self.sem);
      }
    }
    signal_hook::low_level::exit(1);
  }
}

/// A single critical section. The semaphore
/// is given back when this goes out of scope,
/// also when unwinding.
struct Transaction<'a> {
  state : &'a HubState,
}

impl Drop for Transaction<'_> {
  fn drop(&mut self) {
    self.state.busy.store(false, Ordering::SeqCst);
    unsafe {
      libc::sem_post(self.state.sem);
    }
  }
}

/// The process wide handle to the register space
///
/// Construct once at startup and pass it by reference
/// to everything which needs physical access.
pub struct MemHub {
  pub name   : String,
  state      : Arc<HubState>,
  device     : Arc<dyn MemoryDevice>,
  last_error : Mutex<String>,
  sig_ids    : Vec<SigId>,
  closed     : bool,
}

impl MemHub {
  /// Open (create if necessary) the semaphore and
  /// install the termination handlers.
  ///
  /// # Arguments
  ///
  /// * name   : name of the POSIX semaphore, e.g. "/memhub"
  /// * device : the register space all transfers go to
  ///
  /// A semaphore value > 1 means that somebody messed
  /// with it. This is fatal, we refuse to open.
  pub fn open(name : &str, device : Arc<dyn MemoryDevice>) -> Result<MemHub, RegisterError> {
    let c_name = CString::new(name)
      .map_err(|e| RegisterError::SemaphoreFailure(format!("Invalid semaphore name {}: {}", name, e)))?;
    let sem = unsafe { libc::sem_open(c_name.as_ptr(), libc::O_CREAT, SEM_PERMS, SEM_INIT) };
    if sem == libc::SEM_FAILED {
      let err = io::Error::last_os_error();
      error!("sem_open({}) failed! {}", name, err);
      return Err(RegisterError::SemaphoreFailure(format!("sem_open({}): {}", name, err)));
    }
    let state = Arc::new(HubState {
      sem,
      busy : AtomicBool::new(false),
    });
    let value = match state.value() {
      Ok(v)    => v,
      Err(err) => {
        unsafe { libc::sem_close(sem); }
        return Err(err);
      }
    };
    if value > 1 {
      error!("{}", RegisterError::SemaphoreCorruption(value));
      unsafe { libc::sem_close(sem); }
      return Err(RegisterError::SemaphoreCorruption(value));
    }
    info!("Memhub initialized semaphore {}. Current semaphore value = {}", name, value);
    let mut sig_ids = Vec::<SigId>::new();
    for sig in GUARDED_SIGNALS {
      let handler_state = Arc::clone(&state);
      let registered = unsafe {
        signal_hook::low_level::register(sig, move || handler_state.on_termination())
      };
      match registered {
        Ok(id)   => sig_ids.push(id),
        Err(err) => {
          warn!("Unable to install termination handler for signal {}! {}", sig, err);
        }
      }
    }
    Ok(MemHub {
      name       : String::from(name),
      state,
      device,
      last_error : Mutex::new(String::new()),
      sig_ids,
      closed     : false,
    })
  }

  fn begin(&self) -> Result<Transaction<'_>, RegisterError> {
    loop {
      let rc = unsafe { libc::sem_wait(self.state.sem) };
      if rc == 0 {
        break;
      }
      let err = io::Error::last_os_error();
      if err.kind() == io::ErrorKind::Interrupted {
        continue;
      }
      return Err(RegisterError::SemaphoreFailure(format!("sem_wait: {}", err)));
    }
    self.state.busy.store(true, Ordering::SeqCst);
    Ok(Transaction { state : &self.state })
  }

  fn record(&self, result : Result<(), RegisterError>) -> Result<(), RegisterError> {
    if let Err(ref err) = result {
      if let Ok(mut last) = self.last_error.lock() {
        *last = err.to_string();
      }
    }
    result
  }

  /// Read data.len() consecutive words in one critical section
  pub fn read(&self, address : u32, data : &mut [u32]) -> Result<(), RegisterError> {
    let result = {
      let _tx = self.begin()?;
      self.device.read(address, data)
    };
    self.record(result)
  }

  /// Write consecutive words in one critical section
  pub fn write(&self, address : u32, data : &[u32]) -> Result<(), RegisterError> {
    let result = {
      let _tx = self.begin()?;
      self.device.write(address, data)
    };
    self.record(result)
  }

  /// The message of the most recent failed transfer
  pub fn last_error(&self) -> String {
    match self.last_error.lock() {
      Ok(last) => last.clone(),
      Err(_)   => String::from("unknown")
    }
  }

  /// Current value of the semaphore
  pub fn semaphore_value(&self) -> Result<i32, RegisterError> {
    self.state.value()
  }

  /// Give up the semaphore handle. The semaphore
  /// itself survives, other processes may use it.
  pub fn close(mut self) {
    self.release();
  }

  fn release(&mut self) {
    if self.closed {
      return;
    }
    for id in self.sig_ids.drain(..) {
      signal_hook::low_level::unregister(id);
    }
    unsafe {
      libc::sem_close(self.state.sem);
    }
    self.closed = true;
    debug!("Closed semaphore {}", self.name);
  }
}

impl Drop for MemHub {
  fn drop(&mut self) {
    self.release();
  }
}

/// Remove a named semaphore from the system.
///
/// Only for cleaning up after tests or after a
/// corrupted semaphore was reported.
pub fn unlink_semaphore(name : &str) -> Result<(), RegisterError> {
  let c_name = CString::new(name)
    .map_err(|e| RegisterError::SemaphoreFailure(e.to_string()))?;
  let rc = unsafe { libc::sem_unlink(c_name.as_ptr()) };
  if rc != 0 {
    return Err(RegisterError::SemaphoreFailure(format!("sem_unlink({}): {}", name, io::Error::last_os_error())));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::memory::SimulatedDevice;

  fn unique_name(tag : &str) -> String {
    format!("/ctp7-test-{}-{}", tag, std::process::id())
  }

  #[test]
  fn transfers_leave_semaphore_free() {
    let name = unique_name("free");
    let dev  = Arc::new(SimulatedDevice::new());
    let hub  = MemHub::open(&name, dev.clone()).unwrap();
    hub.write(0x40, &[7, 8]).unwrap();
    let mut data = [0u32; 2];
    hub.read(0x40, &mut data).unwrap();
    assert_eq!(data, [7, 8]);
    assert_eq!(hub.semaphore_value().unwrap(), 1);
    hub.close();
    unlink_semaphore(&name).unwrap();
  }

  #[test]
  fn failed_transfer_sets_last_error() {
    let name = unique_name("lasterr");
    let dev  = Arc::new(SimulatedDevice::new());
    dev.fail_at(0x80);
    let hub  = MemHub::open(&name, dev).unwrap();
    assert!(hub.read(0x80, &mut [0u32;1]).is_err());
    assert!(hub.last_error().contains("0x00000080"));
    // semaphore was given back
    assert_eq!(hub.semaphore_value().unwrap(), 1);
    drop(hub);
    unlink_semaphore(&name).unwrap();
  }

  #[test]
  fn corrupted_semaphore_is_fatal() {
    let name = unique_name("corrupt");
    let dev  = Arc::new(SimulatedDevice::new());
    let hub  = MemHub::open(&name, dev.clone()).unwrap();
    // somebody posts without holding it
    unsafe { libc::sem_post(hub.state.sem); }
    hub.close();
    match MemHub::open(&name, dev) {
      Err(RegisterError::SemaphoreCorruption(v)) => assert_eq!(v, 2),
      _ => panic!("corruption was not detected"),
    }
    unlink_semaphore(&name).unwrap();
  }
}
