use std::thread;
use std::sync::{
    Arc,
    Mutex,
};
use std::os::raw::c_int;
use std::time::Duration;

use colored::Colorize;

use signal_hook::iterator::Signals;
use signal_hook::consts::signal::{
    SIGTERM,
    SIGINT,
};

use ctp7_lib::thread_control::ThreadControl;

/// Handle incoming POSIX signals and set the stop
/// flag, so the rpc server can finish the request
/// it is working on and shut down.
pub fn signal_handler(thread_control : Arc<Mutex<ThreadControl>>) {
  let sleep_time  = Duration::from_millis(300);
  let mut signals = match Signals::new([SIGTERM, SIGINT]) {
    Err(err) => {
      error!("Unable to install signal handler! {err}");
      return;
    }
    Ok(signals) => signals
  };
  'main: loop {
    thread::sleep(sleep_time);
    for signal in signals.pending() {
      match signal as c_int {
        SIGTERM | SIGINT => {
          println!("=> {}", String::from("SIGTERM or SIGINT received. Commencing shutdown!").red().bold());
          match thread_control.lock() {
            Ok(mut tc) => {
              tc.stop_flag = true;
            }
            Err(err) => {
              error!("Can't acquire lock for ThreadControl! {err}");
            }
          }
          break 'main;
        }
        _ => {
          error!("Received signal {}, but there are no instructions what to do about it!", signal);
        }
      }
    }
  }
}
