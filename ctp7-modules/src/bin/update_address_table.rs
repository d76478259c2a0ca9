//! Rebuild the register store from an address table
//!
//! Parses the XML address table and replaces the
//! whole content of the store in $GEM_PATH (or the
//! store given by the settings).

use std::process::exit;

#[macro_use] extern crate log;

use clap::Parser;

use indicatif::{
    ProgressBar,
    ProgressStyle,
};

use ctp7_lib::{
    init_env_logger,
    Ctp7Settings,
};

use ctp7_modules::addrtable::parse_address_table;
use ctp7_modules::directory::RegisterDirectory;

#[derive(Parser, Debug)]
#[command(author = "GEM DAQ", version, about, long_about = None)]
struct Args {
  /// The XML address table, e.g. gem_amc_top.xml
  address_table : String,
  /// A .toml file with the service settings
  #[arg(short, long)]
  config        : Option<String>,
  /// Write the store here instead of the location
  /// from the settings
  #[arg(short, long)]
  output        : Option<String>,
  /// Show a progress bar while writing
  #[arg(long, default_value_t = false)]
  show_progress : bool,
}

fn main() {
  init_env_logger();
  let args = Args::parse();
  let settings = match &args.config {
    None         => Ctp7Settings::new(),
    Some(config) => {
      match Ctp7Settings::from_toml(config.clone()) {
        Err(err) => {
          error!("Unable to load settings from {}! {}", config, err);
          exit(1);
        }
        Ok(settings) => settings
      }
    }
  };
  let store = match &args.output {
    Some(output) => output.clone(),
    None         => settings.address_table_path().to_string_lossy().to_string(),
  };

  let descriptors = match parse_address_table(&args.address_table) {
    Err(err) => {
      error!("Unable to parse {}! {}", args.address_table, err);
      exit(1);
    }
    Ok(descriptors) => descriptors
  };
  println!("=> Found {} registers in {}", descriptors.len(), args.address_table);

  let mut directory = match RegisterDirectory::open(&store, settings.map_size_mb) {
    Err(err) => {
      error!("Unable to open the register store {}! {}", store, err);
      exit(1);
    }
    Ok(directory) => directory
  };

  let bar_template : &str = "[{elapsed_precise}] {prefix} {msg} {spinner} {bar:60.blue/grey} {pos:>7}/{len:7}";
  let mut bar = ProgressBar::hidden();
  if args.show_progress {
    bar = ProgressBar::new(descriptors.len() as u64);
    bar.set_position(0);
    bar.set_message(String::from("Writing registers"));
    match ProgressStyle::with_template(bar_template) {
      Err(err)  => warn!("Unable to set progressbar style! {err}"),
      Ok(style) => bar.set_style(style),
    }
  }
  match directory.rebuild_with_progress(&descriptors, |n| bar.set_position(n as u64)) {
    Err(err) => {
      bar.abandon();
      error!("Rebuilding {} failed! {}", store, err);
      exit(1);
    }
    Ok(n_regs) => {
      bar.finish_and_clear();
      println!("=> Wrote {} registers to {}", n_regs, store);
    }
  }
}
