use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{
    AtomicUsize,
    Ordering,
};
use std::thread;
use std::time::Duration;

use ctp7_lib::{
    Ctp7Settings,
    ModuleManager,
    RpcMessage,
};
use ctp7_lib::constants::ALL_VFATS_BITS;

use ctp7_modules::calibration::sbit_monitor::{
    SbitCluster,
    CLUSTERS_PER_READOUT,
    SBIT_MONITOR,
};
use ctp7_modules::calibration::sbit_rate::SINGLE_VFAT_MASKS;
use ctp7_modules::directory::{
    AccessMode,
    Permissions,
    RegisterDescriptor,
    RegisterDirectory,
};
use ctp7_modules::errors::{
    DirectoryError,
    ModuleError,
};
use ctp7_modules::extras::MAX_REQUEST_WORDS;
use ctp7_modules::gbt::N_PHASES;
use ctp7_modules::memhub::{
    unlink_semaphore,
    MemHub,
};
use ctp7_modules::memory::SimulatedDevice;
use ctp7_modules::registers::RegisterName;
use ctp7_modules::service::{
    register_all_modules,
    ModuleEnv,
};
use ctp7_modules::utils::{
    FW_MAJOR_REG,
    NUM_OF_OH_REG,
};

static N_BENCHES : AtomicUsize = AtomicUsize::new(0);

const SCAN_REG : &str = "CFG_THR_ARM_DAC";

/// A register store in a scratch directory, a simulated
/// register space behind its own semaphore and all
/// modules registered
struct Bench {
  _dir      : tempfile::TempDir,
  sem_name  : String,
  device    : Arc<SimulatedDevice>,
  env       : ModuleEnv,
  mgr       : ModuleManager<ModuleEnv>,
  addresses : HashMap<String, u32>,
}

impl Bench {
  fn new(device : SimulatedDevice, descriptors : Vec<RegisterDescriptor>) -> Self {
    let dir      = tempfile::tempdir().unwrap();
    let sem_name = format!("/ctp7-test-{}-{}", std::process::id(), N_BENCHES.fetch_add(1, Ordering::SeqCst));
    let mut settings = Ctp7Settings::new();
    settings.gem_path            = dir.path().to_string_lossy().to_string();
    settings.semaphore_name      = sem_name.clone();
    settings.poll_interval_us    = 10;
    settings.max_poll_iterations = 1000;
    let device = Arc::new(device);
    let hub    = MemHub::open(&sem_name, device.clone()).unwrap();
    let env    = ModuleEnv::new(hub, settings);
    env.directory().rebuild(&descriptors).unwrap();
    let mut mgr = ModuleManager::<ModuleEnv>::new();
    register_all_modules(&mut mgr);
    let addresses = descriptors.iter().map(|d| (d.name.clone(), d.address)).collect();
    Self {
      _dir : dir,
      sem_name,
      device,
      env,
      mgr,
      addresses,
    }
  }

  fn address(&self, name : &str) -> u32 {
    *self.addresses.get(name).unwrap()
  }

  fn preset(&self, name : &str, value : u32) {
    self.device.preset(self.address(name), value);
  }

  fn call(&self, module : &str, method : &str, params : &str) -> RpcMessage {
    let request = RpcMessage::from_json(params).unwrap();
    self.mgr.dispatch(&self.env, module, method, &request)
  }
}

impl Drop for Bench {
  fn drop(&mut self) {
    let _ = unlink_semaphore(&self.sem_name);
  }
}

/// Full word registers at consecutive addresses,
/// starting with the firmware version
fn registers(names : &[String]) -> Vec<RegisterDescriptor> {
  let mut all = vec![String::from(FW_MAJOR_REG)];
  all.extend(names.iter().cloned());
  all.iter()
    .enumerate()
    .map(|(k, name)| RegisterDescriptor::new(name, 0x6500_0000 + 4 * k as u32, 0xffff_ffff))
    .collect()
}

fn sync_registers(oh : u32) -> Vec<String> {
  (0..24).map(|v| RegisterName::vfat_link(oh, v, "SYNC_ERR_CNT").to_string()).collect()
}

fn v3_bench(names : Vec<String>) -> Bench {
  let bench = Bench::new(SimulatedDevice::new(), registers(&names));
  bench.preset(FW_MAJOR_REG, 3);
  bench
}

fn gen_scan_registers() -> Vec<String> {
  let mut names = sync_registers(0);
  for field in ["ENABLE", "RESET", "OH_SELECT", "VFAT_CHANNEL_GLOBAL_OR", "VFAT_CHANNEL_SELECT"] {
    names.push(format!("GEM_AMC.GEM_TESTS.VFAT_DAQ_MONITOR.CTRL.{}", field));
  }
  for field in ["ENABLE", "RESET", "CYCLIC_L1A_GAP", "CYCLIC_CALPULSE_TO_L1A_GAP",
                "CYCLIC_L1A_COUNT", "CYCLIC_START", "CYCLIC_RUNNING"] {
    names.push(format!("GEM_AMC.TTC.GENERATOR.{}", field));
  }
  for v in 0..24 {
    names.push(RegisterName::vfat(0, v, SCAN_REG).to_string());
    names.push(format!("GEM_AMC.GEM_TESTS.VFAT_DAQ_MONITOR.VFAT{}.CHANNEL_FIRE_COUNT", v));
  }
  names
}

#[test]
fn directory_round_trip() {
  let mut block = RegisterDescriptor::new("GEM_AMC.CONFIG_BLASTER.RAM.GBT", 0x6600_0000, 0xffff_ffff);
  block.mode        = AccessMode::Block;
  block.size        = 3 * 92;
  let mut status    = RegisterDescriptor::new("GEM_AMC.DAQ.STATUS.DAQ_LINK_RDY", 0x6600_1000, 0x1);
  status.permissions = Permissions::READ;
  let bench = Bench::new(SimulatedDevice::new(), vec![block.clone(), status.clone()]);
  let mut dir = bench.env.directory();
  assert_eq!(dir.len().unwrap(), 2);
  assert_eq!(dir.lookup(&block.name).unwrap(), block);
  assert_eq!(dir.lookup(&status.name).unwrap(), status);
  assert!(dir.lookup("GEM_AMC.NOT.THERE").is_err());

  dir.rebuild(&[]).unwrap();
  assert!(dir.is_empty().unwrap());
  assert!(dir.lookup(&block.name).is_err());
  assert!(dir.lookup(&status.name).is_err());
}

#[test]
fn masked_write_then_read() {
  let bench = Bench::new(SimulatedDevice::new(), vec![RegisterDescriptor::new("X.Y.Z", 0x100, 0xff)]);
  let mut response = RpcMessage::new();
  {
    let mut la = bench.env.context(&mut response).unwrap();
    la.write_reg("X.Y.Z", 0x1ff).unwrap();
    assert_eq!(la.read_reg("X.Y.Z"), 0xff);
    assert_eq!(la.read_reg("X.Y.NOPE"), 0xdead_dead);
  }
  assert_eq!(bench.device.peek(0x100), 0xff);
  assert!(response.error().unwrap().contains("X.Y.NOPE"));
}

#[test]
fn mediator_serializes_transfers() {
  let bench = Bench::new(SimulatedDevice::with_latency(Duration::from_micros(200)), vec![]);
  let hub   = &bench.env.hub;
  thread::scope(|s| {
    for t in 0..8u32 {
      s.spawn(move || {
        let address = 0x6700_0000 + 4 * t;
        for i in 0..10u32 {
          hub.write(address, &[i]).unwrap();
          let mut data = [0u32; 1];
          hub.read(address, &mut data).unwrap();
          assert_eq!(data[0], i);
        }
      });
    }
  });
  assert_eq!(bench.device.max_in_flight(), 1);
  assert_eq!(bench.device.n_reads(), 80);
  assert_eq!(hub.semaphore_value().unwrap(), 1);
}

#[test]
fn scan_aborts_on_unsynchronized_vfat() {
  let bench = v3_bench(gen_scan_registers());
  bench.preset(&RegisterName::vfat_link(0, 2, "SYNC_ERR_CNT").to_string(), 5);
  // only VFAT 2 is unmasked
  let response = bench.call("calibration", "genScan",
    r#"{"ohN": 0, "mask": 16777211, "nevts": 100, "dacMin": 0, "dacMax": 10, "scanReg": "CFG_THR_ARM_DAC"}"#);
  assert!(response.error().unwrap().contains("not Synced"));
  assert!(!response.get_key_exists("data"));
  assert!(bench.device.writes().is_empty());
}

#[test]
fn gen_scan_packing() {
  let bench = v3_bench(gen_scan_registers());
  // the hit counter of a VFAT follows its scan register
  for v in 0..24u32 {
    let scan_addr = bench.address(&RegisterName::vfat(0, v, SCAN_REG).to_string());
    let count     = bench.address(&format!("GEM_AMC.GEM_TESTS.VFAT_DAQ_MONITOR.VFAT{}.CHANNEL_FIRE_COUNT", v));
    bench.device.set_read_hook(count, Box::new(move |mem : &HashMap<u32, u32>, _address : u32| {
      mem.get(&scan_addr).copied().unwrap_or(0) * 10 + v
    }));
  }
  bench.preset(&RegisterName::vfat(0, 1, SCAN_REG).to_string(), 77);
  // VFATs 1 and 4 unmasked
  let mask : u32 = 0x00ff_ffff & !((1 << 1) | (1 << 4));
  let response = bench.call("calibration", "genScan",
    &format!(r#"{{"ohN": 0, "mask": {}, "nevts": 10, "dacMin": 0, "dacMax": 4, "dacStep": 2, "scanReg": "{}"}}"#, mask, SCAN_REG));
  assert!(!response.has_error(), "{}", response);
  let data = response.get_word_array("data").unwrap();
  let points = 3;
  assert_eq!(data.len(), 2 * points);
  for (pos, vfat) in [1u32, 4].iter().enumerate() {
    for k in 0..points {
      let dac = 2 * k as u32;
      assert_eq!(data[pos * points + k], dac * 10 + vfat);
    }
  }
  // the scan register is back at its value from before the scan
  assert_eq!(bench.device.peek(bench.address(&RegisterName::vfat(0, 1, SCAN_REG).to_string())), 77);
  assert!(bench.device.writes_to(bench.address(&RegisterName::vfat(0, 2, SCAN_REG).to_string())).is_empty());
}

#[test]
fn sbit_readout_of_invalid_clusters() {
  let mut names = vec![format!("{}.OH_SELECT", SBIT_MONITOR),
                       format!("{}.RESET", SBIT_MONITOR),
                       format!("{}.L1A_DELAY", SBIT_MONITOR)];
  for slot in 0..CLUSTERS_PER_READOUT {
    names.push(format!("{}.CLUSTER{}", SBIT_MONITOR, slot));
  }
  let bench = v3_bench(names);
  bench.preset(&format!("{}.OH_SELECT", SBIT_MONITOR), 7);
  bench.preset(&format!("{}.L1A_DELAY", SBIT_MONITOR), 0x30);
  for slot in 0..CLUSTERS_PER_READOUT {
    // address 2000, size 1
    bench.preset(&format!("{}.CLUSTER{}", SBIT_MONITOR, slot), (1 << 12) | 2000);
  }
  let response = bench.call("calibration", "sbitReadOut", r#"{"ohN": 2, "acquireTime": 1}"#);
  assert!(!response.has_error(), "{}", response);
  let stored = response.get_word_array("storedSbits").unwrap();
  assert!(!stored.is_empty());
  assert_eq!(stored.len() % CLUSTERS_PER_READOUT, 0);
  for word in stored {
    let cluster = SbitCluster::unpack(word);
    assert!(!cluster.is_valid());
    assert_eq!(cluster.l1a_delay, 0x30);
  }
  assert!(bench.device.writes_to(bench.address(&format!("{}.OH_SELECT", SBIT_MONITOR))).contains(&2));
  assert_eq!(bench.device.peek(bench.address(&format!("{}.OH_SELECT", SBIT_MONITOR))), 7);
}

#[test]
fn parallel_sbit_rate_scan() {
  let mut names = sync_registers(0);
  names.push(RegisterName::oh_trigger(0, "CTRL.VFAT_MASK").to_string());
  names.push(RegisterName::oh_trigger(0, "CNT.RESET").to_string());
  names.push(RegisterName::oh_trigger(0, "CNT.CLUSTER_COUNT").to_string());
  for v in 0..24 {
    names.push(RegisterName::oh_trigger(0, &format!("CNT.VFAT{}_SBITS", v)).to_string());
    names.push(RegisterName::vfat(0, v, SCAN_REG).to_string());
  }
  let bench = v3_bench(names);
  bench.preset(&RegisterName::oh_trigger(0, "CTRL.VFAT_MASK").to_string(), 0x00ab_cdef);
  bench.preset(&RegisterName::oh_trigger(0, "CNT.CLUSTER_COUNT").to_string(), 42);
  for v in 0..24 {
    bench.preset(&RegisterName::oh_trigger(0, &format!("CNT.VFAT{}_SBITS", v)).to_string(), 100 + v);
  }
  // VFATs 0 and 3 unmasked
  let mask : u32 = 0x00ff_ffff & !((1 << 0) | (1 << 3));
  let response = bench.call("calibration", "sbitRateScan",
    &format!(r#"{{"ohN": 0, "maskOh": {}, "dacMin": 10, "dacMax": 12, "dacStep": 1, "scanReg": "{}", "isParallel": true}}"#, mask, SCAN_REG));
  assert!(!response.has_error(), "{}", response);
  assert_eq!(response.get_word_array("outDataDacValue").unwrap(), vec![10, 11, 12]);
  assert_eq!(response.get_word_array("outDataCTP7Rate").unwrap(), vec![42, 42, 42]);
  let per_vfat = response.get_word_array("outDataVFATRate").unwrap();
  assert_eq!(per_vfat.len(), 24 * 3);
  for v in 0..24u32 {
    let expected = if v == 0 || v == 3 { 100 + v } else { 0 };
    for k in 0..3 {
      assert_eq!(per_vfat[v as usize * 3 + k], expected);
    }
    let writes = bench.device.writes_to(bench.address(&RegisterName::vfat(0, v, SCAN_REG).to_string()));
    if v == 0 || v == 3 {
      assert_eq!(&writes[..3], &[10, 11, 12]);
    } else {
      assert!(writes.is_empty());
    }
  }
  let vfat_mask = bench.address(&RegisterName::oh_trigger(0, "CTRL.VFAT_MASK").to_string());
  assert_eq!(bench.device.writes_to(vfat_mask)[0], mask);
  assert_eq!(bench.device.peek(vfat_mask), 0x00ab_cdef);
}

#[test]
fn daq_run_parameters() {
  // the three run parameters share a word
  let word = 0x6800_0000;
  let mut descriptors = registers(&[]);
  for (n, mask) in [(1, 0x0000_00ff), (2, 0x0000_ff00), (3, 0x00ff_0000)] {
    descriptors.push(RegisterDescriptor::new(&format!("GEM_AMC.DAQ.EXT_CONTROL.RUN_PARAM{}", n), word, mask));
  }
  let bench = Bench::new(SimulatedDevice::new(), descriptors);
  bench.device.preset(word, 0x00aa_00bb);

  let response = bench.call("daq", "setDAQLinkRunParameter", r#"{"parN": 4, "rparam": 1}"#);
  assert!(response.error().unwrap().contains("outside expectation"));
  let response = bench.call("daq", "setDAQLinkRunParameter", r#"{"parN": 0, "rparam": 1}"#);
  assert!(response.has_error());
  assert!(bench.device.writes().is_empty());

  let response = bench.call("daq", "setDAQLinkRunParameter", r#"{"parN": 2, "rparam": 18}"#);
  assert!(!response.has_error(), "{}", response);
  assert_eq!(bench.device.peek(word), 0x00aa_12bb);
}

#[test]
fn sca_command_write_sequence() {
  let fields = ["LINK_ENABLE_MASK", "SCA_CMD.SCA_CMD_CHANNEL", "SCA_CMD.SCA_CMD_COMMAND",
                "SCA_CMD.SCA_CMD_LENGTH", "SCA_CMD.SCA_CMD_DATA", "SCA_CMD.SCA_CMD_EXECUTE"];
  let names : Vec<String> = fields.iter()
    .map(|f| format!("GEM_AMC.SLOW_CONTROL.SCA.MANUAL_CONTROL.{}", f))
    .collect();
  let bench = v3_bench(names.clone());
  let response = bench.call("sca", "sendSCACommand",
    r#"{"ch": 2, "cmd": 16, "len": 4, "data": 287454020, "ohMask": 5}"#);
  assert!(!response.has_error(), "{}", response);
  let expected : Vec<(u32, u32)> = names.iter()
    .map(|n| bench.address(n))
    .zip([0x5, 0x2, 0x10, 0x4, 0x4433_2211, 0x1])
    .collect();
  assert_eq!(bench.device.writes(), expected);

  let response = bench.call("sca", "sendSCACommand", r#"{"ch": 300, "cmd": 16, "len": 4, "data": 0}"#);
  assert!(response.has_error());
}

#[test]
fn unknown_methods_and_malformed_requests() {
  let bench = v3_bench(vec![]);
  let response = ctp7_modules::threads::handle_request(&bench.mgr, &bench.env, br#"{"module": "vfat3", "method": "noSuchScan"}"#);
  assert!(response.error().unwrap().contains("vfat3.noSuchScan"));
  let response = ctp7_modules::threads::handle_request(&bench.mgr, &bench.env, b"not json");
  assert!(response.has_error());
  let response = ctp7_modules::threads::handle_request(&bench.mgr, &bench.env,
    br#"{"module": "calibration", "method": "genScan", "params": {"ohN": 0}}"#);
  assert!(response.error().unwrap().contains("KeyNotFound"));
}

#[test]
fn store_keeps_its_content_at_the_size_ceiling() {
  let dir   = tempfile::tempdir().unwrap();
  let path  = dir.path().join("address_table.db");
  let mut store = RegisterDirectory::open(&path.to_string_lossy(), 1).unwrap();
  let keep  = RegisterDescriptor::new("KEEP.ME", 0x100, 0xff);
  store.rebuild(&[keep.clone()]).unwrap();

  // several MiB of names
  let huge : Vec<RegisterDescriptor> = (0..40_000u32)
    .map(|k| RegisterDescriptor::new(
      &format!("GEM_AMC.OH.OH0.GEB.VFAT0.VFAT_CHANNELS.SOME_RATHER_LONG_NAME_OF_A_REGISTER.CHANNEL{}", k),
      0x6500_0000 + 4 * k,
      0xffff_ffff))
    .collect();
  assert_eq!(store.rebuild(&huge), Err(DirectoryError::SizeCeiling(1)));
  assert_eq!(store.len().unwrap(), 1);
  assert_eq!(store.lookup("KEEP.ME").unwrap(), keep);
  assert!(store.lookup(&huge[0].name).is_err());
}

#[test]
fn polling_gives_up_after_max_iterations() {
  let running = String::from("GEM_AMC.TTC.GENERATOR.CYCLIC_RUNNING");
  let bench   = v3_bench(vec![running.clone()]);
  bench.preset(&running, 1);
  let mut response = RpcMessage::new();
  {
    let mut la = bench.env.context(&mut response).unwrap();
    let before = bench.device.n_reads();
    let result = la.poll_reg(&running, |value| value == 0);
    assert!(matches!(result, Err(ModuleError::MeasurementTimeout(_))), "{:?}", result);
    assert_eq!(bench.device.n_reads() - before, 1000);

    bench.preset(&running, 0);
    assert!(matches!(la.poll_reg(&running, |value| value == 0), Ok(0)));
  }
  assert!(!response.has_error());
}

#[test]
fn gen_scan_stops_on_stuck_trigger_generator() {
  let bench = v3_bench(gen_scan_registers());
  bench.preset("GEM_AMC.TTC.GENERATOR.CYCLIC_RUNNING", 1);
  bench.preset(&RegisterName::vfat(0, 2, SCAN_REG).to_string(), 33);
  let response = bench.call("calibration", "genScan",
    &format!(r#"{{"ohN": 0, "mask": {}, "nevts": 10, "dacMin": 0, "dacMax": 2, "scanReg": "{}"}}"#, SINGLE_VFAT_MASKS[2], SCAN_REG));
  assert!(response.error().unwrap().contains("Measurement timed out"), "{}", response);
  assert!(!response.get_key_exists("data"));
  assert_eq!(bench.device.peek(bench.address(&RegisterName::vfat(0, 2, SCAN_REG).to_string())), 33);
}

#[test]
fn gen_channel_scan_packing() {
  let mut names = gen_scan_registers();
  for v in [1u32, 4] {
    for ch in 0..128 {
      names.push(RegisterName::vfat_channel(0, v, ch, "MASK").to_string());
    }
  }
  let bench  = v3_bench(names);
  let select = bench.address("GEM_AMC.GEM_TESTS.VFAT_DAQ_MONITOR.CTRL.VFAT_CHANNEL_SELECT");
  for v in [1u32, 4] {
    let scan_addr = bench.address(&RegisterName::vfat(0, v, SCAN_REG).to_string());
    let count     = bench.address(&format!("GEM_AMC.GEM_TESTS.VFAT_DAQ_MONITOR.VFAT{}.CHANNEL_FIRE_COUNT", v));
    bench.device.set_read_hook(count, Box::new(move |mem : &HashMap<u32, u32>, _address : u32| {
      let ch  = mem.get(&select).copied().unwrap_or(0);
      let dac = mem.get(&scan_addr).copied().unwrap_or(0);
      ch * 1000 + dac * 10 + v
    }));
  }
  let mask : u32 = 0x00ff_ffff & !((1 << 1) | (1 << 4));
  let response = bench.call("calibration", "genChannelScan",
    &format!(r#"{{"ohN": 0, "mask": {}, "nevts": 10, "dacMin": 0, "dacMax": 4, "dacStep": 4, "scanReg": "{}"}}"#, mask, SCAN_REG));
  assert!(!response.has_error(), "{}", response);
  let data = response.get_word_array("data").unwrap();
  let (lanes, points) = (2, 2);
  assert_eq!(data.len(), 128 * lanes * points);
  for ch in 0..128u32 {
    for (pos, vfat) in [1u32, 4].iter().enumerate() {
      for k in 0..points {
        let dac = 4 * k as u32;
        assert_eq!(data[ch as usize * lanes * points + pos * points + k], ch * 1000 + dac * 10 + vfat);
      }
    }
  }
  // every channel mask was set while another channel was
  // scanned, and is unmasked again afterwards
  let mask_addr = bench.address(&RegisterName::vfat_channel(0, 4, 17, "MASK").to_string());
  assert!(bench.device.writes_to(mask_addr).contains(&1));
  assert_eq!(bench.device.peek(mask_addr), 0);
}

fn sbit_rate_registers() -> Vec<String> {
  let mut names = sync_registers(0);
  names.push(RegisterName::oh_trigger(0, "CTRL.VFAT_MASK").to_string());
  names.push(RegisterName::oh_trigger(0, "CNT.RESET").to_string());
  names.push(RegisterName::oh_trigger(0, "CNT.CLUSTER_COUNT").to_string());
  for v in 0..24 {
    names.push(RegisterName::vfat(0, v, SCAN_REG).to_string());
  }
  names
}

#[test]
fn serial_sbit_rate_scan() {
  let bench     = v3_bench(sbit_rate_registers());
  let vfat_mask = bench.address(&RegisterName::oh_trigger(0, "CTRL.VFAT_MASK").to_string());
  bench.preset(&RegisterName::oh_trigger(0, "CTRL.VFAT_MASK").to_string(), 0x00ab_cdef);
  bench.preset(&RegisterName::oh_trigger(0, "CNT.CLUSTER_COUNT").to_string(), 7);
  // VFAT 2 is not synchronized, VFAT 21 is
  bench.preset(&RegisterName::vfat_link(0, 2, "SYNC_ERR_CNT").to_string(), 3);

  // VFATs 0 and 3 unmasked
  let two_vfats : u32 = 0x00ff_ffff & !((1 << 0) | (1 << 3));
  let response = bench.call("calibration", "sbitRateScan",
    &format!(r#"{{"ohN": 0, "maskOh": {}, "dacMin": 5, "dacMax": 7, "scanReg": "{}", "waitTime": 20}}"#, two_vfats, SCAN_REG));
  assert!(response.error().unwrap().contains("exactly one VFAT"), "{}", response);
  assert!(bench.device.writes().is_empty());

  let response = bench.call("calibration", "sbitRateScan",
    &format!(r#"{{"ohN": 0, "maskOh": {}, "dacMin": 5, "dacMax": 7, "scanReg": "{}", "waitTime": 20}}"#, SINGLE_VFAT_MASKS[2], SCAN_REG));
  assert!(response.error().unwrap().contains("not Synced"), "{}", response);
  assert!(bench.device.writes().is_empty());

  // position 2 counted from the other end is VFAT 21
  let response = bench.call("calibration", "sbitRateScan",
    &format!(r#"{{"ohN": 0, "maskOh": {}, "dacMin": 5, "dacMax": 7, "scanReg": "{}", "waitTime": 20, "invertVFATPos": true}}"#,
             SINGLE_VFAT_MASKS[2], SCAN_REG));
  assert!(!response.has_error(), "{}", response);
  assert_eq!(response.get_word_array("outDataDacValue").unwrap(), vec![5, 6, 7]);
  // 7 clusters in 20 ms
  assert_eq!(response.get_word_array("outDataCTP7Rate").unwrap(), vec![350, 350, 350]);
  assert!(!response.get_key_exists("outDataVFATRate"));
  let scanned = bench.device.writes_to(bench.address(&RegisterName::vfat(0, 21, SCAN_REG).to_string()));
  assert_eq!(&scanned[..3], &[5, 6, 7]);
  assert!(bench.device.writes_to(bench.address(&RegisterName::vfat(0, 2, SCAN_REG).to_string())).is_empty());
  assert_eq!(bench.device.writes_to(bench.address(&RegisterName::oh_trigger(0, "CNT.RESET").to_string())).len(), 3);
  assert_eq!(bench.device.writes_to(vfat_mask)[0], SINGLE_VFAT_MASKS[21]);
  assert_eq!(bench.device.peek(vfat_mask), 0x00ab_cdef);
}

#[test]
fn gbt_phase_scan() {
  let mut names : Vec<String> = ["READ_WRITE_LENGTH", "GBTX_LINK_SELECT", "ADDRESS", "WRITE_DATA", "EXECUTE_WRITE"]
    .iter()
    .map(|f| format!("GEM_AMC.SLOW_CONTROL.IC.{}", f))
    .collect();
  names.push(String::from("GEM_AMC.GEM_SYSTEM.CTRL.LINK_RESET"));
  names.extend(sync_registers(0));
  for v in 0..24 {
    for field in ["CFG_RUN", "HW_ID_VER", "HW_ID"] {
      names.push(RegisterName::vfat(0, v, field).to_string());
    }
  }
  for counter in ["CNT_RESET", "CRC_ERROR_CNT", "PACKET_ERROR_CNT", "BITSTUFFING_ERROR_CNT",
                  "TIMEOUT_ERROR_CNT", "AXI_STROBE_ERROR_CNT", "TRANSACTION_CNT"] {
    names.push(format!("GEM_AMC.SLOW_CONTROL.VFAT3.{}", counter));
  }
  let bench = v3_bench(names);
  // the last value written to a GBTx is the current phase
  let phase = bench.address("GEM_AMC.SLOW_CONTROL.IC.WRITE_DATA");
  bench.device.set_read_hook(bench.address(&RegisterName::vfat_link(0, 7, "SYNC_ERR_CNT").to_string()),
    Box::new(move |mem : &HashMap<u32, u32>, _address : u32| {
      if mem.get(&phase) == Some(&4) { 0 } else { 1 }
    }));
  bench.device.set_read_hook(bench.address("GEM_AMC.SLOW_CONTROL.VFAT3.CRC_ERROR_CNT"),
    Box::new(move |mem : &HashMap<u32, u32>, _address : u32| {
      if mem.get(&phase) == Some(&5) { 2 } else { 0 }
    }));

  let response = bench.call("gbt", "scanGBTPhases",
    r#"{"ohN": 0, "nResets": 2, "phaseMin": 3, "phaseMax": 5, "phaseStep": 1, "nVerificationReads": 2}"#);
  assert!(!response.has_error(), "{}", response);
  let results = response.get_word_array("results").unwrap();
  assert_eq!(results.len(), 24 * N_PHASES);
  for v in 0..24usize {
    for p in 0..N_PHASES {
      let expected = match p {
        3 if v != 7 => 2,
        4           => 2,
        _           => 0,
      };
      assert_eq!(results[v * N_PHASES + p], expected, "VFAT {} phase {}", v, p);
    }
  }
  let mut vfat7 = vec![0u32; N_PHASES];
  vfat7[4] = 2;
  assert_eq!(response.get_word_array("OH0.VFAT7").unwrap(), vfat7);
  assert_eq!(bench.device.writes_to(bench.address("GEM_AMC.GEM_SYSTEM.CTRL.LINK_RESET")).len(), 6);

  let response = bench.call("gbt", "scanGBTPhases",
    r#"{"ohN": 0, "nResets": 1, "phaseMin": 3, "phaseMax": 16, "phaseStep": 1}"#);
  assert!(response.error().unwrap().contains("outside the range"), "{}", response);
}

#[test]
fn multilink_mask_skips_missing_optohybrids() {
  let mut names = vec![String::from(NUM_OF_OH_REG)];
  names.extend(sync_registers(0));
  names.extend(sync_registers(1));
  let bench = v3_bench(names);
  bench.preset(NUM_OF_OH_REG, 2);
  bench.preset(&RegisterName::vfat_link(1, 5, "SYNC_ERR_CNT").to_string(), 9);
  let response = bench.call("utils", "getOHVFATMaskMultiLink", "{}");
  assert!(!response.has_error(), "{}", response);
  let masks = response.get_word_array("ohVfatMaskArray").unwrap();
  assert_eq!(masks.len(), 12);
  assert_eq!(masks[0], 0);
  assert_eq!(masks[1], 1 << 5);
  assert!(masks[2..].iter().all(|m| *m == ALL_VFATS_BITS));
}

#[test]
fn raw_access_limits() {
  let bench  = v3_bench(vec![]);
  let reads  = bench.device.n_reads();
  let response = bench.call("memory", "mread",
    &format!(r#"{{"address": 1761607680, "count": {}}}"#, MAX_REQUEST_WORDS + 1));
  assert!(response.error().unwrap().contains("at most 16384"), "{}", response);
  let response = bench.call("extras", "blockread",
    &format!(r#"{{"address": 1761607680, "count": {}}}"#, MAX_REQUEST_WORDS + 1));
  assert!(response.has_error());

  let words : Vec<String> = (0..MAX_REQUEST_WORDS + 1).map(|k| k.to_string()).collect();
  let response = bench.call("memory", "mwrite",
    &format!(r#"{{"address": 1761607680, "data": [{}]}}"#, words.join(", ")));
  assert!(response.error().unwrap().contains("at most 16384"), "{}", response);

  // 0x69000002
  let response = bench.call("memory", "mwrite", r#"{"address": 1761607682, "data": [1, 2]}"#);
  assert!(response.error().unwrap().contains("not word aligned"), "{}", response);
  let response = bench.call("memory", "mread", r#"{"address": 1761607681, "count": 2}"#);
  assert!(response.error().unwrap().contains("not word aligned"), "{}", response);
  let response = bench.call("extras", "listread", r#"{"addresses": [1761607680, 1761607683], "count": 2}"#);
  assert!(response.error().unwrap().contains("not word aligned"), "{}", response);
  assert!(bench.device.writes().is_empty());
  assert_eq!(bench.device.n_reads(), reads);

  let response = bench.call("memory", "mwrite", r#"{"address": 1761607680, "data": [1, 2]}"#);
  assert!(!response.has_error(), "{}", response);
  let response = bench.call("memory", "mread", r#"{"address": 1761607680, "count": 2}"#);
  assert_eq!(response.get_word_array("data").unwrap(), vec![1, 2]);
}

#[test]
fn repeated_reads_add_up() {
  let mut names = vec![String::from("GEM_AMC.OH.OH0.GEB.VFAT3.HW_ID")];
  for counter in ["CNT_RESET", "CRC_ERROR_CNT", "PACKET_ERROR_CNT", "BITSTUFFING_ERROR_CNT",
                  "TIMEOUT_ERROR_CNT", "AXI_STROBE_ERROR_CNT", "TRANSACTION_CNT"] {
    names.push(format!("GEM_AMC.SLOW_CONTROL.VFAT3.{}", counter));
  }
  let bench = v3_bench(names);
  bench.preset("GEM_AMC.SLOW_CONTROL.VFAT3.CRC_ERROR_CNT", 1);
  bench.preset("GEM_AMC.SLOW_CONTROL.VFAT3.TRANSACTION_CNT", u32::MAX);

  let response = bench.call("utils", "repeatedRegRead",
    r#"{"reg_name": "GEM_AMC.OH.OH0.GEB.VFAT3.HW_ID", "breakOnFailure": false, "nReads": 3}"#);
  assert!(!response.has_error(), "{}", response);
  assert_eq!(response.get_word("CRC_ERROR_CNT").unwrap(), 3);
  assert_eq!(response.get_word("SUM").unwrap(), 3);
  assert_eq!(response.get_word("nTransactions").unwrap(), u32::MAX);
  let reset = bench.address("GEM_AMC.SLOW_CONTROL.VFAT3.CNT_RESET");
  assert_eq!(bench.device.writes_to(reset).len(), 3);

  let response = bench.call("utils", "repeatedRegRead",
    r#"{"reg_name": "GEM_AMC.OH.OH0.GEB.VFAT3.HW_ID", "breakOnFailure": true, "nReads": 3}"#);
  assert_eq!(response.get_word("CRC_ERROR_CNT").unwrap(), 1);
  assert_eq!(bench.device.writes_to(reset).len(), 4);
}

#[test]
fn requests_share_one_directory() {
  let bench = Bench::new(SimulatedDevice::new(), registers(&[]));
  assert!(bench.env.directory().is_connected());
  let scratch = tempfile::tempdir().unwrap();
  let table   = scratch.path().join("gem_amc_top.xml");
  std::fs::write(&table, r#"<node id="top">
  <node id="GEM_AMC" address="0x0">
    <node id="EXTRA" address="0x10" mask="0xf0" permission="rw"/>
  </node>
</node>"#).unwrap();
  let request = format!(r#"{{"at_xml": {}}}"#, serde_json::to_string(&table.to_string_lossy()).unwrap());
  let response = bench.call("utils", "update_address_table", &request);
  assert!(!response.has_error(), "{}", response);
  // the connection of the service sees the new table
  let response = bench.call("utils", "readRegFromDB", r#"{"reg_name": "GEM_AMC.EXTRA"}"#);
  assert!(!response.has_error(), "{}", response);
  assert_eq!(response.get_word("mask").unwrap(), 0xf0);
  let response = bench.call("utils", "readRegFromDB", &format!(r#"{{"reg_name": "{}"}}"#, FW_MAJOR_REG));
  assert!(response.has_error());
  assert!(bench.env.directory().is_connected());
}
