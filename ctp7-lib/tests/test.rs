use ctp7_lib::Ctp7Settings;
use ctp7_lib::RpcMessage;

#[test]
fn write_and_read_config_file() {
  let dir = tempfile::tempdir().unwrap();
  let fname = dir.path().join("ctp7-config-test.toml");
  let mut settings = Ctp7Settings::new();
  settings.gem_path = String::from("/mnt/persistent/gemdaq");
  settings.verification_reads = 7;
  println!("{}", settings);
  settings.to_toml(fname.to_string_lossy().to_string()).unwrap();
  let read_back = Ctp7Settings::from_toml(fname.to_string_lossy().to_string()).unwrap();
  assert_eq!(settings, read_back);
}

#[test]
fn missing_config_file() {
  assert!(Ctp7Settings::from_toml(String::from("/nonexisting/ctp7.toml")).is_err());
}

#[test]
fn response_error_channel() {
  let mut rsp = RpcMessage::new();
  assert!(!rsp.has_error());
  rsp.set_warning("VFAT 3 is out of sync");
  rsp.set_error("Register not found");
  assert_eq!(rsp.error(), Some("Register not found"));
  assert_eq!(rsp.warning(), Some("VFAT 3 is out of sync"));
  let json = rsp.to_json();
  let again = RpcMessage::from_json(&json).unwrap();
  assert_eq!(again.error(), Some("Register not found"));
}
