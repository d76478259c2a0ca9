//! The GBT-SCA slow control adapter, the "sca" RPC module
//!
//! Commands are sent through the manual control block of
//! the AMC firmware to all OptoHybrids selected in the
//! link mask. Replies are read back per OptoHybrid.
//!
//! The SCA expects the data bytes in the opposite order
//! of the AXI bus, see `format_sca_data`.

use std::fmt;

use ctp7_lib::{
    ModuleManager,
    RpcError,
    RpcMessage,
};
use ctp7_lib::constants::OH_PER_AMC;

use crate::access::AccessContext;
use crate::errors::ModuleError;
use crate::masks::EnabledLaneSet;
use crate::service::{
    respond,
    ModuleEnv,
};

const MANUAL_CONTROL : &str = "GEM_AMC.SLOW_CONTROL.SCA.MANUAL_CONTROL";
const MONITORING_OFF : &str = "GEM_AMC.SLOW_CONTROL.SCA.ADC_MONITORING.MONITORING_OFF";
const SCA_CTRL       : &str = "GEM_AMC.SLOW_CONTROL.SCA.CTRL";

/// The channels (internal interfaces) of the SCA
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ScaChannel {
  Ctrl  = 0x00,
  Spi   = 0x01,
  Gpio  = 0x02,
  I2C00 = 0x03,
  I2C01 = 0x04,
  I2C02 = 0x05,
  I2C03 = 0x06,
  I2C04 = 0x07,
  I2C05 = 0x08,
  I2C06 = 0x09,
  I2C07 = 0x0a,
  I2C08 = 0x0b,
  I2C09 = 0x0c,
  I2C10 = 0x0d,
  I2C11 = 0x0e,
  I2C12 = 0x0f,
  I2C13 = 0x10,
  I2C14 = 0x11,
  I2C15 = 0x12,
  Jtag  = 0x13,
  Adc   = 0x14,
  Dac   = 0x15,
}

impl ScaChannel {
  /// The I2C master with index n (0-15)
  pub fn i2c(n : u8) -> Option<ScaChannel> {
    match n {
      0  => Some(ScaChannel::I2C00),
      1  => Some(ScaChannel::I2C01),
      2  => Some(ScaChannel::I2C02),
      3  => Some(ScaChannel::I2C03),
      4  => Some(ScaChannel::I2C04),
      5  => Some(ScaChannel::I2C05),
      6  => Some(ScaChannel::I2C06),
      7  => Some(ScaChannel::I2C07),
      8  => Some(ScaChannel::I2C08),
      9  => Some(ScaChannel::I2C09),
      10 => Some(ScaChannel::I2C10),
      11 => Some(ScaChannel::I2C11),
      12 => Some(ScaChannel::I2C12),
      13 => Some(ScaChannel::I2C13),
      14 => Some(ScaChannel::I2C14),
      15 => Some(ScaChannel::I2C15),
      _  => None
    }
  }
}

/// Commands of the CTRL channel
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum CtrlCommand {
  GetData   = 0x00,
  CtrlRIdV1 = 0x91,
  CtrlRIdV2 = 0xD1,
  CtrlWCrb  = 0x02,
  CtrlWCrc  = 0x04,
  CtrlWCrd  = 0x06,
  CtrlRCrb  = 0x03,
  CtrlRCrc  = 0x05,
  CtrlRCrd  = 0x07,
  CtrlRSeu  = 0xF1,
  CtrlCSeu  = 0xF0,
}

impl TryFrom<u8> for CtrlCommand {
  type Error = ModuleError;

  fn try_from(value : u8) -> Result<Self, Self::Error> {
    match value {
      0x00 => Ok(CtrlCommand::GetData),
      0x91 => Ok(CtrlCommand::CtrlRIdV1),
      0xD1 => Ok(CtrlCommand::CtrlRIdV2),
      0x02 => Ok(CtrlCommand::CtrlWCrb),
      0x04 => Ok(CtrlCommand::CtrlWCrc),
      0x06 => Ok(CtrlCommand::CtrlWCrd),
      0x03 => Ok(CtrlCommand::CtrlRCrb),
      0x05 => Ok(CtrlCommand::CtrlRCrc),
      0x07 => Ok(CtrlCommand::CtrlRCrd),
      0xF1 => Ok(CtrlCommand::CtrlRSeu),
      0xF0 => Ok(CtrlCommand::CtrlCSeu),
      _    => Err(ModuleError::InvalidParameter(format!("Unknown SCA CTRL command {:#04x}", value)))
    }
  }
}

/// Commands of the I2C channels
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum I2CCommand {
  WCtrl   = 0x30,
  RCtrl   = 0x31,
  RStr    = 0x11,
  WMsk    = 0x20,
  RMsk    = 0x21,
  WData0  = 0x40,
  RData0  = 0x41,
  WData1  = 0x50,
  RData1  = 0x51,
  WData2  = 0x60,
  RData2  = 0x61,
  WData3  = 0x70,
  RData3  = 0x71,
  S7bW    = 0x82,
  S7bR    = 0x86,
  S10bW   = 0x8A,
  S10bR   = 0x8E,
  M7bW    = 0xDA,
  M7bR    = 0xDE,
  M10bW   = 0xE2,
  M10bR   = 0xE6,
  RmwOr   = 0xC6,
  RmwXor  = 0xCA,
}

impl TryFrom<u8> for I2CCommand {
  type Error = ModuleError;

  fn try_from(value : u8) -> Result<Self, Self::Error> {
    match value {
      0x30 => Ok(I2CCommand::WCtrl),
      0x31 => Ok(I2CCommand::RCtrl),
      0x11 => Ok(I2CCommand::RStr),
      0x20 => Ok(I2CCommand::WMsk),
      0x21 => Ok(I2CCommand::RMsk),
      0x40 => Ok(I2CCommand::WData0),
      0x41 => Ok(I2CCommand::RData0),
      0x50 => Ok(I2CCommand::WData1),
      0x51 => Ok(I2CCommand::RData1),
      0x60 => Ok(I2CCommand::WData2),
      0x61 => Ok(I2CCommand::RData2),
      0x70 => Ok(I2CCommand::WData3),
      0x71 => Ok(I2CCommand::RData3),
      0x82 => Ok(I2CCommand::S7bW),
      0x86 => Ok(I2CCommand::S7bR),
      0x8A => Ok(I2CCommand::S10bW),
      0x8E => Ok(I2CCommand::S10bR),
      0xDA => Ok(I2CCommand::M7bW),
      0xDE => Ok(I2CCommand::M7bR),
      0xE2 => Ok(I2CCommand::M10bW),
      0xE6 => Ok(I2CCommand::M10bR),
      0xC6 => Ok(I2CCommand::RmwOr),
      0xCA => Ok(I2CCommand::RmwXor),
      _    => Err(ModuleError::InvalidParameter(format!("Unknown SCA I2C command {:#04x}", value)))
    }
  }
}

/// Commands of the GPIO channel
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum GpioCommand {
  WDataOut   = 0x10,
  RDataOut   = 0x11,
  RDataIn    = 0x01,
  WDirection = 0x20,
  RDirection = 0x21,
  WIntEnable = 0x60,
  RIntEnable = 0x61,
  WIntSel    = 0x30,
  RIntSel    = 0x31,
  WIntTrig   = 0x40,
  RIntTrig   = 0x41,
  WInts      = 0x70,
  RInts      = 0x71,
  WClkSel    = 0x80,
  RClkSel    = 0x81,
  WEdgeSel   = 0x90,
  REdgeSel   = 0x91,
}

impl TryFrom<u8> for GpioCommand {
  type Error = ModuleError;

  fn try_from(value : u8) -> Result<Self, Self::Error> {
    match value {
      0x10 => Ok(GpioCommand::WDataOut),
      0x11 => Ok(GpioCommand::RDataOut),
      0x01 => Ok(GpioCommand::RDataIn),
      0x20 => Ok(GpioCommand::WDirection),
      0x21 => Ok(GpioCommand::RDirection),
      0x60 => Ok(GpioCommand::WIntEnable),
      0x61 => Ok(GpioCommand::RIntEnable),
      0x30 => Ok(GpioCommand::WIntSel),
      0x31 => Ok(GpioCommand::RIntSel),
      0x40 => Ok(GpioCommand::WIntTrig),
      0x41 => Ok(GpioCommand::RIntTrig),
      0x70 => Ok(GpioCommand::WInts),
      0x71 => Ok(GpioCommand::RInts),
      0x80 => Ok(GpioCommand::WClkSel),
      0x81 => Ok(GpioCommand::RClkSel),
      0x90 => Ok(GpioCommand::WEdgeSel),
      0x91 => Ok(GpioCommand::REdgeSel),
      _    => Err(ModuleError::InvalidParameter(format!("Unknown SCA GPIO command {:#04x}", value)))
    }
  }
}

/// Commands of the ADC channel. V1 commands are for the
/// first generation of the chip.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum AdcCommand {
  Go        = 0x02,
  WMux      = 0x50,
  RMux      = 0x51,
  WCurr     = 0x60,
  RCurr     = 0x61,
  WGain     = 0x10,
  RGain     = 0x11,
  RData     = 0x21,
  RRaw      = 0x31,
  ROfs      = 0x41,
  V1Go      = 0xB2,
  V1WInsel  = 0x30,
  V1WCurren = 0x40,
}

/// The inputs of the SCA ADC on the GE1/1 OptoHybrid
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum AdcChannel {
  VttxCscPt100 = 0x00,
  VttxGemPt100 = 0x04,
  Gbt0Pt100    = 0x07,
  V6FpgaPt100  = 0x08,
  PromV1p8     = 0x0e,
  FpgaIoV2p5   = 0x0f,
  FpgaCore     = 0x11,
  VtrxRssi3    = 0x12,
  VtrxRssi2    = 0x13,
  VtrxRssi1    = 0x15,
  GbtxV1p5     = 0x18,
  FpgaMgtV1p0  = 0x1b,
  FpgaMgtV1p2  = 0x1e,
  ScaTemp      = 0x1f,
}

impl AdcChannel {
  /// PT100 sensors need the current source
  pub fn use_current_source(&self) -> bool {
    match self {
      AdcChannel::VttxCscPt100
      | AdcChannel::VttxGemPt100
      | AdcChannel::Gbt0Pt100
      | AdcChannel::V6FpgaPt100 => true,
      AdcChannel::PromV1p8
      | AdcChannel::FpgaIoV2p5
      | AdcChannel::FpgaCore
      | AdcChannel::VtrxRssi3
      | AdcChannel::VtrxRssi2
      | AdcChannel::VtrxRssi1
      | AdcChannel::GbtxV1p5
      | AdcChannel::FpgaMgtV1p0
      | AdcChannel::FpgaMgtV1p2
      | AdcChannel::ScaTemp     => false,
    }
  }
}

impl TryFrom<u8> for AdcChannel {
  type Error = ModuleError;

  fn try_from(value : u8) -> Result<Self, Self::Error> {
    match value {
      0x00 => Ok(AdcChannel::VttxCscPt100),
      0x04 => Ok(AdcChannel::VttxGemPt100),
      0x07 => Ok(AdcChannel::Gbt0Pt100),
      0x08 => Ok(AdcChannel::V6FpgaPt100),
      0x0e => Ok(AdcChannel::PromV1p8),
      0x0f => Ok(AdcChannel::FpgaIoV2p5),
      0x11 => Ok(AdcChannel::FpgaCore),
      0x12 => Ok(AdcChannel::VtrxRssi3),
      0x13 => Ok(AdcChannel::VtrxRssi2),
      0x15 => Ok(AdcChannel::VtrxRssi1),
      0x18 => Ok(AdcChannel::GbtxV1p5),
      0x1b => Ok(AdcChannel::FpgaMgtV1p0),
      0x1e => Ok(AdcChannel::FpgaMgtV1p2),
      0x1f => Ok(AdcChannel::ScaTemp),
      _    => Err(ModuleError::InvalidParameter(format!("Unknown SCA ADC channel {}", value)))
    }
  }
}

bitflags::bitflags! {
  /// Error flags of an SCA reply
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct ScaErrorFlags : u8 {
    const GENERIC        = 0x01;
    const INV_CH_REQ     = 0x02;
    const INV_CMD_REQ    = 0x04;
    const INV_TRAN_REQ_N = 0x08;
    const INV_LEN        = 0x10;
    const CH_NOT_EN      = 0x20;
    const CH_BUSY        = 0x40;
    const CMD_IN_TREAT   = 0x80;
  }
}

impl fmt::Display for ScaErrorFlags {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let names : Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
    write!(f, "<ScaErrorFlags: {}>", names.join("|"))
  }
}

/// Swap the byte order between AXI and SCA
pub fn format_sca_data(data : u32) -> u32 {
  data.swap_bytes()
}

/// Send a command, don't wait for anything
pub fn send_sca_command(la      : &mut AccessContext,
                        ch      : u8,
                        cmd     : u8,
                        len     : u8,
                        data    : u32,
                        oh_mask : EnabledLaneSet) -> Result<(), ModuleError> {
  trace!("SCA command ch {:#04x} cmd {:#04x} len {} data {:#010x} to {}", ch, cmd, len, data, oh_mask);
  la.write_reg(&format!("{}.LINK_ENABLE_MASK", MANUAL_CONTROL), oh_mask.bits())?;
  la.write_reg(&format!("{}.SCA_CMD.SCA_CMD_CHANNEL", MANUAL_CONTROL), ch as u32)?;
  la.write_reg(&format!("{}.SCA_CMD.SCA_CMD_COMMAND", MANUAL_CONTROL), cmd as u32)?;
  la.write_reg(&format!("{}.SCA_CMD.SCA_CMD_LENGTH", MANUAL_CONTROL), len as u32)?;
  la.write_reg(&format!("{}.SCA_CMD.SCA_CMD_DATA", MANUAL_CONTROL), format_sca_data(data))?;
  la.write_reg(&format!("{}.SCA_CMD.SCA_CMD_EXECUTE", MANUAL_CONTROL), 0x1)?;
  Ok(())
}

/// Send a command and collect one reply word per
/// OptoHybrid. OptoHybrids outside of oh_mask yield 0.
pub fn send_sca_command_with_reply(la      : &mut AccessContext,
                                   ch      : u8,
                                   cmd     : u8,
                                   len     : u8,
                                   data    : u32,
                                   oh_mask : EnabledLaneSet) -> Result<Vec<u32>, ModuleError> {
  send_sca_command(la, ch, cmd, len, data, oh_mask)?;
  let mut reply = Vec::<u32>::with_capacity(OH_PER_AMC as usize);
  for oh in 0..OH_PER_AMC {
    if !oh_mask.contains(oh) {
      reply.push(0);
      continue;
    }
    let err_reg = format!("{}.SCA_REPLY_OH{}.SCA_RPY_ERROR", MANUAL_CONTROL, oh);
    if la.exists(&err_reg) {
      let flags = ScaErrorFlags::from_bits_truncate(la.try_read_reg(&err_reg)? as u8);
      if !flags.is_empty() {
        warn!("SCA of OH{} replied with {}", oh, flags);
        la.response.set_warning(&format!("SCA of OH{} replied with {}", oh, flags));
      }
    }
    let word = la.try_read_reg(&format!("{}.SCA_REPLY_OH{}.SCA_RPY_DATA", MANUAL_CONTROL, oh))?;
    reply.push(format_sca_data(word));
  }
  Ok(reply)
}

/// Run body with the ADC monitoring switched off. The
/// previous monitoring mask is restored in any case.
pub fn with_monitoring_off<T, F>(la : &mut AccessContext, body : F) -> Result<T, ModuleError>
  where F : FnOnce(&mut AccessContext) -> Result<T, ModuleError> {
  let mon_mask = la.try_read_reg(MONITORING_OFF)?;
  la.write_reg(MONITORING_OFF, 0xffffffff)?;
  let result   = body(la);
  let restored = la.write_reg(MONITORING_OFF, mon_mask);
  let value = result?;
  restored?;
  Ok(value)
}

pub fn sca_ctrl_command(la      : &mut AccessContext,
                        cmd     : CtrlCommand,
                        oh_mask : EnabledLaneSet,
                        len     : u8,
                        data    : u32) -> Result<Vec<u32>, ModuleError> {
  with_monitoring_off(la, |la| {
    match cmd {
      CtrlCommand::CtrlRIdV1 | CtrlCommand::CtrlRIdV2 => {
        send_sca_command_with_reply(la, ScaChannel::Adc as u8, cmd as u8, 0x1, 0x1, oh_mask)
      }
      CtrlCommand::CtrlRSeu | CtrlCommand::CtrlCSeu => {
        send_sca_command_with_reply(la, ScaChannel::Jtag as u8, cmd as u8, 0x1, 0x0, oh_mask)
      }
      CtrlCommand::CtrlWCrb | CtrlCommand::CtrlWCrc | CtrlCommand::CtrlWCrd => {
        send_sca_command(la, ScaChannel::Ctrl as u8, cmd as u8, len, data, oh_mask)?;
        Ok(Vec::new())
      }
      CtrlCommand::CtrlRCrb | CtrlCommand::CtrlRCrc | CtrlCommand::CtrlRCrd => {
        send_sca_command_with_reply(la, ScaChannel::Ctrl as u8, cmd as u8, len, data, oh_mask)
      }
      CtrlCommand::GetData => {
        send_sca_command_with_reply(la, ScaChannel::Ctrl as u8, CtrlCommand::GetData as u8, len, data, oh_mask)
      }
    }
  })
}

pub fn sca_i2c_command(la      : &mut AccessContext,
                       ch      : ScaChannel,
                       cmd     : I2CCommand,
                       len     : u8,
                       data    : u32,
                       oh_mask : EnabledLaneSet) -> Result<(), ModuleError> {
  with_monitoring_off(la, |la| {
    send_sca_command(la, ch as u8, cmd as u8, len, data, oh_mask)
  })
}

pub fn sca_gpio_command(la      : &mut AccessContext,
                        cmd     : GpioCommand,
                        len     : u8,
                        data    : u32,
                        oh_mask : EnabledLaneSet) -> Result<Vec<u32>, ModuleError> {
  with_monitoring_off(la, |la| {
    send_sca_command_with_reply(la, ScaChannel::Gpio as u8, cmd as u8, len, data, oh_mask)
  })
}

/// Select an ADC input, enable the current source if
/// the sensor needs it and start a conversion
pub fn sca_adc_command(la      : &mut AccessContext,
                       ch      : AdcChannel,
                       oh_mask : EnabledLaneSet) -> Result<Vec<u32>, ModuleError> {
  with_monitoring_off(la, |la| {
    let current = if ch.use_current_source() { 0x1u32 << (ch as u8) } else { 0x0 };
    send_sca_command(la, ScaChannel::Adc as u8, AdcCommand::WMux as u8, 0x4, ch as u32, oh_mask)?;
    send_sca_command(la, ScaChannel::Adc as u8, AdcCommand::WCurr as u8, 0x4, current, oh_mask)?;
    send_sca_command_with_reply(la, ScaChannel::Adc as u8, AdcCommand::Go as u8, 0x4, 0x1, oh_mask)
  })
}

pub fn read_sca_chip_id(la : &mut AccessContext, oh_mask : EnabledLaneSet, sca_v1 : bool) -> Result<Vec<u32>, ModuleError> {
  let cmd = if sca_v1 { CtrlCommand::CtrlRIdV1 } else { CtrlCommand::CtrlRIdV2 };
  sca_ctrl_command(la, cmd, oh_mask, 0x1, 0x0)
}

pub fn reset_sca_seu_counter(la : &mut AccessContext, oh_mask : EnabledLaneSet) -> Result<(), ModuleError> {
  sca_ctrl_command(la, CtrlCommand::CtrlCSeu, oh_mask, 0x1, 0x0)?;
  Ok(())
}

pub fn read_sca_seu_counter(la : &mut AccessContext, oh_mask : EnabledLaneSet, reset : bool) -> Result<Vec<u32>, ModuleError> {
  if reset {
    reset_sca_seu_counter(la, oh_mask)?;
  }
  sca_ctrl_command(la, CtrlCommand::CtrlRSeu, oh_mask, 0x1, 0x0)
}

/// Reset the SCA of the selected OptoHybrids only
pub fn sca_module_reset(la : &mut AccessContext, oh_mask : EnabledLaneSet) -> Result<(), ModuleError> {
  let enable_mask = format!("{}.SCA_RESET_ENABLE_MASK", SCA_CTRL);
  let orig_mask   = la.try_read_reg(&enable_mask)?;
  la.write_reg(&enable_mask, oh_mask.bits())?;
  let reset  = la.write_reg(&format!("{}.MODULE_RESET", SCA_CTRL), 0x1);
  let restore = la.write_reg(&enable_mask, orig_mask);
  reset?;
  restore?;
  Ok(())
}

pub fn sca_hard_reset_enable(la : &mut AccessContext, enable : bool) -> Result<(), ModuleError> {
  la.write_reg(&format!("{}.TTC_HARD_RESET_EN", SCA_CTRL), enable as u32)?;
  Ok(())
}

fn request_byte(request : &RpcMessage, key : &str) -> Result<u8, ModuleError> {
  let word = request.get_word(key)?;
  u8::try_from(word).map_err(|_| RpcError::ValueOutOfRange(String::from(key)).into())
}

fn request_oh_mask(request : &RpcMessage) -> Result<EnabledLaneSet, ModuleError> {
  Ok(EnabledLaneSet::ohs(request.get_word_or("ohMask", 0xfff)?))
}

fn rpc_send_sca_command(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let ch      = request_byte(request, "ch")?;
    let cmd     = request_byte(request, "cmd")?;
    let len     = request_byte(request, "len")?;
    let data    = request.get_word("data")?;
    let oh_mask = request_oh_mask(request)?;
    let mut la  = env.context(response)?;
    send_sca_command(&mut la, ch, cmd, len, data, oh_mask)
  });
}

fn rpc_send_sca_command_with_reply(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let ch      = request_byte(request, "ch")?;
    let cmd     = request_byte(request, "cmd")?;
    let len     = request_byte(request, "len")?;
    let data    = request.get_word("data")?;
    let oh_mask = request_oh_mask(request)?;
    let mut la  = env.context(response)?;
    let reply   = send_sca_command_with_reply(&mut la, ch, cmd, len, data, oh_mask)?;
    la.response.set_word_array("data", &reply);
    Ok(())
  });
}

fn rpc_sca_ctrl_command(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let cmd     = CtrlCommand::try_from(request_byte(request, "cmd")?)?;
    let len     = request_byte(request, "len").unwrap_or(0x1);
    let data    = request.get_word_or("data", 0x0)?;
    let oh_mask = request_oh_mask(request)?;
    let mut la  = env.context(response)?;
    let reply   = sca_ctrl_command(&mut la, cmd, oh_mask, len, data)?;
    la.response.set_word_array("data", &reply);
    Ok(())
  });
}

fn rpc_sca_i2c_command(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let master  = request_byte(request, "ch")?;
    let ch      = ScaChannel::i2c(master)
      .ok_or(ModuleError::InvalidParameter(format!("There is no I2C master {}", master)))?;
    let cmd     = I2CCommand::try_from(request_byte(request, "cmd")?)?;
    let len     = request_byte(request, "len")?;
    let data    = request.get_word("data")?;
    let oh_mask = request_oh_mask(request)?;
    let mut la  = env.context(response)?;
    sca_i2c_command(&mut la, ch, cmd, len, data, oh_mask)
  });
}

fn rpc_sca_gpio_command(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let cmd     = GpioCommand::try_from(request_byte(request, "cmd")?)?;
    let len     = request_byte(request, "len")?;
    let data    = request.get_word("data")?;
    let oh_mask = request_oh_mask(request)?;
    let mut la  = env.context(response)?;
    let reply   = sca_gpio_command(&mut la, cmd, len, data, oh_mask)?;
    la.response.set_word_array("data", &reply);
    Ok(())
  });
}

fn rpc_sca_adc_command(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let ch      = AdcChannel::try_from(request_byte(request, "ch")?)?;
    let oh_mask = request_oh_mask(request)?;
    let mut la  = env.context(response)?;
    let reply   = sca_adc_command(&mut la, ch, oh_mask)?;
    la.response.set_word_array("data", &reply);
    Ok(())
  });
}

fn rpc_read_sca_chip_id(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh_mask = request_oh_mask(request)?;
    let sca_v1  = request.get_key_exists("scaV1") && request.get_flag("scaV1")?;
    let mut la  = env.context(response)?;
    let ids     = read_sca_chip_id(&mut la, oh_mask, sca_v1)?;
    la.response.set_word_array("data", &ids);
    Ok(())
  });
}

fn rpc_read_sca_seu_counter(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh_mask = request_oh_mask(request)?;
    let reset   = request.get_key_exists("reset") && request.get_flag("reset")?;
    let mut la  = env.context(response)?;
    let seus    = read_sca_seu_counter(&mut la, oh_mask, reset)?;
    la.response.set_word_array("data", &seus);
    Ok(())
  });
}

fn rpc_reset_sca_seu_counter(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh_mask = request_oh_mask(request)?;
    let mut la  = env.context(response)?;
    reset_sca_seu_counter(&mut la, oh_mask)
  });
}

fn rpc_sca_module_reset(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let oh_mask = request_oh_mask(request)?;
    let mut la  = env.context(response)?;
    sca_module_reset(&mut la, oh_mask)
  });
}

fn rpc_sca_hard_reset_enable(env : &ModuleEnv, request : &RpcMessage, response : &mut RpcMessage) {
  respond(response, |response| {
    let enable = request.get_flag("en")?;
    let mut la = env.context(response)?;
    sca_hard_reset_enable(&mut la, enable)
  });
}

pub fn module_init(mgr : &mut ModuleManager<ModuleEnv>) {
  mgr.register_method("sca", "sendSCACommand", rpc_send_sca_command);
  mgr.register_method("sca", "sendSCACommandWithReply", rpc_send_sca_command_with_reply);
  mgr.register_method("sca", "scaCTRLCommand", rpc_sca_ctrl_command);
  mgr.register_method("sca", "scaI2CCommand", rpc_sca_i2c_command);
  mgr.register_method("sca", "scaGPIOCommand", rpc_sca_gpio_command);
  mgr.register_method("sca", "scaADCCommand", rpc_sca_adc_command);
  mgr.register_method("sca", "readSCAChipID", rpc_read_sca_chip_id);
  mgr.register_method("sca", "readSCASEUCounter", rpc_read_sca_seu_counter);
  mgr.register_method("sca", "resetSCASEUCounter", rpc_reset_sca_seu_counter);
  mgr.register_method("sca", "scaModuleReset", rpc_sca_module_reset);
  mgr.register_method("sca", "scaHardResetEnable", rpc_sca_hard_reset_enable);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn byte_order_swap() {
    assert_eq!(format_sca_data(0x1234_5678), 0x7856_3412);
    assert_eq!(format_sca_data(format_sca_data(0xdead_beef)), 0xdead_beef);
    assert_eq!(format_sca_data(0x0000_00ff), 0xff00_0000);
  }

  #[test]
  fn closed_command_sets() {
    assert_eq!(CtrlCommand::try_from(0xD1).unwrap(), CtrlCommand::CtrlRIdV2);
    assert!(CtrlCommand::try_from(0x42).is_err());
    assert_eq!(GpioCommand::try_from(0x01).unwrap(), GpioCommand::RDataIn);
    assert_eq!(I2CCommand::try_from(0xCA).unwrap(), I2CCommand::RmwXor);
    assert!(AdcChannel::try_from(0x1f).unwrap() == AdcChannel::ScaTemp);
    assert!(AdcChannel::VttxGemPt100.use_current_source());
    assert!(!AdcChannel::FpgaCore.use_current_source());
    assert_eq!(ScaChannel::i2c(15), Some(ScaChannel::I2C15));
  }

  #[test]
  fn error_flags() {
    let flags = ScaErrorFlags::from_bits_truncate(0x22);
    assert!(flags.contains(ScaErrorFlags::INV_CH_REQ));
    assert!(flags.contains(ScaErrorFlags::CH_NOT_EN));
    assert_eq!(flags.to_string(), "<ScaErrorFlags: INV_CH_REQ|CH_NOT_EN>");
  }
}
