//! Address table ingestion
//!
//! Turns the XML address table of the AMC firmware
//! into register descriptors for the directory.
//!
//! The table is a tree of `<node>` elements. A node
//! address is relative to its parent, and counts 32bit
//! words. Every node carrying a `permission` attribute
//! is a register. Nodes with `generate="true"` are
//! repeated `generate_size` times, `${generate_idx_var}`
//! in the ids of the subtree is replaced by the index.

use std::collections::HashMap;
use std::fs::File;
use std::io::{
    BufRead,
    BufReader,
};

use quick_xml::Reader;
use quick_xml::events::{
    BytesStart,
    Event,
};

use crate::directory::{
    AccessMode,
    Permissions,
    RegisterDescriptor,
};
use crate::errors::DirectoryError;

/// Where the AXI register space of the AMC starts
pub const AXI_BASE_ADDRESS : u32 = 0x6400_0000;

/// The top node. It is not part of any register name
const TOP_PREFIX : &str = "top.";

#[derive(Debug, Clone, Default)]
struct XmlNode {
  attrs    : HashMap<String, String>,
  children : Vec<XmlNode>,
}

/// Parse decimal or 0x prefixed hex numbers
pub fn parse_number(value : &str) -> Option<u32> {
  let value = value.trim();
  if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
    u32::from_str_radix(hex, 16).ok()
  } else {
    value.parse::<u32>().ok()
  }
}

fn node_from_start(e : &BytesStart) -> Result<XmlNode, DirectoryError> {
  let mut node = XmlNode::default();
  for attr in e.attributes() {
    let attr  = attr.map_err(|e| DirectoryError::AddressTable(e.to_string()))?;
    let key   = String::from_utf8_lossy(attr.key.as_ref()).to_string();
    let value = attr.unescape_value()
      .map_err(|e| DirectoryError::AddressTable(e.to_string()))?
      .to_string();
    node.attrs.insert(key, value);
  }
  Ok(node)
}

fn read_tree<R : BufRead>(mut reader : Reader<R>) -> Result<Vec<XmlNode>, DirectoryError> {
  reader.trim_text(true);
  let mut buf   = Vec::<u8>::new();
  let mut stack = Vec::<XmlNode>::new();
  let mut roots = Vec::<XmlNode>::new();
  loop {
    match reader.read_event_into(&mut buf) {
      Err(err) => {
        return Err(DirectoryError::AddressTable(format!("at position {}: {}", reader.buffer_position(), err)));
      }
      Ok(Event::Eof) => break,
      Ok(Event::Start(ref e)) if e.name().as_ref() == b"node" => {
        stack.push(node_from_start(e)?);
      }
      Ok(Event::Empty(ref e)) if e.name().as_ref() == b"node" => {
        let node = node_from_start(e)?;
        match stack.last_mut() {
          Some(parent) => parent.children.push(node),
          None         => roots.push(node),
        }
      }
      Ok(Event::End(ref e)) if e.name().as_ref() == b"node" => {
        let node = stack.pop()
          .ok_or(DirectoryError::AddressTable(String::from("unbalanced </node>")))?;
        match stack.last_mut() {
          Some(parent) => parent.children.push(node),
          None         => roots.push(node),
        }
      }
      Ok(_) => ()
    }
    buf.clear();
  }
  if !stack.is_empty() {
    return Err(DirectoryError::AddressTable(format!("{} unclosed <node> elements", stack.len())));
  }
  Ok(roots)
}

fn substitute(id : &str, vars : &[(String, u32)]) -> String {
  let mut result = String::from(id);
  for (var, value) in vars {
    result = result.replace(&format!("${{{}}}", var), &value.to_string());
  }
  result
}

fn attr_number(node : &XmlNode, key : &str, default : u32) -> Result<u32, DirectoryError> {
  match node.attrs.get(key) {
    None        => Ok(default),
    Some(value) => parse_number(value)
      .ok_or(DirectoryError::AddressTable(format!("invalid {} '{}'", key, value))),
  }
}

fn collect(node         : &XmlNode,
           parent_name  : &str,
           parent_addr  : u32,
           vars         : &[(String, u32)],
           out          : &mut Vec<RegisterDescriptor>) -> Result<(), DirectoryError> {
  let generate = node.attrs.get("generate").map(|g| g == "true").unwrap_or(false);
  if generate {
    let size = attr_number(node, "generate_size", 1)?;
    let step = attr_number(node, "generate_address_step", 0)?;
    let var  = node.attrs.get("generate_idx_var")
      .ok_or(DirectoryError::AddressTable(format!("generated node below {} without generate_idx_var", parent_name)))?;
    for idx in 0..size {
      let mut inner = node.clone();
      inner.attrs.remove("generate");
      let base = attr_number(node, "address", 0)?;
      inner.attrs.insert(String::from("address"), base.wrapping_add(idx.wrapping_mul(step)).to_string());
      let mut inner_vars = vars.to_vec();
      inner_vars.push((var.clone(), idx));
      collect(&inner, parent_name, parent_addr, &inner_vars, out)?;
    }
    return Ok(());
  }
  let id = match node.attrs.get("id") {
    Some(id) => substitute(id, vars),
    None     => return Err(DirectoryError::AddressTable(format!("node without id below {}", parent_name))),
  };
  let name = if parent_name.is_empty() {
    id
  } else {
    format!("{}.{}", parent_name, id)
  };
  let address = parent_addr.wrapping_add(attr_number(node, "address", 0)?);
  if let Some(perm) = node.attrs.get("permission") {
    let permissions = Permissions::parse(perm)
      .ok_or(DirectoryError::AddressTable(format!("invalid permission '{}' of {}", perm, name)))?;
    let mode = match node.attrs.get("mode") {
      None    => AccessMode::Single,
      Some(m) => AccessMode::parse(m)
        .ok_or(DirectoryError::AddressTable(format!("invalid mode '{}' of {}", m, name)))?,
    };
    let reg_name = match name.strip_prefix(TOP_PREFIX) {
      Some(stripped) => String::from(stripped),
      None           => name.clone(),
    };
    out.push(RegisterDescriptor {
      name        : reg_name,
      address     : AXI_BASE_ADDRESS.wrapping_add(address << 2),
      mask        : attr_number(node, "mask", 0xffffffff)?,
      mode,
      permissions,
      size        : attr_number(node, "size", 1)?,
    });
  }
  for child in &node.children {
    collect(child, &name, address, vars, out)?;
  }
  Ok(())
}

fn descriptors_from_reader<R : BufRead>(reader : Reader<R>) -> Result<Vec<RegisterDescriptor>, DirectoryError> {
  let roots = read_tree(reader)?;
  let mut out = Vec::<RegisterDescriptor>::new();
  for root in &roots {
    collect(root, "", 0, &[], &mut out)?;
  }
  debug!("Address table yields {} registers", out.len());
  Ok(out)
}

/// Parse an address table held in memory
pub fn parse_address_table_str(xml : &str) -> Result<Vec<RegisterDescriptor>, DirectoryError> {
  descriptors_from_reader(Reader::from_str(xml))
}

/// Parse an address table file
pub fn parse_address_table(path : &str) -> Result<Vec<RegisterDescriptor>, DirectoryError> {
  let file = File::open(path)
    .map_err(|e| DirectoryError::AddressTable(format!("{}: {}", path, e)))?;
  info!("Parsing address table {}", path);
  descriptors_from_reader(Reader::from_reader(BufReader::new(file)))
}

#[cfg(test)]
mod tests {
  use super::*;

  const TABLE : &str = r#"<?xml version="1.0" encoding="utf-8"?>
<node id="top">
  <node id="GEM_AMC" address="0x00000000">
    <node id="TTC" address="0x00300000">
      <node id="CTRL" address="0x0">
        <node id="L1A_ENABLE" address="0x0" mask="0x00000001" permission="rw"/>
        <node id="MODULE_RESET" address="0x1" permission="w"/>
      </node>
    </node>
    <node id="OH" address="0x00400000">
      <node id="OH${OH_IDX}" address="0x0" generate="true" generate_size="2" generate_address_step="0x00010000" generate_idx_var="OH_IDX">
        <node id="FW_VERSION" address="0x8" permission="r"/>
        <node id="RAM" address="0x100" permission="rw" mode="block" size="32"/>
      </node>
    </node>
  </node>
</node>"#;

  #[test]
  fn nested_addresses_and_names() {
    let regs = parse_address_table_str(TABLE).unwrap();
    assert_eq!(regs.len(), 6);
    let l1a = regs.iter().find(|r| r.name == "GEM_AMC.TTC.CTRL.L1A_ENABLE").unwrap();
    assert_eq!(l1a.address, AXI_BASE_ADDRESS + (0x0030_0000 << 2));
    assert_eq!(l1a.mask, 1);
    let reset = regs.iter().find(|r| r.name == "GEM_AMC.TTC.CTRL.MODULE_RESET").unwrap();
    assert_eq!(reset.mask, 0xffffffff);
    assert!(!reset.is_readable());
  }

  #[test]
  fn generated_nodes() {
    let regs = parse_address_table_str(TABLE).unwrap();
    let fw1 = regs.iter().find(|r| r.name == "GEM_AMC.OH.OH1.FW_VERSION").unwrap();
    assert_eq!(fw1.address, AXI_BASE_ADDRESS + ((0x0040_0000 + 0x0001_0000 + 0x8) << 2));
    let ram0 = regs.iter().find(|r| r.name == "GEM_AMC.OH.OH0.RAM").unwrap();
    assert_eq!(ram0.mode, AccessMode::Block);
    assert_eq!(ram0.size, 32);
  }

  #[test]
  fn broken_tables() {
    assert!(parse_address_table_str("<node id=\"top\"><node id=\"A\" permission=\"rw\"/>").is_err());
    assert!(parse_address_table_str("<node id=\"top\"><node id=\"A\" permission=\"x\"/></node>").is_err());
    assert_eq!(parse_number("0x1F"), Some(31));
    assert_eq!(parse_number("12"), Some(12));
    assert_eq!(parse_number("zz"), None);
  }
}
