//! The register directory
//!
//! Maps symbolic register names to their physical
//! address, mask, access mode and size. The directory
//! lives in a small sqlite database, one row per register,
//! the descriptor stored as "address|permissions|mask|size|mode".
//!
//! The database is read on every register access and
//! only ever written when the address table is updated.
//! A rebuild replaces all rows in a single transaction,
//! readers see either the old or the new table.

use std::collections::BTreeMap;
use std::fmt;

use diesel::prelude::*;
use diesel::connection::{
    AnsiTransactionManager,
    SimpleConnection,
    TransactionManager,
};
use diesel::result::{
    DatabaseErrorKind,
    Error as DieselError,
};

mod schema;

use schema::address_table;

use crate::errors::DirectoryError;

/// Number of rows per insert statement during a rebuild
const INSERT_CHUNK : usize = 150;

bitflags::bitflags! {
  /// Allowed access to a register
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
  pub struct Permissions : u8 {
    const READ  = 0b01;
    const WRITE = 0b10;
  }
}

impl Permissions {
  /// Parse the permission string of the address
  /// table ("r", "w", "rw")
  pub fn parse(perm : &str) -> Option<Permissions> {
    if perm.is_empty() {
      return None;
    }
    let mut p = Permissions::empty();
    for c in perm.chars() {
      match c {
        'r' => p |= Permissions::READ,
        'w' => p |= Permissions::WRITE,
        _   => return None,
      }
    }
    Some(p)
  }

  pub fn to_perm_string(&self) -> String {
    let mut repr = String::new();
    if self.contains(Permissions::READ) {
      repr += "r";
    }
    if self.contains(Permissions::WRITE) {
      repr += "w";
    }
    repr
  }
}

/// How consecutive words of a register are addressed
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum AccessMode {
  /// One word
  Single,
  /// Consecutive addresses
  Block,
  /// Repeated access to the same address
  Fifo,
}

impl AccessMode {
  pub fn parse(mode : &str) -> Option<AccessMode> {
    match mode {
      "single"                                  => Some(AccessMode::Single),
      "block" | "incremental"                   => Some(AccessMode::Block),
      "fifo"  | "port" | "non-incremental"      => Some(AccessMode::Fifo),
      _                                         => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      AccessMode::Single => "single",
      AccessMode::Block  => "block",
      AccessMode::Fifo   => "fifo",
    }
  }
}

impl fmt::Display for AccessMode {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

/// Everything we know about a register
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterDescriptor {
  /// Hierarchical, dot-separated name
  pub name        : String,
  pub address     : u32,
  pub mask        : u32,
  pub mode        : AccessMode,
  pub permissions : Permissions,
  /// Size in words
  pub size        : u32,
}

impl RegisterDescriptor {
  /// A single word, read-write register
  pub fn new(name : &str, address : u32, mask : u32) -> Self {
    Self {
      name        : String::from(name),
      address,
      mask,
      mode        : AccessMode::Single,
      permissions : Permissions::READ | Permissions::WRITE,
      size        : 1,
    }
  }

  pub fn is_readable(&self) -> bool {
    self.permissions.contains(Permissions::READ)
  }

  pub fn is_writable(&self) -> bool {
    self.permissions.contains(Permissions::WRITE)
  }

  /// The value as it is stored in the directory
  pub fn encode(&self) -> String {
    format!("{}|{}|{}|{}|{}",
            self.address,
            self.permissions.to_perm_string(),
            self.mask,
            self.size,
            self.mode.as_str())
  }

  /// Decode a stored value. Exactly five fields
  /// are expected, anything else is rejected.
  pub fn decode(name : &str, value : &str) -> Result<Self, DirectoryError> {
    let malformed = || DirectoryError::MalformedDescriptor(String::from(value));
    let fields : Vec<&str> = value.split('|').collect();
    if fields.len() != 5 {
      return Err(malformed());
    }
    let address     = fields[0].parse::<u32>().map_err(|_| malformed())?;
    let permissions = Permissions::parse(fields[1]).ok_or_else(malformed)?;
    let mask        = fields[2].parse::<u32>().map_err(|_| malformed())?;
    let size        = fields[3].parse::<u32>().map_err(|_| malformed())?;
    let mode        = AccessMode::parse(fields[4]).ok_or_else(malformed)?;
    Ok(Self {
      name : String::from(name),
      address,
      mask,
      mode,
      permissions,
      size,
    })
  }
}

impl fmt::Display for RegisterDescriptor {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = String::from("<RegisterDescriptor:");
    repr += &(format!("\n  name        : {}", self.name));
    repr += &(format!("\n  address     : {:#010x}", self.address));
    repr += &(format!("\n  mask        : {:#010x}", self.mask));
    repr += &(format!("\n  permissions : {}", self.permissions.to_perm_string()));
    repr += &(format!("\n  mode        : {}", self.mode));
    repr += &(format!("\n  size        : {}>", self.size));
    write!(f, "{}", repr)
  }
}

/// A row of the address table
#[derive(Debug, Clone, Queryable, Insertable, Selectable)]
#[diesel(table_name = address_table)]
#[diesel(primary_key(name))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct AddressTableRow {
  name       : String,
  descriptor : String,
}

#[derive(Debug, QueryableByName)]
struct PageSize {
  #[diesel(sql_type = diesel::sql_types::BigInt)]
  page_size : i64,
}

/// What sqlite reports when max_page_count is reached
const STORE_FULL : &str = "database or disk is full";

fn is_store_full(err : &DieselError) -> bool {
  match err {
    DieselError::DatabaseError(DatabaseErrorKind::Unknown, info) => info.message().starts_with(STORE_FULL),
    _ => false
  }
}

fn connect(path : &str, size_mb : u64) -> Result<SqliteConnection, DirectoryError> {
  let open_err = |e : &dyn fmt::Display| DirectoryError::Open(format!("{}: {}", path, e));
  let mut conn = SqliteConnection::establish(path)
    .map_err(|e| open_err(&e))?;
  conn.batch_execute("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
    .map_err(|e| open_err(&e))?;
  let page = diesel::sql_query("PRAGMA page_size")
    .get_result::<PageSize>(&mut conn)
    .map_err(|e| open_err(&e))?;
  let max_pages = (size_mb * 1024 * 1024) / (page.page_size.max(512) as u64);
  conn.batch_execute(&format!("PRAGMA max_page_count = {};", max_pages))
    .map_err(|e| open_err(&e))?;
  conn.batch_execute("CREATE TABLE IF NOT EXISTS address_table (name TEXT PRIMARY KEY NOT NULL, descriptor TEXT NOT NULL);")
    .map_err(|e| open_err(&e))?;
  debug!("Connected to register store {} (max {} pages)", path, max_pages);
  Ok(conn)
}

/// Connection to the persistent register store.
///
/// The connection is made on first use and kept
/// afterwards. After a failed rebuild it is made anew.
pub struct RegisterDirectory {
  pub path    : String,
  pub size_mb : u64,
  conn        : Option<SqliteConnection>,
  in_read_txn : bool,
}

impl RegisterDirectory {
  /// A store at path, not connected yet
  ///
  /// # Arguments
  ///
  /// * size_mb : maximum size of the store
  pub fn new(path : &str, size_mb : u64) -> Self {
    Self {
      path        : String::from(path),
      size_mb,
      conn        : None,
      in_read_txn : false,
    }
  }

  /// Open (and create if necessary) the store at path
  pub fn open(path : &str, size_mb : u64) -> Result<Self, DirectoryError> {
    let mut directory = Self::new(path, size_mb);
    directory.conn()?;
    Ok(directory)
  }

  fn conn(&mut self) -> Result<&mut SqliteConnection, DirectoryError> {
    if self.conn.is_none() {
      self.conn = Some(connect(&self.path, self.size_mb)?);
    }
    self.conn.as_mut().ok_or(DirectoryError::Open(self.path.clone()))
  }

  pub fn is_connected(&self) -> bool {
    self.conn.is_some()
  }

  /// Start a read transaction. All lookups until
  /// `end_read` see the same snapshot.
  pub fn begin_read(&mut self) -> Result<(), DirectoryError> {
    if self.in_read_txn {
      return Ok(());
    }
    AnsiTransactionManager::begin_transaction(self.conn()?)
      .map_err(|e| DirectoryError::Query(e.to_string()))?;
    self.in_read_txn = true;
    Ok(())
  }

  /// Abort the read transaction, if any
  pub fn end_read(&mut self) {
    if !self.in_read_txn {
      return;
    }
    self.in_read_txn = false;
    if let Some(conn) = self.conn.as_mut() {
      if let Err(err) = AnsiTransactionManager::rollback_transaction(conn) {
        error!("Unable to abort read transaction on {}! {}", self.path, err);
        self.conn = None;
      }
    }
  }

  pub fn in_read_transaction(&self) -> bool {
    self.in_read_txn
  }

  /// Resolve a name
  pub fn lookup(&mut self, reg_name : &str) -> Result<RegisterDescriptor, DirectoryError> {
    let row = address_table::table
      .find(reg_name)
      .select(AddressTableRow::as_select())
      .first(self.conn()?)
      .optional()
      .map_err(|e| DirectoryError::Query(e.to_string()))?;
    match row {
      None      => Err(DirectoryError::NotFound(String::from(reg_name))),
      Some(row) => RegisterDescriptor::decode(&row.name, &row.descriptor),
    }
  }

  /// Check if a name is known, without decoding it
  pub fn exists(&mut self, reg_name : &str) -> Result<bool, DirectoryError> {
    let n : i64 = address_table::table
      .filter(address_table::name.eq(reg_name))
      .count()
      .get_result(self.conn()?)
      .map_err(|e| DirectoryError::Query(e.to_string()))?;
    Ok(n > 0)
  }

  /// Number of registers in the store
  pub fn len(&mut self) -> Result<usize, DirectoryError> {
    let n : i64 = address_table::table
      .count()
      .get_result(self.conn()?)
      .map_err(|e| DirectoryError::Query(e.to_string()))?;
    Ok(n as usize)
  }

  pub fn is_empty(&mut self) -> Result<bool, DirectoryError> {
    Ok(self.len()? == 0)
  }

  /// Replace the whole content of the store
  pub fn rebuild(&mut self, descriptors : &[RegisterDescriptor]) -> Result<usize, DirectoryError> {
    self.rebuild_with_progress(descriptors, |_| {})
  }

  /// Replace the whole content of the store, calling
  /// progress with the number of rows written so far.
  ///
  /// Duplicate names are collapsed, the last one wins.
  /// A store which would grow beyond size_mb keeps its
  /// old content and yields `DirectoryError::SizeCeiling`.
  pub fn rebuild_with_progress<F>(&mut self,
                                  descriptors  : &[RegisterDescriptor],
                                  mut progress : F) -> Result<usize, DirectoryError>
    where F : FnMut(usize) {
    self.end_read();
    let mut ordered = BTreeMap::<&str, String>::new();
    for desc in descriptors {
      ordered.insert(&desc.name, desc.encode());
    }
    let rows : Vec<AddressTableRow> = ordered.into_iter()
      .map(|(name, descriptor)| AddressTableRow {
        name : String::from(name),
        descriptor
      })
      .collect();
    let n_rows      = rows.len();
    let mut is_full = false;
    let result = self.conn()?.transaction::<_, DieselError, _>(|conn| {
      let mut write_rows = || -> Result<(), DieselError> {
        diesel::delete(address_table::table).execute(conn)?;
        let mut written = 0usize;
        for chunk in rows.chunks(INSERT_CHUNK) {
          diesel::insert_into(address_table::table)
            .values(chunk)
            .execute(conn)?;
          written += chunk.len();
          progress(written);
        }
        Ok(())
      };
      // the first error decides, the rollback may fail on
      // its own once sqlite aborted the transaction itself
      write_rows().map_err(|err| {
        is_full = is_store_full(&err);
        err
      })
    });
    match result {
      Ok(_) => {
        info!("Rebuilt register store {} with {} registers", self.path, n_rows);
        Ok(n_rows)
      }
      Err(err) => {
        self.conn = None;
        if is_full {
          error!("Register store {} hit its size ceiling of {} MiB!", self.path, self.size_mb);
          Err(DirectoryError::SizeCeiling(self.size_mb))
        } else {
          error!("Rebuilding register store {} failed! {}", self.path, err);
          Err(DirectoryError::Query(err.to_string()))
        }
      }
    }
  }
}

impl Drop for RegisterDirectory {
  fn drop(&mut self) {
    self.end_read();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn descriptor_codec() {
    let mut desc = RegisterDescriptor::new("GEM_AMC.TTC.CTRL.L1A_ENABLE", 0x6440_0000, 0x1);
    desc.permissions = Permissions::READ;
    let value = desc.encode();
    assert_eq!(value, format!("{}|r|1|1|single", 0x6440_0000u32));
    assert_eq!(RegisterDescriptor::decode(&desc.name, &value).unwrap(), desc);
  }

  #[test]
  fn malformed_descriptors_are_rejected() {
    for bad in ["", "256|rw|255", "256|rw|255|1|single|x", "abc|rw|255|1|single",
                "256|rx|255|1|single", "256|rw|255|1|burst", "256||255|1|single"] {
      assert!(matches!(RegisterDescriptor::decode("A", bad),
                       Err(DirectoryError::MalformedDescriptor(_))), "{}", bad);
    }
  }

  #[test]
  fn modes_and_permissions() {
    assert_eq!(AccessMode::parse("incremental"), Some(AccessMode::Block));
    assert_eq!(AccessMode::parse("non-incremental"), Some(AccessMode::Fifo));
    assert_eq!(Permissions::parse("rw"), Some(Permissions::READ | Permissions::WRITE));
    assert_eq!(Permissions::parse("w").unwrap().to_perm_string(), "w");
  }
}
