//! Hardware and environment constants of the GE1/1 CTP7 system
//!
//! These bound all mask widths, loop ranges and
//! blob layouts used by the modules.

/// Number of OptoHybrids (optical links) per AMC
pub const OH_PER_AMC          : u32 = 12;
/// Number of VFAT3 ASICs per OptoHybrid
pub const VFATS_PER_OH        : u32 = 24;
/// Number of channels per VFAT3
pub const CHANNELS_PER_VFAT   : u32 = 128;
/// Number of GBTx chips per OptoHybrid
pub const GBTS_PER_OH         : u32 = 3;
/// Number of 8bit configuration registers of a GBTx
pub const GBT_CONFIG_SIZE     : u32 = 366;
/// Number of 16bit configuration registers of a VFAT3
pub const VFAT_CONFIG_SIZE    : u32 = 147;
/// Number of 32bit configuration words of an OptoHybrid FPGA
pub const OH_CONFIG_SIZE      : u32 = 100;
/// Number of sbits of an OptoHybrid. Cluster addresses
/// at or above this are invalid
pub const SBITS_PER_OH        : u32 = 1536;

/// Smallest elink rx phase of the GBTx
pub const GBT_PHASE_MIN       : u8  = 0;
/// Largest elink rx phase of the GBTx
pub const GBT_PHASE_MAX       : u8  = 15;

/// Blaster RAM words per GBTx (366 bytes + padding)
pub const GBT_SINGLE_RAM_SIZE  : usize = 92;
/// Blaster RAM words per VFAT (147 16bit words + padding)
pub const VFAT_SINGLE_RAM_SIZE : usize = 74;
/// Blaster RAM words per OptoHybrid (100 words, each with its local address)
pub const OH_SINGLE_RAM_SIZE   : usize = 2*100;

/// Mask with all 24 VFAT bits set
pub const ALL_VFATS_BITS      : u32 = 0x00ff_ffff;
/// Mask with all 12 OH bits set
pub const ALL_OHS_BITS        : u32 = 0x0000_0fff;
/// The default VFAT mask of the broadcast and dac scan
/// requests (nothing masked out of the 24 VFATs)
pub const DEFAULT_VFAT_MASK   : u32 = 0xff00_0000;

/// Value which is returned by a masked register
/// read when the register could not be accessed
pub const DEADDEAD            : u32 = 0xdead_dead;

/// Environment variable pointing to the directory with
/// the register store and hardware dump artifacts
pub const GEM_PATH_ENV        : &str = "GEM_PATH";
/// Environment variable pointing to an optional logging
/// configuration file
pub const LOG_CONFIG_ENV      : &str = "CTP7_LOG_CONFIG";
/// The filter which is used if no other logging
/// configuration is available
pub const DEFAULT_LOG_FILTER  : &str = "info";
/// File name of the register store in the GEM_PATH
pub const ADDRESS_TABLE_STORE : &str = "address_table.mdb";
/// Name of the POSIX semaphore guarding the memory device
pub const MEMHUB_SEMAPHORE    : &str = "/memhub";
/// Maximum size of the register store in MiB
pub const DEFAULT_MAP_SIZE_MB : u64 = 40;
