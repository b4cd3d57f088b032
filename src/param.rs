//! Compile-time configuration constants.
//!
//! A kernel has no runtime configuration file; these constants are the
//! idiomatic stand-in, exactly as the teacher keeps them in one flat module.

/// Bytes per disk sector.
pub const SECTOR_SIZE: usize = 512;

/// Bytes per virtual-memory page / frame.
pub const PGSIZE: usize = 4096;

/// Sectors per page (used for swap slot sizing).
pub const SECTORS_PER_PAGE: usize = PGSIZE / SECTOR_SIZE;

/// Number of slots in the buffer cache.
pub const CACHE_SIZE: usize = 64;

/// Default size of the user-frame physical memory pool (a teaching-OS
/// stand-in for "however much RAM the real machine has"; scenario 4 in
/// spec.md section 8 shrinks this to 1 to force eviction).
pub const DEFAULT_NUM_FRAMES: usize = 32;

/// Sectors making up one swap slot (one page's worth).
pub const SWAP_SLOT_SECTORS: usize = SECTORS_PER_PAGE;

/// Seconds between write-behind daemon passes.
pub const WRITE_BEHIND_INTERVAL_SECS: u64 = 30;

/// Sentinel sector id meaning "no sector" / invalid.
pub const INVALID_SECTOR: u32 = u32::MAX;

/// Direct blocks recorded in an on-disk inode (see SPEC_FULL.md: the
/// on-disk layout in spec.md section 6 is byte-exact only with 123 direct
/// entries: 4 + 4 + 4 + 123*4 + 4 + 4 == 512).
pub const DIRECT_BLOCKS: usize = 123;

/// Sector-index entries per indirect block (512 bytes / 4 bytes each).
pub const INDIRECT_BLOCKS: usize = SECTOR_SIZE / core::mem::size_of::<u32>();

/// Maximum file size in sectors: direct + single-indirect + double-indirect.
pub const MAX_FILE_SECTORS: usize =
    DIRECT_BLOCKS + INDIRECT_BLOCKS + INDIRECT_BLOCKS * INDIRECT_BLOCKS;

/// Maximum file size in bytes (~8 MiB).
pub const MAX_FILE_BYTES: u32 = (MAX_FILE_SECTORS * SECTOR_SIZE) as u32;

/// Longest path component, excluding the NUL terminator.
pub const NAME_MAX: usize = 14;

/// Reserved sector holding the free map's inode.
pub const FREE_MAP_SECTOR: u32 = 0;

/// Reserved sector holding the root directory's inode.
pub const ROOT_DIR_SECTOR: u32 = 1;

/// First sector available for general allocation.
pub const FIRST_DATA_SECTOR: u32 = 2;

/// Inode on-disk magic number (ASCII "INOD" read little-endian).
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// Lowest thread priority.
pub const PRI_MIN: u8 = 0;

/// Highest thread priority.
pub const PRI_MAX: u8 = 63;

/// Default priority assigned to a newly spawned thread.
pub const PRI_DEFAULT: u8 = 31;

/// Timer ticks in a thread's scheduling quantum.
pub const TIME_SLICE: u32 = 4;

/// Timer ticks per simulated second.
pub const TIMER_FREQ: u32 = 100;

/// Maximum chain length a priority donation may traverse.
pub const MAX_DONATION_DEPTH: u32 = 8;

/// Binary point of the Q17.14 fixed-point format used by MLFQS.
pub const FIXED_POINT_SHIFT: u32 = 14;

/// Per-process open file descriptor budget (fds 0 and 1 are reserved).
pub const MAX_OPEN_FILES: usize = 128;

/// Maximum number of in-memory open inodes system-wide.
pub const MAX_OPEN_INODES: usize = 256;

/// Maximum command-line argument count passed to a spawned process.
pub const MAX_ARGS: usize = 32;

/// Distance below the saved user stack pointer at which an access is still
/// considered a legitimate stack-growth fault.
pub const STACK_GROWTH_HEADROOM: u32 = 32;

/// Lowest address the user stack is permitted to grow down to.
pub const STACK_LIMIT_PAGES: usize = 2048;

/// Top of user virtual address space; the initial stack page sits one page
/// below this (a teaching-OS stand-in for Pintos's `PHYS_BASE`).
pub const USER_STACK_TOP: u32 = 0xC000_0000;

/// Reserved file descriptors for console input/output; the first
/// process-assignable descriptor is 2.
pub const FD_STDIN: u32 = 0;
pub const FD_STDOUT: u32 = 1;
pub const FIRST_FD: u32 = 2;

/// Longest path string the syscall dispatcher will walk out of user memory
/// before giving up and killing the caller (spec.md section 4.6: "strings
/// are walked byte-by-byte until a NUL is found").
pub const MAX_PATH_LEN: usize = 512;

/// Largest single read/write buffer the dispatcher will copy to or from
/// user memory in one syscall.
pub const MAX_SYSCALL_BUF: usize = 64 * 1024;
