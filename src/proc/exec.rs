//! Executable loading: header validation, segment installation into the
//! supplemental page table, and the argument-vector stack image.
//!
//! Grounded in `examples/original_source/src/userprog/process.c`'s `load`,
//! `validate_segment`, `load_segment`, `setup_stack` and
//! `push_args2stack`/`push_stack` (spec.md section 4.6). Real ELF parsing
//! is out of scope (spec.md section 1: "ELF parsing ... external
//! collaborators"); this crate uses a small self-describing header in its
//! place, read and validated the same way `load` validates `Elf32_Ehdr`
//! (magic, version, segment-count bound) before trusting any of it.

use std::sync::Arc;

use crate::bio::BufferCache;
use crate::block_device::BlockDevice;
use crate::error::{KResult, KernelError};
use crate::fs::inode::Inode;
use crate::fs::Filesystem;
use crate::param::{PGSIZE, USER_STACK_TOP};
use crate::sched::Tid;
use crate::vm::spt::{EntryKind, FileBacking, Residency, SptEntry, SupplementalPageTable};
use crate::vm::VirtualMemory;

pub const EXEC_MAGIC: [u8; 4] = *b"TOSX";
pub const EXEC_VERSION: u32 = 1;
pub const MAX_SEGMENTS: usize = 16;

const HEADER_FIXED_SIZE: usize = 16; // magic(4) + version(4) + entry(4) + phnum(4)
const SEGMENT_RECORD_SIZE: usize = 20; // vaddr, file_offset, file_size, mem_size, flags

#[derive(Debug, Clone)]
pub struct Segment {
    pub vaddr: u32,
    pub file_offset: u32,
    pub file_size: u32,
    pub mem_size: u32,
    pub writable: bool,
}

pub struct ExecutableHeader {
    pub entry_point: u32,
    pub segments: Vec<Segment>,
}

/// Reads and validates the header at the front of `inode`'s content: magic,
/// version, and a bounded segment count, mirroring the checks `load` makes
/// on `Elf32_Ehdr` before trusting `e_phnum`.
pub fn parse_header<D: BlockDevice>(cache: &BufferCache<D>, inode: &Inode<D>) -> KResult<ExecutableHeader> {
    let mut fixed = [0u8; HEADER_FIXED_SIZE];
    if inode.read_at(cache, &mut fixed, 0) < HEADER_FIXED_SIZE || fixed[0..4] != EXEC_MAGIC {
        return Err(KernelError::BadExecutable);
    }
    let version = u32::from_le_bytes(fixed[4..8].try_into().unwrap());
    let entry_point = u32::from_le_bytes(fixed[8..12].try_into().unwrap());
    let phnum = u32::from_le_bytes(fixed[12..16].try_into().unwrap()) as usize;
    if version != EXEC_VERSION || phnum > MAX_SEGMENTS {
        return Err(KernelError::BadExecutable);
    }

    let file_len = inode.readable_length();
    let mut segments = Vec::with_capacity(phnum);
    for i in 0..phnum {
        let mut rec = [0u8; SEGMENT_RECORD_SIZE];
        let off = HEADER_FIXED_SIZE + i * SEGMENT_RECORD_SIZE;
        if inode.read_at(cache, &mut rec, off) < SEGMENT_RECORD_SIZE {
            return Err(KernelError::BadExecutable);
        }
        let seg = Segment {
            vaddr: u32::from_le_bytes(rec[0..4].try_into().unwrap()),
            file_offset: u32::from_le_bytes(rec[4..8].try_into().unwrap()),
            file_size: u32::from_le_bytes(rec[8..12].try_into().unwrap()),
            mem_size: u32::from_le_bytes(rec[12..16].try_into().unwrap()),
            writable: u32::from_le_bytes(rec[16..20].try_into().unwrap()) & 1 != 0,
        };
        validate_segment(&seg, file_len)?;
        segments.push(seg);
    }
    Ok(ExecutableHeader { entry_point, segments })
}

/// Mirrors `validate_segment`'s checks: page-aligned start, `mem_size >=
/// file_size`, non-empty, within the file, and never mapping page 0.
fn validate_segment(seg: &Segment, file_len: u32) -> KResult<()> {
    if seg.vaddr % PGSIZE as u32 != 0 {
        return Err(KernelError::BadExecutable);
    }
    if seg.mem_size < seg.file_size || seg.mem_size == 0 {
        return Err(KernelError::BadExecutable);
    }
    if seg.file_offset > file_len {
        return Err(KernelError::BadExecutable);
    }
    if seg.vaddr < PGSIZE as u32 {
        return Err(KernelError::BadExecutable);
    }
    if seg.vaddr.checked_add(seg.mem_size).is_none() {
        return Err(KernelError::BadExecutable);
    }
    Ok(())
}

/// Installs one supplemental-page entry per page of every loadable segment
/// (spec.md section 4.5: "one entry per segment page, type CodeSegment or
/// DataSegment").
pub fn install_segments<D: BlockDevice + 'static>(
    spt: &SupplementalPageTable<D>,
    inode: &Arc<Inode<D>>,
    segments: &[Segment],
) {
    for seg in segments {
        let num_pages = (seg.mem_size as usize + PGSIZE - 1) / PGSIZE;
        for p in 0..num_pages {
            let page_vaddr = seg.vaddr + (p * PGSIZE) as u32;
            let page_off = (p * PGSIZE) as u32;
            let file_bytes_here = if page_off >= seg.file_size {
                0
            } else {
                (seg.file_size - page_off).min(PGSIZE as u32)
            };
            let kind = if seg.writable { EntryKind::DataSegment } else { EntryKind::CodeSegment };
            let backing = if file_bytes_here > 0 {
                Some(FileBacking {
                    inode: inode.clone(),
                    offset: seg.file_offset + page_off,
                    zero_tail: PGSIZE as u32 - file_bytes_here,
                    writable_back: false,
                })
            } else {
                None
            };
            spt.insert(SptEntry {
                page: page_vaddr,
                kind,
                writable: seg.writable,
                backing,
                residency: Residency::NotLoaded,
                dirty: false,
            });
        }
    }
}

/// The constructed argument-vector stack image for a single page (spec.md
/// section 6 "Shell command line on argv stack"), plus the resulting
/// initial stack pointer.
pub struct ArgvStack {
    pub page: [u8; PGSIZE],
    pub esp: u32,
}

fn push_bytes(page: &mut [u8; PGSIZE], esp_offset: &mut usize, bytes: &[u8]) {
    *esp_offset -= bytes.len();
    page[*esp_offset..*esp_offset + bytes.len()].copy_from_slice(bytes);
}

/// Builds the stack image exactly as `push_args2stack`/`push_stack` do:
/// argument bodies written high-to-low, word-aligned, a NULL argv
/// terminator, the argv pointer table, `argv`, `argc`, then a
/// return-address placeholder.
pub fn build_argv_stack(page_vaddr: u32, args: &[String]) -> ArgvStack {
    let mut page = [0u8; PGSIZE];
    let mut esp_offset = PGSIZE;

    let mut arg_addrs = vec![0u32; args.len()];
    for i in (0..args.len()).rev() {
        let mut bytes = args[i].as_bytes().to_vec();
        bytes.push(0);
        push_bytes(&mut page, &mut esp_offset, &bytes);
        arg_addrs[i] = page_vaddr + esp_offset as u32;
    }

    while esp_offset % 4 != 0 {
        push_bytes(&mut page, &mut esp_offset, &[0u8]);
    }

    push_bytes(&mut page, &mut esp_offset, &0u32.to_le_bytes());

    for i in (0..args.len()).rev() {
        push_bytes(&mut page, &mut esp_offset, &arg_addrs[i].to_le_bytes());
    }

    let argv_ptr = page_vaddr + esp_offset as u32;
    push_bytes(&mut page, &mut esp_offset, &argv_ptr.to_le_bytes());
    push_bytes(&mut page, &mut esp_offset, &(args.len() as u32).to_le_bytes());
    push_bytes(&mut page, &mut esp_offset, &0u32.to_le_bytes());

    ArgvStack {
        page,
        esp: page_vaddr + esp_offset as u32,
    }
}

/// A successfully loaded process image: the denied-write executable inode,
/// its supplemental page table, and the values needed to start it running.
pub struct LoadedImage<D: BlockDevice> {
    pub inode: Arc<Inode<D>>,
    pub spt: Arc<SupplementalPageTable<D>>,
    pub entry_point: u32,
    pub initial_esp: u32,
}

/// Parses the executable named by the first token of `command_line`,
/// installs its segments and initial stack, and writes the argv image into
/// the newly faulted-in stack page (spec.md section 4.6 `load`).
pub fn load<D: BlockDevice + 'static>(
    fs: &Arc<Filesystem<D>>,
    vm: &VirtualMemory<D>,
    tid: Tid,
    cwd_sector: u32,
    command_line: &str,
) -> KResult<LoadedImage<D>> {
    let args: Vec<String> = command_line.split_whitespace().map(str::to_string).collect();
    let exe_name = args.first().ok_or(KernelError::BadExecutable)?.clone();

    let inode = fs.open(cwd_sector, &exe_name)?;
    inode.deny_write();

    let result = (|| -> KResult<LoadedImage<D>> {
        let header = parse_header(&fs.cache, &inode)?;
        let spt = Arc::new(SupplementalPageTable::new());
        install_segments(&spt, &inode, &header.segments);

        let stack_page_vaddr = USER_STACK_TOP - PGSIZE as u32;
        spt.insert(SptEntry {
            page: stack_page_vaddr,
            kind: EntryKind::StackZero,
            writable: true,
            backing: None,
            residency: Residency::NotLoaded,
            dirty: false,
        });
        let frame_idx = vm.handle_fault(&spt, tid, stack_page_vaddr)?;
        let argv = build_argv_stack(stack_page_vaddr, &args);
        vm.frames.with_data(frame_idx, |d| *d = argv.page);

        Ok(LoadedImage {
            inode: inode.clone(),
            spt,
            entry_point: header.entry_point,
            initial_esp: argv.esp,
        })
    })();

    if result.is_err() {
        inode.allow_write();
        fs.close(&inode);
    }
    result
}

/// Test-only helper shared across modules: builds a minimal executable
/// image and writes it into a fresh file, for tests that need a loadable
/// process without caring about its segment contents.
#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    pub fn write_executable<D: BlockDevice + 'static>(
        fs: &Arc<Filesystem<D>>,
        name: &str,
        entry: u32,
        segments: &[(u32, u32, u32, u32, bool)],
    ) {
        let mut data = Vec::new();
        data.extend_from_slice(&EXEC_MAGIC);
        data.extend_from_slice(&EXEC_VERSION.to_le_bytes());
        data.extend_from_slice(&entry.to_le_bytes());
        data.extend_from_slice(&(segments.len() as u32).to_le_bytes());
        for &(vaddr, file_offset, file_size, mem_size, writable) in segments {
            data.extend_from_slice(&vaddr.to_le_bytes());
            data.extend_from_slice(&file_offset.to_le_bytes());
            data.extend_from_slice(&file_size.to_le_bytes());
            data.extend_from_slice(&mem_size.to_le_bytes());
            data.extend_from_slice(&(writable as u32).to_le_bytes());
        }
        fs.create(crate::param::ROOT_DIR_SECTOR, name, 0).unwrap();
        let inode = fs.open(crate::param::ROOT_DIR_SECTOR, name).unwrap();
        inode.write_at(&fs.cache, &fs.free_map, &data, 0).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_test_exe(data: &mut Vec<u8>, entry: u32, segments: &[(u32, u32, u32, u32, bool)]) {
        data.extend_from_slice(&EXEC_MAGIC);
        data.extend_from_slice(&EXEC_VERSION.to_le_bytes());
        data.extend_from_slice(&entry.to_le_bytes());
        data.extend_from_slice(&(segments.len() as u32).to_le_bytes());
        for &(vaddr, file_offset, file_size, mem_size, writable) in segments {
            data.extend_from_slice(&vaddr.to_le_bytes());
            data.extend_from_slice(&file_offset.to_le_bytes());
            data.extend_from_slice(&file_size.to_le_bytes());
            data.extend_from_slice(&mem_size.to_le_bytes());
            data.extend_from_slice(&(writable as u32).to_le_bytes());
        }
    }

    #[test]
    fn argv_stack_layout_matches_argc_and_pointer_chain() {
        let args = vec!["echo".to_string(), "a".to_string(), "bb".to_string()];
        let page_vaddr = 0xC000_0000u32 - PGSIZE as u32;
        let stack = build_argv_stack(page_vaddr, &args);

        assert_eq!(stack.esp % 4, 0, "esp must be word-aligned");

        let mut off = (stack.esp - page_vaddr) as usize;
        let return_addr = u32::from_le_bytes(stack.page[off..off + 4].try_into().unwrap());
        assert_eq!(return_addr, 0);
        off += 4;
        let argc = u32::from_le_bytes(stack.page[off..off + 4].try_into().unwrap());
        assert_eq!(argc, 3);
        off += 4;
        let argv_ptr = u32::from_le_bytes(stack.page[off..off + 4].try_into().unwrap());

        let mut entry_off = (argv_ptr - page_vaddr) as usize;
        for expected in &args {
            let str_ptr = u32::from_le_bytes(stack.page[entry_off..entry_off + 4].try_into().unwrap());
            let str_off = (str_ptr - page_vaddr) as usize;
            let end = stack.page[str_off..].iter().position(|&b| b == 0).unwrap();
            assert_eq!(&stack.page[str_off..str_off + end], expected.as_bytes());
            entry_off += 4;
        }
        let terminator = u32::from_le_bytes(stack.page[entry_off..entry_off + 4].try_into().unwrap());
        assert_eq!(terminator, 0);
    }

    fn new_fs() -> Arc<Filesystem<crate::block_device::MemBlockDevice>> {
        let dev = Arc::new(crate::block_device::MemBlockDevice::new(4096));
        Filesystem::format(dev).unwrap()
    }

    #[test]
    fn header_with_too_many_segments_is_rejected() {
        let fs = new_fs();
        let mut data = Vec::new();
        data.extend_from_slice(&EXEC_MAGIC);
        data.extend_from_slice(&EXEC_VERSION.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&((MAX_SEGMENTS + 1) as u32).to_le_bytes());
        fs.create(crate::param::ROOT_DIR_SECTOR, "bad", 0).unwrap();
        let inode = fs.open(crate::param::ROOT_DIR_SECTOR, "bad").unwrap();
        inode.write_at(&fs.cache, &fs.free_map, &data, 0).unwrap();

        let err = parse_header(&fs.cache, &inode).unwrap_err();
        assert_eq!(err, KernelError::BadExecutable);
    }

    #[test]
    fn valid_header_round_trips_through_parse() {
        let fs = new_fs();
        let mut data = Vec::new();
        write_test_exe(&mut data, 0x1000, &[(PGSIZE as u32, 0, 10, PGSIZE as u32, false)]);
        fs.create(crate::param::ROOT_DIR_SECTOR, "good", 0).unwrap();
        let inode = fs.open(crate::param::ROOT_DIR_SECTOR, "good").unwrap();
        inode.write_at(&fs.cache, &fs.free_map, &data, 0).unwrap();

        let header = parse_header(&fs.cache, &inode).unwrap();
        assert_eq!(header.entry_point, 0x1000);
        assert_eq!(header.segments.len(), 1);
        assert_eq!(header.segments[0].vaddr, PGSIZE as u32);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let fs = new_fs();
        let mut data = Vec::new();
        write_test_exe(&mut data, 0x1000, &[(PGSIZE as u32, 0, 10, PGSIZE as u32, false)]);
        data[0] = b'X';
        fs.create(crate::param::ROOT_DIR_SECTOR, "corrupt", 0).unwrap();
        let inode = fs.open(crate::param::ROOT_DIR_SECTOR, "corrupt").unwrap();
        inode.write_at(&fs.cache, &fs.free_map, &data, 0).unwrap();

        let err = parse_header(&fs.cache, &inode).unwrap_err();
        assert_eq!(err, KernelError::BadExecutable);
    }
}
