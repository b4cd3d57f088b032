//! Per-process state and the process table: spawn, wait, exit, the open-file
//! descriptor table, current-working-directory and memory-mapping
//! bookkeeping (spec.md section 3 "Per-Process State", section 4.6).
//!
//! Grounded in `examples/original_source/src/userprog/process.c`'s
//! `process_execute`/`process_wait`/`process_exit` and
//! `examples/original_source/src/userprog/syscall.c`'s file-descriptor table
//! for the shape; the wait block is redesigned per spec.md section 9 as a
//! heap-allocated structure shared by `Arc` between parent and child rather
//! than a linked-list node embedded in either's control block, and the
//! condvar-plus-mutex pairing follows `bio.rs`'s `Slot` (a `Mutex<State>`
//! alongside a `Condvar`) rather than `crate::lock`'s donation-aware `Lock`,
//! since wait blocks need no priority bookkeeping of their own.

pub mod exec;

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use tracing::{info, trace};

use crate::block_device::BlockDevice;
use crate::error::{KResult, KernelError};
use crate::fs::inode::Inode;
use crate::fs::Filesystem;
use crate::lock::SchedulerHandle;
use crate::param::{FD_STDIN, FD_STDOUT, FIRST_FD, ROOT_DIR_SECTOR};
use crate::proc::exec::load;
use crate::sched::Tid;
use crate::vm::spt::SupplementalPageTable;
use crate::vm::VirtualMemory;

/// A process's view of one open file: the shared inode plus its own seek
/// position (spec.md section 3: "table of open files (descriptor -> (file
/// handle, cached name))").
pub struct OpenFile<D: BlockDevice> {
    pub inode: Arc<Inode<D>>,
    pub name: String,
    pos: Mutex<usize>,
}

struct WaitBlockState {
    exited: bool,
    exit_code: i32,
}

/// Heap-allocated, co-owned by the parent's child list and the child
/// process's own pointer to it; freed once both sides have dropped their
/// `Arc` (spec.md section 3 "Wait Block", section 9 redesign flag).
pub struct WaitBlock {
    pub child_tid: Tid,
    state: Mutex<WaitBlockState>,
    cv: Condvar,
}

impl WaitBlock {
    fn new(child_tid: Tid) -> Arc<Self> {
        Arc::new(Self {
            child_tid,
            state: Mutex::new(WaitBlockState {
                exited: false,
                exit_code: 0,
            }),
            cv: Condvar::new(),
        })
    }

    fn signal_exit(&self, exit_code: i32) {
        let mut s = self.state.lock().unwrap();
        s.exited = true;
        s.exit_code = exit_code;
        self.cv.notify_all();
    }

    /// Blocks until the child has exited, then returns its exit code. The
    /// caller (`ProcessTable::wait`) removes this block from the parent's
    /// child list right after, so a block is never waited on twice; a
    /// second `wait` on the same child tid instead fails with `NotAChild`.
    fn wait_for_exit(&self) -> KResult<i32> {
        let mut s = self.state.lock().unwrap();
        while !s.exited {
            s = self.cv.wait(s).unwrap();
        }
        Ok(s.exit_code)
    }
}

struct MappedRegion {
    pages: Vec<u32>,
}

/// Per-process state (spec.md section 3). Descriptors 0 and 1 are reserved
/// for console input/output and never appear in `files`.
pub struct Process<D: BlockDevice> {
    pub tid: Tid,
    pub argv: Vec<String>,
    cwd_sector: Mutex<u32>,
    files: Mutex<HashMap<u32, Arc<OpenFile<D>>>>,
    next_fd: Mutex<u32>,
    exit_code: Mutex<i32>,
    /// Wait blocks for children this process has not yet reaped.
    children: Mutex<Vec<Arc<WaitBlock>>>,
    /// This process's own wait block, shared with its parent; `None` for
    /// the initial process, which has no parent to wait on it.
    own_wait: Option<Arc<WaitBlock>>,
    mmaps: Mutex<HashMap<u32, MappedRegion>>,
    next_mapid: Mutex<u32>,
    pub spt: Arc<SupplementalPageTable<D>>,
    /// The executable inode, kept open and write-denied for the process's
    /// lifetime (spec.md section 4.6 `load`/`process_exit`).
    exec_inode: Arc<Inode<D>>,
}

impl<D: BlockDevice + 'static> Process<D> {
    fn next_descriptor(&self) -> u32 {
        let mut n = self.next_fd.lock().unwrap();
        let fd = *n;
        *n += 1;
        fd
    }

    pub fn cwd_sector(&self) -> u32 {
        *self.cwd_sector.lock().unwrap()
    }

    fn set_cwd_sector(&self, sector: u32) {
        *self.cwd_sector.lock().unwrap() = sector;
    }

    pub fn exit_code(&self) -> i32 {
        *self.exit_code.lock().unwrap()
    }
}

/// Owns the filesystem, virtual memory, and scheduler shared by every
/// process, and the process registry keyed by tid (spec.md section 4.6).
pub struct ProcessTable<D: BlockDevice> {
    fs: Arc<Filesystem<D>>,
    vm: Arc<VirtualMemory<D>>,
    scheduler: SchedulerHandle,
    processes: Mutex<HashMap<Tid, Arc<Process<D>>>>,
}

impl<D: BlockDevice + 'static> ProcessTable<D> {
    pub fn new(fs: Arc<Filesystem<D>>, vm: Arc<VirtualMemory<D>>, scheduler: SchedulerHandle) -> Self {
        Self {
            fs,
            vm,
            scheduler,
            processes: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, tid: Tid) -> Option<Arc<Process<D>>> {
        self.processes.lock().unwrap().get(&tid).cloned()
    }

    /// Creates the first process in the system: no parent, so no wait
    /// block is created or expected to be waited on.
    pub fn spawn_initial(&self, command_line: &str) -> KResult<Tid> {
        self.spawn_inner(None, ROOT_DIR_SECTOR, command_line)
    }

    /// Loads and registers a new child process of `parent_tid`, returning
    /// its tid (spec.md section 4.6 `exec`/`process_execute`). The wait
    /// block is created here and linked into both the parent's child list
    /// and the child's own `own_wait`, so either side's `exit`/`wait` can
    /// find it without a lookup back through the table.
    pub fn spawn(&self, parent_tid: Tid, command_line: &str) -> KResult<Tid> {
        let cwd_sector = self
            .get(parent_tid)
            .ok_or(KernelError::InvalidArgument)?
            .cwd_sector();
        self.spawn_inner(Some(parent_tid), cwd_sector, command_line)
    }

    fn spawn_inner(&self, parent_tid: Option<Tid>, cwd_sector: u32, command_line: &str) -> KResult<Tid> {
        let (tid, _preempt) = self.scheduler.lock().unwrap().spawn(
            command_line.split_whitespace().next().unwrap_or(""),
            crate::param::PRI_DEFAULT,
        );

        let loaded = match load(&self.fs, &self.vm, tid, cwd_sector, command_line) {
            Ok(loaded) => loaded,
            Err(e) => {
                self.scheduler.lock().unwrap().exit_current();
                return Err(e);
            }
        };

        let own_wait = parent_tid.map(|_| WaitBlock::new(tid));
        if let (Some(parent_tid), Some(wb)) = (parent_tid, &own_wait) {
            if let Some(parent) = self.get(parent_tid) {
                parent.children.lock().unwrap().push(wb.clone());
            }
        }

        let process = Arc::new(Process {
            tid,
            argv: command_line.split_whitespace().map(str::to_string).collect(),
            cwd_sector: Mutex::new(cwd_sector),
            files: Mutex::new(HashMap::new()),
            next_fd: Mutex::new(FIRST_FD),
            exit_code: Mutex::new(0),
            children: Mutex::new(Vec::new()),
            own_wait,
            mmaps: Mutex::new(HashMap::new()),
            next_mapid: Mutex::new(0),
            spt: loaded.spt,
            exec_inode: loaded.inode,
        });
        self.processes.lock().unwrap().insert(tid, process);
        info!(tid, entry_point = loaded.entry_point, "process loaded");
        Ok(tid)
    }

    /// Blocks `waiter` until `child_tid` exits, then removes and returns its
    /// exit code. Fails if `child_tid` is not one of `waiter`'s own
    /// children (spec.md section 4.6 `wait`).
    pub fn wait(&self, waiter_tid: Tid, child_tid: Tid) -> KResult<i32> {
        let waiter = self.get(waiter_tid).ok_or(KernelError::InvalidArgument)?;
        let index = {
            let children = waiter.children.lock().unwrap();
            children.iter().position(|wb| wb.child_tid == child_tid)
        };
        let index = index.ok_or(KernelError::NotAChild)?;
        let wb = waiter.children.lock().unwrap()[index].clone();
        let code = wb.wait_for_exit()?;
        waiter.children.lock().unwrap().remove(index);
        Ok(code)
    }

    /// Tears down `tid`'s address space and open files, signals its wait
    /// block (if any), and orphans its own children so a later `wait` on
    /// them still resolves correctly through their own wait blocks (spec.md
    /// section 4.6 `process_exit`: "scrubs children's wait blocks by
    /// nulling their parent-side linkage").
    pub fn exit(&self, tid: Tid, exit_code: i32) {
        let process = match self.processes.lock().unwrap().remove(&tid) {
            Some(p) => p,
            None => return,
        };
        *process.exit_code.lock().unwrap() = exit_code;

        self.vm.cleanup_process(&process.spt);

        for (_, file) in process.files.lock().unwrap().drain() {
            self.fs.close(&file.inode);
        }
        process.exec_inode.allow_write();
        self.fs.close(&process.exec_inode);

        // An exiting process's own still-unreaped children become
        // unreachable: their wait blocks are simply dropped here, which is
        // safe because each child also holds no back-reference to its
        // parent's wait-block list.
        process.children.lock().unwrap().clear();

        if let Some(wb) = &process.own_wait {
            wb.signal_exit(exit_code);
        }

        self.scheduler.lock().unwrap().exit_current();
        trace!(tid, exit_code, "process exited");
    }

    // --- open-file descriptor table (spec.md section 4.6) ---

    pub fn open(&self, tid: Tid, path: &str) -> KResult<u32> {
        let process = self.get(tid).ok_or(KernelError::InvalidArgument)?;
        if process.files.lock().unwrap().len() >= crate::param::MAX_OPEN_FILES {
            return Err(KernelError::TooManyOpenFiles);
        }
        let inode = self.fs.open(process.cwd_sector(), path)?;
        let fd = process.next_descriptor();
        process.files.lock().unwrap().insert(
            fd,
            Arc::new(OpenFile {
                inode,
                name: path.to_string(),
                pos: Mutex::new(0),
            }),
        );
        Ok(fd)
    }

    fn file_of(&self, process: &Process<D>, fd: u32) -> KResult<Arc<OpenFile<D>>> {
        if fd == FD_STDIN || fd == FD_STDOUT {
            return Err(KernelError::BadDescriptor);
        }
        process
            .files
            .lock()
            .unwrap()
            .get(&fd)
            .cloned()
            .ok_or(KernelError::BadDescriptor)
    }

    pub fn filesize(&self, tid: Tid, fd: u32) -> KResult<u32> {
        let process = self.get(tid).ok_or(KernelError::InvalidArgument)?;
        let file = self.file_of(&process, fd)?;
        Ok(file.inode.readable_length())
    }

    pub fn read(&self, tid: Tid, fd: u32, buf: &mut [u8]) -> KResult<usize> {
        let process = self.get(tid).ok_or(KernelError::InvalidArgument)?;
        let file = self.file_of(&process, fd)?;
        let mut pos = file.pos.lock().unwrap();
        let n = file.inode.read_at(&self.fs.cache, buf, *pos);
        *pos += n;
        Ok(n)
    }

    pub fn write(&self, tid: Tid, fd: u32, buf: &[u8]) -> KResult<usize> {
        let process = self.get(tid).ok_or(KernelError::InvalidArgument)?;
        let file = self.file_of(&process, fd)?;
        let mut pos = file.pos.lock().unwrap();
        let n = file.inode.write_at(&self.fs.cache, &self.fs.free_map, buf, *pos)?;
        *pos += n;
        Ok(n)
    }

    pub fn seek(&self, tid: Tid, fd: u32, position: usize) -> KResult<()> {
        let process = self.get(tid).ok_or(KernelError::InvalidArgument)?;
        let file = self.file_of(&process, fd)?;
        *file.pos.lock().unwrap() = position;
        Ok(())
    }

    pub fn tell(&self, tid: Tid, fd: u32) -> KResult<usize> {
        let process = self.get(tid).ok_or(KernelError::InvalidArgument)?;
        let file = self.file_of(&process, fd)?;
        Ok(*file.pos.lock().unwrap())
    }

    pub fn close(&self, tid: Tid, fd: u32) -> KResult<()> {
        let process = self.get(tid).ok_or(KernelError::InvalidArgument)?;
        let file = process
            .files
            .lock()
            .unwrap()
            .remove(&fd)
            .ok_or(KernelError::BadDescriptor)?;
        self.fs.close(&file.inode);
        Ok(())
    }

    pub fn isdir(&self, tid: Tid, fd: u32) -> KResult<bool> {
        let process = self.get(tid).ok_or(KernelError::InvalidArgument)?;
        let file = self.file_of(&process, fd)?;
        Ok(file.inode.is_dir())
    }

    pub fn inumber(&self, tid: Tid, fd: u32) -> KResult<u32> {
        let process = self.get(tid).ok_or(KernelError::InvalidArgument)?;
        let file = self.file_of(&process, fd)?;
        Ok(file.inode.disk_sector())
    }

    pub fn readdir(&self, tid: Tid, fd: u32) -> KResult<Vec<String>> {
        let process = self.get(tid).ok_or(KernelError::InvalidArgument)?;
        let file = self.file_of(&process, fd)?;
        self.fs.readdir(&file.inode)
    }

    // --- filesystem passthroughs scoped by the calling process's cwd ---

    pub fn create(&self, tid: Tid, path: &str, initial_size: u32) -> KResult<()> {
        let process = self.get(tid).ok_or(KernelError::InvalidArgument)?;
        self.fs.create(process.cwd_sector(), path, initial_size)
    }

    pub fn remove(&self, tid: Tid, path: &str) -> KResult<()> {
        let process = self.get(tid).ok_or(KernelError::InvalidArgument)?;
        self.fs.remove(process.cwd_sector(), path)
    }

    pub fn mkdir(&self, tid: Tid, path: &str) -> KResult<()> {
        let process = self.get(tid).ok_or(KernelError::InvalidArgument)?;
        self.fs.mkdir(process.cwd_sector(), path)
    }

    pub fn chdir(&self, tid: Tid, path: &str) -> KResult<()> {
        let process = self.get(tid).ok_or(KernelError::InvalidArgument)?;
        let sector = self.fs.resolve_dir_sector(process.cwd_sector(), path)?;
        process.set_cwd_sector(sector);
        Ok(())
    }

    // --- memory-mapped files (spec.md section 4.5/4.6 `mmap`/`munmap`) ---

    pub fn mmap(&self, tid: Tid, fd: u32, start_page: u32, writable: bool) -> KResult<u32> {
        let process = self.get(tid).ok_or(KernelError::InvalidArgument)?;
        let file = self.file_of(&process, fd)?;
        let pages = self.vm.mmap(&process.spt, file.inode.clone(), start_page, writable)?;
        let mut mapid = process.next_mapid.lock().unwrap();
        let id = *mapid;
        *mapid += 1;
        process.mmaps.lock().unwrap().insert(id, MappedRegion { pages });
        Ok(id)
    }

    pub fn munmap(&self, tid: Tid, mapid: u32) -> KResult<()> {
        let process = self.get(tid).ok_or(KernelError::InvalidArgument)?;
        let region = process
            .mmaps
            .lock()
            .unwrap()
            .remove(&mapid)
            .ok_or(KernelError::InvalidArgument)?;
        self.vm.munmap(&process.spt, &region.pages);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::MemBlockDevice;
    use crate::proc::exec::tests_support::write_executable;
    use crate::sched::Scheduler;
    use std::sync::Mutex as StdMutex;

    fn setup() -> ProcessTable<MemBlockDevice> {
        let dev = Arc::new(MemBlockDevice::new(8192));
        let fs = Filesystem::format(dev).unwrap();
        let swap_dev = Arc::new(MemBlockDevice::new(256));
        let vm = Arc::new(VirtualMemory::new(8, swap_dev, fs.clone()));
        write_executable(&fs, "child", 0x1000, &[(4096, 0, 0, 4096, false)]);
        write_executable(&fs, "init", 0x1000, &[(4096, 0, 0, 4096, false)]);
        let scheduler = Arc::new(StdMutex::new(Scheduler::new()));
        ProcessTable::new(fs, vm, scheduler)
    }

    #[test]
    fn spawn_wait_reaps_exit_code() {
        let table = setup();
        let init = table.spawn_initial("init").unwrap();
        let child = table.spawn(init, "child").unwrap();
        table.exit(child, 42);
        let code = table.wait(init, child).unwrap();
        assert_eq!(code, 42);
    }

    #[test]
    fn waiting_twice_on_the_same_child_fails_the_second_time() {
        let table = setup();
        let init = table.spawn_initial("init").unwrap();
        let child = table.spawn(init, "child").unwrap();
        table.exit(child, 7);
        assert_eq!(table.wait(init, child).unwrap(), 7);
        let err = table.wait(init, child).unwrap_err();
        assert_eq!(err, KernelError::NotAChild);
    }

    #[test]
    fn waiting_on_a_non_child_fails() {
        let table = setup();
        let init = table.spawn_initial("init").unwrap();
        let err = table.wait(init, 9999).unwrap_err();
        assert_eq!(err, KernelError::NotAChild);
    }

    #[test]
    fn open_read_write_close_round_trips_through_a_descriptor() {
        let table = setup();
        let init = table.spawn_initial("init").unwrap();
        table.create(init, "greeting", 0).unwrap();
        let fd = table.open(init, "greeting").unwrap();
        table.write(init, fd, b"hello").unwrap();
        table.seek(init, fd, 0).unwrap();
        let mut buf = [0u8; 5];
        let n = table.read(init, fd, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
        table.close(init, fd).unwrap();
    }

    #[test]
    fn stdio_descriptors_are_never_usable_as_file_descriptors() {
        let table = setup();
        let init = table.spawn_initial("init").unwrap();
        let err = table.read(init, FD_STDIN, &mut [0u8; 1]).unwrap_err();
        assert_eq!(err, KernelError::BadDescriptor);
        let err = table.write(init, FD_STDOUT, b"x").unwrap_err();
        assert_eq!(err, KernelError::BadDescriptor);
    }

    #[test]
    fn mmap_then_munmap_releases_the_mapping() {
        let table = setup();
        let init = table.spawn_initial("init").unwrap();
        table.create(init, "mapped", 0).unwrap();
        let fd = table.open(init, "mapped").unwrap();
        table.write(init, fd, &[b'a'; 50]).unwrap();

        let mapid = table.mmap(init, fd, 0x50000, true).unwrap();
        table.munmap(init, mapid).unwrap();
        let err = table.munmap(init, mapid).unwrap_err();
        assert_eq!(err, KernelError::InvalidArgument);
    }

    #[test]
    fn exit_orphans_unreaped_children_without_panicking() {
        let table = setup();
        let init = table.spawn_initial("init").unwrap();
        let child = table.spawn(init, "child").unwrap();
        table.exit(init, 0);
        table.exit(child, 1);
    }

    #[test]
    fn the_129th_open_descriptor_fails_but_the_128th_succeeds() {
        let table = setup();
        let init = table.spawn_initial("init").unwrap();
        table.create(init, "shared", 0).unwrap();
        for _ in 0..crate::param::MAX_OPEN_FILES {
            table.open(init, "shared").unwrap();
        }
        let err = table.open(init, "shared").unwrap_err();
        assert_eq!(err, KernelError::TooManyOpenFiles);
    }
}
