//! Syscall dispatcher: decodes a syscall number plus register-style
//! arguments, validates every user-memory argument against the caller's
//! supplemental page table, and forwards to `ProcessTable`/`Filesystem`
//! (spec.md section 4.6 "Syscall Layer").
//!
//! Grounded in `examples/original_source/src/userprog/syscall.c`'s
//! `syscall_handler` (one big dispatch switch over an argument vector
//! pulled off the user stack) and spec.md section 4.6's pointer-validation
//! rule: "the dispatcher validates each user pointer argument by checking
//! that each page it touches is present in the caller's supplemental page
//! table... a thread that page-faults on an unmapped address outside its
//! stack region exits with code -1."

use crate::block_device::BlockDevice;
use crate::error::{KResult, KernelError};
use crate::param::{MAX_PATH_LEN, MAX_SYSCALL_BUF};
use crate::proc::ProcessTable;
use crate::sched::Tid;
use crate::vm::VirtualMemory;

/// One decoded syscall and its arguments. Pointer-typed arguments (`_ptr`
/// fields) are user virtual addresses, validated by `dispatch` before use;
/// nothing here trusts them yet.
#[derive(Debug, Clone)]
pub enum Syscall {
    Halt,
    Exit { status: i32 },
    Exec { cmdline_ptr: u32 },
    Wait { child_tid: Tid },
    Create { path_ptr: u32, initial_size: u32 },
    Remove { path_ptr: u32 },
    Open { path_ptr: u32 },
    Filesize { fd: u32 },
    Read { fd: u32, buf_ptr: u32, len: u32 },
    Write { fd: u32, buf_ptr: u32, len: u32 },
    Seek { fd: u32, position: u32 },
    Tell { fd: u32 },
    Close { fd: u32 },
    Mmap { fd: u32, addr: u32 },
    Munmap { mapid: u32 },
    Chdir { path_ptr: u32 },
    Mkdir { path_ptr: u32 },
    Readdir { fd: u32, buf_ptr: u32 },
    Isdir { fd: u32 },
    Inumber { fd: u32 },
}

/// `Halt` carries no return value; every other syscall returns a signed
/// result the caller places in its return register (byte counts, fds,
/// booleans as 0/1, and `-1` on the errors Pintos syscalls report this
/// way).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    Halted,
    Value(i32),
}

/// Dispatches one syscall on behalf of `tid`. Any `BadUserAccess` that
/// surfaces while validating or copying a pointer argument kills the
/// calling process with exit code -1 instead of propagating, matching
/// spec.md section 7's page-fault-outside-the-stack rule generalized to
/// every user pointer a syscall touches.
pub fn dispatch<D: BlockDevice + 'static>(
    tid: Tid,
    call: Syscall,
    processes: &ProcessTable<D>,
    vm: &VirtualMemory<D>,
) -> SyscallOutcome {
    match run(tid, call, processes, vm) {
        Ok(outcome) => outcome,
        Err(KernelError::BadUserAccess) => {
            processes.exit(tid, -1);
            SyscallOutcome::Value(-1)
        }
        Err(_) => SyscallOutcome::Value(-1),
    }
}

fn run<D: BlockDevice + 'static>(
    tid: Tid,
    call: Syscall,
    processes: &ProcessTable<D>,
    vm: &VirtualMemory<D>,
) -> KResult<SyscallOutcome> {
    use Syscall::*;

    let read_path = |ptr: u32| -> KResult<String> {
        let process = processes.get(tid).ok_or(KernelError::BadUserAccess)?;
        vm.read_user_cstr(&process.spt, tid, ptr, MAX_PATH_LEN)
    };

    match call {
        Halt => Ok(SyscallOutcome::Halted),

        Exit { status } => {
            processes.exit(tid, status);
            Ok(SyscallOutcome::Value(status))
        }

        Exec { cmdline_ptr } => {
            let cmdline = read_path(cmdline_ptr)?;
            let child = processes.spawn(tid, &cmdline)?;
            Ok(SyscallOutcome::Value(child as i32))
        }

        Wait { child_tid } => {
            let code = processes.wait(tid, child_tid)?;
            Ok(SyscallOutcome::Value(code))
        }

        Create { path_ptr, initial_size } => {
            let path = read_path(path_ptr)?;
            processes.create(tid, &path, initial_size)?;
            Ok(SyscallOutcome::Value(1))
        }

        Remove { path_ptr } => {
            let path = read_path(path_ptr)?;
            processes.remove(tid, &path)?;
            Ok(SyscallOutcome::Value(1))
        }

        Open { path_ptr } => {
            let path = read_path(path_ptr)?;
            let fd = processes.open(tid, &path)?;
            Ok(SyscallOutcome::Value(fd as i32))
        }

        Filesize { fd } => {
            let size = processes.filesize(tid, fd)?;
            Ok(SyscallOutcome::Value(size as i32))
        }

        Read { fd, buf_ptr, len } => {
            let len = (len as usize).min(MAX_SYSCALL_BUF);
            let process = processes.get(tid).ok_or(KernelError::BadUserAccess)?;
            let mut buf = vec![0u8; len];
            let n = processes.read(tid, fd, &mut buf)?;
            vm.write_user_bytes(&process.spt, tid, buf_ptr, &buf[..n])?;
            Ok(SyscallOutcome::Value(n as i32))
        }

        Write { fd, buf_ptr, len } => {
            let len = (len as usize).min(MAX_SYSCALL_BUF);
            let process = processes.get(tid).ok_or(KernelError::BadUserAccess)?;
            let buf = vm.read_user_bytes(&process.spt, tid, buf_ptr, len)?;
            let n = processes.write(tid, fd, &buf)?;
            Ok(SyscallOutcome::Value(n as i32))
        }

        Seek { fd, position } => {
            processes.seek(tid, fd, position as usize)?;
            Ok(SyscallOutcome::Value(0))
        }

        Tell { fd } => {
            let pos = processes.tell(tid, fd)?;
            Ok(SyscallOutcome::Value(pos as i32))
        }

        Close { fd } => {
            processes.close(tid, fd)?;
            Ok(SyscallOutcome::Value(0))
        }

        Mmap { fd, addr } => {
            let mapid = processes.mmap(tid, fd, addr, true)?;
            Ok(SyscallOutcome::Value(mapid as i32))
        }

        Munmap { mapid } => {
            processes.munmap(tid, mapid)?;
            Ok(SyscallOutcome::Value(0))
        }

        Chdir { path_ptr } => {
            let path = read_path(path_ptr)?;
            processes.chdir(tid, &path)?;
            Ok(SyscallOutcome::Value(1))
        }

        Mkdir { path_ptr } => {
            let path = read_path(path_ptr)?;
            processes.mkdir(tid, &path)?;
            Ok(SyscallOutcome::Value(1))
        }

        Readdir { fd, buf_ptr } => {
            let process = processes.get(tid).ok_or(KernelError::BadUserAccess)?;
            let names = processes.readdir(tid, fd)?;
            match names.first() {
                Some(name) => {
                    let mut bytes = name.as_bytes().to_vec();
                    bytes.push(0);
                    vm.write_user_bytes(&process.spt, tid, buf_ptr, &bytes)?;
                    Ok(SyscallOutcome::Value(1))
                }
                None => Ok(SyscallOutcome::Value(0)),
            }
        }

        Isdir { fd } => {
            let is_dir = processes.isdir(tid, fd)?;
            Ok(SyscallOutcome::Value(is_dir as i32))
        }

        Inumber { fd } => {
            let sector = processes.inumber(tid, fd)?;
            Ok(SyscallOutcome::Value(sector as i32))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::MemBlockDevice;
    use crate::fs::Filesystem;
    use crate::lock::SchedulerHandle;
    use crate::param::PGSIZE;
    use crate::proc::exec::tests_support::write_executable;
    use crate::sched::Scheduler;
    use crate::vm::spt::{EntryKind, Residency, SptEntry};
    use std::sync::{Arc, Mutex};

    fn setup() -> (ProcessTable<MemBlockDevice>, Arc<VirtualMemory<MemBlockDevice>>, Tid) {
        let dev = Arc::new(MemBlockDevice::new(8192));
        let fs = Filesystem::format(dev).unwrap();
        let swap_dev = Arc::new(MemBlockDevice::new(256));
        let vm = Arc::new(VirtualMemory::new(8, swap_dev, fs.clone()));
        write_executable(&fs, "init", 0x1000, &[(PGSIZE as u32, 0, 0, PGSIZE as u32, false)]);
        let scheduler: SchedulerHandle = Arc::new(Mutex::new(Scheduler::new()));
        let processes = ProcessTable::new(fs, vm.clone(), scheduler);
        let tid = processes.spawn_initial("init").unwrap();
        (processes, vm, tid)
    }

    /// Writes `s` NUL-terminated into a fresh writable page at `page` and
    /// returns that page's address, for syscalls that take a string
    /// pointer argument.
    fn stage_string<D: BlockDevice + 'static>(
        vm: &VirtualMemory<D>,
        process: &crate::proc::Process<D>,
        tid: Tid,
        page: u32,
        s: &str,
    ) -> u32 {
        process.spt.insert(SptEntry {
            page,
            kind: EntryKind::StackZero,
            writable: true,
            backing: None,
            residency: Residency::NotLoaded,
            dirty: false,
        });
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        vm.write_user_bytes(&process.spt, tid, page, &bytes).unwrap();
        page
    }

    #[test]
    fn halt_is_reported_distinctly_from_a_numeric_result() {
        let (processes, vm, tid) = setup();
        let outcome = dispatch(tid, Syscall::Halt, &processes, &vm);
        assert_eq!(outcome, SyscallOutcome::Halted);
    }

    #[test]
    fn create_open_write_read_close_round_trip_through_syscalls() {
        let (processes, vm, tid) = setup();
        let process = processes.get(tid).unwrap();
        let path_addr = stage_string(&vm, &process, tid, 0x30000, "note.txt");

        let outcome = dispatch(
            tid,
            Syscall::Create {
                path_ptr: path_addr,
                initial_size: 0,
            },
            &processes,
            &vm,
        );
        assert_eq!(outcome, SyscallOutcome::Value(1));

        let outcome = dispatch(tid, Syscall::Open { path_ptr: path_addr }, &processes, &vm);
        let fd = match outcome {
            SyscallOutcome::Value(fd) => fd as u32,
            _ => panic!("expected a descriptor"),
        };

        let buf_addr = 0x31000;
        process.spt.insert(SptEntry {
            page: buf_addr,
            kind: EntryKind::StackZero,
            writable: true,
            backing: None,
            residency: Residency::NotLoaded,
            dirty: false,
        });
        vm.write_user_bytes(&process.spt, tid, buf_addr, b"hi").unwrap();

        let outcome = dispatch(
            tid,
            Syscall::Write {
                fd,
                buf_ptr: buf_addr,
                len: 2,
            },
            &processes,
            &vm,
        );
        assert_eq!(outcome, SyscallOutcome::Value(2));

        dispatch(tid, Syscall::Seek { fd, position: 0 }, &processes, &vm);
        let outcome = dispatch(
            tid,
            Syscall::Read {
                fd,
                buf_ptr: buf_addr,
                len: 2,
            },
            &processes,
            &vm,
        );
        assert_eq!(outcome, SyscallOutcome::Value(2));
        let back = vm.read_user_bytes(&process.spt, tid, buf_addr, 2).unwrap();
        assert_eq!(&back, b"hi");

        dispatch(tid, Syscall::Close { fd }, &processes, &vm);
    }

    #[test]
    fn a_syscall_pointer_into_unmapped_memory_kills_the_caller() {
        let (processes, vm, tid) = setup();
        let outcome = dispatch(
            tid,
            Syscall::Create {
                path_ptr: 0xdead_0000,
                initial_size: 0,
            },
            &processes,
            &vm,
        );
        assert_eq!(outcome, SyscallOutcome::Value(-1));
        assert!(processes.get(tid).is_none(), "the process must have been torn down");
    }

    #[test]
    fn exit_reports_its_status_and_removes_the_process() {
        let (processes, vm, tid) = setup();
        let outcome = dispatch(tid, Syscall::Exit { status: 7 }, &processes, &vm);
        assert_eq!(outcome, SyscallOutcome::Value(7));
        assert!(processes.get(tid).is_none());
    }
}
