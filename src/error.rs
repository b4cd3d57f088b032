//! Kernel-wide error type.
//!
//! The teacher returns bare `bool`/`Result<(), ()>` at subsystem boundaries
//! and panics on invariant breakage (spec.md section 7: "Assertion
//! violations ... panic"). This keeps that shape but names failures so
//! callers and tests can match on cause, using `thiserror` the way the rest
//! of the retrieval pack does.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    #[error("no such file or directory")]
    NotFound,
    #[error("file already exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("no space left on device")]
    NoSpace,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("bad file descriptor")]
    BadDescriptor,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("not a child of the calling process")]
    NotAChild,
    #[error("executable image is malformed")]
    BadExecutable,
    #[error("bad user memory access")]
    BadUserAccess,
    #[error("out of physical memory")]
    OutOfMemory,
}

pub type KResult<T> = Result<T, KernelError>;
