use thiserror::Error as ThisError;
use vm_memory::{GuestMemoryError, mmap::FromRangesError};

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("cannot open /dev/kvm: {0}")]
    KvmUnavailable(kvm_ioctls::Error),

    #[error("unsupported KVM API version {0}")]
    KvmApiVersion(i32),

    #[error("kvm error: {0}")]
    Kvm(#[from] kvm_ioctls::Error),

    #[error("guest memory error: {0}")]
    GuestMemory(#[from] GuestMemoryError),

    #[error("from ranges error: {0}")]
    FromRanges(#[from] FromRangesError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pty error: {0}")]
    Pty(#[from] nix::Error),

    #[error("guest memory size {0:#x} is not a positive multiple of 2 MiB")]
    MemoryNotAligned(u64),

    #[error("vCPU internal error")]
    InternalError,

    #[error("unexpected vCPU exit: {0}")]
    UnexpectedExit(String),
}

pub type Result<T> = std::result::Result<T, Error>;
