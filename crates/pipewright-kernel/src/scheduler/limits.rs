//! Descriptor-limit aware error mapping.

use std::io;

use nix::errno::Errno;
use nix::sys::resource::{Resource, getrlimit};
use pipewright_types::Error;

/// The soft `RLIMIT_NOFILE` of this process, or 0 if it cannot be read.
pub fn descriptor_limit() -> u64 {
    getrlimit(Resource::RLIMIT_NOFILE)
        .map(|(soft, _hard)| soft as u64)
        .unwrap_or(0)
}

/// True for the errors the OS returns when no descriptor can be allocated.
pub fn is_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error().map(Errno::from_raw),
        Some(Errno::EMFILE) | Some(Errno::ENFILE)
    )
}

/// Map an I/O error, singling out descriptor exhaustion.
pub fn fd_error(context: impl Into<String>, err: io::Error) -> Error {
    if is_exhaustion(&err) {
        Error::DescriptorsExhausted {
            limit: descriptor_limit(),
            context: context.into(),
        }
    } else {
        Error::io(context, err)
    }
}
