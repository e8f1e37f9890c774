use crate::vm::Result;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{FromRawFd as _, IntoRawFd as _};
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};

/// Debug character port. Byte-granular, bidirectional.
pub const DEBUG_PORT: u16 = 0xE9;

/// Anything that can carry console bytes in both directions.
pub trait ByteChannel: Read + Write + Send {}

impl<T: Read + Write + Send> ByteChannel for T {}

/// Byte shuttle between the guest's debug port and a host character
/// channel. One byte per port access, no buffering, no echo, no line
/// discipline.
pub struct DebugConsole {
    chan: Box<dyn ByteChannel>,
    pty_path: Option<PathBuf>,
}

impl DebugConsole {
    /// Allocate a fresh pseudo-terminal and bind the console to its
    /// master side. The slave path is what the operator attaches a
    /// terminal to.
    pub fn open_pty() -> Result<Self> {
        let master = posix_openpt(OFlag::O_RDWR)?;
        grantpt(&master)?;
        unlockpt(&master)?;
        let path = ptsname_r(&master)?;

        // The raw fd is owned by `master` and handed over here; nothing
        // else closes it.
        let chan = unsafe { File::from_raw_fd(master.into_raw_fd()) };

        Ok(Self {
            chan: Box::new(chan),
            pty_path: Some(PathBuf::from(path)),
        })
    }

    /// Bind the console to an arbitrary byte channel instead of a pty.
    pub fn from_channel(chan: impl ByteChannel + 'static) -> Self {
        Self {
            chan: Box::new(chan),
            pty_path: None,
        }
    }

    pub fn pty_path(&self) -> Option<&Path> {
        self.pty_path.as_deref()
    }

    /// Guest OUT on the debug port: forward the byte(s) to the channel.
    pub fn io_out(&mut self, data: &[u8]) -> Result<()> {
        self.chan.write_all(data)?;
        self.chan.flush()?;
        Ok(())
    }

    /// Guest IN on the debug port: block until the channel yields one
    /// byte per requested cell.
    pub fn io_in(&mut self, data: &mut [u8]) -> Result<()> {
        self.chan.read_exact(data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};

    /// In-memory channel: everything written can be read back.
    #[derive(Clone, Default)]
    struct Loopback(Arc<Mutex<VecDeque<u8>>>);

    impl io::Read for Loopback {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut queue = self.0.lock().unwrap();
            let n = buf.len().min(queue.len());
            for slot in &mut buf[..n] {
                *slot = queue.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl io::Write for Loopback {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend(buf.iter().copied());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn shuttles_bytes_in_both_directions() {
        let chan = Loopback::default();
        let mut console = DebugConsole::from_channel(chan.clone());

        for b in b"hi\n" {
            console.io_out(&[*b]).unwrap();
        }
        assert_eq!(
            chan.0.lock().unwrap().iter().copied().collect::<Vec<_>>(),
            b"hi\n"
        );

        let mut byte = [0u8; 1];
        console.io_in(&mut byte).unwrap();
        assert_eq!(byte[0], b'h');
        console.io_in(&mut byte).unwrap();
        assert_eq!(byte[0], b'i');
    }

    #[test]
    fn channel_console_has_no_pty_path() {
        let console = DebugConsole::from_channel(Loopback::default());
        assert!(console.pty_path().is_none());
    }
}
