use std::ffi::{OsStr, OsString};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd as _;
use std::os::unix::ffi::OsStrExt as _;
use std::os::unix::fs::OpenOptionsExt as _;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use log::{debug, warn};

/// Command port for the guest-to-host file protocol.
pub const FILE_PORT: u16 = 0x278;

/// Sentinel streamed to the guest for reads past end of file or with no
/// file selected (-1 as a signed byte).
pub const EOF_BYTE: u8 = 0xFF;

const OP_FINISH: u32 = 0;
const OP_OPEN: u32 = 1;
const OP_CLOSE: u32 = 2;
const OP_READ: u32 = 3;
const OP_WRITE: u32 = 4;

/// Longest guest-supplied file name the decoder keeps, terminator
/// included. Excess bytes are dropped.
const NAME_CAP: usize = 255;

/// Any of these bits makes an open request write-capable, which
/// materializes the guest's private copy.
const WRITE_FLAGS: u32 = (libc::O_RDWR | libc::O_WRONLY | libc::O_TRUNC | libc::O_APPEND) as u32;

/// One open (or opening) host file owned by a guest.
struct FileEntry {
    fd: i32,
    flags: Option<u32>,
    mode: Option<u32>,
    name: Vec<u8>,
    file: Option<File>,
}

impl FileEntry {
    fn new() -> Self {
        Self {
            fd: -1,
            flags: None,
            mode: None,
            name: Vec::new(),
            file: None,
        }
    }

    /// Name bytes as streamed by the guest, without the stored NUL.
    fn name_stem(&self) -> &[u8] {
        match self.name.iter().position(|&b| b == 0) {
            Some(nul) => &self.name[..nul],
            None => &self.name,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Idle,
    Open,
    Close,
    Read,
    Write,
}

/// Run-loop-held view of the process-wide file mutex.
///
/// The engine asks for acquisition when a command leaves IDLE and for
/// release when the protocol returns to IDLE. Keeping the guard out
/// here ties its lifetime to the run loop, so every exit path out of a
/// handler, including an unwinding guest thread, drops it.
pub struct FileLock<'a> {
    mutex: &'a Mutex<()>,
    guard: Option<MutexGuard<'a, ()>>,
}

impl<'a> FileLock<'a> {
    pub fn new(mutex: &'a Mutex<()>) -> Self {
        Self { mutex, guard: None }
    }

    fn acquire(&mut self) {
        if self.guard.is_none() {
            self.guard = Some(self.mutex.lock().unwrap());
        }
    }

    fn release(&mut self) {
        self.guard = None;
    }

    pub fn held(&self) -> bool {
        self.guard.is_some()
    }
}

/// Stateful decoder for the file command port.
///
/// One engine per guest. All engines funnel host file operations
/// through the shared mutex, so only one guest at a time drives the
/// port; the mutex stays held across the whole OPEN/CLOSE/READ/WRITE
/// exchange, suspended guest included.
pub struct FileEngine {
    guest_id: usize,
    root: PathBuf,
    state: State,
    table: Vec<FileEntry>,
    current: Option<usize>,
}

impl FileEngine {
    pub fn new(guest_id: usize) -> Self {
        Self {
            guest_id,
            root: PathBuf::from("."),
            state: State::Idle,
            table: Vec::new(),
            current: None,
        }
    }

    /// Guest OUT on the file port. The access width selects the event:
    /// 4-byte accesses carry opcodes, descriptors, flags and mode;
    /// 1-byte accesses stream name and payload bytes.
    pub fn handle_out(&mut self, data: &[u8], lock: &mut FileLock<'_>) {
        match data.len() {
            4 => {
                let value = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                self.command(value, lock);
            }
            1 => self.stream_byte(data[0]),
            len => warn!("file port: unsupported OUT width {len}"),
        }
    }

    /// Guest IN on the file port: 4-byte reads return descriptors and
    /// close status, 1-byte reads stream file content.
    pub fn handle_in(&mut self, data: &mut [u8], lock: &mut FileLock<'_>) {
        match (self.state, data.len()) {
            (State::Open, 4) => {
                let fd = self.current.map_or(-1, |idx| self.table[idx].fd);
                data.copy_from_slice(&fd.to_le_bytes());
                // The descriptor readback completes the OPEN exchange.
                self.finish(lock);
            }
            (State::Close, 4) => {
                let status: i32 = match self.current.take() {
                    Some(idx) => {
                        // Dropping the entry closes the host file.
                        self.table.remove(idx);
                        0
                    }
                    None => -1,
                };
                data.copy_from_slice(&status.to_le_bytes());
            }
            (State::Read, 1) => {
                data[0] = self.read_byte();
            }
            (state, len) => {
                warn!("file port: unsupported IN width {len} in {state:?}");
                data.fill(0);
            }
        }
    }

    fn command(&mut self, value: u32, lock: &mut FileLock<'_>) {
        match self.state {
            State::Idle => match value {
                OP_OPEN => {
                    lock.acquire();
                    self.table.push(FileEntry::new());
                    self.current = Some(self.table.len() - 1);
                    self.state = State::Open;
                }
                OP_CLOSE => {
                    lock.acquire();
                    self.state = State::Close;
                }
                OP_READ => {
                    lock.acquire();
                    self.state = State::Read;
                }
                OP_WRITE => {
                    lock.acquire();
                    self.state = State::Write;
                }
                OP_FINISH => {} // nothing in flight
                other => warn!("file port: unknown opcode {other}"),
            },
            State::Open => self.open_argument(value, lock),
            State::Close | State::Read | State::Write => {
                // Outside IDLE a zero word is FINISH; it shadows
                // descriptor 0, so a guest cannot select fd 0 here.
                if value == OP_FINISH {
                    self.finish(lock);
                } else {
                    self.current = self.table.iter().position(|e| e.fd == value as i32);
                    if self.current.is_none() {
                        debug!("guest {}: unknown descriptor {}", self.guest_id, value as i32);
                    }
                }
            }
        }
    }

    /// 4-byte OUT while an OPEN is in flight: first word is the flags,
    /// second the mode (either may legitimately be zero). The mode
    /// triggers the host-side open. The exchange normally ends with the
    /// descriptor readback, but a FINISH after the open works too.
    fn open_argument(&mut self, value: u32, lock: &mut FileLock<'_>) {
        let Some(idx) = self.current else {
            self.finish(lock);
            return;
        };
        if self.table[idx].flags.is_none() {
            self.table[idx].flags = Some(value);
        } else if self.table[idx].mode.is_none() {
            self.table[idx].mode = Some(value);
            self.perform_open(idx);
        } else if value == OP_FINISH {
            self.finish(lock);
        }
    }

    fn stream_byte(&mut self, byte: u8) {
        match self.state {
            State::Open => {
                if let Some(idx) = self.current {
                    // The terminator ends the name but is stored too.
                    if self.table[idx].name.len() < NAME_CAP {
                        self.table[idx].name.push(byte);
                    }
                }
            }
            State::Write => {
                // With no entry selected the byte is dropped.
                if let Some(idx) = self.current {
                    if let Some(file) = self.table[idx].file.as_ref() {
                        let mut file: &File = file;
                        if let Err(e) = file.write_all(&[byte]) {
                            warn!("guest {}: write failed: {e}", self.guest_id);
                        }
                    }
                }
            }
            state => debug!("file port: stray byte {byte:#04x} in {state:?}"),
        }
    }

    fn read_byte(&mut self) -> u8 {
        let Some(idx) = self.current else {
            return EOF_BYTE;
        };
        let Some(file) = self.table[idx].file.as_ref() else {
            return EOF_BYTE;
        };
        let mut file: &File = file;
        let mut byte = [0u8; 1];
        match file.read(&mut byte) {
            Ok(1) => byte[0],
            Ok(_) => EOF_BYTE,
            Err(e) => {
                warn!("guest {}: read failed: {e}", self.guest_id);
                EOF_BYTE
            }
        }
    }

    fn finish(&mut self, lock: &mut FileLock<'_>) {
        self.state = State::Idle;
        self.current = None;
        lock.release();
    }

    /// Host-side open, once flags and mode have both arrived. The
    /// guest's private copy (`vm_<id>_<name>`) wins when it exists;
    /// write-capable requests materialize that copy first; plain reads
    /// fall through to the shared original. A failed open is surfaced
    /// to the guest as descriptor -1, never as a host error.
    fn perform_open(&mut self, idx: usize) {
        let flags = self.table[idx].flags.unwrap_or(0);
        let mode = self.table[idx].mode.unwrap_or(0);

        let private = self.private_path(self.table[idx].name_stem());
        let shared = self.root.join(OsStr::from_bytes(self.table[idx].name_stem()));

        let target = if private.exists() {
            private
        } else if flags & WRITE_FLAGS != 0 {
            // File-level copy-on-first-write: materialize an empty
            // private copy so the shared original stays untouched.
            if let Err(e) = create_empty(&private) {
                warn!(
                    "guest {}: cannot create {}: {e}",
                    self.guest_id,
                    private.display()
                );
            }
            private
        } else {
            shared
        };

        match open_with_flags(&target, flags, mode) {
            Ok(file) => {
                self.table[idx].fd = file.as_raw_fd();
                self.table[idx].file = Some(file);
            }
            Err(e) => {
                warn!(
                    "guest {}: open {} failed: {e}",
                    self.guest_id,
                    target.display()
                );
                self.table[idx].fd = -1;
            }
        }
    }

    /// Host path of this guest's private copy of `stem`.
    fn private_path(&self, stem: &[u8]) -> PathBuf {
        let mut name = OsString::from(format!("vm_{}_", self.guest_id));
        name.push(OsStr::from_bytes(stem));
        self.root.join(name)
    }
}

/// Map the guest's raw open(2) flag word onto `OpenOptions`: access
/// mode from O_ACCMODE, creation bits mirrored, everything else riding
/// along as custom flags.
fn open_with_flags(path: &Path, flags: u32, mode: u32) -> std::io::Result<File> {
    let raw = flags as i32;
    let mut opts = OpenOptions::new();
    match raw & libc::O_ACCMODE {
        libc::O_WRONLY => opts.write(true),
        libc::O_RDWR => opts.read(true).write(true),
        _ => opts.read(true),
    };
    opts.create(raw & libc::O_CREAT != 0)
        .truncate(raw & libc::O_TRUNC != 0)
        .append(raw & libc::O_APPEND != 0)
        .custom_flags(raw & !(libc::O_ACCMODE | libc::O_CREAT | libc::O_TRUNC | libc::O_APPEND))
        .mode(mode)
        .open(path)
}

fn create_empty(path: &Path) -> std::io::Result<()> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .mode(0o777)
        .open(path)
        .map(|_| ())
}
