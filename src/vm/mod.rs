pub mod console;
pub mod error;
pub mod files;
pub mod x64;

pub use self::error::{Error, Result};

use std::io::Read;
use std::sync::{Arc, Mutex};

use kvm_bindings::{KVM_API_VERSION, kvm_userspace_memory_region};
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd, VmFd};
use log::{debug, warn};
use vm_memory::{Bytes, GuestAddress, GuestMemoryBackend, GuestMemoryMmap};

use self::console::{DEBUG_PORT, DebugConsole};
use self::files::{FILE_PORT, FileEngine, FileLock};
use self::x64::PageMode;

const GUEST_BASE: GuestAddress = GuestAddress(0);
const LOAD_CHUNK: usize = 4096;

/// Process-wide handle on the host virtualization facility. Opened once
/// at startup and shared read-only while the guests are built.
pub struct Hypervisor {
    kvm: Kvm,
    vcpu_mmap_size: usize,
}

impl Hypervisor {
    pub fn open() -> Result<Self> {
        let kvm = Kvm::new().map_err(Error::KvmUnavailable)?;

        let version = kvm.get_api_version();
        if version != KVM_API_VERSION as i32 {
            return Err(Error::KvmApiVersion(version));
        }

        // Size of the per-vCPU shared region through which exit reasons
        // and I/O payloads travel. kvm-ioctls maps the region itself
        // when the vCPU is created; the query doubles as a health check
        // on the control interface.
        let vcpu_mmap_size = kvm.get_vcpu_mmap_size()?;
        debug!("KVM api {version}, vCPU shared region {vcpu_mmap_size} bytes");

        Ok(Self {
            kvm,
            vcpu_mmap_size,
        })
    }

    pub fn vcpu_mmap_size(&self) -> usize {
        self.vcpu_mmap_size
    }
}

/// One guest: a VM with a single vCPU, its physical address space, a
/// debug console and a file protocol engine.
pub struct Vm {
    id: usize,
    _vm: VmFd,
    vcpu: VcpuFd,
    mem: GuestMemoryMmap<()>,
    start_address: GuestAddress,
    console: DebugConsole,
    files: FileEngine,
    file_mutex: Arc<Mutex<()>>,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Vm {
    /// Create the VM and its vCPU, allocate and register `mem_size`
    /// bytes of guest physical memory, build the page tables for the
    /// requested granularity and program the vCPU for flat 64-bit
    /// execution at virtual 0.
    pub fn new(
        hv: &Hypervisor,
        id: usize,
        mem_size: u64,
        mode: PageMode,
        console: DebugConsole,
        file_mutex: Arc<Mutex<()>>,
    ) -> Result<Self> {
        if mem_size == 0 || mem_size % x64::LARGE_PAGE != 0 {
            return Err(Error::MemoryNotAligned(mem_size));
        }

        let vm = hv.kvm.create_vm()?;
        let vcpu = vm.create_vcpu(0)?;

        let mem: GuestMemoryMmap<()> =
            GuestMemoryMmap::from_ranges(&[(GUEST_BASE, mem_size as usize)])?;

        // Register the whole mapping as guest physical slot 0: guest
        // address G is byte G of the region.
        unsafe {
            vm.set_user_memory_region(kvm_userspace_memory_region {
                slot: 0,
                guest_phys_addr: GUEST_BASE.0,
                memory_size: mem_size,
                userspace_addr: mem.get_host_address(GUEST_BASE).unwrap() as u64,
                flags: 0,
            })?;
        }

        let start_address = x64::build_page_tables(&mem, mem_size, mode)?;
        x64::init_vcpu(&vcpu)?;

        Ok(Self {
            id,
            _vm: vm,
            vcpu,
            mem,
            start_address,
            console,
            files: FileEngine::new(id),
            file_mutex,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn console_path(&self) -> Option<&std::path::Path> {
        self.console.pty_path()
    }

    /// Stream a guest image into memory at the load address, chunk by
    /// chunk. The first image byte lands on `start_address`, which the
    /// page tables expose as virtual 0.
    pub fn load_image<R: Read>(&mut self, mut image: R) -> Result<()> {
        let mut offset = self.start_address.0;
        let mut chunk = [0u8; LOAD_CHUNK];
        loop {
            let n = image.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            self.mem.write_slice(&chunk[..n], GuestAddress(offset))?;
            offset += n as u64;
        }
        Ok(())
    }

    /// Drive the vCPU until a terminal exit.
    ///
    /// I/O exits are dispatched to the debug console or the file engine
    /// and run to completion before the guest resumes, so the guest
    /// observes synchronous device semantics. The shared file mutex
    /// guard lives in this frame, which releases it on every path out,
    /// normal or not.
    pub fn run(&mut self) -> Result<()> {
        let file_mutex = Arc::clone(&self.file_mutex);
        let mut lock = FileLock::new(&file_mutex);

        loop {
            match self.vcpu.run()? {
                VcpuExit::IoOut(port, data) => match port {
                    DEBUG_PORT => self.console.io_out(data)?,
                    FILE_PORT => self.files.handle_out(data, &mut lock),
                    _ => warn!("guest {}: unhandled OUT on port {port:#x}", self.id),
                },
                VcpuExit::IoIn(port, data) => match port {
                    DEBUG_PORT => self.console.io_in(data)?,
                    FILE_PORT => self.files.handle_in(data, &mut lock),
                    _ => {
                        warn!("guest {}: unhandled IN on port {port:#x}", self.id);
                        data.fill(0);
                    }
                },
                VcpuExit::Hlt => {
                    println!("KVM_EXIT_HLT");
                    return Ok(());
                }
                VcpuExit::Shutdown => {
                    println!("Shutdown");
                    return Ok(());
                }
                VcpuExit::InternalError => {
                    eprintln!("KVM_EXIT_INTERNAL_ERROR");
                    return Err(Error::InternalError);
                }
                other => {
                    eprintln!("Unknown exit reason {other:?}");
                    return Err(Error::UnexpectedExit(format!("{other:?}")));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::path::Path;

    /// The end-to-end tests need the real control device; skip silently
    /// on hosts without one.
    fn kvm_available() -> bool {
        Path::new("/dev/kvm").exists()
    }

    /// Console sink the tests can inspect after the guest has run.
    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl io::Read for Capture {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    /// Tiny payload: write "hi\n" to the debug port, then halt.
    fn hello_payload() -> Vec<u8> {
        let mut code = Vec::new();
        for &b in b"hi\n" {
            code.extend_from_slice(&[0xB0, b]); // mov al, imm8
            code.extend_from_slice(&[0xE6, DEBUG_PORT as u8]); // out imm8, al
        }
        code.push(0xF4); // hlt
        code
    }

    fn run_hello(mode: PageMode) -> Vec<u8> {
        let hv = Hypervisor::open().expect("open kvm");
        let sink = Capture::default();
        let console = DebugConsole::from_channel(sink.clone());
        let mut vm = Vm::new(
            &hv,
            0,
            2 * x64::LARGE_PAGE,
            mode,
            console,
            Arc::new(Mutex::new(())),
        )
        .expect("build vm");
        vm.load_image(&hello_payload()[..]).expect("load image");
        vm.run().expect("run guest");

        let out = sink.0.lock().unwrap().clone();
        out
    }

    #[test]
    fn vcpu_shared_region_size_is_sane() {
        if !kvm_available() {
            return;
        }
        let hv = Hypervisor::open().expect("open kvm");
        assert!(hv.vcpu_mmap_size() >= size_of::<kvm_bindings::kvm_run>());
    }

    #[test]
    fn guest_writes_debug_port_and_halts() {
        if !kvm_available() {
            return;
        }
        assert_eq!(run_hello(PageMode::TwoMib), b"hi\n");
    }

    #[test]
    fn page_mode_toggle_produces_identical_output() {
        if !kvm_available() {
            return;
        }
        assert_eq!(run_hello(PageMode::TwoMib), run_hello(PageMode::FourKib));
    }

    #[test]
    fn odd_memory_size_is_rejected() {
        if !kvm_available() {
            return;
        }
        let hv = Hypervisor::open().expect("open kvm");
        let console = DebugConsole::from_channel(Capture::default());
        let err = Vm::new(
            &hv,
            0,
            3 * x64::MIB,
            PageMode::TwoMib,
            console,
            Arc::new(Mutex::new(())),
        )
        .unwrap_err();
        assert!(matches!(err, Error::MemoryNotAligned(_)));
    }
}
