use std::fs::File;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

use clap::Args;

use lodge::vm::console::DebugConsole;
use lodge::vm::x64::{MIB, PageMode};
use lodge::vm::{Hypervisor, Result, Vm};

#[derive(Args)]
pub struct Cmd {
    /// Guest memory in MiB, a multiple of 2
    #[arg(short, long)]
    memory: u64,

    /// Page granularity: 4 for 4 KiB pages, anything else means 2 MiB
    #[arg(short, long, default_value_t = 2)]
    page: u8,

    /// Guest image paths, one VM each
    #[arg(short, long, num_args = 1.., required = true, value_name = "IMAGE")]
    guest: Vec<PathBuf>,

    /// Accepted for compatibility with surrounding tooling; unused
    #[arg(long, value_name = "FILE")]
    file: Option<PathBuf>,
}

impl Cmd {
    pub fn execute(&self) -> Result<()> {
        let hv = Hypervisor::open()?;
        let mem_size = self.memory * MIB;
        let mode = PageMode::from_flag(self.page);

        // The one piece of state the guests share: whoever drives the
        // file port holds this until the operation finishes.
        let file_mutex = Arc::new(Mutex::new(()));

        let mut vms = Vec::with_capacity(self.guest.len());
        for (id, path) in self.guest.iter().enumerate() {
            let console = DebugConsole::open_pty()?;
            if let Some(pty) = console.pty_path() {
                println!("guest {id}: console on {}", pty.display());
            }

            let mut vm = Vm::new(&hv, id, mem_size, mode, console, Arc::clone(&file_mutex))?;
            vm.load_image(File::open(path)?)?;
            vms.push(vm);
        }

        let mut workers = Vec::with_capacity(vms.len());
        for mut vm in vms {
            let worker = thread::Builder::new()
                .name(format!("guest-{}", vm.id()))
                .spawn(move || vm.run())?;
            workers.push(worker);
        }

        // A faulting guest only takes down its own thread; the rest run
        // to completion.
        for (id, worker) in workers.into_iter().enumerate() {
            match worker.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => eprintln!("guest {id}: {e}"),
                Err(_) => eprintln!("guest {id}: thread panicked"),
            }
        }

        Ok(())
    }
}
