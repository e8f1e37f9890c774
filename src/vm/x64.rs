use crate::vm::Result;
use kvm_bindings::kvm_regs;
use kvm_ioctls::VcpuFd;
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

pub const MIB: u64 = 1024 * 1024;
pub const LARGE_PAGE: u64 = 2 * MIB;
pub const PAGE_SIZE: u64 = 0x1000;

const PML4_ADDR: GuestAddress = GuestAddress(0x0000);
const PDPT_ADDR: GuestAddress = GuestAddress(0x1000);
const PD_ADDR: GuestAddress = GuestAddress(0x2000);
const PT_BASE: u64 = 0x3000;

// Page-table / PTE flag bits
const PTE_PRESENT: u64 = 0x1;
const PTE_RW: u64 = 0x2;
const PTE_USER: u64 = 0x4;
const PTE_PS: u64 = 0x80;
const TABLE_ENTRY_FLAGS: u64 = PTE_PRESENT | PTE_RW | PTE_USER;
const PD_2M_ENTRY_FLAGS: u64 = TABLE_ENTRY_FLAGS | PTE_PS; // 2MB page entry

// Control-register / system constants
const CR4_PAE: u64 = 1 << 5;
const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;
const CR0_PE: u64 = 1 << 0;
const CR0_NE: u64 = 1 << 5;
const CR0_PG: u64 = 1 << 31;
const RFLAGS_RESERVED: u64 = 2;

// Segment selectors / descriptor types
const CS_SELECTOR: u16 = 0x8;
const DS_SELECTOR: u16 = 0x10;
const CS_TYPE: u8 = 0xB;
const DS_TYPE: u8 = 0x3;

/// Initial guest stack pointer, exactly at the top of the first 2 MiB
/// virtual page. Guests that push before touching the rest of their
/// image rely on this placement; do not move it.
const STACK_TOP: u64 = LARGE_PAGE;

/// Page granularity of the identity window mapped for the guest.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageMode {
    TwoMib,
    FourKib,
}

impl PageMode {
    /// `4` selects 4 KiB pages; any other value falls back to 2 MiB.
    pub fn from_flag(flag: u8) -> Self {
        if flag == 4 {
            PageMode::FourKib
        } else {
            PageMode::TwoMib
        }
    }
}

/// Build the 4-level long-mode tables in the low pages of guest memory
/// and return the guest-physical address the image is loaded at.
///
/// The window is offset rather than a plain identity map: virtual 0
/// translates to the returned load address, so images link-edited for
/// virtual address 0 run unmodified. The first 2 MiB frame (2 MiB mode)
/// or the table pages themselves (4 KiB mode) stay outside the window.
pub fn build_page_tables(
    mem: &GuestMemoryMmap<()>,
    mem_size: u64,
    mode: PageMode,
) -> Result<GuestAddress> {
    let pml4_entry: u64 = PDPT_ADDR.0 | TABLE_ENTRY_FLAGS; // PML4[0] -> PDPT
    let pdpt_entry: u64 = PD_ADDR.0 | TABLE_ENTRY_FLAGS; // PDPT[0] -> PD

    mem.write_slice(&pml4_entry.to_le_bytes(), PML4_ADDR)?;
    mem.write_slice(&pdpt_entry.to_le_bytes(), PDPT_ADDR)?;

    let pd_count = mem_size / LARGE_PAGE;

    match mode {
        PageMode::TwoMib => {
            // Virtual i*2MiB maps physical (i+1)*2MiB; the last populated
            // index is pd_count - 2, leaving the tail frame unmapped.
            for i in 0..pd_count - 1 {
                let entry = (LARGE_PAGE + i * LARGE_PAGE) | PD_2M_ENTRY_FLAGS;
                mem.write_slice(&entry.to_le_bytes(), GuestAddress(PD_ADDR.0 + i * 8))?;
            }
            Ok(GuestAddress(LARGE_PAGE))
        }
        PageMode::FourKib => {
            // One page table per PD entry, bump-allocated from PT_BASE.
            for i in 0..pd_count {
                let pt_addr = PT_BASE + i * PAGE_SIZE;
                let entry = pt_addr | TABLE_ENTRY_FLAGS;
                mem.write_slice(&entry.to_le_bytes(), GuestAddress(PD_ADDR.0 + i * 8))?;
            }
            let start = PT_BASE + pd_count * PAGE_SIZE;

            // Rolling fill: each entry maps the next physical page,
            // beginning at the image base (the first page after the
            // tables). The fill stops once the rolling address passes
            // mem_size, which leaves the last table partially populated.
            let mut page = start;
            'fill: for i in 0..pd_count {
                let pt_addr = PT_BASE + i * PAGE_SIZE;
                for j in 0..512u64 {
                    let entry = page | TABLE_ENTRY_FLAGS;
                    mem.write_slice(&entry.to_le_bytes(), GuestAddress(pt_addr + j * 8))?;
                    page += PAGE_SIZE;
                    if page > mem_size {
                        break 'fill;
                    }
                }
            }
            Ok(GuestAddress(start))
        }
    }
}

/// Program the vCPU for flat 64-bit execution: page-table root at
/// guest-physical 0, PAE, long mode enabled and active, paging on, and
/// flat ring-0 code/data segments supplied directly through selectors.
/// General registers are cleared down to the agreed entry state.
pub fn init_vcpu(vcpu: &VcpuFd) -> Result<()> {
    let mut sregs = vcpu.get_sregs()?;

    sregs.cr3 = PML4_ADDR.0; // physical address of the page-table root

    // CR4.PAE must be set to enable physical-address-extension paging
    // required by 64-bit mode page tables.
    sregs.cr4 |= CR4_PAE;

    // EFER.LME enables Long Mode; EFER.LMA indicates Long Mode Active.
    sregs.efer |= EFER_LME | EFER_LMA;

    // Code segment descriptor: set as a 64-bit code segment.
    sregs.cs.base = 0;
    sregs.cs.limit = 0xFFFF_FFFF;
    sregs.cs.selector = CS_SELECTOR;
    sregs.cs.type_ = CS_TYPE; // executable, read, accessed
    sregs.cs.present = 1;
    sregs.cs.dpl = 0; // ring 0
    sregs.cs.db = 0; // DB = 0 => default operand size is 32-bit (unused in 64-bit)
    sregs.cs.s = 1; // S = 1 => code/data descriptor (not system)
    sregs.cs.l = 1; // L bit = 1 => 64-bit code segment
    sregs.cs.g = 1; // limit counted in 4 KiB units

    // Data segments: identical to the code segment except for the
    // read/write type.
    let mut data = sregs.cs;
    data.selector = DS_SELECTOR;
    data.type_ = DS_TYPE;
    sregs.ds = data;
    sregs.es = data;
    sregs.fs = data;
    sregs.gs = data;
    sregs.ss = data;

    // KVM allows zero-sized GDT/IDT here because we supply selectors directly.
    sregs.gdt.limit = 0;
    sregs.idt.limit = 0;

    // CR0: enable protected mode (PE) and paging (PG). Also enable NE
    // (numeric error) so x87 exceptions behave as expected.
    sregs.cr0 |= CR0_PG | CR0_PE;
    sregs.cr0 |= CR0_NE;

    vcpu.set_sregs(&sregs)?;

    // General purpose registers: everything zeroed except the entry
    // state. rip 0 is where the tables expose the image base.
    let regs = kvm_regs {
        rip: 0,
        rsp: STACK_TOP,
        rflags: RFLAGS_RESERVED, // required reserved bit
        ..Default::default()
    };
    vcpu.set_regs(&regs)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guest_mem(size: u64) -> GuestMemoryMmap<()> {
        GuestMemoryMmap::from_ranges(&[(GuestAddress(0), size as usize)]).expect("mmap")
    }

    fn read_entry(mem: &GuestMemoryMmap<()>, addr: u64) -> u64 {
        let mut buf = [0u8; 8];
        mem.read_slice(&mut buf, GuestAddress(addr)).expect("read entry");
        u64::from_le_bytes(buf)
    }

    #[test]
    fn two_mib_tables_link_all_levels() {
        let mem = guest_mem(8 * MIB);
        let start = build_page_tables(&mem, 8 * MIB, PageMode::TwoMib).unwrap();

        assert_eq!(start.0, LARGE_PAGE);
        assert_eq!(read_entry(&mem, PML4_ADDR.0), 0x1000 | TABLE_ENTRY_FLAGS);
        assert_eq!(read_entry(&mem, PDPT_ADDR.0), 0x2000 | TABLE_ENTRY_FLAGS);
        // 8 MiB of guest memory populates leaves 0..=2.
        for i in 0..3u64 {
            assert_eq!(
                read_entry(&mem, PD_ADDR.0 + i * 8),
                (LARGE_PAGE + i * LARGE_PAGE) | PD_2M_ENTRY_FLAGS
            );
        }
        assert_eq!(read_entry(&mem, PD_ADDR.0 + 3 * 8), 0);
    }

    #[test]
    fn two_mib_four_mib_guest_gets_exactly_one_leaf() {
        let mem = guest_mem(4 * MIB);
        let start = build_page_tables(&mem, 4 * MIB, PageMode::TwoMib).unwrap();

        assert_eq!(start.0, LARGE_PAGE);
        assert_eq!(read_entry(&mem, PD_ADDR.0), LARGE_PAGE | PD_2M_ENTRY_FLAGS);
        assert_eq!(read_entry(&mem, PD_ADDR.0 + 8), 0);
    }

    #[test]
    fn four_kib_two_mib_guest_fills_one_table() {
        let mem = guest_mem(2 * MIB);
        let start = build_page_tables(&mem, 2 * MIB, PageMode::FourKib).unwrap();

        // One page table at 0x3000; the image begins on the next page.
        assert_eq!(start.0, 0x4000);
        assert_eq!(read_entry(&mem, PD_ADDR.0), 0x3000 | TABLE_ENTRY_FLAGS);
        assert_eq!(read_entry(&mem, PD_ADDR.0 + 8), 0);

        assert_eq!(read_entry(&mem, 0x3000), 0x4000 | TABLE_ENTRY_FLAGS);
        // The rolling address starts at 0x4000, so the fill stops after
        // entry 508 (which maps the page at mem_size itself); the last
        // three entries stay empty.
        assert_eq!(
            read_entry(&mem, 0x3000 + 508 * 8),
            (2 * MIB) | TABLE_ENTRY_FLAGS
        );
        assert_eq!(read_entry(&mem, 0x3000 + 509 * 8), 0);
        assert_eq!(read_entry(&mem, 0x3000 + 511 * 8), 0);
    }

    #[test]
    fn four_kib_four_mib_guest_under_populates_last_table() {
        let mem = guest_mem(4 * MIB);
        let start = build_page_tables(&mem, 4 * MIB, PageMode::FourKib).unwrap();

        // Two page tables, image after both.
        assert_eq!(start.0, 0x5000);
        assert_eq!(read_entry(&mem, PD_ADDR.0), 0x3000 | TABLE_ENTRY_FLAGS);
        assert_eq!(read_entry(&mem, PD_ADDR.0 + 8), 0x4000 | TABLE_ENTRY_FLAGS);

        // First table maps from the image base onward.
        assert_eq!(read_entry(&mem, 0x3000), 0x5000 | TABLE_ENTRY_FLAGS);
        assert_eq!(
            read_entry(&mem, 0x3000 + 511 * 8),
            (0x5000 + 511 * PAGE_SIZE) | TABLE_ENTRY_FLAGS
        );

        // Second table stops where the rolling address passes mem_size.
        assert_eq!(
            read_entry(&mem, 0x4000 + 507 * 8),
            (4 * MIB) | TABLE_ENTRY_FLAGS
        );
        assert_eq!(read_entry(&mem, 0x4000 + 508 * 8), 0);
    }
}
