//! Kernel image entry
//!
//! Loader contract: the primary enters `_start` at EL1 with the MMU on, the
//! image mapped at its link address through TTBR1 and physical memory
//! identity-mapped through TTBR0.
//!
//! - `x0`: physical address of the hardware descriptor
//! - `x1`: logical id of the entering core
//! - `x2`: physical load address of the image
//!
//! The identity map stays in TTBR0 for the whole boot. Secondaries need it
//! to turn their MMU on, and early device access goes through it.

#![no_std]
#![no_main]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

use alloc::alloc::{Layout, alloc, alloc_zeroed};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::panic::PanicInfo;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use aarch64_cpu::asm::barrier;
use aarch64_cpu::registers::{ELR_EL1, ESR_EL1, FAR_EL1, MAIR_EL1, TCR_EL1, TTBR0_EL1, TTBR1_EL1, VBAR_EL1};
use axon_common::{CoreId, InitialStack, KernelImage, MAX_CPUS, PhysAddr, VirtAddr};
use axon_kernel::boot::{self, ArchSupport, BootHardware, EarlyPlatform};
use axon_kernel::early_println;
use axon_kernel::smp::{BootArgsTable, BringupCoordinator, BringupError, PublishedLayout, SecondaryInit};
use axon_paging::MappingTable;
use axon_paging::arch::arm64::{MAIR_EL1_VALUE, RawTable, TableAllocator, TranslationTables};
use axon_pal::console::Pl011;
use axon_pal::psci::{AffinityState, Psci, PsciConduit};
use axon_pal::timer::ArchCounter;
use axon_pal::{CpuFirmware, PlatformDescriptor, PsciError};
use buddy_system_allocator::LockedHeap;
use spin::Once;
use tock_registers::interfaces::{Readable, Writeable};

/// UART used until the descriptor names one (QEMU virt)
const EARLY_UART_PHYS: u64 = 0x0900_0000;

const SECONDARY_STACK_SIZE: usize = 64 * 1024;

/// Affinity fields of MPIDR_EL1
const MPIDR_AFFINITY_MASK: u64 = 0xFF_00FF_FFFF;

const CACHE_LINE: u64 = 64;

#[global_allocator]
static HEAP: LockedHeap<32> = LockedHeap::empty();

// SAFETY: the UART register block is identity mapped by the loader
static EARLY_UART: Pl011 = unsafe { Pl011::new(VirtAddr::new(EARLY_UART_PHYS)) };
static FALLBACK_PSCI: Psci = Psci::new(PsciConduit::Smc);
static COUNTER: ArchCounter = ArchCounter;

/// Read by the secondary entry stub with the MMU off
static BOOT_ARGS: BootArgsTable = BootArgsTable::new();

/// TTBR0 and TCR the secondaries copy from the primary
#[repr(C)]
struct SecondaryMmu {
    ttbr0: AtomicU64,
    tcr: AtomicU64,
}

static SECONDARY_MMU: SecondaryMmu = SecondaryMmu {
    ttbr0: AtomicU64::new(0),
    tcr: AtomicU64::new(0),
};

static COORDINATOR: Once<&'static BringupCoordinator> = Once::new();

unsafe extern "C" {
    static __kernel_start: u8;
    static __kernel_end: u8;
    static __heap_start: u8;
    static __heap_end: u8;
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    early_println!(&EARLY_UART, "axon: panic: {}", info);
    boot::halt()
}

#[unsafe(naked)]
#[unsafe(no_mangle)]
#[unsafe(link_section = ".text.boot")]
pub unsafe extern "C" fn _start() -> ! {
    core::arch::naked_asm!(
        "ldr x9, =__stack_top",
        "mov sp, x9",
        "mov x19, x0",
        "mov x20, x1",
        "mov x21, x2",
        // FP/SIMD at EL1
        "mov x9, #(3 << 20)",
        "msr CPACR_EL1, x9",
        "isb",
        "ldr x9, =__bss_start",
        "ldr x10, =__bss_end",
        "1:",
        "cmp x9, x10",
        "b.hs 2f",
        "str xzr, [x9], #8",
        "b 1b",
        "2:",
        "mov x0, x19",
        "mov x1, x20",
        "mov x2, x21",
        "bl {main}",
        "b .",
        main = sym primary_main,
    );
}

/// `virt - phys` of everything inside the image
fn image_offset(image: &KernelImage) -> u64 {
    image.link_base.as_u64().wrapping_sub(image.load_base.as_u64())
}

fn to_phys(offset: u64, va: u64) -> PhysAddr {
    PhysAddr::new(va.wrapping_sub(offset))
}

extern "C" fn primary_main(blob: *const u8, core_id: u64, load_base: u64) -> ! {
    let start = &raw const __kernel_start as u64;
    let end = &raw const __kernel_end as u64;
    let image = KernelImage::new(PhysAddr::new(load_base), VirtAddr::new(start), end - start);

    let heap_start = &raw const __heap_start as usize;
    let heap_end = &raw const __heap_end as usize;
    // SAFETY: the heap section is reserved by the linker script and used by
    // nothing else.
    unsafe { HEAP.lock().init(heap_start, heap_end - heap_start) };

    let early = EarlyPlatform {
        console: &EARLY_UART,
        power: &FALLBACK_PSCI,
    };

    // SAFETY: the loader passes the descriptor in x0, identity mapped.
    unsafe { boot::kernel_main(blob, core_id as u32, early, |descriptor| board_hardware(descriptor, image)) }
}

fn board_hardware(descriptor: &PlatformDescriptor, image: KernelImage) -> BootHardware<'static> {
    let offset = image_offset(&image);
    let console: &'static Pl011 = match descriptor.console() {
        // SAFETY: the window is reachable through the identity map
        Some(w) => Box::leak(Box::new(unsafe { Pl011::new(VirtAddr::new(w.base.as_u64())) })),
        None => &EARLY_UART,
    };
    let psci: &'static Psci = Box::leak(Box::new(Psci::new(descriptor.psci_conduit())));
    let firmware: &'static CleaningFirmware = Box::leak(Box::new(CleaningFirmware { psci }));

    // No MMIO accelerator driver is built into this image yet
    log::info!("boot: no accelerator driver for this board");

    BootHardware {
        console,
        counter: &COUNTER,
        power: psci,
        firmware,
        release: spin_table_release,
        boot_args: &BOOT_ARGS,
        boot_args_phys: to_phys(offset, &raw const BOOT_ARGS as u64),
        arch: Box::leak(Box::new(Aarch64 { offset })),
        image,
        secondary_entry: to_phys(offset, secondary_entry_stub as usize as u64),
        stacks: secondary_stacks(offset),
        accelerator: None,
        drivers: Vec::new(),
        on_bringup: Some(remember_coordinator),
    }
}

fn remember_coordinator(coordinator: &'static BringupCoordinator) {
    COORDINATOR.call_once(|| coordinator);
}

/// One heap-backed stack per core slot
fn secondary_stacks(offset: u64) -> Vec<InitialStack> {
    let Ok(layout) = Layout::from_size_align(SECONDARY_STACK_SIZE, 16) else {
        return Vec::new();
    };
    (0..MAX_CPUS)
        .map_while(|_| {
            // SAFETY: non-zero size
            let base = unsafe { alloc(layout) } as u64;
            (base != 0).then(|| {
                InitialStack::new(
                    to_phys(offset, base),
                    VirtAddr::new(base + SECONDARY_STACK_SIZE as u64),
                )
            })
        })
        .collect()
}

/// Write back `[start, start + len)` so a core with its MMU off sees it.
fn clean_to_poc(start: u64, len: u64) {
    let mut line = start & !(CACHE_LINE - 1);
    while line < start + len {
        // SAFETY: cache maintenance on mapped kernel memory
        unsafe { core::arch::asm!("dc cvac, {}", in(reg) line, options(nostack)) };
        line += CACHE_LINE;
    }
    barrier::dsb(barrier::SY);
}

fn spin_table_release(release: VirtAddr, entry: PhysAddr) {
    let ptr = release.as_u64() as *mut u64;
    // SAFETY: `release` is the linear-map address of the descriptor's
    // release location.
    unsafe { core::ptr::write_volatile(ptr, entry.as_u64()) };
    clean_to_poc(release.as_u64(), 8);
    clean_to_poc(&raw const BOOT_ARGS as u64, core::mem::size_of::<BootArgsTable>() as u64);
    aarch64_cpu::asm::sev();
}

/// PSCI with the boot arguments written back before each `CPU_ON`
struct CleaningFirmware {
    psci: &'static Psci,
}

impl CpuFirmware for CleaningFirmware {
    fn cpu_on(&self, mpidr: u64, entry: PhysAddr, context: u64) -> Result<(), PsciError> {
        clean_to_poc(&raw const BOOT_ARGS as u64, core::mem::size_of::<BootArgsTable>() as u64);
        self.psci.cpu_on(mpidr, entry, context)
    }

    fn affinity_info(&self, mpidr: u64) -> Result<AffinityState, PsciError> {
        self.psci.affinity_info(mpidr)
    }
}

// -- Translation tables

#[repr(C, align(4096))]
struct PageTable(RawTable);

/// Tables carved from the kernel heap, which lives inside the image
struct HeapTables {
    offset: u64,
    owned: Vec<NonNull<RawTable>>,
}

impl HeapTables {
    fn find(&self, pa: PhysAddr) -> Option<NonNull<RawTable>> {
        let va = pa.as_u64().wrapping_add(self.offset);
        self.owned.iter().copied().find(|t| t.as_ptr() as u64 == va)
    }
}

impl TableAllocator for HeapTables {
    fn allocate_table(&mut self) -> Option<PhysAddr> {
        // SAFETY: non-zero size
        let ptr = unsafe { alloc_zeroed(Layout::new::<PageTable>()) }.cast::<RawTable>();
        let table = NonNull::new(ptr)?;
        self.owned.push(table);
        Some(to_phys(self.offset, ptr as u64))
    }

    fn table(&self, pa: PhysAddr) -> Option<&RawTable> {
        // SAFETY: owned tables are live and only reached through `self`
        self.find(pa).map(|t| unsafe { t.as_ref() })
    }

    fn table_mut(&mut self, pa: PhysAddr) -> Option<&mut RawTable> {
        // SAFETY: as above, and `&mut self` makes the access exclusive
        self.find(pa).map(|mut t| unsafe { t.as_mut() })
    }
}

struct Aarch64 {
    offset: u64,
}

impl ArchSupport for Aarch64 {
    fn install_tables(&mut self, mappings: &MappingTable) -> Result<PhysAddr, BringupError> {
        let allocator = HeapTables {
            offset: self.offset,
            owned: Vec::new(),
        };
        let mut tables = TranslationTables::new(allocator).map_err(|e| {
            log::error!("mmu: {}", e);
            BringupError::LayoutUnavailable
        })?;
        tables.map_all(mappings).map_err(|e| {
            log::error!("mmu: {}", e);
            BringupError::LayoutUnavailable
        })?;
        let root = tables.root();
        // The tables live for the rest of the kernel's life
        core::mem::forget(tables);

        barrier::dsb(barrier::ISHST);
        MAIR_EL1.set(MAIR_EL1_VALUE);
        TTBR1_EL1.set(root.as_u64());
        barrier::isb(barrier::SY);
        // SAFETY: TLB maintenance only
        unsafe { core::arch::asm!("tlbi vmalle1", options(nostack)) };
        barrier::dsb(barrier::SY);
        barrier::isb(barrier::SY);

        SECONDARY_MMU.ttbr0.store(TTBR0_EL1.get(), Ordering::Relaxed);
        SECONDARY_MMU.tcr.store(TCR_EL1.get(), Ordering::Relaxed);
        clean_to_poc(&raw const SECONDARY_MMU as u64, core::mem::size_of::<SecondaryMmu>() as u64);

        log::debug!("mmu: kernel tables at {}", root);
        Ok(root)
    }

    fn install_vectors(&mut self) {
        install_vectors();
    }
}

// -- Exceptions

#[unsafe(naked)]
#[unsafe(link_section = ".vectors")]
unsafe extern "C" fn exception_vectors() {
    core::arch::naked_asm!(
        ".balign 0x800",
        ".rept 16",
        ".balign 0x80",
        "b {handler}",
        ".endr",
        handler = sym unhandled_exception,
    );
}

fn install_vectors() {
    VBAR_EL1.set(exception_vectors as usize as u64);
    barrier::isb(barrier::SY);
}

/// Interrupts are polled, so any exception taken here is a bug
extern "C" fn unhandled_exception() -> ! {
    early_println!(
        &EARLY_UART,
        "axon: unhandled exception esr={:#x} elr={:#x} far={:#x}",
        ESR_EL1.get(),
        ELR_EL1.get(),
        FAR_EL1.get()
    );
    boot::halt()
}

// -- Secondary cores

/// Secondary entry, MMU off.
///
/// `x0` is the physical address of this core's boot argument slot. Spin-table
/// releases pass 0; the slot is then found by MPIDR.
#[unsafe(naked)]
#[unsafe(no_mangle)]
#[unsafe(link_section = ".text.smp")]
pub unsafe extern "C" fn secondary_entry_stub() -> ! {
    core::arch::naked_asm!(
        "mov x9, #(3 << 20)",
        "msr CPACR_EL1, x9",
        "isb",
        "cbnz x0, 3f",

        // Find the slot whose mpidr matches ours
        "mrs x10, MPIDR_EL1",
        "ldr x11, ={aff_mask}",
        "and x10, x10, x11",
        "adrp x0, {args}",
        "add x0, x0, :lo12:{args}",
        "mov x12, #{max_cpus}",
        "1:",
        "ldr x11, [x0]",
        "cmp x11, x10",
        "b.eq 3f",
        "add x0, x0, #{slot_size}",
        "subs x12, x12, #1",
        "b.ne 1b",
        "2:",
        "wfe",
        "b 2b",

        // x0 = slot: mpidr, core_id, stack_top, translation_root
        "3:",
        "ldr x19, [x0, #8]",
        "ldr x20, [x0, #16]",
        "ldr x21, [x0, #24]",
        "adrp x9, {mmu}",
        "add x9, x9, :lo12:{mmu}",
        "ldr x22, [x9]",
        "ldr x23, [x9, #8]",

        "ldr x9, ={mair}",
        "msr MAIR_EL1, x9",
        "msr TCR_EL1, x23",
        "msr TTBR0_EL1, x22",
        "msr TTBR1_EL1, x21",
        "isb",
        "dsb sy",
        "tlbi vmalle1",
        "dsb sy",
        "isb",

        "mrs x9, SCTLR_EL1",
        "orr x9, x9, #(1 << 0)",
        "orr x9, x9, #(1 << 2)",
        "orr x9, x9, #(1 << 12)",
        "msr SCTLR_EL1, x9",
        "isb",

        // Still executing from the identity map: jump to the link address
        "mov sp, x20",
        "mov x0, x19",
        "ldr x9, ={entry}",
        "br x9",

        aff_mask = const MPIDR_AFFINITY_MASK,
        args = sym BOOT_ARGS,
        max_cpus = const MAX_CPUS,
        slot_size = const axon_kernel::smp::SecondaryBootArgs::SIZE,
        mmu = sym SECONDARY_MMU,
        mair = const MAIR_EL1_VALUE,
        entry = sym secondary_main,
    );
}

struct SecondaryCpu;

impl SecondaryInit for SecondaryCpu {
    fn enable_layout(&mut self, core: CoreId, layout: &PublishedLayout) {
        // The entry stub already loaded the published root
        if TTBR1_EL1.get() != layout.translation_root.as_u64() {
            log::warn!("smp: {} is not on the published tables", core);
        }
    }

    fn install_vectors(&mut self, _core: CoreId) {
        install_vectors();
    }
}

extern "C" fn secondary_main(core_id: u64) -> ! {
    let core = CoreId::new(core_id as u32);
    match COORDINATOR.get() {
        Some(coordinator) => {
            if let Err(e) = coordinator.secondary_entry(core, &mut SecondaryCpu) {
                log::error!("smp: {} parked: {}", core, e);
            }
        }
        None => early_println!(&EARLY_UART, "axon: {} started before bring-up", core),
    }
    boot::halt()
}
