//! Kernel entry point and boot wiring.
//!
//! Order matters: platform facts, command line, logging, the physical
//! allocator, the kernel heap, scheduler and timer, the VFS root, the
//! capability database, boot drivers and finally the init process.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

extern crate alloc;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod boot {
    use alloc::{string::String, vec::Vec};
    use bootloader_api::{
        config::Mapping, entry_point, BootInfo, BootloaderConfig,
    };
    use helion_kernel::{
        caps, cmdline, driver, fs, klog,
        mm::{self, pmm, VirtAddr, PAGE_SIZE},
        platform, process, sched, syscall, timer,
    };

    /// Kernel heap handed to `linked_list_allocator` at boot.
    const HEAP_PAGES: usize = 4096; // 16 MiB

    /// Build-time command line; the boot protocol's own cmdline channel
    /// is owned by the out-of-scope loader shim.
    const BOOT_CMDLINE: &str = match option_env!("HELION_CMDLINE") {
        Some(s) => s,
        None => "",
    };

    pub static BOOTLOADER_CONFIG: BootloaderConfig = {
        let mut config = BootloaderConfig::new_default();
        config.mappings.physical_memory = Some(Mapping::Dynamic);
        config
    };

    entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

    fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
        let phys_offset = boot_info
            .physical_memory_offset
            .into_option()
            .unwrap_or(0);
        platform::x86_64::early_init(phys_offset, 1);
        cmdline::init(BOOT_CMDLINE);
        klog::init();
        log::info!("helion: booting");

        // Physical memory from the boot map.
        let mut map = Vec::new();
        for region in boot_info.memory_regions.iter() {
            map.push(pmm::MemoryMapEntry {
                base: mm::PhysAddr::new(region.start),
                pages: ((region.end - region.start) / PAGE_SIZE as u64) as usize,
                usable: region.kind == bootloader_api::info::MemoryRegionKind::Usable,
            });
        }
        pmm::init(&map);

        // Kernel heap.
        let heap = pmm::allocate(HEAP_PAGES, 1).expect("boot heap");
        // SAFETY: freshly allocated frames inside the physical window,
        // used exactly once.
        unsafe {
            helion_kernel::init_heap(platform::phys_to_virt(heap), HEAP_PAGES * PAGE_SIZE);
        }

        // Scheduler, timer, and this CPU's identity.
        sched::init(platform::cpu_count());
        sched::thread::set_stack_free_hook(free_thread_stack);
        let boot_thread = sched::Thread::new(
            Some(String::from("boot")),
            sched::Priority::Normal,
            u64::MAX,
        );
        sched::adopt(&boot_thread);
        let idle = sched::Thread::new(Some(String::from("idle")), sched::Priority::Idle, 1);
        sched::with_scheduler(|s| s.set_idle(0, idle));
        timer::init().expect("platform timer");

        // VFS root, capability database, boot process.
        fs::init_root().expect("root filesystem");
        let root_creds = process::Credentials::root();
        let _ = fs::fd::mkdir_at(&fs::dirent::root(), "/etc", 0o755, &root_creds);
        let _ = fs::fd::mkdir_at(&fs::dirent::root(), "/etc/perms", 0o755, &root_creds);
        let _ = caps::init(caps::DEFAULT_PREFIX, false);

        let kernel_proc = process::Process::new(
            String::from("kernel"),
            mm::context::kernel_space(),
        );
        kernel_proc.adopt_thread(&boot_thread);

        for module in cmdline::get_list("load-modules") {
            match fs::fd::open(&module, fs::OpenFlags::READ, &root_creds) {
                Ok(file) => {
                    let mut image = alloc::vec![0u8; file.vnode.len() as usize];
                    if file.read_at(0, &mut image).is_ok() {
                        match driver::loader::load(&image) {
                            Ok(drv) => {
                                let _ = driver::loader::start(&drv);
                            }
                            Err(e) => log::error!("driver '{}' failed to load: {}", module, e),
                        }
                    }
                }
                Err(e) => log::warn!("driver module '{}' unavailable: {}", module, e),
            }
        }

        if !cmdline::get_flag("no-init") {
            let init_path = cmdline::get_str("init-path")
                .unwrap_or_else(|| String::from("/bin/init"));
            match syscall::spawn_process(&init_path, &root_creds) {
                Ok(proc) => log::info!("init: pid {}", proc.pid),
                Err(e) => log::error!("init '{}' failed: {}", init_path, e),
            }
        }

        log::info!("helion: boot complete, entering the idle loop");
        loop {
            sched::yield_now();
            platform::wait_for_interrupt();
        }
    }

    fn free_thread_stack(base: VirtAddr, _pages: usize) {
        let _ = mm::context::kernel_space().free(base);
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        klog::panic_banner(info);
        platform::halt_forever()
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The kernel proper only runs on bare metal; the host build exists
    // for the test suite in the library crate.
    helion_kernel::platform::console_write("helion-kernel: host build, run `cargo test`\n");
}
