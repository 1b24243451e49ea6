//! argon - a minimal KVM microVM monitor.
//!
//! Boots an unmodified x86_64 Linux bzImage straight into 64-bit long mode
//! (no BIOS, no bootloader) and gives it a serial console plus one
//! virtio-mmio block device backed by a host file. One thread, one vCPU:
//! the guest runs until it traps, the exit is dispatched to a device model,
//! and the guest resumes.
//!
//! Requires Linux with KVM; other platforms only get a build that refuses
//! to run.

#[cfg(target_os = "linux")]
mod boot;
#[cfg(target_os = "linux")]
mod devices;
#[cfg(target_os = "linux")]
mod kvm;

use clap::Parser;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "argon")]
#[command(about = "A minimal KVM microVM monitor with a virtio-mmio block device")]
struct Args {
    /// Path to the Linux kernel bzImage
    kernel: String,

    /// Path to a raw disk image, exposed as a virtio block device
    disk: Option<String>,

    /// Base kernel command line (device and fast-boot options are appended)
    #[arg(short, long, default_value = "console=ttyS0")]
    cmdline: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

#[cfg(target_os = "linux")]
fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    use boot::{layout, BootConfig, GuestMemory};
    use devices::{
        MmioBus, Serial, VirtioBlk, SERIAL_COM1_BASE, SERIAL_COM1_END, VIRTIO_BLK_IRQ,
        VIRTIO_MMIO_BASE, VIRTIO_MMIO_SIZE,
    };
    use kvm::{IoData, IoHandler, KvmIrqLine, MmioHandler, VcpuExit};
    use std::sync::Arc;

    eprintln!("[vmm] argon starting");
    eprintln!("[vmm] kernel: {}", args.kernel);
    if let Some(ref disk) = args.disk {
        eprintln!("[vmm] disk: {disk}");
    }

    let vm = Arc::new(kvm::create_vm()?);
    let memory = GuestMemory::new(layout::GUEST_MEM_SIZE)?;

    // Base command line, fast-boot knobs that cut needless VM exits, and
    // the virtio-mmio device description matching the window we expose.
    let mut cmdline = args.cmdline.clone();
    cmdline.push_str(" i8042.noaux i8042.nomux i8042.dumbkbd");
    cmdline.push_str(" audit=0 selinux=0 nokaslr");
    if args.disk.is_some() {
        cmdline.push_str(&format!(
            " virtio_mmio.device={VIRTIO_MMIO_SIZE:#x}@{VIRTIO_MMIO_BASE:#x}:{VIRTIO_BLK_IRQ}"
        ));
    }

    let config = BootConfig {
        kernel_path: args.kernel.clone(),
        cmdline,
        mem_size: layout::GUEST_MEM_SIZE,
    };
    boot::setup_boot(&vm, &memory, &config)?;

    let mut mmio_bus = MmioBus::new();
    if let Some(ref disk_path) = args.disk {
        let irq = KvmIrqLine::new(Arc::clone(&vm), VIRTIO_BLK_IRQ);
        let blk = VirtioBlk::new(disk_path, memory.clone(), Box::new(irq))?;
        mmio_bus.register(VIRTIO_MMIO_BASE, VIRTIO_MMIO_SIZE, Box::new(blk));
        eprintln!("[vmm] virtio-blk at {VIRTIO_MMIO_BASE:#x}, IRQ {VIRTIO_BLK_IRQ}");
    }

    let mut vcpu = vm.create_vcpu(0)?;
    vcpu.set_boot_msrs()?;
    boot::setup_vcpu_regs(&vcpu, &memory)?;

    struct DeviceHandler {
        serial: Serial,
        mmio_bus: MmioBus,
    }

    impl IoHandler for DeviceHandler {
        fn io_read(&mut self, port: u16, data: &mut IoData) {
            if (SERIAL_COM1_BASE..=SERIAL_COM1_END).contains(&port) {
                let value = self.serial.read(port - SERIAL_COM1_BASE);
                for i in 0..data.len() {
                    data.set(i, value);
                }
            } else {
                // Unemulated ports read as floating bus.
                for i in 0..data.len() {
                    data.set(i, 0xff);
                }
            }
        }

        fn io_write(&mut self, port: u16, data: &IoData) {
            if (SERIAL_COM1_BASE..=SERIAL_COM1_END).contains(&port) {
                let offset = port - SERIAL_COM1_BASE;
                for &byte in data.as_slice() {
                    self.serial.write(offset, byte);
                }
            }
            // Writes to other ports are dropped silently.
        }
    }

    impl MmioHandler for DeviceHandler {
        fn mmio_read(&mut self, addr: u64, data: &mut [u8]) {
            self.mmio_bus.read(addr, data);
        }

        fn mmio_write(&mut self, addr: u64, data: &[u8]) {
            self.mmio_bus.write(addr, data);
        }
    }

    let mut handler = DeviceHandler {
        serial: Serial::new(),
        mmio_bus,
    };

    eprintln!("[vmm] starting vCPU");

    loop {
        match vcpu.run_with_io(&mut handler)? {
            VcpuExit::Io => {
                // Already serviced by the handler.
            }
            VcpuExit::Hlt => {
                eprintln!("\n[vmm] guest halted");
                return Ok(());
            }
            VcpuExit::Shutdown => {
                if let Ok(regs) = vcpu.get_regs() {
                    eprintln!("[vmm] final RIP: {:#x}", regs.rip);
                }
                return Err("guest shutdown (triple fault?)".into());
            }
            VcpuExit::InternalError => {
                return Err("KVM internal error".into());
            }
            VcpuExit::FailEntry(reason) => {
                return Err(format!("failed to enter guest: hardware reason {reason:#x}").into());
            }
            VcpuExit::SystemEvent(event) => {
                return Err(format!("unexpected system event {event}").into());
            }
            VcpuExit::Unknown(what) => {
                return Err(format!("unhandled vCPU exit: {what}").into());
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn run(_args: Args) -> Result<(), Box<dyn std::error::Error>> {
    Err("argon requires Linux with KVM support".into())
}
