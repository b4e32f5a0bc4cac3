// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

use super::Platform;
use crate::{
    aarch64::{dsb_sy, sev, wfi},
    context::EntryPointInfo,
    logger::{self, LockedWriter},
    monitor_warm_entrypoint, naked_asm,
    semihosting::{AdpStopped, semihosting_exit},
    services::psci::{
        PlatformPowerStateInterface, PowerStateType, PsciCompositePowerState,
        PsciPlatformInterface, PsciPlatformOptionalFeatures, try_get_cpu_index_by_mpidr,
    },
};
use arm_pl011_uart::{PL011Registers, Uart, UniqueMmioPointer};
use arm_psci::{ErrorCode, Mpidr, PowerState};
use arm_sysregs::{MpidrEl1, Spsr};
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};
use log::{error, info};
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[cfg(feature = "rme")]
compile_error!("RME is not supported on QEMU");

const SEC_SRAM_BASE: usize = 0x0e00_0000;
const SHARED_RAM_BASE: usize = SEC_SRAM_BASE;
const BL32_BASE: usize = 0x0e10_0000;
const NS_IMAGE_BASE: usize = 0x6000_0000;

/// Base address of the trusted mailbox.
/// The mailbox has a storage buffer at its base, and a doorbell for each CPU.
/// The size of the mailbox is 8 for the buffer plus memory reserved for the doorbells, or holding
/// pens, which is equal to Qemu::CORE_COUNT * 8.
const TRUSTED_MAILBOX_BASE: usize = SHARED_RAM_BASE;
/// Location to which to write the address that secondary cores should jump to after being released
/// from their holding pens.
const HOLD_ENTRYPOINT: *mut unsafe extern "C" fn() -> ! = TRUSTED_MAILBOX_BASE as _;
/// Base address of hold entries for secondary cores. Writing `HOLD_STATE_GO` to the entry for a
/// secondary core will cause it to be released from its holding pen and jump to `*HOLD_ENTRYPOINT`.
const HOLD_BASE: usize = TRUSTED_MAILBOX_BASE + 8;
const HOLD_ENTRY_SHIFT: u64 = 3;
const HOLD_STATE_WAIT: u64 = 0;
const HOLD_STATE_GO: u64 = 1;

/// Base address of the secure world PL011 UART, aka. UART1.
const UART1_BASE: usize = 0x0904_0000;
const PL011_BASE_ADDRESS: *mut PL011Registers = UART1_BASE as _;

/// The number of CPU clusters.
const CLUSTER_COUNT: usize = 1;
const PLATFORM_CPU_PER_CLUSTER_SHIFT: usize = 2;
/// The maximum number of CPUs in each cluster.
const MAX_CPUS_PER_CLUSTER: usize = 1 << PLATFORM_CPU_PER_CLUSTER_SHIFT;

#[cfg(feature = "sel2")]
const SECURE_SPSR: Spsr = Spsr::D
    .union(Spsr::A)
    .union(Spsr::I)
    .union(Spsr::F)
    .union(Spsr::M_AARCH64_EL2H);
#[cfg(not(feature = "sel2"))]
const SECURE_SPSR: Spsr = Spsr::D
    .union(Spsr::A)
    .union(Spsr::I)
    .union(Spsr::F)
    .union(Spsr::M_AARCH64_EL1H);

/// Set once the PSCI platform has been handed out.
static PSCI_PLATFORM_TAKEN: AtomicBool = AtomicBool::new(false);

/// The aarch64 'virt' machine of the QEMU emulator.
pub struct Qemu;

// SAFETY: `core_position` is indeed a naked function, doesn't access the stack or any other memory,
// only clobbers x0 and x1, and returns a unique index as long as `PLATFORM_CPU_PER_CLUSTER_SHIFT`
// is correct.
unsafe impl Platform for Qemu {
    const CORE_COUNT: usize = CLUSTER_COUNT * MAX_CPUS_PER_CLUSTER;

    type LogSinkImpl = LockedWriter<Uart<'static>>;
    type PsciPlatformImpl = QemuPsciPlatformImpl;

    fn init(_arg0: u64, _arg1: u64, _arg2: u64, _arg3: u64) {
        // SAFETY: `PL011_BASE_ADDRESS` is the base address of a PL011 device, and nothing else
        // accesses that address range.
        let uart_pointer =
            unsafe { UniqueMmioPointer::new(NonNull::new(PL011_BASE_ADDRESS).unwrap()) };
        logger::init(LockedWriter::new(Uart::new(uart_pointer)))
            .expect("Failed to initialise logger");
        info!("QEMU virt platform with {} CPUs", Self::CORE_COUNT);
    }

    fn secure_entry_point(cpu: usize) -> EntryPointInfo {
        EntryPointInfo {
            pc: BL32_BASE,
            spsr: SECURE_SPSR,
            args: [0, 0, 0, 0, cpu as u64, 0, 0, 0],
        }
    }

    fn non_secure_entry_point() -> EntryPointInfo {
        EntryPointInfo {
            pc: NS_IMAGE_BASE,
            spsr: Spsr::D | Spsr::A | Spsr::I | Spsr::F | Spsr::M_AARCH64_EL2H,
            args: Default::default(),
        }
    }

    fn mpidr_is_valid(mpidr: MpidrEl1) -> bool {
        mpidr.aff3() == 0
            && mpidr.aff2() == 0
            && usize::from(mpidr.aff1()) < CLUSTER_COUNT
            && usize::from(mpidr.aff0()) < MAX_CPUS_PER_CLUSTER
    }

    fn psci_platform() -> Option<Self::PsciPlatformImpl> {
        (!PSCI_PLATFORM_TAKEN.swap(true, Ordering::AcqRel)).then_some(QemuPsciPlatformImpl)
    }

    #[unsafe(naked)]
    extern "C" fn core_position(mpidr: u64) -> usize {
        naked_asm!(
            "and	x1, x0, #{MPIDR_CPU_MASK}",
            "and	x0, x0, #{MPIDR_CLUSTER_MASK}",
            "add	x0, x1, x0, LSR #({MPIDR_AFFINITY_BITS} - {PLATFORM_CPU_PER_CLUSTER_SHIFT})",
            "ret",
            MPIDR_CPU_MASK = const MpidrEl1::AFF0_MASK << MpidrEl1::AFF0_SHIFT,
            MPIDR_CLUSTER_MASK = const MpidrEl1::AFF1_MASK << MpidrEl1::AFF1_SHIFT,
            MPIDR_AFFINITY_BITS = const MpidrEl1::AFFINITY_BITS,
            PLATFORM_CPU_PER_CLUSTER_SHIFT = const PLATFORM_CPU_PER_CLUSTER_SHIFT,
        );
    }

    #[unsafe(naked)]
    unsafe extern "C" fn secondary_cold_boot() -> ! {
        naked_asm!(
            "b	{holding_pen}",
            holding_pen = sym plat_secondary_cold_boot_setup,
        );
    }
}

#[derive(PartialEq, PartialOrd, Debug, Eq, Ord, Clone, Copy, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum QemuPowerState {
    On,
    Standby,
    PowerDown,
}

impl PlatformPowerStateInterface for QemuPowerState {
    const OFF: Self = Self::PowerDown;
    const RUN: Self = Self::On;

    fn power_state_type(&self) -> PowerStateType {
        match self {
            Self::PowerDown => PowerStateType::PowerDown,
            Self::Standby => PowerStateType::StandbyOrRetention,
            Self::On => PowerStateType::Run,
        }
    }
}

pub struct QemuPsciPlatformImpl;

impl PsciPlatformInterface for QemuPsciPlatformImpl {
    const POWER_DOMAIN_COUNT: usize = 1 + CLUSTER_COUNT + Qemu::CORE_COUNT;
    const MAX_POWER_LEVEL: usize = 2;

    const FEATURES: PsciPlatformOptionalFeatures = PsciPlatformOptionalFeatures::CPU_SUSPEND
        .union(PsciPlatformOptionalFeatures::SYSTEM_OFF);

    type PlatformPowerState = QemuPowerState;

    fn topology() -> &'static [usize] {
        &[1, CLUSTER_COUNT, MAX_CPUS_PER_CLUSTER]
    }

    fn try_parse_power_state(power_state: PowerState) -> Option<PsciCompositePowerState> {
        // QEMU can't keep a CPU's state across a power down, so only standby is offered.
        match power_state {
            PowerState::StandbyOrRetention(0) => Some(PsciCompositePowerState::new([
                QemuPowerState::Standby,
                QemuPowerState::On,
                QemuPowerState::On,
            ])),
            _ => None,
        }
    }

    fn cpu_standby(&self, cpu_state: QemuPowerState) {
        assert_eq!(cpu_state, QemuPowerState::Standby);

        dsb_sy();
        wfi();
    }

    fn power_domain_on(&self, mpidr: Mpidr) -> Result<(), ErrorCode> {
        let cpu_index = try_get_cpu_index_by_mpidr(mpidr).ok_or(ErrorCode::InvalidParameters)?;
        debug_assert!(cpu_index < Qemu::CORE_COUNT);
        // SAFETY: HOLD_BASE is a valid address and adding cpu_index does not make it go out of
        // bounds of the holding pens, since cpu_index is guaranteed to be smaller than CORE_COUNT.
        // Writing the warm boot entry point to the mailbox base address and writing HOLD_STATE_GO
        // to the hold address of the appropriate CPU doesn't violate Rust's safety guarantees, as
        // this memory region is only used for the trusted mailbox.
        unsafe {
            HOLD_ENTRYPOINT.write_volatile(monitor_warm_entrypoint);
            let cpu_hold_addr = (HOLD_BASE as *mut u64).add(cpu_index);
            cpu_hold_addr.write_volatile(HOLD_STATE_GO);
        }
        dsb_sy();
        sev();
        Ok(())
    }

    fn power_domain_on_finish(&self, previous_state: &PsciCompositePowerState) {
        assert_eq!(previous_state.cpu_level_state(), QemuPowerState::PowerDown);
    }

    fn power_domain_off(
        &self,
        _level: usize,
        target_state: &PsciCompositePowerState,
    ) -> Result<(), ErrorCode> {
        assert_eq!(target_state.cpu_level_state(), QemuPowerState::PowerDown);
        Ok(())
    }

    fn power_domain_suspend(
        &self,
        level: usize,
        target_state: &PsciCompositePowerState,
    ) -> Result<(), ErrorCode> {
        error!("Unexpected suspend to level {level} with {target_state:?}");
        Err(ErrorCode::NotSupported)
    }

    fn power_domain_suspend_finish(&self, _previous_state: &PsciCompositePowerState) {}

    fn power_domain_power_down_wfi(
        &self,
        _level: usize,
        _target_state: &PsciCompositePowerState,
    ) -> ! {
        // SAFETY: The CPU is about to be switched off, so nothing on its stack is needed any more.
        // `plat_secondary_cold_boot_setup` is trusted assembly.
        unsafe { plat_secondary_cold_boot_setup() }
    }

    fn system_off(&self) -> ! {
        semihosting_exit(AdpStopped::ApplicationExit, 0);
        panic!("Semihosting system off call unexpectedly returned.");
    }

    fn system_reset(&self) -> ! {
        panic!("System reset is not supported on QEMU");
    }
}

/// This function sets up the holding pen mechanism on this core. It waits for an event and then
/// checks the value in the core's holding pen. If the core receives a `HOLD_STATE_GO` signal, it
/// jumps to the location provided in the mailbox (`TRUSTED_MAILBOX_BASE`).
#[unsafe(naked)]
unsafe extern "C" fn plat_secondary_cold_boot_setup() -> ! {
    naked_asm!(
        "mrs x0, mpidr_el1",
        "bl  {core_position}",
        "lsl x0, x0, #{HOLD_ENTRY_SHIFT}",
        "ldr x2, ={HOLD_BASE}",
    "0:",
        "ldr x1, [x2, x0]",
        "cbz x1, 1f",
        "ldr x1, ={HOLD_STATE_WAIT}",
        "str x1, [x2, x0]",
        "ldr x0, ={TRUSTED_MAILBOX_BASE}",
        "ldr x16, [x0]",
    // x16 is chosen to make this bti c compatible, not just bti j
        "br  x16",
    "1:",
        "wfe",
        "b   0b",
        TRUSTED_MAILBOX_BASE = const TRUSTED_MAILBOX_BASE,
        HOLD_BASE = const HOLD_BASE,
        HOLD_ENTRY_SHIFT = const HOLD_ENTRY_SHIFT,
        HOLD_STATE_WAIT = const HOLD_STATE_WAIT,
        core_position = sym <Qemu as Platform>::core_position,
    );
}
