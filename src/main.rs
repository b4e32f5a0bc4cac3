// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! An EL3 secure monitor for AArch64: switches CPUs between the secure and normal worlds, routes
//! SMCs to the services which own them and coordinates CPU and cluster power states over PSCI.

#![cfg_attr(not(test), no_main)]
#![cfg_attr(not(test), no_std)]

mod aarch64;
mod context;
mod debug;
mod dispatch;
mod exceptions;
mod interrupts;
mod logger;
mod platform;
#[cfg(all(platform = "qemu", not(test)))]
mod semihosting;
mod services;
mod smccc;
mod stacks;
mod sysregs;

use crate::{
    context::{ContextManager, CoresImpl, World},
    dispatch::Dispatcher,
    platform::{Platform, PlatformImpl},
    services::{Services, psci::WakeUpReason},
};
#[cfg(all(target_arch = "aarch64", not(test)))]
pub use asm::monitor_warm_entrypoint;
use log::{debug, info};
use percore::Cores;
use spin::{Lazy, Once};

/// The saved contexts of every world on every CPU.
#[cfg_attr(test, allow(unused))]
static CONTEXTS: ContextManager = ContextManager::new();

/// The services, created on first use by the primary CPU.
#[cfg_attr(test, allow(unused))]
static SERVICES: Lazy<Services<'static>> =
    Lazy::new(|| Services::new(&CONTEXTS, CoresImpl::core_index()));

#[cfg_attr(test, allow(unused))]
static DISPATCHER: Once<Dispatcher<'static>> = Once::new();

/// Initialises the contexts of every world on `cpu` for a cold boot.
#[cfg_attr(test, allow(unused))]
fn initialise_contexts(cpu: usize) {
    CONTEXTS.init(cpu, World::NonSecure, &PlatformImpl::non_secure_entry_point());
    CONTEXTS.init(cpu, World::Secure, &PlatformImpl::secure_entry_point(cpu));
    #[cfg(feature = "rme")]
    CONTEXTS.init(cpu, World::Realm, &PlatformImpl::realm_entry_point(cpu));
}

#[cfg_attr(test, allow(unused))]
extern "C" fn monitor_main(arg0: u64, arg1: u64, arg2: u64, arg3: u64) -> ! {
    PlatformImpl::init(arg0, arg1, arg2, arg3);

    info!("EL3 monitor starting");
    info!("Parameters: {arg0:#0x} {arg1:#0x} {arg2:#0x} {arg3:#0x}");

    #[cfg(all(target_arch = "aarch64", not(test)))]
    exceptions::install_vector_table();

    let cpu = CoresImpl::core_index();
    let dispatcher = DISPATCHER.call_once(|| {
        Dispatcher::new(&CONTEXTS, &SERVICES.list())
            .unwrap_or_else(|error| panic!("Failed to register services: {error}"))
    });
    debug!("Power domains: {:?}", SERVICES.psci);

    initialise_contexts(cpu);

    // The secure world initialises first, and hands over to the normal world when it is done.
    dispatcher.run_loop(cpu, World::Secure)
}

#[cfg_attr(test, allow(unused))]
extern "C" fn psci_warmboot_entrypoint() -> ! {
    let cpu = CoresImpl::core_index();
    debug!("Warm boot on CPU {cpu}");

    #[cfg(all(target_arch = "aarch64", not(test)))]
    exceptions::install_vector_table();

    let dispatcher = DISPATCHER
        .get()
        .expect("Warm boot before the dispatcher was set up");

    match SERVICES.psci.handle_cpu_boot(cpu) {
        WakeUpReason::CpuOn(entry_point) => {
            // Power on for the first time or after CPU_OFF. CPU_ON already initialised the
            // contexts, and the secure world gets to run its own warm boot path first.
            debug!(
                "Wakeup from CPU_OFF, normal world entry point {:#x}",
                entry_point.entry_point_address()
            );
            dispatcher.run_loop(cpu, World::Secure)
        }
        WakeUpReason::SuspendFinished(entry_point) => {
            debug!(
                "Wakeup from CPU_SUSPEND, resuming at {:#x}",
                entry_point.entry_point_address()
            );
            dispatcher.run_loop(cpu, World::NonSecure)
        }
    }
}

#[cfg(all(target_arch = "aarch64", not(test)))]
mod asm {
    use super::*;
    use crate::stacks::set_my_stack;
    use arm_sysregs::SctlrEl3;

    /// The cold boot entrypoint, executed by every CPU which comes out of reset. Only the primary
    /// CPU, at core position 0, boots the monitor. The others wait in the platform's holding pen
    /// until `CPU_ON` releases them.
    #[unsafe(naked)]
    #[unsafe(no_mangle)]
    #[unsafe(link_section = ".text.entry")]
    unsafe extern "C" fn monitor_entrypoint() -> ! {
        naked_asm!(
            // Keep the boot arguments somewhere the calls below leave alone.
            "mov	x20, x0",
            "mov	x21, x1",
            "mov	x22, x2",
            "mov	x23, x3",
            "msr	daifset, #0xf",
            // Instruction cache and stack alignment checks on, MMU off.
            "mrs	x0, sctlr_el3",
            "orr	x0, x0, #{SCTLR_I_BIT}",
            "orr	x0, x0, #{SCTLR_SA_BIT}",
            "msr	sctlr_el3, x0",
            "isb",
            "mrs	x0, mpidr_el1",
            "bl	{core_position}",
            "cbz	x0, 0f",
            "b	{secondary_cold_boot}",
        "0:",
            // Zero .bss.
            "adrp	x0, bss_begin",
            "add	x0, x0, :lo12:bss_begin",
            "adrp	x1, bss_end",
            "add	x1, x1, :lo12:bss_end",
        "1:",
            "cmp	x0, x1",
            "b.hs	2f",
            "stp	xzr, xzr, [x0], #16",
            "b	1b",
        "2:",
            "bl	{set_my_stack}",
            "mov	x0, x20",
            "mov	x1, x21",
            "mov	x2, x22",
            "mov	x3, x23",
            "b	{monitor_main}",
            SCTLR_I_BIT = const SctlrEl3::I.bits(),
            SCTLR_SA_BIT = const SctlrEl3::SA.bits(),
            core_position = sym <PlatformImpl as Platform>::core_position,
            secondary_cold_boot = sym <PlatformImpl as Platform>::secondary_cold_boot,
            set_my_stack = sym set_my_stack,
            monitor_main = sym monitor_main,
        );
    }

    /// This CPU has been physically powered up. It is either resuming from suspend or has simply
    /// been turned on. In both cases, call the warm boot entrypoint.
    ///
    /// # Safety
    ///
    /// This must be called with nothing on the stack, as a fresh stack is set up.
    #[unsafe(naked)]
    pub unsafe extern "C" fn monitor_warm_entrypoint() -> ! {
        naked_asm!(
            "msr	daifset, #0xf",
            "mrs	x0, sctlr_el3",
            "orr	x0, x0, #{SCTLR_I_BIT}",
            "orr	x0, x0, #{SCTLR_SA_BIT}",
            "msr	sctlr_el3, x0",
            "isb",
            "bl	{set_my_stack}",
            "b	{psci_warmboot_entrypoint}",
            SCTLR_I_BIT = const SctlrEl3::I.bits(),
            SCTLR_SA_BIT = const SctlrEl3::SA.bits(),
            set_my_stack = sym set_my_stack,
            psci_warmboot_entrypoint = sym psci_warmboot_entrypoint,
        );
    }

    /// This macro wraps a naked_asm block with `bti`, or any other universal
    /// prologue we'd still like added.
    ///
    /// Use this over `core::arch::naked_asm` by default, otherwise you may
    /// need to ensure that e.g. `bti` landing pads are in place yourself.
    macro_rules! naked_asm {
        ($($inner:tt)*) => {
           ::core::arch::naked_asm!("bti c", $($inner)*)
        }
    }
    pub(crate) use naked_asm;
}

#[cfg(all(target_arch = "aarch64", not(test)))]
pub(crate) use asm::naked_asm;
