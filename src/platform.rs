// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

macro_rules! select_platform {
    (platform = $condition:literal, $mod:ident::$plat_impl:ident) => {
        #[cfg(all(not(test), platform = $condition))]
        mod $mod;

        #[cfg(all(not(test), platform = $condition))]
        pub use $mod::$plat_impl as PlatformImpl;
    };
    (test, $mod:ident::$plat_impl:ident) => {
        #[cfg(test)]
        pub mod $mod;

        #[cfg(test)]
        pub use $mod::$plat_impl as PlatformImpl;
    };
}

select_platform!(platform = "qemu", qemu::Qemu);
select_platform!(test, test::TestPlatform);

use crate::{
    context::{EntryPointInfo, World},
    logger::LogSink,
    services::psci::PsciPlatformInterface,
};
use arm_sysregs::MpidrEl1;
use log::warn;

/// Type alias for convenience, to avoid having to use the complicated type name everywhere.
pub type LogSinkImpl = <PlatformImpl as Platform>::LogSinkImpl;

pub type PsciPlatformImpl = <PlatformImpl as Platform>::PsciPlatformImpl;
pub type PlatformPowerState = <PsciPlatformImpl as PsciPlatformInterface>::PlatformPowerState;

/// The hooks implemented by all platforms.
///
/// # Safety
///
/// `core_position` must return a unique index less than `CORE_COUNT` for every valid MPIDR, and
/// must be callable from assembly before the stack is set up: it may only clobber x0 and x1.
pub unsafe trait Platform {
    /// The number of CPU cores.
    const CORE_COUNT: usize;

    /// Platform dependent LogSink implementation type for Logger.
    type LogSinkImpl: LogSink;

    /// Platform dependent PsciPlatformInterface implementation type.
    type PsciPlatformImpl: PsciPlatformInterface;

    /// Initialises the logger and anything else the platform needs on the primary core.
    ///
    /// Any logs sent before this is called are dropped.
    fn init(arg0: u64, arg1: u64, arg2: u64, arg3: u64);

    /// Given a valid MPIDR value, returns the corresponding linear core index.
    extern "C" fn core_position(mpidr: u64) -> usize;

    /// Parks a secondary core which came out of reset during cold boot, until `CPU_ON` releases
    /// it to the warm boot entry point.
    ///
    /// # Safety
    ///
    /// Must only be called from the entry point assembly, without a stack.
    #[cfg(all(target_arch = "aarch64", not(test)))]
    unsafe extern "C" fn secondary_cold_boot() -> !;

    /// Returns whether the given MPIDR is valid for this platform.
    fn mpidr_is_valid(mpidr: MpidrEl1) -> bool;

    /// Returns the entry point for the secure world on the given core.
    fn secure_entry_point(cpu: usize) -> EntryPointInfo;

    /// Returns the entry point for the non-secure world on the primary core.
    fn non_secure_entry_point() -> EntryPointInfo;

    /// Returns the entry point for the realm world on the given core.
    #[cfg(feature = "rme")]
    fn realm_entry_point(cpu: usize) -> EntryPointInfo;

    /// Returns the PSCI platform implementation.
    ///
    /// Returns `Some` the first time it is called and `None` afterwards.
    fn psci_platform() -> Option<Self::PsciPlatformImpl>;

    /// Handles an interrupt routed to EL3 while `world` was running on `cpu`, and returns the
    /// world to continue with.
    fn handle_interrupt(cpu: usize, world: World) -> World {
        warn!("Ignoring interrupt taken from {world:?} on CPU {cpu}");
        world
    }
}

