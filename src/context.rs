// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Per-CPU, per-world saved execution state and world switching.

mod simd;

use crate::{
    aarch64::isb,
    interrupts,
    platform::{Platform, PlatformImpl},
    smccc::SmcReturn,
    sysregs::is_feat_vhe_present,
};
use arm_psci::EntryPoint;
#[cfg(not(feature = "sel2"))]
use arm_sysregs::SctlrEl1;
#[cfg(feature = "sel2")]
use arm_sysregs::{HcrEl2, IccSre};
use arm_sysregs::{
    CptrEl3, Esr, ScrEl3, Spsr, read_cptr_el3, read_mpidr_el1, write_cptr_el3, write_scr_el3,
};
use core::ops::{Index, IndexMut};
use log::trace;
use percore::Cores;
use simd::SimdContext;
use spin::mutex::{SpinMutex, SpinMutexGuard};

/// The number of worlds which have a context on each CPU.
const WORLD_COUNT: usize = if cfg!(feature = "rme") { 3 } else { 2 };

/// A security state that a lower EL can run in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum World {
    Secure = 0,
    NonSecure = 1,
    #[cfg(feature = "rme")]
    Realm = 2,
}

impl World {
    fn index(self) -> usize {
        self as usize
    }
}

/// Implementation of the `Cores` trait to get the index of the current CPU core.
pub struct CoresImpl;

// SAFETY: This implementation never returns the same index for different cores because
// `core_position` is guaranteed not to.
unsafe impl Cores for CoresImpl {
    fn core_index() -> usize {
        PlatformImpl::core_position(read_mpidr_el1().bits())
    }
}

/// The state of a core at the next lower EL in a given security state.
#[derive(Clone, Debug, PartialEq)]
#[repr(C)]
pub struct CpuContext {
    pub gpregs: GpRegs,
    pub el3_state: El3State,
    #[cfg(feature = "sel2")]
    el2_sysregs: El2Sysregs,
    #[cfg(feature = "sel2")]
    el2_vhe_sysregs: El2VheSysregs,
    #[cfg(not(feature = "sel2"))]
    el1_sysregs: El1Sysregs,
    fp: SimdContext,
}

impl CpuContext {
    const EMPTY: Self = Self {
        gpregs: GpRegs::EMPTY,
        el3_state: El3State::EMPTY,
        #[cfg(feature = "sel2")]
        el2_sysregs: El2Sysregs::EMPTY,
        #[cfg(feature = "sel2")]
        el2_vhe_sysregs: El2VheSysregs::EMPTY,
        #[cfg(not(feature = "sel2"))]
        el1_sysregs: El1Sysregs::EMPTY,
        fp: SimdContext::EMPTY,
    };

    fn save_lower_el_sysregs(&mut self) {
        #[cfg(feature = "sel2")]
        {
            self.el2_sysregs.save();
            if is_feat_vhe_present() {
                self.el2_vhe_sysregs.save();
            }
        }
        #[cfg(not(feature = "sel2"))]
        self.el1_sysregs.save();
    }

    fn restore_lower_el_sysregs(&self) {
        #[cfg(feature = "sel2")]
        {
            self.el2_sysregs.restore();
            if is_feat_vhe_present() {
                self.el2_vhe_sysregs.restore();
            }
        }
        #[cfg(not(feature = "sel2"))]
        self.el1_sysregs.restore();
    }
}

/// General purpose registers x0-x30 and SP_EL0, as stored by the exception vectors.
#[derive(Clone, Debug, Eq, PartialEq)]
#[repr(C, align(16))]
pub struct GpRegs {
    pub registers: [u64; Self::COUNT],
}

impl GpRegs {
    /// The number of (64-bit) registers included in `GpRegs`.
    const COUNT: usize = 32;
    /// Index of the SP_EL0 slot.
    pub const SP_EL0: usize = 31;

    const EMPTY: Self = Self {
        registers: [0; Self::COUNT],
    };

    /// Writes the given return value to x0 onwards.
    pub fn write_return_value(&mut self, value: &SmcReturn) {
        self.registers[..value.values().len()].copy_from_slice(value.values());
    }
}

/// EL3 registers that are swapped on every entry to and exit from a lower EL.
#[derive(Clone, Debug, Eq, PartialEq)]
#[repr(C, align(16))]
pub struct El3State {
    pub scr_el3: ScrEl3,
    pub esr_el3: Esr,
    // runtime_sp and runtime_lr must stay adjacent, the assembly code accesses them with ldp/stp.
    runtime_sp: u64,
    runtime_lr: u64,
    // Same for spsr_el3 and elr_el3.
    pub spsr_el3: Spsr,
    pub elr_el3: usize,
    pub cptr_el3: CptrEl3,
}

impl El3State {
    const EMPTY: Self = Self {
        scr_el3: ScrEl3::empty(),
        esr_el3: Esr::empty(),
        runtime_sp: 0,
        runtime_lr: 0,
        spsr_el3: Spsr::empty(),
        elr_el3: 0,
        cptr_el3: CptrEl3::empty(),
    };
}

/// Declares a set of lower EL system registers which are saved and restored as a group.
///
/// Each register needs `arm_sysregs::read_<name>` and `arm_sysregs::write_<name>` accessors.
macro_rules! lower_el_sysregs {
    (
        $(#[$attributes:meta])*
        $name:ident {
            $($register:ident: $type:ty = $reset:expr),* $(,)?
        }
    ) => {
        $(#[$attributes])*
        #[derive(Clone, Debug, Eq, PartialEq)]
        struct $name {
            $($register: $type,)*
        }

        impl $name {
            const EMPTY: Self = Self {
                $($register: $reset,)*
            };

            /// Reads the current values from the system registers.
            fn save(&mut self) {
                paste::paste! {
                    $(self.$register = arm_sysregs::[<read_ $register>]();)*
                }
            }

            /// Writes the saved values to the system registers.
            fn restore(&self) {
                paste::paste! {
                    $(arm_sysregs::[<write_ $register>](self.$register);)*
                }
            }
        }
    };
}

#[cfg(not(feature = "sel2"))]
lower_el_sysregs! {
    /// EL1 registers of a world whose kernel runs at EL1.
    El1Sysregs {
        spsr_el1: Spsr = Spsr::empty(),
        elr_el1: usize = 0,
        sctlr_el1: SctlrEl1 = SctlrEl1::empty(),
        tcr_el1: u64 = 0,
        cpacr_el1: u64 = 0,
        csselr_el1: u64 = 0,
        sp_el1: u64 = 0,
        esr_el1: Esr = Esr::empty(),
        ttbr0_el1: u64 = 0,
        ttbr1_el1: u64 = 0,
        mair_el1: u64 = 0,
        amair_el1: u64 = 0,
        actlr_el1: u64 = 0,
        tpidr_el1: u64 = 0,
        tpidr_el0: u64 = 0,
        tpidrro_el0: u64 = 0,
        par_el1: u64 = 0,
        far_el1: u64 = 0,
        afsr0_el1: u64 = 0,
        afsr1_el1: u64 = 0,
        contextidr_el1: u64 = 0,
        vbar_el1: usize = 0,
        mdccint_el1: u64 = 0,
        mdscr_el1: u64 = 0,
    }
}

#[cfg(feature = "sel2")]
lower_el_sysregs! {
    /// EL2 registers of a world with a hypervisor.
    El2Sysregs {
        actlr_el2: u64 = 0,
        afsr0_el2: u64 = 0,
        afsr1_el2: u64 = 0,
        amair_el2: u64 = 0,
        cnthctl_el2: u64 = 0,
        cntvoff_el2: u64 = 0,
        cptr_el2: u64 = 0,
        elr_el2: usize = 0,
        esr_el2: Esr = Esr::empty(),
        far_el2: u64 = 0,
        hacr_el2: u64 = 0,
        hcr_el2: HcrEl2 = HcrEl2::empty(),
        hpfar_el2: u64 = 0,
        hstr_el2: u64 = 0,
        icc_sre_el2: IccSre = IccSre::empty(),
        ich_hcr_el2: u64 = 0,
        mair_el2: u64 = 0,
        mdcr_el2: u64 = 0,
        sctlr_el2: u64 = 0,
        spsr_el2: Spsr = Spsr::empty(),
        sp_el2: u64 = 0,
        tcr_el2: u64 = 0,
        tpidr_el2: u64 = 0,
        ttbr0_el2: u64 = 0,
        vbar_el2: usize = 0,
        vmpidr_el2: u64 = 0,
        vpidr_el2: u64 = 0,
        vtcr_el2: u64 = 0,
        vttbr_el2: u64 = 0,
    }
}

#[cfg(feature = "sel2")]
lower_el_sysregs! {
    /// EL2 registers which only exist with FEAT_VHE.
    El2VheSysregs {
        contextidr_el2: u64 = 0,
        ttbr1_el2: u64 = 0,
    }
}

/// An array with one `T` for each world.
#[derive(Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct PerWorld<T>([T; WORLD_COUNT]);

impl<T> Index<World> for PerWorld<T> {
    type Output = T;

    fn index(&self, world: World) -> &Self::Output {
        &self.0[world.index()]
    }
}

impl<T> IndexMut<World> for PerWorld<T> {
    fn index_mut(&mut self, world: World) -> &mut Self::Output {
        &mut self.0[world.index()]
    }
}

/// Everything the monitor keeps about the lower ELs of one CPU.
struct CpuState {
    contexts: PerWorld<CpuContext>,
    valid: PerWorld<bool>,
    /// The world whose system registers are currently live.
    active_world: Option<World>,
    /// The world whose FP/SIMD registers are currently live, if any.
    fp_owner: Option<World>,
    switch_count: usize,
}

impl CpuState {
    const EMPTY: Self = Self {
        contexts: PerWorld([CpuContext::EMPTY; WORLD_COUNT]),
        valid: PerWorld([false; WORLD_COUNT]),
        active_world: None,
        fp_owner: None,
        switch_count: 0,
    };

    /// Installs the EL3 configuration for `world` and loads its lower EL system registers.
    fn restore(&mut self, cpu: usize, world: World) {
        assert!(
            self.valid[world],
            "Restoring invalid {world:?} context on CPU {cpu}"
        );
        let owns_fp = self.fp_owner == Some(world);
        let context = &mut self.contexts[world];

        interrupts::set_routing_model(&mut context.el3_state.scr_el3, world);
        // SCR_EL3 selects which security state the EL2/EL1 register writes below apply to.
        write_scr_el3(context.el3_state.scr_el3);
        isb();

        context.restore_lower_el_sysregs();

        let mut cptr_el3 = read_cptr_el3();
        cptr_el3.set(CptrEl3::TFP, !owns_fp);
        context.el3_state.cptr_el3 = cptr_el3;
        write_cptr_el3(cptr_el3);

        self.active_world = Some(world);
    }
}

/// Owns the saved execution context of every world on every CPU.
pub struct ContextManager {
    cpus: [SpinMutex<CpuState>; PlatformImpl::CORE_COUNT],
}

impl ContextManager {
    /// Creates a context manager with every context invalid.
    pub const fn new() -> Self {
        Self {
            cpus: [const { SpinMutex::new(CpuState::EMPTY) }; PlatformImpl::CORE_COUNT],
        }
    }

    fn lock(&self, cpu: usize) -> SpinMutexGuard<'_, CpuState> {
        self.cpus
            .get(cpu)
            .unwrap_or_else(|| panic!("Invalid CPU index {cpu}"))
            .lock()
    }

    /// Builds a fresh context for `world` on `cpu`, ready to enter at the given entry point.
    pub fn init(&self, cpu: usize, world: World, entry_point: &EntryPointInfo) {
        let mut state = self.lock(cpu);
        let context = &mut state.contexts[world];
        *context = CpuContext::EMPTY;
        initialise_common(context, entry_point);

        match world {
            World::NonSecure => context.el3_state.scr_el3 |= ScrEl3::NS,
            // Let Secure EL1 use the timer registers rather than only EL3.
            World::Secure => context.el3_state.scr_el3 |= ScrEl3::ST,
            // NS and NSE together select the Realm security state.
            #[cfg(feature = "rme")]
            World::Realm => context.el3_state.scr_el3 |= ScrEl3::NS | ScrEl3::NSE,
        }
        interrupts::set_routing_model(&mut context.el3_state.scr_el3, world);

        state.valid[world] = true;
        // The live FP registers no longer belong to the previous incarnation of this world.
        if state.fp_owner == Some(world) {
            state.fp_owner = None;
        }
        trace!(
            "Initialised {world:?} context on CPU {cpu} with entry point {:#x}",
            entry_point.pc
        );
    }

    /// Saves the live lower EL system registers into the context of `world` on `cpu`.
    pub fn save(&self, cpu: usize, world: World) {
        let mut state = self.lock(cpu);
        state.contexts[world].save_lower_el_sysregs();
        state.valid[world] = true;
    }

    /// Loads the context of `world` on `cpu` into the system registers.
    ///
    /// Panics if the context was never initialised or has been invalidated.
    pub fn restore(&self, cpu: usize, world: World) {
        self.lock(cpu).restore(cpu, world);
    }

    /// Saves the lower EL system registers of `from` and restores those of `to`.
    pub fn switch_world(&self, cpu: usize, from: World, to: World) {
        assert_ne!(
            from, to,
            "Switching CPU {cpu} to the world it is already in"
        );
        let mut state = self.lock(cpu);
        state.contexts[from].save_lower_el_sysregs();
        state.valid[from] = true;
        state.restore(cpu, to);
        state.switch_count += 1;
        trace!("CPU {cpu} switched from {from:?} to {to:?}");
    }

    /// Restores the lower EL system registers of `world`, without saving the current ones.
    ///
    /// Only for the first entry to a lower EL after the CPU powered on.
    pub fn set_initial_world(&self, cpu: usize, world: World) {
        self.lock(cpu).restore(cpu, world);
    }

    /// Marks every context on `cpu` invalid, when the CPU is powered off.
    pub fn invalidate(&self, cpu: usize) {
        let mut state = self.lock(cpu);
        state.valid = PerWorld([false; WORLD_COUNT]);
        state.active_world = None;
        state.fp_owner = None;
    }

    /// Saves everything on `cpu` which will be lost when it powers down for a suspend: the
    /// system registers of the active world and the live FP registers.
    pub fn save_for_power_down(&self, cpu: usize) {
        let mut state = self.lock(cpu);
        if let Some(world) = state.active_world {
            state.contexts[world].save_lower_el_sysregs();
        }
        if let Some(owner) = state.fp_owner.take() {
            allow_el3_fp_access();
            state.contexts[owner].fp.save();
        }
    }

    /// Points the non-secure context of `cpu` at the entry point given to `CPU_SUSPEND`, after a
    /// wake up from a power down state. The saved system registers are kept.
    pub fn prepare_resume(&self, cpu: usize, entry_point: EntryPoint) {
        let mut state = self.lock(cpu);
        assert!(
            state.valid[World::NonSecure],
            "Resuming invalid non-secure context on CPU {cpu}"
        );
        let context = &mut state.contexts[World::NonSecure];
        context.el3_state.elr_el3 = entry_point.entry_point_address() as usize;
        context.gpregs.registers[0] = entry_point.context_id();
        context.gpregs.registers[1..8].fill(0);
    }

    /// Switches the live FP/SIMD registers over to `world` after it trapped on an FP access.
    pub fn handle_fp_trap(&self, cpu: usize, world: World) {
        let mut state = self.lock(cpu);
        if state.fp_owner != Some(world) {
            allow_el3_fp_access();
            if let Some(owner) = state.fp_owner {
                state.contexts[owner].fp.save();
            }
            state.contexts[world].fp.restore();
            state.fp_owner = Some(world);
            trace!("CPU {cpu} FP registers now owned by {world:?}");
        }

        let el3_state = &mut state.contexts[world].el3_state;
        el3_state.cptr_el3 -= CptrEl3::TFP;
        write_cptr_el3(el3_state.cptr_el3);
        isb();
    }

    /// Writes the given return value into x0 onwards of the saved context.
    pub fn write_return_value(&self, cpu: usize, world: World, value: &SmcReturn) {
        self.lock(cpu).contexts[world]
            .gpregs
            .write_return_value(value);
    }

    /// Returns x0-x7 of the saved context.
    pub fn call_registers(&self, cpu: usize, world: World) -> [u64; 8] {
        let mut registers = [0; 8];
        registers.copy_from_slice(&self.lock(cpu).contexts[world].gpregs.registers[..8]);
        registers
    }

    /// Returns a copy of the saved context.
    #[cfg_attr(not(test), allow(unused))]
    pub fn snapshot(&self, cpu: usize, world: World) -> CpuContext {
        self.lock(cpu).contexts[world].clone()
    }

    /// Returns whether the context of `world` on `cpu` may be restored.
    #[cfg_attr(not(test), allow(unused))]
    pub fn is_valid(&self, cpu: usize, world: World) -> bool {
        self.lock(cpu).valid[world]
    }

    /// Returns the world whose system registers are live on `cpu`.
    pub fn active_world(&self, cpu: usize) -> Option<World> {
        self.lock(cpu).active_world
    }

    /// Returns how many times `cpu` has switched between worlds.
    #[cfg_attr(not(test), allow(unused))]
    pub fn switch_count(&self, cpu: usize) -> usize {
        self.lock(cpu).switch_count
    }

    /// Returns a raw pointer to the saved context, for the exception entry and exit code.
    ///
    /// No lock is held while the pointer is in use. This is sound as long as only the owning CPU
    /// uses it and only while it is running outside the monitor's Rust code.
    pub fn context_ptr(&self, cpu: usize, world: World) -> *mut CpuContext {
        let state = self
            .cpus
            .get(cpu)
            .unwrap_or_else(|| panic!("Invalid CPU index {cpu}"))
            .as_mut_ptr();
        // SAFETY: `state` comes from a live `SpinMutex`, so it is valid. We go through the array
        // directly rather than `IndexMut` to avoid creating an intermediate reference.
        unsafe { &raw mut (*state).contexts.0[world.index()] }
    }
}

/// Clears CPTR_EL3.TFP so that EL3 itself can move the FP/SIMD registers.
fn allow_el3_fp_access() {
    write_cptr_el3(read_cptr_el3() - CptrEl3::TFP);
    isb();
}

/// Initialises parts of the given CPU context that are the same for all worlds.
fn initialise_common(context: &mut CpuContext, entry_point: &EntryPointInfo) {
    context.el3_state.elr_el3 = entry_point.pc;
    context.el3_state.spsr_el3 = entry_point.spsr;
    context.gpregs.registers[..entry_point.args.len()].copy_from_slice(&entry_point.args);

    // All SCR_EL3 fields are UNKNOWN on reset, so build the whole value.
    //
    // TWE and TWI are zero: WFE and WFI from lower ELs don't trap.
    // SIF: no instruction fetches from Non-secure memory in Secure state.
    // SMD is zero: SMC is enabled at EL1 and above.
    // EA: External Aborts and SErrors are taken to EL3.
    // EEL2: Secure EL2 is enabled, if built with it.
    context.el3_state.scr_el3 = ScrEl3::RES1 | ScrEl3::HCE | ScrEl3::EA | ScrEl3::SIF | ScrEl3::RW;
    #[cfg(feature = "sel2")]
    {
        context.el3_state.scr_el3 |= ScrEl3::EEL2;
        context.el2_sysregs.icc_sre_el2 = IccSre::DIB | IccSre::DFB | IccSre::EN | IccSre::SRE;
    }
    #[cfg(not(feature = "sel2"))]
    {
        context.el1_sysregs.sctlr_el1 = SctlrEl1::RES1;
    }
    context.el3_state.cptr_el3 = CptrEl3::TFP;
}

/// Information about the entry point for a lower EL image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EntryPointInfo {
    /// The entry point address.
    pub pc: usize,
    /// The `spsr_el3` value to set before `eret`, to set the appropriate PSTATE.
    pub spsr: Spsr,
    /// Boot arguments to pass in `x0`-`x7`.
    pub args: [u64; 8],
}

#[cfg(all(target_arch = "aarch64", not(test)))]
mod asm {
    use super::*;
    use crate::exceptions::RunResult;
    use core::{arch::global_asm, mem::offset_of};

    const CTX_EL3_STATE: usize = offset_of!(CpuContext, el3_state);

    // Exception vectors for lower EL entry, and the exit path which they return through.
    //
    // `el3_exit` is called from Rust with x0 pointing to the `CpuContext` to enter. It stashes the
    // monitor's stack pointer and return address in the context and makes SP_EL3 point at the
    // context before the `eret`. A lower EL exception then stores the general purpose registers
    // through SP_EL3, recovers the monitor's stack and returns to the caller of `el3_exit` with
    // the exit reason in x18 and ESR_EL3 in x20.
    global_asm!(
        ".pushsection .text.el3_exit, \"ax\"",
        ".global el3_exit",
        "el3_exit:",
        "mov x17, sp",
        "stp x17, x30, [x0, #{CTX_RUNTIME_SP}]",
        "ldr x17, [x0, #{CTX_SCR_EL3}]",
        "msr scr_el3, x17",
        "ldp x17, x18, [x0, #{CTX_SPSR_EL3}]",
        "msr spsr_el3, x17",
        "msr elr_el3, x18",
        "ldr x17, [x0, #{CTX_SP_EL0}]",
        "msr sp_el0, x17",
        "isb",
        "mov sp, x0",
        "ldp x2, x3, [sp, #(2 * 8)]",
        "ldp x4, x5, [sp, #(4 * 8)]",
        "ldp x6, x7, [sp, #(6 * 8)]",
        "ldp x8, x9, [sp, #(8 * 8)]",
        "ldp x10, x11, [sp, #(10 * 8)]",
        "ldp x12, x13, [sp, #(12 * 8)]",
        "ldp x14, x15, [sp, #(14 * 8)]",
        "ldp x16, x17, [sp, #(16 * 8)]",
        "ldp x18, x19, [sp, #(18 * 8)]",
        "ldp x20, x21, [sp, #(20 * 8)]",
        "ldp x22, x23, [sp, #(22 * 8)]",
        "ldp x24, x25, [sp, #(24 * 8)]",
        "ldp x26, x27, [sp, #(26 * 8)]",
        "ldp x28, x29, [sp, #(28 * 8)]",
        "ldr x30, [sp, #(30 * 8)]",
        "ldp x0, x1, [sp, #(0 * 8)]",
        "eret",

        // Common tail of the lower EL vectors. x0 and x1 have already been saved, and x0 holds
        // the exit reason.
        "lower_el_exit:",
        "stp x2, x3, [sp, #(2 * 8)]",
        "stp x4, x5, [sp, #(4 * 8)]",
        "stp x6, x7, [sp, #(6 * 8)]",
        "stp x8, x9, [sp, #(8 * 8)]",
        "stp x10, x11, [sp, #(10 * 8)]",
        "stp x12, x13, [sp, #(12 * 8)]",
        "stp x14, x15, [sp, #(14 * 8)]",
        "stp x16, x17, [sp, #(16 * 8)]",
        "stp x18, x19, [sp, #(18 * 8)]",
        "stp x20, x21, [sp, #(20 * 8)]",
        "stp x22, x23, [sp, #(22 * 8)]",
        "stp x24, x25, [sp, #(24 * 8)]",
        "stp x26, x27, [sp, #(26 * 8)]",
        "stp x28, x29, [sp, #(28 * 8)]",
        "mrs x1, sp_el0",
        "stp x30, x1, [sp, #(30 * 8)]",
        "mrs x1, spsr_el3",
        "mrs x2, elr_el3",
        "stp x1, x2, [sp, #{CTX_SPSR_EL3}]",
        "mrs x20, esr_el3",
        "str x20, [sp, #{CTX_ESR_EL3}]",
        "mov x18, x0",
        "mov x21, sp",
        "ldp x22, x30, [x21, #{CTX_RUNTIME_SP}]",
        "mov sp, x22",
        "ret",

        // Exceptions taken from EL3 itself are fatal.
        "el3_unexpected_exception:",
        "wfi",
        "b el3_unexpected_exception",
        ".popsection",

        ".pushsection .text.el3_vectors, \"ax\"",
        ".balign 2048",
        ".global el3_vector_table",
        "el3_vector_table:",
        // Current EL with SP_EL0.
        "b el3_unexpected_exception",
        ".balign 0x80",
        "b el3_unexpected_exception",
        ".balign 0x80",
        "b el3_unexpected_exception",
        ".balign 0x80",
        "b el3_unexpected_exception",
        // Current EL with SP_ELx.
        ".balign 0x80",
        "b el3_unexpected_exception",
        ".balign 0x80",
        "b el3_unexpected_exception",
        ".balign 0x80",
        "b el3_unexpected_exception",
        ".balign 0x80",
        "b el3_unexpected_exception",
        // Lower EL using AArch64.
        ".balign 0x80",
        "stp x0, x1, [sp, #(0 * 8)]",
        "mov x0, #{SYNC_EXCEPTION}",
        "b lower_el_exit",
        ".balign 0x80",
        "stp x0, x1, [sp, #(0 * 8)]",
        "mov x0, #{INTERRUPT}",
        "b lower_el_exit",
        ".balign 0x80",
        "stp x0, x1, [sp, #(0 * 8)]",
        "mov x0, #{INTERRUPT}",
        "b lower_el_exit",
        ".balign 0x80",
        "stp x0, x1, [sp, #(0 * 8)]",
        "mov x0, #{SERROR}",
        "b lower_el_exit",
        // Lower EL using AArch32, which is not supported.
        ".balign 0x80",
        "b el3_unexpected_exception",
        ".balign 0x80",
        "b el3_unexpected_exception",
        ".balign 0x80",
        "b el3_unexpected_exception",
        ".balign 0x80",
        "b el3_unexpected_exception",
        ".balign 0x80",
        ".popsection",
        CTX_RUNTIME_SP = const CTX_EL3_STATE + offset_of!(El3State, runtime_sp),
        CTX_SCR_EL3 = const CTX_EL3_STATE + offset_of!(El3State, scr_el3),
        CTX_ESR_EL3 = const CTX_EL3_STATE + offset_of!(El3State, esr_el3),
        CTX_SPSR_EL3 = const CTX_EL3_STATE + offset_of!(El3State, spsr_el3),
        CTX_SP_EL0 = const GpRegs::SP_EL0 * 8,
        SYNC_EXCEPTION = const RunResult::SYNC_EXCEPTION,
        INTERRUPT = const RunResult::INTERRUPT,
        SERROR = const RunResult::SERROR,
    );

    const _: () = assert!(offset_of!(CpuContext, gpregs) == 0);
    const _: () = assert!(
        offset_of!(El3State, runtime_lr) == offset_of!(El3State, runtime_sp) + 8
            && offset_of!(El3State, elr_el3) == offset_of!(El3State, spsr_el3) + 8
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysregs::lock_fake_sysregs;
    use arm_sysregs::fake::SYSREGS;

    const CPU: usize = 1;

    fn entry_point(pc: usize) -> EntryPointInfo {
        EntryPointInfo {
            pc,
            spsr: Spsr::D | Spsr::A | Spsr::I | Spsr::F | Spsr::M_AARCH64_EL2H,
            args: [1, 2, 3, 4, 5, 6, 7, 8],
        }
    }

    #[cfg(feature = "sel2")]
    fn set_live_marker(value: u64) {
        SYSREGS.lock().unwrap().tpidr_el2 = value;
    }

    #[cfg(feature = "sel2")]
    fn live_marker() -> u64 {
        SYSREGS.lock().unwrap().tpidr_el2
    }

    #[cfg(not(feature = "sel2"))]
    fn set_live_marker(value: u64) {
        SYSREGS.lock().unwrap().tpidr_el1 = value;
    }

    #[cfg(not(feature = "sel2"))]
    fn live_marker() -> u64 {
        SYSREGS.lock().unwrap().tpidr_el1
    }

    #[test]
    fn init_builds_world_specific_scr() {
        let contexts = ContextManager::new();
        contexts.init(CPU, World::NonSecure, &entry_point(0x6000_0000));
        contexts.init(CPU, World::Secure, &entry_point(0x0e10_0000));

        let ns = contexts.snapshot(CPU, World::NonSecure);
        assert_eq!(ns.el3_state.elr_el3, 0x6000_0000);
        assert_eq!(ns.gpregs.registers[..8], [1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(ns.gpregs.registers[8..].iter().all(|&value| value == 0));
        assert!(ns.el3_state.scr_el3.contains(ScrEl3::NS | ScrEl3::FIQ | ScrEl3::RW));
        assert!(!ns.el3_state.scr_el3.contains(ScrEl3::IRQ));

        let secure = contexts.snapshot(CPU, World::Secure);
        assert_eq!(secure.el3_state.elr_el3, 0x0e10_0000);
        assert!(secure.el3_state.scr_el3.contains(ScrEl3::ST));
        assert!(!secure.el3_state.scr_el3.intersects(ScrEl3::NS | ScrEl3::FIQ));

        assert!(contexts.is_valid(CPU, World::Secure));
        assert!(!contexts.is_valid(CPU + 1, World::Secure));
    }

    #[test]
    fn save_restore_round_trip() {
        let _lock = lock_fake_sysregs();
        SYSREGS.lock().unwrap().reset();
        let contexts = ContextManager::new();
        contexts.init(CPU, World::NonSecure, &entry_point(0x6000_0000));
        contexts.init(CPU, World::Secure, &entry_point(0x0e10_0000));
        contexts.set_initial_world(CPU, World::NonSecure);

        set_live_marker(0x1234);
        contexts.save(CPU, World::NonSecure);
        let saved = contexts.snapshot(CPU, World::NonSecure);

        set_live_marker(0xdead);
        contexts.restore(CPU, World::NonSecure);
        assert_eq!(live_marker(), 0x1234);

        // Saving again without any lower EL activity changes nothing.
        contexts.save(CPU, World::NonSecure);
        assert_eq!(contexts.snapshot(CPU, World::NonSecure), saved);
    }

    #[test]
    fn switch_world_swaps_system_registers() {
        let _lock = lock_fake_sysregs();
        SYSREGS.lock().unwrap().reset();
        let contexts = ContextManager::new();
        contexts.init(CPU, World::NonSecure, &entry_point(0x6000_0000));
        contexts.init(CPU, World::Secure, &entry_point(0x0e10_0000));
        contexts.set_initial_world(CPU, World::Secure);
        assert_eq!(contexts.active_world(CPU), Some(World::Secure));

        set_live_marker(0x5ec);
        contexts.switch_world(CPU, World::Secure, World::NonSecure);
        assert_eq!(live_marker(), 0);
        assert_eq!(contexts.active_world(CPU), Some(World::NonSecure));
        assert_eq!(
            SYSREGS.lock().unwrap().scr_el3,
            contexts.snapshot(CPU, World::NonSecure).el3_state.scr_el3
        );

        set_live_marker(0x115);
        contexts.switch_world(CPU, World::NonSecure, World::Secure);
        assert_eq!(live_marker(), 0x5ec);
        assert_eq!(contexts.switch_count(CPU), 2);
    }

    #[test]
    #[should_panic(expected = "already in")]
    fn switch_to_same_world() {
        let contexts = ContextManager::new();
        contexts.switch_world(CPU, World::NonSecure, World::NonSecure);
    }

    #[test]
    #[should_panic(expected = "Restoring invalid")]
    fn restore_invalid_context() {
        let _lock = lock_fake_sysregs();
        let contexts = ContextManager::new();
        contexts.init(CPU, World::NonSecure, &entry_point(0x6000_0000));
        contexts.invalidate(CPU);
        contexts.restore(CPU, World::NonSecure);
    }

    #[test]
    #[should_panic(expected = "Invalid CPU index")]
    fn out_of_range_cpu() {
        let contexts = ContextManager::new();
        contexts.call_registers(PlatformImpl::CORE_COUNT, World::NonSecure);
    }

    #[test]
    fn prepare_resume_keeps_system_registers() {
        let _lock = lock_fake_sysregs();
        SYSREGS.lock().unwrap().reset();
        let contexts = ContextManager::new();
        contexts.init(CPU, World::NonSecure, &entry_point(0x6000_0000));
        contexts.set_initial_world(CPU, World::NonSecure);
        set_live_marker(0x77);
        contexts.save_for_power_down(CPU);

        contexts.prepare_resume(
            CPU,
            EntryPoint::Entry64 {
                entry_point_address: 0x8000_0000,
                context_id: 0x42,
            },
        );

        let context = contexts.snapshot(CPU, World::NonSecure);
        assert_eq!(context.el3_state.elr_el3, 0x8000_0000);
        assert_eq!(context.gpregs.registers[..8], [0x42, 0, 0, 0, 0, 0, 0, 0]);

        set_live_marker(0);
        contexts.set_initial_world(CPU, World::NonSecure);
        assert_eq!(live_marker(), 0x77);
    }

    #[test]
    fn return_value_and_call_registers() {
        let contexts = ContextManager::new();
        contexts.init(CPU, World::NonSecure, &entry_point(0x6000_0000));
        contexts.write_return_value(CPU, World::NonSecure, &SmcReturn::from([9, 10]));
        assert_eq!(
            contexts.call_registers(CPU, World::NonSecure),
            [9, 10, 3, 4, 5, 6, 7, 8]
        );
        contexts.write_return_value(CPU, World::NonSecure, &SmcReturn::EMPTY);
        assert_eq!(
            contexts.call_registers(CPU, World::NonSecure),
            [9, 10, 3, 4, 5, 6, 7, 8]
        );
    }

    #[test]
    fn lazy_fp_switch() {
        let _lock = lock_fake_sysregs();
        SYSREGS.lock().unwrap().reset();
        let contexts = ContextManager::new();
        contexts.init(CPU, World::NonSecure, &entry_point(0x6000_0000));
        contexts.init(CPU, World::Secure, &entry_point(0x0e10_0000));
        contexts.set_initial_world(CPU, World::NonSecure);
        assert!(
            contexts
                .snapshot(CPU, World::NonSecure)
                .el3_state
                .cptr_el3
                .contains(CptrEl3::TFP)
        );

        contexts.handle_fp_trap(CPU, World::NonSecure);
        assert!(!SYSREGS.lock().unwrap().cptr_el3.contains(CptrEl3::TFP));
        simd::fake::set_live_vector(3, 0xabcd);

        contexts.switch_world(CPU, World::NonSecure, World::Secure);
        // The secure world traps on its first FP access, and takes the registers over.
        assert!(SYSREGS.lock().unwrap().cptr_el3.contains(CptrEl3::TFP));
        contexts.handle_fp_trap(CPU, World::Secure);
        assert_eq!(simd::fake::live_vector(3), 0);
        assert_eq!(
            contexts.snapshot(CPU, World::NonSecure).fp.vector(3),
            0xabcd
        );

        // Back in the non-secure world, its values come back on the next trap.
        contexts.switch_world(CPU, World::Secure, World::NonSecure);
        contexts.handle_fp_trap(CPU, World::NonSecure);
        assert_eq!(simd::fake::live_vector(3), 0xabcd);
    }
}
