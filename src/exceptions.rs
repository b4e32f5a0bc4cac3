// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

use crate::context::{ContextManager, World};
use arm_sysregs::Esr;
#[cfg(not(test))]
use core::arch::asm;
use log::trace;

/// Exception class of an SMC instruction executed in AArch64 state.
const EC_SMC64: u64 = 0x17;
/// Exception class of an FP/SIMD access trapped by CPTR_EL3.TFP.
const EC_FP_ACCESS: u64 = 0x07;

/// Describes the reason why execution returned to EL3 after running a lower EL.
#[derive(Debug, Eq, PartialEq)]
pub enum RunResult {
    /// A lower EL has executed an SMC instruction.
    Smc,
    /// An IRQ or FIQ routed to EL3 has been triggered while running in a lower EL.
    Interrupt,
    /// A lower EL accessed the FP/SIMD registers while they belonged to another world.
    FpTrap,
}

impl RunResult {
    pub const SYNC_EXCEPTION: u64 = 0;
    pub const INTERRUPT: u64 = 1;
    pub const SERROR: u64 = 2;

    /// Works out the result from the vector which was taken and the syndrome it saw.
    fn classify(reason: u64, esr: Esr) -> Self {
        match reason {
            Self::SYNC_EXCEPTION => match (esr.bits() >> 26) & 0x3f {
                EC_SMC64 => Self::Smc,
                EC_FP_ACCESS => Self::FpTrap,
                ec => panic!("Unexpected synchronous exception from lower EL, EC {ec:#x}"),
            },
            Self::INTERRUPT => Self::Interrupt,
            Self::SERROR => panic!("SError from lower EL, ESR {:#x}", esr.bits()),
            r => panic!("unhandled enter world result: {r}"),
        }
    }
}

/// Enters a lower EL in the specified world, using the saved context of `world` on `cpu`.
///
/// The caller must ensure that the lower EL's system registers have already been restored. When the
/// lower EL traps back to EL3, its general purpose registers and return state have been written
/// back to the same context, and the reason for returning is returned.
pub fn enter_world(contexts: &ContextManager, cpu: usize, world: World) -> RunResult {
    trace!(
        "Entering world {world:?} with args {:x?}",
        contexts.call_registers(cpu, world)
    );

    let context = contexts.context_ptr(cpu, world);
    let return_reason: u64;
    let esr: u64;

    // SAFETY: The context pointer is valid for as long as `contexts`, and is only used by the
    // assembly code to prepare for the eret and to save state after the next exception, before any
    // Rust code on this CPU touches the context again.
    #[cfg(not(test))]
    unsafe {
        asm!(
            // Save x19 and x29 manually as Rust won't let us specify them as clobbers.
            "stp x19, x29, [sp, #-16]!",
            "bl el3_exit",
            "ldp x19, x29, [sp], #16",
            inout("x0") context => _,
            out("x1") _,
            out("x2") _,
            out("x3") _,
            out("x4") _,
            out("x5") _,
            out("x6") _,
            out("x7") _,
            out("x8") _,
            out("x9") _,
            out("x10") _,
            out("x11") _,
            out("x12") _,
            out("x13") _,
            out("x14") _,
            out("x15") _,
            out("x16") _,
            out("x17") _,
            out("x18") return_reason,
            out("x20") esr,
            out("x21") _,
            out("x22") _,
            out("x23") _,
            out("x24") _,
            out("x25") _,
            out("x26") _,
            out("x27") _,
            out("x28") _,
            out("x30") _,
        );
    }
    #[cfg(test)]
    {
        let _ = context;
        return_reason = RunResult::SYNC_EXCEPTION;
        esr = EC_SMC64 << 26;
    }

    let result = RunResult::classify(return_reason, Esr::from_bits_retain(esr));
    trace!("Returned from world {world:?} with result {result:?}");
    result
}

/// Points VBAR_EL3 at the monitor's exception vector table.
#[cfg(all(target_arch = "aarch64", not(test)))]
pub fn install_vector_table() {
    // SAFETY: `el3_vector_table` is defined by the context module's assembly, is 2 KiB aligned and
    // every entry either saves the lower EL state or spins.
    unsafe {
        asm!(
            "adrp {tmp}, el3_vector_table",
            "add {tmp}, {tmp}, :lo12:el3_vector_table",
            "msr vbar_el3, {tmp}",
            "isb",
            tmp = out(reg) _,
            options(nostack, preserves_flags)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_synchronous_exceptions() {
        assert_eq!(
            RunResult::classify(RunResult::SYNC_EXCEPTION, Esr::from_bits_retain(0x5e00_0000)),
            RunResult::Smc
        );
        assert_eq!(
            RunResult::classify(RunResult::SYNC_EXCEPTION, Esr::from_bits_retain(0x1e00_0000)),
            RunResult::FpTrap
        );
        assert_eq!(
            RunResult::classify(RunResult::INTERRUPT, Esr::empty()),
            RunResult::Interrupt
        );
    }

    #[test]
    #[should_panic(expected = "Unexpected synchronous exception")]
    fn data_abort_is_fatal() {
        RunResult::classify(RunResult::SYNC_EXCEPTION, Esr::from_bits_retain(0x9600_0000));
    }

    #[test]
    #[should_panic(expected = "SError")]
    fn serror_is_fatal() {
        RunResult::classify(RunResult::SERROR, Esr::empty());
    }
}
