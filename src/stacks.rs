// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

use crate::platform::{Platform, PlatformImpl};

/// The number of bytes of stack space to reserve for each core.
const STACK_SIZE: usize = 0x2000;

const _: () = assert!(
    STACK_SIZE.is_multiple_of(16),
    "Stack size not correctly aligned"
);

/// The stacks of all cores, indexed by core position.
#[repr(C, align(16))]
struct Stacks([[u8; STACK_SIZE]; PlatformImpl::CORE_COUNT]);

#[cfg_attr(test, allow(unused))]
#[unsafe(link_section = ".stacks")]
static mut STACKS: Stacks = Stacks([[0; STACK_SIZE]; PlatformImpl::CORE_COUNT]);

#[cfg(all(target_arch = "aarch64", not(test)))]
mod asm {
    use super::*;
    use crate::naked_asm;

    /// Points the stack pointer at the top of the current core's stack.
    ///
    /// # Safety
    ///
    /// Must only be called from assembly code, before anything lives on the stack. Clobbers x0-x2
    /// and x9.
    #[unsafe(naked)]
    pub unsafe extern "C" fn set_my_stack() {
        naked_asm!(
            "mov	x9, x30",
            "mrs	x0, mpidr_el1",
            "bl	{core_position}",
            // The stack grows down from the end of the core's slot.
            "add	x0, x0, #1",
            "adrp	x1, {stacks}",
            "add	x1, x1, :lo12:{stacks}",
            "mov	x2, #{STACK_SIZE}",
            "madd	x0, x0, x2, x1",
            "mov	sp, x0",
            "ret	x9",
            core_position = sym <PlatformImpl as Platform>::core_position,
            stacks = sym STACKS,
            STACK_SIZE = const STACK_SIZE,
        );
    }
}

#[cfg(all(target_arch = "aarch64", not(test)))]
pub use asm::set_my_stack;
