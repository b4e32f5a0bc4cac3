// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Wrappers for barrier and hint instructions.

#[cfg(all(target_arch = "aarch64", not(test)))]
use core::arch::asm;

/// Issues a full system data synchronization barrier (`dsb sy`).
pub fn dsb_sy() {
    // SAFETY: `dsb` does not violate safe Rust guarantees.
    #[cfg(all(target_arch = "aarch64", not(test)))]
    unsafe {
        asm!("dsb sy", options(nostack));
    }
}

/// Issues an instruction synchronization barrier (`isb`) instruction.
pub fn isb() {
    // SAFETY: `isb` does not violate safe Rust guarantees.
    #[cfg(all(target_arch = "aarch64", not(test)))]
    unsafe {
        asm!("isb", options(nostack));
    }
}

/// Waits for an interrupt (`wfi`).
///
/// On the host this returns immediately.
pub fn wfi() {
    // SAFETY: `wfi` does not violate safe Rust guarantees.
    #[cfg(all(target_arch = "aarch64", not(test)))]
    unsafe {
        asm!("wfi", options(nomem, nostack, preserves_flags));
    }
}

/// Sends an event to all cores (`sev`).
#[cfg_attr(test, allow(unused))]
pub fn sev() {
    // SAFETY: `sev` does not violate safe Rust guarantees.
    #[cfg(all(target_arch = "aarch64", not(test)))]
    unsafe {
        asm!("sev", options(nomem, nostack, preserves_flags));
    }
}
