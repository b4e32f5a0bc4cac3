// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The Arm semihosting exit call, used to stop the emulator.
//! See https://github.com/ARM-software/abi-aa/blob/main/semihosting/semihosting.rst.

use core::arch::asm;

/// `SYS_EXIT` operation code of the semihosting ABI.
const SYS_EXIT: u32 = 0x18;

/// Reason codes for a `SYS_EXIT` call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum AdpStopped {
    ApplicationExit = 0x20026,
}

impl From<AdpStopped> for u64 {
    fn from(value: AdpStopped) -> Self {
        (value as u32).into()
    }
}

/// Reports to the debugger that execution has stopped for the given reason.
///
/// Returns only if no debugger is attached to handle the call.
pub fn semihosting_exit(reason: AdpStopped, subcode: u64) {
    let parameters: [u64; 2] = [reason.into(), subcode];
    // SAFETY: `parameters` is valid for reads and holds the two values `SYS_EXIT` expects. The
    // call doesn't write to memory.
    unsafe {
        asm!(
            "hlt #0xf000",
            in("w0") SYS_EXIT,
            inout("x1") parameters.as_ptr() => _,
            lateout("x0") _,
            options(nostack)
        );
    }
}
