// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

use arm_sysregs::read_id_aa64mmfr1_el1;

/// Returns whether FEAT_VHE is implemented, in which case the extra EL2 registers it adds must be
/// part of the saved context.
#[cfg_attr(not(feature = "sel2"), allow(unused))]
pub fn is_feat_vhe_present() -> bool {
    const VHE: u64 = 1 << 8;

    read_id_aa64mmfr1_el1() & VHE != 0
}

/// Serialises unit tests which read back values from the fake system registers.
///
/// The fake registers are a single global, so tests which check what was written to them must not
/// run concurrently with each other.
#[cfg(test)]
pub static FAKE_SYSREGS_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Takes the fake system register lock, ignoring poisoning from an earlier failed test.
#[cfg(test)]
pub fn lock_fake_sysregs() -> std::sync::MutexGuard<'static, ()> {
    FAKE_SYSREGS_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
