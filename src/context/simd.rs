// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Saved FP/SIMD register state of one world.

/// The Q registers plus FPSR and FPCR.
#[derive(Clone, Debug, Eq, PartialEq)]
#[repr(C, align(16))]
pub struct SimdContext {
    vectors: [u128; 32],
    fpsr: u64,
    fpcr: u64,
}

impl SimdContext {
    pub const EMPTY: Self = Self {
        vectors: [0; 32],
        fpsr: 0,
        fpcr: 0,
    };

    /// Returns the saved value of Q register `index`.
    #[cfg(test)]
    pub fn vector(&self, index: usize) -> u128 {
        self.vectors[index]
    }

    /// Copies the live FP/SIMD registers into this context.
    ///
    /// FP access must not be trapped at EL3 when this is called.
    #[cfg(not(test))]
    pub fn save(&mut self) {
        let dest = self.vectors.as_mut_ptr();
        let fpsr_value;
        let fpcr_value;

        // SAFETY: `dest` is a 16 byte aligned pointer to 32 Q register slots, which the
        // post-indexed stores fill exactly.
        unsafe {
            core::arch::asm!(
                ".arch_extension fp",
                "stp q0, q1, [{dest}], #32",
                "stp q2, q3, [{dest}], #32",
                "stp q4, q5, [{dest}], #32",
                "stp q6, q7, [{dest}], #32",
                "stp q8, q9, [{dest}], #32",
                "stp q10, q11, [{dest}], #32",
                "stp q12, q13, [{dest}], #32",
                "stp q14, q15, [{dest}], #32",
                "stp q16, q17, [{dest}], #32",
                "stp q18, q19, [{dest}], #32",
                "stp q20, q21, [{dest}], #32",
                "stp q22, q23, [{dest}], #32",
                "stp q24, q25, [{dest}], #32",
                "stp q26, q27, [{dest}], #32",
                "stp q28, q29, [{dest}], #32",
                "stp q30, q31, [{dest}], #32",
                "mrs {fpsr_value}, fpsr",
                "mrs {fpcr_value}, fpcr",
                ".arch_extension nofp",
                dest = inout(reg) dest => _,
                fpsr_value = out(reg) fpsr_value,
                fpcr_value = out(reg) fpcr_value,
                options(nostack, preserves_flags)
            );
        }

        self.fpsr = fpsr_value;
        self.fpcr = fpcr_value;
    }

    /// Loads this context into the live FP/SIMD registers.
    ///
    /// FP access must not be trapped at EL3 when this is called.
    #[cfg(not(test))]
    pub fn restore(&self) {
        let src = self.vectors.as_ptr();

        // SAFETY: `src` is a 16 byte aligned pointer to 32 Q register slots, which the post-indexed
        // loads read exactly. Only FP state is modified, which the monitor itself doesn't use.
        unsafe {
            core::arch::asm!(
                ".arch_extension fp",
                "ldp q0, q1, [{src}], #32",
                "ldp q2, q3, [{src}], #32",
                "ldp q4, q5, [{src}], #32",
                "ldp q6, q7, [{src}], #32",
                "ldp q8, q9, [{src}], #32",
                "ldp q10, q11, [{src}], #32",
                "ldp q12, q13, [{src}], #32",
                "ldp q14, q15, [{src}], #32",
                "ldp q16, q17, [{src}], #32",
                "ldp q18, q19, [{src}], #32",
                "ldp q20, q21, [{src}], #32",
                "ldp q22, q23, [{src}], #32",
                "ldp q24, q25, [{src}], #32",
                "ldp q26, q27, [{src}], #32",
                "ldp q28, q29, [{src}], #32",
                "ldp q30, q31, [{src}], #32",
                "msr fpsr, {fpsr_value}",
                "msr fpcr, {fpcr_value}",
                ".arch_extension nofp",
                src = inout(reg) src => _,
                fpsr_value = in(reg) self.fpsr,
                fpcr_value = in(reg) self.fpcr,
                options(nostack, preserves_flags)
            );
        }
    }

    #[cfg(test)]
    pub fn save(&mut self) {
        fake::LIVE.with_borrow(|live| self.clone_from(live));
    }

    #[cfg(test)]
    pub fn restore(&self) {
        fake::LIVE.with_borrow_mut(|live| live.clone_from(self));
    }
}
