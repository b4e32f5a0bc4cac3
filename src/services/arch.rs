// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

use crate::{
    services::{CallContext, Outcome, Service, call_ranges},
    smccc::{NOT_SUPPORTED, OwningEntityNumber, SUCCESS},
};
use log::debug;

pub const SMCCC_VERSION: u32 = 0x8000_0000;
const SMCCC_ARCH_FEATURES: u32 = 0x8000_0001;

pub const SMCCC_VERSION_1_5: i32 = 0x0001_0005;

/// Arm architecture SMCs.
pub struct Arch;

impl Service for Arch {
    call_ranges!(OwningEntityNumber::ARM_ARCHITECTURE, 0x0000..=0xFFFF);

    fn handle(&self, _cpu: usize, call: &CallContext) -> Outcome {
        let result = match call.function.0 {
            SMCCC_VERSION => version(),
            SMCCC_ARCH_FEATURES => arch_features(call.regs[1] as u32),
            _ => {
                debug!("Unknown architecture call {:?}", call.function);
                NOT_SUPPORTED
            }
        };
        Outcome::Return(result.into())
    }
}

impl Arch {
    pub fn new() -> Self {
        Self
    }
}

fn version() -> i32 {
    SMCCC_VERSION_1_5
}

fn arch_features(arch_func_id: u32) -> i32 {
    match arch_func_id {
        SMCCC_VERSION | SMCCC_ARCH_FEATURES => SUCCESS,
        _ => NOT_SUPPORTED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{context::World, smccc::FunctionId};

    fn call(function: u32, arg: u64) -> Outcome {
        let call = CallContext {
            function: FunctionId(function),
            regs: [function.into(), arg, 0, 0, 0, 0, 0, 0],
            world: World::NonSecure,
        };
        Arch::new().handle(0, &call)
    }

    #[test]
    fn smccc_version() {
        assert_eq!(
            call(SMCCC_VERSION, 0),
            Outcome::Return(0x0001_0005_u64.into())
        );
    }

    #[test]
    fn arch_features_of_known_calls() {
        assert_eq!(
            call(SMCCC_ARCH_FEATURES, SMCCC_VERSION.into()),
            Outcome::Return(0_u64.into())
        );
        assert_eq!(
            call(SMCCC_ARCH_FEATURES, 0x8000_8000),
            Outcome::Return(u64::MAX.into())
        );
    }

    #[test]
    fn unknown_call() {
        assert_eq!(call(0xC000_0002, 0), Outcome::Return(NOT_SUPPORTED.into()));
    }
}
