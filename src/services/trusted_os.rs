// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Dispatcher for the Trusted OS running in the secure world.
//!
//! Yielding calls from the normal world are passed to the secure world unchanged. The secure world
//! completes such a call by making a call with the same function ID, and its x1 to x3 become the
//! result for the normal world.

use crate::{
    context::World,
    services::{CallContext, CallRange, Outcome, Service},
    smccc::{FunctionId, NOT_SUPPORTED, OwningEntityNumber, SmcReturn, SmcccCallType},
};
use log::{debug, info, warn};

/// Made by the secure world once it has initialised on the calling CPU.
pub const ENTRY_DONE: FunctionId =
    FunctionId::new(SmcccCallType::Fast64, OwningEntityNumber::TRUSTED_OS, 0x0000);

const CALL_RANGES: [CallRange; 3] = [
    CallRange::new(
        SmcccCallType::Yielding,
        OwningEntityNumber::TRUSTED_OS,
        0x0000..=0xFFFF,
    ),
    CallRange::new(
        SmcccCallType::Fast32,
        OwningEntityNumber::TRUSTED_OS,
        0x0000..=0xFFFF,
    ),
    CallRange::new(
        SmcccCallType::Fast64,
        OwningEntityNumber::TRUSTED_OS,
        0x0000..=0xFFFF,
    ),
];

/// The Trusted OS dispatcher.
pub struct TrustedOs;

impl TrustedOs {
    pub fn new() -> Self {
        Self
    }
}

impl Service for TrustedOs {
    fn call_ranges(&self) -> &'static [CallRange] {
        &CALL_RANGES
    }

    fn setup(&self) {
        info!("Trusted OS dispatcher ready");
    }

    fn handle(&self, cpu: usize, call: &CallContext) -> Outcome {
        match (call.world, call.function.is_fast()) {
            (World::NonSecure, false) => {
                debug!(
                    "Passing {:?} to the secure world on CPU {cpu}",
                    call.function
                );
                Outcome::Yield {
                    regs: SmcReturn::from(call.regs),
                    world: World::Secure,
                }
            }
            (World::Secure, true) if call.function == ENTRY_DONE => {
                info!("Trusted OS initialised on CPU {cpu}");
                Outcome::Forward {
                    regs: SmcReturn::EMPTY,
                    world: World::NonSecure,
                }
            }
            _ => {
                warn!(
                    "Rejecting {:?} from {:?} on CPU {cpu}",
                    call.function, call.world
                );
                Outcome::Return(NOT_SUPPORTED.into())
            }
        }
    }

    fn resume(&self, cpu: usize, original: &CallContext, resume: &CallContext) -> Outcome {
        debug!(
            "Completing {:?} for {:?} on CPU {cpu}",
            original.function, original.world
        );
        Outcome::Return([resume.regs[1], resume.regs[2], resume.regs[3]].into())
    }
}
