// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

pub mod arch;
pub mod psci;
pub mod registry;
pub mod trusted_os;

use crate::{
    context::{ContextManager, World},
    platform::{Platform, PlatformImpl},
    smccc::{FunctionId, NOT_SUPPORTED, OwningEntityNumber, SmcReturn, SmcccCallType},
};
use core::ops::RangeInclusive;

/// Helper macro to define the function ID ranges of a service which owns a range of fast calls,
/// in both the SMC32 and SMC64 conventions.
///
/// The range refers to the lower 16 bits [15:0] of the SMC function ID.
macro_rules! call_ranges {
    ($owning_entity:expr, $range:expr) => {
        fn call_ranges(&self) -> &'static [$crate::services::CallRange] {
            const RANGES: [$crate::services::CallRange; 2] = [
                $crate::services::CallRange::new(
                    $crate::smccc::SmcccCallType::Fast32,
                    $owning_entity,
                    $range,
                ),
                $crate::services::CallRange::new(
                    $crate::smccc::SmcccCallType::Fast64,
                    $owning_entity,
                    $range,
                ),
            ];
            &RANGES
        }
    };
}
pub(crate) use call_ranges;

/// Whether the calls of a range run to completion or may be suspended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallCategory {
    Fast,
    Yielding,
}

/// An inclusive range of function IDs handled by a single service.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CallRange {
    pub first: FunctionId,
    pub last: FunctionId,
    pub category: CallCategory,
}

impl CallRange {
    /// Creates the range of function numbers `numbers` of the given owning entity and call type.
    pub const fn new(
        call_type: SmcccCallType,
        owning_entity: OwningEntityNumber,
        numbers: RangeInclusive<u16>,
    ) -> Self {
        Self {
            first: FunctionId::new(call_type, owning_entity, *numbers.start()),
            last: FunctionId::new(call_type, owning_entity, *numbers.end()),
            category: match call_type {
                SmcccCallType::Fast32 | SmcccCallType::Fast64 => CallCategory::Fast,
                SmcccCallType::Yielding => CallCategory::Yielding,
            },
        }
    }

    pub fn contains(&self, function: FunctionId) -> bool {
        self.first <= function && function <= self.last
    }

    pub fn is_empty(&self) -> bool {
        self.first > self.last
    }

    /// Returns whether the fast call bit of both ends agrees with the category.
    pub fn category_matches(&self) -> bool {
        let fast = self.category == CallCategory::Fast;
        self.first.is_fast() == fast && self.last.is_fast() == fast
    }
}

/// A call as seen by a service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CallContext {
    /// The function ID, with the SVE hint cleared.
    pub function: FunctionId,
    /// x0 to x7 of the caller.
    pub regs: [u64; 8],
    /// The world which made the call.
    pub world: World,
}

/// What a service wants to happen after it handled a call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Return the values to the caller.
    Return(SmcReturn),
    /// Deliver the values to the given world, which continues instead of the caller.
    Forward { regs: SmcReturn, world: World },
    /// Suspend the call and deliver the values to the given world. A later call with the same
    /// function ID from that world resumes it.
    Yield { regs: SmcReturn, world: World },
}

/// A service which handles some ranges of SMC calls.
///
/// According to SMCCC v1.3+ the implementation must disregard the SVE hint bit in the function ID
/// and consider it to be 0 for the purpose of function identification. The dispatcher clears it
/// before a service sees the call.
pub trait Service: Sync {
    /// Returns the function ID ranges this service owns.
    fn call_ranges(&self) -> &'static [CallRange];

    /// Called once when the service is registered.
    fn setup(&self) {}

    /// Handles the given call on the given CPU.
    fn handle(&self, cpu: usize, call: &CallContext) -> Outcome;

    /// Continues the suspended call `original` after the world it yielded to made the call
    /// `resume` with the same function ID.
    fn resume(&self, _cpu: usize, _original: &CallContext, _resume: &CallContext) -> Outcome {
        Outcome::Return(NOT_SUPPORTED.into())
    }
}

/// Contains an instance of all of the currently implemented services.
pub struct Services<'a> {
    pub arch: arch::Arch,
    pub psci: psci::Psci<'a>,
    pub trusted_os: trusted_os::TrustedOs,
}

impl<'a> Services<'a> {
    /// Creates every service, with `primary_cpu` as the only CPU which is on.
    pub fn new(contexts: &'a ContextManager, primary_cpu: usize) -> Self {
        let psci_platform = PlatformImpl::psci_platform().expect("PSCI platform already taken");
        Self {
            arch: arch::Arch::new(),
            psci: psci::Psci::new(psci_platform, contexts, primary_cpu),
            trusted_os: trusted_os::TrustedOs::new(),
        }
    }

    /// Returns all the services, to register them with the dispatcher.
    pub fn list(&self) -> [&dyn Service; 3] {
        [&self.arch, &self.psci, &self.trusted_os]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_call_range() {
        let range = CallRange::new(
            SmcccCallType::Fast64,
            OwningEntityNumber::STANDARD_SECURE,
            0x0000..=0x001F,
        );
        assert_eq!(range.first, FunctionId(0xC400_0000));
        assert_eq!(range.last, FunctionId(0xC400_001F));
        assert_eq!(range.category, CallCategory::Fast);
        assert!(range.contains(FunctionId(0xC400_0003)));
        assert!(!range.contains(FunctionId(0x8400_0003)));
        assert!(!range.contains(FunctionId(0xC400_0020)));
        assert!(!range.is_empty());
        assert!(range.category_matches());
    }

    #[test]
    fn yielding_call_range() {
        let range = CallRange::new(
            SmcccCallType::Yielding,
            OwningEntityNumber::TRUSTED_OS,
            0x0000..=0xFFFF,
        );
        assert_eq!(range.first, FunctionId(0x3200_0000));
        assert_eq!(range.last, FunctionId(0x3200_FFFF));
        assert_eq!(range.category, CallCategory::Yielding);
        assert!(range.category_matches());

        let mismatched = CallRange {
            category: CallCategory::Fast,
            ..range
        };
        assert!(!mismatched.category_matches());
    }
}
