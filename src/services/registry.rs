// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The table which maps function IDs to the services owning them.

use super::{CallCategory, CallRange, Service};
use crate::smccc::FunctionId;
use arrayvec::ArrayVec;
use core::fmt::{self, Debug, Display, Formatter};
use log::debug;

/// The maximum number of call ranges of all services together.
const MAX_DESCRIPTORS: usize = 16;

/// Reasons why a set of services can't be registered together.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegistryError {
    /// Two ranges share some function IDs.
    Overlap(CallRange, CallRange),
    /// The range contains no function IDs.
    EmptyRange(CallRange),
    /// The fast call bit of the range doesn't match its category.
    CategoryMismatch(CallRange),
    /// The services own more ranges than the registry has room for.
    TooManyDescriptors,
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Overlap(a, b) => write!(
                f,
                "call range {}..={} overlaps {}..={}",
                a.first, a.last, b.first, b.last
            ),
            Self::EmptyRange(range) => {
                write!(f, "call range {}..={} is empty", range.first, range.last)
            }
            Self::CategoryMismatch(range) => write!(
                f,
                "call range {}..={} is not entirely {:?}",
                range.first, range.last, range.category
            ),
            Self::TooManyDescriptors => {
                write!(f, "more than {MAX_DESCRIPTORS} call ranges registered")
            }
        }
    }
}

/// A call range together with the service which handles it.
pub struct ServiceDescriptor<'a> {
    pub range: CallRange,
    pub service: &'a dyn Service,
}

impl ServiceDescriptor<'_> {
    pub fn category(&self) -> CallCategory {
        self.range.category
    }
}

impl Debug for ServiceDescriptor<'_> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("range", &self.range)
            .finish_non_exhaustive()
    }
}

/// Sorted, non-overlapping service descriptors. Read-only once built.
#[derive(Debug)]
pub struct ServiceRegistry<'a> {
    descriptors: ArrayVec<ServiceDescriptor<'a>, MAX_DESCRIPTORS>,
}

impl<'a> ServiceRegistry<'a> {
    /// Validates the call ranges of all the given services and builds the registry from them.
    ///
    /// Calls `setup` of each service once, if all of the ranges are valid.
    pub fn new(services: &[&'a dyn Service]) -> Result<Self, RegistryError> {
        let mut descriptors = ArrayVec::<ServiceDescriptor<'a>, MAX_DESCRIPTORS>::new();
        for &service in services {
            for &range in service.call_ranges() {
                if range.is_empty() {
                    return Err(RegistryError::EmptyRange(range));
                }
                if !range.category_matches() {
                    return Err(RegistryError::CategoryMismatch(range));
                }
                descriptors
                    .try_push(ServiceDescriptor { range, service })
                    .map_err(|_| RegistryError::TooManyDescriptors)?;
            }
        }

        descriptors.sort_unstable_by_key(|descriptor| descriptor.range.first);
        if let Some(pair) = descriptors
            .windows(2)
            .find(|pair| pair[0].range.last >= pair[1].range.first)
        {
            return Err(RegistryError::Overlap(pair[0].range, pair[1].range));
        }

        for service in services {
            service.setup();
        }
        for descriptor in &descriptors {
            debug!(
                "Registered {:?} calls {}..={}",
                descriptor.range.category, descriptor.range.first, descriptor.range.last
            );
        }

        Ok(Self { descriptors })
    }

    /// Finds the descriptor of the range containing the given function ID.
    pub fn lookup(&self, function: FunctionId) -> Option<&ServiceDescriptor<'a>> {
        let index = self
            .descriptors
            .partition_point(|descriptor| descriptor.range.first <= function);
        let descriptor = &self.descriptors[index.checked_sub(1)?];
        descriptor.range.contains(function).then_some(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        services::{CallContext, Outcome},
        smccc::{OwningEntityNumber, SmcccCallType},
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeService {
        ranges: &'static [CallRange],
        setups: AtomicUsize,
    }

    impl FakeService {
        const fn new(ranges: &'static [CallRange]) -> Self {
            Self {
                ranges,
                setups: AtomicUsize::new(0),
            }
        }
    }

    impl Service for FakeService {
        fn call_ranges(&self) -> &'static [CallRange] {
            self.ranges
        }

        fn setup(&self) {
            self.setups.fetch_add(1, Ordering::SeqCst);
        }

        fn handle(&self, _cpu: usize, _call: &CallContext) -> Outcome {
            Outcome::Return(().into())
        }
    }

    const STANDARD: [CallRange; 2] = [
        CallRange::new(
            SmcccCallType::Fast32,
            OwningEntityNumber::STANDARD_SECURE,
            0x00..=0x1F,
        ),
        CallRange::new(
            SmcccCallType::Fast64,
            OwningEntityNumber::STANDARD_SECURE,
            0x00..=0x1F,
        ),
    ];
    const YIELDING: [CallRange; 1] = [CallRange::new(
        SmcccCallType::Yielding,
        OwningEntityNumber::ARM_ARCHITECTURE,
        0x200..=0x2FF,
    )];
    const ARCH: [CallRange; 1] = [CallRange::new(
        SmcccCallType::Fast32,
        OwningEntityNumber::ARM_ARCHITECTURE,
        0x0000..=0xFFFF,
    )];

    #[test]
    fn lookup_finds_owner() {
        let standard = FakeService::new(&STANDARD);
        let yielding = FakeService::new(&YIELDING);
        let arch = FakeService::new(&ARCH);
        let registry = ServiceRegistry::new(&[&standard, &yielding, &arch]).unwrap();

        let range_of = |function| registry.lookup(FunctionId(function)).map(|d| d.range);
        assert_eq!(range_of(0x8400_0000), Some(STANDARD[0]));
        assert_eq!(range_of(0xC400_001F), Some(STANDARD[1]));
        assert_eq!(range_of(0x8000_0001), Some(ARCH[0]));
        assert_eq!(range_of(0x0000_0200), Some(YIELDING[0]));
        assert_eq!(
            registry
                .lookup(FunctionId(0x0000_0200))
                .map(ServiceDescriptor::category),
            Some(CallCategory::Yielding)
        );

        assert_eq!(range_of(0x0000_0000), None);
        assert_eq!(range_of(0x8400_0020), None);
        assert_eq!(range_of(0xC400_0020), None);
        assert_eq!(range_of(0xFFFF_FFFF), None);

        // Every service was set up exactly once.
        for service in [&standard, &yielding, &arch] {
            assert_eq!(service.setups.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn overlapping_ranges() {
        const INNER: [CallRange; 1] = [CallRange::new(
            SmcccCallType::Fast64,
            OwningEntityNumber::STANDARD_SECURE,
            0x10..=0x10,
        )];
        let standard = FakeService::new(&STANDARD);
        let inner = FakeService::new(&INNER);

        assert_eq!(
            ServiceRegistry::new(&[&standard, &inner]).unwrap_err(),
            RegistryError::Overlap(STANDARD[1], INNER[0])
        );
        // Nothing was set up.
        assert_eq!(standard.setups.load(Ordering::SeqCst), 0);
        assert_eq!(inner.setups.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn invalid_ranges() {
        const EMPTY: [CallRange; 1] = [CallRange {
            first: FunctionId(0x8400_0010),
            last: FunctionId(0x8400_000F),
            category: CallCategory::Fast,
        }];
        const MISMATCHED: [CallRange; 1] = [CallRange {
            first: FunctionId(0x0000_0000),
            last: FunctionId(0x0000_00FF),
            category: CallCategory::Fast,
        }];

        assert_eq!(
            ServiceRegistry::new(&[&FakeService::new(&EMPTY)]).unwrap_err(),
            RegistryError::EmptyRange(EMPTY[0])
        );
        assert_eq!(
            ServiceRegistry::new(&[&FakeService::new(&MISMATCHED)]).unwrap_err(),
            RegistryError::CategoryMismatch(MISMATCHED[0])
        );
    }

    #[test]
    fn too_many_ranges() {
        static MANY: [CallRange; MAX_DESCRIPTORS + 1] = {
            let mut ranges = [CallRange::new(
                SmcccCallType::Fast32,
                OwningEntityNumber(0),
                0..=0,
            ); MAX_DESCRIPTORS + 1];
            let mut i = 0;
            while i < ranges.len() {
                ranges[i] = CallRange::new(
                    SmcccCallType::Fast32,
                    OwningEntityNumber(0),
                    i as u16..=i as u16,
                );
                i += 1;
            }
            ranges
        };

        assert_eq!(
            ServiceRegistry::new(&[&FakeService::new(&MANY)]).unwrap_err(),
            RegistryError::TooManyDescriptors
        );
    }

    #[test]
    fn error_messages() {
        assert_eq!(
            RegistryError::Overlap(STANDARD[1], STANDARD[1]).to_string(),
            "call range 0xc4000000..=0xc400001f overlaps 0xc4000000..=0xc400001f"
        );
        assert_eq!(
            RegistryError::TooManyDescriptors.to_string(),
            "more than 16 call ranges registered"
        );
    }
}
