// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Types and helpers related to the SMC Calling Convention.

use core::fmt::{self, Debug, Display, Formatter};

const FAST_CALL: u32 = 0x8000_0000;
const SMC64: u32 = 0x4000_0000;
const OEN_MASK: u32 = 0x3f00_0000;
const OEN_SHIFT: u8 = 24;
const SVE_HINT: u32 = 1 << 16;
const RESERVED_BITS: u32 = 0x7f << 17;

/// The call completed successfully.
pub const SUCCESS: i32 = 0;

/// The call is not supported by the implementation.
pub const NOT_SUPPORTED: i32 = -1;

/// The type of an SMCCC call: whether it is a fast call or yielding call, and which calling
/// convention it uses.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SmcccCallType {
    /// An SMC32/HVC32 fast call.
    Fast32,
    /// An SMC64/HVC64 fast call.
    Fast64,
    /// A yielding call.
    Yielding,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OwningEntity {
    ArmArchitectureService,
    CPUService,
    SiPService,
    OEMService,
    StandardSecureService,
    StandardHypervisorService,
    VendorSpecificHypervisorService,
    VendorSpecificEL3MonitorService,
    TrustedApplications,
    TrustedOS,
    Unknown,
}

/// Owning Entity Number (OEN)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OwningEntityNumber(pub u8);

impl OwningEntityNumber {
    pub const ARM_ARCHITECTURE: Self = Self(0);
    pub const STANDARD_SECURE: Self = Self(4);
    pub const TRUSTED_OS: Self = Self(50);

    pub fn oe(self) -> OwningEntity {
        match self.0 {
            0 => OwningEntity::ArmArchitectureService,
            1 => OwningEntity::CPUService,
            2 => OwningEntity::SiPService,
            3 => OwningEntity::OEMService,
            4 => OwningEntity::StandardSecureService,
            5 => OwningEntity::StandardHypervisorService,
            6 => OwningEntity::VendorSpecificHypervisorService,
            7 => OwningEntity::VendorSpecificEL3MonitorService,
            48..=49 => OwningEntity::TrustedApplications,
            50..=63 => OwningEntity::TrustedOS,
            _ => OwningEntity::Unknown,
        }
    }
}

impl Display for OwningEntityNumber {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An SMCCC function ID.
#[derive(Copy, Clone, Eq, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct FunctionId(pub u32);

impl FunctionId {
    /// Creates a new `FunctionId` from its components.
    pub const fn new(call_type: SmcccCallType, oen: OwningEntityNumber, number: u16) -> Self {
        let type_bits = match call_type {
            SmcccCallType::Fast32 => FAST_CALL,
            SmcccCallType::Fast64 => FAST_CALL | SMC64,
            SmcccCallType::Yielding => 0,
        };
        Self(type_bits | (((oen.0 as u32) << OEN_SHIFT) & OEN_MASK) | (number as u32))
    }

    /// Returns the Owning Entity Number of the function ID.
    pub fn oen(self) -> OwningEntityNumber {
        OwningEntityNumber(((self.0 & OEN_MASK) >> OEN_SHIFT) as u8)
    }

    /// Returns the lower 16 bits of the function ID.
    #[cfg_attr(not(test), allow(unused))]
    pub fn number(self) -> u16 {
        self.0 as u16
    }

    /// Returns what type of call this is.
    pub const fn call_type(self) -> SmcccCallType {
        if self.0 & FAST_CALL != 0 {
            if self.0 & SMC64 != 0 {
                SmcccCallType::Fast64
            } else {
                SmcccCallType::Fast32
            }
        } else {
            SmcccCallType::Yielding
        }
    }

    /// Returns whether this is a fast call of either calling convention.
    pub const fn is_fast(self) -> bool {
        self.0 & FAST_CALL != 0
    }

    /// Returns whether the SVE hint bit is set.
    ///
    /// If this is true, the caller asserts that P0-P15, FFR and the bits with index greater than
    /// 127 in the Z0-Z31 registers do not contain any live state.
    #[cfg_attr(not(test), allow(unused))]
    pub fn sve_hint(self) -> bool {
        self.0 & SVE_HINT != 0
    }

    /// Sets the SVE hint bit.
    #[cfg_attr(not(test), allow(unused))]
    pub fn set_sve_hint(&mut self) {
        self.0 |= SVE_HINT
    }

    /// Clears the SVE hint bit.
    pub fn clear_sve_hint(&mut self) {
        self.0 &= !SVE_HINT
    }

    /// Returns false if this is a fast call but has any of bits 17-23 set.
    ///
    /// They are reserved for future use and should always be 0.
    pub fn valid(self) -> bool {
        self.call_type() == SmcccCallType::Yielding || self.0 & RESERVED_BITS == 0
    }
}

impl Display for FunctionId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl Debug for FunctionId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{:#010x} ({:?} OEN {} {:?})",
            self.0,
            self.call_type(),
            self.oen(),
            self.oen().oe()
        )
    }
}

/// A value which can be returned from an SMC call by writing to the caller's registers.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct SmcReturn {
    /// The number of elements from `values` that are actually used for this return.
    used: usize,
    values: [u64; Self::MAX_VALUES],
}

impl SmcReturn {
    /// The maximum number of registers (x0-x7) a single return can set.
    pub const MAX_VALUES: usize = 8;

    pub const EMPTY: Self = Self {
        used: 0,
        values: [0; Self::MAX_VALUES],
    };

    /// Returns a slice containing the used values.
    pub fn values(&self) -> &[u64] {
        &self.values[0..self.used]
    }

    /// Returns true if no values are used.
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }
}

impl Debug for SmcReturn {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "SmcReturn([")?;
        let values = self.values();
        if let Some(first) = values.first() {
            write!(f, "{first:#x}")?;
            for value in &values[1..] {
                write!(f, ", {value:#x}")?;
            }
        }
        write!(f, "])")?;
        Ok(())
    }
}

impl From<()> for SmcReturn {
    fn from(_: ()) -> Self {
        Self::EMPTY
    }
}

impl From<u64> for SmcReturn {
    fn from(value: u64) -> Self {
        Self::from([value])
    }
}

impl From<i64> for SmcReturn {
    fn from(value: i64) -> Self {
        Self::from(value as u64)
    }
}

impl From<u32> for SmcReturn {
    fn from(value: u32) -> Self {
        Self::from(u64::from(value))
    }
}

/// Negative SMCCC return codes are sign-extended to 64 bits, as the caller reads them from `x0`.
impl From<i32> for SmcReturn {
    fn from(value: i32) -> Self {
        Self::from(i64::from(value))
    }
}

macro_rules! smc_return_from_array {
    ($length:literal) => {
        impl From<[u64; $length]> for SmcReturn {
            fn from(value: [u64; $length]) -> Self {
                let mut values = [0; Self::MAX_VALUES];
                values[..$length].copy_from_slice(&value);
                Self {
                    used: $length,
                    values,
                }
            }
        }
    };
}

smc_return_from_array!(1);
smc_return_from_array!(2);
smc_return_from_array!(3);
smc_return_from_array!(4);
smc_return_from_array!(5);
smc_return_from_array!(6);
smc_return_from_array!(7);
smc_return_from_array!(8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_id_fields() {
        let function = FunctionId(0xc400_0003);
        assert_eq!(function.call_type(), SmcccCallType::Fast64);
        assert_eq!(function.oen(), OwningEntityNumber::STANDARD_SECURE);
        assert_eq!(function.oen().oe(), OwningEntity::StandardSecureService);
        assert_eq!(function.number(), 3);
        assert!(function.is_fast());
        assert!(function.valid());

        assert_eq!(
            FunctionId::new(SmcccCallType::Fast64, OwningEntityNumber::STANDARD_SECURE, 3),
            function
        );
        assert_eq!(FunctionId(0x0000_0200).call_type(), SmcccCallType::Yielding);
        assert_eq!(FunctionId(0x3200_0001).oen().oe(), OwningEntity::TrustedOS);
    }

    #[test]
    fn reserved_bits_only_matter_for_fast_calls() {
        assert!(!FunctionId(0x8002_0000).valid());
        assert!(!FunctionId(0x80fe_0000).valid());
        assert!(FunctionId(0x0002_0000).valid());
    }

    #[test]
    fn sve_hint() {
        let mut function = FunctionId(0x8000_0000);
        assert!(!function.sve_hint());
        function.set_sve_hint();
        assert_eq!(function.0, 0x8001_0000);
        assert!(function.sve_hint());
        assert!(function.valid());
        function.clear_sve_hint();
        assert_eq!(function.0, 0x8000_0000);
    }

    #[test]
    fn smc_return_values() {
        assert!(SmcReturn::from(()).is_empty());
        assert_eq!(SmcReturn::from(NOT_SUPPORTED).values(), [u64::MAX]);
        assert_eq!(SmcReturn::from(5u32).values(), [5]);
        assert_eq!(SmcReturn::from([1, 2, 3]).values(), [1, 2, 3]);
        assert_eq!(
            format!("{:?}", SmcReturn::from([0x10, 0x20])),
            "SmcReturn([0x10, 0x20])"
        );
    }
}
