// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

mod power_domain_tree;

use crate::{
    aarch64::{dsb_sy, wfi},
    context::{ContextManager, EntryPointInfo, World},
    platform::{Platform, PlatformImpl, PlatformPowerState, PsciPlatformImpl},
    services::{CallContext, Outcome, Service, call_ranges},
    smccc::{NOT_SUPPORTED, OwningEntityNumber, SmcReturn},
};
use arm_psci::{
    AffinityInfo, EntryPoint, ErrorCode, FeatureFlagsCpuSuspend, Function, FunctionId,
    MigrateInfoType, Mpidr, PowerState, PsciFeature, Version,
};
use arm_sysregs::{MpidrEl1, read_isr_el1};
use bitflags::bitflags;
use core::fmt::{self, Debug, Formatter};
use log::{debug, info, warn};
use power_domain_tree::{CpuPowerState, PowerDomainTree};

const FUNCTION_NUMBER_MIN: u16 = 0x0000;
const FUNCTION_NUMBER_MAX: u16 = 0x001F;

bitflags! {
    /// Optional platform feature flags
    #[derive(Debug, Eq, PartialEq, Clone, Copy)]
    #[repr(transparent)]
    pub struct PsciPlatformOptionalFeatures: u64 {
        const CPU_SUSPEND = 1 << 0;
        const SYSTEM_OFF = 1 << 1;
        const SYSTEM_RESET = 1 << 2;
    }
}

/// Platform-specific power state interface
///
/// The platform has to provide a platform-specific power state type which implements this trait
/// and all of the dependent traits.
///
/// The type has to implement the `Ord` trait in a way the states are in ascending order from
/// running state to power down state. The `u8` conversions are used to publish requested states
/// through atomics and must round trip.
pub trait PlatformPowerStateInterface:
    Debug + Clone + Copy + PartialEq + Ord + Into<u8> + TryFrom<u8>
{
    const OFF: Self;
    const RUN: Self;

    /// Returns the type of the platform-specific power state.
    fn power_state_type(&self) -> PowerStateType;
}

/// PSCI platform interface
///
/// Hooks which return a `Result` may refuse the transition, in which case the coordinator undoes
/// its own state changes and passes the error on to the caller.
pub trait PsciPlatformInterface: Sync {
    /// Count of all power domains
    const POWER_DOMAIN_COUNT: usize;
    /// Maximal power level in the system
    const MAX_POWER_LEVEL: usize;

    /// Flags for describing optional features implemented by the platform.
    const FEATURES: PsciPlatformOptionalFeatures;

    /// Platform-specific power state type
    type PlatformPowerState: PlatformPowerStateInterface;

    /// Returns the power domain topology as the count of child nodes in a BFS traversal order.
    ///
    /// The first entry is the number of root domains, which must be 1.
    fn topology() -> &'static [usize];

    /// Tries to convert extended PSCI power state value into `PsciCompositePowerState`.
    fn try_parse_power_state(power_state: PowerState) -> Option<PsciCompositePowerState>;

    /// Places the current CPU into standby state and continues execution on interrupt.
    fn cpu_standby(&self, cpu_state: PlatformPowerState);

    /// Turns on the CPU identified by its MPIDR.
    fn power_domain_on(&self, mpidr: Mpidr) -> Result<(), ErrorCode>;

    /// Performs platform-specific actions after the CPU has been turned on.
    fn power_domain_on_finish(&self, previous_state: &PsciCompositePowerState);

    /// Prepares the power domains up to `level` for this CPU turning off, e.g. programs the power
    /// controller.
    fn power_domain_off(
        &self,
        level: usize,
        target_state: &PsciCompositePowerState,
    ) -> Result<(), ErrorCode>;

    /// Prepares the power domains up to `level` for this CPU suspending.
    fn power_domain_suspend(
        &self,
        level: usize,
        target_state: &PsciCompositePowerState,
    ) -> Result<(), ErrorCode>;

    /// Performs platform-specific operations after a wake-up from a suspend state.
    fn power_domain_suspend_finish(&self, previous_state: &PsciCompositePowerState);

    /// Platform-specific function for entering WFI on power down, optional.
    fn power_domain_power_down_wfi(
        &self,
        _level: usize,
        _target_state: &PsciCompositePowerState,
    ) -> ! {
        dsb_sy();
        loop {
            wfi();
        }
    }

    /// Shuts down the system.
    fn system_off(&self) -> !;

    /// Resets the system, the behavior is equivalent to a hardware power-cycle sequence.
    fn system_reset(&self) -> !;

    /// Validates a non-secure entry point, optional.
    fn is_valid_ns_entrypoint(&self, _entry: &EntryPoint) -> bool {
        true
    }

    /// Checks if the CPU has pending interrupts
    fn has_pending_interrupts(&self) -> bool {
        read_isr_el1() != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerStateType {
    PowerDown,
    StandbyOrRetention,
    Run,
}

/// Why a CPU came out of reset at the warm boot entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeUpReason {
    CpuOn(EntryPoint),
    SuspendFinished(EntryPoint),
}

/// Object for storing platform-specific power state for multiple power levels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsciCompositePowerState {
    pub states: [PlatformPowerState; PsciPlatformImpl::MAX_POWER_LEVEL + 1],
}

impl PsciCompositePowerState {
    pub const CPU_POWER_LEVEL: usize = 0;

    /// States set to OFF on all levels.
    pub const OFF: Self = Self {
        states: [PlatformPowerState::OFF; PsciPlatformImpl::MAX_POWER_LEVEL + 1],
    };

    /// States set to RUN on all levels.
    pub const RUN: Self = Self {
        states: [PlatformPowerState::RUN; PsciPlatformImpl::MAX_POWER_LEVEL + 1],
    };

    pub fn new(states: [PlatformPowerState; PsciPlatformImpl::MAX_POWER_LEVEL + 1]) -> Self {
        Self { states }
    }

    /// Returns the power state of the CPU level.
    pub fn cpu_level_state(&self) -> PlatformPowerState {
        self.states[Self::CPU_POWER_LEVEL]
    }

    /// Find the highest power level which is not set to running state.
    pub fn find_highest_non_run_level(&self) -> Option<usize> {
        self.states
            .iter()
            .rposition(|state| state.power_state_type() != PowerStateType::Run)
    }

    /// Find the highest power level which is set to power down state.
    pub fn find_highest_power_down_level(&self) -> Option<usize> {
        self.states
            .iter()
            .rposition(|state| state.power_state_type() == PowerStateType::PowerDown)
    }

    /// Checks that the composite state does not violate any PSCI rules.
    pub fn is_valid_suspend_request(&self, is_power_down_state: bool) -> bool {
        // There should be a non-run level
        if self.find_highest_non_run_level().is_none() {
            return false;
        };

        // Higher levels must be in less than or equal power state
        if !self.states.is_sorted_by(|a, b| a >= b) {
            return false;
        }

        if is_power_down_state {
            self.find_highest_power_down_level().is_some()
        } else {
            self.find_highest_power_down_level().is_none()
        }
    }
}

/// The PSCI service: handles all the PSCI calls and tracks the power state of every power domain.
pub struct Psci<'a> {
    platform: PsciPlatformImpl,
    power_domain_tree: PowerDomainTree,
    contexts: &'a ContextManager,
}

impl<'a> Psci<'a> {
    /// Initialises the PSCI state, with `primary_cpu` running and everything else off.
    ///
    /// This should be called exactly once, before any secondary CPUs are started.
    pub fn new(
        platform: PsciPlatformImpl,
        contexts: &'a ContextManager,
        primary_cpu: usize,
    ) -> Self {
        info!("Initializing PSCI");

        let power_domain_tree = PowerDomainTree::new(PsciPlatformImpl::topology());
        {
            let mut cpu = power_domain_tree.locked_cpu_node(primary_cpu);
            power_domain_tree.power_up(primary_cpu, &mut cpu, |_, _| {});
            cpu.set_state(CpuPowerState::On);
        }

        Self {
            platform,
            power_domain_tree,
            contexts,
        }
    }

    /// Handles `CPU_ON` from `caller`, turning on the CPU identified by `target_cpu`.
    ///
    /// On success the target's non-secure context is ready to enter at `entry` and its secure
    /// context at the platform's secure entry point. A rejected request changes nothing.
    fn cpu_on(&self, caller: usize, target_cpu: Mpidr, entry: EntryPoint) -> Result<(), ErrorCode> {
        let cpu_index =
            try_get_cpu_index_by_mpidr(target_cpu).ok_or(ErrorCode::InvalidParameters)?;

        if !self.platform.is_valid_ns_entrypoint(&entry) {
            return Err(ErrorCode::InvalidAddress);
        }

        if cpu_index == caller {
            return Err(ErrorCode::AlreadyOn);
        }

        let mut cpu = self.power_domain_tree.locked_cpu_node(cpu_index);
        match cpu.state() {
            CpuPowerState::On | CpuPowerState::SuspendPending | CpuPowerState::Suspend => {
                return Err(ErrorCode::AlreadyOn);
            }
            CpuPowerState::OnPending => return Err(ErrorCode::OnPending),
            CpuPowerState::Off => {}
        }

        cpu.set_state(CpuPowerState::OnPending);
        cpu.set_entry_point(entry);
        self.provision_contexts(cpu_index, &entry);

        match self.platform.power_domain_on(target_cpu) {
            Ok(()) => {
                info!("CPU {caller} turning on CPU {cpu_index}");
                Ok(())
            }
            Err(error) => {
                warn!("Platform failed to turn on CPU {cpu_index}: {error:?}");
                cpu.set_state(CpuPowerState::Off);
                cpu.pop_entry_point();
                self.contexts.invalidate(cpu_index);
                Err(error)
            }
        }
    }

    /// Builds the contexts a CPU starts from after `CPU_ON`.
    fn provision_contexts(&self, cpu_index: usize, entry: &EntryPoint) {
        let mut args = [0; 8];
        args[0] = entry.context_id();
        let non_secure_entry_point = EntryPointInfo {
            pc: entry.entry_point_address() as usize,
            args,
            ..PlatformImpl::non_secure_entry_point()
        };
        self.contexts
            .init(cpu_index, World::NonSecure, &non_secure_entry_point);
        self.contexts.init(
            cpu_index,
            World::Secure,
            &PlatformImpl::secure_entry_point(cpu_index),
        );
        #[cfg(feature = "rme")]
        self.contexts.init(
            cpu_index,
            World::Realm,
            &PlatformImpl::realm_entry_point(cpu_index),
        );
    }

    /// Handles `CPU_OFF`.
    ///
    /// On success, turns off the current CPU and does not return.
    fn cpu_off(&self, cpu_index: usize) -> Result<(), ErrorCode> {
        let mut cpu = self.power_domain_tree.locked_cpu_node(cpu_index);
        cpu.set_local_state(PlatformPowerState::OFF);

        let result = self.power_domain_tree.power_down(
            cpu_index,
            &PsciCompositePowerState::OFF,
            |level, target_state| self.platform.power_domain_off(level, target_state),
        );
        let (level, target_state) = match result {
            Ok(target) => target,
            Err(error) => {
                warn!("Platform refused to turn off CPU {cpu_index}: {error:?}");
                cpu.set_local_state(PlatformPowerState::RUN);
                return Err(error);
            }
        };

        cpu.set_state(CpuPowerState::Off);
        self.contexts.invalidate(cpu_index);
        // Unlock CPU before actually turning it off
        drop(cpu);

        info!("CPU {cpu_index} powering down up to level {level}");
        self.platform
            .power_domain_power_down_wfi(level, &target_state)
    }

    /// Handles `CPU_SUSPEND`.
    ///
    /// A standby state which only affects the CPU level waits for an interrupt directly. Any other
    /// state takes part in the power down coordination of the ancestor domains. A power down
    /// suspend does not return: the CPU comes back through `handle_cpu_boot`. A retention suspend
    /// returns once an interrupt has woken the CPU.
    fn cpu_suspend(
        &self,
        cpu_index: usize,
        power_state: PowerState,
        entry_point: EntryPoint,
    ) -> Result<(), ErrorCode> {
        let composite_state = PsciPlatformImpl::try_parse_power_state(power_state)
            .ok_or(ErrorCode::InvalidParameters)?;
        let is_power_down_state = matches!(power_state, PowerState::PowerDown(_));

        if !composite_state.is_valid_suspend_request(is_power_down_state) {
            return Err(ErrorCode::InvalidParameters);
        }
        let highest_affected_level = composite_state
            .find_highest_non_run_level()
            .ok_or(ErrorCode::InvalidParameters)?;

        if !is_power_down_state
            && highest_affected_level == PsciCompositePowerState::CPU_POWER_LEVEL
        {
            // CPU standby which does not affect parent nodes
            let cpu_pd_state = composite_state.cpu_level_state();
            self.power_domain_tree
                .locked_cpu_node(cpu_index)
                .set_local_state(cpu_pd_state);

            self.platform.cpu_standby(cpu_pd_state);

            self.power_domain_tree
                .locked_cpu_node(cpu_index)
                .set_local_state(PlatformPowerState::RUN);
            return Ok(());
        }

        if is_power_down_state && !self.platform.is_valid_ns_entrypoint(&entry_point) {
            return Err(ErrorCode::InvalidAddress);
        }

        if self.platform.has_pending_interrupts() {
            debug!("CPU {cpu_index} not suspending, interrupt pending");
            return Ok(());
        }

        let mut cpu = self.power_domain_tree.locked_cpu_node(cpu_index);
        cpu.set_state(CpuPowerState::SuspendPending);
        cpu.set_local_state(composite_state.cpu_level_state());

        let result = self.power_domain_tree.power_down(
            cpu_index,
            &composite_state,
            |level, target_state| self.platform.power_domain_suspend(level, target_state),
        );
        let (level, target_state) = match result {
            Ok(target) => target,
            Err(error) => {
                warn!("Platform refused to suspend CPU {cpu_index}: {error:?}");
                cpu.set_state(CpuPowerState::On);
                cpu.set_local_state(PlatformPowerState::RUN);
                return Err(error);
            }
        };
        cpu.set_state(CpuPowerState::Suspend);

        if is_power_down_state {
            cpu.set_entry_point(entry_point);
            self.contexts.save_for_power_down(cpu_index);
            // Unlock CPU before entering suspend state
            drop(cpu);

            debug!("CPU {cpu_index} suspending with power down up to level {level}");
            self.platform
                .power_domain_power_down_wfi(level, &target_state)
        } else {
            drop(cpu);

            debug!("CPU {cpu_index} entering retention up to level {level}");
            wfi();

            let mut cpu = self.power_domain_tree.locked_cpu_node(cpu_index);
            self.power_domain_tree
                .power_up(cpu_index, &mut cpu, |_, previous_state| {
                    self.platform.power_domain_suspend_finish(previous_state)
                });
            cpu.set_state(CpuPowerState::On);
            Ok(())
        }
    }

    /// Must be called when a CPU is powered up. Finishes the `CPU_ON` or power down
    /// `CPU_SUSPEND` which brought the CPU up, and returns the reason together with the
    /// non-secure entry point which the caller asked for.
    ///
    /// After a suspend the non-secure context is already pointed at the entry point.
    pub fn handle_cpu_boot(&self, cpu_index: usize) -> WakeUpReason {
        let mut cpu = self.power_domain_tree.locked_cpu_node(cpu_index);
        let state = cpu.state();
        let wake_from_suspend = match state {
            CpuPowerState::OnPending => false,
            CpuPowerState::Suspend => true,
            _ => {
                drop(cpu);
                panic!("Unexpected power state {state:?} on boot of CPU {cpu_index}");
            }
        };

        self.power_domain_tree
            .power_up(cpu_index, &mut cpu, |_, previous_state| {
                if wake_from_suspend {
                    self.platform.power_domain_suspend_finish(previous_state);
                } else {
                    self.platform.power_domain_on_finish(previous_state);
                }
            });
        cpu.set_state(CpuPowerState::On);

        let entry_point = cpu.pop_entry_point();
        drop(cpu); // Unlock before possible panic

        let entry_point = entry_point
            .unwrap_or_else(|| panic!("Entry point not set for booting CPU {cpu_index}"));

        if wake_from_suspend {
            self.contexts.prepare_resume(cpu_index, entry_point);
            WakeUpReason::SuspendFinished(entry_point)
        } else {
            WakeUpReason::CpuOn(entry_point)
        }
    }

    /// Handles `AFFINITY_INFO`.
    ///
    /// For a level above the CPU level the affinity fields below that level are ignored, and the
    /// domain is reported ON if any CPU in it is on, otherwise ON_PENDING if any is being turned
    /// on.
    fn affinity_info(
        &self,
        target_affinity: Mpidr,
        lowest_affinity_level: u32,
    ) -> Result<AffinityInfo, ErrorCode> {
        let level = lowest_affinity_level as usize;
        if level > PsciPlatformImpl::MAX_POWER_LEVEL {
            return Err(ErrorCode::InvalidParameters);
        }

        let target_affinity = Mpidr {
            aff0: if level > 0 { 0 } else { target_affinity.aff0 },
            aff1: if level > 1 { 0 } else { target_affinity.aff1 },
            aff2: if level > 2 { 0 } else { target_affinity.aff2 },
            aff3: target_affinity.aff3,
        };
        let cpu_index =
            try_get_cpu_index_by_mpidr(target_affinity).ok_or(ErrorCode::InvalidParameters)?;

        Ok(self.power_domain_tree.affinity_info(cpu_index, level))
    }

    /// Handles `PSCI_FEATURES`.
    fn handle_features(&self, feature: PsciFeature) -> Result<u64, ErrorCode> {
        const SUCCESS: u64 = 0;

        let check_optional_feature = |feature| {
            if PsciPlatformImpl::FEATURES.contains(feature) {
                Ok(SUCCESS)
            } else {
                Err(ErrorCode::NotSupported)
            }
        };

        match feature {
            PsciFeature::PsciFunction(function_id) => match function_id {
                FunctionId::PsciVersion
                | FunctionId::CpuOff
                | FunctionId::CpuOn32
                | FunctionId::CpuOn64
                | FunctionId::AffinityInfo32
                | FunctionId::AffinityInfo64
                | FunctionId::MigrateInfoType
                | FunctionId::PsciFeatures => Ok(SUCCESS),
                FunctionId::CpuSuspend32 | FunctionId::CpuSuspend64 => {
                    check_optional_feature(PsciPlatformOptionalFeatures::CPU_SUSPEND)?;
                    Ok(u32::from(FeatureFlagsCpuSuspend::EXTENDED_POWER_STATE).into())
                }
                FunctionId::SystemOff => {
                    check_optional_feature(PsciPlatformOptionalFeatures::SYSTEM_OFF)
                }
                FunctionId::SystemReset => {
                    check_optional_feature(PsciPlatformOptionalFeatures::SYSTEM_RESET)
                }
                _ => Err(ErrorCode::NotSupported),
            },
            PsciFeature::SmcccVersion => Ok(SUCCESS),
        }
    }

    /// Handles `SYSTEM_OFF`. Turns off the system and does not return.
    fn system_off(&self) -> Result<u64, ErrorCode> {
        if !PsciPlatformImpl::FEATURES.contains(PsciPlatformOptionalFeatures::SYSTEM_OFF) {
            return Err(ErrorCode::NotSupported);
        }
        info!("System off");
        self.platform.system_off();
    }

    /// Handles `SYSTEM_RESET`. Resets the system and does not return.
    fn system_reset(&self) -> Result<u64, ErrorCode> {
        if !PsciPlatformImpl::FEATURES.contains(PsciPlatformOptionalFeatures::SYSTEM_RESET) {
            return Err(ErrorCode::NotSupported);
        }
        info!("System reset");
        self.platform.system_reset();
    }

    fn handle_smc_inner(&self, cpu_index: usize, regs: &[u64; 4]) -> Result<u64, ErrorCode> {
        const SUCCESS: u64 = 0;
        let function = Function::try_from(regs)?;
        debug!("PSCI call {function:?} on CPU {cpu_index}");

        match function {
            Function::Version => {
                let version = Version { major: 1, minor: 3 };
                Ok(u32::from(version).into())
            }
            Function::CpuSuspend { state, entry } => {
                if !PsciPlatformImpl::FEATURES.contains(PsciPlatformOptionalFeatures::CPU_SUSPEND)
                {
                    return Err(ErrorCode::NotSupported);
                }
                self.cpu_suspend(cpu_index, state, entry)?;
                Ok(SUCCESS)
            }
            Function::CpuOff => {
                self.cpu_off(cpu_index)?;
                Ok(SUCCESS)
            }
            Function::CpuOn { target_cpu, entry } => {
                self.cpu_on(cpu_index, target_cpu, entry)?;
                Ok(SUCCESS)
            }
            Function::AffinityInfo {
                mpidr,
                lowest_affinity_level,
            } => {
                let affinity_info = self.affinity_info(mpidr, lowest_affinity_level)?;
                Ok(u32::from(affinity_info).into())
            }
            Function::MigrateInfoType => {
                Ok(u32::from(MigrateInfoType::MigrationNotRequired).into())
            }
            Function::SystemOff => self.system_off(),
            Function::SystemReset => self.system_reset(),
            Function::Features { psci_func_id } => self.handle_features(psci_func_id),
            _ => Err(ErrorCode::NotSupported),
        }
    }
}

impl Service for Psci<'_> {
    call_ranges!(
        OwningEntityNumber::STANDARD_SECURE,
        FUNCTION_NUMBER_MIN..=FUNCTION_NUMBER_MAX
    );

    fn handle(&self, cpu: usize, call: &CallContext) -> Outcome {
        if call.world != World::NonSecure {
            return Outcome::Return(NOT_SUPPORTED.into());
        }

        let mut in_regs = [0; 4];
        in_regs.copy_from_slice(&call.regs[..4]);
        in_regs[0] = call.function.0.into();

        let result: u64 = match self.handle_smc_inner(cpu, &in_regs) {
            Ok(result) => result,
            Err(return_code) => return_code.into(),
        };

        Outcome::Return(SmcReturn::from(result))
    }
}

impl Debug for Psci<'_> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        self.power_domain_tree.fmt(f)
    }
}

/// Returns the corresponding linear core index for the given PSCI MPIDR value.
///
/// For any valid MPIDR this will return a unique value less than `Platform::CORE_COUNT`.
/// For any invalid MPIDR it will return `None`.
pub fn try_get_cpu_index_by_mpidr(psci_mpidr: Mpidr) -> Option<usize> {
    // The PSCI MPIDR value doesn't include the MT or U bits, but they might be important for how
    // the platform validates MPIDR values and calculates core position, so add them in.
    let mpidr = MpidrEl1::from_psci_mpidr(psci_mpidr.into());
    if PlatformImpl::mpidr_is_valid(mpidr) {
        Some(PlatformImpl::core_position(mpidr.bits()))
    } else {
        None
    }
}
