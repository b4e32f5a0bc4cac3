// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Routing of SMCs to services, and the world switches which follow from them.

use crate::{
    context::{ContextManager, World},
    exceptions::{RunResult, enter_world},
    platform::{Platform, PlatformImpl},
    services::{
        CallCategory, CallContext, Outcome, Service,
        registry::{RegistryError, ServiceRegistry},
    },
    smccc::{FunctionId, NOT_SUPPORTED, SmcReturn},
};
use log::{debug, warn};
use spin::mutex::SpinMutex;

/// Where the result of a call goes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DispatchResult {
    pub regs: SmcReturn,
    pub world: World,
}

impl DispatchResult {
    fn not_supported(world: World) -> Self {
        Self {
            regs: NOT_SUPPORTED.into(),
            world,
        }
    }
}

/// A yielding call waiting to be resumed.
struct SuspendedCall<'a> {
    call: CallContext,
    /// The world which must resume the call.
    yielded_to: World,
    service: &'a dyn Service,
}

/// Looks up services for calls and keeps track of suspended yielding calls, one per CPU.
pub struct Dispatcher<'a> {
    registry: ServiceRegistry<'a>,
    contexts: &'a ContextManager,
    suspended: [SpinMutex<Option<SuspendedCall<'a>>>; PlatformImpl::CORE_COUNT],
}

impl<'a> Dispatcher<'a> {
    /// Registers the given services, and sets each of them up.
    pub fn new(
        contexts: &'a ContextManager,
        services: &[&'a dyn Service],
    ) -> Result<Self, RegistryError> {
        Ok(Self {
            registry: ServiceRegistry::new(services)?,
            contexts,
            suspended: core::array::from_fn(|_| SpinMutex::new(None)),
        })
    }

    /// Passes the call to the service which owns it, and works out where the result goes.
    pub fn dispatch(&self, cpu: usize, mut call: CallContext) -> DispatchResult {
        call.function.clear_sve_hint();
        if !call.function.valid() {
            warn!(
                "Invalid function ID {} from {:?}",
                call.function, call.world
            );
            return DispatchResult::not_supported(call.world);
        }

        let resumed = self.suspended[cpu].lock().take_if(|suspended| {
            suspended.call.function == call.function && suspended.yielded_to == call.world
        });
        if let Some(suspended) = resumed {
            debug!(
                "Resuming {:?} of {:?} on CPU {cpu}",
                suspended.call.function, suspended.call.world
            );
            let outcome = suspended.service.resume(cpu, &suspended.call, &call);
            return self.complete(
                cpu,
                suspended.service,
                CallCategory::Yielding,
                suspended.call,
                outcome,
            );
        }

        let Some(descriptor) = self.registry.lookup(call.function) else {
            debug!("No service for {:?} on CPU {cpu}", call.function);
            return DispatchResult::not_supported(call.world);
        };

        if descriptor.category() == CallCategory::Yielding && self.suspended[cpu].lock().is_some() {
            warn!(
                "Rejecting {:?} on CPU {cpu}, another call is suspended",
                call.function
            );
            return DispatchResult::not_supported(call.world);
        }

        let outcome = descriptor.service.handle(cpu, &call);
        self.complete(cpu, descriptor.service, descriptor.category(), call, outcome)
    }

    fn complete(
        &self,
        cpu: usize,
        service: &'a dyn Service,
        category: CallCategory,
        call: CallContext,
        outcome: Outcome,
    ) -> DispatchResult {
        match outcome {
            Outcome::Return(regs) => DispatchResult {
                regs,
                world: call.world,
            },
            Outcome::Forward { regs, world } => DispatchResult { regs, world },
            Outcome::Yield { regs, world } => {
                assert_eq!(
                    category,
                    CallCategory::Yielding,
                    "Fast call {:?} tried to yield",
                    call.function
                );
                debug!("{:?} on CPU {cpu} yielded to {world:?}", call.function);
                *self.suspended[cpu].lock() = Some(SuspendedCall {
                    call,
                    yielded_to: world,
                    service,
                });
                DispatchResult { regs, world }
            }
        }
    }

    /// Handles an SMC which `world` made on `cpu`, and returns the world to run next.
    ///
    /// The arguments are read from the saved context of the caller, and the result is written to
    /// the saved context of the world which runs next, after switching to it if necessary.
    pub fn handle_smc(&self, cpu: usize, world: World) -> World {
        let regs = self.contexts.call_registers(cpu, world);
        let call = CallContext {
            function: FunctionId(regs[0] as u32),
            regs,
            world,
        };

        let result = self.dispatch(cpu, call);
        if result.world != world {
            self.contexts.switch_world(cpu, world, result.world);
        }
        self.contexts
            .write_return_value(cpu, result.world, &result.regs);
        result.world
    }

    /// Runs the lower ELs on `cpu`, starting with `first_world`, and handles everything which
    /// brings them back to EL3.
    #[cfg_attr(test, allow(unused))]
    pub fn run_loop(&self, cpu: usize, first_world: World) -> ! {
        self.contexts.set_initial_world(cpu, first_world);

        let mut world = first_world;
        loop {
            world = match enter_world(self.contexts, cpu, world) {
                RunResult::Smc => self.handle_smc(cpu, world),
                RunResult::Interrupt => {
                    let next_world = PlatformImpl::handle_interrupt(cpu, world);
                    if next_world != world {
                        self.contexts.switch_world(cpu, world, next_world);
                    }
                    next_world
                }
                RunResult::FpTrap => {
                    self.contexts.handle_fp_trap(cpu, world);
                    world
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        services::{CallRange, arch::Arch},
        smccc::{OwningEntityNumber, SmcccCallType},
        sysregs::lock_fake_sysregs,
    };
    use arm_sysregs::{Spsr, fake::SYSREGS};
    use std::sync::Mutex;

    const CPU: usize = 2;
    const LONG_CALL: FunctionId = FunctionId(0x0000_0200);

    /// Owns yielding calls 0x200 to 0x2ff, which it passes to the secure world, and a fast call
    /// which wrongly tries to yield.
    struct LongRunning {
        resumed: Mutex<Vec<(CallContext, CallContext)>>,
    }

    const LONG_RUNNING_RANGES: [CallRange; 2] = [
        CallRange::new(
            SmcccCallType::Yielding,
            OwningEntityNumber::ARM_ARCHITECTURE,
            0x200..=0x2FF,
        ),
        CallRange::new(
            SmcccCallType::Fast32,
            OwningEntityNumber::STANDARD_SECURE,
            0x100..=0x100,
        ),
    ];

    impl Service for LongRunning {
        fn call_ranges(&self) -> &'static [CallRange] {
            &LONG_RUNNING_RANGES
        }

        fn handle(&self, _cpu: usize, call: &CallContext) -> Outcome {
            Outcome::Yield {
                regs: SmcReturn::from(call.regs),
                world: World::Secure,
            }
        }

        fn resume(&self, _cpu: usize, original: &CallContext, resume: &CallContext) -> Outcome {
            self.resumed
                .lock()
                .unwrap()
                .push((original.clone(), resume.clone()));
            Outcome::Return([0, resume.regs[1]].into())
        }
    }

    fn long_running() -> LongRunning {
        LongRunning {
            resumed: Mutex::new(Vec::new()),
        }
    }

    fn call(function: FunctionId, world: World) -> CallContext {
        CallContext {
            function,
            regs: [
                function.0.into(),
                0x11,
                0x22,
                0x33,
                0x44,
                0x55,
                0x66,
                0x77,
            ],
            world,
        }
    }

    fn entry_point(pc: usize) -> crate::context::EntryPointInfo {
        crate::context::EntryPointInfo {
            pc,
            spsr: Spsr::D | Spsr::A | Spsr::I | Spsr::F | Spsr::M_AARCH64_EL2H,
            args: [0; 8],
        }
    }

    /// Makes the saved non-secure context on `CPU` look like it just made the given call.
    fn make_call(contexts: &ContextManager, world: World, regs: [u64; 8]) {
        contexts.write_return_value(CPU, world, &SmcReturn::from(regs));
    }

    #[test]
    fn unknown_call_not_supported() {
        let contexts = ContextManager::new();
        let arch = Arch::new();
        let dispatcher = Dispatcher::new(&contexts, &[&arch]).unwrap();

        assert_eq!(
            dispatcher.dispatch(CPU, call(FunctionId(0xC700_0001), World::Secure)),
            DispatchResult::not_supported(World::Secure)
        );
        // Reserved bits set.
        assert_eq!(
            dispatcher.dispatch(CPU, call(FunctionId(0x8002_0000), World::NonSecure)),
            DispatchResult::not_supported(World::NonSecure)
        );
    }

    #[test]
    fn unknown_smc_stays_in_calling_world() {
        let _lock = lock_fake_sysregs();
        SYSREGS.lock().unwrap().reset();
        let contexts = ContextManager::new();
        contexts.init(CPU, World::NonSecure, &entry_point(0x6000_0000));
        contexts.init(CPU, World::Secure, &entry_point(0x0e10_0000));
        contexts.set_initial_world(CPU, World::NonSecure);
        let arch = Arch::new();
        let dispatcher = Dispatcher::new(&contexts, &[&arch]).unwrap();

        make_call(&contexts, World::NonSecure, [0xC700_0001, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(
            dispatcher.handle_smc(CPU, World::NonSecure),
            World::NonSecure
        );
        assert_eq!(contexts.switch_count(CPU), 0);
        assert_eq!(
            contexts.call_registers(CPU, World::NonSecure),
            [u64::MAX, 1, 2, 3, 4, 5, 6, 7]
        );
    }

    #[test]
    fn sve_hint_ignored() {
        let contexts = ContextManager::new();
        let arch = Arch::new();
        let dispatcher = Dispatcher::new(&contexts, &[&arch]).unwrap();

        assert_eq!(
            dispatcher.dispatch(CPU, call(FunctionId(0x8001_0000), World::NonSecure)),
            DispatchResult {
                regs: 0x0001_0005_u64.into(),
                world: World::NonSecure
            }
        );
    }

    #[test]
    fn yield_and_resume() {
        let _lock = lock_fake_sysregs();
        SYSREGS.lock().unwrap().reset();
        let contexts = ContextManager::new();
        contexts.init(CPU, World::NonSecure, &entry_point(0x6000_0000));
        contexts.init(CPU, World::Secure, &entry_point(0x0e10_0000));
        contexts.set_initial_world(CPU, World::NonSecure);
        let service = long_running();
        let dispatcher = Dispatcher::new(&contexts, &[&service]).unwrap();

        let request = [0x200, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77];
        make_call(&contexts, World::NonSecure, request);
        assert_eq!(dispatcher.handle_smc(CPU, World::NonSecure), World::Secure);
        assert_eq!(contexts.call_registers(CPU, World::Secure), request);

        // Another yielding call can't start while this one is suspended.
        assert_eq!(
            dispatcher.dispatch(CPU, call(FunctionId(0x201), World::NonSecure)),
            DispatchResult::not_supported(World::NonSecure)
        );

        // The secure world completes the call.
        make_call(&contexts, World::Secure, [0x200, 0xd0e, 0, 0, 0, 0, 0, 0]);
        assert_eq!(dispatcher.handle_smc(CPU, World::Secure), World::NonSecure);
        assert_eq!(contexts.switch_count(CPU), 2);
        let non_secure = contexts.call_registers(CPU, World::NonSecure);
        assert_eq!(non_secure[..2], [0, 0xd0e]);

        let resumed = service.resumed.lock().unwrap();
        assert_eq!(resumed.len(), 1);
        let (original, resume) = &resumed[0];
        assert_eq!(original.function, LONG_CALL);
        assert_eq!(original.regs, request);
        assert_eq!(original.world, World::NonSecure);
        assert_eq!(resume.world, World::Secure);
        assert!(dispatcher.suspended[CPU].lock().is_none());
    }

    #[test]
    fn resume_needs_matching_call() {
        let contexts = ContextManager::new();
        let service = long_running();
        let dispatcher = Dispatcher::new(&contexts, &[&service]).unwrap();

        dispatcher.dispatch(CPU, call(LONG_CALL, World::NonSecure));

        // A different call from the secure world is a new call, which is rejected.
        assert_eq!(
            dispatcher.dispatch(CPU, call(FunctionId(0x201), World::Secure)),
            DispatchResult::not_supported(World::Secure)
        );
        // The same call from the normal world doesn't resume either.
        assert_eq!(
            dispatcher.dispatch(CPU, call(LONG_CALL, World::NonSecure)),
            DispatchResult::not_supported(World::NonSecure)
        );
        // Another CPU may start its own call.
        assert_eq!(
            dispatcher
                .dispatch(CPU + 1, call(LONG_CALL, World::NonSecure))
                .world,
            World::Secure
        );
        assert!(service.resumed.lock().unwrap().is_empty());

        assert_eq!(
            dispatcher.dispatch(CPU, call(LONG_CALL, World::Secure)),
            DispatchResult {
                regs: [0, 0x11].into(),
                world: World::NonSecure
            }
        );
    }

    #[test]
    #[should_panic(expected = "tried to yield")]
    fn fast_call_yield_is_fatal() {
        let contexts = ContextManager::new();
        let service = long_running();
        let dispatcher = Dispatcher::new(&contexts, &[&service]).unwrap();

        dispatcher.dispatch(CPU, call(FunctionId(0x8400_0100), World::NonSecure));
    }

    #[test]
    fn overlapping_services_rejected() {
        let contexts = ContextManager::new();
        let (first, second) = (Arch::new(), Arch::new());
        assert!(matches!(
            Dispatcher::new(&contexts, &[&first, &second]),
            Err(RegistryError::Overlap(..))
        ));
    }
}
