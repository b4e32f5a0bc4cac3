// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Collection of structures for describing the power domain tree, and the coordination of power
//! state transitions through it.
//!
//! Every non-CPU node counts how many of its children are powered. A CPU powering down decrements
//! the count of its parent, and only the CPU which brings a count to zero goes on to lock that node
//! and decide whether it can depart as well. Powering up increments the counts on the way up and
//! stops at the first node which is still running. Nodes are always locked from the lower levels
//! to the higher ones.

use super::{
    PlatformPowerState, PlatformPowerStateInterface as _, PsciCompositePowerState,
    PsciPlatformImpl, PsciPlatformInterface as _,
};
use crate::platform::{Platform, PlatformImpl};
use arm_psci::{AffinityInfo, EntryPoint};
use arrayvec::ArrayVec;
use core::{
    fmt::{self, Debug, Formatter},
    ops::Range,
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};
use spin::mutex::{SpinMutex, SpinMutexGuard};

/// Ancestor node indices of a CPU, from the lowest level to the root.
type Ancestors = ArrayVec<usize, { PsciPlatformImpl::MAX_POWER_LEVEL }>;

/// Locked local states of the non-CPU nodes an operation is changing, from the lowest level.
type LockedNodes<'a> =
    ArrayVec<SpinMutexGuard<'a, PlatformPowerState>, { PsciPlatformImpl::MAX_POWER_LEVEL }>;

/// Represents a non-CPU power domain node in the power domain tree.
#[derive(Debug)]
pub struct NonCpuPowerNode {
    /// Parent node index or None if it is the top level node
    parent: Option<usize>,
    /// Power level of the node
    level: usize,
    /// Range of descendant CPU indices
    cpu_range: Range<usize>,
    /// Number of child nodes which have not departed
    powered_children: AtomicUsize,
    /// Local power state of the node, the node has departed if this is not RUN
    local_state: SpinMutex<PlatformPowerState>,
}

impl NonCpuPowerNode {
    fn new(parent: Option<usize>, level: usize) -> Self {
        Self {
            parent,
            level,
            cpu_range: 0..0,
            powered_children: AtomicUsize::new(0),
            local_state: SpinMutex::new(PlatformPowerState::OFF),
        }
    }

    /// Assign descendant CPU node index incrementally.
    fn assign_cpu(&mut self, cpu_index: usize) {
        if self.cpu_range.is_empty() {
            self.cpu_range = cpu_index..cpu_index + 1;
        } else {
            debug_assert_eq!(self.cpu_range.end, cpu_index);
            self.cpu_range.end += 1;
        }
    }
}

/// Lifecycle state of a CPU as seen by PSCI.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CpuPowerState {
    Off,
    OnPending,
    On,
    SuspendPending,
    Suspend,
}

impl CpuPowerState {
    /// Returns the state as reported by `AFFINITY_INFO`. A suspended CPU is still on.
    pub fn affinity_info(self) -> AffinityInfo {
        match self {
            Self::Off => AffinityInfo::Off,
            Self::OnPending => AffinityInfo::OnPending,
            Self::On | Self::SuspendPending | Self::Suspend => AffinityInfo::On,
        }
    }
}

/// Represents a CPU power domain node in the power domain tree.
#[derive(Debug)]
pub struct CpuPowerNode {
    /// Current state of the CPU
    state: CpuPowerState,
    /// Local power state of the CPU node
    local_state: PlatformPowerState,
    /// Non-secure entry point of the CPU on waking up
    entry_point: Option<EntryPoint>,
}

impl CpuPowerNode {
    fn new() -> Self {
        Self {
            state: CpuPowerState::Off,
            local_state: PlatformPowerState::OFF,
            entry_point: None,
        }
    }

    pub fn state(&self) -> CpuPowerState {
        self.state
    }

    pub fn set_state(&mut self, state: CpuPowerState) {
        self.state = state;
    }

    #[cfg_attr(not(test), allow(unused))]
    pub fn local_state(&self) -> PlatformPowerState {
        self.local_state
    }

    pub fn set_local_state(&mut self, local_state: PlatformPowerState) {
        self.local_state = local_state;
    }

    /// Store non-secure entry point of the CPU.
    pub fn set_entry_point(&mut self, entry_point: EntryPoint) {
        assert_eq!(self.entry_point, None);
        self.entry_point = Some(entry_point);
    }

    /// Get and clear stored non-secure entry point of the CPU.
    pub fn pop_entry_point(&mut self) -> Option<EntryPoint> {
        self.entry_point.take()
    }
}

/// The PowerDomainTree is responsible for storing the non-CPU and CPU power nodes and for
/// coordinating the power state of the non-CPU nodes between the CPUs.
pub struct PowerDomainTree {
    non_cpu_power_nodes: ArrayVec<NonCpuPowerNode, { Self::NON_CPU_DOMAIN_COUNT }>,
    cpu_parents: ArrayVec<usize, { Self::CPU_DOMAIN_COUNT }>,
    cpu_power_nodes: ArrayVec<SpinMutex<CpuPowerNode>, { Self::CPU_DOMAIN_COUNT }>,
    /// The power state each CPU requests for each level of its ancestors.
    requested_states: [[AtomicU8; PsciPlatformImpl::MAX_POWER_LEVEL + 1]; PlatformImpl::CORE_COUNT],
}

impl PowerDomainTree {
    const CPU_DOMAIN_COUNT: usize = PlatformImpl::CORE_COUNT;
    const NON_CPU_DOMAIN_COUNT: usize =
        PsciPlatformImpl::POWER_DOMAIN_COUNT - Self::CPU_DOMAIN_COUNT;

    /// Create power domain tree based on the BFS format topology description.
    ///
    /// `topology[0]` is the number of root nodes, and every following entry is the number of
    /// children of the next node in BFS order. Every node starts off.
    pub fn new(topology: &[usize]) -> Self {
        assert_eq!(
            topology.first(),
            Some(&1),
            "Power domain tree must have a single root"
        );

        let mut non_cpu_power_nodes = ArrayVec::new();
        non_cpu_power_nodes.push(NonCpuPowerNode::new(None, PsciPlatformImpl::MAX_POWER_LEVEL));
        let mut cpu_parents = ArrayVec::new();
        let mut cpu_power_nodes = ArrayVec::new();

        for (index, &child_count) in topology.iter().enumerate().skip(1) {
            let parent_index = index - 1;
            let level = non_cpu_power_nodes[parent_index].level;
            for _ in 0..child_count {
                if level == PsciCompositePowerState::CPU_POWER_LEVEL + 1 {
                    let cpu_index = cpu_power_nodes.len();
                    cpu_parents.push(parent_index);
                    cpu_power_nodes.push(SpinMutex::new(CpuPowerNode::new()));
                    Self::assign_cpu(&mut non_cpu_power_nodes, parent_index, cpu_index);
                } else {
                    non_cpu_power_nodes.push(NonCpuPowerNode::new(Some(parent_index), level - 1));
                }
            }
        }

        // Check if the expected number of nodes has been created.
        assert_eq!(non_cpu_power_nodes.len(), Self::NON_CPU_DOMAIN_COUNT);
        assert_eq!(cpu_power_nodes.len(), Self::CPU_DOMAIN_COUNT);

        PowerDomainTree {
            non_cpu_power_nodes,
            cpu_parents,
            cpu_power_nodes,
            requested_states: core::array::from_fn(|_| {
                core::array::from_fn(|_| AtomicU8::new(PlatformPowerState::OFF.into()))
            }),
        }
    }

    /// Assigns the CPU to its ancestor non-CPU power domain node's CPU index range recursively.
    fn assign_cpu(
        non_cpu_power_nodes: &mut [NonCpuPowerNode],
        parent_index: usize,
        cpu_index: usize,
    ) {
        let node = &mut non_cpu_power_nodes[parent_index];
        node.assign_cpu(cpu_index);
        if let Some(parent_index) = node.parent {
            Self::assign_cpu(non_cpu_power_nodes, parent_index, cpu_index);
        }
    }

    /// Return a lock-guarded CPU node by its index.
    pub fn locked_cpu_node(&self, cpu_index: usize) -> SpinMutexGuard<'_, CpuPowerNode> {
        self.cpu_power_nodes[cpu_index].lock()
    }

    fn ancestors(&self, cpu_index: usize) -> Ancestors {
        let mut ancestors = ArrayVec::new();
        let mut parent = Some(self.cpu_parents[cpu_index]);
        while let Some(index) = parent {
            ancestors.push(index);
            parent = self.non_cpu_power_nodes[index].parent;
        }
        ancestors
    }

    fn store_requested_states(&self, cpu_index: usize, states: &PsciCompositePowerState) {
        for (request, state) in self.requested_states[cpu_index].iter().zip(states.states) {
            request.store(state.into(), Ordering::Release);
        }
    }

    /// Works out the deepest state the node may enter, which is the shallowest state any of its
    /// CPUs requested for the node's level.
    fn coordinated_state(&self, node: &NonCpuPowerNode) -> PlatformPowerState {
        node.cpu_range
            .clone()
            .map(|cpu_index| {
                let raw = self.requested_states[cpu_index][node.level].load(Ordering::Acquire);
                PlatformPowerState::try_from(raw)
                    .unwrap_or_else(|_| panic!("Invalid requested power state {raw}"))
            })
            .min()
            .unwrap_or(PlatformPowerState::OFF)
    }

    /// Walks up the tree from the CPU which is powering down with the given requested states,
    /// departing every ancestor for which this CPU was the last powered child and whose
    /// coordinated state is not RUN.
    ///
    /// The caller must hold the lock of the CPU node and have set its local state. `hook` is
    /// called with the highest departed level and the target states while the departed nodes are
    /// still locked. If it fails the tree is returned to its previous state and the error is
    /// returned.
    pub fn power_down<F, E>(
        &self,
        cpu_index: usize,
        requested: &PsciCompositePowerState,
        hook: F,
    ) -> Result<(usize, PsciCompositePowerState), E>
    where
        F: FnOnce(usize, &PsciCompositePowerState) -> Result<(), E>,
    {
        self.store_requested_states(cpu_index, requested);

        let ancestors = self.ancestors(cpu_index);
        let mut target_state = PsciCompositePowerState::RUN;
        target_state.states[PsciCompositePowerState::CPU_POWER_LEVEL] =
            requested.cpu_level_state();

        let mut departed = LockedNodes::new();
        for &index in &ancestors {
            let node = &self.non_cpu_power_nodes[index];
            if node.powered_children.fetch_sub(1, Ordering::AcqRel) != 1 {
                break;
            }
            #[cfg(test)]
            tests::before_departure_lock(self, index);

            let mut local_state = node.local_state.lock();
            // A sibling may have started powering up since the count reached zero, or may even
            // have powered down again and departed the node already.
            if node.powered_children.load(Ordering::Acquire) != 0
                || *local_state != PlatformPowerState::RUN
            {
                break;
            }

            let state = self.coordinated_state(node);
            if state == PlatformPowerState::RUN {
                break;
            }
            *local_state = state;
            target_state.states[node.level] = state;
            departed.push(local_state);
        }

        let level = departed.len();
        if let Err(error) = hook(level, &target_state) {
            self.store_requested_states(cpu_index, &PsciCompositePowerState::RUN);
            for &index in &ancestors[..level] {
                self.non_cpu_power_nodes[index]
                    .powered_children
                    .fetch_add(1, Ordering::AcqRel);
            }
            // The lowest node which stayed on may have been departed by another CPU meanwhile.
            let mut ignored = PsciCompositePowerState::RUN;
            let mut woken = self.climb(&ancestors[level..], &mut ignored);
            for local_state in woken.iter_mut().rev().chain(departed.iter_mut().rev()) {
                **local_state = PlatformPowerState::RUN;
            }
            return Err(error);
        }

        Ok((level, target_state))
    }

    /// Walks up the tree from a CPU which is coming back up, waking every departed ancestor on the
    /// way, from the highest level to the lowest.
    ///
    /// The caller must hold the lock of the CPU node. `f` is called with the highest woken level
    /// and the states the CPU and its ancestors were in, while the woken nodes are still locked.
    pub fn power_up<F>(&self, cpu_index: usize, cpu: &mut CpuPowerNode, f: F)
    where
        F: FnOnce(usize, &PsciCompositePowerState),
    {
        self.store_requested_states(cpu_index, &PsciCompositePowerState::RUN);

        let mut previous_state = PsciCompositePowerState::RUN;
        previous_state.states[PsciCompositePowerState::CPU_POWER_LEVEL] = cpu.local_state;

        let mut woken = self.climb(&self.ancestors(cpu_index), &mut previous_state);
        let level = woken.len();
        for local_state in woken.iter_mut().rev() {
            **local_state = PlatformPowerState::RUN;
        }
        cpu.local_state = PlatformPowerState::RUN;

        f(level, &previous_state);
    }

    /// Counts a child back in at each of the given nodes, and locks them for as long as they are
    /// departed. The states of the locked nodes are recorded in `previous_state`.
    fn climb(
        &self,
        nodes: &[usize],
        previous_state: &mut PsciCompositePowerState,
    ) -> LockedNodes<'_> {
        let mut locked = LockedNodes::new();
        for &index in nodes {
            let node = &self.non_cpu_power_nodes[index];
            node.powered_children.fetch_add(1, Ordering::AcqRel);

            let local_state = node.local_state.lock();
            if *local_state == PlatformPowerState::RUN {
                break;
            }
            previous_state.states[node.level] = *local_state;
            locked.push(local_state);
        }
        locked
    }

    /// Returns the aggregated affinity info of the power domain at `level` which contains the
    /// given CPU.
    ///
    /// A domain is on if any of its CPUs is on, otherwise it is pending if any CPU is pending.
    pub fn affinity_info(&self, cpu_index: usize, level: usize) -> AffinityInfo {
        let cpu_range = if level == PsciCompositePowerState::CPU_POWER_LEVEL {
            cpu_index..cpu_index + 1
        } else {
            let ancestors = self.ancestors(cpu_index);
            self.non_cpu_power_nodes[ancestors[level - 1]].cpu_range.clone()
        };

        let mut affinity_info = AffinityInfo::Off;
        for cpu in &self.cpu_power_nodes[cpu_range] {
            match cpu.lock().state.affinity_info() {
                AffinityInfo::On => return AffinityInfo::On,
                AffinityInfo::OnPending => affinity_info = AffinityInfo::OnPending,
                AffinityInfo::Off => {}
            }
        }
        affinity_info
    }

    /// Panics if a departed node contains an ON CPU or a running child node, or if any child count
    /// is wrong.
    ///
    /// Takes every lock in the tree, so the check sees a consistent state even while other threads
    /// are powering CPUs up and down.
    #[cfg(test)]
    pub fn check_hierarchy(&self) {
        let cpus: Vec<_> = self.cpu_power_nodes.iter().map(|cpu| cpu.lock()).collect();
        // Higher indices are never on a higher level in BFS order.
        let mut nodes: Vec<_> = self
            .non_cpu_power_nodes
            .iter()
            .rev()
            .map(|node| *node.local_state.lock())
            .collect();
        nodes.reverse();

        for (index, node) in self.non_cpu_power_nodes.iter().enumerate() {
            let child_nodes: Vec<_> = (0..nodes.len())
                .filter(|&child| self.non_cpu_power_nodes[child].parent == Some(index))
                .collect();
            let child_cpus: Vec<_> = (0..cpus.len())
                .filter(|&cpu| self.cpu_parents[cpu] == index)
                .collect();

            let powered = child_nodes
                .iter()
                .filter(|&&child| nodes[child] == PlatformPowerState::RUN)
                .count()
                + child_cpus
                    .iter()
                    .filter(|&&cpu| cpus[cpu].state == CpuPowerState::On)
                    .count();
            assert_eq!(
                node.powered_children.load(Ordering::Acquire),
                powered,
                "Wrong powered child count of node {index}"
            );

            if nodes[index] != PlatformPowerState::RUN {
                for cpu in node.cpu_range.clone() {
                    assert_ne!(
                        cpus[cpu].state,
                        CpuPowerState::On,
                        "CPU {cpu} is on in departed node {index}"
                    );
                }
                for child in child_nodes {
                    assert_ne!(
                        nodes[child],
                        PlatformPowerState::RUN,
                        "Node {child} is running in departed node {index}"
                    );
                }
            }
        }
    }
}

impl Debug for PowerDomainTree {
    /// Outputs the tree in Graphviz DOT format.
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        writeln!(f, "digraph {{")?;
        for (index, node) in self.non_cpu_power_nodes.iter().enumerate() {
            if let Some(local_state) = node.local_state.try_lock() {
                writeln!(
                    f,
                    "NC{index} [label=\"level {} cpus {:?}\\n{:?} powered {}\"]",
                    node.level,
                    node.cpu_range,
                    *local_state,
                    node.powered_children.load(Ordering::Relaxed)
                )?;
            } else {
                writeln!(f, "NC{index} [label=\"NonCpuPowerNode is locked\"]")?;
            }
            if let Some(parent) = node.parent {
                writeln!(f, "NC{parent} -> NC{index}")?;
            }
        }

        for (index, (cpu, parent)) in self.cpu_power_nodes.iter().zip(&self.cpu_parents).enumerate()
        {
            if let Some(c) = cpu.try_lock() {
                writeln!(f, "C{index} [label=\"{c:#?}\"]")?;
            } else {
                writeln!(f, "C{index} [label=\"CpuPowerNode is locked\"]")?;
            }
            writeln!(f, "NC{parent} -> C{index}")?;
        }

        writeln!(f, "}}")?;

        Ok(())
    }
}
