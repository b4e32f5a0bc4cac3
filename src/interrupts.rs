// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Interrupt routing between EL3 and the lower ELs of each world.

use crate::context::World;
use arm_sysregs::ScrEl3;

/// Configures which interrupts are routed to EL3 while the given world is running.
///
/// FIQs are the secure group 0/1 interrupts, so while a non-secure world runs they are taken to
/// EL3 and the secure world can be scheduled to handle them. While the secure world runs both IRQs
/// and FIQs stay with it.
pub fn set_routing_model(scr_el3: &mut ScrEl3, world: World) {
    match world {
        World::NonSecure => {
            *scr_el3 |= ScrEl3::FIQ;
            *scr_el3 -= ScrEl3::IRQ;
        }
        World::Secure => {
            *scr_el3 -= ScrEl3::IRQ;
            *scr_el3 -= ScrEl3::FIQ;
        }
        #[cfg(feature = "rme")]
        World::Realm => {
            *scr_el3 |= ScrEl3::FIQ;
            *scr_el3 -= ScrEl3::IRQ;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_depends_only_on_world() {
        let mut scr = ScrEl3::NS | ScrEl3::IRQ;
        set_routing_model(&mut scr, World::NonSecure);
        assert_eq!(scr, ScrEl3::NS | ScrEl3::FIQ);

        set_routing_model(&mut scr, World::Secure);
        assert_eq!(scr, ScrEl3::NS);

        // Idempotent.
        set_routing_model(&mut scr, World::Secure);
        assert_eq!(scr, ScrEl3::NS);
    }
}
