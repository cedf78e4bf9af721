//! Zone selection for collections started with [`GcScope::Auto`].

use std::fmt::Debug;

use crate::gc::incremental::GcScope;
use crate::runtime::GcRuntime;
use crate::zone::ZoneId;

/// What a policy sees of one zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneUsage {
    /// The zone.
    pub zone: ZoneId,
    /// Bytes held by allocated tenured cells.
    pub live_bytes: usize,
    /// Tenured bytes allocated since the zone was last collected.
    pub allocated_since_gc: usize,
    /// Whether `schedulezone` asked for this zone.
    pub scheduled: bool,
    /// Whether this is the atoms zone.
    pub is_atoms: bool,
}

/// Picks the zones an automatic collection covers.
pub trait ZonePolicy: Send + Debug {
    /// Returns the scope to collect. `GcScope::Auto` is treated as full.
    fn select(&self, zones: &[ZoneUsage]) -> GcScope;
}

/// Collects the scheduled zones if there are any, otherwise everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllZones;

impl ZonePolicy for AllZones {
    fn select(&self, zones: &[ZoneUsage]) -> GcScope {
        let scheduled: Vec<ZoneId> = zones
            .iter()
            .filter(|z| z.scheduled && !z.is_atoms)
            .map(|z| z.zone)
            .collect();
        if scheduled.is_empty() {
            GcScope::Full
        } else {
            GcScope::Zones(scheduled)
        }
    }
}

/// Collects zones that allocated more than `bytes` since their last
/// collection, plus scheduled ones. Falls back to a full collection when
/// no zone qualifies.
#[derive(Debug, Clone, Copy)]
pub struct AllocationThreshold {
    /// Allocation volume that makes a zone eligible.
    pub bytes: usize,
}

impl ZonePolicy for AllocationThreshold {
    fn select(&self, zones: &[ZoneUsage]) -> GcScope {
        let picked: Vec<ZoneId> = zones
            .iter()
            .filter(|z| !z.is_atoms)
            .filter(|z| z.scheduled || z.allocated_since_gc > self.bytes)
            .map(|z| z.zone)
            .collect();
        if picked.is_empty() {
            GcScope::Full
        } else {
            GcScope::Zones(picked)
        }
    }
}

impl GcRuntime {
    /// Replaces the policy used for automatic collections.
    pub fn set_zone_policy(&mut self, policy: impl ZonePolicy + 'static) {
        self.policy = Box::new(policy);
    }

    pub(crate) fn zone_usage(&self) -> Vec<ZoneUsage> {
        self.zones
            .iter()
            .map(|z| ZoneUsage {
                zone: z.id(),
                live_bytes: z.live_bytes(),
                allocated_since_gc: z.allocated_since_gc(),
                scheduled: z.scheduled,
                is_atoms: z.is_atoms(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(zone: u16, allocated: usize, scheduled: bool) -> ZoneUsage {
        ZoneUsage {
            zone: ZoneId(zone),
            live_bytes: 0,
            allocated_since_gc: allocated,
            scheduled,
            is_atoms: zone == 0,
        }
    }

    #[test]
    fn test_all_zones_prefers_scheduled() {
        let zones = [usage(0, 0, true), usage(1, 0, false), usage(2, 0, true)];
        assert_eq!(AllZones.select(&zones), GcScope::Zones(vec![ZoneId(2)]));
        assert_eq!(AllZones.select(&[usage(1, 0, false)]), GcScope::Full);
    }

    #[test]
    fn test_allocation_threshold() {
        let policy = AllocationThreshold { bytes: 1000 };
        let zones = [usage(0, 5000, false), usage(1, 2000, false), usage(2, 10, false)];
        assert_eq!(policy.select(&zones), GcScope::Zones(vec![ZoneId(1)]));

        let quiet = [usage(1, 10, false), usage(2, 10, false)];
        assert_eq!(policy.select(&quiet), GcScope::Full);
    }
}
