//! Work-group selection.
//!
//! Tuning is a pluggable strategy: [`crate::Operation::tune`] hands the grid
//! and the device limits to a [`WorkGroupPicker`] and stores whatever it
//! returns, after checking it against the limits.

use crate::gpu::device::volume;
use crate::{DeviceLimits, DEFAULT_WORK_GROUP};
use glam::UVec3;

/// Environment variable selecting the default [`TuningType`].
pub const TUNING_ENV: &str = "KILN_TUNING";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TuningType {
    /// Search every candidate shape.
    #[default]
    Exhaustive,
    /// Shrink the default shape to the grid without searching.
    Fast,
}

impl TuningType {
    /// Reads `KILN_TUNING` (`fast` or `exhaustive`). Unset or unrecognised
    /// values fall back to exhaustive.
    pub fn from_env() -> Self {
        match std::env::var(TUNING_ENV) {
            Ok(v) => Self::parse(&v).unwrap_or_else(|| {
                log::warn!("Ignoring unrecognised {TUNING_ENV}={v}");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Some(TuningType::Fast),
            "exhaustive" => Some(TuningType::Exhaustive),
            _ => None,
        }
    }
}

/// Chooses a work-group shape for a grid.
pub trait WorkGroupPicker: Send + Sync {
    fn pick(&self, grid: UVec3, limits: &DeviceLimits, tuning_type: TuningType) -> UVec3;
}

/// Picks the shape with the lowest predicted cost, where cost is the number of
/// launched threads (padding included) plus a fixed overhead per work-group.
#[derive(Debug, Clone, Copy)]
pub struct CostModelPicker {
    pub group_overhead: u64,
}

impl Default for CostModelPicker {
    fn default() -> Self {
        DEFAULT_PICKER
    }
}

static DEFAULT_PICKER: CostModelPicker = CostModelPicker { group_overhead: 32 };

impl CostModelPicker {
    pub fn cost(&self, grid: UVec3, work_group: UVec3) -> u64 {
        let groups = (grid.max(UVec3::ONE) + work_group - UVec3::ONE) / work_group;
        let threads = volume(groups * work_group);
        threads + volume(groups) * self.group_overhead
    }

    fn candidates(limits: &DeviceLimits) -> Vec<UVec3> {
        let pow2 = |max: u32| {
            std::iter::successors(Some(1u32), |v| v.checked_mul(2)).take_while(move |v| *v <= max)
        };
        let max = limits.max_work_group_size;
        let mut out = vec![];
        for x in pow2(max.x) {
            for y in pow2(max.y) {
                for z in pow2(max.z) {
                    let wg = UVec3::new(x, y, z);
                    if limits.allows(wg) {
                        out.push(wg);
                    }
                }
            }
        }
        out
    }

    fn exhaustive(&self, grid: UVec3, limits: &DeviceLimits) -> UVec3 {
        let mut best: Option<(u64, UVec3)> = None;
        for wg in Self::candidates(limits) {
            let cost = self.cost(grid, wg);
            let better = match best {
                None => true,
                Some((best_cost, best_wg)) => {
                    cost < best_cost
                        || (cost == best_cost
                            && (volume(wg), wg.x) > (volume(best_wg), best_wg.x))
                }
            };
            if better {
                best = Some((cost, wg));
            }
        }
        best.map(|(_, wg)| wg)
            .unwrap_or_else(|| limits.clamp(DEFAULT_WORK_GROUP))
    }

    fn fast(&self, grid: UVec3) -> UVec3 {
        let fit = |d: u32, g: u32| d.min(g.max(1).next_power_of_two());
        UVec3::new(
            fit(DEFAULT_WORK_GROUP.x, grid.x),
            fit(DEFAULT_WORK_GROUP.y, grid.y),
            fit(DEFAULT_WORK_GROUP.z, grid.z),
        )
    }
}

impl WorkGroupPicker for CostModelPicker {
    fn pick(&self, grid: UVec3, limits: &DeviceLimits, tuning_type: TuningType) -> UVec3 {
        match tuning_type {
            TuningType::Exhaustive => self.exhaustive(grid, limits),
            TuningType::Fast => limits.clamp(self.fast(grid)),
        }
    }
}

/// Everything [`crate::Operation::tune`] needs.
#[derive(Clone, Copy)]
pub struct TuningParameters<'a> {
    pub tuning_type: TuningType,
    pub limits: &'a DeviceLimits,
    pub picker: &'a dyn WorkGroupPicker,
}

impl std::fmt::Debug for TuningParameters<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TuningParameters")
            .field("tuning_type", &self.tuning_type)
            .field("limits", &self.limits)
            .finish()
    }
}

impl<'a> TuningParameters<'a> {
    /// Default cost model, tuning type taken from the environment.
    pub fn new(limits: &'a DeviceLimits) -> Self {
        Self {
            tuning_type: TuningType::from_env(),
            limits,
            picker: &DEFAULT_PICKER,
        }
    }

    pub fn with_picker(mut self, picker: &'a dyn WorkGroupPicker) -> Self {
        self.picker = picker;
        self
    }

    pub fn with_tuning_type(mut self, tuning_type: TuningType) -> Self {
        self.tuning_type = tuning_type;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_strategy::{proptest, Arbitrary};

    #[derive(Arbitrary, Debug)]
    struct GridProblem {
        #[strategy(1..=4096u32)]
        x: u32,
        #[strategy(1..=2048u32)]
        y: u32,
        #[strategy(1..=64u32)]
        z: u32,
        fast: bool,
    }

    #[proptest(cases = 64)]
    fn test_pick_within_limits(prob: GridProblem) {
        let limits = DeviceLimits::default();
        let tuning_type = if prob.fast {
            TuningType::Fast
        } else {
            TuningType::Exhaustive
        };
        let wg = CostModelPicker::default().pick(
            UVec3::new(prob.x, prob.y, prob.z),
            &limits,
            tuning_type,
        );
        assert!(volume(wg) <= 256);
        assert!(limits.allows(wg));
    }

    #[test]
    fn test_exhaustive_avoids_padding() {
        let limits = DeviceLimits::default();
        let wg = CostModelPicker::default().pick(
            UVec3::new(64, 64, 1),
            &limits,
            TuningType::Exhaustive,
        );
        assert_eq!(wg.z, 1);
        assert_eq!(volume(wg), 256);
    }

    #[test]
    fn test_fast_shrinks_to_grid() {
        let limits = DeviceLimits::default();
        let wg = CostModelPicker::default().pick(UVec3::new(2, 1, 1), &limits, TuningType::Fast);
        assert_eq!(wg, UVec3::new(2, 1, 1));
    }

    #[test]
    fn test_parse_tuning_type() {
        assert_eq!(TuningType::parse("FAST"), Some(TuningType::Fast));
        assert_eq!(TuningType::parse(" exhaustive"), Some(TuningType::Exhaustive));
        assert_eq!(TuningType::parse("slow"), None);
    }
}
