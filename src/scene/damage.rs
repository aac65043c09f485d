//! Per-output frame damage.

use std::collections::HashMap;

use crate::output::Output;
use crate::utils::geometry::Logical;
use crate::utils::region::Region;

/// Accumulates damage per output until the render loop snapshots it.
///
/// Damage added while a frame is being composited lands in the map again
/// and is picked up by the next frame, never the in-flight one.
#[derive(Debug, Default)]
pub struct DamageMap {
    map: HashMap<Output, Region<Logical>>,
}

impl DamageMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_output(&mut self, output: &Output) {
        self.map.entry(output.clone()).or_default();
    }

    pub fn remove_output(&mut self, output: &Output) {
        self.map.remove(output);
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Output> {
        self.map.keys()
    }

    /// Unions a global region into the damage of every output it touches.
    pub fn damage(&mut self, region: &Region<Logical>) {
        for (output, damage) in &mut self.map {
            let clipped = region.intersect_rect(output.geometry());
            if !clipped.is_empty() {
                damage.union(&clipped);
            }
        }
    }

    pub fn damage_output(&mut self, output: &Output, region: &Region<Logical>) {
        if let Some(damage) = self.map.get_mut(output) {
            let clipped = region.intersect_rect(output.geometry());
            if !clipped.is_empty() {
                damage.union(&clipped);
            }
        }
    }

    pub fn damage_output_fully(&mut self, output: &Output) {
        if let Some(damage) = self.map.get_mut(output) {
            *damage = Region::from_rect(output.geometry());
        }
    }

    pub fn pending(&self, output: &Output) -> bool {
        self.map.get(output).is_some_and(|d| !d.is_empty())
    }

    /// Snapshots and clears the damage for one output.
    pub fn take(&mut self, output: &Output) -> Region<Logical> {
        self.map
            .get_mut(output)
            .map(std::mem::take)
            .unwrap_or_default()
    }
}
