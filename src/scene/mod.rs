//! The scene graph: stacking order, per-window state and damage tracking.
//!
//! Windows live in an arena of generation-tagged slots. Removing a window
//! that an effect still animates turns the slot into a read-only remnant;
//! the storage is freed only once every animation handle is gone. Stale ids
//! fail the generation check instead of dangling.

use std::cell::Cell;
use std::rc::Rc;

use crate::output::Output;
use crate::utils::geometry::{Logical, Point};
use crate::utils::region::Region;

pub mod damage;
pub mod window;

pub use damage::DamageMap;
pub use window::{Window, WindowFlags, WindowId};

enum SlotState {
    Vacant,
    Live(Window),
    /// Logically destroyed, kept for in-flight removal animations.
    Remnant(Window),
}

struct Slot {
    generation: u32,
    state: SlotState,
    /// Number of live [`RemnantRef`]s for this slot.
    refs: Rc<Cell<u32>>,
}

/// Keeps a removed window's slot alive.
///
/// Effects take one of these when they start a removal animation and drop
/// it when the animation finishes; the scene frees the slot afterwards.
pub struct RemnantRef {
    id: WindowId,
    refs: Rc<Cell<u32>>,
}

impl RemnantRef {
    pub fn id(&self) -> WindowId {
        self.id
    }
}

impl Clone for RemnantRef {
    fn clone(&self) -> Self {
        self.refs.set(self.refs.get() + 1);
        Self {
            id: self.id,
            refs: self.refs.clone(),
        }
    }
}

impl Drop for RemnantRef {
    fn drop(&mut self) {
        self.refs.set(self.refs.get().saturating_sub(1));
    }
}

pub struct Scene {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Bottom to top; painting walks it forwards, hit testing backwards.
    stacking: Vec<WindowId>,
    damage: DamageMap,
}

impl Scene {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            stacking: Vec::new(),
            damage: DamageMap::new(),
        }
    }

    // =========================================================================
    // Outputs
    // =========================================================================

    pub fn add_output(&mut self, output: &Output) {
        self.damage.add_output(output);
        // Everything overlapping the new output needs a first paint.
        self.damage
            .damage_output_fully(output);
    }

    pub fn remove_output(&mut self, output: &Output) {
        self.damage.remove_output(output);
    }

    pub fn damage_map(&mut self) -> &mut DamageMap {
        &mut self.damage
    }

    pub fn damage_pending(&self, output: &Output) -> bool {
        self.damage.pending(output)
    }

    pub fn take_damage(&mut self, output: &Output) -> Region<Logical> {
        self.damage.take(output)
    }

    // =========================================================================
    // Window lifecycle
    // =========================================================================

    /// Inserts a window at the top of the stack.
    pub fn add_window(&mut self, window: Window) -> WindowId {
        let full_damage = Region::from_rect(window.bounds());

        let id = match self.free.pop() {
            Some(slot) => {
                let entry = &mut self.slots[slot as usize];
                entry.state = SlotState::Live(window);
                entry.refs = Rc::new(Cell::new(0));
                WindowId {
                    slot,
                    generation: entry.generation,
                }
            }
            None => {
                let slot = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    state: SlotState::Live(window),
                    refs: Rc::new(Cell::new(0)),
                });
                WindowId {
                    slot,
                    generation: 0,
                }
            }
        };

        self.stacking.push(id);
        self.damage.damage(&full_damage);
        id
    }

    /// Removes a window from the stack.
    ///
    /// If any [`RemnantRef`] is held, the window stays queryable (and
    /// paintable) as a read-only remnant until the last reference drops.
    /// Unknown ids are a no-op.
    pub fn remove_window(&mut self, id: WindowId) {
        let Some(slot) = self.slot_mut(id) else {
            debug!("remove_window: unknown window {id:?}");
            return;
        };

        let keep_as_remnant = slot.refs.get() > 0;
        let state = std::mem::replace(&mut slot.state, SlotState::Vacant);

        match state {
            SlotState::Live(window) => {
                let bounds = window.bounds();
                if keep_as_remnant {
                    self.slots[id.slot as usize].state = SlotState::Remnant(window);
                } else {
                    self.free_slot(id);
                }
                self.damage.damage(&Region::from_rect(bounds));
            }
            state => {
                // Removing a remnant again is a no-op.
                self.slots[id.slot as usize].state = state;
            }
        }
    }

    /// Takes a reference that keeps the window's slot alive past removal.
    pub fn retain(&mut self, id: WindowId) -> Option<RemnantRef> {
        let slot = self.slot(id)?;
        if matches!(slot.state, SlotState::Vacant) {
            return None;
        }

        slot.refs.set(slot.refs.get() + 1);
        Some(RemnantRef {
            id,
            refs: slot.refs.clone(),
        })
    }

    /// Remnants whose last reference is gone, ready for final teardown.
    pub fn expired_remnants(&self) -> Vec<WindowId> {
        self.stacking
            .iter()
            .copied()
            .filter(|&id| {
                let slot = &self.slots[id.slot as usize];
                matches!(slot.state, SlotState::Remnant(_)) && slot.refs.get() == 0
            })
            .collect()
    }

    /// Frees a remnant's slot for good.
    pub fn destroy(&mut self, id: WindowId) {
        let Some(slot) = self.slot_mut(id) else {
            return;
        };

        match std::mem::replace(&mut slot.state, SlotState::Vacant) {
            SlotState::Remnant(window) => {
                let bounds = window.bounds();
                self.free_slot(id);
                self.damage.damage(&Region::from_rect(bounds));
            }
            state @ SlotState::Live(_) => {
                // Live windows go through remove_window.
                warn!("destroy called on a live window {id:?}");
                self.slots[id.slot as usize].state = state;
            }
            SlotState::Vacant => (),
        }
    }

    fn free_slot(&mut self, id: WindowId) {
        let slot = &mut self.slots[id.slot as usize];
        slot.state = SlotState::Vacant;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.slot);
        self.stacking.retain(|&other| other != id);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    fn slot(&self, id: WindowId) -> Option<&Slot> {
        let slot = self.slots.get(id.slot as usize)?;
        (slot.generation == id.generation).then_some(slot)
    }

    fn slot_mut(&mut self, id: WindowId) -> Option<&mut Slot> {
        let slot = self.slots.get_mut(id.slot as usize)?;
        (slot.generation == id.generation).then_some(slot)
    }

    /// Looks up a window, remnants included.
    pub fn window(&self, id: WindowId) -> Option<&Window> {
        match &self.slot(id)?.state {
            SlotState::Live(window) | SlotState::Remnant(window) => Some(window),
            SlotState::Vacant => None,
        }
    }

    /// Mutable access to a live window. Remnants are read-only.
    pub fn window_mut(&mut self, id: WindowId) -> Option<&mut Window> {
        match &mut self.slot_mut(id)?.state {
            SlotState::Live(window) => Some(window),
            _ => None,
        }
    }

    pub fn is_remnant(&self, id: WindowId) -> bool {
        matches!(
            self.slot(id).map(|s| &s.state),
            Some(SlotState::Remnant(_)),
        )
    }

    /// Stacking order, bottom to top.
    pub fn stacking(&self) -> &[WindowId] {
        &self.stacking
    }

    // =========================================================================
    // Stacking and damage
    // =========================================================================

    /// Moves a window to `position` in the stack (0 is the bottom).
    pub fn restack(&mut self, id: WindowId, position: usize) {
        let Some(current) = self.stacking.iter().position(|&other| other == id) else {
            debug!("restack: unknown window {id:?}");
            return;
        };

        let position = position.min(self.stacking.len() - 1);
        if position == current {
            return;
        }

        let id = self.stacking.remove(current);
        self.stacking.insert(position, id);

        // Occlusion below and above may have changed; repaint its area.
        if let Some(window) = self.window(id) {
            self.damage.damage(&Region::from_rect(window.bounds()));
        }
    }

    /// Unions window-local damage into the window and into every output the
    /// window overlaps. Effects also use this to request repaints for their
    /// animation frames.
    pub fn mark_damaged(&mut self, id: WindowId, region: &Region<Logical>) {
        let Some(slot) = self.slot_mut(id) else {
            debug!("mark_damaged: unknown window {id:?}");
            return;
        };

        let window = match &mut slot.state {
            SlotState::Live(window) => window,
            SlotState::Remnant(window) => window,
            SlotState::Vacant => return,
        };

        window.add_damage(region);
        let origin = window.geometry().loc;
        let global = region.translated(Point::new(origin.x.floor() as i32, origin.y.floor() as i32));
        self.damage.damage(&global);
    }

    /// Clears a window's accumulated damage once it has been painted.
    pub fn clear_pending_damage(&mut self, id: WindowId) {
        if let Some(slot) = self.slot_mut(id) {
            match &mut slot.state {
                SlotState::Live(window) | SlotState::Remnant(window) => {
                    let _ = window.take_damage();
                }
                SlotState::Vacant => (),
            }
        }
    }

    /// Damages the window's whole current extent.
    pub fn mark_fully_damaged(&mut self, id: WindowId) {
        let Some(window) = self.window(id) else {
            return;
        };
        let bounds = window.bounds();
        let local = Region::from_rect(bounds.translated(Point::new(-bounds.left(), -bounds.top())));
        self.mark_damaged(id, &local);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::output::Mode;
    use crate::utils::geometry::{Rect, Size};

    fn test_output() -> Output {
        Output::new("TEST-1", Mode::new(Size::new(1920, 1080), Some(60.)))
    }

    fn window_at(x: f64, y: f64, w: f64, h: f64) -> Window {
        Window::new(Rect::from_loc_and_size((x, y), (w, h)))
    }

    #[test]
    fn damage_accumulates_as_union() {
        let mut scene = Scene::new();
        let output = test_output();
        scene.add_output(&output);
        let _ = scene.take_damage(&output);

        let id = scene.add_window(window_at(0., 0., 800., 600.));
        let _ = scene.take_damage(&output);

        scene.mark_damaged(id, &Region::from_rect(Rect::from_loc_and_size((0, 0), (50, 50))));
        scene.mark_damaged(id, &Region::from_rect(Rect::from_loc_and_size((25, 25), (50, 50))));
        scene.mark_damaged(id, &Region::from_rect(Rect::from_loc_and_size((0, 0), (50, 50))));

        let damage = scene.take_damage(&output);
        assert_eq!(damage.area(), 50 * 50 * 2 - 25 * 25);

        // Snapshot clears the accumulation.
        assert!(!scene.damage_pending(&output));
    }

    #[test]
    fn stacking_is_unique_and_total() {
        let mut scene = Scene::new();
        let a = scene.add_window(window_at(0., 0., 10., 10.));
        let b = scene.add_window(window_at(0., 0., 10., 10.));
        let c = scene.add_window(window_at(0., 0., 10., 10.));

        assert_eq!(scene.stacking(), &[a, b, c]);

        scene.restack(c, 0);
        assert_eq!(scene.stacking(), &[c, a, b]);

        scene.restack(c, 99);
        assert_eq!(scene.stacking(), &[a, b, c]);

        scene.remove_window(b);
        assert_eq!(scene.stacking(), &[a, c]);
    }

    #[test]
    fn remnant_lifecycle() {
        let mut scene = Scene::new();
        let id = scene.add_window(window_at(10., 10., 100., 100.));

        let handle = scene.retain(id).unwrap();
        scene.remove_window(id);

        // Still queryable while the animation holds a reference.
        assert!(scene.is_remnant(id));
        let window = scene.window(id).unwrap();
        assert_eq!(window.bounds(), Rect::from_loc_and_size((10, 10), (100, 100)));
        // But read-only.
        assert!(scene.window_mut(id).is_none());
        assert!(scene.expired_remnants().is_empty());

        drop(handle);
        assert_eq!(scene.expired_remnants(), vec![id]);
        scene.destroy(id);

        // The id is gone for good.
        assert!(scene.window(id).is_none());
        assert!(!scene.is_remnant(id));

        // The slot is reused with a fresh generation.
        let next = scene.add_window(window_at(0., 0., 1., 1.));
        assert_eq!(next.slot, id.slot);
        assert_ne!(next.generation, id.generation);
        assert!(scene.window(id).is_none());
    }

    #[test]
    fn remove_unknown_window_is_a_noop() {
        let mut scene = Scene::new();
        let id = scene.add_window(window_at(0., 0., 1., 1.));
        scene.remove_window(id);
        // Second removal hits a freed slot.
        scene.remove_window(id);
        assert!(scene.stacking().is_empty());
    }

    #[test]
    fn clone_of_remnant_ref_keeps_slot_alive() {
        let mut scene = Scene::new();
        let id = scene.add_window(window_at(0., 0., 1., 1.));

        let first = scene.retain(id).unwrap();
        let second = first.clone();
        scene.remove_window(id);

        drop(first);
        assert!(scene.expired_remnants().is_empty());
        drop(second);
        assert_eq!(scene.expired_remnants(), vec![id]);
    }
}
