//! Pixel-aligned damage regions.
//!
//! A region is a set of pairwise-disjoint rectangles. All mutating
//! operations preserve that invariant, so painting a region never touches
//! the same pixel twice and region area is the sum of rectangle areas.

use std::fmt;

use crate::utils::geometry::{Logical, Physical, Point, Rect};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region<Kind> {
    rects: Vec<Rect<i32, Kind>>,
}

impl<Kind: Copy> Region<Kind> {
    pub fn new() -> Self {
        Self { rects: Vec::new() }
    }

    pub fn from_rect(rect: Rect<i32, Kind>) -> Self {
        let mut region = Self::new();
        region.add_rect(rect);
        region
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn rects(&self) -> &[Rect<i32, Kind>] {
        &self.rects
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    pub fn bounding_box(&self) -> Rect<i32, Kind> {
        self.rects
            .iter()
            .copied()
            .reduce(Rect::merge)
            .unwrap_or_default()
    }

    pub fn area(&self) -> u64 {
        self.rects
            .iter()
            .map(|r| r.size.w as u64 * r.size.h as u64)
            .sum()
    }

    pub fn contains_point(&self, point: Point<i32, Kind>) -> bool {
        self.rects.iter().any(|r| r.contains(point))
    }

    /// Whether the region fully covers `rect`.
    pub fn contains_rect(&self, rect: Rect<i32, Kind>) -> bool {
        if rect.is_empty() {
            return true;
        }

        let mut pending = vec![rect];
        for &existing in &self.rects {
            pending = pending
                .into_iter()
                .flat_map(|frag| subtract_rect(frag, existing))
                .collect();
            if pending.is_empty() {
                return true;
            }
        }
        false
    }

    pub fn add_rect(&mut self, rect: Rect<i32, Kind>) {
        if rect.is_empty() {
            return;
        }

        // Split the incoming rectangle against what we already have, then
        // keep only the parts not yet covered.
        let mut pending = vec![rect];
        for &existing in &self.rects {
            pending = pending
                .into_iter()
                .flat_map(|frag| subtract_rect(frag, existing))
                .collect();
            if pending.is_empty() {
                return;
            }
        }
        self.rects.extend(pending);
    }

    pub fn union(&mut self, other: &Self) {
        for &rect in &other.rects {
            self.add_rect(rect);
        }
    }

    pub fn subtract_rect(&mut self, rect: Rect<i32, Kind>) {
        if rect.is_empty() {
            return;
        }

        self.rects = self
            .rects
            .iter()
            .flat_map(|&r| subtract_rect(r, rect))
            .collect();
    }

    pub fn subtract(&mut self, other: &Self) {
        for &rect in &other.rects {
            self.subtract_rect(rect);
        }
    }

    pub fn intersect_rect(&self, rect: Rect<i32, Kind>) -> Self {
        Self {
            rects: self
                .rects
                .iter()
                .filter_map(|r| r.intersection(rect))
                .collect(),
        }
    }

    pub fn intersection(&self, other: &Self) -> Self {
        let mut result = Self::new();
        for &rect in &other.rects {
            // Pieces from disjoint input rectangles stay disjoint.
            result.rects.extend(self.intersect_rect(rect).rects);
        }
        result
    }

    pub fn translated(&self, by: Point<i32, Kind>) -> Self {
        Self {
            rects: self.rects.iter().map(|r| r.translated(by)).collect(),
        }
    }
}

impl Region<Logical> {
    /// Scales to physical pixels, rounding each rectangle outwards.
    pub fn to_physical(&self, scale: f64) -> Region<Physical> {
        let mut result = Region::new();
        for &rect in &self.rects {
            // Outward rounding can make neighbours overlap, so re-add.
            result.add_rect(rect.to_f64().to_physical(scale).to_i32_outward());
        }
        result
    }
}

/// `a` minus `b` as up to four disjoint bands.
fn subtract_rect<Kind: Copy>(a: Rect<i32, Kind>, b: Rect<i32, Kind>) -> Vec<Rect<i32, Kind>> {
    let Some(overlap) = a.intersection(b) else {
        return vec![a];
    };
    if overlap == a {
        return vec![];
    }

    let mut out = Vec::with_capacity(4);

    // Above and below the overlap, full width.
    if overlap.top() > a.top() {
        out.push(Rect::from_extents(a.left(), a.top(), a.right(), overlap.top()));
    }
    if overlap.bottom() < a.bottom() {
        out.push(Rect::from_extents(
            a.left(),
            overlap.bottom(),
            a.right(),
            a.bottom(),
        ));
    }
    // Left and right, clamped to the overlap band.
    if overlap.left() > a.left() {
        out.push(Rect::from_extents(
            a.left(),
            overlap.top(),
            overlap.left(),
            overlap.bottom(),
        ));
    }
    if overlap.right() < a.right() {
        out.push(Rect::from_extents(
            overlap.right(),
            overlap.top(),
            a.right(),
            overlap.bottom(),
        ));
    }

    out
}

impl<Kind: Copy> fmt::Display for Region<Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rects = self.rects.clone();
        rects.sort_by_key(|r| (r.top(), r.left()));

        let mut first = true;
        for rect in rects {
            if !first {
                write!(f, "; ")?;
            }
            first = false;
            write!(
                f,
                "({}, {}) {}x{}",
                rect.left(),
                rect.top(),
                rect.size.w,
                rect.size.h
            )?;
        }
        if first {
            write!(f, "empty")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;
    use proptest::prelude::*;

    use super::*;

    fn rect(x: i32, y: i32, w: i32, h: i32) -> Rect<i32, Logical> {
        Rect::from_loc_and_size((x, y), (w, h))
    }

    #[test]
    fn union_is_idempotent() {
        let mut region = Region::new();
        region.add_rect(rect(0, 0, 100, 100));
        region.add_rect(rect(0, 0, 100, 100));
        region.add_rect(rect(10, 10, 10, 10));

        assert_eq!(region.area(), 100 * 100);
        assert_eq!(region.bounding_box(), rect(0, 0, 100, 100));
    }

    #[test]
    fn subtract_splits_into_bands() {
        let mut region = Region::from_rect(rect(0, 0, 100, 100));
        region.subtract_rect(rect(25, 25, 50, 50));

        assert_eq!(region.area(), 100 * 100 - 50 * 50);
        assert!(!region.contains_point(Point::new(50, 50)));
        assert!(region.contains_point(Point::new(10, 50)));
    }

    #[test]
    fn contains_rect_across_fragments() {
        let mut region = Region::new();
        region.add_rect(rect(0, 0, 50, 100));
        region.add_rect(rect(50, 0, 50, 100));

        // Covered, but only by two rectangles together.
        assert!(region.contains_rect(rect(25, 25, 50, 50)));
        assert!(!region.contains_rect(rect(75, 25, 50, 50)));
    }

    #[test]
    fn display_sorted() {
        let mut region = Region::new();
        region.add_rect(rect(50, 50, 10, 10));
        region.add_rect(rect(0, 0, 10, 10));

        assert_snapshot!(region.to_string(), @"(0, 0) 10x10; (50, 50) 10x10");
        assert_snapshot!(Region::<Logical>::new().to_string(), @"empty");
    }

    #[test]
    fn physical_scaling_rounds_outwards() {
        let region = Region::from_rect(rect(1, 1, 3, 3));
        let physical = region.to_physical(1.5);
        assert_eq!(physical.bounding_box(), Rect::from_extents(1, 1, 6, 6));
    }

    fn arb_rect() -> impl Strategy<Value = Rect<i32, Logical>> {
        (0..64i32, 0..64i32, 1..32i32, 1..32i32).prop_map(|(x, y, w, h)| rect(x, y, w, h))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn covers_exactly_the_union(rects in prop::collection::vec(arb_rect(), 0..8)) {
            let mut region = Region::new();
            for &r in &rects {
                region.add_rect(r);
            }

            // Stored rectangles stay pairwise disjoint.
            let stored = region.rects();
            for (i, a) in stored.iter().enumerate() {
                for b in &stored[i + 1..] {
                    prop_assert!(!a.overlaps(*b));
                }
            }

            // Membership matches the plain union.
            for x in (0..96i32).step_by(3) {
                for y in (0..96i32).step_by(3) {
                    let p = Point::new(x, y);
                    let expected = rects.iter().any(|r| r.contains(p));
                    prop_assert_eq!(region.contains_point(p), expected);
                }
            }
        }
    }
}
