//! Points, sizes and rectangles tagged with their coordinate space.
//!
//! The compositor works in three spaces: compositor-global logical
//! coordinates, per-output physical pixels, and client buffer pixels.
//! The marker parameter keeps them from being mixed up silently.

use std::marker::PhantomData;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Scale-independent coordinates in the global compositor space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Logical;

/// Device pixels of one output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Physical;

/// Pixels of a client buffer, before any output scaling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Buffer;

// =============================================================================
// Point
// =============================================================================

#[derive(Debug, Hash)]
pub struct Point<N, Kind> {
    pub x: N,
    pub y: N,
    _kind: PhantomData<Kind>,
}

impl<N: Clone, Kind> Clone for Point<N, Kind> {
    fn clone(&self) -> Self {
        Self {
            x: self.x.clone(),
            y: self.y.clone(),
            _kind: PhantomData,
        }
    }
}

impl<N: Copy, Kind> Copy for Point<N, Kind> {}

impl<N: Default, Kind> Default for Point<N, Kind> {
    fn default() -> Self {
        Self::new(N::default(), N::default())
    }
}

impl<N: PartialEq, Kind> PartialEq for Point<N, Kind> {
    fn eq(&self, other: &Self) -> bool {
        self.x == other.x && self.y == other.y
    }
}

impl<N: Eq, Kind> Eq for Point<N, Kind> {}

impl<N, Kind> Point<N, Kind> {
    pub fn new(x: N, y: N) -> Self {
        Self {
            x,
            y,
            _kind: PhantomData,
        }
    }
}

impl<N, Kind> From<(N, N)> for Point<N, Kind> {
    fn from((x, y): (N, N)) -> Self {
        Self::new(x, y)
    }
}

impl<N: Add<Output = N>, Kind> Add for Point<N, Kind> {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self::new(self.x + other.x, self.y + other.y)
    }
}

impl<N: Add<Output = N> + Copy, Kind> AddAssign for Point<N, Kind> {
    fn add_assign(&mut self, other: Self) {
        *self = Self::new(self.x + other.x, self.y + other.y);
    }
}

impl<N: Sub<Output = N>, Kind> Sub for Point<N, Kind> {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self::new(self.x - other.x, self.y - other.y)
    }
}

impl<N: Sub<Output = N> + Copy, Kind> SubAssign for Point<N, Kind> {
    fn sub_assign(&mut self, other: Self) {
        *self = Self::new(self.x - other.x, self.y - other.y);
    }
}

impl<Kind> Point<i32, Kind> {
    pub fn to_f64(self) -> Point<f64, Kind> {
        Point::new(f64::from(self.x), f64::from(self.y))
    }
}

impl<Kind> Point<f64, Kind> {
    pub fn to_i32_round(self) -> Point<i32, Kind> {
        Point::new(self.x.round() as i32, self.y.round() as i32)
    }

    pub fn to_i32_floor(self) -> Point<i32, Kind> {
        Point::new(self.x.floor() as i32, self.y.floor() as i32)
    }
}

impl Point<f64, Logical> {
    pub fn to_physical(self, scale: f64) -> Point<f64, Physical> {
        Point::new(self.x * scale, self.y * scale)
    }
}

impl Point<f64, Physical> {
    pub fn to_logical(self, scale: f64) -> Point<f64, Logical> {
        Point::new(self.x / scale, self.y / scale)
    }
}

// =============================================================================
// Size
// =============================================================================

#[derive(Debug, Hash)]
pub struct Size<N, Kind> {
    pub w: N,
    pub h: N,
    _kind: PhantomData<Kind>,
}

impl<N: Clone, Kind> Clone for Size<N, Kind> {
    fn clone(&self) -> Self {
        Self {
            w: self.w.clone(),
            h: self.h.clone(),
            _kind: PhantomData,
        }
    }
}

impl<N: Copy, Kind> Copy for Size<N, Kind> {}

impl<N: Default, Kind> Default for Size<N, Kind> {
    fn default() -> Self {
        Self::new(N::default(), N::default())
    }
}

impl<N: PartialEq, Kind> PartialEq for Size<N, Kind> {
    fn eq(&self, other: &Self) -> bool {
        self.w == other.w && self.h == other.h
    }
}

impl<N: Eq, Kind> Eq for Size<N, Kind> {}

impl<N, Kind> Size<N, Kind> {
    pub fn new(w: N, h: N) -> Self {
        Self {
            w,
            h,
            _kind: PhantomData,
        }
    }
}

impl<N, Kind> From<(N, N)> for Size<N, Kind> {
    fn from((w, h): (N, N)) -> Self {
        Self::new(w, h)
    }
}

impl<Kind> Size<i32, Kind> {
    pub fn to_f64(self) -> Size<f64, Kind> {
        Size::new(f64::from(self.w), f64::from(self.h))
    }

    pub fn is_empty(self) -> bool {
        self.w <= 0 || self.h <= 0
    }
}

impl<Kind> Size<f64, Kind> {
    pub fn to_i32_round(self) -> Size<i32, Kind> {
        Size::new(self.w.round() as i32, self.h.round() as i32)
    }

    pub fn is_empty(self) -> bool {
        self.w <= 0. || self.h <= 0.
    }
}

impl Size<f64, Logical> {
    pub fn to_physical(self, scale: f64) -> Size<f64, Physical> {
        Size::new(self.w * scale, self.h * scale)
    }
}

impl Size<f64, Physical> {
    pub fn to_logical(self, scale: f64) -> Size<f64, Logical> {
        Size::new(self.w / scale, self.h / scale)
    }
}

// =============================================================================
// Rect
// =============================================================================

#[derive(Debug, Hash)]
pub struct Rect<N, Kind> {
    pub loc: Point<N, Kind>,
    pub size: Size<N, Kind>,
}

impl<N: Clone, Kind> Clone for Rect<N, Kind> {
    fn clone(&self) -> Self {
        Self {
            loc: self.loc.clone(),
            size: self.size.clone(),
        }
    }
}

impl<N: Copy, Kind> Copy for Rect<N, Kind> {}

impl<N: Default, Kind> Default for Rect<N, Kind> {
    fn default() -> Self {
        Self {
            loc: Point::default(),
            size: Size::default(),
        }
    }
}

impl<N: PartialEq, Kind> PartialEq for Rect<N, Kind> {
    fn eq(&self, other: &Self) -> bool {
        self.loc == other.loc && self.size == other.size
    }
}

impl<N: Eq, Kind> Eq for Rect<N, Kind> {}

impl<N, Kind> Rect<N, Kind> {
    pub fn new(loc: Point<N, Kind>, size: Size<N, Kind>) -> Self {
        Self { loc, size }
    }

    pub fn from_loc_and_size(loc: impl Into<Point<N, Kind>>, size: impl Into<Size<N, Kind>>) -> Self {
        Self {
            loc: loc.into(),
            size: size.into(),
        }
    }
}

impl<Kind> Rect<i32, Kind> {
    pub fn from_size(size: Size<i32, Kind>) -> Self {
        Self::from_loc_and_size((0, 0), size)
    }

    pub fn left(self) -> i32 {
        self.loc.x
    }

    pub fn top(self) -> i32 {
        self.loc.y
    }

    pub fn right(self) -> i32 {
        self.loc.x + self.size.w
    }

    pub fn bottom(self) -> i32 {
        self.loc.y + self.size.h
    }

    pub fn is_empty(self) -> bool {
        self.size.is_empty()
    }

    pub fn from_extents(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self::from_loc_and_size((left, top), (right - left, bottom - top))
    }

    pub fn contains(self, point: Point<i32, Kind>) -> bool {
        point.x >= self.left()
            && point.x < self.right()
            && point.y >= self.top()
            && point.y < self.bottom()
    }

    pub fn contains_rect(self, other: Self) -> bool {
        !other.is_empty()
            && other.left() >= self.left()
            && other.top() >= self.top()
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    pub fn overlaps(self, other: Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.left() < other.right()
            && other.left() < self.right()
            && self.top() < other.bottom()
            && other.top() < self.bottom()
    }

    pub fn intersection(self, other: Self) -> Option<Self> {
        if !self.overlaps(other) {
            return None;
        }

        Some(Self::from_extents(
            self.left().max(other.left()),
            self.top().max(other.top()),
            self.right().min(other.right()),
            self.bottom().min(other.bottom()),
        ))
    }

    /// Smallest rectangle containing both.
    pub fn merge(self, other: Self) -> Self {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }

        Self::from_extents(
            self.left().min(other.left()),
            self.top().min(other.top()),
            self.right().max(other.right()),
            self.bottom().max(other.bottom()),
        )
    }

    pub fn translated(self, by: Point<i32, Kind>) -> Self {
        Self::new(self.loc + by, self.size)
    }

    pub fn to_f64(self) -> Rect<f64, Kind> {
        Rect::new(self.loc.to_f64(), self.size.to_f64())
    }
}

impl<Kind> Rect<f64, Kind> {
    pub fn is_empty(self) -> bool {
        self.size.is_empty()
    }

    pub fn contains(self, point: Point<f64, Kind>) -> bool {
        point.x >= self.loc.x
            && point.x < self.loc.x + self.size.w
            && point.y >= self.loc.y
            && point.y < self.loc.y + self.size.h
    }

    pub fn translated(self, by: Point<f64, Kind>) -> Self {
        Self::new(self.loc + by, self.size)
    }

    pub fn to_i32_round(self) -> Rect<i32, Kind> {
        Rect::new(self.loc.to_i32_round(), self.size.to_i32_round())
    }

    /// Rounds outwards to the enclosing integer rectangle.
    pub fn to_i32_outward(self) -> Rect<i32, Kind> {
        let left = self.loc.x.floor() as i32;
        let top = self.loc.y.floor() as i32;
        let right = (self.loc.x + self.size.w).ceil() as i32;
        let bottom = (self.loc.y + self.size.h).ceil() as i32;
        Rect::from_extents(left, top, right, bottom)
    }
}

impl Rect<f64, Logical> {
    pub fn to_physical(self, scale: f64) -> Rect<f64, Physical> {
        Rect::new(self.loc.to_physical(scale), self.size.to_physical(scale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersection_and_merge() {
        let a = Rect::<i32, Logical>::from_loc_and_size((0, 0), (100, 100));
        let b = Rect::from_loc_and_size((50, 50), (100, 100));

        assert_eq!(
            a.intersection(b),
            Some(Rect::from_loc_and_size((50, 50), (50, 50))),
        );
        assert_eq!(a.merge(b), Rect::from_loc_and_size((0, 0), (150, 150)));

        let c = Rect::from_loc_and_size((200, 200), (10, 10));
        assert_eq!(a.intersection(c), None);
        assert!(!a.overlaps(c));
    }

    #[test]
    fn outward_rounding() {
        let r = Rect::<f64, Logical>::from_loc_and_size((0.5, 0.5), (1.2, 1.2));
        assert_eq!(
            r.to_i32_outward(),
            Rect::from_loc_and_size((0, 0), (2, 2)),
        );
    }

    #[test]
    fn physical_conversion() {
        let r = Rect::<f64, Logical>::from_loc_and_size((10., 10.), (20., 20.));
        let p = r.to_physical(2.);
        assert_eq!(p, Rect::from_loc_and_size((20., 20.), (40., 40.)));
    }
}
