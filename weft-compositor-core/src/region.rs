//! Rectangles and regions, used for damage, input and opaque areas of surfaces.

/// An axis-aligned rectangle in surface-local or buffer coordinates.
///
/// Edges are computed in `i64`, so any `x + width` a client sends is safe to
/// evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rectangle {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rectangle {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// Builds a rectangle from its edges, clipped to the `i32` coordinate space.
    fn from_edges(left: i64, top: i64, right: i64, bottom: i64) -> Self {
        let left = clamp_coordinate(left);
        let top = clamp_coordinate(top);
        let right = clamp_coordinate(right);
        let bottom = clamp_coordinate(bottom);
        Self {
            x: left,
            y: top,
            width: clamp_coordinate(i64::from(right) - i64::from(left)),
            height: clamp_coordinate(i64::from(bottom) - i64::from(top)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn left(&self) -> i64 {
        i64::from(self.x)
    }

    pub fn top(&self) -> i64 {
        i64::from(self.y)
    }

    /// Exclusive right edge.
    pub fn right(&self) -> i64 {
        i64::from(self.x) + i64::from(self.width)
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> i64 {
        i64::from(self.y) + i64::from(self.height)
    }

    pub fn area(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        self.width.unsigned_abs() as u64 * self.height.unsigned_abs() as u64
    }

    /// Left and top edges are inclusive, right and bottom exclusive.
    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        let (x, y) = (i64::from(x), i64::from(y));
        !self.is_empty() && x >= self.left() && x < self.right() && y >= self.top() && y < self.bottom()
    }

    pub fn intersects(&self, other: &Self) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self.left() < other.right()
            && self.right() > other.left()
            && self.top() < other.bottom()
            && self.bottom() > other.top()
    }

    /// The parts of `self` not covered by `cut`, as up to four disjoint pieces.
    fn subtract(&self, cut: &Self) -> Vec<Self> {
        if !self.intersects(cut) {
            return vec![*self];
        }
        let mut pieces = Vec::with_capacity(4);
        if self.top() < cut.top() {
            pieces.push(Self::from_edges(self.left(), self.top(), self.right(), cut.top()));
        }
        if self.bottom() > cut.bottom() {
            pieces.push(Self::from_edges(self.left(), cut.bottom(), self.right(), self.bottom()));
        }
        let band_top = self.top().max(cut.top());
        let band_bottom = self.bottom().min(cut.bottom());
        if self.left() < cut.left() {
            pieces.push(Self::from_edges(self.left(), band_top, cut.left(), band_bottom));
        }
        if self.right() > cut.right() {
            pieces.push(Self::from_edges(cut.right(), band_top, self.right(), band_bottom));
        }
        pieces.retain(|piece| !piece.is_empty());
        pieces
    }
}

fn clamp_coordinate(value: i64) -> i32 {
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// A set of disjoint rectangles.
///
/// `add` and `subtract` keep the covered area exact: adding cuts the new
/// rectangle into the pieces not covered yet, subtracting fragments whatever
/// it overlaps. Area beyond the `i32` coordinate space is dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    rectangles: Vec<Rectangle>,
}

impl Region {
    /// Creates a new, empty `Region`.
    pub fn new() -> Self {
        Self { rectangles: Vec::new() }
    }

    pub fn from_rectangles(rectangles: impl IntoIterator<Item = Rectangle>) -> Self {
        let mut region = Self::new();
        for rect in rectangles {
            region.add(rect);
        }
        region
    }

    /// `wl_region.add`. Empty rectangles are ignored.
    pub fn add(&mut self, rect: Rectangle) {
        let rect = Rectangle::from_edges(rect.left(), rect.top(), rect.right(), rect.bottom());
        if rect.is_empty() {
            return;
        }
        let mut uncovered = vec![rect];
        for existing in &self.rectangles {
            uncovered = uncovered.iter().flat_map(|piece| piece.subtract(existing)).collect();
            if uncovered.is_empty() {
                return;
            }
        }
        self.rectangles.extend(uncovered);
    }

    /// `wl_region.subtract`.
    pub fn subtract(&mut self, rect: Rectangle) {
        if rect.is_empty() {
            return;
        }
        self.rectangles = self
            .rectangles
            .iter()
            .flat_map(|existing| existing.subtract(&rect))
            .collect();
    }

    pub fn is_empty(&self) -> bool {
        self.rectangles.is_empty()
    }

    /// The disjoint pieces making up the region.
    pub fn rectangles(&self) -> &[Rectangle] {
        &self.rectangles
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        self.rectangles.iter().any(|rect| rect.contains_point(x, y))
    }

    pub fn area(&self) -> u64 {
        self.rectangles.iter().map(Rectangle::area).fold(0, u64::saturating_add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_disjoint(region: &Region) {
        let rects = region.rectangles();
        for (i, a) in rects.iter().enumerate() {
            for b in &rects[i + 1..] {
                assert!(!a.intersects(b), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn test_region_add_ignores_empty() {
        let mut region = Region::new();
        region.add(Rectangle::new(0, 0, 0, 10));
        region.add(Rectangle::new(0, 0, 10, -1));
        assert!(region.is_empty());
    }

    #[test]
    fn test_region_l_shape_keeps_exact_area() {
        let region = Region::from_rectangles([Rectangle::new(0, 0, 100, 10), Rectangle::new(0, 5, 10, 100)]);
        assert_disjoint(&region);
        // 100x10 plus 10x100, minus the 10x5 overlap.
        assert_eq!(region.area(), 1950);
        assert!(region.contains_point(99, 0));
        assert!(region.contains_point(5, 104));
        assert!(!region.contains_point(50, 50), "The notch of the L must stay uncovered.");
        assert!(!region.contains_point(5, 105));
    }

    #[test]
    fn test_region_add_contained_rectangle_is_a_noop() {
        let mut region = Region::from_rectangles([Rectangle::new(0, 0, 50, 50)]);
        region.add(Rectangle::new(10, 10, 5, 5));
        assert_eq!(region.rectangles(), &[Rectangle::new(0, 0, 50, 50)]);
    }

    #[test]
    fn test_region_keeps_disjoint() {
        let region = Region::from_rectangles([Rectangle::new(0, 0, 10, 10), Rectangle::new(20, 0, 10, 10)]);
        assert_eq!(region.rectangles().len(), 2);
        assert_eq!(region.area(), 200);
    }

    #[test]
    fn test_region_subtract_punches_a_hole() {
        let mut region = Region::from_rectangles([Rectangle::new(0, 0, 30, 30)]);
        region.subtract(Rectangle::new(10, 10, 10, 10));
        assert_disjoint(&region);
        assert_eq!(region.area(), 800);
        assert!(!region.contains_point(15, 15));
        assert!(region.contains_point(25, 15));
    }

    #[test]
    fn test_region_handles_extreme_extents() {
        let region = Region::from_rectangles([
            Rectangle::new(0, 0, i32::MAX, i32::MAX),
            Rectangle::new(10, 10, i32::MAX, 5),
            Rectangle::new(i32::MIN, -5, i32::MAX, 5),
        ]);
        assert_disjoint(&region);
        assert!(region.contains_point(i32::MAX - 1, 12));
        assert!(region.contains_point(i32::MIN, -1));
        assert!(!region.contains_point(-1, -1));
        assert!(!region.contains_point(i32::MAX, 12), "Right edges are exclusive.");
    }
}
