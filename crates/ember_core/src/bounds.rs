//! Axis-aligned bounding boxes.

/// Axis-aligned box. An empty box has `min > max`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bounds {
    /// Minimum corner.
    pub min: [f32; 3],
    /// Maximum corner.
    pub max: [f32; 3],
}

impl Default for Bounds {
    fn default() -> Self {
        Self::empty()
    }
}

impl Bounds {
    /// Box containing nothing.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            min: [f32::MAX; 3],
            max: [f32::MIN; 3],
        }
    }

    /// Box from two corners.
    #[must_use]
    pub const fn new(min: [f32; 3], max: [f32; 3]) -> Self {
        Self { min, max }
    }

    /// Whether the box contains at least one point.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        (0..3).all(|axis| self.min[axis] <= self.max[axis])
    }

    /// Grows the box to include `point`.
    pub fn include(&mut self, point: [f32; 3]) {
        for axis in 0..3 {
            self.min[axis] = self.min[axis].min(point[axis]);
            self.max[axis] = self.max[axis].max(point[axis]);
        }
    }

    /// Box grown by `extent` on every side, per axis.
    #[must_use]
    pub fn expand_by(&self, extent: [f32; 3]) -> Self {
        let mut out = *self;
        for axis in 0..3 {
            out.min[axis] -= extent[axis];
            out.max[axis] += extent[axis];
        }
        out
    }

    /// The eight corners.
    #[must_use]
    pub fn corners(&self) -> [[f32; 3]; 8] {
        let mut corners = [[0.0; 3]; 8];
        for (i, corner) in corners.iter_mut().enumerate() {
            for axis in 0..3 {
                corner[axis] = if i & (1 << axis) == 0 {
                    self.min[axis]
                } else {
                    self.max[axis]
                };
            }
        }
        corners
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_invalid() {
        assert!(!Bounds::empty().is_valid());
    }

    #[test]
    fn test_include_and_expand() {
        let mut bounds = Bounds::empty();
        bounds.include([1.0, 2.0, 3.0]);
        bounds.include([-1.0, 0.0, 5.0]);
        assert_eq!(bounds, Bounds::new([-1.0, 0.0, 3.0], [1.0, 2.0, 5.0]));

        let grown = bounds.expand_by([1.0, 0.5, 0.0]);
        assert_eq!(grown.min, [-2.0, -0.5, 3.0]);
        assert_eq!(grown.max, [2.0, 2.5, 5.0]);
    }
}
