//! Sensor geometry: table positions, padfiles and the alignment transform.

pub mod padfile;
pub mod transform;

pub use padfile::{NeedlesGeometry, Pad, Padfile};
pub use transform::AffineTransform;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Table coordinate in micrometers.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// X axis.
    pub x: f64,
    /// Y axis.
    pub y: f64,
    /// Z axis (contact height).
    pub z: f64,
}

impl Position {
    /// Create a position from its coordinates.
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Return a copy shifted along X.
    pub fn with_x_offset(self, offset: f64) -> Self {
        Self {
            x: self.x + offset,
            ..self
        }
    }

    /// True if every axis matches `other` within `threshold`.
    pub fn is_near(&self, other: &Position, threshold: f64) -> bool {
        let threshold = threshold.abs();
        (self.x - other.x).abs() <= threshold
            && (self.y - other.y).abs() <= threshold
            && (self.z - other.z).abs() <= threshold
    }
}

impl From<(f64, f64, f64)> for Position {
    fn from((x, y, z): (f64, f64, f64)) -> Self {
        Self { x, y, z }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3})", self.x, self.y, self.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_near() {
        let a = Position::new(1.0, 2.0, 3.0);
        assert!(a.is_near(&Position::new(1.5, 2.0, 2.5), 0.5));
        assert!(!a.is_near(&Position::new(1.0, 2.0, 4.1), 1.0));
        assert!(a.is_near(&Position::new(1.0, 2.0, 4.0), -1.0));
    }

    #[test]
    fn test_x_offset_keeps_other_axes() {
        let a = Position::new(10.0, 20.0, 30.0).with_x_offset(-5.0);
        assert_eq!(a, Position::new(5.0, 20.0, 30.0));
    }
}
