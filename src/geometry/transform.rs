//! Affine transformation from sensor design coordinates to table coordinates.
//!
//! Solves `s * T + V0 = t` from three reference pads, where `s` are design XY
//! coordinates and `t` the measured table XYZ positions. `T` is a 2x3 matrix,
//! `V0` a 3-vector offset.

use super::Position;
use crate::error::BenchError;
use serde::{Deserialize, Serialize};

/// Transform computed from three reference alignments.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineTransform {
    /// Rows map design x and design y onto table xyz.
    pub matrix: [[f64; 3]; 2],
    /// Table offset.
    pub offset: [f64; 3],
}

impl AffineTransform {
    /// Compute `T = P^-1 Q` and `V0 = t2 - s2 * T`.
    ///
    /// `sensor` are design positions (z ignored), `table` the aligned table positions.
    pub fn from_references(sensor: [Position; 3], table: [Position; 3]) -> Result<Self, BenchError> {
        let [s1, s2, s3] = sensor;
        let [t1, t2, t3] = table;

        let q = [
            [t2.x - t1.x, t2.y - t1.y, t2.z - t1.z],
            [t3.x - t1.x, t3.y - t1.y, t3.z - t1.z],
        ];
        let p = [[s2.x - s1.x, s2.y - s1.y], [s3.x - s1.x, s3.y - s1.y]];

        let det = p[0][0] * p[1][1] - p[0][1] * p[1][0];
        if det.abs() < f64::EPSILON {
            return Err(BenchError::Validation(
                "reference pads are collinear, alignment is singular".to_string(),
            ));
        }
        let inv = [
            [p[1][1] / det, -p[0][1] / det],
            [-p[1][0] / det, p[0][0] / det],
        ];

        let mut matrix = [[0.0; 3]; 2];
        for (row, inv_row) in matrix.iter_mut().zip(inv.iter()) {
            for (col, value) in row.iter_mut().enumerate() {
                *value = inv_row[0] * q[0][col] + inv_row[1] * q[1][col];
            }
        }

        let mut offset = [0.0; 3];
        let t2 = [t2.x, t2.y, t2.z];
        for (col, value) in offset.iter_mut().enumerate() {
            *value = t2[col] - (s2.x * matrix[0][col] + s2.y * matrix[1][col]);
        }

        Ok(Self { matrix, offset })
    }

    /// Map a design position onto the table.
    pub fn transform(&self, position: Position) -> Position {
        let apply = |col: usize| {
            position.x * self.matrix[0][col] + position.y * self.matrix[1][col] + self.offset[col]
        };
        Position::new(apply(0), apply(1), apply(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_near(a: Position, b: Position) {
        assert!(a.is_near(&b, 1e-9), "{a} != {b}");
    }

    #[test]
    fn test_identity_with_offset() {
        let sensor = [
            Position::new(0.0, 0.0, 0.0),
            Position::new(100.0, 0.0, 0.0),
            Position::new(0.0, 100.0, 0.0),
        ];
        let table = [
            Position::new(1000.0, 2000.0, 500.0),
            Position::new(1100.0, 2000.0, 500.0),
            Position::new(1000.0, 2100.0, 500.0),
        ];
        let t = AffineTransform::from_references(sensor, table).unwrap();
        assert_near(t.transform(Position::new(50.0, 50.0, 0.0)), Position::new(1050.0, 2050.0, 500.0));
        for (s, t_ref) in sensor.iter().zip(table.iter()) {
            assert_near(t.transform(*s), *t_ref);
        }
    }

    #[test]
    fn test_rotation_and_tilt() {
        // 90 degree rotation with z rising along design x
        let sensor = [
            Position::new(0.0, 0.0, 0.0),
            Position::new(10.0, 0.0, 0.0),
            Position::new(0.0, 10.0, 0.0),
        ];
        let table = [
            Position::new(0.0, 0.0, 100.0),
            Position::new(0.0, 10.0, 101.0),
            Position::new(-10.0, 0.0, 100.0),
        ];
        let t = AffineTransform::from_references(sensor, table).unwrap();
        assert_near(t.transform(Position::new(20.0, 5.0, 0.0)), Position::new(-5.0, 20.0, 102.0));
    }

    #[test]
    fn test_collinear_references_fail() {
        let sensor = [
            Position::new(0.0, 0.0, 0.0),
            Position::new(10.0, 0.0, 0.0),
            Position::new(20.0, 0.0, 0.0),
        ];
        let table = sensor;
        assert!(AffineTransform::from_references(sensor, table).is_err());
    }
}
