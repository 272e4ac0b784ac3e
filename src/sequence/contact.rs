//! Table contact positions of every strip.

use crate::error::{AppResult, BenchError};
use crate::geometry::{AffineTransform, NeedlesGeometry, Padfile, Position};
use std::collections::BTreeMap;
use tracing::info;

/// Contact positions computed once per run.
///
/// Strips whose neighbouring needles would miss a pad map to `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContactPlan {
    positions: BTreeMap<String, Option<Position>>,
}

impl ContactPlan {
    /// Transform every pad of `padfile` using the table positions of its
    /// three reference pads.
    pub fn from_alignment(padfile: &Padfile, alignment: [Position; 3], needles: usize) -> AppResult<Self> {
        let references: Vec<Position> = padfile.references().iter().map(|pad| pad.position()).collect();
        let sensor: [Position; 3] = match references.as_slice() {
            [a, b, c, ..] => [*a, *b, *c],
            _ => {
                return Err(BenchError::Validation(format!(
                    "padfile defines {} reference pads, 3 required",
                    references.len()
                )))
            }
        };
        let transform = AffineTransform::from_references(sensor, alignment)?;
        info!(matrix = ?transform.matrix, offset = ?transform.offset, "transformation matrix");
        Ok(Self::build(padfile, needles, |position| transform.transform(position)))
    }

    /// Use design positions as table positions, for runs without table movement.
    pub fn from_design(padfile: &Padfile, needles: usize) -> Self {
        Self::build(padfile, needles, |position| position)
    }

    fn build<F>(padfile: &Padfile, needles: usize, transform: F) -> Self
    where
        F: Fn(Position) -> Position,
    {
        let geometry = NeedlesGeometry::new(padfile, needles);
        let positions: BTreeMap<_, _> = padfile
            .pads()
            .iter()
            .map(|pad| {
                let position = geometry
                    .is_pad_valid(padfile, pad)
                    .then(|| transform(pad.position()));
                (pad.name.clone(), position)
            })
            .collect();
        info!("transformed {} positions", positions.len());
        Self { positions }
    }

    /// Contact position of `strip`, `None` if it cannot be contacted.
    pub fn position(&self, strip: &str) -> AppResult<Option<Position>> {
        self.positions
            .get(strip)
            .copied()
            .ok_or_else(|| BenchError::Validation(format!("no such strip in contact positions: {strip}")))
    }

    /// Number of strips in the plan.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// True if the plan has no strips.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PADFILE: &str = "pitch: 100\n\
        reference pad: A\n\
        reference pad: B\n\
        reference pad: C\n\
        A 0 0 0\n\
        B 1000 0 0\n\
        C 0 -100 0\n\
        D 1000 -100 0\n";

    #[test]
    fn test_positions_follow_alignment() {
        let padfile = Padfile::parse(PADFILE).unwrap();
        let alignment = [
            Position::new(500.0, 500.0, 2000.0),
            Position::new(1500.0, 500.0, 2000.0),
            Position::new(500.0, 400.0, 2000.0),
        ];
        let plan = ContactPlan::from_alignment(&padfile, alignment, 1).unwrap();
        assert_eq!(plan.len(), 4);
        let a = plan.position("A").unwrap().unwrap();
        assert!(a.is_near(&Position::new(500.0, 500.0, 2000.0), 1e-9));
        assert!(plan.position("C").unwrap().is_none());
        assert!(plan.position("Z").is_err());
    }

    #[test]
    fn test_design_positions() {
        let padfile = Padfile::parse(PADFILE).unwrap();
        let plan = ContactPlan::from_design(&padfile, 0);
        assert_eq!(plan.position("D").unwrap(), Some(Position::new(1000.0, -100.0, 0.0)));
    }
}
