//! Spatial predicates over feature geometries.
//!
//! Predicates are evaluated on bounding boxes. That is exact for
//! `Contains`/`Intersects` over box regions and a conservative
//! approximation for polygon interiors, which is the contract the stores
//! rely on: `test` may admit a candidate, never wrongly reject one that a
//! box-level check would accept.

use sonde_types::{Bbox, Geometry};

use super::EmptyIntersection;

/// The spatial relation to require between region and geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpatialOp {
    /// Geometry intersects the region of interest.
    Intersects,
    /// Geometry lies entirely within the region of interest.
    Contains,
    /// Geometry lies within `distance` of the point.
    WithinDistance { x: f64, y: f64, distance: f64 },
}

/// A region-of-interest filter.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialFilter {
    pub roi: Bbox,
    pub op: SpatialOp,
}

impl SpatialFilter {
    pub fn intersects(roi: Bbox) -> Self {
        SpatialFilter {
            roi,
            op: SpatialOp::Intersects,
        }
    }

    pub fn contains(roi: Bbox) -> Self {
        SpatialFilter {
            roi,
            op: SpatialOp::Contains,
        }
    }

    pub fn within_distance(x: f64, y: f64, distance: f64) -> Self {
        SpatialFilter {
            roi: Bbox::new(x - distance, y - distance, x + distance, y + distance),
            op: SpatialOp::WithinDistance { x, y, distance },
        }
    }

    pub fn test(&self, geometry: &Geometry) -> bool {
        let bbox = geometry.bbox();
        match self.op {
            SpatialOp::Intersects => self.roi.intersects(&bbox),
            SpatialOp::Contains => self.roi.contains(&bbox),
            SpatialOp::WithinDistance { x, y, distance } => {
                bbox.distance_to_point(x, y) <= distance
            }
        }
    }

    /// Conjunction of two spatial filters. The regions must overlap; the
    /// stricter box is kept and both operators are preserved by keeping
    /// the non-`Intersects` one when the operators differ.
    pub fn intersect(&self, other: &SpatialFilter) -> Result<SpatialFilter, EmptyIntersection> {
        let joint = self.roi.intersection(&other.roi).ok_or(EmptyIntersection)?;
        let op = match (self.op, other.op) {
            (SpatialOp::Intersects, op) | (op, SpatialOp::Intersects) => op,
            (op, _) => op,
        };
        Ok(SpatialFilter { roi: joint, op })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersects_and_contains() {
        let roi = Bbox::new(0.0, 0.0, 10.0, 10.0);
        let poly = Geometry::Polygon {
            exterior: vec![(5.0, 5.0), (15.0, 5.0), (15.0, 15.0), (5.0, 15.0)],
        };
        assert!(SpatialFilter::intersects(roi).test(&poly));
        assert!(!SpatialFilter::contains(roi).test(&poly));

        let point = Geometry::Point { x: 2.0, y: 3.0 };
        assert!(SpatialFilter::contains(roi).test(&point));
    }

    #[test]
    fn within_distance() {
        let f = SpatialFilter::within_distance(0.0, 0.0, 5.0);
        assert!(f.test(&Geometry::Point { x: 3.0, y: 4.0 }));
        assert!(!f.test(&Geometry::Point { x: 4.0, y: 4.0 }));
    }

    #[test]
    fn disjoint_regions_are_empty() {
        let a = SpatialFilter::intersects(Bbox::new(0.0, 0.0, 1.0, 1.0));
        let b = SpatialFilter::intersects(Bbox::new(5.0, 5.0, 6.0, 6.0));
        assert_eq!(a.intersect(&b), Err(EmptyIntersection));
    }
}
