//! Geometry primitives for feature locations and spatial filtering.
//!
//! Sonde stores point and polygon geometries but evaluates spatial
//! predicates on bounding boxes only. Exact geometry math lives with the
//! consumers that need it.

use serde::{Deserialize, Serialize};

/// An axis-aligned bounding box in lon/lat order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bbox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bbox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Bbox {
            min_x: min_x.min(max_x),
            min_y: min_y.min(max_y),
            max_x: min_x.max(max_x),
            max_y: min_y.max(max_y),
        }
    }

    pub fn from_point(x: f64, y: f64) -> Self {
        Bbox {
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
        }
    }

    pub fn intersects(&self, other: &Bbox) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    /// True when `other` lies entirely inside this box.
    pub fn contains(&self, other: &Bbox) -> bool {
        self.min_x <= other.min_x
            && self.max_x >= other.max_x
            && self.min_y <= other.min_y
            && self.max_y >= other.max_y
    }

    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        self.min_x <= x && x <= self.max_x && self.min_y <= y && y <= self.max_y
    }

    /// Euclidean distance from a point to the nearest edge of the box,
    /// zero when the point is inside.
    pub fn distance_to_point(&self, x: f64, y: f64) -> f64 {
        let dx = (self.min_x - x).max(0.0).max(x - self.max_x);
        let dy = (self.min_y - y).max(0.0).max(y - self.max_y);
        (dx * dx + dy * dy).sqrt()
    }

    /// The smallest box covering both inputs.
    pub fn union(&self, other: &Bbox) -> Bbox {
        Bbox {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    /// The overlapping box, or `None` when disjoint.
    pub fn intersection(&self, other: &Bbox) -> Option<Bbox> {
        if !self.intersects(other) {
            return None;
        }
        Some(Bbox {
            min_x: self.min_x.max(other.min_x),
            min_y: self.min_y.max(other.min_y),
            max_x: self.max_x.min(other.max_x),
            max_y: self.max_y.min(other.max_y),
        })
    }
}

/// A feature geometry: a point or a polygon exterior ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Point { x: f64, y: f64 },
    Polygon { exterior: Vec<(f64, f64)> },
}

impl Geometry {
    /// The bounding box of the geometry. An empty polygon collapses to a
    /// degenerate box at the origin.
    pub fn bbox(&self) -> Bbox {
        match self {
            Geometry::Point { x, y } => Bbox::from_point(*x, *y),
            Geometry::Polygon { exterior } => {
                let mut pts = exterior.iter();
                let Some(&(x0, y0)) = pts.next() else {
                    return Bbox::from_point(0.0, 0.0);
                };
                let mut bbox = Bbox::from_point(x0, y0);
                for &(x, y) in pts {
                    bbox = bbox.union(&Bbox::from_point(x, y));
                }
                bbox
            }
        }
    }

    /// Parses a minimal WKT subset: `POINT (x y)` and
    /// `POLYGON ((x y, x y, ...))`.
    pub fn parse_wkt(s: &str) -> Option<Geometry> {
        let s = s.trim();
        let upper = s.to_ascii_uppercase();
        if let Some(rest) = upper.strip_prefix("POINT") {
            let inner = rest.trim().strip_prefix('(')?.strip_suffix(')')?;
            let mut nums = inner.split_whitespace();
            let x: f64 = nums.next()?.parse().ok()?;
            let y: f64 = nums.next()?.parse().ok()?;
            return Some(Geometry::Point { x, y });
        }
        if let Some(rest) = upper.strip_prefix("POLYGON") {
            let inner = rest
                .trim()
                .strip_prefix("((")?
                .strip_suffix("))")?;
            let mut exterior = Vec::new();
            for pair in inner.split(',') {
                let mut nums = pair.split_whitespace();
                let x: f64 = nums.next()?.parse().ok()?;
                let y: f64 = nums.next()?.parse().ok()?;
                exterior.push((x, y));
            }
            if exterior.len() < 3 {
                return None;
            }
            return Some(Geometry::Polygon { exterior });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wkt_point() {
        let g = Geometry::parse_wkt("POINT (1.5 -2.25)").unwrap();
        assert_eq!(g, Geometry::Point { x: 1.5, y: -2.25 });
    }

    #[test]
    fn wkt_polygon_bbox() {
        let g = Geometry::parse_wkt("POLYGON ((0 0, 4 0, 4 3, 0 3, 0 0))").unwrap();
        assert_eq!(g.bbox(), Bbox::new(0.0, 0.0, 4.0, 3.0));
    }

    #[test]
    fn wkt_rejects_garbage() {
        assert!(Geometry::parse_wkt("LINESTRING (0 0, 1 1)").is_none());
        assert!(Geometry::parse_wkt("POINT (abc def)").is_none());
    }

    #[test]
    fn bbox_distance() {
        let b = Bbox::new(0.0, 0.0, 2.0, 2.0);
        assert_eq!(b.distance_to_point(1.0, 1.0), 0.0);
        assert_eq!(b.distance_to_point(5.0, 2.0), 3.0);
    }
}
