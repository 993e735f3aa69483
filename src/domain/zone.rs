//! Polygonal zone of interest
//!
//! A zone is an immutable, ordered vertex list in pixel space. Membership
//! uses the even-odd (ray casting) rule; points exactly on an edge resolve
//! consistently but without any particular guarantee.

use crate::domain::types::Point;
use anyhow::{bail, Context};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Zone file layout: `{"polygon": [[x, y], ...]}`
#[derive(Debug, Deserialize)]
struct ZoneFile {
    polygon: Vec<[f64; 2]>,
}

#[derive(Debug, Clone)]
pub struct Zone {
    name: String,
    vertices: Vec<Point>,
}

impl Zone {
    /// Build a zone, rejecting degenerate polygons
    pub fn new(name: impl Into<String>, vertices: Vec<Point>) -> anyhow::Result<Self> {
        let name = name.into();
        if vertices.len() < 3 {
            bail!("zone {name} needs at least 3 vertices, got {}", vertices.len());
        }
        if vertices.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
            bail!("zone {name} has non-finite coordinates");
        }
        if signed_area(&vertices).abs() < f64::EPSILON {
            bail!("zone {name} has zero area");
        }
        Ok(Self { name, vertices })
    }

    /// Build a zone from `[x, y]` pairs as they appear in config
    pub fn from_points(name: impl Into<String>, points: &[[f64; 2]]) -> anyhow::Result<Self> {
        Self::new(name, points.iter().map(|p| Point::new(p[0], p[1])).collect())
    }

    /// Load a zone polygon from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(name: impl Into<String>, path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read zone file {}", path.display()))?;
        let file: ZoneFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse zone file {}", path.display()))?;
        Self::from_points(name, &file.polygon)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vertices(&self) -> &[Point] {
        &self.vertices
    }

    /// Even-odd point-in-polygon test
    pub fn contains(&self, p: Point) -> bool {
        let n = self.vertices.len();
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let vi = self.vertices[i];
            let vj = self.vertices[j];
            if (vi.y > p.y) != (vj.y > p.y) {
                let x_cross = (vj.x - vi.x) * (p.y - vi.y) / (vj.y - vi.y) + vi.x;
                if p.x < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

/// Shoelace formula
fn signed_area(vertices: &[Point]) -> f64 {
    let n = vertices.len();
    let mut sum = 0.0;
    for i in 0..n {
        let a = vertices[i];
        let b = vertices[(i + 1) % n];
        sum += a.x * b.y - b.x * a.y;
    }
    sum / 2.0
}
