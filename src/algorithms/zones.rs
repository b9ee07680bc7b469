//! Facility geometry: zone classification, receiver lookup and the envelope
//!
//! Built once from a [`FacilityLayout`] and immutable afterwards. Zones are
//! kept in configured priority order and the first polygon containing a point
//! wins, so overlapping zones resolve deterministically.

use nalgebra::Point2;
use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::core::{Receiver, Zone, ZoneId, UNKNOWN_ZONE};
use crate::utils::config::{FacilityLayout, ZoneConfig};
use crate::validation::error::ConfigError;

/// Area below which a polygon is considered degenerate (m²)
const MIN_POLYGON_AREA: f64 = 1e-9;

/// Axis-aligned facility bounds with the origin at (0, 0)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FacilityEnvelope {
    pub width: f64,
    pub height: f64,
}

impl FacilityEnvelope {
    pub fn contains(&self, p: &Point2<f64>) -> bool {
        p.x >= 0.0 && p.x <= self.width && p.y >= 0.0 && p.y <= self.height
    }

    /// Nearest point inside the envelope
    pub fn clamp(&self, p: &Point2<f64>) -> Point2<f64> {
        Point2::new(p.x.clamp(0.0, self.width), p.y.clamp(0.0, self.height))
    }
}

/// Immutable zone and receiver geometry
#[derive(Debug, Clone)]
pub struct ZoneIndex {
    zones: Vec<Zone>,
    receivers: Vec<Receiver>,
    receiver_index: HashMap<String, usize>,
    envelope: FacilityEnvelope,
}

impl ZoneIndex {
    /// Validate a layout and build the index; any geometry error is fatal
    pub fn from_layout(layout: &FacilityLayout) -> Result<Self, ConfigError> {
        let dims = layout.facility;
        if !(dims.width > 0.0 && dims.width.is_finite()) {
            return Err(ConfigError::invalid("facility.width", dims.width, "must be positive"));
        }
        if !(dims.height > 0.0 && dims.height.is_finite()) {
            return Err(ConfigError::invalid("facility.height", dims.height, "must be positive"));
        }
        let envelope = FacilityEnvelope {
            width: dims.width,
            height: dims.height,
        };

        if layout.receivers.is_empty() {
            return Err(ConfigError::NoReceivers);
        }

        let mut receivers = Vec::with_capacity(layout.receivers.len());
        let mut receiver_index = HashMap::new();
        for config in &layout.receivers {
            if config.id.trim().is_empty() {
                return Err(ConfigError::InvalidReceiver {
                    receiver: config.id.clone(),
                    reason: "empty id".to_string(),
                });
            }
            let [x, y] = config.position;
            if !x.is_finite() || !y.is_finite() {
                return Err(ConfigError::InvalidReceiver {
                    receiver: config.id.clone(),
                    reason: "non-finite position".to_string(),
                });
            }
            if receiver_index.insert(config.id.clone(), receivers.len()).is_some() {
                return Err(ConfigError::DuplicateReceiver(config.id.clone()));
            }
            let receiver = Receiver::new(config.id.clone(), x, y);
            if !envelope.contains(&receiver.position) {
                warn!(receiver = %receiver.id, x, y, "receiver lies outside the facility envelope");
            }
            receivers.push(receiver);
        }

        let mut seen = HashSet::new();
        let mut zones = Vec::with_capacity(layout.zones.len());
        for config in &layout.zones {
            if config.id.trim().is_empty() {
                return Err(ConfigError::polygon(&config.id, "empty zone id"));
            }
            if config.id == UNKNOWN_ZONE {
                return Err(ConfigError::ReservedZoneId(config.id.clone()));
            }
            if !seen.insert(config.id.clone()) {
                return Err(ConfigError::DuplicateZone(config.id.clone()));
            }
            zones.push(build_zone(config)?);
        }

        Ok(Self {
            zones,
            receivers,
            receiver_index,
            envelope,
        })
    }

    /// Zone containing the point, or `unknown`
    pub fn classify(&self, p: &Point2<f64>) -> ZoneId {
        self.zones
            .iter()
            .find(|zone| point_in_polygon(p, &zone.polygon))
            .map(|zone| zone.id.clone())
            .unwrap_or_else(ZoneId::unknown)
    }

    pub fn zone(&self, id: &str) -> Option<&Zone> {
        self.zones.iter().find(|zone| zone.id.as_str() == id)
    }

    pub fn receiver(&self, id: &str) -> Option<&Receiver> {
        self.receiver_index.get(id).map(|&i| &self.receivers[i])
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn receivers(&self) -> &[Receiver] {
        &self.receivers
    }

    pub fn envelope(&self) -> FacilityEnvelope {
        self.envelope
    }
}

fn build_zone(config: &ZoneConfig) -> Result<Zone, ConfigError> {
    let mut vertices: Vec<Point2<f64>> = Vec::with_capacity(config.polygon.len());
    for &[x, y] in &config.polygon {
        if !x.is_finite() || !y.is_finite() {
            return Err(ConfigError::polygon(&config.id, "non-finite vertex"));
        }
        let p = Point2::new(x, y);
        if vertices.last() != Some(&p) {
            vertices.push(p);
        }
    }
    // An explicitly repeated first vertex closes the ring; the edge is implicit
    if vertices.len() > 1 && vertices.first() == vertices.last() {
        vertices.pop();
    }

    if vertices.len() < 3 {
        return Err(ConfigError::polygon(&config.id, "fewer than 3 distinct vertices"));
    }
    if polygon_area(&vertices).abs() < MIN_POLYGON_AREA {
        return Err(ConfigError::polygon(&config.id, "zero area"));
    }
    if is_self_intersecting(&vertices) {
        return Err(ConfigError::polygon(&config.id, "edges intersect"));
    }

    Ok(Zone {
        id: ZoneId::new(config.id.clone()),
        name: config.name.clone(),
        polygon: vertices,
    })
}

/// Even-odd ray casting test
pub fn point_in_polygon(p: &Point2<f64>, polygon: &[Point2<f64>]) -> bool {
    let n = polygon.len();
    if n < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (a, b) = (polygon[i], polygon[j]);
        if (a.y > p.y) != (b.y > p.y) {
            let x_cross = (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x;
            if p.x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// Signed shoelace area
fn polygon_area(vertices: &[Point2<f64>]) -> f64 {
    let n = vertices.len();
    (0..n)
        .map(|i| {
            let (a, b) = (vertices[i], vertices[(i + 1) % n]);
            a.x * b.y - b.x * a.y
        })
        .sum::<f64>()
        / 2.0
}

fn is_self_intersecting(vertices: &[Point2<f64>]) -> bool {
    let n = vertices.len();
    for i in 0..n {
        let (a1, a2) = (vertices[i], vertices[(i + 1) % n]);
        for j in (i + 1)..n {
            // Adjacent edges share a vertex by construction
            if j == i + 1 || (i == 0 && j == n - 1) {
                continue;
            }
            let (b1, b2) = (vertices[j], vertices[(j + 1) % n]);
            if segments_intersect(&a1, &a2, &b1, &b2) {
                return true;
            }
        }
    }
    false
}

fn cross(o: &Point2<f64>, a: &Point2<f64>, b: &Point2<f64>) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

fn on_segment(p: &Point2<f64>, q: &Point2<f64>, r: &Point2<f64>) -> bool {
    q.x <= p.x.max(r.x) && q.x >= p.x.min(r.x) && q.y <= p.y.max(r.y) && q.y >= p.y.min(r.y)
}

fn segments_intersect(p1: &Point2<f64>, p2: &Point2<f64>, q1: &Point2<f64>, q2: &Point2<f64>) -> bool {
    let d1 = cross(q1, q2, p1);
    let d2 = cross(q1, q2, p2);
    let d3 = cross(p1, p2, q1);
    let d4 = cross(p1, p2, q2);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }

    (d1 == 0.0 && on_segment(q1, p1, q2))
        || (d2 == 0.0 && on_segment(q1, p2, q2))
        || (d3 == 0.0 && on_segment(p1, q1, p2))
        || (d4 == 0.0 && on_segment(p1, q2, p2))
}
