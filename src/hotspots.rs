//! Hotspot storage, projection and hit-testing.
//!
//! Polygons arrive in percentage coordinates of a fixed 1920x1080 reference
//! frame and are letterboxed into the actual viewport, so they stay aligned
//! with the aerial video regardless of the container aspect ratio.

use crate::api::HotspotRecord;
use std::collections::HashMap;

pub const REFERENCE_WIDTH: f32 = 1920.0;
pub const REFERENCE_HEIGHT: f32 = 1080.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotspotKind {
    /// Triggers the dive-in / floor-level / zoom-out sequence.
    Primary,
    /// Only shows an informational overlay.
    Secondary,
}

impl HotspotKind {
    fn parse(raw: &str) -> Self {
        match raw {
            "primary" => HotspotKind::Primary,
            _ => HotspotKind::Secondary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone)]
pub struct Hotspot {
    pub id: String,
    pub title: String,
    pub kind: HotspotKind,
    pub points: Vec<Point>,
    pub description: String,
    pub house_id: Option<u32>,
}

/// A hotspot polygon projected into pixel space, ready to draw or hit-test.
#[derive(Debug, Clone)]
pub struct PixelPolygon {
    pub hotspot_id: String,
    pub kind: HotspotKind,
    pub points: Vec<(f32, f32)>,
}

/// Letterbox mapping from the reference frame into a viewport.
#[derive(Debug, Clone, Copy)]
pub struct Projection {
    pub scale: f32,
    pub offset_x: f32,
    pub offset_y: f32,
}

impl Projection {
    pub fn for_viewport(width: u32, height: u32) -> Self {
        let scale = (width as f32 / REFERENCE_WIDTH).min(height as f32 / REFERENCE_HEIGHT);
        let offset_x = (width as f32 - REFERENCE_WIDTH * scale) / 2.0;
        let offset_y = (height as f32 - REFERENCE_HEIGHT * scale) / 2.0;
        Self {
            scale,
            offset_x,
            offset_y,
        }
    }

    /// Map a percentage-space point to viewport pixels.
    pub fn to_pixels(&self, point: Point) -> (f32, f32) {
        (
            self.offset_x + point.x / 100.0 * REFERENCE_WIDTH * self.scale,
            self.offset_y + point.y / 100.0 * REFERENCE_HEIGHT * self.scale,
        )
    }
}

/// Holds the active house's hotspots. Replaced wholesale on house load.
#[derive(Debug, Default)]
pub struct HotspotRegistry {
    hotspots: Vec<Hotspot>,
    by_id: HashMap<String, usize>,
}

impl HotspotRegistry {
    /// Build a registry from backend records. A hotspot with fewer than 3
    /// points or non-finite coordinates is skipped; the rest still render.
    pub fn from_records(records: Vec<HotspotRecord>) -> Self {
        let mut hotspots = Vec::new();
        let mut by_id = HashMap::new();
        for record in records {
            let points: Vec<Point> = record
                .points
                .iter()
                .map(|p| Point { x: p.x, y: p.y })
                .collect();
            if points.len() < 3 {
                tracing::warn!(
                    "Hotspot {} has {} points, skipping",
                    record.id,
                    points.len()
                );
                continue;
            }
            if points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
                tracing::warn!("Hotspot {} has invalid coordinates, skipping", record.id);
                continue;
            }
            by_id.insert(record.id.clone(), hotspots.len());
            hotspots.push(Hotspot {
                id: record.id,
                title: record.title,
                kind: HotspotKind::parse(&record.kind),
                points,
                description: record.description.unwrap_or_default(),
                house_id: record.house_id,
            });
        }
        Self { hotspots, by_id }
    }

    pub fn len(&self) -> usize {
        self.hotspots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hotspots.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Hotspot> {
        self.by_id.get(id).map(|&index| &self.hotspots[index])
    }

    /// Project every polygon into pixel space for the given viewport.
    pub fn project(&self, width: u32, height: u32) -> Vec<PixelPolygon> {
        let projection = Projection::for_viewport(width, height);
        self.hotspots
            .iter()
            .map(|hotspot| PixelPolygon {
                hotspot_id: hotspot.id.clone(),
                kind: hotspot.kind,
                points: hotspot
                    .points
                    .iter()
                    .map(|&p| projection.to_pixels(p))
                    .collect(),
            })
            .collect()
    }

    /// Find the topmost hotspot containing the given pixel position.
    pub fn hit_test(&self, width: u32, height: u32, x: f32, y: f32) -> Option<&Hotspot> {
        let projection = Projection::for_viewport(width, height);
        self.hotspots.iter().rev().find(|hotspot| {
            let polygon: Vec<(f32, f32)> = hotspot
                .points
                .iter()
                .map(|&p| projection.to_pixels(p))
                .collect();
            point_in_polygon(x, y, &polygon)
        })
    }
}

/// Standard ray-casting point-in-polygon test.
pub fn point_in_polygon(x: f32, y: f32, polygon: &[(f32, f32)]) -> bool {
    if polygon.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (xi, yi) = polygon[i];
        let (xj, yj) = polygon[j];
        if ((yi > y) != (yj > y)) && (x < (xj - xi) * (y - yi) / (yj - yi) + xi) {
            inside = !inside;
        }
        j = i;
    }
    inside
}
