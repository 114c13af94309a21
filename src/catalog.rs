//! Per-house asset catalog.
//!
//! Resolves hotspot ids and playlist legs to concrete video assets. Built
//! fresh from the backend responses on every house load; dangling references
//! resolve to `None` instead of failing.

use crate::api::{
    AssetsResponse, GlobalVideosResponse, HotspotVideosResponse, HouseVideosResponse,
    PlaylistsResponse,
};
use std::collections::HashMap;

/// Role a video plays in the tour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    Aerial,
    DiveIn,
    FloorLevel,
    ZoomOut,
    Transition,
    Other,
}

impl AssetKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "aerial" => AssetKind::Aerial,
            "diveIn" | "dive_in" => AssetKind::DiveIn,
            "floorLevel" | "floor_level" => AssetKind::FloorLevel,
            "zoomOut" | "zoom_out" => AssetKind::ZoomOut,
            "transition" => AssetKind::Transition,
            _ => AssetKind::Other,
        }
    }
}

/// A playable video asset.
#[derive(Debug, Clone)]
pub struct Asset {
    pub id: String,
    pub kind: AssetKind,
    pub url: String,
    pub hotspot_id: Option<String>,
}

/// One leg of a hotspot sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    DiveIn,
    FloorLevel,
    ZoomOut,
}

impl Leg {
    pub fn label(&self) -> &'static str {
        match self {
            Leg::DiveIn => "dive-in",
            Leg::FloorLevel => "floor-level",
            Leg::ZoomOut => "zoom-out",
        }
    }
}

#[derive(Debug, Clone, Default)]
struct PlaylistEntry {
    dive_in: Option<String>,
    floor_level: Option<String>,
    zoom_out: Option<String>,
}

/// Resolved view of one house's assets, playlists and transition clips.
#[derive(Debug, Default)]
pub struct AssetCatalog {
    assets: HashMap<String, Asset>,
    playlists: HashMap<String, PlaylistEntry>,
    aerial_video: Option<String>,
    global_videos: HashMap<String, String>,
}

impl AssetCatalog {
    /// Merge the backend responses into a resolvable catalog.
    ///
    /// `playlists` wins over `hotspot_videos` where both name a leg; the
    /// latter fills gaps left by sparse playlists.
    pub fn build(
        assets: AssetsResponse,
        house_videos: HouseVideosResponse,
        hotspot_videos: HotspotVideosResponse,
        playlists: PlaylistsResponse,
        global_videos: GlobalVideosResponse,
    ) -> Self {
        let mut asset_map = HashMap::new();
        for record in assets.assets {
            let Some(url) = record.url.filter(|u| !u.is_empty()) else {
                tracing::warn!("Asset {} has no url, skipping", record.id);
                continue;
            };
            asset_map.insert(
                record.id.clone(),
                Asset {
                    id: record.id,
                    kind: AssetKind::parse(&record.kind),
                    url,
                    hotspot_id: record.hotspot_id,
                },
            );
        }

        let mut entries: HashMap<String, PlaylistEntry> = HashMap::new();
        for record in hotspot_videos.hotspot_videos {
            let Some(hotspot_id) = record.hotspot_id else {
                continue;
            };
            let entry = entries.entry(hotspot_id).or_default();
            entry.dive_in = record.dive_in.and_then(|r| r.video_id).or(entry.dive_in.take());
            entry.floor_level = record
                .floor_level
                .and_then(|r| r.video_id)
                .or(entry.floor_level.take());
            entry.zoom_out = record.zoom_out.and_then(|r| r.video_id).or(entry.zoom_out.take());
        }
        for (hotspot_id, legs) in playlists.playlists {
            let entry = entries.entry(hotspot_id).or_default();
            if let Some(id) = legs.dive_in.and_then(|r| r.video_id) {
                entry.dive_in = Some(id);
            }
            if let Some(id) = legs.floor_level.and_then(|r| r.video_id) {
                entry.floor_level = Some(id);
            }
            if let Some(id) = legs.zoom_out.and_then(|r| r.video_id) {
                entry.zoom_out = Some(id);
            }
        }

        let aerial_video = house_videos
            .house_video
            .and_then(|record| record.aerial)
            .and_then(|r| r.video_id);

        let global_videos = global_videos
            .global_videos
            .into_iter()
            .filter_map(|(key, r)| r.video_id.map(|id| (key, id)))
            .collect();

        Self {
            assets: asset_map,
            playlists: entries,
            aerial_video,
            global_videos,
        }
    }

    /// Look an asset up by id.
    pub fn asset(&self, video_id: &str) -> Option<&Asset> {
        self.assets.get(video_id)
    }

    /// The house's looping aerial video, if configured and resolvable.
    pub fn aerial_asset(&self) -> Option<&Asset> {
        self.aerial_video.as_deref().and_then(|id| self.asset(id))
    }

    /// Resolve one leg of a hotspot's sequence. `None` means "no video
    /// assigned" and callers skip the leg.
    pub fn leg_asset(&self, hotspot_id: &str, leg: Leg) -> Option<&Asset> {
        let entry = self.playlists.get(hotspot_id)?;
        let video_id = match leg {
            Leg::DiveIn => entry.dive_in.as_deref(),
            Leg::FloorLevel => entry.floor_level.as_deref(),
            Leg::ZoomOut => entry.zoom_out.as_deref(),
        }?;
        let asset = self.asset(video_id);
        if asset.is_none() {
            tracing::warn!(
                "Hotspot {} {} references unknown asset {}",
                hotspot_id,
                leg.label(),
                video_id
            );
        }
        asset
    }

    /// House-to-house transition clip, keyed `"<from>-<to>"`.
    pub fn transition_asset(&self, from: u32, to: u32) -> Option<&Asset> {
        let key = format!("{}-{}", from, to);
        self.global_videos.get(&key).and_then(|id| self.asset(id))
    }

    /// Every asset the preloader should warm for this house: the aerial
    /// video plus every playlist leg that resolves.
    pub fn preload_assets(&self) -> Vec<Asset> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        if let Some(aerial) = self.aerial_asset() {
            seen.insert(aerial.id.clone());
            out.push(aerial.clone());
        }
        for hotspot_id in self.playlists.keys() {
            for leg in [Leg::DiveIn, Leg::FloorLevel, Leg::ZoomOut] {
                if let Some(asset) = self.leg_asset(hotspot_id, leg) {
                    if seen.insert(asset.id.clone()) {
                        out.push(asset.clone());
                    }
                }
            }
        }
        out
    }
}
