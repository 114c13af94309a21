//! Read-only data API client for the tour backend.
//!
//! Every response is treated as untrusted: missing arrays, null video ids and
//! unknown asset ids must degrade gracefully rather than abort a tour.

use crate::media::{FetchHandle, MediaFetcher};
use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;

/// A polygon point in percentage coordinates of the reference frame.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PointDto {
    #[serde(default)]
    pub x: f32,
    #[serde(default)]
    pub y: f32,
}

/// Hotspot record as served by the backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotspotRecord {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub points: Vec<PointDto>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub house_id: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HotspotsResponse {
    #[serde(default)]
    pub hotspots: Vec<HotspotRecord>,
}

/// Video asset record as served by the backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub house_id: Option<u32>,
    #[serde(default)]
    pub hotspot_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AssetsResponse {
    #[serde(default)]
    pub assets: Vec<AssetRecord>,
}

/// Reference to a video asset by id. The id may be null or dangling.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRef {
    #[serde(default)]
    pub video_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HouseVideoRecord {
    #[serde(default)]
    pub aerial: Option<VideoRef>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HouseVideosResponse {
    #[serde(default)]
    pub house_video: Option<HouseVideoRecord>,
}

/// Per-hotspot video legs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotspotVideoRecord {
    #[serde(default)]
    pub hotspot_id: Option<String>,
    #[serde(default)]
    pub dive_in: Option<VideoRef>,
    #[serde(default)]
    pub floor_level: Option<VideoRef>,
    #[serde(default)]
    pub zoom_out: Option<VideoRef>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotspotVideosResponse {
    #[serde(default)]
    pub hotspot_videos: Vec<HotspotVideoRecord>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalVideosResponse {
    #[serde(default)]
    pub global_videos: HashMap<String, VideoRef>,
}

/// Playlist legs keyed by hotspot id.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistLegs {
    #[serde(default)]
    pub dive_in: Option<VideoRef>,
    #[serde(default)]
    pub floor_level: Option<VideoRef>,
    #[serde(default)]
    pub zoom_out: Option<VideoRef>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistsResponse {
    #[serde(default)]
    pub playlists: HashMap<String, PlaylistLegs>,
}

/// Read operations the viewer needs from the backend.
///
/// The production implementation talks HTTP; tests substitute an in-memory
/// source.
pub trait TourDataSource: Send + Sync {
    fn hotspots(&self, house_id: u32) -> BoxFuture<'_, Result<HotspotsResponse>>;
    fn assets(&self, house_id: u32) -> BoxFuture<'_, Result<AssetsResponse>>;
    fn house_videos(&self, house_id: u32) -> BoxFuture<'_, Result<HouseVideosResponse>>;
    fn hotspot_videos(&self, house_id: u32) -> BoxFuture<'_, Result<HotspotVideosResponse>>;
    fn global_videos(&self) -> BoxFuture<'_, Result<GlobalVideosResponse>>;
    fn playlists(&self, house_id: u32) -> BoxFuture<'_, Result<PlaylistsResponse>>;
}

/// HTTP-backed data source.
pub struct HttpDataSource {
    client: Client,
    base_url: String,
    device_id: Option<String>,
}

impl HttpDataSource {
    pub fn new(client: Client, base_url: String, device_id: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            device_id,
        }
    }

    fn url(&self, path: &str, house_id: Option<u32>) -> String {
        let mut url = format!("{}{}", self.base_url, path);
        let mut sep = '?';
        if let Some(house_id) = house_id {
            url.push(sep);
            url.push_str(&format!("houseId={}", house_id));
            sep = '&';
        }
        if let Some(ref device) = self.device_id {
            url.push(sep);
            url.push_str(&format!("device={}", urlencoding::encode(device)));
        }
        url
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: String) -> Result<T> {
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?
            .error_for_status()
            .context("Server returned error")?;
        response.json().await.context("Failed to parse response")
    }
}

impl TourDataSource for HttpDataSource {
    fn hotspots(&self, house_id: u32) -> BoxFuture<'_, Result<HotspotsResponse>> {
        let url = self.url("/api/hotspots", Some(house_id));
        Box::pin(self.get_json(url))
    }

    fn assets(&self, house_id: u32) -> BoxFuture<'_, Result<AssetsResponse>> {
        let url = self.url("/api/assets", Some(house_id));
        Box::pin(self.get_json(url))
    }

    fn house_videos(&self, house_id: u32) -> BoxFuture<'_, Result<HouseVideosResponse>> {
        let url = self.url("/api/house-videos", Some(house_id));
        Box::pin(self.get_json(url))
    }

    fn hotspot_videos(&self, house_id: u32) -> BoxFuture<'_, Result<HotspotVideosResponse>> {
        let url = self.url("/api/hotspot-videos", Some(house_id));
        Box::pin(self.get_json(url))
    }

    fn global_videos(&self) -> BoxFuture<'_, Result<GlobalVideosResponse>> {
        let url = self.url("/api/global-videos", None);
        Box::pin(self.get_json(url))
    }

    fn playlists(&self, house_id: u32) -> BoxFuture<'_, Result<PlaylistsResponse>> {
        let url = self.url("/api/playlists", Some(house_id));
        Box::pin(self.get_json(url))
    }
}

/// Streams asset bytes over HTTP for the preloader.
pub struct HttpMediaFetcher {
    client: Client,
}

impl HttpMediaFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl MediaFetcher for HttpMediaFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<FetchHandle>> {
        Box::pin(async move {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .context("Failed to send request")?
                .error_for_status()
                .context("Server returned error")?;
            let content_length = response.content_length();
            let stream = response
                .bytes_stream()
                .map_err(anyhow::Error::from)
                .boxed();
            Ok(FetchHandle {
                content_length,
                stream,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn url_includes_house_and_device() {
        let source = HttpDataSource::new(
            Client::new(),
            "http://backend/".into(),
            Some("kiosk 1".into()),
        );
        assert_eq!(
            source.url("/api/hotspots", Some(3)),
            "http://backend/api/hotspots?houseId=3&device=kiosk%201"
        );
        assert_eq!(
            source.url("/api/global-videos", None),
            "http://backend/api/global-videos?device=kiosk%201"
        );
    }

    #[test]
    fn tolerates_missing_fields() {
        let parsed: HotspotsResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.hotspots.is_empty());

        let parsed: PlaylistsResponse =
            serde_json::from_str(r#"{"playlists":{"h1":{"diveIn":{"videoId":null}}}}"#).unwrap();
        assert!(parsed.playlists["h1"]
            .dive_in
            .as_ref()
            .unwrap()
            .video_id
            .is_none());
    }
}
