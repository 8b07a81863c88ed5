//! HTTP adapter for the streaming engine
//!
//! Thin axum surface over the engine: playlist and segment delivery plus the
//! operator endpoints (stats, metadata views, cache eviction). Authentication
//! and session handling live upstream of this router.

use crate::engine::StreamingEngine;
use crate::errors::{StreamError, StreamResult};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::debug;

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";
/// Playlists can change when a media item is re-initialized; segments never
/// change once written.
const PLAYLIST_CACHE_CONTROL: &str = "public, max-age=3600";
const SEGMENT_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

/// Build the `/hls` router.
pub fn hls_router(engine: Arc<StreamingEngine>) -> Router {
    Router::new()
        .route("/hls/stats", get(stats))
        .route("/hls/metadata", get(all_metadata))
        .route("/hls/cache", delete(clear_cache))
        .route("/hls/{media_id}/metadata", get(media_metadata))
        .route("/hls/{media_id}/cache", delete(evict_media))
        .route("/hls/{media_id}/master.m3u8", get(master_playlist))
        .route(
            "/hls/{media_id}/{quality}/playlist.m3u8",
            get(variant_playlist),
        )
        .route("/hls/{media_id}/{quality}/{segment}", get(segment))
        .with_state(engine)
}

async fn stats(State(engine): State<Arc<StreamingEngine>>) -> Response {
    Json(engine.stats().await).into_response()
}

async fn all_metadata(State(engine): State<Arc<StreamingEngine>>) -> Response {
    let entries: Vec<_> = engine
        .metadata()
        .get_all()
        .iter()
        .map(|m| m.as_ref().clone())
        .collect();
    Json(entries).into_response()
}

async fn media_metadata(
    State(engine): State<Arc<StreamingEngine>>,
    Path(media_id): Path<String>,
) -> StreamResult<Response> {
    let metadata = engine
        .metadata()
        .get(&media_id)
        .ok_or(StreamError::NotFound {
            media_id: media_id.clone(),
        })?;
    Ok(Json(metadata.as_ref().clone()).into_response())
}

async fn evict_media(
    State(engine): State<Arc<StreamingEngine>>,
    Path(media_id): Path<String>,
) -> StreamResult<Response> {
    let evicted = engine.evict(&media_id).await?;
    Ok(Json(json!({ "media_id": media_id, "evicted": evicted })).into_response())
}

async fn clear_cache(State(engine): State<Arc<StreamingEngine>>) -> StreamResult<Response> {
    let removed = engine.evict_all().await?;
    Ok(Json(json!({ "removed": removed })).into_response())
}

async fn master_playlist(
    State(engine): State<Arc<StreamingEngine>>,
    Path(media_id): Path<String>,
) -> StreamResult<Response> {
    let path = engine.initialize_streaming(&media_id).await?;
    debug!(media_id, "Serving master playlist");
    serve_text_file(&path).await
}

async fn variant_playlist(
    State(engine): State<Arc<StreamingEngine>>,
    Path((media_id, quality)): Path<(String, String)>,
) -> StreamResult<Response> {
    engine.initialize_streaming(&media_id).await?;
    let metadata = engine
        .metadata()
        .get(&media_id)
        .ok_or(StreamError::NotFound {
            media_id: media_id.clone(),
        })?;
    if metadata.profile(&quality).is_none() {
        return Err(StreamError::UnknownQuality { quality });
    }

    let path = engine.config().variant_playlist_path(&media_id, &quality);
    debug!(media_id, quality, "Serving variant playlist");
    serve_text_file(&path).await
}

async fn segment(
    State(engine): State<Arc<StreamingEngine>>,
    Path((media_id, quality, segment)): Path<(String, String, String)>,
) -> StreamResult<Response> {
    let path = engine.get_segment(&media_id, &quality, &segment).await?;

    let file = File::open(&path).await?;
    let stream = ReaderStream::new(file);
    let response = Response::builder()
        .header(header::CONTENT_TYPE, SEGMENT_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, SEGMENT_CACHE_CONTROL)
        .body(Body::from_stream(stream))
        .map_err(|e| StreamError::Io(std::io::Error::other(e)))?;
    Ok(response)
}

async fn serve_text_file(path: &std::path::Path) -> StreamResult<Response> {
    let contents = tokio::fs::read_to_string(path).await?;
    let response = Response::builder()
        .header(header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, PLAYLIST_CACHE_CONTROL)
        .body(Body::from(contents))
        .map_err(|e| StreamError::Io(std::io::Error::other(e)))?;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use async_trait::async_trait;
    use axum::http::{Request, StatusCode};
    use media_catalog::{CatalogError, MediaCatalog, MediaRecord};
    use tower::util::ServiceExt;

    struct EmptyCatalog;

    #[async_trait]
    impl MediaCatalog for EmptyCatalog {
        async fn find_media(&self, _media_id: &str) -> Result<Option<MediaRecord>, CatalogError> {
            Ok(None)
        }
    }

    fn test_router(root: &std::path::Path) -> Router {
        let config = StreamConfig {
            hls_root: root.to_path_buf(),
            prefetch_enabled: false,
            ..StreamConfig::default()
        };
        hls_router(StreamingEngine::new(config, Arc::new(EmptyCatalog)))
    }

    async fn status_of(router: Router, method: &str, uri: &str) -> StatusCode {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        router.oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn stats_endpoint_responds() {
        let dir = tempfile::tempdir().unwrap();
        let status = status_of(test_router(dir.path()), "GET", "/hls/stats").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_segment_name_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let status = status_of(
            test_router(dir.path()),
            "GET",
            "/hls/abc/720p/segment_7.ts",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_media_master_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let status = status_of(test_router(dir.path()), "GET", "/hls/ghost/master.m3u8").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cache_eviction_endpoints_respond() {
        let dir = tempfile::tempdir().unwrap();
        let router = test_router(dir.path());
        let status = status_of(router.clone(), "DELETE", "/hls/abc/cache").await;
        assert_eq!(status, StatusCode::OK);
        let status = status_of(router, "DELETE", "/hls/cache").await;
        assert_eq!(status, StatusCode::OK);
    }
}
