//! Catalog listing, rename/delete, ranged streaming and thumbnails.

mod common;

use std::sync::atomic::Ordering;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
};
use common::{body_bytes, body_json, get, json_request, send, TestApp};
use serde_json::json;

#[tokio::test]
async fn listing_picks_up_files_copied_in_by_hand() {
    let app = TestApp::new();
    app.seed_video("manual.mp4", b"frames").await;
    app.seed_video("notes.txt", b"not a video").await;

    let response = get(app.router(), "/api/videos").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let videos = body["videos"].as_array().unwrap();
    assert_eq!(videos.len(), 1);
    assert_eq!(videos[0]["id"], "manual.mp4");
    assert_eq!(videos[0]["sizeBytes"], 6);
    assert_eq!(videos[0]["thumbnail"], "ready");
    assert_eq!(videos[0]["thumbnailUrl"], "/api/videos/thumb/manual.mp4.thumb.jpg");

    let record = app.state.catalog.get("manual.mp4").await.unwrap();
    assert!(record.is_some());
}

#[tokio::test]
async fn rename_keeps_the_extension_and_moves_the_thumbnail() {
    let app = TestApp::new();
    app.seed_video("old.mp4", b"abc").await;
    app.state.thumbs.ensure("old.mp4").await.unwrap();

    let response = json_request(
        app.router(),
        Method::PATCH,
        "/api/videos",
        json!({ "file": "old.mp4", "newName": "commute.mov" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["renamedTo"], "commute.mp4");

    assert!(app.uploads_dir().join("commute.mp4").exists());
    assert!(!app.uploads_dir().join("old.mp4").exists());
    let thumbs = app.state.config.thumbs_dir();
    assert!(thumbs.join("commute.mp4.thumb.jpg").exists());
    assert!(!thumbs.join("old.mp4.thumb.jpg").exists());
}

#[tokio::test]
async fn rename_onto_an_existing_video_conflicts() {
    let app = TestApp::new();
    app.seed_video("a.mp4", b"a").await;
    app.seed_video("b.mp4", b"b").await;

    let response = json_request(
        app.router(),
        Method::PATCH,
        "/api/videos",
        json!({ "file": "a.mp4", "newName": "b" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(tokio::fs::read(app.uploads_dir().join("b.mp4")).await.unwrap(), b"b");
}

#[tokio::test]
async fn delete_removes_video_and_thumbnail() {
    let app = TestApp::new();
    app.seed_video("gone.mp4", b"xyz").await;
    app.state.thumbs.ensure("gone.mp4").await.unwrap();

    let response = send(
        app.router(),
        Request::delete("/api/videos?file=gone.mp4").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["videos"], json!([]));
    assert!(!app.uploads_dir().join("gone.mp4").exists());
    assert!(!app.state.config.thumbs_dir().join("gone.mp4.thumb.jpg").exists());

    let response = send(
        app.router(),
        Request::delete("/api/videos?file=gone.mp4").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

fn ranged(uri: &str, range: &str) -> Request<Body> {
    Request::get(uri).header(header::RANGE, range).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn raw_serves_byte_ranges() {
    let app = TestApp::new();
    app.seed_video("clip.mp4", b"0123456789").await;

    let response = send(app.router(), ranged("/api/videos/raw/clip.mp4", "bytes=2-5")).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 2-5/10");
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "4");
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
    assert_eq!(&body_bytes(response).await[..], b"2345");

    let response = send(app.router(), ranged("/api/videos/raw/clip.mp4", "bytes=7-")).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(&body_bytes(response).await[..], b"789");

    let response = get(app.router(), "/api/videos/raw/clip.mp4").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
    assert_eq!(&body_bytes(response).await[..], b"0123456789");
}

#[tokio::test]
async fn raw_rejects_unsatisfiable_ranges_and_unknown_files() {
    let app = TestApp::new();
    app.seed_video("clip.webm", b"0123456789").await;

    let response = send(app.router(), ranged("/api/videos/raw/clip.webm", "bytes=20-")).await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */10");

    let response = send(app.router(), ranged("/api/videos/raw/clip.webm", "lines=1-2")).await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);

    let response = get(app.router(), "/api/videos/raw/missing.mp4").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn missing_thumbnail_falls_back_to_placeholder() {
    let app = TestApp::new();

    let response = get(app.router(), "/api/videos/thumb/nobody.mp4.thumb.jpg").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/gif");
    assert_eq!(response.headers()["x-thumb-placeholder"], "1");
    assert_eq!(&body_bytes(response).await[..6], b"GIF89a");
}

#[tokio::test]
async fn thumbnail_is_generated_lazily_and_revalidated_by_etag() {
    let app = TestApp::new();
    app.seed_video("drive.mp4", b"video").await;

    let response = get(app.router(), "/api/videos/thumb/drive.mp4.thumb.jpg").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
    let etag = response.headers()[header::ETAG].clone();
    assert_eq!(&body_bytes(response).await[..], &[0xff, 0xd8, 0xff, 0xd9]);

    let request = Request::get("/api/videos/thumb/drive.mp4.thumb.jpg")
        .header(header::IF_NONE_MATCH, etag)
        .body(Body::empty())
        .unwrap();
    let response = send(app.router(), request).await;
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(app.extractor.extractions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_thumbnail_requests_share_one_extraction() {
    let app = TestApp::new();
    app.seed_video("busy.mp4", b"video").await;

    let results = futures::future::join_all((0..5).map(|_| app.state.thumbs.ensure("busy.mp4"))).await;
    assert!(results.iter().all(|thumb| thumb.is_some()));
    assert_eq!(app.extractor.extractions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn uploaded_thumbnail_is_kept_unless_overwritten() {
    let app = TestApp::new();
    app.seed_video("cam.mp4", b"video").await;
    let payload = |overwrite: bool| {
        json!({
            "filename": "cam.mp4",
            "imageBase64": "data:image/jpeg;base64,/9j/2Q==",
            "overwrite": overwrite,
        })
    };

    let response = json_request(app.router(), Method::POST, "/api/videos/thumb/upload", payload(false)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["existed"], false);
    assert!(body["url"]
        .as_str()
        .unwrap()
        .starts_with("/api/videos/thumb/cam.mp4.thumb.jpg?v="));

    let body = body_json(json_request(app.router(), Method::POST, "/api/videos/thumb/upload", payload(false)).await).await;
    assert_eq!(body["existed"], true);

    let body = body_json(json_request(app.router(), Method::POST, "/api/videos/thumb/upload", payload(true)).await).await;
    assert_eq!(body["existed"], false);

    let response = json_request(
        app.router(),
        Method::POST,
        "/api/videos/thumb/upload",
        json!({ "filename": "cam.mp4", "imageBase64": "%%%" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
