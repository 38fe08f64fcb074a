//! Saved frame sets: save, listing, soft delete and restore.

mod common;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
};
use common::{body_bytes, body_json, get, json_request, send, TestApp};
use serde_json::{json, Value};

const JPEG_B64: &str = "/9j/2Q==";

fn frame(index: u64, cars: u64, trucks: u64) -> Value {
    json!({
        "index": index,
        "base64": JPEG_B64,
        "vehicleCounts": [
            { "name": "car", "count": cars },
            { "name": "truck", "count": trucks },
        ],
    })
}

async fn save_three(app: &TestApp) -> Value {
    let response = json_request(
        app.router(),
        Method::POST,
        "/api/frames/save",
        json!({ "videoId": "run.mp4", "frames": [frame(3, 1, 0), frame(1, 2, 1), frame(2, 0, 4)] }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

async fn del(app: &TestApp, body: Value) -> axum::http::Response<Body> {
    json_request(app.router(), Method::POST, "/api/frames/del", body).await
}

#[tokio::test]
async fn save_writes_frames_and_aggregate_counts() {
    let app = TestApp::new();
    let saved = save_three(&app).await;
    assert_eq!(saved["frameCount"], 3);
    assert_eq!(
        saved["files"],
        json!(["frame-00001.jpg", "frame-00002.jpg", "frame-00003.jpg"])
    );

    let counts = body_json(get(app.router(), "/api/frames/counts?video=run.mp4").await).await;
    assert_eq!(counts["frameCount"], 3);
    assert_eq!(counts["aggregate"], json!({ "car": 3, "truck": 5 }));
    assert_eq!(counts["frames"][0]["index"], 1);
    assert_eq!(counts["frames"][0]["totalVehicles"], 3);

    let listed = body_json(get(app.router(), "/api/frames/list?video=run.mp4").await).await;
    assert_eq!(listed["files"].as_array().unwrap().len(), 3);

    let response = get(app.router(), "/api/frames/raw?video=run.mp4&file=frame-00002.jpg").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
    assert_eq!(&body_bytes(response).await[..], &[0xff, 0xd8, 0xff, 0xd9]);
}

#[tokio::test]
async fn delete_then_restore_returns_the_original_listing() {
    let app = TestApp::new();
    save_three(&app).await;
    let before = body_json(get(app.router(), "/api/frames/list?video=run.mp4").await).await["files"].clone();

    let response = del(&app, json!({ "videoId": "run.mp4", "file": "frame-00002.jpg" })).await;
    assert_eq!(response.status(), StatusCode::OK);
    let deleted = body_json(response).await;
    assert_eq!(deleted["action"], "delete");
    assert_eq!(deleted["remaining"], json!(["frame-00001.jpg", "frame-00003.jpg"]));

    let listing = body_json(del(&app, json!({ "videoId": "run.mp4", "action": "list" })).await).await;
    assert_eq!(listing["deleted"], json!(["frame-00002.jpg"]));
    assert_eq!(listing["activeCount"], 2);

    let response = del(
        &app,
        json!({ "videoId": "run.mp4", "action": "restore", "file": "frame-00002.jpg" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let restored = body_json(response).await;
    assert_eq!(restored["restored"], "frame-00002.jpg");
    assert_eq!(restored["remaining"], before);
}

#[tokio::test]
async fn delete_by_position_and_bad_targets() {
    let app = TestApp::new();
    save_three(&app).await;

    let deleted = body_json(del(&app, json!({ "videoId": "run.mp4", "frameNumber": 0 })).await).await;
    assert_eq!(deleted["deleted"], "frame-00001.jpg");

    let response = del(&app, json!({ "videoId": "run.mp4", "frameNumber": 9 })).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = del(&app, json!({ "videoId": "run.mp4", "file": "frame-00099.jpg" })).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = del(&app, json!({ "videoId": "run.mp4" })).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = del(&app, json!({ "videoId": "other.mp4", "frameNumber": 0 })).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = del(
        &app,
        json!({ "videoId": "run.mp4", "action": "restore", "file": "frame-00003.jpg" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sets_are_listed_and_deleted() {
    let app = TestApp::new();
    save_three(&app).await;

    let sets = body_json(get(app.router(), "/api/frames/sets").await).await;
    assert_eq!(
        sets["sets"],
        json!([{ "id": "run.mp4", "firstFrameFile": "frame-00001.jpg", "totalFrames": 3 }])
    );

    let response = send(
        app.router(),
        Request::delete("/api/frames/sets?video=run.mp4").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["existed"], true);
    assert_eq!(body["sets"], json!([]));
}

#[tokio::test]
async fn traversal_names_are_rejected() {
    let app = TestApp::new();
    let response = get(app.router(), "/api/frames/list?video=..").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = get(app.router(), "/api/frames/raw?video=run.mp4&file=..%2Fcounts.json").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
