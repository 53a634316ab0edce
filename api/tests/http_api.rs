use std::fs;
use std::io::{Cursor, Read};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use reqwest::StatusCode;
use serde_json::{json, Value};
use tempfile::TempDir;
use vision_api::routes::{DeletionResponse, ImageInfo};
use vision_api::{DirectoryPhotoStore, MediaServer};
use vision_common::frame::{FrameCache, FrameSink};

struct TestServer {
    server: MediaServer,
    photos: PathBuf,
    base: String,
    client: reqwest::Client,
    _root: TempDir,
}

impl TestServer {
    async fn spawn() -> Self {
        let root = TempDir::new().expect("tempdir");
        let photos = root.path().join("photos");
        let frames = Arc::new(FrameCache::new());
        let store = Arc::new(DirectoryPhotoStore::new(&photos, Arc::clone(&frames)));
        let server = MediaServer::new(frames, store)
            .with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_shutdown_timeouts(Duration::from_millis(200), Duration::from_secs(1));
        server.start(0).await.expect("start");
        let addr = server.local_addr().await.expect("bound address");
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .expect("client");
        Self {
            server,
            photos,
            base: format!("http://{addr}"),
            client,
            _root: root,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client.get(self.url(path)).send().await.expect("GET")
    }

    async fn post_json(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .expect("POST")
    }

    fn write_photo(&self, name: &str, body: &[u8], age_secs: u64) {
        write_photo(&self.photos, name, body, age_secs);
    }
}

fn write_photo(dir: &Path, name: &str, body: &[u8], age_secs: u64) {
    let path = dir.join(name);
    fs::write(&path, body).expect("write photo");
    fs::File::options()
        .write(true)
        .open(&path)
        .expect("open photo")
        .set_modified(SystemTime::now() - Duration::from_secs(age_secs))
        .expect("set mtime");
}

// ---------------------------------------------------------------------------
// Live view and static assets
// ---------------------------------------------------------------------------

#[tokio::test]
async fn image_is_404_until_a_frame_arrives() {
    let t = TestServer::spawn().await;
    assert_eq!(t.get("/image").await.status(), StatusCode::NOT_FOUND);

    let frame = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x10, 0x4A, 0xFF, 0xD9];
    t.server.push_frame(&frame);

    let resp = t.get("/image").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "image/jpeg");
    assert_eq!(resp.bytes().await.unwrap().to_vec(), frame);
}

#[tokio::test]
async fn image_follows_newest_frame() {
    let t = TestServer::spawn().await;
    t.server.push_frame(b"first");
    t.server.push_frame(b"second");
    assert_eq!(t.get("/image").await.bytes().await.unwrap().as_ref(), b"second");
}

#[tokio::test]
async fn serves_bundled_ui() {
    let t = TestServer::spawn().await;

    let index = t.get("/").await;
    assert_eq!(index.status(), StatusCode::OK);
    assert!(index.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/html"));
    assert!(index.text().await.unwrap().contains("/static/script.js"));

    let script = t.get("/static/script.js").await;
    assert_eq!(script.status(), StatusCode::OK);
    assert!(script.text().await.unwrap().contains("/images_list"));

    assert_eq!(t.get("/static/style.css").await.status(), StatusCode::OK);
    assert_eq!(t.get("/static/missing.js").await.status(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Capture and gallery listing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn capture_requires_a_ready_camera() {
    let t = TestServer::spawn().await;
    let resp = t.get("/capture").await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: DeletionResponse = resp.json().await.unwrap();
    assert_eq!(body.message, "Camera not ready.");
}

#[tokio::test]
async fn capture_persists_the_live_frame() {
    let t = TestServer::spawn().await;
    t.server.push_frame(b"captured-jpeg");

    assert_eq!(t.get("/capture").await.status(), StatusCode::ACCEPTED);

    let mut listed = Vec::new();
    for _ in 0..50 {
        listed = t
            .get("/images_list")
            .await
            .json::<Vec<ImageInfo>>()
            .await
            .unwrap();
        if !listed.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(listed.len(), 1);
    assert!(listed[0].filename.ends_with(".jpg"));

    let latest = t.get("/latest_image").await;
    assert_eq!(latest.status(), StatusCode::OK);
    assert_eq!(latest.bytes().await.unwrap().as_ref(), b"captured-jpeg");
}

#[tokio::test]
async fn images_list_is_newest_first() {
    let t = TestServer::spawn().await;
    t.write_photo("old.jpg", b"o", 600);
    t.write_photo("new.jpg", b"n", 5);
    t.write_photo("mid.jpg", b"m", 60);
    t.write_photo("readme.txt", b"x", 0);

    let resp = t.get("/images_list").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let raw: Value = resp.json().await.unwrap();
    let entries = raw.as_array().unwrap();
    let names: Vec<_> = entries
        .iter()
        .map(|e| e["filename"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["new.jpg", "mid.jpg", "old.jpg"]);
    assert!(entries[0]["timestamp"].as_i64().unwrap() > entries[1]["timestamp"].as_i64().unwrap());
    assert!(entries[0]["formattedDate"].as_str().unwrap().contains('/'));

    let latest = t.get("/latest_image").await;
    assert_eq!(latest.bytes().await.unwrap().as_ref(), b"n");
}

#[tokio::test]
async fn empty_and_missing_directories() {
    let t = TestServer::spawn().await;

    let resp = t.get("/images_list").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.json::<Value>().await.unwrap(), json!([]));
    assert_eq!(t.get("/latest_image").await.status(), StatusCode::NOT_FOUND);

    fs::remove_dir_all(&t.photos).unwrap();
    assert_eq!(t.get("/images_list").await.status(), StatusCode::NOT_FOUND);
    assert_eq!(t.get("/latest_image").await.status(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Single file download
// ---------------------------------------------------------------------------

#[tokio::test]
async fn image_file_serves_named_photo() {
    let t = TestServer::spawn().await;
    t.write_photo("2024-05-01-10-00-00-000.jpg", b"photo-body", 0);

    let resp = t.get("/image_file/2024-05-01-10-00-00-000.jpg").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "image/jpeg");
    assert_eq!(resp.bytes().await.unwrap().as_ref(), b"photo-body");
}

#[tokio::test]
async fn image_file_rejects_traversal_and_bad_names() {
    let t = TestServer::spawn().await;
    fs::write(t.photos.parent().unwrap().join("secret.jpg"), b"secret").unwrap();

    for path in [
        "/image_file/..%2Fsecret.jpg",
        "/image_file/%2E%2E%2F%2E%2E%2Fetc%2Fpasswd",
        "/image_file/..%5Csecret.jpg",
        "/image_file/a%20b.jpg",
        "/image_file/../../etc/passwd",
        "/image_file/missing.jpg",
    ] {
        let status = t.get(path).await.status();
        assert!(
            status == StatusCode::BAD_REQUEST || status == StatusCode::NOT_FOUND,
            "{path} answered {status}"
        );
    }

    assert_eq!(
        t.get("/image_file/..%2Fsecret.jpg").await.status(),
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        t.get("/image_file/missing.jpg").await.status(),
        StatusCode::NOT_FOUND
    );
    assert_eq!(t.get("/image_file/").await.status(), StatusCode::BAD_REQUEST);
}

#[cfg(unix)]
#[tokio::test]
async fn symlink_out_of_directory_is_never_served() {
    let t = TestServer::spawn().await;
    let secret = t.photos.parent().unwrap().join("secret.txt");
    fs::write(&secret, b"TOP-SECRET").unwrap();
    t.write_photo("kept.jpg", b"kept", 60);
    std::os::unix::fs::symlink(&secret, t.photos.join("zz.jpg")).unwrap();

    assert_eq!(t.get("/image_file/zz.jpg").await.status(), StatusCode::NOT_FOUND);

    let latest = t.get("/latest_image").await;
    assert_eq!(latest.status(), StatusCode::OK);
    assert_eq!(latest.bytes().await.unwrap().as_ref(), b"kept");

    let listed: Vec<ImageInfo> = t.get("/images_list").await.json().await.unwrap();
    let names: Vec<_> = listed.iter().map(|i| i.filename.as_str()).collect();
    assert_eq!(names, vec!["kept.jpg"]);
}

#[tokio::test]
async fn image_file_deleted_after_listing_is_404() {
    let t = TestServer::spawn().await;
    t.write_photo("gone.jpg", b"g", 0);
    let listed: Vec<ImageInfo> = t.get("/images_list").await.json().await.unwrap();
    assert_eq!(listed.len(), 1);

    fs::remove_file(t.photos.join("gone.jpg")).unwrap();
    assert_eq!(
        t.get("/image_file/gone.jpg").await.status(),
        StatusCode::NOT_FOUND
    );
}

// ---------------------------------------------------------------------------
// Zip download
// ---------------------------------------------------------------------------

#[tokio::test]
async fn zip_contains_existing_validated_files() {
    let t = TestServer::spawn().await;
    t.write_photo("a.jpg", b"alpha", 0);
    t.write_photo("b.jpg", b"bravo", 0);
    t.write_photo("c.jpg", b"charlie", 0);

    let resp = t
        .post_json(
            "/download_selected_zip",
            json!({ "filenames": ["a.jpg", "missing.jpg", "../c.jpg", "b.jpg"] }),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "application/zip");
    let disposition = resp.headers()["content-disposition"].to_str().unwrap().to_string();
    assert!(disposition.starts_with("attachment"));
    assert!(disposition.contains("selected_images.zip"));

    let bytes = resp.bytes().await.unwrap();
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes.to_vec())).unwrap();
    let mut names: Vec<_> = archive.file_names().map(str::to_string).collect();
    names.sort();
    assert_eq!(names, vec!["a.jpg", "b.jpg"]);

    let mut body = Vec::new();
    archive.by_name("a.jpg").unwrap().read_to_end(&mut body).unwrap();
    assert_eq!(body, b"alpha");
}

#[tokio::test]
async fn zip_of_nothing_is_404() {
    let t = TestServer::spawn().await;
    let resp = t
        .post_json(
            "/download_selected_zip",
            json!({ "filenames": ["missing.jpg", "../../etc/passwd"] }),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn zip_rejects_empty_or_malformed_requests() {
    let t = TestServer::spawn().await;
    let empty = t
        .post_json("/download_selected_zip", json!({ "filenames": [] }))
        .await;
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);

    let wrong_shape = t
        .post_json("/download_selected_zip", json!({ "files": ["a.jpg"] }))
        .await;
    assert_eq!(wrong_shape.status(), StatusCode::BAD_REQUEST);

    let not_json = t
        .client
        .post(t.url("/download_selected_zip"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(not_json.status(), StatusCode::BAD_REQUEST);
    let body: DeletionResponse = not_json.json().await.unwrap();
    assert!(body.message.starts_with("Invalid request for ZIP download"));
}

// ---------------------------------------------------------------------------
// Batch delete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delete_reports_per_file_outcomes() {
    let t = TestServer::spawn().await;
    t.write_photo("a.jpg", b"a", 0);

    let resp = t
        .post_json(
            "/delete_selected_images",
            json!({ "filenames": ["a.jpg", "missing.jpg", "../etc"] }),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: DeletionResponse = resp.json().await.unwrap();
    assert_eq!(body.message, "Batch deletion process completed with some issues.");
    assert_eq!(
        body.details.unwrap(),
        vec![
            "Deleted: a.jpg",
            "Not found or access denied: missing.jpg",
            "Skipped invalid filename: ../etc",
        ]
    );
    assert!(!t.photos.join("a.jpg").exists());
}

#[tokio::test]
async fn delete_all_succeeded() {
    let t = TestServer::spawn().await;
    t.write_photo("a.jpg", b"a", 0);
    t.write_photo("b.jpg", b"b", 0);

    let body: DeletionResponse = t
        .post_json("/delete_selected_images", json!({ "filenames": ["a.jpg", "b.jpg"] }))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body.message, "All selected images processed successfully.");
    assert_eq!(body.details.unwrap().len(), 2);
}

#[tokio::test]
async fn delete_rejects_empty_or_malformed_requests() {
    let t = TestServer::spawn().await;
    let empty = t
        .post_json("/delete_selected_images", json!({ "filenames": [] }))
        .await;
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
    let body: DeletionResponse = empty.json().await.unwrap();
    assert_eq!(body.message, "No filenames provided for deletion.");

    let malformed = t
        .post_json("/delete_selected_images", json!({ "filenames": "a.jpg" }))
        .await;
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
}
