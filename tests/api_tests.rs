//! Integration tests for the HTTP API.
//!
//! These tests spawn a real Axum server on a random port and use reqwest
//! to hit it with actual HTTP requests. External providers are replaced by
//! scripted stages; mesh optimization is the real one.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use avatar_forge::daemon;
use avatar_forge::mesh::{glb, stl, Mesh, MeshOptions};
use avatar_forge::models::printer::get_profile;
use avatar_forge::models::{ServiceConfig, Stage};
use avatar_forge::pipeline::PipelineEvent;
use avatar_forge::server::{self, AppState};
use avatar_forge::stages::mock::{MockStage, MockStageConfig};
use avatar_forge::stages::optimize::OptimizeMeshAdapter;
use avatar_forge::stages::StageSet;
use avatar_forge::storage::ArtifactStore;

use futures_util::StreamExt;
use reqwest::multipart::{Form, Part};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Test server
// ---------------------------------------------------------------------------

fn cube_glb() -> Vec<u8> {
    let vertices = vec![
        [0.0, 0.0, 0.0],
        [1.0, 0.0, 0.0],
        [1.0, 1.0, 0.0],
        [0.0, 1.0, 0.0],
        [0.0, 0.0, 1.0],
        [1.0, 0.0, 1.0],
        [1.0, 1.0, 1.0],
        [0.0, 1.0, 1.0],
    ];
    let faces = vec![
        [0, 2, 1],
        [0, 3, 2],
        [4, 5, 6],
        [4, 6, 7],
        [0, 1, 5],
        [0, 5, 4],
        [3, 7, 6],
        [3, 6, 2],
        [0, 4, 7],
        [0, 7, 3],
        [1, 2, 6],
        [1, 6, 5],
    ];
    glb::write_glb(&Mesh::new(vertices, faces).unwrap()).unwrap()
}

fn test_stages(root: &Path, face_fails: bool) -> StageSet {
    let out = root.join("stage_outputs");
    let face = if face_fails {
        MockStage::failing(Stage::FaceDetection, "No face detected")
    } else {
        MockStage::succeeding(Stage::FaceDetection)
    };
    let generate = MockStage::new(
        Stage::Generation3D,
        MockStageConfig {
            output_dir: Some(out.clone()),
            artifact_name: Some("model.glb".to_string()),
            artifact_bytes: Some(cube_glb()),
            pending_polls: 2,
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        },
    );
    let optimize = OptimizeMeshAdapter::new(
        get_profile("ender3v2").unwrap(),
        MeshOptions {
            target_height: 80.0,
            max_faces: 100_000,
            repair: true,
            simplify: true,
        },
        ArtifactStore::new(root),
    );
    StageSet::new(
        Arc::new(face),
        Arc::new(MockStage::writing_to(Stage::Cartoonization, &out)),
        Arc::new(generate),
        Arc::new(optimize),
    )
    .unwrap()
}

/// Spawn a test server on a random port. Returns the base URL and the data
/// directory, which must outlive the server.
async fn spawn_test_server(face_fails: bool) -> (String, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let config = ServiceConfig {
        data_dir: Some(tmp.path().to_path_buf()),
        max_upload_size_mb: 1,
        ..ServiceConfig::default()
    };
    let artifacts = ArtifactStore::new(tmp.path());
    artifacts.ensure_dirs().await.unwrap();

    let (event_tx, _) = broadcast::channel::<PipelineEvent>(256);
    let service = daemon::build_service(
        &config,
        artifacts,
        test_stages(tmp.path(), face_fails),
        event_tx.clone(),
    );
    let state = Arc::new(AppState {
        service: Arc::new(service),
        event_tx,
        config: Arc::new(config),
        start_time: Instant::now(),
    });
    let router = server::create_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind to random port");
    let addr = listener.local_addr().expect("get local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    (format!("http://{}", addr), tmp)
}

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
    buf.into_inner()
}

async fn upload(client: &reqwest::Client, base_url: &str, bytes: Vec<u8>, name: &str) -> reqwest::Response {
    let part = Part::bytes(bytes)
        .file_name(name.to_string())
        .mime_str("image/png")
        .unwrap();
    client
        .post(format!("{}/upload", base_url))
        .multipart(Form::new().part("file", part))
        .send()
        .await
        .unwrap()
}

/// Poll `/status` until the job reaches a terminal status.
async fn wait_for_terminal(client: &reqwest::Client, base_url: &str, job_id: &str) -> serde_json::Value {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let json: serde_json::Value = client
            .get(format!("{}/status/{}", base_url, job_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let status = json["status"].as_str().unwrap_or_default().to_string();
        if status == "completed" || status == "failed" {
            return json;
        }
        assert!(Instant::now() < deadline, "job {} stuck in {}", job_id, status);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_root_and_health() {
    let (base_url, _tmp) = spawn_test_server(false).await;
    let client = reqwest::Client::new();

    let json: serde_json::Value = client
        .get(format!("{}/", base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(json["service"], "avatar-forge");
    assert_eq!(json["status"], "running");

    let resp = client
        .get(format!("{}/health", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["total_jobs"], 0);
    assert_eq!(json["active_jobs"], 0);
    assert_eq!(json["printer_profile"], "ender3v2");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_upload_to_stl_download() {
    let (base_url, _tmp) = spawn_test_server(false).await;
    let client = reqwest::Client::new();

    let resp = upload(&client, &base_url, png_bytes(512, 512), "portrait.png").await;
    assert_eq!(resp.status(), 200);
    let receipt: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(receipt["status"], "pending");
    assert_eq!(
        receipt["message"],
        "Photo uploaded successfully. Processing started."
    );
    let job_id = receipt["job_id"].as_str().unwrap().to_string();

    let status = wait_for_terminal(&client, &base_url, &job_id).await;
    assert_eq!(status["status"], "completed", "status: {}", status);
    assert_eq!(status["progress"], 100);
    assert_eq!(status["current_step"], "completed");
    let files = status["output_files"].as_object().unwrap();
    assert!(files.contains_key("cartoon"));
    assert!(files.contains_key("model_3d"));
    assert!(files.contains_key("stl"));

    let resp = client
        .get(format!("{}/download/{}/stl", base_url, job_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let disposition = resp
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.contains(".stl"), "{}", disposition);
    let bytes = resp.bytes().await.unwrap();
    let mesh = stl::read_binary_stl(&bytes).unwrap();
    let bounds = mesh.bounds().unwrap();
    assert!((bounds.dimensions()[2] - 80.0).abs() < 0.01);
    assert!(bounds.min[2].abs() < 1e-3);

    let resp = client
        .get(format!("{}/preview/{}", base_url, job_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let preview = resp.bytes().await.unwrap();
    assert_eq!(&preview[..4], b"glTF");

    let health: serde_json::Value = client
        .get(format!("{}/health", base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["total_jobs"], 1);
    assert_eq!(health["jobs"]["completed"], 1);
}

#[tokio::test]
async fn test_no_face_job_fails_without_outputs() {
    let (base_url, _tmp) = spawn_test_server(true).await;
    let client = reqwest::Client::new();

    let receipt: serde_json::Value = upload(&client, &base_url, png_bytes(600, 600), "me.png")
        .await
        .json()
        .await
        .unwrap();
    let job_id = receipt["job_id"].as_str().unwrap().to_string();

    let status = wait_for_terminal(&client, &base_url, &job_id).await;
    assert_eq!(status["status"], "failed");
    assert_eq!(status["error"], "No face detected");
    assert!(status["output_files"].is_null());

    let resp = client
        .get(format!("{}/download/{}/stl", base_url, job_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["error"], "not_ready");
}

#[tokio::test]
async fn test_upload_rejections() {
    let (base_url, _tmp) = spawn_test_server(false).await;
    let client = reqwest::Client::new();

    let resp = upload(&client, &base_url, png_bytes(100, 100), "tiny.png").await;
    assert_eq!(resp.status(), 400);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert!(json["message"].as_str().unwrap().contains("Image too small"));

    let resp = upload(&client, &base_url, b"hello".to_vec(), "notes.txt").await;
    assert_eq!(resp.status(), 400);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert!(json["message"].as_str().unwrap().contains("Invalid file type"));

    let resp = upload(&client, &base_url, vec![0u8; 1024 * 1024 + 10], "big.png").await;
    assert_eq!(resp.status(), 413);

    let health: serde_json::Value = client
        .get(format!("{}/health", base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["total_jobs"], 0);
}

#[tokio::test]
async fn test_unknown_job_returns_404() {
    let (base_url, _tmp) = spawn_test_server(false).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!(
            "{}/status/0190a4c2-0000-7000-8000-000000000000",
            base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["error"], "not_found");

    let resp = client
        .get(format!("{}/status/not-a-uuid", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_sse_streams_job_events() {
    let (base_url, _tmp) = spawn_test_server(false).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/api/events", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let mut stream = resp.bytes_stream();

    upload(&client, &base_url, png_bytes(512, 512), "portrait.png").await;

    let collected = tokio::time::timeout(Duration::from_secs(20), async {
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            text.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
            if text.contains("event: job_completed") {
                break;
            }
        }
        text
    })
    .await
    .expect("job_completed event within timeout");

    assert!(collected.contains("event: stage_started"));
    assert!(collected.contains("event: stage_completed"));
    assert!(collected.contains("\"3d_generation\""));
    assert!(collected.contains("event: job_completed"));
}
