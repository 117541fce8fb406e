use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum_test::multipart::{MultipartForm, Part};
use axum_test::TestServer;
use bytes::Bytes;
use queuework_api::setup::{routes::setup_routes, services::initialize_services};
use queuework_api::AppState;
use queuework_core::{Config, QueueworkConfig, StorageBackend};
use queuework_db::Repositories;
use queuework_storage::{DiskRegistry, LocalStorage, S3Storage, Storage};
use queuework_worker::TaskQueue;
use serde_json::{json, Value};
use tempfile::TempDir;
use uuid::Uuid;

struct TestApp {
    server: TestServer,
    state: Arc<AppState>,
    worker: TaskQueue,
    _local_dir: TempDir,
}

async fn test_app() -> TestApp {
    let config = Config(Box::new(QueueworkConfig {
        task_queue_poll_interval_ms: 10,
        session_sweep_interval_secs: 0,
        stale_job_reap_interval_secs: 0,
        ..Default::default()
    }));

    let local_dir = TempDir::new().unwrap();
    let local = Arc::new(
        LocalStorage::new(local_dir.path(), "http://localhost:4000/files".to_string())
            .await
            .unwrap()
            .with_signing_secret(b"0123456789abcdef0123456789abcdef".to_vec()),
    );
    let s3: Arc<dyn Storage> = Arc::new(S3Storage::from_store(
        Arc::new(object_store::memory::InMemory::new()),
        "queuework-test",
    ));
    let disks = DiskRegistry::new()
        .with_disk(StorageBackend::S3, s3)
        .with_local(local);

    let (state, worker) = initialize_services(&config, Repositories::in_memory(), disks);
    let router = setup_routes(&config, state.clone()).unwrap();

    TestApp {
        server: TestServer::new(router).unwrap(),
        state,
        worker,
        _local_dir: local_dir,
    }
}

/// Runs the whole chunked flow and returns the finalized document id.
async fn upload(app: &TestApp, filename: &str, chunks: &[&[u8]]) -> i64 {
    let total_size: usize = chunks.iter().map(|c| c.len()).sum();
    let init = app
        .server
        .post("/api/files/chunked/init")
        .json(&json!({
            "filename": filename,
            "total_size": total_size,
            "total_chunks": chunks.len(),
        }))
        .await;
    init.assert_status(StatusCode::CREATED);
    let upload_id = init.json::<Value>()["upload_id"]
        .as_str()
        .unwrap()
        .to_string();

    for (index, chunk) in chunks.iter().enumerate() {
        let form = MultipartForm::new()
            .add_text("upload_id", upload_id.clone())
            .add_text("chunk_index", index.to_string())
            .add_part("chunk", Part::bytes(chunk.to_vec()).file_name("blob"));
        let response = app
            .server
            .post("/api/files/chunked/upload")
            .multipart(form)
            .await;
        response.assert_status_ok();
        let body = response.json::<Value>();
        assert_eq!(body["uploaded_chunks"], index + 1);
        assert_eq!(body["complete"], index + 1 == chunks.len());
    }

    let finalize = app
        .server
        .post("/api/files/chunked/finalize")
        .json(&json!({ "upload_id": upload_id }))
        .await;
    finalize.assert_status(StatusCode::CREATED);
    let body = finalize.json::<Value>();
    assert_eq!(body["message"], "File uploaded successfully.");
    assert_eq!(body["document"]["original_name"], filename);
    assert_eq!(body["document"]["size"], total_size);
    body["document"]["id"].as_i64().unwrap()
}

#[tokio::test]
async fn chunked_upload_round_trip() {
    let app = test_app().await;
    let id = upload(&app, "notes.txt", &[b"hello ", b"chunked ", b"world"]).await;

    let doc = app.state.repos.documents.get(id).await.unwrap().unwrap();
    assert_eq!(doc.mime_type, "text/plain");
    let stored = app
        .state
        .disks
        .get(StorageBackend::S3)
        .unwrap()
        .download(&doc.path)
        .await
        .unwrap();
    assert_eq!(stored, b"hello chunked world");
}

#[tokio::test]
async fn progress_reports_missing_chunks() {
    let app = test_app().await;
    let init = app
        .server
        .post("/api/files/chunked/init")
        .json(&json!({ "filename": "a.bin", "total_size": 9, "total_chunks": 3 }))
        .await
        .json::<Value>();
    let upload_id = init["upload_id"].as_str().unwrap().to_string();

    let form = MultipartForm::new()
        .add_text("upload_id", upload_id.clone())
        .add_text("chunk_index", "1")
        .add_part("chunk", Part::bytes(b"abc".to_vec()).file_name("blob"));
    app.server
        .post("/api/files/chunked/upload")
        .multipart(form)
        .await
        .assert_status_ok();

    let progress = app
        .server
        .get(&format!("/api/files/chunked/{}", upload_id))
        .await
        .json::<Value>();
    assert_eq!(progress["uploaded_chunks"], 1);
    assert_eq!(progress["missing_chunks"], json!([0, 2]));
    assert_eq!(progress["complete"], false);

    let finalize = app
        .server
        .post("/api/files/chunked/finalize")
        .json(&json!({ "upload_id": upload_id }))
        .await;
    finalize.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(finalize.json::<Value>()["code"], "INCOMPLETE_UPLOAD");
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let app = test_app().await;
    let response = app
        .server
        .post("/api/files/chunked/finalize")
        .json(&json!({ "upload_id": Uuid::new_v4() }))
        .await;
    response.assert_status(StatusCode::NOT_FOUND);
    let body = response.json::<Value>();
    assert_eq!(body["code"], "UPLOAD_SESSION_NOT_FOUND");
    assert_eq!(body["error"], "Upload session not found or expired.");
}

#[tokio::test]
async fn chunk_without_index_is_rejected() {
    let app = test_app().await;
    let form = MultipartForm::new()
        .add_text("upload_id", Uuid::new_v4().to_string())
        .add_part("chunk", Part::bytes(b"abc".to_vec()).file_name("blob"));
    let response = app
        .server
        .post("/api/files/chunked/upload")
        .multipart(form)
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["code"], "INVALID_INPUT");
}

#[tokio::test]
async fn abort_discards_the_session() {
    let app = test_app().await;
    let init = app
        .server
        .post("/api/files/chunked/init")
        .json(&json!({ "filename": "gone.txt", "total_size": 3, "total_chunks": 1 }))
        .await
        .json::<Value>();
    let upload_id = init["upload_id"].as_str().unwrap().to_string();

    let abort = app
        .server
        .post("/api/files/chunked/abort")
        .json(&json!({ "upload_id": upload_id }))
        .await;
    abort.assert_status_ok();
    assert_eq!(abort.json::<Value>()["message"], "Upload aborted successfully.");

    app.server
        .get(&format!("/api/files/chunked/{}", upload_id))
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_json_is_an_error_response() {
    let app = test_app().await;
    let response = app
        .server
        .post("/api/files/chunked/init")
        .json(&json!({ "filename": "x.txt" }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["code"], "INVALID_INPUT");
}

#[tokio::test]
async fn zip_job_is_built_by_the_worker() {
    let app = test_app().await;
    let first = upload(&app, "b.txt", &[b"second"]).await;
    let second = upload(&app, "a.txt", &[b"fir", b"st"]).await;

    let created = app
        .server
        .post("/api/files/zip-jobs")
        .json(&json!({ "document_ids": [first, second, first] }))
        .await;
    created.assert_status(StatusCode::ACCEPTED);
    let body = created.json::<Value>();
    assert_eq!(body["status"], "queued");
    assert_eq!(body["progress"], 0);
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let mut status = Value::Null;
    for _ in 0..500 {
        status = app
            .server
            .get(&format!("/api/files/zip-jobs/{}", job_id))
            .await
            .json::<Value>();
        if status["status"] == "completed" || status["status"] == "failed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status["status"], "completed", "job ended as {}", status);
    assert_eq!(status["progress"], 100);
    assert!(status["download_url"].as_str().unwrap().ends_with(".zip"));
    assert!(status["filename"].as_str().unwrap().ends_with(".zip"));
    assert_eq!(status["expires_in_minutes"], 15);

    let job = app
        .state
        .repos
        .archive_jobs
        .get(job_id.parse().unwrap())
        .await
        .unwrap()
        .unwrap();
    let bytes = app
        .state
        .disks
        .get(StorageBackend::S3)
        .unwrap()
        .download(job.result_path.as_deref().unwrap())
        .await
        .unwrap();
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
    assert_eq!(archive.len(), 2);
    let mut entries = Vec::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).unwrap();
        assert_eq!(file.compression(), zip::CompressionMethod::Stored);
        let mut data = String::new();
        file.read_to_string(&mut data).unwrap();
        entries.push((file.name().to_string(), data));
    }
    assert_eq!(
        entries,
        vec![
            ("b.txt".to_string(), "second".to_string()),
            ("a.txt".to_string(), "first".to_string()),
        ]
    );

    app.worker.shutdown().await;
}

#[tokio::test]
async fn zip_job_validation_errors() {
    let app = test_app().await;

    let empty = app
        .server
        .post("/api/files/zip-jobs")
        .json(&json!({ "document_ids": [] }))
        .await;
    empty.assert_status(StatusCode::BAD_REQUEST);

    let unknown = app
        .server
        .post("/api/files/zip-jobs")
        .json(&json!({ "document_ids": [4242] }))
        .await;
    unknown.assert_status(StatusCode::NOT_FOUND);
    assert_eq!(unknown.json::<Value>()["code"], "DOCUMENTS_NOT_FOUND");

    let missing = app
        .server
        .get(&format!("/api/files/zip-jobs/{}", Uuid::new_v4()))
        .await;
    missing.assert_status(StatusCode::NOT_FOUND);
    assert_eq!(missing.json::<Value>()["code"], "ARCHIVE_JOB_NOT_FOUND");
}

#[tokio::test]
async fn documents_are_listed_newest_first() {
    let app = test_app().await;
    let older = upload(&app, "old.txt", &[b"1"]).await;
    let newer = upload(&app, "new.txt", &[b"2"]).await;

    let page = app
        .server
        .get("/api/files")
        .add_query_param("limit", 1)
        .await
        .json::<Value>();
    assert_eq!(page["total"], 2);
    assert_eq!(page["limit"], 1);
    assert_eq!(page["data"][0]["id"], newer);

    let next = app
        .server
        .get("/api/files")
        .add_query_param("limit", 1)
        .add_query_param("offset", 1)
        .await
        .json::<Value>();
    assert_eq!(next["data"][0]["id"], older);
}

/// Splits a local signed URL into its path and query pairs.
fn split_signed_url(url: &str) -> (String, Vec<(String, String)>) {
    let rest = url.strip_prefix("http://localhost:4000").unwrap();
    let (path, query) = rest.split_once('?').unwrap();
    let pairs = query
        .split('&')
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap();
            (k.to_string(), v.to_string())
        })
        .collect();
    (path.to_string(), pairs)
}

#[tokio::test]
async fn signed_local_download() {
    let app = test_app().await;
    let local = app.state.disks.local().unwrap().clone();
    local
        .upload_with_key("uploads/report.txt", Bytes::from_static(b"local bytes"), "text/plain")
        .await
        .unwrap();
    let url = local
        .get_presigned_url("uploads/report.txt", Duration::from_secs(60), Some("report.txt"))
        .await
        .unwrap();
    let (path, pairs) = split_signed_url(&url);
    assert_eq!(path, "/files/uploads/report.txt");

    let mut request = app.server.get(&path);
    for (k, v) in &pairs {
        request = request.add_query_param(k, v);
    }
    let response = request.await;
    response.assert_status_ok();
    assert_eq!(response.as_bytes().as_ref(), b"local bytes");
    let disposition = response.header("content-disposition");
    assert!(disposition.to_str().unwrap().contains("report.txt"));

    let mut tampered = app.server.get(&path);
    for (k, v) in &pairs {
        let v = if k == "signature" { "00".repeat(32) } else { v.clone() };
        tampered = tampered.add_query_param(k, v);
    }
    let response = tampered.await;
    response.assert_status(StatusCode::FORBIDDEN);
    assert_eq!(response.json::<Value>()["code"], "FORBIDDEN");
}

#[tokio::test]
async fn health_and_openapi() {
    let app = test_app().await;

    let health = app.server.get("/health").await;
    health.assert_status_ok();
    let body = health.json::<Value>();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"], "healthy");

    let spec = app.server.get("/api/openapi.json").await;
    spec.assert_status_ok();
    assert!(spec.json::<Value>()["paths"]["/api/files/zip-jobs"].is_object());
}
