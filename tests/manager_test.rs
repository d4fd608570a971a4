use std::time::Duration;

use axum::http::header;
use axum::routing::get;
use axum::Router;
use gpt_lab::{DownloadConfig, DownloadError, DownloadManager, DownloadOutcome, Manifest};
use tempfile::TempDir;

async fn serve() -> String {
    let app = Router::new()
        .route("/tiny.bin", get(|| async { vec![42u8; 64] }))
        .route(
            "/slow.bin",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                vec![0u8; 8]
            }),
        )
        .route(
            "/manifest.json",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "application/json")],
                    r#"{"models": [
                        {"id": "tiny", "name": "tiny.bin", "url": "PLACEHOLDER/tiny.bin", "size": 64},
                        {"id": "slow", "url": "PLACEHOLDER/slow.bin"}
                    ]}"#,
                )
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn fixture_manifest(base: &str) -> Manifest {
    let client = reqwest::Client::new();
    let mut manifest = Manifest::fetch(&client, &format!("{}/manifest.json", base))
        .await
        .unwrap();
    for entry in &mut manifest.entries {
        entry.url = entry.url.replace("PLACEHOLDER", base);
    }
    manifest
}

#[tokio::test]
async fn test_manifest_entry_download_to_disk() {
    let base = serve().await;
    let manifest = fixture_manifest(&base).await;
    assert_eq!(manifest.len(), 2);
    assert_eq!(manifest.find("slow").unwrap().file_name(), "slow.bin");

    let manager = DownloadManager::new(DownloadConfig::default()).unwrap();
    let downloader = manager.start(manifest.find("tiny").unwrap().to_request()).unwrap();
    assert_eq!(downloader.request().expected_size, Some(64));

    let outcome = tokio::time::timeout(Duration::from_secs(10), downloader.wait())
        .await
        .unwrap();
    let DownloadOutcome::Completed(file) = outcome else {
        panic!("tiny.bin did not download");
    };

    let dir = TempDir::new().unwrap();
    let dest = file.write_to(&dir.path().join("models").join(&file.name)).await.unwrap();
    assert_eq!(std::fs::read(dest).unwrap(), vec![42u8; 64]);

    // finished downloads drop out of the manager
    assert_eq!(manager.active_count(), 0);
    assert!(manager.get("tiny").is_none());
}

#[tokio::test]
async fn test_duplicate_ids_and_cancel() {
    let base = serve().await;
    let manifest = fixture_manifest(&base).await;
    let manager = DownloadManager::new(DownloadConfig::default()).unwrap();

    let slow = manager.start(manifest.find("slow").unwrap().to_request()).unwrap();
    assert_eq!(manager.active_ids(), vec!["slow".to_string()]);

    let again = manager.start(manifest.find("slow").unwrap().to_request());
    assert!(matches!(again, Err(DownloadError::AlreadyActive(id)) if id == "slow"));

    assert!(manager.cancel("slow"));
    let outcome = tokio::time::timeout(Duration::from_secs(10), slow.wait())
        .await
        .unwrap();
    assert_eq!(outcome, DownloadOutcome::Cancelled);
    assert_eq!(manager.active_count(), 0);

    // the id is free again
    let retry = manager.start(manifest.find("slow").unwrap().to_request()).unwrap();
    assert!(manager.get("slow").is_some());
    manager.cancel_all();
    tokio::time::timeout(Duration::from_secs(10), retry.wait())
        .await
        .unwrap();
    assert!(manager.active_ids().is_empty());
}
