//! Capture of matching response bodies.

use std::path::Path;
use std::time::Duration;

use axum::http::StatusCode;
use capture_proxy::config::ProxyConfig;

mod common;

fn capturing(dir: &Path, grace_ms: u64) -> ProxyConfig {
    ProxyConfig {
        capture_pattern: Some(r"\.(iso|bin)$".into()),
        capture_path: Some(dir.to_path_buf()),
        capture_grace_ms: grace_ms,
        ..ProxyConfig::default()
    }
}

#[tokio::test]
async fn matching_response_is_captured_in_full() {
    let dir = tempfile::tempdir().unwrap();
    let body: &'static [u8] = Box::leak(vec![7u8; 256 * 1024].into_boxed_slice());
    let (origin, _) = common::start_origin(body).await;
    let (proxy, _shutdown) = common::start_proxy(capturing(dir.path(), 5_000)).await;

    let response = common::proxied_client(proxy)
        .get(format!("http://{origin}/images/disk.iso?mirror=3"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let received = response.bytes().await.unwrap();
    assert_eq!(received.len(), body.len());

    let file = dir.path().join("disk.iso");
    let complete = common::eventually(Duration::from_secs(5), || {
        std::fs::metadata(&file).map(|m| m.len() as usize == body.len()).unwrap_or(false)
    })
    .await;
    assert!(complete, "capture file missing or short");
    assert_eq!(std::fs::read(&file).unwrap(), body);
}

#[tokio::test]
async fn non_matching_path_is_not_captured() {
    let dir = tempfile::tempdir().unwrap();
    let (origin, _) = common::start_origin(b"plain page").await;
    let (proxy, _shutdown) = common::start_proxy(capturing(dir.path(), 5_000)).await;

    let response = common::proxied_client(proxy)
        .get(format!("http://{origin}/index.html?file=x.iso"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "plain page");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn non_200_response_is_not_captured() {
    let dir = tempfile::tempdir().unwrap();
    let (origin, _) = common::start_mock(|_| {
        b"HTTP/1.1 404 Not Found\r\nContent-Length: 7\r\nConnection: close\r\n\r\nmissing".to_vec()
    })
    .await;
    let (proxy, _shutdown) = common::start_proxy(capturing(dir.path(), 5_000)).await;

    let response = common::proxied_client(proxy)
        .get(format!("http://{origin}/gone.iso"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.text().await.unwrap(), "missing");
    assert!(!dir.path().join("gone.iso").exists());
}

#[tokio::test]
async fn aborted_transfer_removes_partial_capture() {
    let dir = tempfile::tempdir().unwrap();
    let origin = common::start_truncating_origin(1_000_000, 64 * 1024).await;
    let (proxy, _shutdown) = common::start_proxy(capturing(dir.path(), 1_000)).await;

    let response = common::proxied_client(proxy)
        .get(format!("http://{origin}/broken.bin"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.bytes().await.is_err(), "truncated body must not end cleanly");

    let file = dir.path().join("broken.bin");
    assert!(file.exists(), "partial capture removed before the grace delay");
    let removed = common::eventually(Duration::from_secs(5), || !file.exists()).await;
    assert!(removed, "partial capture was not removed");
}

#[tokio::test]
async fn unwritable_capture_directory_does_not_affect_response() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("does-not-exist");
    let (origin, _) = common::start_origin(b"still delivered").await;
    let (proxy, _shutdown) = common::start_proxy(capturing(&missing, 5_000)).await;

    let response = common::proxied_client(proxy)
        .get(format!("http://{origin}/file.bin"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "still delivered");
}
