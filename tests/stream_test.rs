//! Range-serving integration tests.

mod common;

use common::{test_payload, TestServer};

/// Seed an assembled original directly into the store
async fn seed_upload(server: &TestServer, filename: &str, data: &[u8]) {
    server
        .state
        .storage
        .put_stream(&format!("uploads/{}", filename), &mut &data[..])
        .await
        .expect("Failed to seed upload");
}

#[tokio::test]
async fn test_full_file_without_range() {
    let server = TestServer::start().await;
    let client = server.client();

    let payload = test_payload(4096);
    seed_upload(&server, "x.mp4", &payload).await;

    let response = client
        .get(server.url("/stream/x.mp4"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "video/mp4");
    assert_eq!(response.headers()["accept-ranges"], "bytes");
    assert_eq!(response.headers()["content-length"], "4096");

    let body = response.bytes().await.unwrap();
    assert_eq!(&body[..], &payload[..]);
}

#[tokio::test]
async fn test_explicit_range_on_10_mib_file() {
    let server = TestServer::start().await;
    let client = server.client();

    let payload = test_payload(10 * 1024 * 1024);
    seed_upload(&server, "big.mp4", &payload).await;

    let response = client
        .get(server.url("/stream/big.mp4"))
        .header("Range", "bytes=1048576-2097151")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 206);
    assert_eq!(
        response.headers()["content-range"],
        "bytes 1048576-2097151/10485760"
    );
    assert_eq!(response.headers()["content-length"], "1048576");

    let body = response.bytes().await.unwrap();
    assert_eq!(body.len(), 1_048_576);
    assert_eq!(&body[..], &payload[1_048_576..=2_097_151]);
}

#[tokio::test]
async fn test_open_ended_range() {
    let server = TestServer::start().await;
    let client = server.client();

    let payload = test_payload(1000);
    seed_upload(&server, "tail.mp4", &payload).await;

    let response = client
        .get(server.url("/stream/tail.mp4"))
        .header("Range", "bytes=900-")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 206);
    assert_eq!(response.headers()["content-range"], "bytes 900-999/1000");

    let body = response.bytes().await.unwrap();
    assert_eq!(&body[..], &payload[900..]);
}

#[tokio::test]
async fn test_single_byte_range() {
    let server = TestServer::start().await;
    let client = server.client();

    let payload = test_payload(100);
    seed_upload(&server, "one.mp4", &payload).await;

    let response = client
        .get(server.url("/stream/one.mp4"))
        .header("Range", "bytes=42-42")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 206);
    assert_eq!(response.headers()["content-length"], "1");
    let body = response.bytes().await.unwrap();
    assert_eq!(body[0], payload[42]);
}

#[tokio::test]
async fn test_out_of_range_returns_416() {
    let server = TestServer::start().await;
    let client = server.client();

    seed_upload(&server, "small.mp4", &test_payload(100)).await;

    let response = client
        .get(server.url("/stream/small.mp4"))
        .header("Range", "bytes=100-200")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 416);
    assert_eq!(response.headers()["content-range"], "bytes */100");
}

#[tokio::test]
async fn test_inverted_range_returns_416() {
    let server = TestServer::start().await;
    let client = server.client();

    seed_upload(&server, "inv.mp4", &test_payload(100)).await;

    let response = client
        .get(server.url("/stream/inv.mp4"))
        .header("Range", "bytes=50-10")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 416);
}

#[tokio::test]
async fn test_missing_file_returns_404() {
    let server = TestServer::start().await;
    let client = server.client();

    let response = client
        .get(server.url("/stream/ghost.mp4"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_content_type_follows_extension() {
    let server = TestServer::start().await;
    let client = server.client();

    seed_upload(&server, "clip.webm", &test_payload(10)).await;

    let response = client
        .get(server.url("/stream/clip.webm"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "video/webm");
}
