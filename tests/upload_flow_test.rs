//! End-to-end tests of the chunked ingestion pipeline.

mod common;

use common::{
    init_session, post_chunk, post_chunk_as, session_status, test_payload,
    wait_for_session_gone, wait_for_uploaded_chunks, wait_for_video_ready, TestServer, TEST_USER,
};
use serde_json::Value;
use uuid::Uuid;
use video_ingest_server::models::Video;

const MIB: u64 = 1024 * 1024;

#[tokio::test]
async fn test_happy_path_three_chunks() {
    let server = TestServer::start().await;
    let client = server.client();

    // 2.5 MiB file in 1 MiB chunks = 3 chunks
    let payload = test_payload(2_621_440);
    let session_id = init_session(&server, &client, 2_621_440, MIB).await;

    for (i, chunk) in payload.chunks(MIB as usize).enumerate() {
        let response = post_chunk(&server, &client, &session_id, i as u64, chunk.to_vec()).await;
        assert_eq!(response.status(), 200);
        let json: Value = response.json().await.unwrap();
        assert_eq!(json["status"], "queued");
        assert_eq!(json["chunkIndex"], i as u64);
    }

    assert!(wait_for_session_gone(&server, &client, &session_id).await);
    let video = wait_for_video_ready(&server, &session_id)
        .await
        .expect("video did not reach ready");

    // Stream back the assembled original and byte-compare
    let filename = video.storage_key.strip_prefix("uploads/").unwrap();
    let response = client
        .get(server.url(&format!("/stream/{}", filename)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body = response.bytes().await.unwrap();
    assert_eq!(body.len(), 2_621_440);
    assert_eq!(&body[..], &payload[..]);

    // Probe fields and thumbnail are in place
    assert_eq!(video.duration_s, 42.0);
    assert_eq!(video.resolution, "1280x720");
    assert_eq!(video.file_size, 2_621_440);
    assert!(server.state.storage.exists(&video.thumbnail_key).await);

    // No orphan chunks remain for the session
    let leftover = server
        .state
        .storage
        .list_chunks(&format!("{}_chunk_", session_id))
        .await
        .unwrap();
    assert!(leftover.is_empty(), "chunks must be deleted after assembly");
}

#[tokio::test]
async fn test_out_of_order_parallel_upload() {
    let server = TestServer::start().await;
    let client = server.client();

    let payload = test_payload(2_621_440);
    let session_id = init_session(&server, &client, 2_621_440, MIB).await;

    // Send chunks 2, 0, 1 concurrently
    let chunks: Vec<Vec<u8>> = payload.chunks(MIB as usize).map(|c| c.to_vec()).collect();
    let mut handles = Vec::new();
    for i in [2u64, 0, 1] {
        let server_url = server.url("/upload/chunk");
        let data = chunks[i as usize].clone();
        let sid = session_id.clone();
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let form = reqwest::multipart::Form::new()
                .text("sessionId", sid)
                .text("chunkIndex", i.to_string())
                .part(
                    "chunk",
                    reqwest::multipart::Part::bytes(data).file_name("chunk.bin"),
                );
            client
                .post(server_url)
                .header("X-User-Id", TEST_USER)
                .multipart(form)
                .send()
                .await
                .unwrap()
                .status()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), 200);
    }

    assert!(wait_for_session_gone(&server, &client, &session_id).await);
    let video = wait_for_video_ready(&server, &session_id)
        .await
        .expect("video did not reach ready");

    // Assembly imposes ascending order regardless of arrival order
    let filename = video.storage_key.strip_prefix("uploads/").unwrap();
    let body = client
        .get(server.url(&format!("/stream/{}", filename)))
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(&body[..], &payload[..]);
}

#[tokio::test]
async fn test_duplicate_chunk_is_idempotent() {
    let server = TestServer::start().await;
    let client = server.client();

    let payload = test_payload(300_000);
    let session_id = init_session(&server, &client, 300_000, 100_000).await;
    let chunks: Vec<Vec<u8>> = payload.chunks(100_000).map(|c| c.to_vec()).collect();

    // Chunk 1 goes twice; both commits succeed
    let r1 = post_chunk(&server, &client, &session_id, 1, chunks[1].clone()).await;
    assert_eq!(r1.status(), 200);
    let r2 = post_chunk(&server, &client, &session_id, 1, chunks[1].clone()).await;
    assert_eq!(r2.status(), 200);

    // The received set holds a single entry for chunk 1
    assert!(wait_for_uploaded_chunks(&server, &client, &session_id, 1).await);

    post_chunk(&server, &client, &session_id, 0, chunks[0].clone()).await;
    post_chunk(&server, &client, &session_id, 2, chunks[2].clone()).await;

    assert!(wait_for_session_gone(&server, &client, &session_id).await);
    let video = wait_for_video_ready(&server, &session_id)
        .await
        .expect("video did not reach ready");

    // No duplicate bytes in the final file
    let filename = video.storage_key.strip_prefix("uploads/").unwrap();
    let body = client
        .get(server.url(&format!("/stream/{}", filename)))
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(body.len(), 300_000);
    assert_eq!(&body[..], &payload[..]);
}

#[tokio::test]
async fn test_status_reports_progress() {
    let server = TestServer::start().await;
    let client = server.client();

    let session_id = init_session(&server, &client, 300_000, 100_000).await;
    let chunk = test_payload(100_000);

    post_chunk(&server, &client, &session_id, 0, chunk.clone()).await;
    assert!(wait_for_uploaded_chunks(&server, &client, &session_id, 1).await);

    let json = session_status(&server, &client, &session_id).await.unwrap();
    assert_eq!(json["uploadedChunks"], 1);
    assert_eq!(json["totalChunks"], 3);
    assert_eq!(json["status"], "uploading");
    let progress = json["progress"].as_f64().unwrap();
    assert!((progress - 33.333).abs() < 0.01);
}

#[tokio::test]
async fn test_resume_lists_missing_chunks() {
    let server = TestServer::start().await;
    let client = server.client();

    let session_id = init_session(&server, &client, 300_000, 100_000).await;
    let chunk = test_payload(100_000);

    post_chunk(&server, &client, &session_id, 0, chunk.clone()).await;
    post_chunk(&server, &client, &session_id, 2, chunk.clone()).await;
    assert!(wait_for_uploaded_chunks(&server, &client, &session_id, 2).await);

    let response = client
        .post(server.url(&format!("/upload/resume/{}", session_id)))
        .header("X-User-Id", TEST_USER)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["missingChunks"], serde_json::json!([1]));
}

#[tokio::test]
async fn test_cancel_mid_upload() {
    let server = TestServer::start().await;
    let client = server.client();

    let session_id = init_session(&server, &client, 300_000, 100_000).await;
    let chunk = test_payload(100_000);

    post_chunk(&server, &client, &session_id, 0, chunk.clone()).await;
    post_chunk(&server, &client, &session_id, 1, chunk.clone()).await;
    assert!(wait_for_uploaded_chunks(&server, &client, &session_id, 2).await);

    let response = client
        .delete(server.url(&format!("/upload/cancel/{}", session_id)))
        .header("X-User-Id", TEST_USER)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Subsequent chunk posts see no session
    let late = post_chunk(&server, &client, &session_id, 2, chunk).await;
    assert_eq!(late.status(), 404);

    // Chunks are gone and no video row was created
    let leftover = server
        .state
        .storage
        .list_chunks(&format!("{}_chunk_", session_id))
        .await
        .unwrap();
    assert!(leftover.is_empty());

    let video_id = Video::id_for_session(Uuid::parse_str(&session_id).unwrap());
    assert!(server.state.db.get_video(video_id).unwrap().is_none());
}

#[tokio::test]
async fn test_init_rejects_oversized_file() {
    let server = TestServer::start().await;
    let client = server.client();

    let response = client
        .post(server.url("/upload/initialize"))
        .header("X-User-Id", TEST_USER)
        .json(&serde_json::json!({
            "filename": "huge.mp4",
            "fileSize": 6u64 * 1024 * 1024 * 1024,
            "chunkSize": 1_048_576u64,
            "metadata": {}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_missing_caller_identity_rejected() {
    let server = TestServer::start().await;
    let client = server.client();

    let response = client
        .post(server.url("/upload/initialize"))
        .json(&serde_json::json!({
            "filename": "clip.mp4",
            "fileSize": 1000u64,
            "chunkSize": 1000u64,
            "metadata": {}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = client
        .get(server.url("/upload/sessions"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn test_owner_mismatch_rejected() {
    let server = TestServer::start().await;
    let client = server.client();

    let session_id = init_session(&server, &client, 300_000, 100_000).await;
    let chunk = test_payload(100_000);

    let response = post_chunk_as(&server, &client, &session_id, 0, chunk, "someone-else").await;
    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn test_chunk_index_out_of_range_rejected() {
    let server = TestServer::start().await;
    let client = server.client();

    let session_id = init_session(&server, &client, 300_000, 100_000).await;
    let response = post_chunk(&server, &client, &session_id, 3, test_payload(100)).await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_unknown_session_rejected() {
    let server = TestServer::start().await;
    let client = server.client();

    let response = client
        .get(server.url(&format!("/upload/status/{}", Uuid::new_v4())))
        .header("X-User-Id", TEST_USER)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_chunks_after_completion_rejected() {
    let server = TestServer::start().await;
    let client = server.client();

    let payload = test_payload(100_000);
    let session_id = init_session(&server, &client, 100_000, 100_000).await;
    post_chunk(&server, &client, &session_id, 0, payload.clone()).await;

    // Once the session completes it is assembled and retired; a late chunk
    // sees either the terminal conflict or the missing session.
    assert!(wait_for_session_gone(&server, &client, &session_id).await);
    let late = post_chunk(&server, &client, &session_id, 0, payload).await;
    assert_eq!(late.status(), 404);
}

#[tokio::test]
async fn test_session_listing_is_owner_scoped() {
    let server = TestServer::start().await;
    let client = server.client();

    init_session(&server, &client, 100_000, 100_000).await;
    init_session(&server, &client, 100_000, 100_000).await;

    let response = client
        .get(server.url("/upload/sessions?page=1&limit=10"))
        .header("X-User-Id", TEST_USER)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["sessions"].as_array().unwrap().len(), 2);
    assert_eq!(json["page"], 1);

    // Another user sees nothing
    let response = client
        .get(server.url("/upload/sessions"))
        .header("X-User-Id", "someone-else")
        .send()
        .await
        .unwrap();
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["sessions"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_chunk_rate_limit_trips() {
    let server = TestServer::start_with_rate_limit(Some(3)).await;
    let client = server.client();

    let session_id = init_session(&server, &client, 500_000, 100_000).await;
    let chunk = test_payload(100_000);

    let mut throttled = false;
    for i in 0..5u64 {
        let response = post_chunk(&server, &client, &session_id, i % 5, chunk.clone()).await;
        if response.status() == 429 {
            throttled = true;
            assert!(response.headers().contains_key("retry-after"));
            break;
        }
    }
    assert!(throttled, "rate limit should trip after the burst");
}
