//! Integration tests for HTTP API endpoints.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use common::TestServer;
use common::fixtures::{ChunkPart, seeded_bytes, sha256_hash, split_chunks};
use depot_core::FileName;
use std::sync::Arc;
use tower::ServiceExt;

#[tokio::test]
async fn test_health_check() {
    let server = TestServer::new().await;

    let (status, body) = server.get("/v1/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backend"], "filesystem");
    assert_eq!(body["sessions"], 0);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let server = TestServer::new().await;
    server
        .upload_chunk(&ChunkPart::new(Bytes::from_static(b"abc"), 0, 2, "m.bin"))
        .await;

    let request = Request::builder()
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let response = server.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("depot_chunks_received_total"));
}

#[tokio::test]
async fn test_metrics_endpoint_disabled() {
    let server = TestServer::with_config(|config| config.server.metrics_enabled = false).await;
    let (status, _) = server.get("/metrics").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_out_of_order_concurrent_chunks_assemble_once() {
    let server = Arc::new(TestServer::new().await);
    let data = seeded_bytes(7, 300_000);
    let chunks = split_chunks(&data, 3);

    // The last chunk arrives first and opens the session.
    let upload_id = server
        .open_upload(&ChunkPart::new(chunks[2].clone(), 2, 3, "video.mp4"))
        .await;

    let handles: Vec<_> = [0u32, 1]
        .into_iter()
        .map(|index| {
            let server = server.clone();
            let part = ChunkPart::new(chunks[index as usize].clone(), index, 3, "video.mp4")
                .upload_id(&upload_id);
            tokio::spawn(async move { server.upload_chunk(&part).await })
        })
        .collect();

    let mut completions = Vec::new();
    for handle in handles {
        let (status, body) = handle.await.unwrap();
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["success"], true);
        assert_eq!(body["uploadId"], upload_id.as_str());
        if body["complete"] == true {
            completions.push(body);
        }
    }

    assert_eq!(completions.len(), 1);
    let artifact = &completions[0]["artifact"];
    assert_eq!(artifact["size"], 300_000);
    assert_eq!(artifact["sha256"], sha256_hash(&data).as_str());

    let key = artifact["key"].as_str().unwrap();
    assert_eq!(key, format!("artifacts/{upload_id}/video.mp4"));
    assert_eq!(server.read_object(key).await, data);
}

#[tokio::test]
async fn test_sequential_upload_with_checksum() {
    let server = TestServer::new().await;
    let data = seeded_bytes(11, 10_000);
    let chunks = split_chunks(&data, 4);
    let checksum = sha256_hash(&data);

    let upload_id = server
        .open_upload(&ChunkPart::new(chunks[0].clone(), 0, 4, "notes.txt").checksum(&checksum))
        .await;

    let mut last = serde_json::Value::Null;
    for (index, chunk) in chunks.iter().enumerate().skip(1) {
        let (status, body) = server
            .upload_chunk(
                &ChunkPart::new(chunk.clone(), index as u32, 4, "notes.txt").upload_id(&upload_id),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["receivedChunks"], index + 1);
        last = body;
    }

    assert_eq!(last["complete"], true);
    assert_eq!(last["artifact"]["sha256"], checksum.as_str());
}

#[tokio::test]
async fn test_duplicate_chunk_last_write_wins() {
    let server = TestServer::new().await;

    let upload_id = server
        .open_upload(&ChunkPart::new(Bytes::from_static(b"old-"), 0, 2, "f.txt"))
        .await;
    let (status, body) = server
        .upload_chunk(&ChunkPart::new(Bytes::from_static(b"new-"), 0, 2, "f.txt").upload_id(&upload_id))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["receivedChunks"], 1);

    let (_, body) = server
        .upload_chunk(&ChunkPart::new(Bytes::from_static(b"tail"), 1, 2, "f.txt").upload_id(&upload_id))
        .await;
    assert_eq!(body["complete"], true);

    let key = body["artifact"]["key"].as_str().unwrap();
    assert_eq!(server.read_object(key).await, Bytes::from_static(b"new-tail"));
}

#[tokio::test]
async fn test_invalid_fields_rejected() {
    let server = TestServer::new().await;

    let cases = [
        ChunkPart {
            chunk_index: "abc".to_string(),
            ..ChunkPart::new(Bytes::from_static(b"x"), 0, 2, "a.bin")
        },
        ChunkPart {
            total_chunks: "0".to_string(),
            ..ChunkPart::new(Bytes::from_static(b"x"), 0, 2, "a.bin")
        },
        ChunkPart::new(Bytes::from_static(b"x"), 5, 2, "a.bin"),
        ChunkPart::new(Bytes::from_static(b"x"), 0, 2, "a.bin").upload_id("not-a-uuid"),
        ChunkPart::new(Bytes::from_static(b"x"), 0, 2, "a.bin").checksum("zz"),
    ];

    for part in cases {
        let (status, body) = server.upload_chunk(&part).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{part:?}: {body}");
        assert_eq!(body["success"], false);
    }
    assert!(server.state.sessions.is_empty());
}

#[tokio::test]
async fn test_non_multipart_body_rejected() {
    let server = TestServer::new().await;
    let request = Request::builder()
        .method("POST")
        .uri("/v1/uploads/chunks")
        .header("Content-Type", "application/json")
        .body(Body::from("{}"))
        .unwrap();

    let (status, body) = server.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "bad_request");
}

#[tokio::test]
async fn test_inconsistent_total_chunks_rejected() {
    let server = TestServer::new().await;
    let upload_id = server
        .open_upload(&ChunkPart::new(Bytes::from_static(b"aa"), 0, 3, "a.bin"))
        .await;

    let (status, body) = server
        .upload_chunk(&ChunkPart::new(Bytes::from_static(b"bb"), 1, 4, "a.bin").upload_id(&upload_id))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "inconsistent_total_chunks");

    let (_, status_body) = server.get(&format!("/v1/uploads/{upload_id}")).await;
    assert_eq!(status_body["totalChunks"], 3);
    assert_eq!(status_body["receivedChunks"], 1);
}

#[tokio::test]
async fn test_upload_ceiling_enforced() {
    let server = TestServer::with_config(|config| {
        config.server.max_chunk_size = 64;
        config.server.max_upload_size = 100;
    })
    .await;

    let upload_id = server
        .open_upload(&ChunkPart::new(seeded_bytes(1, 64), 0, 3, "big.bin"))
        .await;
    let (status, body) = server
        .upload_chunk(&ChunkPart::new(seeded_bytes(2, 64), 1, 3, "big.bin").upload_id(&upload_id))
        .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["code"], "upload_too_large");

    // The rejected chunk was never stored.
    let keys = server
        .state
        .storage
        .list(&format!("uploads/{upload_id}/chunks/"))
        .await
        .unwrap();
    assert_eq!(keys, vec![format!("uploads/{upload_id}/chunks/0000000000")]);
}

#[tokio::test]
async fn test_oversized_chunk_rejected() {
    let server = TestServer::with_config(|config| config.server.max_chunk_size = 64).await;

    let (status, body) = server
        .upload_chunk(&ChunkPart::new(seeded_bytes(3, 65), 0, 1, "big.bin"))
        .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["success"], false);
    assert!(server.state.sessions.is_empty());
}

#[tokio::test]
async fn test_finalize_incomplete_upload_conflicts() {
    let server = TestServer::new().await;
    let upload_id = server
        .open_upload(&ChunkPart::new(Bytes::from_static(b"x"), 1, 3, "a.bin"))
        .await;

    let (status, body) = server.finalize(&upload_id).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "incomplete_upload");
    assert_eq!(body["missingChunks"], serde_json::json!([0, 2]));

    let keys = server.state.storage.list("artifacts/").await.unwrap();
    assert!(keys.is_empty());
}

#[tokio::test]
async fn test_finalize_unknown_and_malformed_ids() {
    let server = TestServer::new().await;

    let (status, _) = server
        .finalize("6f1c1a52-8f0e-4c4e-9d55-5f7d1bcd2a10")
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = server.finalize("nope").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_concurrent_finalize_returns_one_artifact() {
    let server = Arc::new(TestServer::new().await);
    let data = seeded_bytes(11, 64 * 1024);
    let chunks = split_chunks(&data, 2);

    // Record both chunks below the HTTP layer so nothing assembles them yet.
    let entry = server
        .state
        .sessions
        .get_or_create(None, 2, &FileName::parse("race.bin").unwrap(), None)
        .await
        .unwrap();
    for (index, chunk) in chunks.iter().enumerate() {
        server
            .state
            .sessions
            .receive_chunk(&entry, index as u32, chunk.clone())
            .await
            .unwrap();
    }
    let upload_id = entry.id().to_string();

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let server = server.clone();
            let upload_id = upload_id.clone();
            tokio::spawn(async move { server.finalize(&upload_id).await })
        })
        .collect();

    let mut fresh = 0;
    let mut keys = Vec::new();
    for handle in handles {
        let (status, body) = handle.await.unwrap();
        assert_eq!(status, StatusCode::OK, "{body}");
        if body["message"] == "upload assembled" {
            fresh += 1;
        } else {
            assert_eq!(body["message"], "upload already assembled");
        }
        keys.push(body["artifact"]["key"].as_str().unwrap().to_string());
    }
    assert_eq!(fresh, 1);
    keys.dedup();
    assert_eq!(keys.len(), 1);

    let stored = server.state.storage.list("artifacts/").await.unwrap();
    assert_eq!(stored, keys);
    assert_eq!(server.read_object(&keys[0]).await, data);
}

#[tokio::test]
async fn test_checksum_mismatch_fails_upload() {
    let server = TestServer::new().await;
    let wrong = sha256_hash(b"something else");

    let upload_id = server
        .open_upload(&ChunkPart::new(Bytes::from_static(b"ab"), 0, 2, "c.bin").checksum(&wrong))
        .await;
    let (status, body) = server
        .upload_chunk(&ChunkPart::new(Bytes::from_static(b"cd"), 1, 2, "c.bin").upload_id(&upload_id))
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "assembly_failed");

    let (_, status_body) = server.get(&format!("/v1/uploads/{upload_id}")).await;
    assert_eq!(status_body["state"], "failed");
    assert!(status_body["failure"].as_str().unwrap().contains("checksum"));

    // Failed is terminal: further chunks and finalize are refused.
    let (status, body) = server
        .upload_chunk(&ChunkPart::new(Bytes::from_static(b"cd"), 1, 2, "c.bin").upload_id(&upload_id))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "session_not_open");

    let (status, _) = server.finalize(&upload_id).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_upload_status_reports_progress() {
    let server = TestServer::new().await;
    let upload_id = server
        .open_upload(&ChunkPart::new(Bytes::from_static(b"12345"), 2, 4, "../../report.pdf"))
        .await;

    let (status, body) = server.get(&format!("/v1/uploads/{upload_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["uploadId"], upload_id.as_str());
    assert_eq!(body["fileName"], "report.pdf");
    assert_eq!(body["state"], "open");
    assert_eq!(body["totalChunks"], 4);
    assert_eq!(body["receivedChunks"], 1);
    assert_eq!(body["missingChunks"], serde_json::json!([0, 1, 3]));
    assert_eq!(body["bytesReceived"], 5);
    assert!(body["expiresAt"].is_string());
    assert!(body.get("artifact").is_none());

    let (status, _) = server
        .get("/v1/uploads/6f1c1a52-8f0e-4c4e-9d55-5f7d1bcd2a10")
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
