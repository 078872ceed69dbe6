//! Artifact upload through the sink: blob CAS + artifact turn.

mod common;

use std::sync::Arc;

use attractor::sink::CxdbSink;

use common::spawn_cxdb;

async fn sink_for(handle: &common::CxdbHandle, run_id: &str) -> CxdbSink {
    let http = cxdb::Client::new(&handle.http_base_url);
    let binary = Arc::new(
        cxdb::BinaryClient::dial(&handle.binary_addr, "artifact-test")
            .await
            .unwrap(),
    );
    let ci = http.create_context("0").await.unwrap();
    CxdbSink::new(
        http,
        binary,
        run_id,
        ci.context_id,
        ci.head_turn_id,
        format!("bundle-{run_id}"),
    )
}

#[tokio::test]
async fn artifact_file_lands_in_cas_with_turn() {
    let cxdb = spawn_cxdb().await;
    let sink = sink_for(&cxdb, "run-art").await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.md");
    let body = b"# findings\nnothing burned down\n";
    std::fs::write(&path, body).unwrap();

    let turn_id = sink
        .put_artifact_file("review", "final_report", &path)
        .await
        .unwrap();
    assert!(!turn_id.is_empty());

    // The blob is stored under its BLAKE3 hash, bit-exact.
    let hash: [u8; 32] = blake3::hash(body).into();
    assert_eq!(cxdb.server.blob(&hash).as_deref(), Some(body.as_slice()));

    let turns = cxdb.server.turns(sink.context_id());
    assert_eq!(turns.len(), 1);
    let turn = &turns[0];
    assert_eq!(turn.type_id, "com.kilroy.attractor.Artifact");
    assert_eq!(turn.data["run_id"], "run-art");
    assert_eq!(turn.data["node_id"], "review");
    assert_eq!(turn.data["name"], "final_report");
    assert_eq!(turn.data["mime"], "text/markdown");
    assert_eq!(turn.data["bytes_len"], body.len() as u64);
    assert_eq!(turn.data["content_hash"], hex::encode(hash));
}

#[tokio::test]
async fn artifact_upload_is_idempotent() {
    let cxdb = spawn_cxdb().await;
    let sink = sink_for(&cxdb, "run-idem").await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.json");
    std::fs::write(&path, br#"{"ok":true}"#).unwrap();

    let first = sink
        .put_artifact_file("synth", "result", &path)
        .await
        .unwrap();
    let second = sink
        .put_artifact_file("synth", "result", &path)
        .await
        .unwrap();
    // Same run/node/name/hash derive the same idempotency key; the server
    // replays the original turn.
    assert_eq!(first, second);
    assert_eq!(cxdb.server.turns(sink.context_id()).len(), 1);
}

#[tokio::test]
async fn missing_artifact_file_is_an_error() {
    let cxdb = spawn_cxdb().await;
    let sink = sink_for(&cxdb, "run-missing").await;
    let err = sink
        .put_artifact_file("review", "gone", std::path::Path::new("/nonexistent/file.txt"))
        .await
        .unwrap_err();
    assert!(matches!(err, attractor::EngineError::Io(_)));
}

#[tokio::test]
async fn fork_from_head_bases_new_context_at_current_head() {
    let cxdb = spawn_cxdb().await;
    let sink = sink_for(&cxdb, "run-fork").await;

    let mut data = serde_json::Map::new();
    data.insert("k".into(), serde_json::Value::from("v"));
    let (turn_id, _) = sink
        .append("com.kilroy.attractor.NodeExecution", 1, data)
        .await
        .unwrap();

    let fork = sink.fork_from_head().await.unwrap();
    assert_ne!(fork.context_id(), sink.context_id());
    assert_eq!(fork.head_turn_id().await, turn_id);
}
