//! HTTP contract tests for the Ollama embedding client against a mock
//! server: happy path, count mismatch, and backend errors.

use httpmock::prelude::*;
use serde_json::json;

use ragstore::config::EmbeddingConfig;
use ragstore::embedding::{Embedder, EmbeddingError, OllamaEmbedder};

fn config_for(base_url: String) -> EmbeddingConfig {
    EmbeddingConfig {
        provider: "ollama".to_string(),
        model: Some("nomic-embed-text".to_string()),
        base_url: Some(base_url),
        dims: Some(2),
        batch_size: 64,
        max_retries: 0,
        timeout_secs: 5,
    }
}

#[tokio::test]
async fn test_embed_many_returns_one_vector_per_text() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/embed")
                .json_body_partial(r#"{"model": "nomic-embed-text"}"#);
            then.status(200)
                .json_body(json!({ "embeddings": [[0.1, 0.2], [0.3, 0.4]] }));
        })
        .await;

    let embedder = OllamaEmbedder::new(&config_for(server.base_url())).unwrap();
    let vectors = embedder
        .embed_many(&["first".to_string(), "second".to_string()])
        .await
        .unwrap();

    assert_eq!(vectors, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_embed_one_unwraps_single_vector() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/embed");
            then.status(200).json_body(json!({ "embeddings": [[1.0, 0.0]] }));
        })
        .await;

    let embedder = OllamaEmbedder::new(&config_for(server.base_url())).unwrap();
    let vector = embedder.embed_one("query text").await.unwrap();
    assert_eq!(vector, vec![1.0, 0.0]);
}

#[tokio::test]
async fn test_count_mismatch_is_a_hard_failure() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/embed");
            then.status(200).json_body(json!({ "embeddings": [[0.5, 0.5]] }));
        })
        .await;

    let embedder = OllamaEmbedder::new(&config_for(server.base_url())).unwrap();
    let err = embedder
        .embed_many(&["one".to_string(), "two".to_string()])
        .await
        .unwrap_err();

    match err {
        EmbeddingError::CountMismatch { expected, got } => {
            assert_eq!(expected, 2);
            assert_eq!(got, 1);
        }
        other => panic!("expected CountMismatch, got {:?}", other),
    }
}

#[tokio::test]
async fn test_server_error_propagates_without_retry() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/embed");
            then.status(500).body("model exploded");
        })
        .await;

    let embedder = OllamaEmbedder::new(&config_for(server.base_url())).unwrap();
    let err = embedder
        .embed_many(&["text".to_string()])
        .await
        .unwrap_err();

    assert!(matches!(err, EmbeddingError::Backend(_)));
    assert!(err.to_string().contains("500"));
    // max_retries = 0: exactly one request went out.
    mock.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_client_error_fails_immediately() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/embed");
            then.status(404).body(r#"{"error": "model not found"}"#);
        })
        .await;

    let embedder = OllamaEmbedder::new(&config_for(server.base_url())).unwrap();
    let err = embedder
        .embed_many(&["text".to_string()])
        .await
        .unwrap_err();

    assert!(matches!(err, EmbeddingError::Backend(_)));
    assert!(err.to_string().contains("model not found"));
}

#[tokio::test]
async fn test_retries_recover_from_transient_error() {
    let server = MockServer::start_async().await;
    // First attempt hits the 500, the mock is then replaced by a success.
    let mut failing = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/embed");
            then.status(500).body("transient");
        })
        .await;

    let mut config = config_for(server.base_url());
    config.max_retries = 1;
    let embedder = OllamaEmbedder::new(&config).unwrap();

    let handle = tokio::spawn(async move { embedder.embed_many(&["text".to_string()]).await });

    // Swap the mock to succeed while the client backs off.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    failing.delete_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/embed");
            then.status(200).json_body(json!({ "embeddings": [[0.9, 0.1]] }));
        })
        .await;

    let vectors = handle.await.unwrap().unwrap();
    assert_eq!(vectors, vec![vec![0.9, 0.1]]);
}
