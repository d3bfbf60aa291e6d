mod helpers;

use engram::db::retry::Deadline;
use engram::memory::recall::{recall, RecallRequest};
use engram::memory::store::{store_memory, StoreRequest};
use helpers::{hash_embedding, stub_gateway, test_config, test_db};

#[test]
fn recall_returns_nothing_for_another_users_content() {
    let mut conn = test_db();
    let model = stub_gateway();
    let config = test_config();

    store_memory(
        &mut conn,
        &model,
        &config,
        Deadline::unbounded(),
        StoreRequest {
            user_id: "alice".to_string(),
            content: "X".to_string(),
            ..StoreRequest::default()
        },
    )
    .unwrap();

    // Even with the similarity floor at zero, another user sees nothing.
    let emb = hash_embedding("X");
    let response = recall(
        &mut conn,
        &config,
        Deadline::unbounded(),
        &emb,
        &RecallRequest {
            user_id: "bob".to_string(),
            query_text: "X".to_string(),
            limit: 10,
            min_similarity: Some(0.0),
            ..RecallRequest::default()
        },
    )
    .unwrap();
    assert_eq!(response.total_returned, 0);
}

#[test]
fn users_with_identical_content_stay_isolated() {
    let mut conn = test_db();
    let model = stub_gateway();
    let config = test_config();

    for user in ["alice", "bob"] {
        store_memory(
            &mut conn,
            &model,
            &config,
            Deadline::unbounded(),
            StoreRequest {
                user_id: user.to_string(),
                content: "Both users know this fact".to_string(),
                ..StoreRequest::default()
            },
        )
        .unwrap();
    }

    let emb = hash_embedding("Both users know this fact");
    for user in ["alice", "bob"] {
        let response = recall(
            &mut conn,
            &config,
            Deadline::unbounded(),
            &emb,
            &RecallRequest {
                user_id: user.to_string(),
                query_text: "the fact".to_string(),
                limit: 10,
                min_similarity: Some(0.0),
                ..RecallRequest::default()
            },
        )
        .unwrap();
        assert_eq!(response.total_returned, 1);
        assert_eq!(response.memories[0].memory.user_id, user);
    }
}
