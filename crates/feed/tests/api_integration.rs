//! Integration tests: ApiClient endpoints against the in-process mock backend.

mod common;

use common::{init_tracing, Data, MockBackend, PASSWORD, TOKEN};
use feed::{ApiClient, FeedError, MemoryTokenStore, Session, TokenStore};
use serde_json::json;
use std::time::Duration;

async fn client() -> (MockBackend, ApiClient) {
    init_tracing();
    let mock = MockBackend::start(Data {
        users: vec![
            json!({"id": 1, "name": "Ada", "email": "ada@example.com", "product_key": "PK-1"}),
            json!({"id": 2, "name": "Bob", "email": "bob@example.com", "product_key": "PK-2"}),
        ],
        products: vec![json!({"product_key": "PK-1"})],
        ..Default::default()
    })
    .await;
    let api = ApiClient::new(format!("{}/", mock.url), Duration::from_secs(5)).unwrap();
    (mock, api)
}

#[tokio::test]
async fn sign_in_stores_token() {
    let (_mock, api) = client().await;
    let resp = api.sign_in("admin@example.com", PASSWORD).await.unwrap();
    assert_eq!(resp.token, TOKEN);

    let store = MemoryTokenStore::new();
    store.set(&resp.token);
    assert_eq!(store.get().as_deref(), Some(TOKEN));
    // The mock's token is opaque, so it cannot be restored into a session.
    assert!(Session::restore(&store).is_err());
    assert!(store.get().is_none());

    let err = api.sign_in("admin@example.com", "wrong").await.unwrap_err();
    assert!(err.is_auth(), "{err}");
}

#[tokio::test]
async fn sign_up_reports_server_message() {
    let (_mock, api) = client().await;
    let ok = api.sign_up("new@example.com", "pw").await.unwrap();
    assert_eq!(ok["message"], "Signup request submitted");
    match api.sign_up("", "pw").await {
        Err(FeedError::Status { status, message }) => {
            assert_eq!(status, 400);
            assert_eq!(message, "Email is required");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn users_by_product_key() {
    let (mock, api) = client().await;
    let users = api.list_users(TOKEN).await.unwrap();
    assert_eq!(users.len(), 2);
    assert_eq!(users[0].name.as_deref(), Some("Ada"));

    let bob = api.user_by_product_key(TOKEN, "PK-2").await.unwrap();
    assert_eq!(bob.email.as_deref(), Some("bob@example.com"));

    api.delete_user(TOKEN, "PK-2").await.unwrap();
    assert_eq!(mock.backend.data.lock().unwrap().users.len(), 1);
    assert!(matches!(
        api.user_by_product_key(TOKEN, "PK-2").await,
        Err(FeedError::Status { status: 404, .. })
    ));
}

#[tokio::test]
async fn products_crud() {
    let (_mock, api) = client().await;
    api.add_product(TOKEN, "  PK-9 ").await.unwrap();
    let keys: Vec<String> = api
        .list_products(TOKEN)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.product_key)
        .collect();
    assert_eq!(keys, vec!["PK-1", "PK-9"]);

    api.delete_product(TOKEN, "PK-1").await.unwrap();
    match api.delete_product(TOKEN, "PK-1").await {
        Err(FeedError::Status { status, message }) => {
            assert_eq!(status, 404);
            assert_eq!(message, "Product not found");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn empty_product_key_is_rejected_locally() {
    let (mock, api) = client().await;
    assert!(matches!(
        api.add_product(TOKEN, "   ").await,
        Err(FeedError::Decode(_))
    ));
    assert!(matches!(
        api.delete_user(TOKEN, "").await,
        Err(FeedError::Decode(_))
    ));
    assert_eq!(mock.backend.data.lock().unwrap().products.len(), 1);
}

#[tokio::test]
async fn bad_token_maps_to_auth() {
    let (_mock, api) = client().await;
    for result in [
        api.list_users("stale").await.map(|_| ()),
        api.list_products("stale").await.map(|_| ()),
        api.delete_product("stale", "PK-1").await,
    ] {
        let err = result.unwrap_err();
        assert!(err.is_auth(), "{err}");
        assert!(!err.is_network());
    }
}
