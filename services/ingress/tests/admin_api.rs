use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use veil_credentials::{CredentialKey, CredentialLedger};
use veil_ingress::admin;

struct AdminHandle {
    base_url: String,
    ledger: Arc<CredentialLedger>,
    client: reqwest::Client,
    shutdown_tx: watch::Sender<bool>,
    server: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl AdminHandle {
    async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let ledger = Arc::new(CredentialLedger::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let server = tokio::spawn(admin::serve(listener, Arc::clone(&ledger), shutdown_rx));

        Self {
            base_url: format!("http://{addr}"),
            ledger,
            client: reqwest::Client::new(),
            shutdown_tx,
            server,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn users(&self) -> Vec<Value> {
        self.client
            .get(self.url("/trojan/users"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn add_list_and_delete_by_password() {
    let admin = AdminHandle::spawn().await;

    let response = admin
        .client
        .post(admin.url("/trojan/users/add"))
        .json(&json!({ "password": "hunter2" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let key = CredentialKey::derive("hunter2");
    admin.ledger.consume(&key, 100, 250);

    let users = admin.users().await;
    assert_eq!(
        users,
        vec![json!({ "key": key.as_str(), "up": 100, "down": 250 })]
    );

    let response = admin
        .client
        .delete(admin.url("/trojan/users/del"))
        .json(&json!({ "password": "hunter2" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(admin.users().await.is_empty());
}

#[tokio::test]
async fn add_and_delete_by_key() {
    let admin = AdminHandle::spawn().await;
    let key = CredentialKey::derive("pre-hashed");

    admin
        .client
        .post(admin.url("/trojan/users/add"))
        .json(&json!({ "key": key.as_str().to_uppercase() }))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();
    assert!(admin.ledger.contains(&key));

    // Adding again keeps the counters.
    admin.ledger.consume(&key, 1, 2);
    admin
        .client
        .post(admin.url("/trojan/users/add"))
        .json(&json!({ "key": key.as_str() }))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();
    let usage = admin.ledger.usage(&key).unwrap();
    assert_eq!((usage.uploaded, usage.downloaded), (1, 2));

    admin
        .client
        .delete(admin.url("/trojan/users/del"))
        .json(&json!({ "key": key.as_str() }))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();
    assert!(admin.ledger.is_empty());
}

#[tokio::test]
async fn empty_request_changes_nothing() {
    let admin = AdminHandle::spawn().await;
    admin.ledger.add("keep me");

    for body in [json!({}), json!({ "password": "", "key": "" })] {
        let response = admin
            .client
            .delete(admin.url("/trojan/users/del"))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
    }
    assert_eq!(admin.ledger.len(), 1);
}

#[tokio::test]
async fn malformed_key_is_bad_request() {
    let admin = AdminHandle::spawn().await;

    let response = admin
        .client
        .post(admin.url("/trojan/users/add"))
        .json(&json!({ "key": "zz" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().starts_with("invalid key"));
    assert!(admin.ledger.is_empty());
}

#[tokio::test]
async fn wrong_method_is_rejected() {
    let admin = AdminHandle::spawn().await;

    let response = admin
        .client
        .get(admin.url("/trojan/users/add"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn shutdown_stops_server() {
    let admin = AdminHandle::spawn().await;
    admin.shutdown_tx.send(true).unwrap();

    let result = tokio::time::timeout(std::time::Duration::from_secs(2), admin.server)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}
