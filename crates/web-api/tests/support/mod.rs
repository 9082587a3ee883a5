#![allow(dead_code)]

use std::{net::SocketAddr, time::Duration};

use axum::Router;
use config::AppConfig;
use domain::Identity;
use infrastructure::Infrastructure;
use reqwest::Client;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio::{net::TcpListener, sync::oneshot, time::sleep};
use web_api::{router, AppState};

/// 使用内存存储装配完整路由，不依赖外部服务。
pub fn build_router() -> Router {
    let config = AppConfig::default();
    let infrastructure = Infrastructure::in_memory(&config);
    router(AppState::new(infrastructure.deps, &config))
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub client: Client,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn spawn() -> Self {
        let router = build_router();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, router.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        // allow server to start
        sleep(Duration::from_millis(50)).await;

        Self {
            addr,
            client: Client::new(),
            shutdown: Some(shutdown_tx),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}/api/v1{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}/api/v1{}", self.addr, path)
    }

    pub async fn find_match(&self, identity: &Identity) -> Value {
        let response = self
            .client
            .post(self.url("/match"))
            .json(&json!({ "identity": identity }))
            .send()
            .await
            .expect("match request");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        response.json().await.expect("match json")
    }

    pub async fn send_text(&self, room_id: &str, identity: &Identity, text: &str) -> reqwest::Response {
        self.client
            .post(self.url(&format!("/rooms/{room_id}/messages")))
            .json(&json!({
                "participant_id": identity.display_name,
                "device_id": identity.device_id,
                "text": text,
            }))
            .send()
            .await
            .expect("send request")
    }

    pub async fn leave(&self, room_id: &str, identity: &Identity) -> Value {
        let response = self
            .client
            .post(self.url(&format!("/rooms/{room_id}/leave")))
            .json(&json!({ "device_id": identity.device_id }))
            .send()
            .await
            .expect("leave request");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        response.json().await.expect("leave json")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

pub fn new_identity() -> Identity {
    Identity::generate(&mut rand::rng(), OffsetDateTime::now_utc())
}
