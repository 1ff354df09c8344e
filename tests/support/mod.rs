use std::net::SocketAddr;
use std::sync::Arc;

use logrelay::engine::EngineClient;
use logrelay::model::LogRecord;
use logrelay::pipeline::Ingestor;
use logrelay::server::{router, AppState};
use logrelay::subscribers::SubscriberRegistry;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub struct Gateway {
    pub addr: SocketAddr,
    pub registry: Arc<SubscriberRegistry>,
    /// The persistence feed the batch writer would drain. Tests observe it
    /// directly instead of standing up a search engine.
    pub records_rx: mpsc::Receiver<LogRecord>,
    _shutdown: watch::Sender<bool>,
    _server: JoinHandle<()>,
}

impl Gateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, query: &str) -> String {
        format!("ws://{}/ws{}", self.addr, query)
    }
}

/// Spawn a gateway on an ephemeral port. The engine client points at a
/// closed port, so query endpoints report the engine unavailable while the
/// ingest/broadcast paths run for real.
pub async fn spawn_gateway() -> Gateway {
    let engine = EngineClient::new("http://127.0.0.1:9", "").unwrap();
    let registry = SubscriberRegistry::new();
    let (records_tx, records_rx) = mpsc::channel(1024);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(AppState::new(
        Ingestor::new(records_tx, Arc::clone(&registry)),
        Arc::clone(&registry),
        engine,
        shutdown_rx,
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(listener, router(state))
            .await
            .expect("gateway server");
    });

    Gateway {
        addr,
        registry,
        records_rx,
        _shutdown: shutdown_tx,
        _server: server,
    }
}
