//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use tokio::sync::mpsc;

use mq_bridge::{
    //
    ClientConfig,
    ConsumerId,
    MqClient,
    MqError,
    ProducerId,
    Reply,
    Result,
    SendReceipt,
    SubscriptionHandle,
    Transport,
    TransportConnector,
    TransportHealth,
    TransportMode,
    TransportPtr,
};

/// Route crate logs to the test harness once per binary. `RUST_LOG` applies.
pub fn init_tracing() {
    // ---
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn config() -> ClientConfig {
    ClientConfig::new("stub://broker", "ak", "sk", "I1")
}

/// Knobs that change how [`StubTransport`] answers.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Successful transactional replies carry no transaction id.
    pub omit_transaction_id: bool,
    /// Every send is rejected with this message.
    pub reject_send: Option<String>,
    /// Raw creates wait this long before answering.
    pub create_delay: Option<Duration>,
    /// Health probes answer unhealthy with this message.
    pub degraded: Option<String>,
    /// Health probes fail outright.
    pub unreachable: bool,
    /// Subscriptions fail with this raw transport error.
    pub reject_subscribe: Option<String>,
    /// Closing the transport fails with this raw transport error.
    pub fail_close: Option<String>,
}

/// What a stub send observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenSend {
    pub body: String,
    pub tag: String,
    pub props_json: String,
    pub sharding_key: Option<String>,
}

/// Scripted transport that records every call.
///
/// Mimics a strict broker: the second raw consumer create for any group
/// fails with "group exists", so only the client registry keeps it away.
#[derive(Default)]
pub struct StubTransport {
    pub script: Mutex<Script>,
    pub producer_creates: AtomicUsize,
    pub consumer_creates: AtomicUsize,
    pub producer_shutdowns: AtomicUsize,
    pub consumer_shutdowns: AtomicUsize,
    pub acks: Mutex<Vec<String>>,
    pub sends: Mutex<Vec<SeenSend>>,
    pub closes: AtomicUsize,
    inboxes: Mutex<Vec<mpsc::Sender<String>>>,
}

impl StubTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripted(script: Script) -> Arc<Self> {
        let stub = Self::default();
        *stub.script.lock().unwrap() = script;
        Arc::new(stub)
    }

    pub fn script(&self) -> Script {
        self.script.lock().unwrap().clone()
    }

    /// Push raw text to every subscription opened so far.
    pub async fn inject(&self, raw: impl Into<String>) {
        // ---
        let raw = raw.into();
        let inboxes: Vec<_> = self.inboxes.lock().unwrap().clone();
        for tx in inboxes {
            let _ = tx.send(raw.clone()).await;
        }
    }

    /// Push a well-formed message to every subscription.
    pub async fn deliver(&self, message_id: &str, receipt_handle: &str, body: &str) {
        let raw = serde_json::json!({
            "messageId": message_id,
            "receiptHandle": receipt_handle,
            "body": body,
            "tag": "t",
        });
        self.inject(raw.to_string()).await;
    }

    pub fn sent(&self) -> Vec<SeenSend> {
        self.sends.lock().unwrap().clone()
    }

    fn record_send(
        &self,
        body: &str,
        tag: &str,
        props_json: &str,
        sharding_key: Option<&str>,
    ) -> Reply<SendReceipt> {
        // ---
        if let Some(message) = self.script().reject_send {
            return Reply::failed(message);
        }

        let mut sends = self.sends.lock().unwrap();
        sends.push(SeenSend {
            body: body.to_string(),
            tag: tag.to_string(),
            props_json: props_json.to_string(),
            sharding_key: sharding_key.map(str::to_string),
        });

        let n = sends.len();
        Reply::ok(SendReceipt {
            message_id: format!("msg-{n}"),
            receipt_handle: format!("rh-{n}"),
            transaction_id: None,
        })
    }
}

#[async_trait::async_trait]
impl Transport for StubTransport {
    // ---
    fn mode(&self) -> TransportMode {
        TransportMode::Proxy
    }

    async fn create_producer(&self, _config: &ClientConfig, _topic: &str) -> Result<Reply<ProducerId>> {
        if let Some(delay) = self.script().create_delay {
            tokio::time::sleep(delay).await;
        }
        let n = self.producer_creates.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Reply::ok(ProducerId::from(format!("producer-{n}"))))
    }

    async fn create_consumer(
        &self,
        _config: &ClientConfig,
        _topic: &str,
        _group_id: &str,
        _tag_expression: &str,
    ) -> Result<Reply<ConsumerId>> {
        // ---
        if let Some(delay) = self.script().create_delay {
            tokio::time::sleep(delay).await;
        }
        let n = self.consumer_creates.fetch_add(1, Ordering::SeqCst) + 1;
        if n > 1 {
            return Ok(Reply::failed("group exists"));
        }
        Ok(Reply::ok(ConsumerId::from(format!("consumer-{n}"))))
    }

    async fn send(
        &self,
        _producer: &ProducerId,
        body: &str,
        tag: &str,
        props_json: &str,
    ) -> Result<Reply<SendReceipt>> {
        Ok(self.record_send(body, tag, props_json, None))
    }

    async fn send_ordered(
        &self,
        _producer: &ProducerId,
        body: &str,
        tag: &str,
        props_json: &str,
        sharding_key: &str,
    ) -> Result<Reply<SendReceipt>> {
        Ok(self.record_send(body, tag, props_json, Some(sharding_key)))
    }

    async fn send_transactional(
        &self,
        _producer: &ProducerId,
        body: &str,
        tag: &str,
        props_json: &str,
        _check_immunity_secs: u64,
    ) -> Result<Reply<SendReceipt>> {
        // ---
        let mut reply = self.record_send(body, tag, props_json, None);
        if !self.script().omit_transaction_id {
            if let Some(receipt) = reply.payload.as_mut() {
                receipt.transaction_id = Some(format!("txn-{}", receipt.message_id));
            }
        }
        Ok(reply)
    }

    async fn subscribe(
        &self,
        _consumer: &ConsumerId,
        _tag_expression: &str,
    ) -> Result<SubscriptionHandle> {
        // ---
        if let Some(message) = self.script().reject_subscribe {
            return Err(MqError::Transport(message));
        }
        let (tx, rx) = mpsc::channel(16);
        self.inboxes.lock().unwrap().push(tx);
        Ok(SubscriptionHandle { inbox: rx })
    }

    async fn ack(&self, _consumer: &ConsumerId, receipt_handle: &str) -> Result<Reply<()>> {
        // ---
        if receipt_handle.starts_with("expired") {
            return Ok(Reply::failed("receipt handle expired"));
        }
        self.acks.lock().unwrap().push(receipt_handle.to_string());
        Ok(Reply::ok_with_message((), "ok"))
    }

    async fn shutdown_producer(&self, _producer: &ProducerId) -> Result<Reply<()>> {
        self.producer_shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(Reply::ok(()))
    }

    async fn shutdown_consumer(&self, _consumer: &ConsumerId) -> Result<Reply<()>> {
        self.consumer_shutdowns.fetch_add(1, Ordering::SeqCst);
        self.inboxes.lock().unwrap().clear();
        Ok(Reply::ok(()))
    }

    async fn health_check(&self) -> Result<TransportHealth> {
        // ---
        let script = self.script();
        if script.unreachable {
            return Err(MqError::Transport("proxy unreachable".into()));
        }
        Ok(match script.degraded {
            Some(message) => TransportHealth {
                healthy: false,
                message,
            },
            None => TransportHealth {
                healthy: true,
                message: "ok".into(),
            },
        })
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        match self.script().fail_close {
            Some(message) => Err(MqError::Transport(message)),
            None => Ok(()),
        }
    }
}

/// Hands out one shared [`StubTransport`], or fails to connect.
pub struct StubConnector {
    pub transport: Arc<StubTransport>,
    pub fail_with: Option<String>,
    pub connects: Arc<AtomicUsize>,
}

impl StubConnector {
    pub fn new(transport: Arc<StubTransport>) -> Self {
        Self {
            transport,
            fail_with: None,
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            transport: StubTransport::new(),
            fail_with: Some(message.to_string()),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait::async_trait]
impl TransportConnector for StubConnector {
    fn mode(&self) -> TransportMode {
        TransportMode::Proxy
    }

    async fn connect(&self, _config: &ClientConfig) -> Result<TransportPtr> {
        // ---
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_with {
            return Err(MqError::Transport(message.clone()));
        }
        let transport: TransportPtr = self.transport.clone();
        Ok(transport)
    }
}

/// A client over a fresh stub, plus the stub for inspection.
pub fn stub_client(script: Script) -> (MqClient, Arc<StubTransport>) {
    // ---
    init_tracing();
    let stub = StubTransport::scripted(script);
    let client = MqClient::new(config(), StubConnector::new(stub.clone())).unwrap();
    (client, stub)
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
