#![allow(dead_code)]

use std::{
    future::Future,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use busgate::{
    bus::{BusRecord, ConnectionStatus, ServiceBus, StatusNotifier},
    error::BusError,
};
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::TcpStream,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

type Responder = dyn Fn(&BusRecord) -> Result<Bytes, BusError> + Send + Sync;

/// An in-memory bus that records what it was asked to do.
pub struct MockBus {
    responder: Box<Responder>,
    calls: Mutex<Vec<(String, BusRecord)>>,
    posts: Mutex<Vec<(String, BusRecord)>>,
    delay: Duration,
}

impl MockBus {
    pub fn replying(
        responder: impl Fn(&BusRecord) -> Result<Bytes, BusError> + Send + Sync + 'static,
    ) -> Self {
        MockBus {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
            posts: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    pub fn echo() -> Self {
        Self::replying(|record| Ok(record.payload.clone()))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<(String, BusRecord)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn posts(&self) -> Vec<(String, BusRecord)> {
        self.posts.lock().unwrap().clone()
    }
}

impl ServiceBus for MockBus {
    type Session = usize;

    fn open_session(&self, slot: usize) -> Result<usize, BusError> {
        Ok(slot)
    }

    fn call<'a>(
        &'a self,
        _session: &'a mut usize,
        service: &'a str,
        record: BusRecord,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<BusRecord, BusError>> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.calls
                .lock()
                .unwrap()
                .push((service.to_string(), record.clone()));
            let payload = (self.responder)(&record)?;
            Ok(BusRecord { payload, ..record })
        })
    }

    fn post<'a>(
        &'a self,
        _session: &'a mut usize,
        service: &'a str,
        record: BusRecord,
    ) -> BoxFuture<'a, Result<(), BusError>> {
        Box::pin(async move {
            self.posts
                .lock()
                .unwrap()
                .push((service.to_string(), record));
            Ok(())
        })
    }
}

/// Collects status notifications.
#[derive(Clone, Default)]
pub struct Statuses(Arc<Mutex<Vec<ConnectionStatus>>>);

impl Statuses {
    pub fn snapshot(&self) -> Vec<ConnectionStatus> {
        self.0.lock().unwrap().clone()
    }
}

impl StatusNotifier for Statuses {
    fn notify(&self, status: ConnectionStatus) {
        self.0.lock().unwrap().push(status);
    }
}

/// Polls `condition` until it holds, failing after five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

/// Bounds a test step to five seconds.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("step did not finish within 5s")
}

/// A network peer speaking the gateway's framing.
pub struct Peer {
    pub framing: busgate::framing::FramingConfig,
    pub stream: BufReader<TcpStream>,
}

impl Peer {
    pub fn new(framing: &str, stream: TcpStream) -> Self {
        Peer {
            framing: busgate::framing::FramingConfig::parse(framing).unwrap(),
            stream: BufReader::new(stream),
        }
    }

    /// The peer's own address, which the gateway sees as the connection's peer address.
    pub fn local_addr(&self) -> SocketAddr {
        self.stream.get_ref().local_addr().unwrap()
    }

    pub async fn send(&mut self, message: &[u8]) {
        let frame = self.framing.encode(message).unwrap();
        self.stream.get_mut().write_all(&frame).await.unwrap();
    }

    pub async fn recv(&mut self) -> Bytes {
        within(self.framing.decode(&mut self.stream)).await.unwrap()
    }
}
