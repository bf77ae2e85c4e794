//! Scripted engine for tests: a real TCP listener speaking the frame
//! protocol, with knobs for ping behavior and canned request responses.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::transport::framing::{Frame, FrameKind, read_frame, write_frame};

pub struct StubEngineBuilder {
    serializer: String,
    answer_pings: bool,
    response: Option<Vec<u8>>,
    hold_responses: bool,
}

impl StubEngineBuilder {
    pub fn serializer(mut self, name: &str) -> Self {
        self.serializer = name.to_string();
        self
    }

    pub fn answer_pings(mut self, answer: bool) -> Self {
        self.answer_pings = answer;
        self
    }

    /// Canned payload for every `Request`. Without it the stub echoes the
    /// request payload back.
    pub fn respond_with(mut self, payload: Vec<u8>) -> Self {
        self.response = Some(payload);
        self
    }

    /// Queue request answers instead of writing them immediately;
    /// `release_responses` flushes the queue in arrival order.
    pub fn hold_responses(mut self) -> Self {
        self.hold_responses = true;
        self
    }

    pub async fn spawn(self) -> StubEngine {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub engine listener");
        let port = listener.local_addr().expect("stub engine local addr").port();

        let inner = Arc::new(StubInner {
            serializer: self.serializer,
            answer_pings: AtomicBool::new(self.answer_pings),
            response: Mutex::new(self.response),
            hold_responses: AtomicBool::new(self.hold_responses),
            deferred: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
            accepts: AtomicUsize::new(0),
        });

        let accept_inner = Arc::clone(&inner);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                accept_inner.accepts.fetch_add(1, Ordering::Relaxed);
                serve_connection(Arc::clone(&accept_inner), stream).await;
            }
        });

        StubEngine {
            port,
            inner,
            accept_task,
        }
    }
}

struct Connection {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    task: JoinHandle<()>,
}

struct StubInner {
    serializer: String,
    answer_pings: AtomicBool,
    response: Mutex<Option<Vec<u8>>>,
    hold_responses: AtomicBool,
    deferred: Mutex<Vec<(Arc<Mutex<OwnedWriteHalf>>, Vec<u8>)>>,
    requests: Mutex<Vec<Vec<u8>>>,
    connections: Mutex<Vec<Connection>>,
    accepts: AtomicUsize,
}

pub struct StubEngine {
    port: u16,
    inner: Arc<StubInner>,
    accept_task: JoinHandle<()>,
}

impl StubEngine {
    pub async fn spawn() -> Self {
        Self::builder().spawn().await
    }

    pub fn builder() -> StubEngineBuilder {
        StubEngineBuilder {
            serializer: "binary".to_string(),
            answer_pings: true,
            response: None,
            hold_responses: false,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_answer_pings(&self, answer: bool) {
        self.inner.answer_pings.store(answer, Ordering::Relaxed);
    }

    pub fn accept_count(&self) -> usize {
        self.inner.accepts.load(Ordering::Relaxed)
    }

    pub async fn recorded_requests(&self) -> Vec<Vec<u8>> {
        self.inner.requests.lock().await.clone()
    }

    /// Publishes a display message on every live connection.
    pub async fn publish(&self, message: Vec<u8>) {
        let connections = self.inner.connections.lock().await;
        for connection in connections.iter() {
            let mut writer = connection.writer.lock().await;
            let _ = write_frame(&mut *writer, &Frame::new(FrameKind::Message, message.clone())).await;
        }
    }

    /// Writes out every answer held back by `hold_responses`, oldest first.
    pub async fn release_responses(&self) {
        let deferred: Vec<_> = self.inner.deferred.lock().await.drain(..).collect();
        for (writer, payload) in deferred {
            let mut writer = writer.lock().await;
            let _ = write_frame(&mut *writer, &Frame::new(FrameKind::Response, payload)).await;
        }
    }

    /// Hard-drops every established connection; the listener stays up so
    /// reconnect attempts succeed.
    pub async fn drop_connections(&self) {
        let mut connections = self.inner.connections.lock().await;
        for connection in connections.drain(..) {
            connection.task.abort();
        }
    }
}

impl Drop for StubEngine {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_connection(inner: Arc<StubInner>, stream: TcpStream) {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));

    let conn_inner = Arc::clone(&inner);
    let conn_writer = Arc::clone(&writer);
    let task = tokio::spawn(async move {
        while let Ok(frame) = read_frame(&mut reader).await {
            match frame.kind {
                FrameKind::Hello => {
                    let ack = format!(r#"{{"serializer":{:?}}}"#, conn_inner.serializer);
                    let mut writer = conn_writer.lock().await;
                    let _ =
                        write_frame(&mut *writer, &Frame::new(FrameKind::HelloAck, ack.into_bytes()))
                            .await;
                }
                FrameKind::Ping => {
                    if conn_inner.answer_pings.load(Ordering::Relaxed) {
                        let mut writer = conn_writer.lock().await;
                        let _ = write_frame(&mut *writer, &Frame::empty(FrameKind::Pong)).await;
                    }
                }
                FrameKind::Request => {
                    let response = {
                        let canned = conn_inner.response.lock().await;
                        canned.clone().unwrap_or_else(|| frame.payload.clone())
                    };
                    conn_inner.requests.lock().await.push(frame.payload);
                    if conn_inner.hold_responses.load(Ordering::Relaxed) {
                        conn_inner
                            .deferred
                            .lock()
                            .await
                            .push((Arc::clone(&conn_writer), response));
                    } else {
                        let mut writer = conn_writer.lock().await;
                        let _ = write_frame(&mut *writer, &Frame::new(FrameKind::Response, response))
                            .await;
                    }
                }
                _ => {}
            }
        }
    });

    inner.connections.lock().await.push(Connection { writer, task });
}
