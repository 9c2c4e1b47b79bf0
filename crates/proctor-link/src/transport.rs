//! Socket.IO client transport over Engine.IO HTTP long-polling.
//!
//! Sending is a `POST` to the session URL. Receiving needs an outstanding
//! `GET`, so once connected a heartbeat thread keeps one poll open, answers
//! the server's pings and notices when the server drops the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use proctor_core::ReleaseHandle;
use serde_json::Value;
use ureq::Agent;

use crate::error::LinkError;
use crate::packet::{decode_payload, encode_payload, EnginePacket, SocketPacket};

/// Path the Engine.IO server is mounted on.
const ENGINE_PATH: &str = "/socket.io/";

/// A persistent, message-oriented connection to the collector.
pub trait Transport: Send {
    /// Establish the connection, including the namespace handshake.
    fn open(&mut self) -> Result<(), LinkError>;

    /// Send one named event. Does not wait for any acknowledgement.
    fn emit(&mut self, event: &str, payload: Value) -> Result<(), LinkError>;

    /// Whether the connection is believed to be up.
    fn is_open(&self) -> bool;

    /// Tear the connection down. Idempotent.
    fn close(&mut self);

    /// Handle that tears the connection down from another thread and
    /// refuses any later `open`.
    fn close_handle(&self) -> ReleaseHandle;
}

/// One Engine.IO session (`sid`) and the namespace joined on it.
struct PollSession {
    url: String,
    namespace: String,
    /// The server drops a sid that sees two POSTs in flight, so every send
    /// on this session goes through the lock.
    poster: Mutex<Agent>,
    alive: AtomicBool,
    stop: AtomicBool,
}

impl PollSession {
    fn post(&self, packets: &[EnginePacket]) -> Result<(), LinkError> {
        let agent = self.poster.lock().unwrap_or_else(PoisonError::into_inner);
        post(&agent, &self.url, packets)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Leave the namespace and close the sid, unless the link is already down.
    fn disconnect(&self) {
        self.stop.store(true, Ordering::Release);
        if self.alive.swap(false, Ordering::AcqRel) {
            let disconnect = SocketPacket::Disconnect {
                nsp: self.namespace.clone(),
            };
            let packets = [EnginePacket::Message(disconnect.encode()), EnginePacket::Close];
            if let Err(e) = self.post(&packets) {
                tracing::debug!(error = %e, "close notification not delivered");
            }
        }
        tracing::info!(namespace = %self.namespace, "disconnected from proctor server");
    }
}

/// State shared between a transport and its close handles.
#[derive(Default)]
struct Link {
    current: Mutex<Option<Arc<PollSession>>>,
    shut: AtomicBool,
}

impl Link {
    fn current(&self) -> Option<Arc<PollSession>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take(&self) -> Option<Arc<PollSession>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn is_shut(&self) -> bool {
        self.shut.load(Ordering::Acquire)
    }

    fn shut_down(&self) {
        self.shut.store(true, Ordering::Release);
        if let Some(session) = self.take() {
            session.disconnect();
        }
    }
}

/// [`Transport`] speaking Socket.IO v5 over Engine.IO v4 polling.
pub struct PollingTransport {
    base_url: String,
    namespace: String,
    request_timeout: Duration,
    agent: Agent,
    link: Arc<Link>,
}

impl PollingTransport {
    pub fn new(server_url: &str, namespace: &str, request_timeout: Duration) -> Self {
        Self {
            base_url: server_url.trim_end_matches('/').to_string(),
            namespace: normalize_namespace(namespace),
            request_timeout,
            agent: agent_with_timeout(request_timeout),
            link: Arc::new(Link::default()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn handshake_url(&self) -> String {
        format!("{}{ENGINE_PATH}?EIO=4&transport=polling", self.base_url)
    }

    /// Poll until the namespace answers, for at most one request timeout.
    fn await_connect_ack(&self, session: &PollSession) -> Result<(), LinkError> {
        let deadline = Instant::now() + self.request_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            for packet in poll(&agent_with_timeout(remaining), &session.url)? {
                match packet {
                    EnginePacket::Ping(data) => session.post(&[EnginePacket::Pong(data)])?,
                    EnginePacket::Close => {
                        return Err(LinkError::Handshake(
                            "server closed the session during connect".into(),
                        ))
                    }
                    EnginePacket::Message(raw) => match SocketPacket::decode(&raw)? {
                        SocketPacket::Connect { nsp, .. } if nsp == self.namespace => {
                            return Ok(())
                        }
                        SocketPacket::ConnectError { nsp, data } if nsp == self.namespace => {
                            return Err(LinkError::Rejected {
                                nsp,
                                reason: error_message(&data),
                            })
                        }
                        other => tracing::debug!(?other, "ignoring packet before connect ack"),
                    },
                    _ => {}
                }
            }
        }
        Err(LinkError::Handshake(format!(
            "no connect acknowledgement from namespace {} within {:?}",
            self.namespace, self.request_timeout
        )))
    }
}

impl Transport for PollingTransport {
    fn open(&mut self) -> Result<(), LinkError> {
        if self.link.is_shut() {
            return Err(LinkError::Closed);
        }
        self.close();

        let packets = poll(&self.agent, &self.handshake_url())?;
        let handshake = match packets.into_iter().next() {
            Some(EnginePacket::Open(hs)) => hs,
            other => {
                return Err(LinkError::Handshake(format!(
                    "expected open packet, got {other:?}"
                )))
            }
        };
        tracing::debug!(
            sid = %handshake.sid,
            ping_interval_ms = handshake.ping_interval,
            ping_timeout_ms = handshake.ping_timeout,
            "engine.io session opened"
        );

        let session = Arc::new(PollSession {
            url: format!("{}&sid={}", self.handshake_url(), handshake.sid),
            namespace: self.namespace.clone(),
            poster: Mutex::new(self.agent.clone()),
            alive: AtomicBool::new(true),
            stop: AtomicBool::new(false),
        });

        let connect = SocketPacket::Connect {
            nsp: self.namespace.clone(),
            data: None,
        };
        session.post(&[EnginePacket::Message(connect.encode())])?;
        self.await_connect_ack(&session)?;

        {
            let mut current = self
                .link
                .current
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            // A close handle fired while we were connecting.
            if self.link.is_shut() {
                drop(current);
                session.disconnect();
                return Err(LinkError::Closed);
            }
            spawn_heartbeat(Heartbeat {
                poll_agent: agent_with_timeout(handshake.poll_deadline() + self.request_timeout),
                session: Arc::clone(&session),
            })?;
            *current = Some(session);
        }

        tracing::info!(
            server = %self.base_url,
            namespace = %self.namespace,
            "connected to proctor server"
        );
        Ok(())
    }

    fn emit(&mut self, event: &str, payload: Value) -> Result<(), LinkError> {
        let session = self
            .link
            .current()
            .filter(|s| s.is_alive())
            .ok_or(LinkError::NotConnected)?;

        let packet = SocketPacket::event(&self.namespace, event, payload);
        if let Err(e) = session.post(&[EnginePacket::Message(packet.encode())]) {
            session.alive.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.link.current().is_some_and(|s| s.is_alive())
    }

    fn close(&mut self) {
        if let Some(session) = self.link.take() {
            session.disconnect();
        }
    }

    fn close_handle(&self) -> ReleaseHandle {
        let link = Arc::clone(&self.link);
        ReleaseHandle::new(move || link.shut_down())
    }
}

impl Drop for PollingTransport {
    fn drop(&mut self) {
        self.close();
    }
}

struct Heartbeat {
    poll_agent: Agent,
    session: Arc<PollSession>,
}

impl Heartbeat {
    fn stopped(&self) -> bool {
        self.session.stop.load(Ordering::Acquire)
    }

    fn run(self) {
        tracing::debug!("heartbeat thread started");
        'poll: while !self.stopped() {
            let packets = match poll(&self.poll_agent, &self.session.url) {
                Ok(packets) => packets,
                Err(e) => {
                    if !self.stopped() {
                        tracing::warn!(error = %e, "poll failed — link down");
                    }
                    break;
                }
            };

            for packet in packets {
                match packet {
                    EnginePacket::Ping(data) => {
                        if let Err(e) = self.session.post(&[EnginePacket::Pong(data)]) {
                            tracing::warn!(error = %e, "pong failed — link down");
                            break 'poll;
                        }
                    }
                    EnginePacket::Close => {
                        tracing::warn!("server closed the session");
                        break 'poll;
                    }
                    EnginePacket::Message(raw) => match SocketPacket::decode(&raw) {
                        Ok(SocketPacket::Disconnect { nsp }) if nsp == self.session.namespace => {
                            tracing::warn!(namespace = %nsp, "server disconnected the namespace");
                            break 'poll;
                        }
                        Ok(other) => tracing::trace!(?other, "ignoring server packet"),
                        Err(e) => tracing::debug!(error = %e, "undecodable server packet"),
                    },
                    _ => {}
                }
            }
        }
        self.session.alive.store(false, Ordering::Release);
        tracing::debug!("heartbeat thread exiting");
    }
}

fn spawn_heartbeat(heartbeat: Heartbeat) -> Result<(), LinkError> {
    std::thread::Builder::new()
        .name("proctor-heartbeat".into())
        .spawn(move || heartbeat.run())
        .map_err(LinkError::Spawn)?;
    Ok(())
}

fn agent_with_timeout(timeout: Duration) -> Agent {
    Agent::config_builder()
        .timeout_global(Some(timeout))
        .build()
        .into()
}

fn poll(agent: &Agent, url: &str) -> Result<Vec<EnginePacket>, LinkError> {
    let mut response = agent.get(url).call()?;
    let body = response.body_mut().read_to_string()?;
    Ok(decode_payload(&body)?)
}

fn post(agent: &Agent, url: &str, packets: &[EnginePacket]) -> Result<(), LinkError> {
    let body = encode_payload(packets);
    let mut response = agent
        .post(url)
        .header("Content-Type", "text/plain;charset=UTF-8")
        .send(body.as_str())?;
    // Drain the "ok" body so the connection can be reused.
    let _ = response.body_mut().read_to_string();
    Ok(())
}

fn error_message(data: &Value) -> String {
    data.get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| data.to_string())
}

/// `proctor` → `/proctor`, empty → `/`.
pub fn normalize_namespace(namespace: &str) -> String {
    let trimmed = namespace.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::AtomicUsize;

    const OPEN: &str = r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#;
    const ACK: &str = r#"40/proctor,{"sid":"n1"}"#;
    const CLOSE_BODY: &str = "41/proctor,\u{1e}1";

    /// Engine.IO polling endpoint on a loopback port. GETs are answered from
    /// a queue of bodies (a noop when it runs dry), POSTs are recorded.
    #[derive(Default)]
    struct FakeCollector {
        polls: Mutex<VecDeque<String>>,
        posts: Mutex<Vec<(String, String)>>,
        post_delay: Duration,
        posts_in_flight: AtomicUsize,
        overlapped: AtomicBool,
    }

    impl FakeCollector {
        fn start(post_delay: Duration) -> (Arc<Self>, String) {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let url = format!("http://{}", listener.local_addr().unwrap());
            let server = Arc::new(Self {
                post_delay,
                ..Self::default()
            });
            let accept = Arc::clone(&server);
            std::thread::spawn(move || {
                for stream in listener.incoming().flatten() {
                    let server = Arc::clone(&accept);
                    std::thread::spawn(move || server.serve(stream));
                }
            });
            (server, url)
        }

        fn push(&self, bodies: &[&str]) {
            let mut polls = self.polls.lock().unwrap();
            polls.extend(bodies.iter().map(|b| b.to_string()));
        }

        fn post_bodies(&self) -> Vec<String> {
            self.posts.lock().unwrap().iter().map(|(_, b)| b.clone()).collect()
        }

        fn post_targets(&self) -> Vec<String> {
            self.posts.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
        }

        fn next_poll(&self) -> String {
            let deadline = Instant::now() + Duration::from_millis(50);
            while Instant::now() < deadline {
                if let Some(body) = self.polls.lock().unwrap().pop_front() {
                    return body;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            "6".to_string()
        }

        fn serve(&self, stream: TcpStream) {
            let mut reader = BufReader::new(&stream);
            let mut request_line = String::new();
            if reader.read_line(&mut request_line).is_err() {
                return;
            }
            let mut parts = request_line.split_whitespace();
            let method = parts.next().unwrap_or_default().to_string();
            let target = parts.next().unwrap_or_default().to_string();

            let mut content_length = 0;
            loop {
                let mut header = String::new();
                if reader.read_line(&mut header).unwrap_or(0) == 0 || header.trim().is_empty() {
                    break;
                }
                if let Some((name, value)) = header.split_once(':') {
                    if name.trim().eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().unwrap_or(0);
                    }
                }
            }
            let mut body = vec![0; content_length];
            if reader.read_exact(&mut body).is_err() {
                return;
            }

            let reply = if method == "POST" {
                if self.posts_in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                    self.overlapped.store(true, Ordering::SeqCst);
                }
                std::thread::sleep(self.post_delay);
                self.posts
                    .lock()
                    .unwrap()
                    .push((target, String::from_utf8_lossy(&body).into_owned()));
                self.posts_in_flight.fetch_sub(1, Ordering::SeqCst);
                "ok".to_string()
            } else {
                self.next_poll()
            };

            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=UTF-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{reply}",
                reply.len()
            );
            let mut stream = &stream;
            let _ = stream.write_all(response.as_bytes());
            let _ = stream.flush();
        }
    }

    fn wait_until(what: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if what() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn transport(url: &str) -> PollingTransport {
        PollingTransport::new(url, "/proctor", Duration::from_secs(2))
    }

    #[test]
    fn test_normalize_namespace() {
        assert_eq!(normalize_namespace("/proctor"), "/proctor");
        assert_eq!(normalize_namespace("proctor"), "/proctor");
        assert_eq!(normalize_namespace("/proctor/"), "/proctor");
        assert_eq!(normalize_namespace(""), "/");
        assert_eq!(normalize_namespace("/"), "/");
    }

    #[test]
    fn test_handshake_url_strips_trailing_slash() {
        let t = PollingTransport::new("http://localhost:5000/", "/proctor", Duration::from_secs(5));
        assert_eq!(
            t.handshake_url(),
            "http://localhost:5000/socket.io/?EIO=4&transport=polling"
        );
        assert_eq!(t.namespace(), "/proctor");
    }

    #[test]
    fn test_new_transport_is_closed() {
        let mut t = PollingTransport::new("http://localhost:5000", "/proctor", Duration::from_secs(5));
        assert!(!t.is_open());
        assert!(matches!(
            t.emit("proctor_event", json!({})),
            Err(LinkError::NotConnected)
        ));
        // Closing a never-opened transport is a no-op.
        t.close();
        t.close();
    }

    #[test]
    fn test_open_fails_without_server() {
        // Port 9 (discard) on localhost is essentially never an Engine.IO server.
        let mut t = PollingTransport::new("http://127.0.0.1:9", "/proctor", Duration::from_secs(2));
        assert!(t.open().is_err());
        assert!(!t.is_open());
    }

    #[test]
    fn test_error_message_prefers_message_field() {
        assert_eq!(error_message(&json!({"message": "Not authorized"})), "Not authorized");
        assert_eq!(error_message(&json!("nope")), "\"nope\"");
    }

    #[test]
    fn test_connect_emit_and_close_sequence() {
        let (server, url) = FakeCollector::start(Duration::ZERO);
        server.push(&[OPEN, ACK]);

        let mut t = transport(&url);
        t.open().unwrap();
        assert!(t.is_open());
        t.emit("proctor_event", json!({"type": "test_connection"})).unwrap();
        t.close();
        t.close();

        assert!(!t.is_open());
        assert_eq!(
            server.post_bodies(),
            [
                "40/proctor,",
                r#"42/proctor,["proctor_event",{"type":"test_connection"}]"#,
                CLOSE_BODY,
            ]
        );
        assert!(server.post_targets().iter().all(|t| t.ends_with("&sid=abc")));
    }

    #[test]
    fn test_connect_error_rejects_open() {
        let (server, url) = FakeCollector::start(Duration::ZERO);
        server.push(&[OPEN, r#"44/proctor,{"message":"Not authorized"}"#]);

        let mut t = transport(&url);
        match t.open() {
            Err(LinkError::Rejected { nsp, reason }) => {
                assert_eq!(nsp, "/proctor");
                assert_eq!(reason, "Not authorized");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(!t.is_open());
    }

    #[test]
    fn test_missing_ack_bounded_by_request_timeout() {
        let (server, url) = FakeCollector::start(Duration::ZERO);
        server.push(&[OPEN]);

        let mut t = PollingTransport::new(&url, "/proctor", Duration::from_millis(300));
        let started = Instant::now();
        assert!(t.open().is_err());
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!t.is_open());
    }

    #[test]
    fn test_ping_answered_then_server_close_and_reconnect() {
        let (server, url) = FakeCollector::start(Duration::ZERO);
        server.push(&[OPEN, ACK, "2", "1"]);

        let mut t = transport(&url);
        t.open().unwrap();
        assert!(wait_until(|| !t.is_open()));
        assert!(server.post_bodies().contains(&"3".to_string()));
        assert!(matches!(
            t.emit("proctor_event", json!({})),
            Err(LinkError::NotConnected)
        ));

        let reopened = OPEN.replace("abc", "def");
        server.push(&[reopened.as_str(), ACK]);
        t.open().unwrap();
        assert!(t.is_open());
        t.close();

        let targets = server.post_targets();
        assert!(targets.last().unwrap().ends_with("&sid=def"));
        // The dead session is not sent a second close.
        assert_eq!(
            server.post_bodies().iter().filter(|b| *b == CLOSE_BODY).count(),
            1
        );
    }

    #[test]
    fn test_close_handle_shuts_link_from_another_thread() {
        let (server, url) = FakeCollector::start(Duration::ZERO);
        server.push(&[OPEN, ACK]);

        let mut t = transport(&url);
        t.open().unwrap();
        let handle = t.close_handle();
        std::thread::spawn(move || handle.release()).join().unwrap();

        assert!(!t.is_open());
        assert_eq!(server.post_bodies().last().unwrap(), CLOSE_BODY);
        assert!(matches!(t.open(), Err(LinkError::Closed)));

        let posts = server.post_bodies().len();
        t.close();
        t.close_handle().release();
        assert_eq!(server.post_bodies().len(), posts);
    }

    #[test]
    fn test_pongs_and_events_never_overlap() {
        let (server, url) = FakeCollector::start(Duration::from_millis(20));
        server.push(&[OPEN, ACK, "2", "2", "2"]);

        let mut t = transport(&url);
        t.open().unwrap();
        for n in 0..10 {
            t.emit("proctor_event", json!({ "n": n })).unwrap();
        }
        assert!(wait_until(|| {
            server.post_bodies().iter().filter(|b| *b == "3").count() == 3
        }));
        t.close();

        assert!(!server.overlapped.load(Ordering::SeqCst));
    }
}
