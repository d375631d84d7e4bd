//! TCP transport speaking the framed envelope protocol

use crate::connection::{ConnectionConfig, ConnectionManager, RequestLink};
use crate::transport::error::TransportError;
use crate::transport::traits::{Connection, Outcome, RequestHandle, TransportHandle};
use async_trait::async_trait;
use bytes::Bytes;
use commander_shared::{envelope::Payload, defaults, CommandRequest, Envelope, Header, MessageType};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

const RECONNECT_CHANNEL_CAPACITY: usize = 16;

struct TransportState {
    manager: Option<ConnectionManager>,
    /// Dropped on close so listeners observe the shutdown
    reconnects: Option<broadcast::Sender<Connection>>,
}

/// Transport that talks to a single device endpoint over TCP
pub struct TcpTransport {
    config: ConnectionConfig,
    state: Mutex<TransportState>,
}

impl TcpTransport {
    pub fn new(config: ConnectionConfig) -> Self {
        let (reconnects, _) = broadcast::channel(RECONNECT_CHANNEL_CAPACITY);
        Self {
            config,
            state: Mutex::new(TransportState {
                manager: None,
                reconnects: Some(reconnects),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl TransportHandle for TcpTransport {
    async fn connect(&self) -> Result<Connection, TransportError> {
        let reconnects = self.state().reconnects.clone().ok_or(TransportError::Closed)?;

        let (manager, connection) =
            ConnectionManager::connect(self.config.clone(), reconnects).await?;

        if let Some(previous) = self.state().manager.replace(manager) {
            previous.shutdown();
        }
        Ok(connection)
    }

    fn reconnect_listener(&self) -> broadcast::Receiver<Connection> {
        match &self.state().reconnects {
            Some(tx) => tx.subscribe(),
            // Already closed: hand out a receiver whose sender is gone
            None => broadcast::channel(1).1,
        }
    }

    async fn request_client(
        &self,
        tenant_id: &str,
        device_id: &str,
    ) -> Result<Box<dyn RequestHandle>, TransportError> {
        let link = self
            .state()
            .manager
            .as_ref()
            .map(ConnectionManager::link)
            .ok_or(TransportError::Closed)?;

        Ok(Box::new(TcpRequestClient::new(link, tenant_id, device_id)))
    }

    async fn close(&self) {
        let mut state = self.state();
        state.reconnects = None;
        if let Some(manager) = state.manager.take() {
            manager.shutdown();
            info!("[TCP] Transport to {} closed", self.config.server_addr);
        }
    }
}

/// Request session addressed to one tenant/device pair
pub struct TcpRequestClient {
    link: RequestLink,
    tenant_id: String,
    device_id: String,
    timeout: Duration,
    closed: bool,
}

impl TcpRequestClient {
    pub fn new(link: RequestLink, tenant_id: &str, device_id: &str) -> Self {
        Self {
            link,
            tenant_id: tenant_id.into(),
            device_id: device_id.into(),
            timeout: Duration::from_millis(defaults::REQUEST_TIMEOUT_MS),
            closed: false,
        }
    }

    /// Send one request and wait (bounded by the timeout) for its reply
    async fn exchange(
        &mut self,
        name: &str,
        content_type: &str,
        payload: Bytes,
        one_way: bool,
    ) -> Result<Option<Payload>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        let correlation_id = self.link.next_correlation_id();
        let request = Envelope::request(
            Header::new(&self.tenant_id, &self.device_id, correlation_id, MessageType::MsgRequest),
            CommandRequest {
                name: name.into(),
                content_type: content_type.into(),
                payload: payload.to_vec(),
                one_way,
            },
        );

        let reply = self.link.exchange(request).await?;

        match tokio::time::timeout(self.timeout, reply).await {
            Ok(Ok(envelope)) => Ok(envelope.payload),
            Ok(Err(_)) => Err(TransportError::ConnectionLost),
            Err(_) => {
                self.link.abandon(correlation_id);
                Err(TransportError::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl RequestHandle for TcpRequestClient {
    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn send_one_way(
        &mut self,
        name: &str,
        content_type: &str,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        match self.exchange(name, content_type, payload, true).await? {
            Some(Payload::Ack(ack)) if ack.accepted => Ok(()),
            Some(Payload::Ack(ack)) => Err(TransportError::Refused(ack.message)),
            Some(Payload::Response(resp)) if resp.is_success() => Ok(()),
            Some(Payload::Response(resp)) => Err(TransportError::Rejected {
                status: resp.status,
                message: resp.error_message,
            }),
            _ => Err(TransportError::Protocol("expected an ack for a one-way command".into())),
        }
    }

    async fn send(
        &mut self,
        name: &str,
        content_type: &str,
        payload: Bytes,
    ) -> Result<Outcome, TransportError> {
        match self.exchange(name, content_type, payload, false).await? {
            Some(Payload::Response(resp)) if resp.is_success() => {
                Ok(Outcome::success(resp.payload.map(Bytes::from)))
            }
            Some(Payload::Response(resp)) => Err(TransportError::Rejected {
                status: resp.status,
                message: resp.error_message,
            }),
            _ => Err(TransportError::Protocol("expected a command response".into())),
        }
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commander_shared::codec::{self, FrameDecoder};
    use commander_shared::{Ack, CommandResponse};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::broadcast::error::RecvError;
    use tokio::time::timeout;

    fn test_config(server_addr: String) -> ConnectionConfig {
        ConnectionConfig {
            server_addr,
            connect_timeout: Duration::from_secs(1),
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_millis(50),
        }
    }

    /// Answer every request on `socket` with whatever `respond` returns
    async fn serve<F>(mut socket: TcpStream, respond: F)
    where
        F: Fn(&Header, &CommandRequest) -> Option<Envelope>,
    {
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; 4096];
        loop {
            let n = match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            decoder.extend(&buf[..n]);
            while let Ok(Some(envelope)) = decoder.decode_next() {
                let (Some(header), Some(Payload::Request(request))) = (&envelope.header, &envelope.payload)
                else {
                    continue;
                };
                if let Some(reply) = respond(header, request) {
                    let frame = codec::encode(&reply).expect("encode reply");
                    if socket.write_all(&frame).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Device accepting a single connection
    async fn spawn_device<F>(respond: F) -> String
    where
        F: Fn(&Header, &CommandRequest) -> Option<Envelope> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr").to_string();
        tokio::spawn(async move {
            if let Ok((socket, _)) = listener.accept().await {
                serve(socket, respond).await;
            }
        });
        addr
    }

    async fn connected(addr: String) -> TcpTransport {
        let transport = TcpTransport::new(test_config(addr));
        let conn = transport.connect().await.expect("connect");
        assert_eq!(conn.epoch, 1);
        transport
    }

    #[tokio::test]
    async fn test_two_way_response_correlated() {
        let addr = spawn_device(|header, request| {
            assert_eq!(header.tenant_id, "DEFAULT_TENANT");
            assert_eq!(header.device_id, "4711");
            assert!(!request.one_way);
            Some(Envelope::response(
                Header::reply_to(header, MessageType::MsgResponse),
                CommandResponse::ok(Some(b"ok".to_vec()), "text/plain"),
            ))
        })
        .await;

        let transport = connected(addr).await;
        let mut client = transport
            .request_client("DEFAULT_TENANT", "4711")
            .await
            .expect("request client");

        let outcome = client
            .send("MQTTTestCommand", "application/json", Bytes::from_static(b"{}"))
            .await
            .expect("response");
        assert!(outcome.success);
        assert_eq!(outcome.payload.as_deref(), Some(&b"ok"[..]));

        client.close().await;
        transport.close().await;
    }

    #[tokio::test]
    async fn test_missing_payload_is_none() {
        let addr = spawn_device(|header, _| {
            Some(Envelope::response(
                Header::reply_to(header, MessageType::MsgResponse),
                CommandResponse::ok(None, ""),
            ))
        })
        .await;

        let transport = connected(addr).await;
        let mut client = transport.request_client("t", "d").await.expect("client");
        let outcome = client.send("cmd", "", Bytes::new()).await.expect("response");
        assert_eq!(outcome.payload, None);
    }

    #[tokio::test]
    async fn test_one_way_acknowledged() {
        let addr = spawn_device(|header, request| {
            assert!(request.one_way);
            assert_eq!(request.name, "reset");
            Some(Envelope::ack(Header::reply_to(header, MessageType::MsgAck), Ack::accepted()))
        })
        .await;

        let transport = connected(addr).await;
        let mut client = transport.request_client("t", "d").await.expect("client");
        client
            .send_one_way("reset", "application/json", Bytes::from_static(b"{}"))
            .await
            .expect("ack");
    }

    #[tokio::test]
    async fn test_refused_ack() {
        let addr = spawn_device(|header, _| {
            Some(Envelope::ack(
                Header::reply_to(header, MessageType::MsgAck),
                Ack::refused("busy"),
            ))
        })
        .await;

        let transport = connected(addr).await;
        let mut client = transport.request_client("t", "d").await.expect("client");
        let err = client.send_one_way("reset", "", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Refused(msg) if msg == "busy"));
    }

    #[tokio::test]
    async fn test_error_status_rejected() {
        let addr = spawn_device(|header, _| {
            Some(Envelope::response(
                Header::reply_to(header, MessageType::MsgResponse),
                CommandResponse::error(404, "unknown command"),
            ))
        })
        .await;

        let transport = connected(addr).await;
        let mut client = transport.request_client("t", "d").await.expect("client");
        let err = client.send("nope", "", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Rejected { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_silent_device_times_out() {
        let addr = spawn_device(|_, _| None).await;

        let transport = connected(addr).await;
        let mut client = transport.request_client("t", "d").await.expect("client");
        client.set_timeout(Duration::from_millis(100));

        let err = client.send("cmd", "", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(t) if t == Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr").to_string();
        drop(listener);

        let transport = TcpTransport::new(test_config(addr));
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::Connection(_)));
        assert!(matches!(
            transport.request_client("t", "d").await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_reconnect_announces_new_epoch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr").to_string();
        tokio::spawn(async move {
            // First connection is dropped straight away, the second one stays up
            let (first, _) = listener.accept().await.expect("first accept");
            drop(first);
            let (second, _) = listener.accept().await.expect("second accept");
            serve(second, |_, _| None).await;
        });

        let transport = TcpTransport::new(test_config(addr.clone()));
        let mut reconnects = transport.reconnect_listener();
        transport.connect().await.expect("connect");

        let conn = timeout(Duration::from_secs(2), reconnects.recv())
            .await
            .expect("reconnect within deadline")
            .expect("reconnect event");
        assert_eq!(conn.epoch, 2);
        assert_eq!(conn.peer, addr);
    }

    #[tokio::test]
    async fn test_timed_out_requests_not_sent_after_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr").to_string();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        tokio::spawn(async move {
            let (first, _) = listener.accept().await.expect("first accept");
            drop(first);
            let (second, _) = listener.accept().await.expect("second accept");
            serve(second, move |header, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Some(Envelope::response(
                    Header::reply_to(header, MessageType::MsgResponse),
                    CommandResponse::ok(Some(b"ok".to_vec()), "text/plain"),
                ))
            })
            .await;
        });

        let config = ConnectionConfig {
            reconnect_delay: Duration::from_millis(400),
            max_reconnect_delay: Duration::from_millis(400),
            ..test_config(addr)
        };
        let transport = TcpTransport::new(config);
        let mut reconnects = transport.reconnect_listener();
        transport.connect().await.expect("connect");

        // Every request made while the link is down fails
        for _ in 0..4 {
            let mut client = transport.request_client("t", "d").await.expect("client");
            client.set_timeout(Duration::from_millis(60));
            let err = client.send("cmd", "", Bytes::new()).await.unwrap_err();
            assert!(matches!(
                err,
                TransportError::Timeout(_) | TransportError::ConnectionLost
            ));
            client.close().await;
        }

        let conn = timeout(Duration::from_secs(2), reconnects.recv())
            .await
            .expect("reconnect within deadline")
            .expect("reconnect event");
        assert_eq!(conn.epoch, 2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        // The new connection still carries live requests
        let mut client = transport.request_client("t", "d").await.expect("client");
        let outcome = client.send("cmd", "", Bytes::new()).await.expect("response");
        assert_eq!(outcome.payload.as_deref(), Some(&b"ok"[..]));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_ends_listeners_and_sessions() {
        let addr = spawn_device(|_, _| None).await;
        let transport = connected(addr).await;
        let mut reconnects = transport.reconnect_listener();

        transport.close().await;

        let closed = timeout(Duration::from_secs(1), reconnects.recv())
            .await
            .expect("listener resolves");
        assert!(matches!(closed, Err(RecvError::Closed)));
        assert!(matches!(
            transport.request_client("t", "d").await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            transport.reconnect_listener().try_recv(),
            Err(broadcast::error::TryRecvError::Closed)
        ));
    }
}
