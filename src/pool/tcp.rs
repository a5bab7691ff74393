/// TCP transport for pooled connections
///
/// Framing is the standard length-prefixed message layout: every message
/// starts with its total length as a little-endian `i32`. What goes inside a
/// message is the business of the [`WireCodec`] collaborator.
use crate::core::{Document, Endpoint};
use crate::error::{TopologyError, TopologyResult};
use crate::pool::{Connection, ConnectionFactory};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Upper bound on a single frame, header included
pub const MAX_MESSAGE_LENGTH: usize = 48 * 1024 * 1024;

const HEADER_LENGTH: usize = 4;

/// Encodes commands into complete messages and decodes replies
pub trait WireCodec: Send + Sync + fmt::Debug {
    /// A complete message, length prefix included
    fn encode_command(
        &self,
        request_id: i32,
        database: &str,
        command: &Document,
    ) -> TopologyResult<Vec<u8>>;

    /// `message` is a complete frame, length prefix included
    fn decode_reply(&self, request_id: i32, message: &[u8]) -> TopologyResult<Document>;
}

pub struct TcpConnection {
    id: i64,
    endpoint: Endpoint,
    codec: Arc<dyn WireCodec>,
    stream: Option<TcpStream>,
    next_request_id: i32,
}

impl TcpConnection {
    pub fn new(endpoint: Endpoint, id: i64, codec: Arc<dyn WireCodec>) -> Self {
        Self {
            id,
            endpoint,
            codec,
            stream: None,
            next_request_id: 1,
        }
    }

    fn connection_error(&mut self, error: io::Error) -> TopologyError {
        self.stream = None;
        TopologyError::connection(&self.endpoint, error.to_string())
    }

    async fn round_trip(&mut self, request_id: i32, message: &[u8]) -> TopologyResult<BytesMut> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TopologyError::connection(&self.endpoint, "connection is not open"))?;

        stream.write_all(message).await?;
        stream.flush().await?;

        let mut header = [0u8; HEADER_LENGTH];
        stream.read_exact(&mut header).await?;
        let length = (&header[..]).get_i32_le();
        if length < HEADER_LENGTH as i32 || length as usize > MAX_MESSAGE_LENGTH {
            return Err(TopologyError::protocol(format!(
                "reply to request {} has invalid length {}",
                request_id, length
            )));
        }

        let mut frame = BytesMut::zeroed(length as usize);
        frame[..HEADER_LENGTH].copy_from_slice(&header);
        stream.read_exact(&mut frame[HEADER_LENGTH..]).await?;
        Ok(frame)
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn id(&self) -> i64 {
        self.id
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn open(&mut self, connect_timeout: Duration) -> TopologyResult<()> {
        // IPv6 endpoints are stored bracketed
        let host = self
            .endpoint
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        debug!(endpoint = %self.endpoint, connection_id = self.id, "connecting");

        let stream = match timeout(connect_timeout, TcpStream::connect((host.as_str(), self.endpoint.port()))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(self.connection_error(e)),
            Err(_) => {
                return Err(TopologyError::timeout(format!(
                    "connect to {}",
                    self.endpoint
                )))
            }
        };

        // Enable TCP_NODELAY for low latency
        if let Err(e) = stream.set_nodelay(true) {
            warn!(endpoint = %self.endpoint, "Failed to configure stream: {}", e);
        }

        self.stream = Some(stream);
        Ok(())
    }

    async fn run_command(
        &mut self,
        database: &str,
        command: &Document,
        command_timeout: Duration,
    ) -> TopologyResult<Document> {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        let message = self.codec.encode_command(request_id, database, command)?;

        let frame = match timeout(command_timeout, self.round_trip(request_id, &message)).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(TopologyError::Io(e))) => return Err(self.connection_error(e)),
            Ok(Err(e)) => {
                self.stream = None;
                return Err(e);
            }
            Err(_) => {
                // a reply may still arrive for this request; the stream is unusable
                self.stream = None;
                return Err(TopologyError::timeout(format!(
                    "command on {}",
                    self.endpoint
                )));
            }
        };

        self.codec.decode_reply(request_id, &frame)
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!(endpoint = %self.endpoint, connection_id = self.id, "closed connection");
        }
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Creates [`TcpConnection`]s that speak through `codec`
#[derive(Debug, Clone)]
pub struct TcpConnectionFactory {
    codec: Arc<dyn WireCodec>,
}

impl TcpConnectionFactory {
    pub fn new(codec: Arc<dyn WireCodec>) -> Self {
        Self { codec }
    }
}

impl ConnectionFactory for TcpConnectionFactory {
    fn create(&self, endpoint: &Endpoint, id: i64) -> Box<dyn Connection> {
        Box::new(TcpConnection::new(endpoint.clone(), id, Arc::clone(&self.codec)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::document::{self, document};
    use crate::pool::{initialize_connection, next_unpooled_id};
    use bytes::BufMut;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    /// `[length][request id][json body]`, replies echo the request id
    #[derive(Debug)]
    struct JsonCodec;

    fn frame(request_id: i32, body: &[u8]) -> Vec<u8> {
        let mut message = BytesMut::with_capacity(8 + body.len());
        message.put_i32_le((8 + body.len()) as i32);
        message.put_i32_le(request_id);
        message.put_slice(body);
        message.to_vec()
    }

    impl WireCodec for JsonCodec {
        fn encode_command(
            &self,
            request_id: i32,
            database: &str,
            command: &Document,
        ) -> TopologyResult<Vec<u8>> {
            let body = serde_json::to_vec(&json!({ "db": database, "command": command }))
                .map_err(|e| TopologyError::protocol(e.to_string()))?;
            Ok(frame(request_id, &body))
        }

        fn decode_reply(&self, request_id: i32, message: &[u8]) -> TopologyResult<Document> {
            let mut header = &message[4..8];
            if header.get_i32_le() != request_id {
                return Err(TopologyError::protocol("response to unknown request"));
            }
            serde_json::from_slice(&message[8..]).map_err(|e| TopologyError::protocol(e.to_string()))
        }
    }

    /// Answers every request with `reply` until the client hangs up
    async fn spawn_server(reply: Document) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let reply = reply.clone();
                tokio::spawn(async move {
                    loop {
                        let mut header = [0u8; 8];
                        if stream.read_exact(&mut header).await.is_err() {
                            break;
                        }
                        let length = (&header[..4]).get_i32_le() as usize;
                        let request_id = (&header[4..]).get_i32_le();
                        let mut body = vec![0u8; length - 8];
                        if stream.read_exact(&mut body).await.is_err() {
                            break;
                        }
                        let body = serde_json::to_vec(&reply).unwrap();
                        if stream.write_all(&frame(request_id, &body)).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        addr
    }

    fn endpoint_for(addr: std::net::SocketAddr) -> Endpoint {
        Endpoint::new(addr.ip().to_string(), addr.port())
    }

    #[tokio::test]
    async fn test_round_trip_over_tcp() {
        let addr = spawn_server(document(json!({ "ismaster": true, "ok": 1 }))).await;
        let factory = TcpConnectionFactory::new(Arc::new(JsonCodec));
        let mut connection = factory.create(&endpoint_for(addr), next_unpooled_id());

        initialize_connection(connection.as_mut(), Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert!(connection.is_open());

        let reply = connection
            .run_command("admin", &document::command("ping"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(document::get_bool(&reply, "ismaster"), Some(true));

        connection.close();
        assert!(!connection.is_open());
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // bind then drop to find a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut connection = TcpConnection::new(endpoint_for(addr), 1, Arc::new(JsonCodec));
        let result = connection.open(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(TopologyError::Connection { .. })));
        assert!(!connection.is_open());
    }

    #[tokio::test]
    async fn test_invalid_frame_length_closes_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buffer = [0u8; 1024];
                let _ = stream.read(&mut buffer).await;
                let _ = stream.write_all(&(i32::MAX).to_le_bytes()).await;
            }
        });

        let mut connection = TcpConnection::new(endpoint_for(addr), 2, Arc::new(JsonCodec));
        connection.open(Duration::from_secs(5)).await.unwrap();

        let result = connection
            .run_command("admin", &document::command("ping"), Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(TopologyError::Protocol(_))));
        assert!(!connection.is_open());
    }

    #[tokio::test]
    async fn test_run_command_requires_open() {
        let mut connection =
            TcpConnection::new(Endpoint::new("127.0.0.1", 1), 3, Arc::new(JsonCodec));
        let result = connection
            .run_command("admin", &document::command("ping"), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(TopologyError::Connection { .. })));
    }
}
