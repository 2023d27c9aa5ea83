//! Scripted in-process LDAP server for integration tests, built on the
//! crate's own codec.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use ldap_client::framing::FrameBuffer;
use ldap_client::protocol::{encode_message, Control, LdapResult, Message, ProtocolOp, SearchEntry};
use ldap_client::Attribute;

/// What the scripted server does with one decoded request.
pub enum Action {
    Reply(Vec<Message>),
    /// No response; the request stays pending on the client.
    Ignore,
    /// Drop the connection.
    Close,
}

pub type Handler = Arc<dyn Fn(&Message) -> Action + Send + Sync>;

pub struct MockServer {
    pub url: String,
    /// Accepted connections so far.
    pub connections: Arc<AtomicUsize>,
}

pub async fn start(handler: Handler) -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    serve(listener, handler)
}

/// Start on an explicit address (for reconnect tests that need a port the
/// client is already retrying).
pub async fn start_at(addr: &str, handler: Handler) -> MockServer {
    let listener = TcpListener::bind(addr).await.expect("bind");
    serve(listener, handler)
}

fn serve(listener: TcpListener, handler: Handler) -> MockServer {
    let addr = listener.local_addr().expect("local addr");
    let connections = Arc::new(AtomicUsize::new(0));
    let conn_count = Arc::clone(&connections);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            conn_count.fetch_add(1, Ordering::SeqCst);
            let handler = Arc::clone(&handler);
            tokio::spawn(handle_connection(stream, handler));
        }
    });
    MockServer {
        url: format!("ldap://{}", addr),
        connections,
    }
}

async fn handle_connection(mut stream: TcpStream, handler: Handler) {
    let mut frames = FrameBuffer::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        frames.push(&buf[..n]);
        loop {
            let request = match frames.next_message() {
                Ok(Some(m)) => m,
                Ok(None) => break,
                Err(_) => return,
            };
            if matches!(request.op, ProtocolOp::UnbindRequest) {
                return;
            }
            match handler(&request) {
                Action::Ignore => {}
                Action::Close => return,
                Action::Reply(messages) => {
                    for m in messages {
                        if stream.write_all(&encode_message(&m)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

// --- response builders ----------------------------------------------------

pub fn result_with_code(code: u32) -> LdapResult {
    LdapResult {
        code,
        matched_dn: String::new(),
        message: String::new(),
        referrals: Vec::new(),
    }
}

pub fn entry(id: i32, dn: &str) -> Message {
    Message::new(
        id,
        ProtocolOp::SearchResultEntry(SearchEntry {
            dn: dn.to_string(),
            attributes: vec![Attribute::new("cn", [dn.split(',').next().unwrap_or(dn)])],
        }),
    )
}

pub fn search_done(id: i32, code: u32) -> Message {
    Message::new(id, ProtocolOp::SearchResultDone(result_with_code(code)))
}

pub fn search_done_paged(id: i32, cookie: &[u8]) -> Message {
    Message::with_controls(
        id,
        ProtocolOp::SearchResultDone(result_with_code(0)),
        vec![Control::new(
            ldap_client::PAGED_RESULTS_OID,
            false,
            Some(
                ldap_client::protocol::PagedValue {
                    size: 0,
                    cookie: cookie.to_vec(),
                }
                .encode(),
            ),
        )],
    )
}

pub fn op_response(request: &Message, code: u32) -> Option<Message> {
    let result = result_with_code(code);
    let op = match request.op {
        ProtocolOp::BindRequest(_) => ProtocolOp::BindResponse(result),
        ProtocolOp::AddRequest(_) => ProtocolOp::AddResponse(result),
        ProtocolOp::DelRequest(_) => ProtocolOp::DelResponse(result),
        ProtocolOp::ModifyRequest(_) => ProtocolOp::ModifyResponse(result),
        ProtocolOp::ModifyDnRequest(_) => ProtocolOp::ModifyDnResponse(result),
        ProtocolOp::CompareRequest(_) => ProtocolOp::CompareResponse(result),
        ProtocolOp::SearchRequest(_) => ProtocolOp::SearchResultDone(result),
        _ => return None,
    };
    Some(Message::new(request.id, op))
}

/// Server that answers every request with success.
pub fn accept_all() -> Handler {
    Arc::new(|request| match op_response(request, 0) {
        Some(m) => Action::Reply(vec![m]),
        None => Action::Ignore,
    })
}
