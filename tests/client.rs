//! End-to-end tests against a scripted in-process server.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use common::{
    accept_all, entry, op_response, result_with_code, search_done, search_done_paged, start,
    start_at, Action, MockServer,
};
use ldap_client::protocol::{LdapResult, Message, ProtocolOp};
use ldap_client::{
    setup_hook, Attribute, ClientEvent, ClientOptions, LdapClient, LdapError, ReconnectOptions,
    ResultCode, Scope, SearchItem, SearchOptions,
};

const WAIT: Duration = Duration::from_secs(5);

async fn wait_event(
    rx: &mut broadcast::Receiver<ClientEvent>,
    mut pred: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn client_for(server: &MockServer) -> LdapClient {
    LdapClient::new(ClientOptions::url(&server.url)).expect("client")
}

/// A free localhost address: bind an ephemeral listener, note the port,
/// drop it so the client's first attempts fail.
async fn free_addr() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

#[tokio::test]
async fn simple_bind_success() {
    let server = start(accept_all()).await;
    let client = client_for(&server);
    let result = timeout(WAIT, client.bind("cn=root", "secret"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.code, 0);
}

#[tokio::test]
async fn bind_invalid_credentials() {
    let server = start(Arc::new(|req: &Message| match op_response(req, 49) {
        Some(m) => Action::Reply(vec![m]),
        None => Action::Ignore,
    }))
    .await;
    let client = client_for(&server);
    let err = timeout(WAIT, client.bind("cn=root", "wrong"))
        .await
        .unwrap()
        .unwrap_err();
    match err {
        LdapError::Server { code, .. } => assert_eq!(code, ResultCode::InvalidCredentials),
        other => panic!("expected Server error, got {:?}", other),
    }
}

#[tokio::test]
async fn compare_true_false_and_error() {
    let server = start(Arc::new(|req: &Message| {
        let code = match &req.op {
            ProtocolOp::CompareRequest(c) => match c.value.as_slice() {
                b"yes" => 6,
                b"no" => 5,
                _ => 32,
            },
            _ => 0,
        };
        match op_response(req, code) {
            Some(m) => Action::Reply(vec![m]),
            None => Action::Ignore,
        }
    }))
    .await;
    let client = client_for(&server);

    assert!(client.compare("cn=a", "attr", b"yes").await.unwrap());
    assert!(!client.compare("cn=a", "attr", b"no").await.unwrap());
    let err = client.compare("cn=missing", "attr", b"?").await.unwrap_err();
    match err {
        LdapError::Server { code, .. } => assert_eq!(code, ResultCode::NoSuchObject),
        other => panic!("expected Server error, got {:?}", other),
    }
}

#[tokio::test]
async fn search_streams_entries_then_done() {
    let server = start(Arc::new(|req: &Message| match req.op {
        ProtocolOp::SearchRequest(_) => Action::Reply(vec![
            entry(req.id, "cn=a,dc=example"),
            entry(req.id, "cn=b,dc=example"),
            entry(req.id, "cn=c,dc=example"),
            search_done(req.id, 0),
        ]),
        _ => match op_response(req, 0) {
            Some(m) => Action::Reply(vec![m]),
            None => Action::Ignore,
        },
    }))
    .await;
    let client = client_for(&server);

    let mut stream = client
        .search(
            SearchOptions::new("dc=example")
                .scope(Scope::Subtree)
                .filter_str("(objectClass=*)"),
        )
        .await
        .unwrap();

    let mut dns = Vec::new();
    loop {
        match timeout(WAIT, stream.next()).await.unwrap() {
            Some(Ok(SearchItem::Entry(e))) => dns.push(e.dn),
            Some(Ok(SearchItem::Done(result))) => {
                assert_eq!(result.code, 0);
                break;
            }
            other => panic!("unexpected item: {:?}", other),
        }
    }
    assert_eq!(dns, ["cn=a,dc=example", "cn=b,dc=example", "cn=c,dc=example"]);
    // exactly one terminal
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn paged_search_spans_pages_transparently() {
    let ids_seen = Arc::new(Mutex::new(Vec::new()));
    let ids = Arc::clone(&ids_seen);
    let server = start(Arc::new(move |req: &Message| {
        if !matches!(req.op, ProtocolOp::SearchRequest(_)) {
            return match op_response(req, 0) {
                Some(m) => Action::Reply(vec![m]),
                None => Action::Ignore,
            };
        }
        ids.lock().unwrap().push(req.id);
        let cookie = req.paged_control().map(|p| p.cookie).unwrap_or_default();
        let (range, next): (std::ops::Range<u32>, &[u8]) = match cookie.as_slice() {
            b"" => (0..5, b"a"),
            b"a" => (5..10, b"b"),
            b"b" => (10..12, b""),
            other => panic!("unexpected cookie {:?}", other),
        };
        let mut replies: Vec<Message> = range
            .map(|i| entry(req.id, &format!("cn=u{},dc=example", i)))
            .collect();
        replies.push(search_done_paged(req.id, next));
        Action::Reply(replies)
    }))
    .await;
    let client = client_for(&server);

    let stream = client
        .search(
            SearchOptions::new("dc=example")
                .scope(Scope::Subtree)
                .paged(5),
        )
        .await
        .unwrap();
    let (entries, result) = timeout(WAIT, stream.collect()).await.unwrap().unwrap();

    assert_eq!(entries.len(), 12);
    assert_eq!(result.code, 0);
    let expected: Vec<String> = (0..12).map(|i| format!("cn=u{},dc=example", i)).collect();
    let got: Vec<String> = entries.into_iter().map(|e| e.dn).collect();
    assert_eq!(got, expected);
    // one logical search: every physical request reused the same message id
    let ids = ids_seen.lock().unwrap();
    assert_eq!(ids.len(), 3);
    assert!(ids.iter().all(|&id| id == ids[0]));
}

#[tokio::test]
async fn reconnect_flushes_queued_request() {
    let addr = free_addr().await;
    let client = LdapClient::new(
        ClientOptions::url(format!("ldap://{}", addr)).with_reconnect(ReconnectOptions {
            initial_delay_ms: 10,
            max_delay_ms: 100,
            fail_after: None,
        }),
    )
    .unwrap();
    let mut events = client.subscribe();

    // queued while disconnected
    let pending = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .add("cn=new,dc=example", vec![Attribute::new("cn", ["new"])])
                .await
        })
    };

    wait_event(&mut events, |e| matches!(e, ClientEvent::ConnectError(_))).await;
    let _server = start_at(&addr, accept_all()).await;
    wait_event(&mut events, |e| matches!(e, ClientEvent::Connect)).await;

    let result = timeout(WAIT, pending).await.unwrap().unwrap().unwrap();
    assert_eq!(result.code, 0);
}

#[tokio::test]
async fn request_timeout_synthesizes_code_80() {
    // server accepts and never replies
    let server = start(Arc::new(|_: &Message| Action::Ignore)).await;
    let client =
        LdapClient::new(ClientOptions::url(&server.url).with_timeout_ms(50)).unwrap();
    let mut events = client.subscribe();

    let err = timeout(WAIT, client.bind("cn=root", "secret"))
        .await
        .unwrap()
        .unwrap_err();
    match err {
        LdapError::RequestTimeout(LdapResult { code, message, .. }) => {
            assert_eq!(code, 80);
            assert_eq!(message, "request timeout (client interrupt)");
        }
        other => panic!("expected RequestTimeout, got {:?}", other),
    }
    wait_event(&mut events, |e| matches!(e, ClientEvent::Timeout(_))).await;
}

#[tokio::test]
async fn disconnect_errors_every_pending_request() {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let server = start(Arc::new(move |_: &Message| {
        // swallow the first two requests, drop the connection on the third
        if counter.fetch_add(1, Ordering::SeqCst) == 2 {
            Action::Close
        } else {
            Action::Ignore
        }
    }))
    .await;
    let client = client_for(&server);

    let (a, b, c) = timeout(
        WAIT,
        async {
            tokio::join!(
                client.bind("cn=a", "x"),
                client.bind("cn=b", "x"),
                client.bind("cn=c", "x"),
            )
        },
    )
    .await
    .unwrap();
    for outcome in [a, b, c] {
        match outcome {
            Err(LdapError::Connection(_)) => {}
            other => panic!("expected Connection error, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn unbind_resolves_on_teardown() {
    let server = start(accept_all()).await;
    let client = client_for(&server);
    let mut events = client.subscribe();

    client.bind("cn=root", "secret").await.unwrap();
    timeout(WAIT, client.unbind()).await.unwrap().unwrap();
    wait_event(&mut events, |e| matches!(e, ClientEvent::Close)).await;
    assert!(!client.is_connected());
}

#[tokio::test]
async fn destroy_is_terminal() {
    let server = start(accept_all()).await;
    let client = LdapClient::new(
        ClientOptions::url(&server.url).with_reconnect(ReconnectOptions {
            initial_delay_ms: 10,
            max_delay_ms: 50,
            fail_after: None,
        }),
    )
    .unwrap();
    let mut events = client.subscribe();

    client.bind("cn=root", "secret").await.unwrap();
    client.destroy();
    wait_event(&mut events, |e| matches!(e, ClientEvent::Destroy)).await;

    match client.bind("cn=root", "secret").await {
        Err(LdapError::Destroyed) => {}
        other => panic!("expected Destroyed, got {:?}", other),
    }

    // reconnect is suppressed: no new connections show up
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn abandon_drops_the_entry_and_ends_the_stream() {
    let server = start(Arc::new(|req: &Message| match req.op {
        ProtocolOp::SearchRequest(_) => Action::Ignore,
        _ => match op_response(req, 0) {
            Some(m) => Action::Reply(vec![m]),
            None => Action::Ignore,
        },
    }))
    .await;
    let client = client_for(&server);
    client.bind("cn=root", "secret").await.unwrap();

    let mut stream = client
        .search(SearchOptions::new("dc=example").scope(Scope::Subtree))
        .await
        .unwrap();
    let id = timeout(WAIT, stream.message_id()).await.unwrap().unwrap();

    timeout(WAIT, client.abandon(id)).await.unwrap().unwrap();
    // sink dropped: the stream ends without a terminal
    assert!(timeout(WAIT, stream.next()).await.unwrap().is_none());
}

#[tokio::test]
async fn setup_hook_binds_before_commit() {
    let ops = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&ops);
    let server = start(Arc::new(move |req: &Message| {
        log.lock().unwrap().push(req.op.name().to_string());
        match op_response(req, 0) {
            Some(m) => Action::Reply(vec![m]),
            None => Action::Ignore,
        }
    }))
    .await;

    let client = LdapClient::new(ClientOptions::url(&server.url).with_setup_hook(setup_hook(
        |conn| async move {
            conn.bind("cn=svc,dc=example", "hunter2").await?;
            Ok(())
        },
    )))
    .unwrap();
    let mut events = client.subscribe();

    let setup = wait_event(&mut events, |e| {
        matches!(e, ClientEvent::Setup | ClientEvent::Connect)
    })
    .await;
    assert!(matches!(setup, ClientEvent::Setup));
    wait_event(&mut events, |e| matches!(e, ClientEvent::Connect)).await;

    client.delete("cn=tmp,dc=example").await.unwrap();
    let seen = ops.lock().unwrap().clone();
    assert_eq!(seen[0], "BindRequest");
    assert!(seen.contains(&"DelRequest".to_string()));
}

#[tokio::test]
async fn queue_timeout_purges_queued_requests() {
    let addr = free_addr().await;
    let client = LdapClient::new(
        ClientOptions::url(format!("ldap://{}", addr)).with_queue_timeout_ms(50),
    )
    .unwrap();

    let err = timeout(
        WAIT,
        client.add("cn=x,dc=example", vec![Attribute::new("cn", ["x"])]),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(matches!(err, LdapError::QueueTimeout));
}

#[tokio::test]
async fn queuing_disabled_fails_fast() {
    let addr = free_addr().await;
    let client =
        LdapClient::new(ClientOptions::url(format!("ldap://{}", addr)).no_queuing()).unwrap();

    let err = timeout(WAIT, client.delete("cn=x,dc=example"))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, LdapError::Connection(_)));
}

#[tokio::test]
async fn idle_event_fires_when_table_empties() {
    let server = start(accept_all()).await;
    let client =
        LdapClient::new(ClientOptions::url(&server.url).with_idle_timeout_ms(50)).unwrap();
    let mut events = client.subscribe();

    client.bind("cn=root", "secret").await.unwrap();
    wait_event(&mut events, |e| matches!(e, ClientEvent::Idle)).await;
}

#[tokio::test]
async fn validation_errors_are_synchronous() {
    let server = start(accept_all()).await;
    let client = client_for(&server);

    assert!(matches!(
        client.delete("").await,
        Err(LdapError::InvalidArgument(_))
    ));
    assert!(matches!(
        client.modify("cn=x", vec![]).await,
        Err(LdapError::InvalidArgument(_))
    ));
    assert!(matches!(
        client.abandon(0).await,
        Err(LdapError::InvalidArgument(_))
    ));
    assert!(matches!(
        client
            .search(SearchOptions::new("dc=x").filter_str("(broken"))
            .await,
        Err(LdapError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn modify_dn_derives_new_superior() {
    let captured = Arc::new(Mutex::new(None));
    let cap = Arc::clone(&captured);
    let server = start(Arc::new(move |req: &Message| {
        if let ProtocolOp::ModifyDnRequest(r) = &req.op {
            *cap.lock().unwrap() = Some(r.clone());
        }
        match op_response(req, 0) {
            Some(m) => Action::Reply(vec![m]),
            None => Action::Ignore,
        }
    }))
    .await;
    let client = client_for(&server);

    client
        .modify_dn("cn=old,dc=example", "cn=new,ou=people,dc=example")
        .await
        .unwrap();
    let req = captured.lock().unwrap().clone().unwrap();
    assert_eq!(req.new_rdn, "cn=new");
    assert_eq!(req.new_superior.as_deref(), Some("ou=people,dc=example"));
    assert!(req.delete_old_rdn);
}

#[tokio::test]
async fn whoami_round_trip() {
    let server = start(Arc::new(|req: &Message| {
        if let ProtocolOp::ExtendedRequest(ext) = &req.op {
            assert_eq!(ext.name, ldap_client::WHOAMI_OID);
            return Action::Reply(vec![Message::new(
                req.id,
                ProtocolOp::ExtendedResponse(ldap_client::protocol::ExtendedResponse {
                    result: result_with_code(0),
                    name: None,
                    value: Some(b"dn:cn=root".to_vec()),
                }),
            )]);
        }
        match op_response(req, 0) {
            Some(m) => Action::Reply(vec![m]),
            None => Action::Ignore,
        }
    }))
    .await;
    let client = client_for(&server);
    assert_eq!(client.whoami().await.unwrap(), "dn:cn=root");
}

#[tokio::test]
async fn server_close_emits_events_and_errors_pending() {
    let server = start(Arc::new(|req: &Message| match req.op {
        ProtocolOp::BindRequest(_) => match op_response(req, 0) {
            Some(m) => Action::Reply(vec![m]),
            None => Action::Ignore,
        },
        _ => Action::Close,
    }))
    .await;
    let client = client_for(&server);
    let mut events = client.subscribe();

    client.bind("cn=root", "secret").await.unwrap();
    let err = timeout(WAIT, client.delete("cn=x,dc=example"))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, LdapError::Connection(_)));
    wait_event(&mut events, |e| matches!(e, ClientEvent::Close)).await;
}
