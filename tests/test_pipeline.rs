mod common;

use std::sync::Arc;

use httptap::capture::packet::CapturedPacket;
use httptap::tracker::ConnectionId;

use common::{
    CollectingStorage, Event, TcpConversation, decoded, decoded_all, run_packets,
    run_packets_with_queue,
};

fn id_of(packet: &CapturedPacket) -> ConnectionId {
    ConnectionId::from_flows(&packet.net, &packet.transport)
}

/// A full conversation: handshake, one client write, one server write, FINs.
fn exchange(conv: &mut TcpConversation, request: &[u8], response: &[u8]) -> Vec<CapturedPacket> {
    let mut frames = conv.handshake();
    frames.push(conv.client_sends(request));
    frames.push(conv.server_sends(response));
    frames.push(conv.client_fin());
    frames.push(conv.server_fin());
    decoded_all(&frames)
}

#[tokio::test]
async fn test_single_transaction() {
    let mut conv = TcpConversation::new(50000, 80);
    let packets = exchange(
        &mut conv,
        b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n",
        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello",
    );
    let id = id_of(&packets[0]);
    let storage = Arc::new(CollectingStorage::default());

    let summary = run_packets(packets, storage.clone()).await;

    assert_eq!(summary.connections, 1);
    assert_eq!(summary.tasks_abandoned, 0);
    assert_eq!(
        storage.requests(),
        vec![(id, 0, "GET".to_string(), "/index.html".to_string())]
    );
    assert_eq!(
        storage.responses(),
        vec![(id, 0, "/index.html".to_string(), 200)]
    );
    assert_eq!(storage.count(|e| *e == Event::Opened(id)), 1);
    assert_eq!(storage.count(|e| *e == Event::Closed(id)), 1);

    let events = storage.events();
    let opened = events.iter().position(|e| *e == Event::Opened(id)).unwrap();
    let closed = events.iter().position(|e| *e == Event::Closed(id)).unwrap();
    assert!(opened < closed);
}

#[tokio::test]
async fn test_pipelined_requests_match_responses_in_order() {
    let mut conv = TcpConversation::new(50001, 80);
    let packets = exchange(
        &mut conv,
        b"GET /1 HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\n\r\nGET /3 HTTP/1.1\r\n\r\n",
        b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\naHTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\nHTTP/1.1 500 Oops\r\nContent-Length: 2\r\n\r\nzz",
    );
    let id = id_of(&packets[0]);
    let storage = Arc::new(CollectingStorage::default());

    run_packets(packets, storage.clone()).await;

    assert_eq!(
        storage.responses(),
        vec![
            (id, 0, "/1".to_string(), 200),
            (id, 1, "/2".to_string(), 404),
            (id, 2, "/3".to_string(), 500),
        ]
    );
}

#[tokio::test]
async fn test_head_request_shapes_response_framing() {
    let mut conv = TcpConversation::new(50002, 80);
    let packets = exchange(
        &mut conv,
        b"HEAD /big HTTP/1.1\r\n\r\nGET /small HTTP/1.1\r\n\r\n",
        b"HTTP/1.1 200 OK\r\nContent-Length: 4096\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi",
    );
    let id = id_of(&packets[0]);
    let storage = Arc::new(CollectingStorage::default());

    run_packets(packets, storage.clone()).await;

    assert_eq!(
        storage.responses(),
        vec![(id, 0, "/big".to_string(), 200), (id, 1, "/small".to_string(), 200)]
    );
}

#[tokio::test]
async fn test_malformed_request_is_skipped() {
    let mut conv = TcpConversation::new(50003, 80);
    let mut frames = conv.handshake();
    frames.push(conv.client_sends(b"\x00\x01 not http at all\r\n"));
    frames.push(conv.client_sends(b"GET /after HTTP/1.1\r\n\r\n"));
    frames.push(conv.server_sends(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"));
    let packets = decoded_all(&frames);
    let id = id_of(&packets[0]);
    let storage = Arc::new(CollectingStorage::default());

    run_packets(packets, storage.clone()).await;

    assert_eq!(
        storage.requests(),
        vec![(id, 0, "GET".to_string(), "/after".to_string())]
    );
    assert_eq!(storage.responses(), vec![(id, 0, "/after".to_string(), 200)]);
}

#[tokio::test]
async fn test_extension_method_keeps_pairs_aligned() {
    let mut conv = TcpConversation::new(50011, 80);
    let packets = exchange(
        &mut conv,
        b"PROPFIND /dav HTTP/1.1\r\nDepth: 1\r\nContent-Length: 0\r\n\r\nGET /next HTTP/1.1\r\n\r\n",
        b"HTTP/1.1 207 Multi-Status\r\nContent-Length: 4\r\n\r\n<x/>HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
    );
    let id = id_of(&packets[0]);
    let storage = Arc::new(CollectingStorage::default());

    run_packets(packets, storage.clone()).await;

    assert_eq!(
        storage.requests(),
        vec![
            (id, 0, "PROPFIND".to_string(), "/dav".to_string()),
            (id, 1, "GET".to_string(), "/next".to_string()),
        ]
    );
    assert_eq!(
        storage.responses(),
        vec![(id, 0, "/dav".to_string(), 207), (id, 1, "/next".to_string(), 200)]
    );
}

#[tokio::test]
async fn test_malformed_response_mid_stream_keeps_its_request() {
    let mut conv = TcpConversation::new(50012, 80);
    let mut frames = conv.handshake();
    frames.push(conv.client_sends(b"GET /first HTTP/1.1\r\n\r\nGET /second HTTP/1.1\r\n\r\n"));
    frames.push(conv.server_sends(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"));
    frames.push(conv.server_sends(b"\x00\x7f definitely not a status line\r\n"));
    frames.push(conv.server_sends(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n"));
    frames.push(conv.client_fin());
    frames.push(conv.server_fin());
    let packets = decoded_all(&frames);
    let id = id_of(&packets[0]);
    let storage = Arc::new(CollectingStorage::default());

    let summary = run_packets(packets, storage.clone()).await;

    assert_eq!(summary.tasks_abandoned, 0);
    assert_eq!(
        storage.responses(),
        vec![(id, 0, "/first".to_string(), 200), (id, 1, "/second".to_string(), 404)]
    );
}

#[tokio::test]
async fn test_full_request_queue_is_released_at_shutdown() {
    let mut conv = TcpConversation::new(50013, 80);
    let mut frames = conv.handshake();
    frames.remove(1); // the server is never seen, so nothing drains the queue
    frames.push(conv.client_sends(
        b"GET /0 HTTP/1.1\r\n\r\nGET /1 HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\n\r\nGET /3 HTTP/1.1\r\n\r\nGET /4 HTTP/1.1\r\n\r\n",
    ));
    let packets = decoded_all(&frames);
    let id = id_of(&packets[0]);
    let storage = Arc::new(CollectingStorage::default());

    let summary = run_packets_with_queue(packets, storage.clone(), 2).await;

    assert_eq!(summary.tasks_joined, 1);
    assert_eq!(summary.tasks_abandoned, 0);
    let seqs: Vec<u64> = storage.requests().iter().map(|r| r.1).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    assert_eq!(storage.count(|e| *e == Event::Closed(id)), 1);
}

#[tokio::test]
async fn test_one_sided_connection_closes_without_opening() {
    let mut conv = TcpConversation::new(50004, 80);
    let mut frames = conv.handshake();
    frames.remove(1); // the server is never seen
    frames.push(conv.client_sends(b"GET /lonely HTTP/1.1\r\n\r\n"));
    let packets = decoded_all(&frames);
    let id = id_of(&packets[0]);
    let storage = Arc::new(CollectingStorage::default());

    run_packets(packets, storage.clone()).await;

    assert_eq!(storage.requests().len(), 1);
    assert!(storage.responses().is_empty());
    assert_eq!(storage.count(|e| matches!(e, Event::Opened(_))), 0);
    assert_eq!(storage.count(|e| *e == Event::Closed(id)), 1);
    // Not established, so nothing is accounted.
    assert_eq!(
        storage.count(|e| matches!(e, Event::Incoming(..) | Event::Outgoing(..))),
        0
    );
}

#[tokio::test]
async fn test_truncated_final_request_reports_close_only() {
    let mut conv = TcpConversation::new(50005, 80);
    let mut frames = conv.handshake();
    frames.push(conv.client_sends(b"GET /whole HTTP/1.1\r\n\r\nGET /cut HTTP/1.1\r\nHo"));
    let packets = decoded_all(&frames);
    let id = id_of(&packets[0]);
    let storage = Arc::new(CollectingStorage::default());

    run_packets(packets, storage.clone()).await;

    assert_eq!(
        storage.requests(),
        vec![(id, 0, "GET".to_string(), "/whole".to_string())]
    );
    assert_eq!(storage.count(|e| *e == Event::Closed(id)), 1);
}

#[tokio::test]
async fn test_payload_bytes_are_attributed_by_direction() {
    let request = b"POST /form HTTP/1.1\r\nContent-Length: 3\r\n\r\na=b";
    let response = b"HTTP/1.1 204 No Content\r\n\r\n";
    let mut conv = TcpConversation::new(50006, 80);
    let packets = exchange(&mut conv, request, response);
    let id = id_of(&packets[0]);
    let storage = Arc::new(CollectingStorage::default());

    run_packets(packets, storage.clone()).await;

    let (mut outgoing, mut incoming) = (0u64, 0u64);
    for event in storage.events() {
        match event {
            Event::Outgoing(conn, n) if conn == id => outgoing += u64::from(n),
            Event::Incoming(conn, n) if conn == id => incoming += u64::from(n),
            _ => {}
        }
    }
    assert_eq!(outgoing, request.len() as u64);
    assert_eq!(incoming, response.len() as u64);
}

#[tokio::test]
async fn test_out_of_scope_traffic_is_ignored() {
    let mut conv = TcpConversation::new(50007, 8443);
    let packets = exchange(
        &mut conv,
        b"GET / HTTP/1.1\r\n\r\n",
        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
    );
    let storage = Arc::new(CollectingStorage::default());

    let summary = run_packets(packets, storage.clone()).await;

    assert_eq!(summary.packets, 7);
    assert_eq!(summary.in_scope, 0);
    assert!(storage.events().is_empty());
}

#[tokio::test]
async fn test_storage_failures_do_not_stop_the_pipeline() {
    let mut conv = TcpConversation::new(50008, 80);
    let packets = exchange(
        &mut conv,
        b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n",
        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
    );
    let storage = Arc::new(CollectingStorage::failing());

    let summary = run_packets(packets, storage.clone()).await;

    assert_eq!(summary.tasks_abandoned, 0);
    assert_eq!(storage.requests().len(), 2);
    assert_eq!(storage.responses().len(), 2);
}

#[tokio::test]
async fn test_many_connections_are_kept_apart() {
    let mut packets = Vec::new();
    let mut ids = Vec::new();
    for port in 51000..51010u16 {
        let mut conv = TcpConversation::new(port, 80);
        let target = format!("/conn/{port}");
        let request = format!("GET {target} HTTP/1.1\r\n\r\n");
        let conn = exchange(
            &mut conv,
            request.as_bytes(),
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
        );
        ids.push((id_of(&conn[0]), target));
        packets.extend(conn);
    }
    let storage = Arc::new(CollectingStorage::default());

    let summary = run_packets(packets, storage.clone()).await;

    assert_eq!(summary.connections, 10);
    let responses = storage.responses();
    assert_eq!(responses.len(), 10);
    for (id, target) in ids {
        assert!(responses.contains(&(id, 0, target, 200)));
    }
}

#[tokio::test]
async fn test_response_without_request_is_discarded() {
    let mut conv = TcpConversation::new(50009, 80);
    let mut frames = conv.handshake();
    frames.push(conv.server_sends(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"));
    frames.push(conv.client_fin());
    frames.push(conv.server_fin());
    let packets = decoded_all(&frames);
    let id = id_of(&packets[0]);
    let storage = Arc::new(CollectingStorage::default());

    let summary = run_packets(packets, storage.clone()).await;

    assert_eq!(summary.tasks_abandoned, 0);
    assert!(storage.responses().is_empty());
    assert_eq!(storage.count(|e| *e == Event::Closed(id)), 1);
}

#[test]
fn test_identity_ignores_direction() {
    let mut conv = TcpConversation::new(50010, 80);
    let request = decoded(&conv.client_sends(b"x"));
    let response = decoded(&conv.server_sends(b"y"));

    assert_eq!(id_of(&request), id_of(&response));
}
