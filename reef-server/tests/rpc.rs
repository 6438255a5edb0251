use reef_server::{ops, Server, ServerConfig};
use reef_wire::{decode_head, encode_frame, head_size, MsgHead, PkgType};

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

struct TestServer {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
    addr: std::net::SocketAddr,
}

impl TestServer {
    fn spawn() -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let (tx, rx) = mpsc::channel();

        let handle = std::thread::spawn(move || {
            let mut config = ServerConfig::new();
            config.tcp = Some("127.0.0.1:0".parse().unwrap());
            let mut server = Server::bind(&config).expect("bind");
            tx.send(server.tcp_addr().unwrap()).unwrap();
            server
                .run_until(Duration::from_millis(10), || stop_flag.load(Ordering::SeqCst))
                .expect("poll loop");
        });

        let addr = rx.recv_timeout(Duration::from_secs(5)).expect("server address");
        Self {
            stop,
            handle: Some(handle),
            addr,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Client {
    stream: TcpStream,
    next_id: u64,
}

impl Client {
    fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect");
        stream.set_nodelay(true).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Self { stream, next_id: 0 }
    }

    /// One request/response round trip.
    fn call(&mut self, msg_type: u32, body: &[u8], data: &[u8]) -> (MsgHead, Vec<u8>, Vec<u8>) {
        self.next_id += 1;
        let msg_id = self.next_id;
        let request =
            encode_frame(PkgType::Request, msg_type, msg_id, b"", body, data).unwrap();
        self.stream.write_all(&request).unwrap();

        let mut hbuf = [0u8; 2];
        self.stream.read_exact(&mut hbuf).unwrap();
        let total = head_size(hbuf[0], hbuf[1]);
        let mut head_bytes = vec![0u8; total];
        head_bytes[..2].copy_from_slice(&hbuf);
        self.stream.read_exact(&mut head_bytes[2..]).unwrap();

        let (pkg, head) = decode_head(&head_bytes).unwrap();
        assert_eq!(pkg, PkgType::Response);
        assert_eq!(head.msg_id, msg_id, "responses follow request order");
        assert_eq!(head.msg_type, msg_type);
        assert_eq!(head.fwd_length, 0);

        let mut body = vec![0u8; head.body_length as usize];
        self.stream.read_exact(&mut body).unwrap();
        let mut data = vec![0u8; head.data_length as usize];
        self.stream.read_exact(&mut data).unwrap();
        (head, body, data)
    }

    /// Call expecting a given errno code; returns the result payload.
    fn expect(&mut self, msg_type: u32, body: &[u8], data: &[u8], code: u8) -> (Vec<u8>, Vec<u8>) {
        let (_, body, data) = self.call(msg_type, body, data);
        assert!(!body.is_empty(), "response body carries the errno code");
        assert_eq!(body[0], code, "errno code");
        (body[1..].to_vec(), data)
    }

    fn ok(&mut self, msg_type: u32, body: &[u8], data: &[u8]) -> (Vec<u8>, Vec<u8>) {
        self.expect(msg_type, body, data, 0)
    }
}

fn u64_at(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes[..8].try_into().unwrap())
}

fn i64_at(bytes: &[u8]) -> i64 {
    i64::from_le_bytes(bytes[..8].try_into().unwrap())
}

fn create_body(type_label: &str, label: &str) -> Vec<u8> {
    let mut body = vec![type_label.len() as u8];
    body.extend_from_slice(type_label.as_bytes());
    body.extend_from_slice(label.as_bytes());
    body
}

fn op_body(txn: u64, oid: u64, operands: &[i64]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&txn.to_le_bytes());
    body.extend_from_slice(&oid.to_le_bytes());
    for operand in operands {
        body.extend_from_slice(&operand.to_le_bytes());
    }
    body
}

fn deque_body(txn: u64, oid: u64, front: bool) -> Vec<u8> {
    let mut body = op_body(txn, oid, &[]);
    body.push(front as u8);
    body
}

#[test]
fn number_round_trip_over_tcp() {
    let server = TestServer::spawn();
    let mut client = Client::connect(server.addr);

    let (payload, _) = client.ok(ops::OBJ_CREATE, &create_body("number", "n"), b"");
    let oid = u64_at(&payload);

    client.ok(ops::NUMBER_SET, &op_body(0, oid, &[7]), b"");

    // successful cas reports the pre-swap value
    let (payload, _) = client.ok(ops::NUMBER_CAS, &op_body(0, oid, &[7, 9]), b"");
    assert_eq!(i64_at(&payload), 7);

    let (payload, _) = client.ok(ops::NUMBER_GET, &op_body(0, oid, &[]), b"");
    assert_eq!(i64_at(&payload), 9);

    // mismatch reports DataCas and the current value
    let (payload, _) = client.expect(ops::NUMBER_CAS, &op_body(0, oid, &[6, 1]), b"", 5);
    assert_eq!(i64_at(&payload), 9);

    let (payload, _) = client.ok(ops::NUMBER_DIV, &op_body(0, oid, &[4]), b"");
    assert_eq!(i64_at(&payload), 2);
    assert_eq!(i64_at(&payload[8..]), 1);

    // div by zero
    client.expect(ops::NUMBER_DIV, &op_body(0, oid, &[0]), b"", 6);
}

#[test]
fn deque_and_txn_over_tcp() {
    let server = TestServer::spawn();
    let mut client = Client::connect(server.addr);

    let (payload, _) = client.ok(ops::OBJ_CREATE, &create_body("deque", "q"), b"");
    let oid = u64_at(&payload);

    let (payload, _) = client.ok(ops::TXN_BEGIN, b"", b"");
    let txn = u64_at(&payload);
    assert!(txn > 0);

    client.ok(ops::DEQUE_PUSH, &deque_body(txn, oid, true), b"A");
    client.ok(ops::DEQUE_PUSH, &deque_body(txn, oid, true), b"B");

    // nothing visible outside the transaction yet
    client.expect(ops::DEQUE_POP, &deque_body(0, oid, true), b"", 4);

    client.ok(ops::TXN_COMMIT, &txn.to_le_bytes(), b"");

    let (_, data) = client.ok(ops::DEQUE_POP, &deque_body(0, oid, true), b"");
    assert_eq!(data, b"B");
    let (_, data) = client.ok(ops::DEQUE_POP, &deque_body(0, oid, true), b"");
    assert_eq!(data, b"A");
    client.expect(ops::DEQUE_POP, &deque_body(0, oid, true), b"", 4);
}

#[test]
fn txn_contention_over_tcp() {
    let server = TestServer::spawn();
    let mut client = Client::connect(server.addr);

    let (payload, _) = client.ok(ops::OBJ_CREATE, &create_body("number", "n"), b"");
    let oid = u64_at(&payload);

    let (payload, _) = client.ok(ops::TXN_BEGIN, b"", b"");
    let t1 = u64_at(&payload);
    let (payload, _) = client.ok(ops::TXN_BEGIN, b"", b"");
    let t2 = u64_at(&payload);

    client.ok(ops::NUMBER_SET, &op_body(t1, oid, &[3]), b"");
    client.expect(ops::NUMBER_SET, &op_body(t2, oid, &[4]), b"", 3);

    client.ok(ops::TXN_ROLLBACK, &t1.to_le_bytes(), b"");
    client.ok(ops::NUMBER_SET, &op_body(t2, oid, &[4]), b"");
    client.ok(ops::TXN_COMMIT, &t2.to_le_bytes(), b"");

    let (payload, _) = client.ok(ops::NUMBER_GET, &op_body(0, oid, &[]), b"");
    assert_eq!(i64_at(&payload), 4);
}

#[test]
fn flow_contract_over_tcp() {
    let server = TestServer::spawn();
    let mut client = Client::connect(server.addr);

    let (payload, _) = client.ok(ops::OBJ_CREATE, &create_body("flow", "f"), b"");
    let oid = u64_at(&payload);

    let (payload, _) = client.ok(ops::FLOW_APPEND, &op_body(0, oid, &[]), b"hello");
    assert_eq!(u64_at(&payload), 5);
    let (payload, _) = client.ok(ops::FLOW_SIZE, &oid.to_le_bytes(), b"");
    assert_eq!(u64_at(&payload), 5);

    // range reads are a final NotImplemented for now
    let mut body = op_body(0, oid, &[]);
    body.extend_from_slice(&0u64.to_le_bytes());
    body.extend_from_slice(&5u64.to_le_bytes());
    client.expect(ops::FLOW_READ, &body, b"", 2);
}

#[test]
fn pipelined_requests_answer_in_order() {
    let server = TestServer::spawn();
    let mut client = Client::connect(server.addr);

    let (payload, _) = client.ok(ops::OBJ_CREATE, &create_body("counter", "c"), b"");
    let oid = u64_at(&payload);

    // fire a burst without reading, then collect responses in order
    let mut expected = Vec::new();
    let mut msg_id = client.next_id;
    let mut burst = Vec::new();
    for add in 1..=10i64 {
        msg_id += 1;
        burst.extend(
            encode_frame(
                PkgType::Request,
                ops::COUNTER_ADD,
                msg_id,
                b"",
                &op_body(0, oid, &[add]),
                b"",
            )
            .unwrap(),
        );
        expected.push(expected.last().copied().unwrap_or(0) + add);
    }
    client.stream.write_all(&burst).unwrap();

    for value in expected {
        client.next_id += 1;
        let mut hbuf = [0u8; 2];
        client.stream.read_exact(&mut hbuf).unwrap();
        let total = head_size(hbuf[0], hbuf[1]);
        let mut head_bytes = vec![0u8; total];
        head_bytes[..2].copy_from_slice(&hbuf);
        client.stream.read_exact(&mut head_bytes[2..]).unwrap();
        let (_, head) = decode_head(&head_bytes).unwrap();
        assert_eq!(head.msg_id, client.next_id);

        let mut body = vec![0u8; head.body_length as usize];
        client.stream.read_exact(&mut body).unwrap();
        assert_eq!(body[0], 0);
        assert_eq!(i64_at(&body[1..]), value);
    }
}

#[test]
fn datagram_endpoint_answers_per_datagram() {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let (tx, rx) = mpsc::channel();

    let handle = std::thread::spawn(move || {
        let mut config = ServerConfig::new();
        config.udp = Some("127.0.0.1:0".parse().unwrap());
        let mut server = Server::bind(&config).expect("bind");
        tx.send(server.udp_addr().unwrap()).unwrap();
        server
            .run_until(Duration::from_millis(10), || stop_flag.load(Ordering::SeqCst))
            .expect("poll loop");
    });
    let addr = rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    client.connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let request =
        encode_frame(PkgType::Request, ops::TXN_BEGIN, 77, b"", b"", b"").unwrap();
    client.send(&request).unwrap();

    let mut buf = [0u8; 2048];
    let n = client.recv(&mut buf).unwrap();
    let total = head_size(buf[0], buf[1]);
    let (pkg, head) = decode_head(&buf[..total]).unwrap();
    assert_eq!(pkg, PkgType::Response);
    assert_eq!(head.msg_id, 77);
    assert_eq!(head.msg_type, ops::TXN_BEGIN);
    let body = &buf[total..n];
    assert_eq!(body[0], 0);
    assert!(u64_at(&body[1..]) > 0, "transaction ids start above zero");

    stop.store(true, Ordering::SeqCst);
    handle.join().unwrap();
}
