//! End-to-end scenarios: a real scheduler daemon on loopback TCP, driven by
//! fake pod-manager clients speaking the wire protocol.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use vgpu_scheduler::client::ClientRegistry;
use vgpu_scheduler::clock::Clock;
use vgpu_scheduler::config::{self, SchedParams};
use vgpu_scheduler::handler;
use vgpu_scheduler::protocol::{
    encode_request, parse_response, Request, RequestBody, Response, RSP_MSG_LEN,
};
use vgpu_scheduler::scheduler::{daemon, Scheduler};

struct TestDaemon {
    addr: SocketAddr,
    sched: Arc<Scheduler>,
    _dir: tempfile::TempDir,
}

impl TestDaemon {
    fn start(params: SchedParams, config_text: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resource-config.txt");
        std::fs::write(&path, config_text).unwrap();

        let mut registry = ClientRegistry::new();
        registry.apply(&config::load_resource_config(&path).unwrap(), &params);
        let sched = Arc::new(Scheduler::new(Clock::new(), params, registry));

        let daemon_sched = sched.clone();
        thread::spawn(move || daemon::run(&daemon_sched));

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let serve_sched = sched.clone();
        thread::spawn(move || handler::serve(listener, serve_sched));

        Self {
            addr,
            sched,
            _dir: dir,
        }
    }

    fn connect(&self, name: &str) -> FakeClient {
        FakeClient {
            stream: TcpStream::connect(self.addr).unwrap(),
            name: name.to_string(),
            next_req_id: 1,
        }
    }
}

struct FakeClient {
    stream: TcpStream,
    name: String,
    next_req_id: u32,
}

impl FakeClient {
    fn send(&mut self, body: RequestBody) -> u32 {
        let req_id = self.next_req_id;
        self.next_req_id += 1;
        let frame = encode_request(&Request {
            client_name: self.name.clone(),
            req_id,
            body,
        });
        self.stream.write_all(&frame).unwrap();
        req_id
    }

    fn request_quota(&mut self, overuse: f64, burst: f64) -> u32 {
        self.send(RequestBody::Quota { overuse, burst })
    }

    /// Read one response within `timeout`; None when nothing arrives in time.
    fn read_response(&mut self, timeout: Duration) -> Option<(u32, Response)> {
        self.stream.set_read_timeout(Some(timeout)).unwrap();
        let mut buf = [0u8; RSP_MSG_LEN];
        match self.stream.read_exact(&mut buf) {
            Ok(()) => Some(parse_response(&buf).unwrap()),
            Err(_) => None,
        }
    }

    fn expect_quota(&mut self, timeout: Duration) -> f64 {
        match self.read_response(timeout) {
            Some((_, Response::Quota { quota })) => quota,
            other => panic!("expected a quota grant, got {other:?}"),
        }
    }
}

fn default_params() -> SchedParams {
    SchedParams {
        quota: 250.0,
        min_quota: 100.0,
        window: 1000.0,
    }
}

#[test]
fn single_client_burst_driven_quota() {
    let daemon = TestDaemon::start(default_params(), "1\npodA 0.5 1.0 50 1000\n");
    let mut client = daemon.connect("podA");

    client.request_quota(0.0, 200.0);
    let quota = client.expect_quota(Duration::from_secs(2));

    // 200 * 0.5 + 250 * 0.5, inside [100, 500]
    assert!((quota - 225.0).abs() < 1e-6, "unexpected quota {quota}");

    let state = daemon.sched.lock();
    assert_eq!(state.sm_occupied, 50);
    assert_eq!(state.tokens.len(), 1);
}

#[test]
fn memory_gating_round_trip() {
    let daemon = TestDaemon::start(default_params(), "1\npodA 0.5 1.0 50 1000\n");
    let mut client = daemon.connect("podA");
    let timeout = Duration::from_secs(2);

    client.send(RequestBody::MemUpdate {
        bytes: 600,
        is_allocate: true,
    });
    assert_eq!(
        client.read_response(timeout).unwrap().1,
        Response::MemUpdate { verdict: true }
    );

    client.send(RequestBody::MemUpdate {
        bytes: 500,
        is_allocate: true,
    });
    assert_eq!(
        client.read_response(timeout).unwrap().1,
        Response::MemUpdate { verdict: false }
    );

    client.send(RequestBody::MemLimit);
    assert_eq!(
        client.read_response(timeout).unwrap().1,
        Response::MemLimit {
            used: 600,
            limit: 1000
        }
    );

    client.send(RequestBody::MemUpdate {
        bytes: 600,
        is_allocate: false,
    });
    assert_eq!(
        client.read_response(timeout).unwrap().1,
        Response::MemUpdate { verdict: true }
    );

    client.send(RequestBody::MemLimit);
    assert_eq!(
        client.read_response(timeout).unwrap().1,
        Response::MemLimit {
            used: 0,
            limit: 1000
        }
    );
}

#[test]
fn req_id_is_echoed_in_replies() {
    let daemon = TestDaemon::start(default_params(), "1\npodA 0.5 1.0 50 1000\n");
    let mut client = daemon.connect("podA");

    let req_id = client.send(RequestBody::MemLimit);
    let (echoed, _) = client.read_response(Duration::from_secs(2)).unwrap();
    assert_eq!(echoed, req_id);
}

#[test]
fn sm_packing_admits_one_of_two_oversized_clients() {
    let daemon = TestDaemon::start(
        default_params(),
        "2\npodA 0.5 1.0 60 1000\npodB 0.5 1.0 50 1000\n",
    );
    let mut a = daemon.connect("podA");
    let mut b = daemon.connect("podB");

    a.request_quota(0.0, 0.0);
    thread::sleep(Duration::from_millis(30));
    b.request_quota(0.0, 0.0);

    // A arrived first and gets the grant; B does not fit (60 + 50 > 100)
    let quota_a = a.expect_quota(Duration::from_secs(2));
    assert!((quota_a - 250.0).abs() < 1e-6);

    assert!(
        b.read_response(Duration::from_millis(80)).is_none(),
        "B must wait for A's token to expire"
    );

    // once A's ~250ms token expires, B's SM share fits again
    let started = Instant::now();
    let quota_b = b.expect_quota(Duration::from_secs(3));
    assert!((quota_b - 250.0).abs() < 1e-6);
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "B should be granted soon after expiry"
    );

    let state = daemon.sched.lock();
    assert!(state.sm_occupied <= 100);
}

#[test]
fn expired_tokens_refund_sm_capacity() {
    let daemon = TestDaemon::start(default_params(), "1\npodA 0.5 1.0 60 1000\n");
    let mut client = daemon.connect("podA");

    client.request_quota(0.0, 0.0);
    client.expect_quota(Duration::from_secs(2));
    assert_eq!(daemon.sched.lock().sm_occupied, 60);

    // the grant is ~250ms and the client never returns
    thread::sleep(Duration::from_millis(450));
    let state = daemon.sched.lock();
    assert_eq!(state.sm_occupied, 0, "expiry must refund the partition");
    assert!(state.tokens.is_empty());
}

#[test]
fn early_return_is_rescheduled_before_expiry() {
    // long base quota so a timely second grant cannot be explained by expiry
    let params = SchedParams {
        quota: 800.0,
        min_quota: 100.0,
        window: 1000.0,
    };
    let daemon = TestDaemon::start(params, "1\npodA 0.5 1.0 50 1000\n");
    let mut client = daemon.connect("podA");

    client.request_quota(0.0, 0.0);
    let first = client.expect_quota(Duration::from_secs(2));
    assert!((first - 800.0).abs() < 1e-6);

    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    client.request_quota(0.0, 100.0);
    let second = client.expect_quota(Duration::from_secs(2));
    assert!(
        started.elapsed() < Duration::from_millis(600),
        "early return must be rescheduled without waiting out the 800ms token"
    );
    // 100 * 0.5 + 800 * 0.5, clamped to max 500
    assert!((second - 450.0).abs() < 1e-6, "unexpected quota {second}");

    let state = daemon.sched.lock();
    assert_eq!(state.tokens.len(), 1, "stale token must have been replaced");
    assert_eq!(state.sm_occupied, 50);
}

#[test]
fn unknown_client_gets_no_reply_but_connection_survives() {
    let daemon = TestDaemon::start(default_params(), "1\npodA 0.5 1.0 50 1000\n");
    let mut ghost = daemon.connect("ghost");

    ghost.send(RequestBody::MemLimit);
    assert!(ghost.read_response(Duration::from_millis(100)).is_none());

    // the connection stays open: a configured name on it still gets a reply
    let frame = encode_request(&Request {
        client_name: "podA".to_string(),
        req_id: 9,
        body: RequestBody::MemLimit,
    });
    ghost.stream.write_all(&frame).unwrap();
    assert!(ghost.read_response(Duration::from_secs(2)).is_some());
}
