//! End-to-end tests: synthetic camera, real listener, coordinated shutdown.

use std::time::{Duration, Instant};

use camola_serve::capture::{Outcome, SyntheticProbe, SyntheticSource};
use camola_serve::lifecycle::{Coordinator, Exit, Signal};
use camola_serve::{Camera, CameraConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

fn config(timeout: Duration) -> CameraConfig {
    CameraConfig {
        exposure_us: 10_000.0,
        gain_db: 16.0,
        acquire_timeout: timeout,
        settle: Duration::ZERO,
        ..CameraConfig::default()
    }
}

fn stub_camera(timeout: Duration) -> (Camera, SyntheticProbe) {
    let source = SyntheticSource::new("stub://bench", 640, 480);
    let probe = source.probe();
    let camera = Camera::from_source(Box::new(source), &config(timeout)).unwrap();
    (camera, probe)
}

struct HttpResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

async fn http_get(addr: std::net::SocketAddr, path: &str) -> HttpResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();

    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header terminator");
    let head = String::from_utf8_lossy(&raw[..split]).to_string();
    let mut lines = head.lines();
    let status = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap();
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();
    HttpResponse {
        status,
        headers,
        body: raw[split + 4..].to_vec(),
    }
}

async fn wait_for_frame(addr: std::net::SocketAddr, path: &str) -> HttpResponse {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let response = http_get(addr, path).await;
        if !response.body.is_empty() || Instant::now() > deadline {
            return response;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn serves_decodable_frames_and_shuts_down_cleanly() {
    let (camera, probe) = stub_camera(Duration::from_millis(20));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (signals_tx, signals_rx) = mpsc::channel(4);

    let coordinator = tokio::spawn(
        Coordinator::new(camera, listener, Duration::from_secs(5)).run(signals_rx),
    );

    let response = wait_for_frame(addr, "/0.png").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-type"), Some("image/png"));
    let decoded = image::load_from_memory(&response.body).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (640, 480));

    let response = http_get(addr, "/0.png?gain=20").await;
    assert_eq!(response.status, 200);
    http_get(addr, "/0.png?gain=20").await;
    assert_eq!(probe.gain_calls(), vec![20.0]);

    signals_tx.send(Signal::Terminate).await.unwrap();
    let exit = tokio::time::timeout(Duration::from_secs(6), coordinator)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(exit, Exit::Clean);
    assert!(probe.stopped());
    assert!(probe.closed());
    assert_eq!(probe.outstanding(), 0);
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn grace_period_bounds_shutdown() {
    // The producer sits in a long acquire and cannot notice cancellation in time
    let (camera, probe) = stub_camera(Duration::from_secs(2));
    probe.script([Outcome::Timeout; 4]);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (signals_tx, signals_rx) = mpsc::channel(4);

    let coordinator = tokio::spawn(
        Coordinator::new(camera, listener, Duration::from_millis(200)).run(signals_rx),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let start = Instant::now();
    signals_tx.send(Signal::Interrupt).await.unwrap();
    let exit = coordinator.await.unwrap();

    assert_eq!(exit, Exit::Forced);
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_signal_forces_exit() {
    let (camera, probe) = stub_camera(Duration::from_secs(2));
    probe.script([Outcome::Timeout; 4]);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (signals_tx, signals_rx) = mpsc::channel(4);

    let coordinator = tokio::spawn(
        Coordinator::new(camera, listener, Duration::from_secs(30)).run(signals_rx),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    signals_tx.send(Signal::Interrupt).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    signals_tx.send(Signal::Interrupt).await.unwrap();

    let exit = tokio::time::timeout(Duration::from_secs(1), coordinator)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exit, Exit::Forced);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_acquisition_start_stops_serving() {
    let (camera, probe) = stub_camera(Duration::from_millis(5));
    probe.fail_start(true);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (_signals_tx, signals_rx) = mpsc::channel(4);

    let exit = tokio::time::timeout(
        Duration::from_secs(5),
        Coordinator::new(camera, listener, Duration::from_secs(2)).run(signals_rx),
    )
    .await
    .unwrap();

    assert_eq!(exit, Exit::Failed);
    assert_eq!(probe.frames(), 0);
    assert!(probe.closed());
    assert!(TcpStream::connect(addr).await.is_err());
}
