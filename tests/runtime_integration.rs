use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use image::{Rgba, RgbaImage};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use wscast::activation::{ActivationState, DetectionMode};
use wscast::config::Configuration;
use wscast::error::CaptureError;
use wscast::events::{ControlCommand, ControlReply, ControlRequest};
use wscast::platform::foreground::{ForegroundSource, ForegroundWindow};
use wscast::platform::screen::{ScreenSource, StillFrame};
use wscast::processing::color::OutputMode;
use wscast::tasks::runtime::{Runtime, RuntimeOptions};

struct FakeForeground(Arc<AtomicBool>);

impl ForegroundSource for FakeForeground {
    fn inspect(&mut self) -> ForegroundWindow {
        let fullscreen = self.0.load(Ordering::SeqCst);
        ForegroundWindow {
            fullscreen,
            title: fullscreen.then(|| "Film".to_string()),
        }
    }
}

struct BrokenScreen(Arc<AtomicUsize>);

impl ScreenSource for BrokenScreen {
    fn capture(&mut self) -> Result<RgbaImage, CaptureError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Err(CaptureError::Backend("display went away".into()))
    }
}

fn winter_night() -> DateTime<Utc> {
    "2024-01-15T23:00:00Z".parse().unwrap()
}

fn summer_noon() -> DateTime<Utc> {
    "2024-06-21T12:00:00Z".parse().unwrap()
}

fn config(port: Option<u16>) -> Configuration {
    let mut cfg = Configuration::default();
    if let Some(port) = port {
        cfg.device.address = Some(Ipv4Addr::LOCALHOST);
        cfg.device.port = port;
    }
    cfg.device.connect_timeout = Duration::from_secs(2);
    cfg.sampling.interval = Duration::from_millis(40);
    cfg.sampling.seed = Some(1);
    cfg.detection.poll_interval = Duration::from_millis(40);
    cfg.schedule.timezone = Some(chrono_tz::Europe::Lisbon);
    cfg.schedule.check_interval = Duration::from_secs(3600);
    cfg
}

fn red_screen() -> Box<StillFrame> {
    Box::new(StillFrame(RgbaImage::from_pixel(64, 36, Rgba([255, 0, 0, 255]))))
}

async fn controller_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

async fn accept(listener: &TcpListener) -> TcpStream {
    tokio::time::timeout(Duration::from_secs(3), listener.accept())
        .await
        .expect("timeout waiting for the runtime to connect")
        .unwrap()
        .0
}

async fn read_frame(peer: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(2), peer.read_exact(&mut buf))
        .await
        .expect("timeout waiting for a frame")
        .unwrap();
    buf
}

async fn wait_for_eof(peer: &mut TcpStream) {
    let mut sink = [0u8; 256];
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match peer.read(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    })
    .await
    .expect("socket was not closed");
}

async fn request(tx: &mpsc::Sender<ControlRequest>, command: ControlCommand) -> ControlReply {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(ControlRequest {
        command,
        reply: Some(reply_tx),
    })
    .await
    .unwrap();
    tokio::time::timeout(Duration::from_secs(3), reply_rx)
        .await
        .expect("timeout waiting for control reply")
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fullscreen_at_night_streams_until_fullscreen_exits() {
    let (listener, port) = controller_listener().await;
    let fullscreen = Arc::new(AtomicBool::new(false));
    let runtime = Runtime::new(
        config(Some(port)),
        red_screen(),
        Box::new(FakeForeground(Arc::clone(&fullscreen))),
        RuntimeOptions {
            now_override: Some(winter_night()),
            engage_manual: false,
        },
    );
    let mut status = runtime.subscribe_status();
    assert_eq!(status.borrow().state, ActivationState::AutoIdle);

    let (_control_tx, control_rx) = mpsc::channel(4);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(runtime.run(control_rx, cancel.clone()));

    let early = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
    assert!(early.is_err(), "no connection expected without a fullscreen window");

    fullscreen.store(true, Ordering::SeqCst);
    let mut peer = accept(&listener).await;
    assert_eq!(read_frame(&mut peer, 2).await, vec![0x05, 128]);
    for _ in 0..3 {
        assert_eq!(read_frame(&mut peer, 4).await, vec![0x02, 128, 0, 0]);
    }

    let snapshot = tokio::time::timeout(
        Duration::from_secs(2),
        status.wait_for(|s| s.state == ActivationState::AutoActive),
    )
    .await
    .expect("runtime never reported an active session")
    .unwrap()
    .clone();
    assert!(snapshot.connected);
    assert!(snapshot.fullscreen_detected);
    assert_eq!(snapshot.attached_window.as_deref(), Some("Film"));
    assert_eq!(snapshot.peer, Some(format!("127.0.0.1:{port}")));

    fullscreen.store(false, Ordering::SeqCst);
    wait_for_eof(&mut peer).await;
    tokio::time::timeout(
        Duration::from_secs(2),
        status.wait_for(|s| s.state == ActivationState::AutoIdle && !s.connected),
    )
    .await
    .expect("runtime never went back to idle")
    .unwrap();

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn daytime_ignores_fullscreen_until_night_gating_is_lifted() {
    let (listener, port) = controller_listener().await;
    let fullscreen = Arc::new(AtomicBool::new(true));
    let runtime = Runtime::new(
        config(Some(port)),
        red_screen(),
        Box::new(FakeForeground(Arc::clone(&fullscreen))),
        RuntimeOptions {
            now_override: Some(summer_noon()),
            engage_manual: false,
        },
    );
    assert_eq!(runtime.subscribe_status().borrow().state, ActivationState::Disabled);

    let (control_tx, control_rx) = mpsc::channel(4);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(runtime.run(control_rx, cancel.clone()));

    let early = tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
    assert!(early.is_err(), "daytime must not activate");

    let reply = request(&control_tx, ControlCommand::SetNightOnly { enabled: false }).await;
    assert!(reply.ok);

    let mut peer = accept(&listener).await;
    assert_eq!(read_frame(&mut peer, 2).await, vec![0x05, 128]);
    assert_eq!(read_frame(&mut peer, 4).await, vec![0x02, 128, 0, 0]);

    cancel.cancel();
    handle.await.unwrap().unwrap();
    wait_for_eof(&mut peer).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_session_sends_regions_and_restores_mode() {
    let (listener, port) = controller_listener().await;
    let mut cfg = config(Some(port));
    cfg.detection.mode = DetectionMode::Off;
    cfg.sampling.output_mode = OutputMode::Regional;
    let runtime = Runtime::new(
        cfg,
        red_screen(),
        Box::new(FakeForeground(Arc::new(AtomicBool::new(false)))),
        RuntimeOptions {
            now_override: Some(summer_noon()),
            engage_manual: false,
        },
    );
    let (control_tx, control_rx) = mpsc::channel(4);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(runtime.run(control_rx, cancel.clone()));

    let reply = request(&control_tx, ControlCommand::ToggleManual).await;
    assert!(reply.ok);
    let status = reply.status.unwrap();
    assert_eq!(status["state"], "manual-active");
    assert_eq!(status["detection-mode"], "manual");

    let mut peer = accept(&listener).await;
    assert_eq!(read_frame(&mut peer, 2).await, vec![0x05, 128]);
    let frame = read_frame(&mut peer, 2 + 48).await;
    assert_eq!(&frame[..2], &[0x06, 16]);
    assert!(frame[2..].chunks(3).all(|rgb| rgb == [128, 0, 0]));

    let reply = request(&control_tx, ControlCommand::SetBrightness { percent: 100.0 }).await;
    assert!(reply.ok);

    let reply = request(&control_tx, ControlCommand::ToggleManual).await;
    let status = reply.status.unwrap();
    assert_eq!(status["state"], "disabled");
    assert_eq!(status["detection-mode"], "off");
    assert_eq!(status["connected"], false);

    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(3), peer.read_to_end(&mut rest))
        .await
        .expect("socket was not closed")
        .unwrap();
    assert!(
        rest.windows(2).any(|w| w == [0x05, 255]),
        "brightness update should reach the controller"
    );

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_activation_reports_status_and_keeps_mode() {
    let runtime = Runtime::new(
        config(None),
        red_screen(),
        Box::new(FakeForeground(Arc::new(AtomicBool::new(false)))),
        RuntimeOptions {
            now_override: Some(winter_night()),
            engage_manual: false,
        },
    );
    let (control_tx, control_rx) = mpsc::channel(4);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(runtime.run(control_rx, cancel.clone()));

    let reply = request(&control_tx, ControlCommand::SetManual { engaged: true }).await;
    let status = reply.status.unwrap();
    assert_eq!(status["detection-mode"], "auto");
    assert_eq!(status["state"], "auto-idle");
    assert_eq!(status["status"], "No controller address configured.");

    let reply = request(
        &control_tx,
        ControlCommand::SetEndpoint {
            octets: vec!["10".into(), "0".into(), "300".into(), "1".into()],
            port: None,
        },
    )
    .await;
    assert!(!reply.ok);
    assert!(reply.error.unwrap().contains("invalid endpoint"));

    let reply = request(
        &control_tx,
        ControlCommand::SetEndpoint {
            octets: vec!["10".into(), "0".into(), "0".into(), "7".into()],
            port: Some(4000),
        },
    )
    .await;
    assert_eq!(reply.status.unwrap()["endpoint"], "10.0.0.7:4000");

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn controller_dropping_the_session_resets_and_reconnects() {
    let (listener, port) = controller_listener().await;
    let mut cfg = config(Some(port));
    cfg.detection.poll_interval = Duration::from_millis(300);
    let runtime = Runtime::new(
        cfg,
        red_screen(),
        Box::new(FakeForeground(Arc::new(AtomicBool::new(true)))),
        RuntimeOptions {
            now_override: Some(winter_night()),
            engage_manual: false,
        },
    );
    let mut status = runtime.subscribe_status();
    let (_control_tx, control_rx) = mpsc::channel(4);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(runtime.run(control_rx, cancel.clone()));

    let mut peer = accept(&listener).await;
    assert_eq!(read_frame(&mut peer, 2).await, vec![0x05, 128]);
    drop(peer);

    let snapshot = tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| !s.connected && s.status.starts_with("write failed")),
    )
    .await
    .expect("runtime never noticed the dropped session")
    .unwrap()
    .clone();
    assert_eq!(snapshot.state, ActivationState::AutoIdle);
    assert_eq!(snapshot.peer, None);
    assert_eq!(snapshot.attached_window, None);

    let mut peer = accept(&listener).await;
    assert_eq!(read_frame(&mut peer, 2).await, vec![0x05, 128]);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_capture_skips_ticks_but_keeps_the_session() {
    let (listener, port) = controller_listener().await;
    let captures = Arc::new(AtomicUsize::new(0));
    let runtime = Runtime::new(
        config(Some(port)),
        Box::new(BrokenScreen(Arc::clone(&captures))),
        Box::new(FakeForeground(Arc::new(AtomicBool::new(true)))),
        RuntimeOptions {
            now_override: Some(winter_night()),
            engage_manual: false,
        },
    );
    let status = runtime.subscribe_status();
    let preview = runtime.subscribe_preview();
    let (_control_tx, control_rx) = mpsc::channel(4);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(runtime.run(control_rx, cancel.clone()));

    let mut peer = accept(&listener).await;
    assert_eq!(read_frame(&mut peer, 2).await, vec![0x05, 128]);

    let mut extra = [0u8; 16];
    let silent = tokio::time::timeout(Duration::from_millis(400), peer.read(&mut extra)).await;
    assert!(silent.is_err(), "no color frame expected without a capture");
    assert!(captures.load(Ordering::SeqCst) >= 3);
    assert!(status.borrow().connected);
    assert_eq!(status.borrow().state, ActivationState::AutoActive);
    assert!(preview.borrow().is_none());

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_release_of_an_auto_session_waits_for_fullscreen_to_end() {
    let (listener, port) = controller_listener().await;
    let fullscreen = Arc::new(AtomicBool::new(true));
    let runtime = Runtime::new(
        config(Some(port)),
        red_screen(),
        Box::new(FakeForeground(Arc::clone(&fullscreen))),
        RuntimeOptions {
            now_override: Some(winter_night()),
            engage_manual: false,
        },
    );
    let mut status = runtime.subscribe_status();
    let (control_tx, control_rx) = mpsc::channel(4);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(runtime.run(control_rx, cancel.clone()));

    let mut peer = accept(&listener).await;
    tokio::time::timeout(Duration::from_secs(2), status.wait_for(|s| s.connected))
        .await
        .expect("auto session never started")
        .unwrap();

    let reply = request(&control_tx, ControlCommand::ToggleManual).await;
    let snapshot = reply.status.unwrap();
    assert_eq!(snapshot["state"], "auto-idle");
    assert_eq!(snapshot["connected"], false);
    wait_for_eof(&mut peer).await;

    let again = tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
    assert!(again.is_err(), "auto must not re-engage while the same fullscreen is up");

    fullscreen.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    fullscreen.store(true, Ordering::SeqCst);
    let mut peer = accept(&listener).await;
    assert_eq!(read_frame(&mut peer, 2).await, vec![0x05, 128]);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}
