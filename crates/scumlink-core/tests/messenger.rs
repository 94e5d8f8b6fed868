//! Messenger behaviour against the stub device

mod common;

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{wait_for, StubDevice};
use pretty_assertions::assert_eq;
use scumlink_core::protocol::{Command, Messenger, QueueStrategy, ReceivedCommand};
use scumlink_core::transport::Transport;

fn connected(device: &Arc<StubDevice>) -> Messenger {
    common::init_logging();
    let transport: Arc<dyn Transport> = device.clone();
    let messenger = Messenger::with_default_format(transport).unwrap();
    messenger.connect().unwrap();
    messenger
}

#[test]
fn test_echo_request_returns_arguments_in_order() {
    let device = StubDevice::echo();
    let messenger = connected(&device);

    let mut reply = messenger.send_command(
        &Command::request(4, 4, 500)
            .arg(-7i32)
            .arg(2.5f64)
            .arg(true)
            .arg("a;b/c"),
    );

    assert!(reply.ok());
    assert_eq!(reply.id(), 4);
    assert_eq!(reply.read_i32(), -7);
    assert_eq!(reply.read_f64(), 2.5);
    assert!(reply.read_bool());
    assert_eq!(reply.read_string(), "a;b/c");
    assert_eq!(device.received(), vec!["4,-7,2.5,1,a;b/c"]);
}

#[test]
fn test_silent_device_times_out() {
    let device = StubDevice::mute();
    let messenger = connected(&device);

    let started = Instant::now();
    let reply = messenger.send_command(&Command::request(0, 0, 200));
    let elapsed = started.elapsed();

    assert!(!reply.ok());
    assert!(reply.arguments().is_empty());
    assert!(elapsed >= Duration::from_millis(200), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(700), "returned after {:?}", elapsed);
}

#[test]
fn test_disconnect_aborts_blocked_request() {
    let device = StubDevice::mute();
    let messenger = Arc::new(connected(&device));

    let m = messenger.clone();
    let closer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        m.disconnect();
    });

    let started = Instant::now();
    let reply = messenger.send_command(&Command::request(0, 0, 5000));
    closer.join().unwrap();

    assert!(!reply.ok());
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!messenger.is_connected());
}

#[test]
fn test_unplug_aborts_blocked_request() {
    let device = StubDevice::mute();
    let messenger = connected(&device);

    let d = device.clone();
    let unplug = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        d.unplug();
    });

    let started = Instant::now();
    assert!(!messenger.send_command(&Command::request(8, 10, 5000)).ok());
    assert!(started.elapsed() < Duration::from_secs(2));
    unplug.join().unwrap();
}

#[test]
fn test_unsolicited_commands_are_dispatched_in_order() {
    let device = StubDevice::mute();
    let messenger = connected(&device);

    let (tx, rx) = mpsc::channel();
    let known = tx.clone();
    messenger
        .dispatcher()
        .attach(6, move |cmd: ReceivedCommand| known.send(cmd.to_string()).unwrap());
    messenger
        .dispatcher()
        .attach_default(move |cmd: ReceivedCommand| tx.send(format!("?{}", cmd)).unwrap());

    device.push(b"6,1,2");
    device.push(b";42;6,3");
    device.push(b",4;\r\n");

    let seen: Vec<String> = (0..3)
        .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
        .collect();
    assert_eq!(seen, vec!["6,1,2", "?42", "6,3,4"]);
}

#[test]
fn test_malformed_frame_is_skipped() {
    let device = StubDevice::mute();
    let messenger = connected(&device);

    let (tx, rx) = mpsc::channel();
    messenger
        .dispatcher()
        .attach_default(move |cmd: ReceivedCommand| tx.send(cmd.id()).unwrap());

    device.push(b"abc,1;7;");
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 7);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_queued_request_reply_is_dispatched() {
    let device = StubDevice::echo();
    let messenger = connected(&device);

    let (tx, rx) = mpsc::channel();
    messenger
        .dispatcher()
        .attach(9, move |mut cmd: ReceivedCommand| tx.send(cmd.read_string()).unwrap());

    messenger.queue_command(Command::request(9, 9, 500).arg("queued"), QueueStrategy::None);
    assert_eq!(
        wait_for(&rx, Duration::from_secs(2), |_| true).as_deref(),
        Some("queued")
    );
}

#[test]
fn test_queued_sends_keep_order() {
    let device = StubDevice::mute();
    let messenger = connected(&device);

    for i in 0..5 {
        messenger.queue_command(Command::new(3).arg(i), QueueStrategy::None);
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    while device.received().len() < 5 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(device.received(), vec!["3,0", "3,1", "3,2", "3,3", "3,4"]);
    assert_eq!(messenger.pending_sends(), 0);
}

#[test]
fn test_concurrent_requests_are_serialized() {
    let device = StubDevice::echo();
    let messenger = Arc::new(connected(&device));

    let workers: Vec<_> = (0..4)
        .map(|i| {
            let m = messenger.clone();
            thread::spawn(move || {
                let mut reply = m.send_command(&Command::request(2, 2, 1000).arg(i));
                (reply.ok(), reply.read_i32())
            })
        })
        .collect();

    let mut results: Vec<(bool, i32)> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    results.sort();
    assert_eq!(results, vec![(true, 0), (true, 1), (true, 2), (true, 3)]);
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Queue a request the mute device never answers, so the send worker stays busy
fn occupy_send_worker(device: &Arc<StubDevice>, messenger: &Messenger, timeout_ms: u64) {
    messenger.queue_command(Command::request(1, 1, timeout_ms), QueueStrategy::None);
    assert!(wait_until(|| device.received() == vec!["1"]));
}

#[test]
fn test_clear_queue_drops_pending_sends_behind_busy_worker() {
    let device = StubDevice::mute();
    let messenger = connected(&device);
    occupy_send_worker(&device, &messenger, 300);

    messenger.queue_command(Command::new(2), QueueStrategy::None);
    messenger.queue_command(Command::new(3), QueueStrategy::None);
    assert_eq!(messenger.pending_sends(), 2);

    let reply = messenger.send_command_with(
        &Command::request(4, 4, 50),
        QueueStrategy::ClearQueue,
        QueueStrategy::None,
    );

    assert!(!reply.ok());
    assert_eq!(messenger.pending_sends(), 0);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(device.received(), vec!["1", "4"]);
}

#[test]
fn test_collapse_on_send_drops_pending_duplicates() {
    let device = StubDevice::mute();
    let messenger = connected(&device);
    occupy_send_worker(&device, &messenger, 300);

    messenger.queue_command(Command::new(2).arg("stale"), QueueStrategy::None);
    messenger.queue_command(Command::new(3), QueueStrategy::None);
    messenger.queue_command(Command::new(2).arg("stale"), QueueStrategy::None);

    let reply = messenger.send_command_with(
        &Command::request(2, 2, 50),
        QueueStrategy::Collapse,
        QueueStrategy::None,
    );
    assert!(!reply.ok());

    assert!(wait_until(|| device.received().len() >= 3));
    thread::sleep(Duration::from_millis(50));
    let mut sent = device.received();
    sent.sort();
    assert_eq!(sent, vec!["1", "2", "3"]);
}

#[test]
fn test_queued_collapse_replaces_in_place() {
    let device = StubDevice::mute();
    let messenger = connected(&device);
    occupy_send_worker(&device, &messenger, 200);

    messenger.queue_command(Command::new(2).arg("old"), QueueStrategy::Collapse);
    messenger.queue_command(Command::new(3), QueueStrategy::Collapse);
    messenger.queue_command(Command::new(2).arg("new"), QueueStrategy::Collapse);
    assert_eq!(messenger.pending_sends(), 2);

    assert!(wait_until(|| device.received().len() == 3));
    assert_eq!(device.received(), vec!["1", "2,new", "3"]);
}

/// Block the receive worker inside the callback for id 6 until released
fn stall_receive_worker(messenger: &Messenger) -> (mpsc::Sender<()>, mpsc::Receiver<String>) {
    let (release, gate) = mpsc::channel::<()>();
    let gate = std::sync::Mutex::new(gate);
    let (tx, rx) = mpsc::channel();
    let stalled = tx.clone();
    messenger.dispatcher().attach(6, move |cmd: ReceivedCommand| {
        let _ = gate.lock().unwrap().recv_timeout(Duration::from_secs(2));
        stalled.send(cmd.to_string()).unwrap();
    });
    messenger
        .dispatcher()
        .attach_default(move |cmd: ReceivedCommand| tx.send(cmd.to_string()).unwrap());
    (release, rx)
}

#[test]
fn test_clear_queue_drops_undispatched_receives() {
    let device = StubDevice::mute();
    let messenger = connected(&device);
    let (release, rx) = stall_receive_worker(&messenger);

    device.push(b"6;7,a;8;");
    assert!(wait_until(|| messenger.pending_receives() == 2));

    let reply = messenger.send_command_with(
        &Command::new(5),
        QueueStrategy::None,
        QueueStrategy::ClearQueue,
    );
    assert!(reply.ok());
    assert_eq!(messenger.pending_receives(), 0);

    release.send(()).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "6");
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_collapse_drops_undispatched_receives_with_reply_id() {
    let device = StubDevice::mute();
    let messenger = connected(&device);
    let (release, rx) = stall_receive_worker(&messenger);

    device.push(b"6;7,a;8;7,b;");
    assert!(wait_until(|| messenger.pending_receives() == 3));

    let reply = messenger.send_command_with(
        &Command::request(1, 7, 50),
        QueueStrategy::None,
        QueueStrategy::Collapse,
    );
    assert!(!reply.ok());
    assert_eq!(messenger.pending_receives(), 1);

    release.send(()).unwrap();
    let seen: Vec<String> = (0..2)
        .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
        .collect();
    assert_eq!(seen, vec!["6", "8"]);
}
