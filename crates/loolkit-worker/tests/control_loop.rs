//! Control loop behavior over a real supervisor socket.

use std::io::Write;
use std::os::unix::net::UnixListener;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use loolkit_core::queue::TileQueue;
use loolkit_worker::channel;
use loolkit_worker::control::ControlLoop;

mod common;

/// Writes one raw frame onto the supervisor side of the socket.
fn write_frame(stream: &mut impl Write, kind: u8, payload: &[u8]) {
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .unwrap();
    stream.write_all(&[kind]).unwrap();
    stream.write_all(payload).unwrap();
    stream.flush().unwrap();
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn test_session_message_builds_document_and_session() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("control.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();

    let (_stub, office) = common::new_office();
    let queue = Arc::new(TileQueue::new());
    let worker_queue = Arc::clone(&queue);
    let worker = thread::spawn(move || {
        let (mut reader, writer) = channel::connect(&socket_path).unwrap();
        let mut control = ControlLoop::new(
            office,
            Arc::new(writer),
            worker_queue,
            "jail-ctl".to_string(),
        );
        control.run(&mut reader).unwrap();
        control
    });

    let (mut supervisor, _addr) = listener.accept().unwrap();
    write_frame(&mut supervisor, 0, b"session a1 file%3A%2F%2Ftest.odt");
    // A session naming a different document must be refused.
    write_frame(&mut supervisor, 0, b"session b2 file%3A%2F%2Fother.odt");
    // Render commands flow through the queue to the document's pump,
    // which drops them here because nothing is loaded yet.
    write_frame(
        &mut supervisor,
        0,
        b"tile part=0 width=256 height=256 tileposx=0 tileposy=0 \
          tilewidth=3840 tileheight=3840",
    );
    assert!(wait_until(Duration::from_secs(2), || queue.is_empty()));

    // Closing the connection ends the loop cleanly.
    drop(supervisor);
    let control = worker.join().unwrap();

    let document = control.document().expect("document constructed");
    assert_eq!(document.url(), "file:///test.odt");
    assert_eq!(document.doc_key(), "file%3A%2F%2Ftest.odt");
    assert!(document.has_session("a1"));
    assert!(!document.has_session("b2"));
    assert_eq!(document.client_views(), 0);
}

#[test]
fn test_commands_before_document_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("control.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();

    let (_stub, office) = common::new_office();
    let queue = Arc::new(TileQueue::new());
    let worker_queue = Arc::clone(&queue);
    let worker = thread::spawn(move || {
        let (mut reader, writer) = channel::connect(&socket_path).unwrap();
        let mut control = ControlLoop::new(
            office,
            Arc::new(writer),
            worker_queue,
            "jail-ctl".to_string(),
        );
        control.run(&mut reader).unwrap();
        control
    });

    let (mut supervisor, _addr) = listener.accept().unwrap();
    write_frame(&mut supervisor, 0, b"child-a1 disconnect");
    write_frame(&mut supervisor, 0, b"canceltiles");
    thread::sleep(Duration::from_millis(100));
    drop(supervisor);

    let control = worker.join().unwrap();
    assert!(control.document().is_none());
    assert!(queue.is_empty());
}
