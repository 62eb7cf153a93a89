//! Background draining of long-running process output.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::{Duration, Instant};

use mits_core::reader::{AsyncProcessReader, ReaderError};

#[test]
fn single_read_returns_every_queued_line() {
    let lines: String = (0..100).map(|i| format!("line {i}\n")).collect();
    let reader = AsyncProcessReader::from_reader(std::io::Cursor::new(lines.clone().into_bytes()));
    assert!(reader.wait_finished(Duration::from_secs(5)));

    assert_eq!(reader.read(), lines);
    assert_eq!(reader.read(), "");
}

#[test]
fn partial_last_line_is_delivered() {
    let reader = AsyncProcessReader::from_reader(std::io::Cursor::new(b"a\nno newline".to_vec()));
    assert!(reader.wait_finished(Duration::from_secs(5)));
    assert_eq!(reader.read(), "a\nno newline");
}

#[test]
fn concurrent_producer_loses_nothing() {
    let (mut writer, source) = UnixStream::pair().unwrap();
    let reader = AsyncProcessReader::from_reader(source);

    let producer = thread::spawn(move || {
        for i in 0..500 {
            writeln!(writer, "event {i}").unwrap();
            if i % 50 == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }
    });

    let mut collected = String::new();
    while !reader.is_finished() {
        collected.push_str(&reader.read());
        thread::sleep(Duration::from_millis(2));
    }
    producer.join().unwrap();
    collected.push_str(&reader.read());

    let expected: String = (0..500).map(|i| format!("event {i}\n")).collect();
    assert_eq!(collected, expected);
}

#[test]
fn spawned_process_output_is_readable() {
    let reader = match AsyncProcessReader::spawn("printf 'one\\ntwo\\n'") {
        Ok(reader) => reader,
        Err(ReaderError::Spawn { .. }) => return,
        Err(e) => panic!("unexpected error: {e}"),
    };
    assert!(reader.wait_finished(Duration::from_secs(5)));
    assert_eq!(reader.read().replace('\r', ""), "one\ntwo\n");
}

#[test]
fn terminate_stops_long_running_process() {
    let reader = match AsyncProcessReader::spawn("sleep 30") {
        Ok(reader) => reader,
        Err(ReaderError::Spawn { .. }) => return,
        Err(e) => panic!("unexpected error: {e}"),
    };
    assert!(reader.pid().is_some());
    assert!(!reader.is_finished());

    let started = Instant::now();
    reader.terminate().unwrap();
    assert!(reader.wait_finished(Duration::from_secs(5)));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(reader.read(), "");
}

#[test]
fn output_printed_while_exiting_survives_terminate() {
    let command = "/bin/sh -c 'trap \"echo bye; exit 0\" TERM; echo ready; while :; do sleep 0.1; done'";
    let reader = match AsyncProcessReader::spawn(command) {
        Ok(reader) => reader,
        Err(ReaderError::Spawn { .. }) => return,
        Err(e) => panic!("unexpected error: {e}"),
    };

    // The trap is installed once "ready" is out.
    let mut seen = String::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !seen.contains("ready") && Instant::now() < deadline {
        seen.push_str(&reader.read());
        thread::sleep(Duration::from_millis(10));
    }
    assert!(seen.contains("ready"), "no startup line: {seen:?}");

    reader.terminate().unwrap();
    assert!(reader.wait_finished(Duration::from_secs(5)));
    assert_eq!(reader.read().replace('\r', ""), "bye\n");
}

#[test]
fn quoted_arguments_stay_together() {
    let reader = match AsyncProcessReader::spawn("/bin/echo 'two words'") {
        Ok(reader) => reader,
        Err(ReaderError::Spawn { .. }) => return,
        Err(e) => panic!("unexpected error: {e}"),
    };
    assert!(reader.wait_finished(Duration::from_secs(5)));
    assert_eq!(reader.read().replace('\r', ""), "two words\n");
}
