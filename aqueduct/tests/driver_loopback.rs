//! End-to-end loopback tests: a full driver, a publisher appending into
//! its mapped log, and a subscription receiving the stream back over
//! localhost UDP.

use std::path::Path;
use std::time::{Duration, Instant};

use aqueduct::buffer::LogBuffers;
use aqueduct::buffer::counters::CountersReader;
use aqueduct::buffer::log::Append;
use aqueduct::buffer::MappedFile;
use aqueduct::client::{DriverEventDispatcher, DriverListener, DriverProxy, DriverResponse};
use aqueduct::config::DriverConfig;
use aqueduct::driver::{DriverPaths, MediaDriver};
use aqueduct::protocol::control::{ErrorCode, NewImageEvent, NewPublicationEvent};
use aqueduct::protocol::frame::flags;

const STREAM_ID: u32 = 10;
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Recording {
    images: Vec<NewImageEvent>,
}

impl DriverListener for Recording {
    fn on_new_image(&mut self, event: &NewImageEvent) {
        self.images.push(event.clone());
    }
}

fn test_config(dir: &Path) -> DriverConfig {
    DriverConfig {
        dir: dir.to_path_buf(),
        term_length: 64 * 1024,
        client_liveness_timeout: Duration::from_secs(30),
        ..Default::default()
    }
}

/// Reserves a free localhost UDP port.
fn free_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

fn counters_for(dir: &Path) -> (CountersReader, MappedFile) {
    let paths = DriverPaths::new(dir);
    let map = MappedFile::open_existing(&paths.counters_values()).unwrap();
    (CountersReader::new(map.buffer()), map)
}

/// Establishes a publication and a co-located subscription over
/// loopback, returning everything a data-path test needs.
struct Loopback {
    driver: Option<MediaDriver>,
    proxy: DriverProxy,
    publication: NewPublicationEvent,
    image: NewImageEvent,
    counters: CountersReader,
    _counters_map: MappedFile,
}

impl Loopback {
    fn establish(dir: &Path) -> Self {
        let driver = MediaDriver::launch(test_config(dir)).unwrap();
        let mut dispatcher = DriverEventDispatcher::connect(dir).unwrap();
        let proxy = DriverProxy::connect(dir).unwrap();
        let channel = format!("udp://127.0.0.1:{}", free_port());

        let mut listener = Recording::default();

        let correlation = proxy.add_subscription(&channel, STREAM_ID).unwrap();
        let response = dispatcher
            .await_response(correlation, TEST_TIMEOUT, &mut listener)
            .unwrap();
        assert_eq!(response, DriverResponse::Succeeded);

        let correlation = proxy.add_publication(&channel, STREAM_ID).unwrap();
        let response = dispatcher
            .await_response(correlation, TEST_TIMEOUT, &mut listener)
            .unwrap();
        let publication = match response {
            DriverResponse::NewPublication(event) => event,
            other => panic!("expected new publication, got {other:?}"),
        };
        assert_eq!(publication.correlation_id, correlation);
        assert_eq!(publication.stream_id, STREAM_ID);
        assert!(Path::new(&publication.log_dir).join("meta").exists());

        // The sender's SETUP cadence creates the image; wait for the
        // event to fan out.
        let deadline = Instant::now() + TEST_TIMEOUT;
        while listener.images.is_empty() {
            assert!(Instant::now() < deadline, "image never appeared");
            dispatcher.poll(&mut listener, 0).unwrap();
            proxy.send_keepalive().unwrap();
            std::thread::sleep(Duration::from_millis(10));
        }
        let image = listener.images.remove(0);
        assert_eq!(image.session_id, publication.session_id);
        assert_eq!(image.stream_id, STREAM_ID);

        let (counters, counters_map) = counters_for(dir);

        Self {
            driver: Some(driver),
            proxy,
            publication,
            image,
            counters,
            _counters_map: counters_map,
        }
    }

    /// Appends one message, retrying around flow-control back-pressure.
    fn offer(&self, log: &LogBuffers, payload: &[u8]) {
        let deadline = Instant::now() + TEST_TIMEOUT;
        loop {
            let limit = self.counters.get(self.publication.limit_counter);
            match log.append(payload, limit) {
                Append::Position(_) => return,
                Append::BackPressured | Append::AdminAction => {
                    assert!(Instant::now() < deadline, "append back-pressured forever");
                    std::thread::sleep(Duration::from_millis(1));
                }
                Append::MessageTooLong { length, max } => {
                    panic!("message of {length} exceeds {max}")
                }
            }
        }
    }

    fn shutdown(mut self) {
        self.driver.take().unwrap().shutdown();
    }
}

#[test]
fn round_trip_delivers_messages_in_order() {
    let scratch = tempfile::tempdir().unwrap();
    let dir = scratch.path().join("driver");
    let loopback = Loopback::establish(&dir);

    let publication_log = LogBuffers::open(Path::new(&loopback.publication.log_dir)).unwrap();
    let image_log = LogBuffers::open(Path::new(&loopback.image.log_dir)).unwrap();

    const MESSAGES: usize = 1_000;
    let expected: Vec<Vec<u8>> = (0..MESSAGES)
        .map(|i| format!("message-{i:06}").into_bytes())
        .collect();

    for payload in &expected {
        loopback.offer(&publication_log, payload);
    }

    // Poll the image log, advancing the subscriber position counter so
    // status messages keep the window open.
    let mut received: Vec<Vec<u8>> = Vec::new();
    let mut position = loopback.image.join_position;
    let deadline = Instant::now() + TEST_TIMEOUT;
    while received.len() < MESSAGES {
        assert!(
            Instant::now() < deadline,
            "only {} of {MESSAGES} messages arrived",
            received.len()
        );
        let new_position = image_log.poll(position, 64, |payload, message_flags| {
            assert_eq!(message_flags, flags::UNFRAGMENTED);
            received.push(payload.to_vec());
        });
        if new_position != position {
            position = new_position;
            loopback
                .counters
                .set(loopback.image.subscriber_position_counter, position);
        } else {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    // Byte-identical, in order, exactly once.
    assert_eq!(received, expected);

    loopback.shutdown();
    assert!(!dir.exists());
}

#[test]
fn large_messages_fragment_and_reassemble() {
    let scratch = tempfile::tempdir().unwrap();
    let dir = scratch.path().join("driver");
    let loopback = Loopback::establish(&dir);

    let publication_log = LogBuffers::open(Path::new(&loopback.publication.log_dir)).unwrap();
    let image_log = LogBuffers::open(Path::new(&loopback.image.log_dir)).unwrap();

    // Larger than one MTU: travels as BEGIN / interior / END fragments.
    let message: Vec<u8> = (0..5_000u32).map(|i| (i % 251) as u8).collect();
    loopback.offer(&publication_log, &message);

    let mut reassembled = Vec::new();
    let mut complete = false;
    let mut position = loopback.image.join_position;
    let deadline = Instant::now() + TEST_TIMEOUT;
    while !complete {
        assert!(Instant::now() < deadline, "message never reassembled");
        let new_position = image_log.poll(position, 16, |payload, message_flags| {
            if message_flags & flags::BEGIN != 0 {
                reassembled.clear();
            }
            reassembled.extend_from_slice(payload);
            if message_flags & flags::END != 0 {
                complete = true;
            }
        });
        if new_position != position {
            position = new_position;
            loopback
                .counters
                .set(loopback.image.subscriber_position_counter, position);
        } else {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    assert_eq!(reassembled, message);
    loopback.shutdown();
}

#[test]
fn duplicate_publication_is_rejected_with_correlation() {
    let scratch = tempfile::tempdir().unwrap();
    let dir = scratch.path().join("driver");
    let driver = MediaDriver::launch(test_config(&dir)).unwrap();

    let mut dispatcher = DriverEventDispatcher::connect(&dir).unwrap();
    let proxy = DriverProxy::connect(&dir).unwrap();
    let channel = format!("udp://127.0.0.1:{}", free_port());
    let mut listener = Recording::default();

    let first = proxy.add_publication(&channel, STREAM_ID).unwrap();
    let response = dispatcher
        .await_response(first, TEST_TIMEOUT, &mut listener)
        .unwrap();
    assert!(matches!(response, DriverResponse::NewPublication(_)));

    let second = proxy.add_publication(&channel, STREAM_ID).unwrap();
    let response = dispatcher
        .await_response(second, TEST_TIMEOUT, &mut listener)
        .unwrap();
    match response {
        DriverResponse::Error { code, .. } => {
            assert_eq!(code, ErrorCode::PublicationChannelAlreadyExists);
        }
        other => panic!("expected an error response, got {other:?}"),
    }

    driver.shutdown();
}

#[test]
fn malformed_channel_is_rejected() {
    let scratch = tempfile::tempdir().unwrap();
    let dir = scratch.path().join("driver");
    let driver = MediaDriver::launch(test_config(&dir)).unwrap();

    let mut dispatcher = DriverEventDispatcher::connect(&dir).unwrap();
    let proxy = DriverProxy::connect(&dir).unwrap();
    let mut listener = Recording::default();

    let correlation = proxy.add_publication("tcp://nowhere:1", STREAM_ID).unwrap();
    let response = dispatcher
        .await_response(correlation, TEST_TIMEOUT, &mut listener)
        .unwrap();
    match response {
        DriverResponse::Error { code, .. } => {
            assert_eq!(code, ErrorCode::InvalidDestinationInPublication);
        }
        other => panic!("expected an error response, got {other:?}"),
    }

    driver.shutdown();
}

#[test]
fn remove_publication_succeeds_and_unknown_fails() {
    let scratch = tempfile::tempdir().unwrap();
    let dir = scratch.path().join("driver");
    let driver = MediaDriver::launch(test_config(&dir)).unwrap();

    let mut dispatcher = DriverEventDispatcher::connect(&dir).unwrap();
    let proxy = DriverProxy::connect(&dir).unwrap();
    let channel = format!("udp://127.0.0.1:{}", free_port());
    let mut listener = Recording::default();

    let correlation = proxy.add_publication(&channel, STREAM_ID).unwrap();
    dispatcher
        .await_response(correlation, TEST_TIMEOUT, &mut listener)
        .unwrap();

    let correlation = proxy.remove_publication(&channel, STREAM_ID).unwrap();
    let response = dispatcher
        .await_response(correlation, TEST_TIMEOUT, &mut listener)
        .unwrap();
    assert_eq!(response, DriverResponse::Succeeded);

    // Removing it again: nothing left to remove.
    let correlation = proxy.remove_publication(&channel, STREAM_ID).unwrap();
    let response = dispatcher
        .await_response(correlation, TEST_TIMEOUT, &mut listener)
        .unwrap();
    match response {
        DriverResponse::Error { code, .. } => {
            assert_eq!(code, ErrorCode::PublicationChannelUnknown);
        }
        other => panic!("expected an error response, got {other:?}"),
    }

    driver.shutdown();
}

#[test]
fn stream_survives_term_rotation() {
    let scratch = tempfile::tempdir().unwrap();
    let dir = scratch.path().join("driver");
    let loopback = Loopback::establish(&dir);

    let publication_log = LogBuffers::open(Path::new(&loopback.publication.log_dir)).unwrap();
    let image_log = LogBuffers::open(Path::new(&loopback.image.log_dir)).unwrap();

    // Push several terms' worth of data through a 64 KiB term so the
    // stream rotates repeatedly while the subscriber keeps up.
    const MESSAGES: usize = 400;
    let payload = vec![0x5au8; 1000];

    let mut received = 0usize;
    let mut offered = 0usize;
    let mut position = loopback.image.join_position;
    let deadline = Instant::now() + Duration::from_secs(30);
    while received < MESSAGES {
        assert!(
            Instant::now() < deadline,
            "stalled after {received} of {MESSAGES} messages"
        );
        if offered < MESSAGES {
            let limit = loopback.counters.get(loopback.publication.limit_counter);
            if let Append::Position(_) = publication_log.append(&payload, limit) {
                offered += 1;
            }
        }
        let new_position = image_log.poll(position, 64, |received_payload, _| {
            assert_eq!(received_payload, payload.as_slice());
            received += 1;
        });
        if new_position != position {
            position = new_position;
            loopback
                .counters
                .set(loopback.image.subscriber_position_counter, position);
        }
        loopback.proxy.send_keepalive().unwrap();
    }

    assert!(
        position > 64 * 1024,
        "stream should have crossed at least one term boundary"
    );

    loopback.shutdown();
}
