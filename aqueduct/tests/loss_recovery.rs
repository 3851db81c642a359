//! Loss-recovery pipeline: gap detection, NAK, retransmission, repair.
//!
//! Drives the receive-side state machines directly against a publisher
//! log, dropping a frame in the middle, and checks that the NAK /
//! retransmit loop converges with no duplicates and no reordering.

use std::time::Duration;

use aqueduct::buffer::LogBuffers;
use aqueduct::buffer::log::Append;
use aqueduct::driver::image::{DriverImage, PacketOutcome};
use aqueduct::driver::loss::{LossDetector, StaticDelayGenerator};
use aqueduct::driver::retransmit::RetransmitHandler;
use aqueduct::net::{Endpoint, UdpChannel};
use aqueduct::protocol::frame::{self, Frame};

const TERM_LENGTH: usize = 64 * 1024;
const SESSION_ID: u32 = 77;
const STREAM_ID: u32 = 5;
const INITIAL_TERM_ID: u32 = 1000;

fn publisher_log(dir: &std::path::Path) -> LogBuffers {
    LogBuffers::create(dir, TERM_LENGTH, INITIAL_TERM_ID, SESSION_ID, STREAM_ID, 1408).unwrap()
}

fn image_for(dir: &std::path::Path) -> DriverImage {
    let channel = UdpChannel::parse("udp://127.0.0.1:40125").unwrap();
    let log =
        LogBuffers::create(dir, TERM_LENGTH, INITIAL_TERM_ID, SESSION_ID, STREAM_ID, 1408).unwrap();
    DriverImage::new(1, channel, Endpoint::localhost(50000), log, 0, 0)
}

/// Collects the wire frames a publisher log currently holds.
fn wire_frames(log: &LogBuffers) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    log.scan(0, u64::MAX, usize::MAX, |frame_bytes| {
        frames.push(frame_bytes.to_vec());
        true
    });
    frames
}

fn deliver(image: &DriverImage, frame_bytes: &[u8], now_ns: u64) -> PacketOutcome {
    match frame::decode(frame_bytes).unwrap() {
        Frame::Data { header, .. } | Frame::Pad { header } => {
            image.insert_packet(header.term_id, header.term_offset, frame_bytes, now_ns)
        }
        other => panic!("unexpected frame {other:?}"),
    }
}

#[test]
fn nak_retransmit_loop_converges() {
    let scratch = tempfile::tempdir().unwrap();
    let publisher = publisher_log(&scratch.path().join("publication"));
    let image = image_for(&scratch.path().join("image"));

    for payload in [b"first".as_slice(), b"second", b"third"] {
        assert!(matches!(publisher.append(payload, u64::MAX), Append::Position(_)));
    }
    let frames = wire_frames(&publisher);
    assert_eq!(frames.len(), 3);

    // The middle frame is lost on the wire.
    deliver(&image, &frames[0], 1);
    deliver(&image, &frames[2], 2);
    image.rebuild();
    assert_eq!(image.rebuild_position(), 64);
    assert_eq!(image.hwm_position(), 192);

    // The loss detector reports the gap as a NAK.
    let mut detector = LossDetector::new(Box::new(StaticDelayGenerator::new(Duration::ZERO)));
    let mut naks = Vec::new();
    detector.scan(
        &image.log,
        image.rebuild_position(),
        image.hwm_position(),
        10,
        |gap| naks.push(gap),
    );
    assert_eq!(naks.len(), 1);
    let gap = naks[0];
    assert_eq!(gap.term_id, INITIAL_TERM_ID);
    assert_eq!(gap.term_offset, 64);
    assert_eq!(gap.length, 64);

    // The publisher's retransmit handler answers from the live log.
    let mut retransmit = RetransmitHandler::new(Duration::ZERO, Duration::from_millis(60));
    retransmit.on_nak(gap.term_id, gap.term_offset, gap.length, 20);
    let mut resent = Vec::new();
    retransmit.poll(20, |term_id, term_offset, length| {
        publisher.scan(
            u64::from(term_offset),
            u64::from(term_offset) + u64::from(length),
            usize::MAX,
            |frame_bytes| {
                resent.push(frame_bytes.to_vec());
                true
            },
        );
        assert_eq!(term_id, INITIAL_TERM_ID);
    });
    assert_eq!(resent.len(), 1);

    // Repair fills the gap; a duplicate repair is dropped.
    assert!(matches!(deliver(&image, &resent[0], 30), PacketOutcome::Inserted(_)));
    assert_eq!(deliver(&image, &resent[0], 31), PacketOutcome::Duplicate);

    image.rebuild();
    assert_eq!(image.rebuild_position(), 192);

    // No gap remains, so the detector goes quiet.
    let count = detector.scan(
        &image.log,
        image.rebuild_position(),
        image.hwm_position(),
        40,
        |_| panic!("no further NAK expected"),
    );
    assert_eq!(count, 0);

    // The stream reads back complete and ordered.
    let mut received = Vec::new();
    image.log.poll(0, 16, |payload, _| received.push(payload.to_vec()));
    assert_eq!(
        received,
        vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
    );
}
