use reef_wire::{
    encode_frame, ByteSink, Frame, FrameBuilder, FrameQueue, FrameReader, MsgHead, PkgType,
    Protocol, SliceSource, WireError,
};

use std::io;

#[derive(Default)]
struct Collector {
    frames: Vec<(PkgType, MsgHead, Frame)>,
}

impl Protocol for Collector {
    fn publish(&mut self, pkg: PkgType, head: &MsgHead, frame: Frame) -> Result<(), WireError> {
        self.frames.push((pkg, *head, frame));
        Ok(())
    }
}

#[test]
fn one_frame_byte_at_a_time() {
    let bytes = encode_frame(PkgType::Request, 0x2a, 0x1234, b"", &[1, 2, 3], b"").unwrap();

    let mut reader = FrameReader::new();
    let mut proto = Collector::default();
    for byte in &bytes {
        let mut src = SliceSource::new(std::slice::from_ref(byte), 1);
        reader.read(&mut src, &mut proto).unwrap();
    }

    assert_eq!(proto.frames.len(), 1, "exactly one publish");
    let (pkg, head, frame) = &proto.frames[0];
    assert_eq!(*pkg, PkgType::Request);
    assert_eq!(head.msg_type, 0x2a);
    assert_eq!(head.msg_id, 0x1234);
    assert_eq!(head.fwd_length, 0);
    assert_eq!(head.body_length, 3);
    assert_eq!(head.data_length, 0);
    assert_eq!(frame.body, vec![1, 2, 3]);
    assert!(frame.fwd.is_empty());
    assert!(frame.data.is_empty());
}

#[test]
fn back_to_back_frames_in_one_buffer() {
    let mut bytes = Vec::new();
    for id in 0..5u64 {
        bytes.extend(encode_frame(PkgType::Request, 7, id, b"f", b"body", &[id as u8; 3]).unwrap());
    }

    // deliver in awkward chunk sizes to exercise resumption everywhere
    for chunk in [1usize, 2, 3, 7, 64] {
        let mut reader = FrameReader::new();
        let mut proto = Collector::default();
        let mut src = SliceSource::new(&bytes, chunk);
        reader.read(&mut src, &mut proto).unwrap();

        assert_eq!(proto.frames.len(), 5, "chunk size {chunk}");
        for (id, (_, head, frame)) in proto.frames.iter().enumerate() {
            assert_eq!(head.msg_id, id as u64);
            assert_eq!(frame.fwd, b"f");
            assert_eq!(frame.body, b"body");
            assert_eq!(frame.data, vec![id as u8; 3]);
        }
    }
}

#[test]
fn large_payload_frame() {
    let data = vec![0xabu8; 300_000];
    let bytes = encode_frame(PkgType::Push, 9, 42, b"", b"", &data).unwrap();

    let mut reader = FrameReader::new();
    let mut proto = Collector::default();
    let mut src = SliceSource::new(&bytes, 4096);
    reader.read(&mut src, &mut proto).unwrap();

    assert_eq!(proto.frames.len(), 1);
    assert_eq!(proto.frames[0].2.data, data);
}

#[test]
fn reserved_package_type_poisons_the_reader() {
    let mut bytes = encode_frame(PkgType::Request, 1, 1, b"", b"x", b"").unwrap();
    bytes[0] = (bytes[0] & 0x0f) | (0xf << 4);

    let mut reader = FrameReader::new();
    let mut proto = Collector::default();
    let mut src = SliceSource::new(&bytes, 64);
    assert!(matches!(
        reader.read(&mut src, &mut proto),
        Err(WireError::BadPackageType(0xf))
    ));

    // the failure state absorbs further reads
    let more = encode_frame(PkgType::Request, 1, 2, b"", b"", b"").unwrap();
    let mut src = SliceSource::new(&more, 64);
    assert!(matches!(
        reader.read(&mut src, &mut proto),
        Err(WireError::Failed)
    ));
    assert!(proto.frames.is_empty());
}

struct VecSink {
    bytes: Vec<u8>,
    budget: usize,
}

impl ByteSink for VecSink {
    fn writev(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        if self.budget == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let mut written = 0;
        for buf in bufs {
            let take = buf.len().min(self.budget - written);
            self.bytes.extend_from_slice(&buf[..take]);
            written += take;
            if written == self.budget {
                break;
            }
        }
        Ok(written)
    }
}

#[test]
fn builder_patches_lengths_and_queue_drains() {
    let mut builder = FrameBuilder::begin(PkgType::Response, 0x2a, 99, b"fwd", 1000, 1000).unwrap();
    builder.add(b"response-body");
    builder.add_ref(reef_buf::ByteRef::from_vec(vec![0x55u8; 200]));
    let frame = builder.finish(13, 200);

    let mut queue = FrameQueue::new();
    queue.push(frame);
    assert!(queue.has_data());

    // drain through a sink that takes 10 bytes per call
    let mut sink = VecSink { bytes: Vec::new(), budget: 0 };
    let mut done = false;
    while !done {
        sink.budget = 10;
        done = queue.flush(&mut sink).unwrap();
    }
    assert!(!queue.has_data());

    // what went out must parse back as the same frame
    let mut reader = FrameReader::new();
    let mut proto = Collector::default();
    let mut src = SliceSource::new(&sink.bytes, 4096);
    reader.read(&mut src, &mut proto).unwrap();

    assert_eq!(proto.frames.len(), 1);
    let (pkg, head, frame) = &proto.frames[0];
    assert_eq!(*pkg, PkgType::Response);
    assert_eq!(head.msg_type, 0x2a);
    assert_eq!(head.msg_id, 99);
    assert_eq!(frame.fwd, b"fwd");
    assert_eq!(frame.body, b"response-body");
    assert_eq!(frame.data, vec![0x55u8; 200]);
}
