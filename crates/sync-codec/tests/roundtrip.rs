//! Cross-module property tests for the field codec and frame transport.

use proptest::prelude::*;
use sync_codec::{encode_frame, try_decode_frame, MessageReader, MessageWriter, Version, DEFAULT_MAX_FRAME_LEN};
use uuid::Uuid;

proptest! {
    #[test]
    fn bytes_field_round_trips(data in proptest::collection::vec(any::<u8>(), 0..512)) {
        let mut w = MessageWriter::new();
        w.write_bytes(&data);
        let bytes = w.into_bytes();
        let mut r = MessageReader::new(&bytes);
        prop_assert_eq!(r.read_bytes().unwrap(), data);
    }

    #[test]
    fn string_field_round_trips(s in "\\PC*") {
        let mut w = MessageWriter::new();
        w.write_str(&s);
        let bytes = w.into_bytes();
        let mut r = MessageReader::new(&bytes);
        prop_assert_eq!(r.read_str().unwrap(), s);
    }

    #[test]
    fn version_ordering_is_lexicographic(a in proptest::collection::vec(0u32..5, 1..4), b in proptest::collection::vec(0u32..5, 1..4)) {
        let va = Version::new(a.clone());
        let vb = Version::new(b.clone());
        prop_assert_eq!(va.cmp(&vb), a.cmp(&b));
    }

    #[test]
    fn frame_round_trips_arbitrary_payload(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let mut framed = encode_frame(&data);
        let decoded = try_decode_frame(&mut framed, DEFAULT_MAX_FRAME_LEN).unwrap().unwrap();
        prop_assert_eq!(&decoded[..], &data[..]);
    }

    #[test]
    fn list_of_u32_round_trips(items in proptest::collection::vec(any::<u32>(), 0..64)) {
        let mut w = MessageWriter::new();
        w.write_list(&items, |w, item| { w.write_u32(*item); });
        let bytes = w.into_bytes();
        let mut r = MessageReader::new(&bytes);
        let decoded = r.read_list(|r| r.read_u32()).unwrap();
        prop_assert_eq!(decoded, items);
    }
}

#[test]
fn uuid_field_round_trips() {
    let id = Uuid::new_v4();
    let mut w = MessageWriter::new();
    w.write_uuid(&id);
    let bytes = w.into_bytes();
    let mut r = MessageReader::new(&bytes);
    assert_eq!(r.read_uuid().unwrap(), id);
}

#[test]
fn option_field_round_trips_both_variants() {
    for value in [Some(42u32), None] {
        let mut w = MessageWriter::new();
        w.write_option(&value, |w, v| {
            w.write_u32(*v);
        });
        let bytes = w.into_bytes();
        let mut r = MessageReader::new(&bytes);
        let decoded = r.read_option(|r| r.read_u32()).unwrap();
        assert_eq!(decoded, value);
    }
}

#[test]
fn invalid_utf8_in_string_field_is_rejected() {
    let mut w = MessageWriter::new();
    w.write_bytes(&[0xFF, 0xFE, 0xFD]);
    let bytes = w.into_bytes();
    let mut r = MessageReader::new(&bytes);
    assert!(r.read_str().is_err());
}

#[test]
fn truncated_message_is_malformed_not_panicking() {
    let mut w = MessageWriter::new();
    w.write_u32(100); // claims 100 bytes follow but none do
    let bytes = w.into_bytes();
    let mut r = MessageReader::new(&bytes);
    assert!(r.read_bytes().is_err());
}
