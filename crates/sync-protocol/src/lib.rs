//! The wire message catalogue exchanged between the client connector and the
//! server session handler, layered on top of the field codec and framing
//! transport.
//!
//! A [`Message`] is encoded as a tag followed by its fields in declaration
//! order ([`Message::encode`]/[`Message::decode`]); a handful of messages
//! that a device uses to prove possession of a private key additionally
//! carry a trailing signature, handled by [`encode_signed`]/
//! [`decode_with_verify`] rather than baked into the field list itself.

mod codec;
mod error_type;
mod message;

pub use codec::{decode, decode_with_verify, encode, encode_signed};
pub use error_type::ErrorType;
pub use message::{
    Accept, AcceptAck, Access, Account, Change, ChangeAck, Changed, ChangedAck, DeviceChange,
    DeviceChangeAck, DeviceInfoEntry, DeviceKeyEntry, DeviceKeys, Devices, Deny, ErrorMessage,
    Grant, Identify, KeyChange, KeyUpdateEntry, Login, MacUpdate, Message, NewKey, NewKeyAck,
    Proof, Register, RemoveAck, Remove, Welcome,
};

#[cfg(test)]
mod tests {
    use super::*;
    use sync_codec::{protocol_version, Version};
    use uuid::Uuid;

    #[test]
    fn unsigned_message_round_trips() {
        let msg = Message::Change(Change {
            data_id: b"abc".to_vec(),
            key_index: 3,
            salt: vec![1, 2, 3],
            ciphertext: vec![9, 9, 9, 9],
        });
        let bytes = encode(&msg);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn empty_payload_messages_round_trip() {
        for msg in [Message::Sync, Message::LastChanged, Message::ListDevices, Message::MacUpdateAck] {
            let bytes = encode(&msg);
            assert_eq!(decode(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn signed_message_round_trips_with_verify() {
        let msg = Message::Login(Login {
            protocol_version: protocol_version(),
            nonce: vec![1, 2, 3, 4],
            device_id: Uuid::new_v4(),
            device_name: "laptop".to_string(),
        });
        let bytes = encode_signed(&msg, |_signed_bytes| [7u8; 64]);
        let decoded = decode_with_verify(&bytes, |_signed_bytes, sig| *sig == [7u8; 64]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn signed_message_rejects_bad_signature() {
        let msg = Message::Login(Login {
            protocol_version: protocol_version(),
            nonce: vec![1, 2, 3, 4],
            device_id: Uuid::new_v4(),
            device_name: "laptop".to_string(),
        });
        let bytes = encode_signed(&msg, |_| [7u8; 64]);
        let result = decode_with_verify(&bytes, |_, _| false);
        assert!(result.is_err());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut w = sync_codec::MessageWriter::new();
        w.write_tag("NotARealMessage");
        let bytes = w.into_bytes();
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn error_message_round_trips_every_variant() {
        let variants = [
            ErrorType::IncompatibleVersion,
            ErrorType::UnexpectedMessage,
            ErrorType::ServerError,
            ErrorType::ClientError,
            ErrorType::AuthenticationError,
            ErrorType::AccessError,
            ErrorType::KeyIndexError,
            ErrorType::KeyPendingError,
            ErrorType::QuotaHitError,
        ];
        for error_type in variants {
            let msg = Message::Error(ErrorMessage {
                error_type,
                message: "boom".to_string(),
                can_recover: error_type.default_recoverable(),
            });
            let bytes = encode(&msg);
            assert_eq!(decode(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn version_in_identify_round_trips() {
        let msg = Message::Identify(Identify {
            protocol_version: Version::new([1, 2, 3]),
            nonce: vec![0u8; 16],
            upload_limit: 4096,
        });
        let bytes = encode(&msg);
        assert_eq!(decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn list_fields_round_trip() {
        let msg = Message::Devices(Devices {
            devices: vec![
                DeviceInfoEntry { device_id: Uuid::new_v4(), name: "phone".into(), fingerprint: vec![1, 2] },
                DeviceInfoEntry { device_id: Uuid::new_v4(), name: "desktop".into(), fingerprint: vec![3, 4] },
            ],
        });
        let bytes = encode(&msg);
        assert_eq!(decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn optional_field_round_trips_both_variants() {
        for change_estimate in [Some(42u64), None] {
            let msg = Message::Changed(Changed {
                blob_id: 1,
                key_index: 0,
                salt: vec![],
                ciphertext: vec![1],
                change_estimate,
            });
            let bytes = encode(&msg);
            assert_eq!(decode(&bytes).unwrap(), msg);
        }
    }
}
