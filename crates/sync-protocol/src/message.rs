use crate::ErrorType;
use sync_codec::{CodecError, CodecResult, MessageReader, MessageWriter, Version};
use uuid::Uuid;

/// One entry of the sibling device key list carried by `DeviceKeys`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceKeyEntry {
    pub device_id: Uuid,
    pub crypt_scheme: String,
    pub crypt_key: Vec<u8>,
    pub key_mac: Vec<u8>,
}

/// One entry of the per-sibling wrapped-key list carried by `NewKey`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyUpdateEntry {
    pub device_id: Uuid,
    pub wrapped_key: Vec<u8>,
    pub cmac: Vec<u8>,
}

/// One entry of the device list carried by `Devices`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfoEntry {
    pub device_id: Uuid,
    pub name: String,
    pub fingerprint: Vec<u8>,
}

macro_rules! fields {
    ($name:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            $(pub $field: $ty),*
        }
    };
}

fields!(Identify { protocol_version: Version, nonce: Vec<u8>, upload_limit: u32 });
fields!(Register {
    protocol_version: Version,
    nonce: Vec<u8>,
    sign_scheme: String,
    sign_pub_key: Vec<u8>,
    crypt_scheme: String,
    crypt_pub_key: Vec<u8>,
    device_name: String,
    cmac: Vec<u8>,
});
fields!(Login {
    protocol_version: Version,
    nonce: Vec<u8>,
    device_id: Uuid,
    device_name: String,
});
fields!(Access {
    protocol_version: Version,
    nonce: Vec<u8>,
    sign_scheme: String,
    sign_pub_key: Vec<u8>,
    crypt_scheme: String,
    crypt_pub_key: Vec<u8>,
    device_name: String,
    p_nonce: Vec<u8>,
    partner_id: Uuid,
    mac_scheme: String,
    cmac: Vec<u8>,
    trustmac: Vec<u8>,
});
fields!(Account { device_id: Uuid });
fields!(Welcome {
    has_changes: bool,
    key_index: u32,
    scheme: String,
    wrapped_key: Vec<u8>,
    cmac: Vec<u8>,
});
fields!(Proof {
    p_nonce: Vec<u8>,
    new_device_id: Uuid,
    device_name: String,
    sign_scheme: String,
    sign_pub_key: Vec<u8>,
    crypt_scheme: String,
    crypt_pub_key: Vec<u8>,
    mac_scheme: String,
    cmac: Vec<u8>,
    trustmac: Vec<u8>,
});
fields!(Accept {
    new_device_id: Uuid,
    key_index: u32,
    scheme: String,
    wrapped_secret: Vec<u8>,
});
fields!(Deny { new_device_id: Uuid });
fields!(Grant {
    new_device_id: Uuid,
    key_index: u32,
    scheme: String,
    wrapped_secret: Vec<u8>,
});
fields!(AcceptAck { new_device_id: Uuid });
fields!(Change {
    data_id: Vec<u8>,
    key_index: u32,
    salt: Vec<u8>,
    ciphertext: Vec<u8>,
});
fields!(ChangeAck { data_id: Vec<u8> });
fields!(DeviceChange {
    data_id: Vec<u8>,
    key_index: u32,
    salt: Vec<u8>,
    ciphertext: Vec<u8>,
    target_device_id: Uuid,
});
fields!(DeviceChangeAck { data_id: Vec<u8>, target_device_id: Uuid });
fields!(Changed {
    blob_id: u64,
    key_index: u32,
    salt: Vec<u8>,
    ciphertext: Vec<u8>,
    change_estimate: Option<u64>,
});
fields!(ChangedAck { blob_id: u64 });
fields!(Devices { devices: Vec<DeviceInfoEntry> });
fields!(Remove { device_id: Uuid });
fields!(RemoveAck { device_id: Uuid });
fields!(MacUpdate { key_index: u32, cmac: Vec<u8> });
fields!(KeyChange { next_index: u32 });
fields!(DeviceKeys {
    key_index: u32,
    duplicated: bool,
    devices: Vec<DeviceKeyEntry>,
});
fields!(NewKey {
    key_index: u32,
    cmac: Vec<u8>,
    scheme: String,
    updates: Vec<KeyUpdateEntry>,
});
fields!(NewKeyAck { key_index: u32 });
fields!(ErrorMessage { error_type: ErrorType, message: String, can_recover: bool });

/// Every message the protocol can carry, tagged by a short wire name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Identify(Identify),
    Register(Register),
    Login(Login),
    Access(Access),
    Account(Account),
    Welcome(Welcome),
    Proof(Proof),
    Accept(Accept),
    Deny(Deny),
    Grant(Grant),
    AcceptAck(AcceptAck),
    Sync,
    Change(Change),
    ChangeAck(ChangeAck),
    DeviceChange(DeviceChange),
    DeviceChangeAck(DeviceChangeAck),
    Changed(Changed),
    LastChanged,
    ChangedAck(ChangedAck),
    ListDevices,
    Devices(Devices),
    Remove(Remove),
    RemoveAck(RemoveAck),
    MacUpdate(MacUpdate),
    MacUpdateAck,
    KeyChange(KeyChange),
    DeviceKeys(DeviceKeys),
    NewKey(NewKey),
    NewKeyAck(NewKeyAck),
    Error(ErrorMessage),
}

impl Message {
    /// The short ASCII tag written at the head of every frame.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Identify(_) => "Identify",
            Message::Register(_) => "Register",
            Message::Login(_) => "Login",
            Message::Access(_) => "Access",
            Message::Account(_) => "Account",
            Message::Welcome(_) => "Welcome",
            Message::Proof(_) => "Proof",
            Message::Accept(_) => "Accept",
            Message::Deny(_) => "Deny",
            Message::Grant(_) => "Grant",
            Message::AcceptAck(_) => "AcceptAck",
            Message::Sync => "Sync",
            Message::Change(_) => "Change",
            Message::ChangeAck(_) => "ChangeAck",
            Message::DeviceChange(_) => "DeviceChange",
            Message::DeviceChangeAck(_) => "DeviceChangeAck",
            Message::Changed(_) => "Changed",
            Message::LastChanged => "LastChanged",
            Message::ChangedAck(_) => "ChangedAck",
            Message::ListDevices => "ListDevices",
            Message::Devices(_) => "Devices",
            Message::Remove(_) => "Remove",
            Message::RemoveAck(_) => "RemoveAck",
            Message::MacUpdate(_) => "MacUpdate",
            Message::MacUpdateAck => "MacUpdateAck",
            Message::KeyChange(_) => "KeyChange",
            Message::DeviceKeys(_) => "DeviceKeys",
            Message::NewKey(_) => "NewKey",
            Message::NewKeyAck(_) => "NewKeyAck",
            Message::Error(_) => "Error",
        }
    }

    /// Whether this message carries a trailing signature on the wire.
    /// Exactly the messages a device sends to prove it holds a private key:
    /// the three authentication entry points and the two rotation/enrollment
    /// commitments.
    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            Message::Register(_) | Message::Login(_) | Message::Access(_) | Message::Accept(_) | Message::NewKey(_)
        )
    }

    fn write_fields(&self, w: &mut MessageWriter) {
        match self {
            Message::Identify(m) => {
                w.write_version(&m.protocol_version);
                w.write_bytes(&m.nonce);
                w.write_u32(m.upload_limit);
            }
            Message::Register(m) => {
                w.write_version(&m.protocol_version);
                w.write_bytes(&m.nonce);
                w.write_str(&m.sign_scheme);
                w.write_bytes(&m.sign_pub_key);
                w.write_str(&m.crypt_scheme);
                w.write_bytes(&m.crypt_pub_key);
                w.write_str(&m.device_name);
                w.write_bytes(&m.cmac);
            }
            Message::Login(m) => {
                w.write_version(&m.protocol_version);
                w.write_bytes(&m.nonce);
                w.write_uuid(&m.device_id);
                w.write_str(&m.device_name);
            }
            Message::Access(m) => {
                w.write_version(&m.protocol_version);
                w.write_bytes(&m.nonce);
                w.write_str(&m.sign_scheme);
                w.write_bytes(&m.sign_pub_key);
                w.write_str(&m.crypt_scheme);
                w.write_bytes(&m.crypt_pub_key);
                w.write_str(&m.device_name);
                w.write_bytes(&m.p_nonce);
                w.write_uuid(&m.partner_id);
                w.write_str(&m.mac_scheme);
                w.write_bytes(&m.cmac);
                w.write_bytes(&m.trustmac);
            }
            Message::Account(m) => {
                w.write_uuid(&m.device_id);
            }
            Message::Welcome(m) => {
                w.write_bool(m.has_changes);
                w.write_u32(m.key_index);
                w.write_str(&m.scheme);
                w.write_bytes(&m.wrapped_key);
                w.write_bytes(&m.cmac);
            }
            Message::Proof(m) => {
                w.write_bytes(&m.p_nonce);
                w.write_uuid(&m.new_device_id);
                w.write_str(&m.device_name);
                w.write_str(&m.sign_scheme);
                w.write_bytes(&m.sign_pub_key);
                w.write_str(&m.crypt_scheme);
                w.write_bytes(&m.crypt_pub_key);
                w.write_str(&m.mac_scheme);
                w.write_bytes(&m.cmac);
                w.write_bytes(&m.trustmac);
            }
            Message::Accept(m) => {
                w.write_uuid(&m.new_device_id);
                w.write_u32(m.key_index);
                w.write_str(&m.scheme);
                w.write_bytes(&m.wrapped_secret);
            }
            Message::Deny(m) => {
                w.write_uuid(&m.new_device_id);
            }
            Message::Grant(m) => {
                w.write_uuid(&m.new_device_id);
                w.write_u32(m.key_index);
                w.write_str(&m.scheme);
                w.write_bytes(&m.wrapped_secret);
            }
            Message::AcceptAck(m) => {
                w.write_uuid(&m.new_device_id);
            }
            Message::Sync => {}
            Message::Change(m) => {
                w.write_bytes(&m.data_id);
                w.write_u32(m.key_index);
                w.write_bytes(&m.salt);
                w.write_bytes(&m.ciphertext);
            }
            Message::ChangeAck(m) => {
                w.write_bytes(&m.data_id);
            }
            Message::DeviceChange(m) => {
                w.write_bytes(&m.data_id);
                w.write_u32(m.key_index);
                w.write_bytes(&m.salt);
                w.write_bytes(&m.ciphertext);
                w.write_uuid(&m.target_device_id);
            }
            Message::DeviceChangeAck(m) => {
                w.write_bytes(&m.data_id);
                w.write_uuid(&m.target_device_id);
            }
            Message::Changed(m) => {
                w.write_u64(m.blob_id);
                w.write_u32(m.key_index);
                w.write_bytes(&m.salt);
                w.write_bytes(&m.ciphertext);
                w.write_option(&m.change_estimate, |w, v| {
                    w.write_u64(*v);
                });
            }
            Message::LastChanged => {}
            Message::ChangedAck(m) => {
                w.write_u64(m.blob_id);
            }
            Message::ListDevices => {}
            Message::Devices(m) => {
                w.write_list(&m.devices, |w, d| {
                    w.write_uuid(&d.device_id);
                    w.write_str(&d.name);
                    w.write_bytes(&d.fingerprint);
                });
            }
            Message::Remove(m) => {
                w.write_uuid(&m.device_id);
            }
            Message::RemoveAck(m) => {
                w.write_uuid(&m.device_id);
            }
            Message::MacUpdate(m) => {
                w.write_u32(m.key_index);
                w.write_bytes(&m.cmac);
            }
            Message::MacUpdateAck => {}
            Message::KeyChange(m) => {
                w.write_u32(m.next_index);
            }
            Message::DeviceKeys(m) => {
                w.write_u32(m.key_index);
                w.write_bool(m.duplicated);
                w.write_list(&m.devices, |w, d| {
                    w.write_uuid(&d.device_id);
                    w.write_str(&d.crypt_scheme);
                    w.write_bytes(&d.crypt_key);
                    w.write_bytes(&d.key_mac);
                });
            }
            Message::NewKey(m) => {
                w.write_u32(m.key_index);
                w.write_bytes(&m.cmac);
                w.write_str(&m.scheme);
                w.write_list(&m.updates, |w, u| {
                    w.write_uuid(&u.device_id);
                    w.write_bytes(&u.wrapped_key);
                    w.write_bytes(&u.cmac);
                });
            }
            Message::NewKeyAck(m) => {
                w.write_u32(m.key_index);
            }
            Message::Error(m) => {
                m.error_type.write(w);
                w.write_str(&m.message);
                w.write_bool(m.can_recover);
            }
        }
    }

    /// Serialize tag + fields, with no trailing signature.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = MessageWriter::new();
        w.write_tag(self.tag());
        self.write_fields(&mut w);
        w.into_bytes()
    }

    /// Decode a tag + fields payload (the signature, if any, must already
    /// have been split off by the caller via [`sync_codec::split_signature`]).
    pub fn decode(payload: &[u8]) -> CodecResult<Message> {
        let mut r = MessageReader::new(payload);
        let tag = r.read_tag()?;
        decode_fields(&tag, &mut r)
    }
}

fn decode_fields(tag: &str, r: &mut MessageReader) -> CodecResult<Message> {
    Ok(match tag {
        "Identify" => Message::Identify(Identify {
            protocol_version: r.read_version()?,
            nonce: r.read_bytes()?,
            upload_limit: r.read_u32()?,
        }),
        "Register" => Message::Register(Register {
            protocol_version: r.read_version()?,
            nonce: r.read_bytes()?,
            sign_scheme: r.read_str()?,
            sign_pub_key: r.read_bytes()?,
            crypt_scheme: r.read_str()?,
            crypt_pub_key: r.read_bytes()?,
            device_name: r.read_str()?,
            cmac: r.read_bytes()?,
        }),
        "Login" => Message::Login(Login {
            protocol_version: r.read_version()?,
            nonce: r.read_bytes()?,
            device_id: r.read_uuid()?,
            device_name: r.read_str()?,
        }),
        "Access" => Message::Access(Access {
            protocol_version: r.read_version()?,
            nonce: r.read_bytes()?,
            sign_scheme: r.read_str()?,
            sign_pub_key: r.read_bytes()?,
            crypt_scheme: r.read_str()?,
            crypt_pub_key: r.read_bytes()?,
            device_name: r.read_str()?,
            p_nonce: r.read_bytes()?,
            partner_id: r.read_uuid()?,
            mac_scheme: r.read_str()?,
            cmac: r.read_bytes()?,
            trustmac: r.read_bytes()?,
        }),
        "Account" => Message::Account(Account { device_id: r.read_uuid()? }),
        "Welcome" => Message::Welcome(Welcome {
            has_changes: r.read_bool()?,
            key_index: r.read_u32()?,
            scheme: r.read_str()?,
            wrapped_key: r.read_bytes()?,
            cmac: r.read_bytes()?,
        }),
        "Proof" => Message::Proof(Proof {
            p_nonce: r.read_bytes()?,
            new_device_id: r.read_uuid()?,
            device_name: r.read_str()?,
            sign_scheme: r.read_str()?,
            sign_pub_key: r.read_bytes()?,
            crypt_scheme: r.read_str()?,
            crypt_pub_key: r.read_bytes()?,
            mac_scheme: r.read_str()?,
            cmac: r.read_bytes()?,
            trustmac: r.read_bytes()?,
        }),
        "Accept" => Message::Accept(Accept {
            new_device_id: r.read_uuid()?,
            key_index: r.read_u32()?,
            scheme: r.read_str()?,
            wrapped_secret: r.read_bytes()?,
        }),
        "Deny" => Message::Deny(Deny { new_device_id: r.read_uuid()? }),
        "Grant" => Message::Grant(Grant {
            new_device_id: r.read_uuid()?,
            key_index: r.read_u32()?,
            scheme: r.read_str()?,
            wrapped_secret: r.read_bytes()?,
        }),
        "AcceptAck" => Message::AcceptAck(AcceptAck { new_device_id: r.read_uuid()? }),
        "Sync" => Message::Sync,
        "Change" => Message::Change(Change {
            data_id: r.read_bytes()?,
            key_index: r.read_u32()?,
            salt: r.read_bytes()?,
            ciphertext: r.read_bytes()?,
        }),
        "ChangeAck" => Message::ChangeAck(ChangeAck { data_id: r.read_bytes()? }),
        "DeviceChange" => Message::DeviceChange(DeviceChange {
            data_id: r.read_bytes()?,
            key_index: r.read_u32()?,
            salt: r.read_bytes()?,
            ciphertext: r.read_bytes()?,
            target_device_id: r.read_uuid()?,
        }),
        "DeviceChangeAck" => Message::DeviceChangeAck(DeviceChangeAck {
            data_id: r.read_bytes()?,
            target_device_id: r.read_uuid()?,
        }),
        "Changed" => Message::Changed(Changed {
            blob_id: r.read_u64()?,
            key_index: r.read_u32()?,
            salt: r.read_bytes()?,
            ciphertext: r.read_bytes()?,
            change_estimate: r.read_option(|r| r.read_u64())?,
        }),
        "LastChanged" => Message::LastChanged,
        "ChangedAck" => Message::ChangedAck(ChangedAck { blob_id: r.read_u64()? }),
        "ListDevices" => Message::ListDevices,
        "Devices" => Message::Devices(Devices {
            devices: r.read_list(|r| {
                Ok(DeviceInfoEntry {
                    device_id: r.read_uuid()?,
                    name: r.read_str()?,
                    fingerprint: r.read_bytes()?,
                })
            })?,
        }),
        "Remove" => Message::Remove(Remove { device_id: r.read_uuid()? }),
        "RemoveAck" => Message::RemoveAck(RemoveAck { device_id: r.read_uuid()? }),
        "MacUpdate" => Message::MacUpdate(MacUpdate {
            key_index: r.read_u32()?,
            cmac: r.read_bytes()?,
        }),
        "MacUpdateAck" => Message::MacUpdateAck,
        "KeyChange" => Message::KeyChange(KeyChange { next_index: r.read_u32()? }),
        "DeviceKeys" => Message::DeviceKeys(DeviceKeys {
            key_index: r.read_u32()?,
            duplicated: r.read_bool()?,
            devices: r.read_list(|r| {
                Ok(DeviceKeyEntry {
                    device_id: r.read_uuid()?,
                    crypt_scheme: r.read_str()?,
                    crypt_key: r.read_bytes()?,
                    key_mac: r.read_bytes()?,
                })
            })?,
        }),
        "NewKey" => Message::NewKey(NewKey {
            key_index: r.read_u32()?,
            cmac: r.read_bytes()?,
            scheme: r.read_str()?,
            updates: r.read_list(|r| {
                Ok(KeyUpdateEntry {
                    device_id: r.read_uuid()?,
                    wrapped_key: r.read_bytes()?,
                    cmac: r.read_bytes()?,
                })
            })?,
        }),
        "NewKeyAck" => Message::NewKeyAck(NewKeyAck { key_index: r.read_u32()? }),
        "Error" => Message::Error(ErrorMessage {
            error_type: ErrorType::read(r)?,
            message: r.read_str()?,
            can_recover: r.read_bool()?,
        }),
        other => return Err(CodecError::UnknownTag(other.to_string())),
    })
}
