use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type ProtoType = u16;

pub const PROTO_TYPE_SHELL: ProtoType = 1;
#[cfg(test)]
pub const PROTO_TYPE_FILE_TRANSFER: ProtoType = 2;
#[cfg(test)]
pub const PROTO_TYPE_PORT_FORWARD: ProtoType = 3;
pub const PROTO_TYPE_CONTROL: ProtoType = 0xFFFF;

pub const MESSAGE_TYPE_SPAWN_SHELL: &str = "new";
#[cfg(test)]
pub const MESSAGE_TYPE_OPEN: &str = "open";
pub const MESSAGE_TYPE_ERROR: &str = "error";

/// Value of the `status` property marking a shell message as an error.
pub const SHELL_STATUS_ERROR: i64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtoHdr {
    #[serde(rename = "proto")]
    pub proto: ProtoType,
    #[serde(rename = "typ")]
    pub msg_type: String,
    #[serde(rename = "sid", default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    #[serde(rename = "props", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, rmpv::Value>,
}

/// One frame on the duplex channel, encoded as a MessagePack map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtoMsg {
    #[serde(rename = "hdr")]
    pub header: ProtoHdr,
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl ProtoMsg {
    pub fn new(proto: ProtoType, msg_type: impl Into<String>, session_id: impl Into<String>) -> Self {
        ProtoMsg {
            header: ProtoHdr {
                proto,
                msg_type: msg_type.into(),
                session_id: session_id.into(),
                properties: BTreeMap::new(),
            },
            body: Vec::new(),
        }
    }

    pub fn with_property(mut self, name: &str, value: impl Into<rmpv::Value>) -> Self {
        self.header.properties.insert(name.to_string(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    pub fn from_msgpack(data: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(data)
    }
}

/// Body of a control error frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "err")]
    pub error: String,
    #[serde(rename = "msgproto", default, skip_serializing_if = "is_zero")]
    pub message_proto: ProtoType,
    #[serde(rename = "msgtype", default, skip_serializing_if = "String::is_empty")]
    pub message_type: String,
    #[serde(rename = "msgid", default, skip_serializing_if = "String::is_empty")]
    pub message_id: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub close: bool,
}

impl ErrorBody {
    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    pub fn from_msgpack(data: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(data)
    }
}

fn is_zero(value: &ProtoType) -> bool {
    *value == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn encodes_the_header_as_a_named_map() -> Result<(), Box<dyn std::error::Error>> {
        let msg = ProtoMsg::new(PROTO_TYPE_SHELL, MESSAGE_TYPE_SPAWN_SHELL, "abc")
            .with_property("status", SHELL_STATUS_ERROR)
            .with_body("hi");

        let value: rmpv::Value = rmp_serde::from_slice(&msg.to_msgpack()?)?;

        let map = value.as_map().expect("expected a map");
        let keys = map.iter().filter_map(|(key, _)| key.as_str()).collect::<Vec<_>>();
        assert_eq!(keys, vec!["hdr", "body"]);
        assert!(map[1].1.is_bin(), "body must be encoded as binary");
        Ok(())
    }

    #[test]
    fn omits_empty_optional_fields() -> Result<(), Box<dyn std::error::Error>> {
        let msg = ProtoMsg::new(PROTO_TYPE_CONTROL, MESSAGE_TYPE_OPEN, "");

        let value: rmpv::Value = rmp_serde::from_slice(&msg.to_msgpack()?)?;

        let map = value.as_map().expect("expected a map");
        assert_eq!(map.len(), 1);
        let header = map[0].1.as_map().expect("expected a header map");
        let keys = header.iter().filter_map(|(key, _)| key.as_str()).collect::<Vec<_>>();
        assert_eq!(keys, vec!["proto", "typ"]);
        Ok(())
    }

    #[test]
    fn decodes_a_frame_with_properties() -> Result<(), Box<dyn std::error::Error>> {
        let original = ProtoMsg::new(PROTO_TYPE_SHELL, "shell", "sid-1")
            .with_property("user_id", "admin")
            .with_property("terminal_width", 80)
            .with_body(vec![0u8, 1, 2]);

        let decoded = ProtoMsg::from_msgpack(&original.to_msgpack()?)?;

        assert_eq!(decoded, original);
        Ok(())
    }

    #[test]
    fn decoding_garbage_fails() {
        assert!(ProtoMsg::from_msgpack(&[0xc1, 0x00]).is_err());
    }
}
