use crate::duplex::proto_msg::{
    ErrorBody, MESSAGE_TYPE_ERROR, MESSAGE_TYPE_SPAWN_SHELL, PROTO_TYPE_CONTROL, PROTO_TYPE_SHELL, ProtoMsg, ProtoType, SHELL_STATUS_ERROR,
};

pub const SHELL_UNSUPPORTED: &str = "not supported by fleet-stress";
pub const HANDSHAKE_REJECTED: &str = "handshake rejected";

/// What the peer asked for, as far as a simulated device cares.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundRequest {
    SpawnShell { session_id: String },
    ControlError { session_id: String, error: Option<ErrorBody> },
    Unsupported { proto: ProtoType, msg_type: String, session_id: String },
}

impl InboundRequest {
    pub fn classify(msg: &ProtoMsg) -> Self {
        let header = &msg.header;
        match (header.proto, header.msg_type.as_str()) {
            (PROTO_TYPE_SHELL, MESSAGE_TYPE_SPAWN_SHELL) => InboundRequest::SpawnShell {
                session_id: header.session_id.clone(),
            },
            (PROTO_TYPE_CONTROL, MESSAGE_TYPE_ERROR) => InboundRequest::ControlError {
                session_id: header.session_id.clone(),
                error: ErrorBody::from_msgpack(&msg.body).ok(),
            },
            (proto, msg_type) => InboundRequest::Unsupported {
                proto,
                msg_type: msg_type.to_string(),
                session_id: header.session_id.clone(),
            },
        }
    }

    /// The frame to send back, if any. Peer errors are never answered to avoid error ping-pong.
    pub fn response(&self) -> Result<Option<ProtoMsg>, rmp_serde::encode::Error> {
        match self {
            InboundRequest::SpawnShell { session_id } => Ok(Some(
                ProtoMsg::new(PROTO_TYPE_SHELL, MESSAGE_TYPE_SPAWN_SHELL, session_id.as_str())
                    .with_property("status", SHELL_STATUS_ERROR)
                    .with_body(SHELL_UNSUPPORTED),
            )),
            InboundRequest::ControlError { .. } => Ok(None),
            InboundRequest::Unsupported { proto, msg_type, session_id } => {
                let body = ErrorBody {
                    error: HANDSHAKE_REJECTED.to_string(),
                    message_proto: *proto,
                    message_type: msg_type.clone(),
                    message_id: String::new(),
                    close: true,
                };
                Ok(Some(
                    ProtoMsg::new(PROTO_TYPE_CONTROL, MESSAGE_TYPE_ERROR, session_id.as_str()).with_body(body.to_msgpack()?),
                ))
            }
        }
    }
}
