//! MQTT v3.1.1 Packet Definitions

use std::sync::Arc;

use bytes::Bytes;

use super::{
    ConnectReturnCode, QoS, SubAckReturnCode, LEGACY_PROTOCOL_LEVEL, LEGACY_PROTOCOL_NAME,
    PROTOCOL_LEVEL, PROTOCOL_NAME,
};

/// MQTT control packet
///
/// The set of kinds is closed; the cluster processor matches on every
/// variant explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Get packet type as u8
    pub fn packet_type(&self) -> u8 {
        match self {
            Packet::Connect(_) => 1,
            Packet::ConnAck(_) => 2,
            Packet::Publish(_) => 3,
            Packet::PubAck(_) => 4,
            Packet::PubRec(_) => 5,
            Packet::PubRel(_) => 6,
            Packet::PubComp(_) => 7,
            Packet::Subscribe(_) => 8,
            Packet::SubAck(_) => 9,
            Packet::Unsubscribe(_) => 10,
            Packet::UnsubAck(_) => 11,
            Packet::PingReq => 12,
            Packet::PingResp => 13,
            Packet::Disconnect => 14,
        }
    }

    /// Get the packet name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck(_) => "PUBACK",
            Packet::PubRec(_) => "PUBREC",
            Packet::PubRel(_) => "PUBREL",
            Packet::PubComp(_) => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::UnsubAck(_) => "UNSUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}

/// CONNECT packet (client -> server)
///
/// Protocol name and level are kept as received so that [`Connect::validate`]
/// can answer with the proper CONNACK code instead of failing the decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Protocol name ("MQTT" or legacy "MQIsdp")
    pub protocol_name: String,
    /// Protocol level (4 for v3.1.1)
    pub protocol_level: u8,
    /// Client identifier
    pub client_id: String,
    /// Clean session flag
    pub clean_session: bool,
    /// Keep alive interval in seconds
    pub keep_alive: u16,
    /// Username (optional)
    pub username: Option<String>,
    /// Password (optional)
    pub password: Option<Bytes>,
    /// Will message (optional)
    pub will: Option<Will>,
}

impl Default for Connect {
    fn default() -> Self {
        Self {
            protocol_name: PROTOCOL_NAME.to_string(),
            protocol_level: PROTOCOL_LEVEL,
            client_id: String::new(),
            clean_session: true,
            keep_alive: 60,
            username: None,
            password: None,
            will: None,
        }
    }
}

impl Connect {
    /// Handshake a node sends when it dials a peer: v3.1.1, clean session,
    /// 60 second keep-alive, identified by the dialing node's own name.
    pub fn handshake(node_name: &str) -> Self {
        Self {
            client_id: node_name.to_string(),
            ..Default::default()
        }
    }

    /// Compute the CONNACK return code for this request
    pub fn validate(&self) -> ConnectReturnCode {
        if self.password.is_some() && self.username.is_none() {
            return ConnectReturnCode::BadUserNameOrPassword;
        }

        match self.protocol_name.as_str() {
            PROTOCOL_NAME if self.protocol_level != PROTOCOL_LEVEL => {
                return ConnectReturnCode::UnacceptableProtocolVersion;
            }
            LEGACY_PROTOCOL_NAME if self.protocol_level != LEGACY_PROTOCOL_LEVEL => {
                return ConnectReturnCode::UnacceptableProtocolVersion;
            }
            PROTOCOL_NAME | LEGACY_PROTOCOL_NAME => {}
            _ => return ConnectReturnCode::UnacceptableProtocolVersion,
        }

        if self.client_id.is_empty() && !self.clean_session {
            return ConnectReturnCode::IdentifierRejected;
        }

        ConnectReturnCode::Accepted
    }
}

/// Will message configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK packet (server -> client)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnAck {
    /// Session present flag
    pub session_present: bool,
    /// Return code
    pub return_code: ConnectReturnCode,
}

/// PUBLISH packet (bidirectional)
///
/// The topic field uses `Arc<str>` so that fan-out to many subscribers
/// clones a pointer, not the string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// Duplicate delivery flag
    pub dup: bool,
    /// Quality of service
    pub qos: QoS,
    /// Retain flag
    pub retain: bool,
    /// Topic name
    pub topic: Arc<str>,
    /// Packet identifier (present only for QoS > 0)
    pub packet_id: Option<u16>,
    /// Payload
    pub payload: Bytes,
}

impl Default for Publish {
    fn default() -> Self {
        Self {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: Arc::from(""),
            packet_id: None,
            payload: Bytes::new(),
        }
    }
}

impl Publish {
    pub fn new(topic: &str, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: Arc::from(topic),
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// Copy of this message downgraded to QoS 0, as carried between nodes
    pub fn to_qos0(&self) -> Self {
        Self {
            dup: false,
            qos: QoS::AtMostOnce,
            packet_id: None,
            ..self.clone()
        }
    }
}

/// PUBACK packet (QoS 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    pub packet_id: u16,
}

/// PUBREC packet (QoS 2 step 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRec {
    pub packet_id: u16,
}

/// PUBREL packet (QoS 2 step 2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRel {
    pub packet_id: u16,
}

/// PUBCOMP packet (QoS 2 step 3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubComp {
    pub packet_id: u16,
}

/// Subscription request entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Topic filter
    pub filter: String,
    /// Requested QoS
    pub qos: QoS,
}

/// SUBSCRIBE packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub subscriptions: Vec<Subscription>,
}

impl Subscribe {
    /// Single-filter QoS 0 subscribe, the form used to advertise interest
    pub fn single(packet_id: u16, filter: &str) -> Self {
        Self {
            packet_id,
            subscriptions: vec![Subscription {
                filter: filter.to_string(),
                qos: QoS::AtMostOnce,
            }],
        }
    }
}

/// SUBACK packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    /// One return code per requested filter
    pub return_codes: Vec<SubAckReturnCode>,
}

/// UNSUBSCRIBE packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

/// UNSUBACK packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubAck {
    pub packet_id: u16,
}
