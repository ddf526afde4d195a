//! DNS message dissection
//!
//! Full-message parsing for the DPI path, via `hickory-proto`. This is
//! separate from the policy gate's raw header peek: here the whole
//! message is decoded to learn the queried name and the address a reply
//! resolved to.

use std::net::IpAddr;

use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::RData;
use tracing::trace;

/// What one DNS message contributed to a flow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsDissection {
    /// Name from the question section, trailing dot removed
    pub query_name: Option<String>,
    /// Address of the first usable answer record
    pub reply_addr: Option<IpAddr>,
    /// Whether this message was a response
    pub is_response: bool,
}

/// Parse one DNS message (UDP payload, no length prefix).
#[must_use]
pub fn dissect(payload: &[u8]) -> Option<DnsDissection> {
    let msg = match Message::from_vec(payload) {
        Ok(msg) => msg,
        Err(e) => {
            trace!("DNS parse failed: {e}");
            return None;
        }
    };

    let query_name = msg.queries().first().map(|q| {
        let name = q.name().to_ascii();
        name.trim_end_matches('.').to_string()
    });

    let is_response = msg.message_type() == MessageType::Response;

    let mut reply_addr = None;
    if is_response {
        for answer in msg.answers() {
            match answer.data() {
                Some(RData::A(a)) if is_usable_v4(a.0) => {
                    reply_addr = Some(IpAddr::V4(a.0));
                    break;
                }
                Some(RData::AAAA(a)) if is_global_unicast_v6(a.0) => {
                    reply_addr = Some(IpAddr::V6(a.0));
                    break;
                }
                _ => {}
            }
        }
    }

    Some(DnsDissection {
        query_name,
        reply_addr,
        is_response,
    })
}

/// A records must carry a real address.
fn is_usable_v4(addr: std::net::Ipv4Addr) -> bool {
    !addr.is_unspecified()
}

/// AAAA records are only learned for global unicast space (2000::/3).
fn is_global_unicast_v6(addr: std::net::Ipv6Addr) -> bool {
    addr.octets()[0] & 0xE0 == 0x20
}

/// Test helpers building wire-format DNS messages.
#[cfg(test)]
pub(crate) mod testutil {
    use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::net::{Ipv4Addr, Ipv6Addr};

    pub(crate) fn build_a_query(domain: &str) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(0x1234);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        let name = Name::from_ascii(domain).unwrap();
        msg.add_query(Query::query(name, RecordType::A));
        msg.to_vec().unwrap()
    }

    pub(crate) fn build_a_response(domain: &str, addr: Ipv4Addr) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(0x1234);
        msg.set_message_type(MessageType::Response);
        msg.set_op_code(OpCode::Query);
        msg.set_response_code(ResponseCode::NoError);
        msg.set_recursion_available(true);
        let name = Name::from_ascii(domain).unwrap();
        msg.add_query(Query::query(name.clone(), RecordType::A));
        msg.add_answer(Record::from_rdata(name, 300, RData::A(addr.into())));
        msg.to_vec().unwrap()
    }

    pub(crate) fn build_aaaa_response(domain: &str, addr: Ipv6Addr) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(0x1234);
        msg.set_message_type(MessageType::Response);
        msg.set_op_code(OpCode::Query);
        msg.set_response_code(ResponseCode::NoError);
        msg.set_recursion_available(true);
        let name = Name::from_ascii(domain).unwrap();
        msg.add_query(Query::query(name.clone(), RecordType::AAAA));
        msg.add_answer(Record::from_rdata(name, 300, RData::AAAA(addr.into())));
        msg.to_vec().unwrap()
    }
}
