//! DNS wire codec (collaborator A). Parses an incoming UDP datagram into
//! the pieces `dnst_lib::Query` needs and serializes a decided `Query`
//! back into reply bytes.

use std::net::Ipv4Addr;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use thiserror::Error;

use dnst_lib::QType;

pub struct ParsedQuery {
    pub request: Message,
    pub qname: String,
    pub qtype: QType,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed query: {0}")]
    Malformed(#[from] hickory_proto::error::ProtoError),
    #[error("query carries no question")]
    NoQuestion,
}

/// Parse a raw datagram into the question the engine needs. Anything
/// other than a well-formed single-question message is rejected here,
/// at the binary-crate boundary, so the core never sees an unparseable
/// query (§7 of the design).
pub fn decode_query(data: &[u8]) -> Result<ParsedQuery, CodecError> {
    let request = Message::from_bytes(data)?;
    let question = request.queries().first().ok_or(CodecError::NoQuestion)?;

    let qname = question.name().to_utf8();
    let qname = qname.trim_end_matches('.').to_string();
    let qtype = if question.query_type() == RecordType::A {
        QType::A
    } else {
        QType::Other
    };

    Ok(ParsedQuery { request, qname, qtype })
}

/// Build the reply for a question that wasn't even an A record -- the
/// core is never invoked for these.
pub fn encode_nxdomain(request: &Message) -> Vec<u8> {
    build_reply(request, ResponseCode::NXDomain, &[]).unwrap_or_default()
}

/// Build the reply once the engine has decided `answer`. An empty
/// answer still means NXDOMAIN (§6).
pub fn encode_reply(request: &Message, qname: &str, answer: &[(Ipv4Addr, u32)]) -> Vec<u8> {
    let rcode = if answer.is_empty() {
        ResponseCode::NXDomain
    } else {
        ResponseCode::NoError
    };
    build_reply(request, rcode, &records_for(qname, answer)).unwrap_or_default()
}

fn records_for(qname: &str, answer: &[(Ipv4Addr, u32)]) -> Vec<Record> {
    let Ok(name) = Name::from_utf8(qname) else {
        return Vec::new();
    };
    answer
        .iter()
        .map(|(ip, ttl)| Record::from_rdata(name.clone(), *ttl, RData::A(A(*ip))))
        .collect()
}

fn build_reply(
    request: &Message,
    rcode: ResponseCode,
    answers: &[Record],
) -> Result<Vec<u8>, CodecError> {
    let mut reply = Message::new();
    reply.set_id(request.id());
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(OpCode::Query);
    reply.set_recursion_desired(request.recursion_desired());
    reply.set_recursion_available(true);
    reply.set_response_code(rcode);
    for q in request.queries() {
        reply.add_query(q.clone());
    }
    reply.add_answers(answers.to_vec());
    Ok(reply.to_vec()?)
}
