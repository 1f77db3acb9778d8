//! RFC 1035 message parsing and serialization.
//!
//! Thin wrappers around [`domain::base::Message`] that give the rest of the
//! proxy a typed view of queries and responses without pulling the whole
//! `domain` API surface into every crate.

use domain::{
    base::{
        message_builder::{AdditionalBuilder, AnswerBuilder, AuthorityBuilder},
        name::FlattenInto,
        HeaderCounts, Message, MessageBuilder, ParsedName, Question, RecordSection,
    },
    dep::octseq::OctetsInto,
    rdata::AllRecordData,
};

pub mod prelude {
    pub use domain::base::name::FlattenInto as _;
    pub use domain::base::RecordData as _;
    pub use domain::base::ToName as _;
}

pub const MAX_NAME_LEN: usize = domain::base::Name::MAX_LEN;
/// Ceiling for a UDP response before the proxy must set `TC=1` and let the client retry over TCP.
pub const UDP_PAYLOAD_LIMIT: usize = 512;

pub type RecordType = domain::base::iana::Rtype;
pub type RecordClass = domain::base::iana::Class;
pub type ResponseCode = domain::base::iana::Rcode;

pub type DomainNameRef<'a> = domain::base::Name<&'a [u8]>;
pub type Record<'a> =
    domain::base::Record<ParsedName<&'a [u8]>, AllRecordData<&'a [u8], ParsedName<&'a [u8]>>>;
pub type RecordData<'a> = AllRecordData<&'a [u8], ParsedName<&'a [u8]>>;

pub type DomainName = domain::base::Name<Vec<u8>>;
pub type OwnedRecord = domain::base::Record<DomainName, AllRecordData<Vec<u8>, DomainName>>;
pub type OwnedRecordData = AllRecordData<Vec<u8>, DomainName>;

/// `(name, ttl_seconds, rdata)`, the shape every record is pushed to a builder as.
pub type OwnedRecordTuple = (DomainName, u32, OwnedRecordData);

#[derive(Clone)]
pub struct Query {
    inner: Message<Vec<u8>>,
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("qid", &self.inner.header().id())
            .field("domain", &self.domain())
            .field("type", &self.qtype())
            .finish()
    }
}

impl Query {
    /// Parses a query, validating only that it is structurally a DNS message with `QR=0`.
    ///
    /// Whether it carries exactly one question is checked separately by [`Query::question`],
    /// so a handler can distinguish a malformed packet (drop) from a well-formed query with
    /// zero questions (SERVFAIL).
    pub fn parse(slice: &[u8]) -> Result<Self, Error> {
        let message = Message::from_octets(slice).map_err(|_| Error::TooShort)?;

        if message.header().qr() {
            return Err(Error::NotAQuery);
        }

        Ok(Self {
            inner: message.octets_into(),
        })
    }

    pub fn new(domain: DomainName, rtype: RecordType) -> Self {
        let mut inner = MessageBuilder::new_vec().question();
        inner.header_mut().set_qr(false);
        inner.header_mut().set_rd(true);
        inner.header_mut().set_random_id();

        inner
            .push((domain, rtype))
            .expect("Vec-backed message builder never fails");

        Self {
            inner: inner.into_message(),
        }
    }

    pub fn with_id(mut self, id: u16) -> Self {
        self.inner.header_mut().set_id(id);
        self
    }

    pub fn id(&self) -> u16 {
        self.inner.header().id()
    }

    /// The sole question of this query, if there is exactly one.
    ///
    /// `None` covers both "zero questions" and "more than one question" — the proxy
    /// treats either as a query it cannot serve a typed answer for.
    pub fn question(&self) -> Option<Question<ParsedName<&[u8]>>> {
        self.inner.sole_question().ok()
    }

    pub fn domain(&self) -> Option<DomainName> {
        self.question().map(|q| q.into_qname().flatten_into())
    }

    pub fn qtype(&self) -> Option<RecordType> {
        self.question().map(|q| q.qtype())
    }

    pub fn qclass(&self) -> Option<RecordClass> {
        self.question().map(|q| q.qclass())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.inner.into_octets()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_slice()
    }
}

impl TryFrom<&[u8]> for Query {
    type Error = Error;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        Self::parse(slice)
    }
}

impl TryFrom<&[u8]> for Response {
    type Error = Error;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        Self::parse(slice)
    }
}

pub struct Response {
    inner: Message<Vec<u8>>,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("qid", &self.inner.header().id())
            .field("domain", &self.domain())
            .field("type", &self.qtype())
            .field("response_code", &self.response_code())
            .finish_non_exhaustive()
    }
}

impl Response {
    /// Creates an empty, "NOERROR" response for the given query.
    pub fn no_error(query: &Query) -> Self {
        ResponseBuilder::for_query(query, ResponseCode::NOERROR).build()
    }

    pub fn servfail(query: &Query) -> Self {
        ResponseBuilder::for_query(query, ResponseCode::SERVFAIL).build()
    }

    pub fn nxdomain(query: &Query) -> Self {
        ResponseBuilder::for_query(query, ResponseCode::NXDOMAIN).build()
    }

    /// SERVFAIL carrying nothing but the echoed query ID.
    ///
    /// Used when a query cannot even be said to carry a single question (so there is
    /// nothing to echo in the question section).
    pub fn servfail_for_id(id: u16) -> Self {
        let mut builder = MessageBuilder::new_vec();
        builder.header_mut().set_id(id);
        builder.header_mut().set_qr(true);
        builder.header_mut().set_rcode(ResponseCode::SERVFAIL);

        Self {
            inner: builder.question().into_message(),
        }
    }

    /// A minimal `{id, QR=1, TC=1, question}` reply telling the client to retry over TCP.
    pub fn minimal_truncated(query: &Query) -> Self {
        let mut response = ResponseBuilder::for_query(query, ResponseCode::NOERROR).build();
        response.inner.header_mut().set_tc(true);
        response
    }

    pub fn parse(slice: &[u8]) -> Result<Self, Error> {
        let message = Message::from_octets(slice).map_err(|_| Error::TooShort)?;

        if !message.header().qr() {
            return Err(Error::NotAResponse);
        }

        let _ = message.sole_question()?;

        for record in message.answer()? {
            record?.into_any_record::<AllRecordData<_, _>>()?;
        }
        for record in message.authority()? {
            record?.into_any_record::<AllRecordData<_, _>>()?;
        }
        for record in message.additional()? {
            record?.into_any_record::<AllRecordData<_, _>>()?;
        }

        Ok(Self {
            inner: message.octets_into(),
        })
    }

    pub fn id(&self) -> u16 {
        self.inner.header().id()
    }

    pub fn with_id(mut self, id: u16) -> Self {
        self.inner.header_mut().set_id(id);
        self
    }

    pub fn truncated(&self) -> bool {
        self.inner.header().tc()
    }

    pub fn domain(&self) -> DomainName {
        self.question().into_qname().flatten_into()
    }

    pub fn qtype(&self) -> RecordType {
        self.question().qtype()
    }

    pub fn qclass(&self) -> RecordClass {
        self.question().qclass()
    }

    pub fn response_code(&self) -> ResponseCode {
        self.inner.header().rcode()
    }

    pub fn answer(&self) -> impl Iterator<Item = Record<'_>> {
        section_records(self.answer_section())
    }

    pub fn authority(&self) -> impl Iterator<Item = Record<'_>> {
        section_records(self.authority_section())
    }

    pub fn additional(&self) -> impl Iterator<Item = Record<'_>> {
        section_records(self.additional_section())
    }

    /// Serializes this response into a byte slice.
    ///
    /// If the encoded message is bigger than `max_len`, it is truncated to just the
    /// header and question, and the `TC` bit is set so the client knows to retry over TCP.
    pub fn into_bytes(mut self, max_len: usize) -> Vec<u8> {
        let len = self.inner.as_slice().len();
        if len <= max_len {
            return self.inner.into_octets();
        }

        let qid = self.inner.header().id();
        tracing::debug!(%len, %max_len, %qid, domain = %self.domain(), "Truncating DNS response");

        self.inner.header_mut().set_tc(true);

        let start_of_answer = self.answer_section().pos();

        let mut bytes = self.inner.into_octets();
        bytes.truncate(start_of_answer);

        let headercounts = HeaderCounts::for_message_slice_mut(&mut bytes);
        headercounts.as_slice_mut().fill(0);
        headercounts.set_qdcount(1);

        bytes
    }

    fn question(&self) -> Question<ParsedName<&[u8]>> {
        self.inner.sole_question().expect("verified in ctor")
    }

    fn answer_section(&self) -> RecordSection<'_, Vec<u8>> {
        self.inner.answer().expect("verified in ctor")
    }

    fn authority_section(&self) -> RecordSection<'_, Vec<u8>> {
        self.inner.authority().expect("verified in ctor")
    }

    fn additional_section(&self) -> RecordSection<'_, Vec<u8>> {
        self.inner.additional().expect("verified in ctor")
    }
}

fn section_records(section: RecordSection<'_, Vec<u8>>) -> impl Iterator<Item = Record<'_>> {
    section.map(|r| {
        r.expect("verified in ctor")
            .into_any_record::<AllRecordData<_, _>>()
            .expect("verified in ctor")
    })
}

pub struct ResponseBuilder {
    inner: AnswerBuilder<Vec<u8>>,
}

impl ResponseBuilder {
    pub fn for_query(query: &Query, code: ResponseCode) -> Self {
        let inner = MessageBuilder::new_vec()
            .start_answer(&query.inner, code)
            .expect("Vec-backed message builder never fails");

        Self { inner }
    }

    pub fn with_records(mut self, records: impl IntoIterator<Item: Into<OwnedRecord>>) -> Self {
        for record in records {
            self.inner
                .push(record.into())
                .expect("Vec-backed message builder never fails");
        }

        self
    }

    pub fn build(self) -> Response {
        Response {
            inner: self.inner.into_message(),
        }
    }
}

/// Rebuilds a response from scratch, section by section.
///
/// Used by the cache (to apply TTL decrement) and the filter (to rewrite the answer
/// section) whenever editing the records in place isn't an option because the wire
/// representation doesn't support it.
pub fn rebuild(
    id: u16,
    qname: &DomainName,
    qtype: RecordType,
    qclass: RecordClass,
    code: ResponseCode,
    tc: bool,
    answer: impl IntoIterator<Item = OwnedRecordTuple>,
    authority: impl IntoIterator<Item = OwnedRecordTuple>,
    additional: impl IntoIterator<Item = OwnedRecordTuple>,
) -> Response {
    let mut builder = MessageBuilder::new_vec();
    builder.header_mut().set_id(id);
    builder.header_mut().set_qr(true);
    builder.header_mut().set_rcode(code);
    builder.header_mut().set_tc(tc);

    let mut question_builder = builder.question();
    question_builder
        .push(Question::new(qname.clone(), qtype, qclass))
        .expect("Vec-backed message builder never fails");

    let mut answer_builder: AnswerBuilder<Vec<u8>> = question_builder.answer();
    for record in answer {
        answer_builder
            .push(record)
            .expect("Vec-backed message builder never fails");
    }

    let mut authority_builder: AuthorityBuilder<Vec<u8>> = answer_builder.authority();
    for record in authority {
        authority_builder
            .push(record)
            .expect("Vec-backed message builder never fails");
    }

    let mut additional_builder: AdditionalBuilder<Vec<u8>> = authority_builder.additional();
    for record in additional {
        additional_builder
            .push(record)
            .expect("Vec-backed message builder never fails");
    }

    Response {
        inner: additional_builder.into_message(),
    }
}

/// Owns a decremented copy of a single record, ready to be pushed into [`rebuild`].
pub fn decrement_record(record: &Record<'_>, elapsed_secs: u32) -> OwnedRecordTuple {
    let name: DomainName = record.owner().flatten_into();
    let ttl = record.ttl().as_secs().saturating_sub(elapsed_secs);
    let data: OwnedRecordData = record.data().clone().octets_into();

    (name, ttl, data)
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Bytes slice is too short to contain a message")]
    TooShort,
    #[error("DNS message is not a query")]
    NotAQuery,
    #[error("DNS message is not a response")]
    NotAResponse,
    #[error(transparent)]
    Parse(#[from] domain::base::wire::ParseError),
}

pub mod records {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use domain::rdata::{rfc1035::TxtError, Aaaa, Cname, Ptr, Srv, Txt, A};

    use super::*;

    pub fn ptr(domain: DomainName) -> OwnedRecordData {
        OwnedRecordData::Ptr(Ptr::new(domain))
    }

    pub fn cname(target: DomainName) -> OwnedRecordData {
        OwnedRecordData::Cname(Cname::new(target))
    }

    pub fn a(ip: Ipv4Addr) -> OwnedRecordData {
        OwnedRecordData::A(A::new(ip))
    }

    pub fn aaaa(ip: Ipv6Addr) -> OwnedRecordData {
        OwnedRecordData::Aaaa(Aaaa::new(ip))
    }

    pub fn ip(ip: IpAddr) -> OwnedRecordData {
        match ip {
            IpAddr::V4(ip) => a(ip),
            IpAddr::V6(ip) => aaaa(ip),
        }
    }

    pub fn txt(content: Vec<u8>) -> Result<OwnedRecordData, TxtError> {
        Ok(OwnedRecordData::Txt(Txt::from_octets(content)?))
    }

    pub fn srv(priority: u16, weight: u16, port: u16, target: DomainName) -> OwnedRecordData {
        OwnedRecordData::Srv(Srv::new(priority, weight, port, target))
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn can_truncate_response() {
        let domain = DomainName::vec_from_str("example.com").unwrap();

        let query = Query::new(domain.clone(), RecordType::A);
        let response = ResponseBuilder::for_query(&query, ResponseCode::NOERROR)
            .with_records(std::iter::repeat_n(
                (domain.clone(), 1, records::a(Ipv4Addr::LOCALHOST)),
                1000,
            ))
            .build();

        let bytes = response.into_bytes(1000);

        let parsed_response = Response::parse(&bytes).unwrap();

        assert!(parsed_response.truncated());
        assert_eq!(parsed_response.answer().count(), 0);
        assert_eq!(parsed_response.domain(), domain);
    }

    #[test]
    fn query_without_question_has_no_domain() {
        let mut builder = MessageBuilder::new_vec();
        builder.header_mut().set_id(42);
        let message = builder.question().into_message();

        let query = Query::parse(message.as_slice()).unwrap();

        assert_eq!(query.id(), 42);
        assert!(query.question().is_none());
    }

    #[test]
    fn rebuild_preserves_authority_and_additional() {
        let domain = DomainName::vec_from_str("example.com").unwrap();
        let ns = DomainName::vec_from_str("ns1.example.com").unwrap();

        let response = rebuild(
            7,
            &domain,
            RecordType::A,
            RecordClass::IN,
            ResponseCode::NOERROR,
            false,
            [(domain.clone(), 300, records::a(Ipv4Addr::new(1, 1, 1, 1)))],
            [(domain.clone(), 300, records::ptr(ns.clone()))],
            [(ns.clone(), 300, records::a(Ipv4Addr::new(2, 2, 2, 2)))],
        );

        assert_eq!(response.id(), 7);
        assert_eq!(response.answer().count(), 1);
        assert_eq!(response.authority().count(), 1);
        assert_eq!(response.additional().count(), 1);
    }
}
