//! Collapses a response's answer section to at most one record per RR type.
//!
//! Certain stub resolvers take a slow path when an answer contains multiple address
//! records of the same type. Rewriting every upstream response so each RR type
//! appears at most once works around that without touching the upstream servers.

use std::collections::HashSet;

use dns_wire::prelude::*;
use dns_wire::{decrement_record, rebuild, RecordType, Response};

/// Keeps the first record of each RR type in the answer section, in their original
/// order. Authority and additional sections, and the header (including rcode), are
/// carried through unchanged.
///
/// Idempotent: `flatten(&flatten(&r))` produces the same answer section as `flatten(&r)`.
pub fn flatten(response: &Response) -> Response {
    let mut seen: HashSet<RecordType> = HashSet::new();
    let mut answer = Vec::new();

    for record in response.answer() {
        if seen.insert(record.data().rtype()) {
            answer.push(decrement_record(&record, 0));
        }
    }

    let authority = response.authority().map(|r| decrement_record(&r, 0));
    let additional = response.additional().map(|r| decrement_record(&r, 0));

    rebuild(
        response.id(),
        &response.domain(),
        response.qtype(),
        response.qclass(),
        response.response_code(),
        response.truncated(),
        answer,
        authority,
        additional,
    )
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use dns_wire::{records, DomainName, Query, ResponseCode};

    use super::*;

    fn a_record(domain: &DomainName, ip: Ipv4Addr) -> (DomainName, u32, dns_wire::OwnedRecordData) {
        (domain.clone(), 300, records::a(ip))
    }

    fn aaaa_record(
        domain: &DomainName,
        ip: Ipv6Addr,
    ) -> (DomainName, u32, dns_wire::OwnedRecordData) {
        (domain.clone(), 300, records::aaaa(ip))
    }

    #[test]
    fn keeps_first_record_per_type() {
        let domain = DomainName::vec_from_str("example.com").unwrap();
        let query = Query::new(domain.clone(), RecordType::A);

        let response = dns_wire::ResponseBuilder::for_query(&query, ResponseCode::NOERROR)
            .with_records([
                a_record(&domain, Ipv4Addr::new(1, 1, 1, 1)),
                a_record(&domain, Ipv4Addr::new(2, 2, 2, 2)),
                a_record(&domain, Ipv4Addr::new(3, 3, 3, 3)),
            ])
            .build();

        let flattened = flatten(&response);

        let kept: Vec<_> = flattened.answer().collect();
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn keeps_one_record_per_distinct_type() {
        let domain = DomainName::vec_from_str("example.com").unwrap();
        let query = Query::new(domain.clone(), RecordType::A);

        let response = dns_wire::ResponseBuilder::for_query(&query, ResponseCode::NOERROR)
            .with_records([
                a_record(&domain, Ipv4Addr::new(1, 1, 1, 1)),
                a_record(&domain, Ipv4Addr::new(2, 2, 2, 2)),
            ])
            .build();

        // Rebuild again, this time mixing in AAAA records by constructing directly.
        let response = dns_wire::rebuild(
            response.id(),
            &domain,
            RecordType::A,
            dns_wire::RecordClass::IN,
            ResponseCode::NOERROR,
            false,
            [
                a_record(&domain, Ipv4Addr::new(1, 1, 1, 1)),
                a_record(&domain, Ipv4Addr::new(2, 2, 2, 2)),
                aaaa_record(&domain, Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 1)),
                aaaa_record(&domain, Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 2)),
            ],
            [],
            [],
        );

        let flattened = flatten(&response);
        assert_eq!(flattened.answer().count(), 2);
    }

    #[test]
    fn is_idempotent() {
        let domain = DomainName::vec_from_str("example.com").unwrap();

        let response = dns_wire::rebuild(
            1,
            &domain,
            RecordType::A,
            dns_wire::RecordClass::IN,
            ResponseCode::NOERROR,
            false,
            [
                a_record(&domain, Ipv4Addr::new(1, 1, 1, 1)),
                a_record(&domain, Ipv4Addr::new(2, 2, 2, 2)),
            ],
            [],
            [],
        );

        let once = flatten(&response);
        let twice = flatten(&once);

        assert_eq!(once.answer().count(), twice.answer().count());
    }

    #[test]
    fn preserves_authority_and_additional_untouched() {
        let domain = DomainName::vec_from_str("example.com").unwrap();
        let ns = DomainName::vec_from_str("ns1.example.com").unwrap();

        let response = dns_wire::rebuild(
            1,
            &domain,
            RecordType::A,
            dns_wire::RecordClass::IN,
            ResponseCode::NOERROR,
            false,
            [
                a_record(&domain, Ipv4Addr::new(1, 1, 1, 1)),
                a_record(&domain, Ipv4Addr::new(2, 2, 2, 2)),
            ],
            [(domain.clone(), 300, records::ptr(ns.clone()))],
            [a_record(&ns, Ipv4Addr::new(9, 9, 9, 9))],
        );

        let flattened = flatten(&response);

        assert_eq!(flattened.authority().count(), 1);
        assert_eq!(flattened.additional().count(), 1);
    }

    #[test]
    fn cname_then_first_a_is_kept() {
        let www = DomainName::vec_from_str("www.ex.com").unwrap();
        let apex = DomainName::vec_from_str("ex.com").unwrap();

        let response = dns_wire::rebuild(
            1,
            &www,
            RecordType::A,
            dns_wire::RecordClass::IN,
            ResponseCode::NOERROR,
            false,
            [
                (www.clone(), 300, records::cname(apex.clone())),
                a_record(&apex, Ipv4Addr::new(1, 1, 1, 1)),
                a_record(&apex, Ipv4Addr::new(2, 2, 2, 2)),
            ],
            [],
            [],
        );

        let flattened = flatten(&response);
        assert_eq!(flattened.answer().count(), 2);
    }
}
