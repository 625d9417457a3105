// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Certificate identity: pull the subject common name out of a DER-encoded
// X.509 certificate.
//
// # Design note
//
// Only one field is needed (the printer puts its serial in the subject CN),
// so this walks the DER structure directly instead of pulling in a full
// X.509 parser:
//
//   Certificate  ::= SEQUENCE { tbsCertificate, signatureAlgorithm, signature }
//   TBSCertificate ::= SEQUENCE {
//       [0] version OPTIONAL, serialNumber, signature, issuer, validity,
//       subject, ... }
//   Name ::= SEQUENCE OF SET OF SEQUENCE { type OID, value ANY }

use tracing::trace;

const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;
const TAG_OID: u8 = 0x06;
const TAG_VERSION: u8 = 0xA0;
const TAG_UTF8_STRING: u8 = 0x0C;
const TAG_PRINTABLE_STRING: u8 = 0x13;
const TAG_TELETEX_STRING: u8 = 0x14;
const TAG_IA5_STRING: u8 = 0x16;

/// id-at-commonName, 2.5.4.3.
const OID_COMMON_NAME: &[u8] = &[0x55, 0x04, 0x03];

/// One decoded tag-length-value element.
struct Tlv<'a> {
    tag: u8,
    value: &'a [u8],
}

/// Read one TLV from the front of `input`, returning it and the rest.
fn read_tlv(input: &[u8]) -> Option<(Tlv<'_>, &[u8])> {
    let (&tag, rest) = input.split_first()?;
    let (&first, rest) = rest.split_first()?;

    let (len, rest) = if first & 0x80 == 0 {
        (usize::from(first), rest)
    } else {
        let n = usize::from(first & 0x7F);
        // Indefinite lengths are not DER; anything wider than usize is bogus.
        if n == 0 || n > std::mem::size_of::<usize>() || rest.len() < n {
            return None;
        }
        let len = rest[..n]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
        (len, &rest[n..])
    };

    if rest.len() < len {
        return None;
    }
    Some((
        Tlv {
            tag,
            value: &rest[..len],
        },
        &rest[len..],
    ))
}

/// Iterate the children of a constructed element.
fn children(mut content: &[u8]) -> impl Iterator<Item = Tlv<'_>> {
    std::iter::from_fn(move || {
        let (tlv, rest) = read_tlv(content)?;
        content = rest;
        Some(tlv)
    })
}

/// Return the subject common name of a DER certificate, if it has one.
pub fn common_name(der: &[u8]) -> Option<String> {
    let (cert, _) = read_tlv(der)?;
    if cert.tag != TAG_SEQUENCE {
        return None;
    }
    let tbs = children(cert.value).next()?;
    if tbs.tag != TAG_SEQUENCE {
        return None;
    }

    // serialNumber, signature, issuer, validity, subject, after the
    // optional explicit version.
    let subject = children(tbs.value)
        .filter(|tlv| tlv.tag != TAG_VERSION)
        .nth(4)?;
    if subject.tag != TAG_SEQUENCE {
        return None;
    }

    let cn = children(subject.value)
        .filter(|rdn| rdn.tag == TAG_SET)
        .flat_map(|rdn| children(rdn.value))
        .filter(|atv| atv.tag == TAG_SEQUENCE)
        .find_map(|atv| {
            let mut parts = children(atv.value);
            let oid = parts.next()?;
            let value = parts.next()?;
            if oid.tag != TAG_OID || oid.value != OID_COMMON_NAME {
                return None;
            }
            match value.tag {
                TAG_UTF8_STRING | TAG_PRINTABLE_STRING | TAG_TELETEX_STRING | TAG_IA5_STRING => {
                    std::str::from_utf8(value.value).ok().map(str::to_owned)
                }
                _ => None,
            }
        });

    trace!(?cn, "extracted certificate common name");
    cn
}
