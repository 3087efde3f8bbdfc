//! Payload IP rewriter (spec §4.2).
//!
//! The game protocol is plain-text with respect to IPv4 addresses, and embeds
//! them in both network byte order and reversed byte order within the same
//! message (§9, "Open question"). This scans a buffer for four-byte windows
//! matching either encoding of `old` and replaces them in place with `new`.

use std::net::Ipv4Addr;

/// Rewrite every occurrence of `old` (in either byte order) to `new` in `buf`,
/// in place. Returns the number of substitutions made.
///
/// Matched four-byte windows are skipped rather than re-scanned, so overlapping
/// matches are not double-counted (e.g. inserting `new` never creates a second
/// match starting one byte later within the same replaced span).
pub fn rewrite_ipv4(buf: &mut [u8], old: Ipv4Addr, new: Ipv4Addr) -> usize {
    if buf.len() < 4 {
        return 0;
    }
    let fwd = old.octets();
    let rev = {
        let mut r = fwd;
        r.reverse();
        r
    };
    let replacement = new.octets();
    let mut count = 0;
    let mut i = 0;
    while i + 4 <= buf.len() {
        let window = &buf[i..i + 4];
        if window == fwd || window == rev {
            buf[i..i + 4].copy_from_slice(&replacement);
            count += 1;
            i += 4;
        } else {
            i += 1;
        }
    }
    count
}

/// Parses `old`/`new` as dotted-quad strings before delegating to
/// [`rewrite_ipv4`]. Kept as a separate entry point since callers throughout
/// the relay and client hold addresses as strings from config/handshake bytes.
pub fn rewrite_ipv4_str(buf: &mut [u8], old: &str, new: &str) -> Result<usize, std::net::AddrParseError> {
    let old: Ipv4Addr = old.parse()?;
    let new: Ipv4Addr = new.parse()?;
    Ok(rewrite_ipv4(buf, old, new))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_op_on_buffers_shorter_than_four_bytes() {
        let mut buf = [1, 2, 3];
        let count = rewrite_ipv4(&mut buf, Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(5, 6, 7, 8));
        assert_eq!(count, 0);
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn rewrites_network_order_occurrence() {
        let old = Ipv4Addr::new(192, 168, 2, 75);
        let new = Ipv4Addr::new(10, 20, 30, 40);
        let mut buf = old.octets().to_vec();
        let count = rewrite_ipv4(&mut buf, old, new);
        assert_eq!(count, 1);
        assert_eq!(buf, new.octets());
    }

    #[test]
    fn rewrites_reversed_order_occurrence() {
        let old = Ipv4Addr::new(192, 168, 2, 75);
        let new = Ipv4Addr::new(10, 20, 30, 40);
        let mut reversed = old.octets();
        reversed.reverse();
        let mut buf = reversed.to_vec();
        let count = rewrite_ipv4(&mut buf, old, new);
        assert_eq!(count, 1);
        assert_eq!(buf, new.octets());
    }

    #[test]
    fn rewrites_multiple_non_overlapping_occurrences() {
        let old = Ipv4Addr::new(192, 168, 2, 75);
        let new = Ipv4Addr::new(10, 20, 30, 40);
        let mut buf = Vec::new();
        buf.extend_from_slice(b"XX");
        buf.extend_from_slice(&old.octets());
        buf.extend_from_slice(b"YY");
        buf.extend_from_slice(&old.octets());
        let count = rewrite_ipv4(&mut buf, old, new);
        assert_eq!(count, 2);
        let mut expect = Vec::new();
        expect.extend_from_slice(b"XX");
        expect.extend_from_slice(&new.octets());
        expect.extend_from_slice(b"YY");
        expect.extend_from_slice(&new.octets());
        assert_eq!(buf, expect);
    }

    #[test]
    fn nat_discovery_example_from_spec() {
        // §8 scenario: payload-encoded IP 75.2.168.192 in DNF order == proxy
        // 192.168.2.75 reversed.
        let proxy = Ipv4Addr::new(192, 168, 2, 75);
        let client = Ipv4Addr::new(10, 20, 30, 40);
        let mut buf = vec![0xc0, 0xa8, 0x02, 0x4b]; // reversed 192.168.2.75
        let count = rewrite_ipv4(&mut buf, proxy, client);
        assert_eq!(count, 1);
        assert_eq!(buf, vec![0x28, 0x1e, 0x14, 0x0a]); // reversed 10.20.30.40
    }

    proptest::proptest! {
        #[test]
        fn round_trip_is_identity_when_free_of_incidental_collisions(
            payload in proptest::collection::vec(200u8..=255, 0..64),
            a in (1u8..=50, 1u8..=50, 1u8..=50, 1u8..=50),
            b in (100u8..=150, 100u8..=150, 100u8..=150, 100u8..=150),
        ) {
            // `old`/`new` octet ranges are disjoint from the payload's byte
            // range and from each other, so no incidental collisions occur
            // (the caveat noted in spec §9 "Rewrite collisions").
            let old = Ipv4Addr::new(a.0, a.1, a.2, a.3);
            let new = Ipv4Addr::new(b.0, b.1, b.2, b.3);
            let original = payload.clone();

            let mut buf = payload;
            rewrite_ipv4(&mut buf, old, new);
            rewrite_ipv4(&mut buf, new, old);

            prop_assert_eq!(buf, original);
        }
    }
}
