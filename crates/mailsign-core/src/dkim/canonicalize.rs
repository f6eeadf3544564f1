//! Header and body canonicalization (RFC 6376 section 3.4)

use super::message::HeaderField;
use mailsign_common::config::Canonicalization;

fn is_wsp(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

/// Append the canonical form of `field` to `out`, without a trailing CRLF
pub fn canonicalize_header(out: &mut Vec<u8>, canon: Canonicalization, field: &HeaderField<'_>) {
    match canon {
        Canonicalization::Simple => {
            out.extend_from_slice(field.raw_name().as_bytes());
            out.push(b':');
            out.extend_from_slice(field.value);
        }
        Canonicalization::Relaxed => {
            out.extend(field.name().bytes().map(|b| b.to_ascii_lowercase()));
            out.push(b':');
            relax_header_value(out, field.value);
        }
    }
}

/// Unfold, compress whitespace runs to one space and trim both ends
fn relax_header_value(out: &mut Vec<u8>, value: &[u8]) {
    let mut pending_space = false;
    let mut started = false;

    for &b in value {
        // CR and LF only occur as part of folding here
        if is_wsp(b) || b == b'\r' || b == b'\n' {
            pending_space = started;
        } else {
            if pending_space {
                out.push(b' ');
                pending_space = false;
            }
            out.push(b);
            started = true;
        }
    }
}

/// Canonicalize a message body
pub fn canonicalize_body(canon: Canonicalization, body: &[u8]) -> Vec<u8> {
    match canon {
        Canonicalization::Simple => simple_body(body),
        Canonicalization::Relaxed => relaxed_body(body),
    }
}

/// Strip trailing empty lines; an empty body becomes a single CRLF
fn simple_body(body: &[u8]) -> Vec<u8> {
    let mut end = body.len();
    while body[..end].ends_with(b"\r\n") {
        end -= 2;
    }

    let mut out = body[..end].to_vec();
    out.extend_from_slice(b"\r\n");
    out
}

/// Compress whitespace within lines, drop it at line ends and strip trailing
/// empty lines; an empty body stays empty
fn relaxed_body(body: &[u8]) -> Vec<u8> {
    let mut lines: Vec<Vec<u8>> = Vec::new();

    let mut rest = body;
    while !rest.is_empty() {
        let (line, next) = match rest.windows(2).position(|w| w == b"\r\n") {
            Some(i) => (&rest[..i], &rest[i + 2..]),
            None => (rest, &[][..]),
        };
        lines.push(relax_body_line(line));
        rest = next;
    }

    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }

    let mut out = Vec::with_capacity(body.len());
    for line in lines {
        out.extend_from_slice(&line);
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn relax_body_line(line: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len());
    let mut pending_space = false;

    for &b in line {
        if is_wsp(b) {
            pending_space = true;
        } else {
            if pending_space {
                out.push(b' ');
                pending_space = false;
            }
            out.push(b);
        }
    }
    out
}
