use bytes::Bytes;
use nom::{
    bytes::complete::{tag, take_till1, take_while1, take_while_m_n},
    character::complete::char,
    combinator::{all_consuming, map_res, rest},
    sequence::tuple,
};
use tracing::trace;

use super::{is_token_char, ParseResult};
use crate::error::{Error, Result};
use crate::types::address::NameAddr;
use crate::types::cseq::CSeq;
use crate::types::header::{split_header_list, HeaderName, Headers};
use crate::types::method::Method;
use crate::types::sip_message::{Message, MessageHeaders, Request, Response, SIP_VERSION};
use crate::types::status::StatusCode;
use crate::types::uri::Uri;
use crate::types::via::Via;

/// Maximum length of a single (unfolded) header line
pub const MAX_LINE_LENGTH: usize = 8192;
/// Maximum number of header lines in one message
pub const MAX_HEADER_COUNT: usize = 100;
/// Maximum accepted body size
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

enum StartLine {
    Request(Method, Uri),
    Response(StatusCode, String),
}

fn request_line(input: &str) -> ParseResult<(&str, &str, &str)> {
    let (input, (method, _, uri, _, version)) = tuple((
        take_while1(is_token_char),
        char(' '),
        take_till1(|c: char| c == ' '),
        char(' '),
        rest,
    ))(input)?;
    Ok((input, (method, uri, version)))
}

fn status_line(input: &str) -> ParseResult<(u16, &str)> {
    let (input, (_, _, code, _, reason)) = tuple((
        tag(SIP_VERSION),
        char(' '),
        map_res(take_while_m_n(3, 3, |c: char| c.is_ascii_digit()), str::parse::<u16>),
        char(' '),
        rest,
    ))(input)?;
    Ok((input, (code, reason)))
}

fn parse_start_line(line: &str) -> Result<StartLine> {
    if line.starts_with("SIP/") {
        // Some peers omit the space before an empty reason phrase.
        let padded;
        let line = if line.len() == 11 {
            padded = format!("{} ", line);
            padded.as_str()
        } else {
            line
        };
        let (_, (code, reason)) =
            all_consuming(status_line)(line).map_err(|_| Error::InvalidStartLine(line.to_string()))?;
        let status = StatusCode::new(code)?;
        return Ok(StartLine::Response(status, reason.trim().to_string()));
    }

    let (_, (method, uri, version)) =
        all_consuming(request_line)(line).map_err(|_| Error::InvalidStartLine(line.to_string()))?;
    if version != SIP_VERSION {
        return Err(Error::InvalidVersion(version.to_string()));
    }
    Ok(StartLine::Request(method.parse()?, uri.parse()?))
}

/// Finds the end of the header block: returns (head length, separator length)
fn find_header_end(data: &[u8]) -> Option<(usize, usize)> {
    let crlf = data.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, 4));
    let lf = data.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if b.0 < a.0 { b } else { a }),
        (a, b) => a.or(b),
    }
}

/// Splits the head into lines and joins folded continuation lines
fn unfold_lines(head: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in head.split('\n') {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.starts_with([' ', '\t']) {
            if let Some(last) = lines.last_mut() {
                last.push(' ');
                last.push_str(line.trim());
                continue;
            }
        }
        lines.push(line.to_string());
    }
    lines
}

fn parse_list<T>(value: &str, parse: impl Fn(&str) -> Result<T>) -> Result<Vec<T>> {
    split_header_list(value).into_iter().map(parse).collect()
}

/// Parses one complete SIP message.
///
/// Leading CRLF keep-alives are skipped. When Content-Length is present the
/// body is cut to that length (excess bytes are discarded) and a shorter body
/// is an error; without it the remainder of the buffer is the body. Messages
/// missing Call-ID, From, To, CSeq or Via are rejected.
pub fn parse_message(data: &[u8]) -> Result<Message> {
    let start = data
        .iter()
        .position(|b| *b != b'\r' && *b != b'\n')
        .ok_or_else(|| Error::InvalidFormat("empty message".into()))?;
    let data = &data[start..];

    let (head_len, sep_len) =
        find_header_end(data).ok_or_else(|| Error::InvalidFormat("missing end of headers".into()))?;
    let head = std::str::from_utf8(&data[..head_len])
        .map_err(|_| Error::InvalidFormat("header section is not UTF-8".into()))?;
    let payload = &data[head_len + sep_len..];

    let lines = unfold_lines(head);
    let (start_line, header_lines) = lines
        .split_first()
        .ok_or_else(|| Error::InvalidFormat("missing start line".into()))?;
    if header_lines.len() > MAX_HEADER_COUNT {
        return Err(Error::InvalidFormat(format!("more than {} headers", MAX_HEADER_COUNT)));
    }
    let start_line = parse_start_line(start_line.trim_end())?;

    let mut via = Vec::new();
    let mut from: Option<NameAddr> = None;
    let mut to: Option<NameAddr> = None;
    let mut call_id: Option<String> = None;
    let mut cseq: Option<CSeq> = None;
    let mut content_length: Option<usize> = None;
    let mut contact = Vec::new();
    let mut route = Vec::new();
    let mut record_route = Vec::new();
    let mut other = Headers::default();

    for line in header_lines {
        if line.len() > MAX_LINE_LENGTH {
            return Err(Error::InvalidFormat("header line too long".into()));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::InvalidFormat(format!("malformed header line '{}'", line)))?;
        let name: HeaderName = name.trim().parse()?;
        let value = value.trim();
        match name {
            HeaderName::Via => via.extend(parse_list(value, |v| v.parse::<Via>())?),
            HeaderName::From => from = Some(value.parse().map_err(|_| Error::header("From", value))?),
            HeaderName::To => to = Some(value.parse().map_err(|_| Error::header("To", value))?),
            HeaderName::CallId if !value.is_empty() => call_id = Some(value.to_string()),
            HeaderName::CallId => return Err(Error::header("Call-ID", "empty")),
            HeaderName::CSeq => cseq = Some(value.parse()?),
            HeaderName::ContentLength => {
                let length = value
                    .parse::<usize>()
                    .map_err(|_| Error::header("Content-Length", value))?;
                content_length = Some(length);
            }
            HeaderName::Contact if value == "*" => other.append(name, value),
            HeaderName::Contact => contact.extend(parse_list(value, |v| v.parse::<NameAddr>())?),
            HeaderName::Route => route.extend(parse_list(value, |v| v.parse::<NameAddr>())?),
            HeaderName::RecordRoute => record_route.extend(parse_list(value, |v| v.parse::<NameAddr>())?),
            name => other.append(name, value),
        }
    }

    let body = match content_length {
        Some(expected) if expected > MAX_BODY_SIZE => {
            return Err(Error::InvalidFormat(format!("body of {} bytes too large", expected)));
        }
        Some(expected) if payload.len() < expected => {
            return Err(Error::BodyTruncated {
                expected,
                actual: payload.len(),
            });
        }
        Some(expected) => {
            if payload.len() > expected {
                trace!(discarded = payload.len() - expected, "Discarding bytes beyond Content-Length");
            }
            Bytes::copy_from_slice(&payload[..expected])
        }
        None => Bytes::copy_from_slice(payload),
    };

    if via.is_empty() {
        return Err(Error::MissingHeader("Via"));
    }
    let mut headers = MessageHeaders::new(
        from.ok_or(Error::MissingHeader("From"))?,
        to.ok_or(Error::MissingHeader("To"))?,
        call_id.ok_or(Error::MissingHeader("Call-ID"))?,
        cseq.ok_or(Error::MissingHeader("CSeq"))?,
    );
    headers.via = via;
    headers.contact = contact;
    headers.route = route;
    headers.record_route = record_route;
    headers.other = other;

    Ok(match start_line {
        StartLine::Request(method, uri) => {
            if headers.cseq.method != method {
                return Err(Error::header("CSeq", "method does not match the request line"));
            }
            Message::Request(Request {
                method,
                uri,
                headers,
                body,
            })
        }
        StartLine::Response(status, reason) => Message::Response(Response {
            status,
            reason,
            headers,
            body,
        }),
    })
}
