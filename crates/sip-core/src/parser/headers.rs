use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while, take_while1},
    character::complete::{char, space1},
    combinator::{all_consuming, map, opt, peek},
    error::{Error as NomError, ErrorKind},
    multi::many0,
    sequence::{delimited, pair, preceded, terminated, tuple},
};

use super::uri::{host, port, uri_with_params, uri_without_params};
use super::{is_token_char, ParseResult};
use crate::error::{Error, Result};
use crate::types::address::NameAddr;
use crate::types::param::{Param, Params};
use crate::types::via::Via;

fn sws(input: &str) -> ParseResult<&str> {
    take_while(|c: char| c == ' ' || c == '\t')(input)
}

/// quoted-string with backslash escapes removed
pub(crate) fn quoted_string(input: &str) -> ParseResult<String> {
    let (rest, _) = char('"')(input)?;
    let mut value = String::new();
    let mut chars = rest.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((&rest[i + 1..], value)),
            '\\' => match chars.next() {
                Some((_, escaped)) => value.push(escaped),
                None => break,
            },
            other => value.push(other),
        }
    }
    Err(nom::Err::Error(NomError::new(input, ErrorKind::Char)))
}

fn is_gen_value_char(c: char) -> bool {
    is_token_char(c) || ":[]".contains(c)
}

/// `name[=value]` header parameter; quoted values keep their quotes so
/// they serialize back unchanged
fn header_param(input: &str) -> ParseResult<Param> {
    map(
        pair(
            take_while1(is_token_char),
            opt(preceded(
                delimited(sws, char('='), sws),
                alt((
                    map(quoted_string, |v| format!("\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\""))),
                    map(take_while1(is_gen_value_char), String::from),
                )),
            )),
        ),
        |(name, value): (&str, Option<String>)| Param {
            name: name.to_string(),
            value,
        },
    )(input)
}

fn header_params(input: &str) -> ParseResult<Params> {
    map(
        many0(preceded(tuple((sws, char(';'), sws)), header_param)),
        Params::from,
    )(input)
}

fn display_name(input: &str) -> ParseResult<String> {
    alt((
        terminated(quoted_string, sws),
        map(
            terminated(take_while1(|c: char| c != '<' && c != '"'), peek(char('<'))),
            |name: &str| name.trim().to_string(),
        ),
    ))(input)
}

fn name_addr(input: &str) -> ParseResult<NameAddr> {
    let (input, display_name) = opt(display_name)(input)?;
    let (input, uri) = delimited(char('<'), uri_with_params, char('>'))(input)?;
    let (input, params) = header_params(input)?;
    Ok((
        input,
        NameAddr {
            display_name: display_name.filter(|n| !n.is_empty()),
            uri,
            params,
        },
    ))
}

fn addr_spec(input: &str) -> ParseResult<NameAddr> {
    let (input, uri) = uri_without_params(input)?;
    let (input, params) = header_params(input)?;
    Ok((
        input,
        NameAddr {
            display_name: None,
            uri,
            params,
        },
    ))
}

/// Parses a From/To/Contact/Route/Record-Route value
pub fn parse_name_addr(input: &str) -> Result<NameAddr> {
    all_consuming(terminated(alt((name_addr, addr_spec)), sws))(input)
        .map(|(_, addr)| addr)
        .map_err(|_| Error::header("address", input))
}

fn via(input: &str) -> ParseResult<Via> {
    let (input, _) = tuple((
        tag_no_case("SIP"),
        sws,
        char('/'),
        sws,
        tag("2.0"),
        sws,
        char('/'),
        sws,
    ))(input)?;
    let (input, transport) = take_while1(is_token_char)(input)?;
    let (input, _) = space1(input)?;
    let (input, host) = host(input)?;
    let (input, port) = opt(port)(input)?;
    let (input, params) = header_params(input)?;
    Ok((
        input,
        Via {
            transport: transport.to_ascii_uppercase(),
            host: host.to_string(),
            port,
            params,
        },
    ))
}

/// Parses a single Via entry
pub fn parse_via(input: &str) -> Result<Via> {
    all_consuming(terminated(via, sws))(input)
        .map(|(_, via)| via)
        .map_err(|_| Error::header("Via", input))
}
