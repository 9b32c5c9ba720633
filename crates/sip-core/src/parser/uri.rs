use nom::{
    bytes::complete::{take_while, take_while1},
    character::complete::{char, digit1},
    combinator::{all_consuming, map, map_res, opt, recognize},
    multi::{many0, separated_list1},
    sequence::{delimited, pair, preceded, terminated},
};

use super::ParseResult;
use crate::error::{Error, Result};
use crate::types::param::{Param, Params};
use crate::types::uri::{Scheme, Uri};

fn is_unreserved(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-_.!~*'()%".contains(c)
}

fn is_user_char(c: char) -> bool {
    is_unreserved(c) || "&=+$,;?/".contains(c)
}

fn is_password_char(c: char) -> bool {
    is_unreserved(c) || "&=+$,".contains(c)
}

fn is_param_char(c: char) -> bool {
    is_unreserved(c) || "[]/:&+$".contains(c)
}

fn is_header_char(c: char) -> bool {
    is_unreserved(c) || "[]/?:+$".contains(c)
}

fn is_host_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '.'
}

fn scheme(input: &str) -> ParseResult<&str> {
    recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic()),
        take_while(|c: char| c.is_ascii_alphanumeric() || "+-.".contains(c)),
    ))(input)
}

fn userinfo(input: &str) -> ParseResult<(String, Option<String>)> {
    terminated(
        pair(
            map(take_while1(is_user_char), String::from),
            opt(preceded(char(':'), map(take_while(is_password_char), String::from))),
        ),
        char('@'),
    )(input)
}

pub(crate) fn host(input: &str) -> ParseResult<&str> {
    nom::branch::alt((
        recognize(delimited(
            char('['),
            take_while1(|c: char| c.is_ascii_hexdigit() || c == ':' || c == '.'),
            char(']'),
        )),
        take_while1(is_host_char),
    ))(input)
}

pub(crate) fn port(input: &str) -> ParseResult<u16> {
    preceded(char(':'), map_res(digit1, str::parse::<u16>))(input)
}

pub(crate) fn param(input: &str) -> ParseResult<Param> {
    map(
        pair(
            take_while1(is_param_char),
            opt(preceded(char('='), take_while(is_param_char))),
        ),
        |(name, value): (&str, Option<&str>)| Param {
            name: name.to_string(),
            value: value.map(String::from),
        },
    )(input)
}

fn uri_headers(input: &str) -> ParseResult<Vec<(String, String)>> {
    preceded(
        char('?'),
        separated_list1(
            char('&'),
            map(
                pair(take_while1(is_header_char), preceded(char('='), take_while(is_header_char))),
                |(n, v): (&str, &str)| (n.to_string(), v.to_string()),
            ),
        ),
    )(input)
}

/// Parses a URI including its parameters and headers, leaving whatever
/// follows it in the input.
pub(crate) fn uri_with_params(input: &str) -> ParseResult<Uri> {
    uri(input, true)
}

/// Parses an addr-spec outside angle brackets: the URI stops before the
/// first `;` because trailing parameters belong to the header.
pub(crate) fn uri_without_params(input: &str) -> ParseResult<Uri> {
    uri(input, false)
}

fn uri(input: &str, allow_params: bool) -> ParseResult<Uri> {
    let (input, scheme_token) = terminated(scheme, char(':'))(input)?;
    let scheme = Scheme::from_token(scheme_token);

    if !matches!(scheme, Scheme::Sip | Scheme::Sips) {
        let (input, rest) = take_while1(|c: char| {
            !c.is_whitespace() && c != '>' && c != ',' && (allow_params || c != ';')
        })(input)?;
        let mut uri = Uri::sip(rest);
        uri.scheme = scheme;
        return Ok((input, uri));
    }

    let (input, user) = opt(userinfo)(input)?;
    let (input, host) = host(input)?;
    let (input, port) = opt(port)(input)?;
    let (input, params) = if allow_params {
        many0(preceded(char(';'), param))(input)?
    } else {
        (input, Vec::new())
    };
    let (input, headers) = if allow_params {
        opt(uri_headers)(input)?
    } else {
        (input, None)
    };

    let (user, password) = match user {
        Some((user, password)) => (Some(user), password),
        None => (None, None),
    };

    Ok((
        input,
        Uri {
            scheme,
            user,
            password,
            host: host.to_string(),
            port,
            params: Params::from(params),
            headers: headers.unwrap_or_default(),
        },
    ))
}

/// Parses a complete URI string
pub fn parse_uri(input: &str, allow_params: bool) -> Result<Uri> {
    let parser = if allow_params { uri_with_params } else { uri_without_params };
    all_consuming(parser)(input)
        .map(|(_, uri)| uri)
        .map_err(|_| Error::InvalidUri(input.to_string()))
}
