//! Digest authentication for challenged requests (RFC 2617, RFC 3261 §22)

use md5::{Digest, Md5};
use tracing::debug;

use sipflow_sip_core::prelude::*;

use crate::config::Credentials;

fn md5_hex(data: &str) -> String {
    format!("{:x}", Md5::digest(data.as_bytes()))
}

/// Digest `response` value. With `qop`, `nc` and `cnonce` take part too.
pub(crate) fn digest_response(
    credentials: &Credentials,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<(&str, &str, &str)>,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", credentials.username, realm, credentials.password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));
    match qop {
        Some((qop, nc, cnonce)) => md5_hex(&format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2)),
        None => md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

/// Header answering the challenge in `response` for `request`, or `None`
/// when there is no usable Digest challenge for these credentials.
///
/// 401 carries `WWW-Authenticate` and is answered with `Authorization`;
/// 407 carries `Proxy-Authenticate` and is answered with
/// `Proxy-Authorization`.
pub(crate) fn authorization_for(
    response: &Response,
    request: &Request,
    credentials: &Credentials,
) -> Option<(HeaderName, String)> {
    let (challenge_header, answer_header) = match response.status {
        StatusCode::UNAUTHORIZED => (HeaderName::WwwAuthenticate, HeaderName::Authorization),
        StatusCode::PROXY_AUTHENTICATION_REQUIRED => (HeaderName::ProxyAuthenticate, HeaderName::ProxyAuthorization),
        _ => return None,
    };
    let challenge = response
        .headers
        .other
        .get_all(&challenge_header)
        .filter_map(|value| value.parse::<DigestChallenge>().ok())
        .find(|c| c.is_md5() && credentials.realm.as_deref().is_none_or(|realm| realm == c.realm))?;

    let uri = request.uri.to_string();
    let method = request.method.as_str();
    let (qop, nc, cnonce) = if challenge.supports_qop_auth() {
        let cnonce = format!("{:016x}", rand::random::<u64>());
        (Some("auth".to_string()), Some("00000001".to_string()), Some(cnonce))
    } else {
        (None, None, None)
    };
    let qop_args = match (&qop, &nc, &cnonce) {
        (Some(q), Some(n), Some(c)) => Some((q.as_str(), n.as_str(), c.as_str())),
        _ => None,
    };
    let digest = digest_response(credentials, &challenge.realm, &challenge.nonce, method, &uri, qop_args);
    debug!(realm = %challenge.realm, "Answering {} challenge", response.status);

    let authorization = DigestAuthorization {
        username: credentials.username.clone(),
        realm: challenge.realm.clone(),
        nonce: challenge.nonce.clone(),
        uri,
        response: digest,
        algorithm: challenge.algorithm.clone(),
        opaque: challenge.opaque.clone(),
        qop,
        cnonce,
        nc,
    };
    Some((answer_header, authorization.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{request, response_to};

    #[test]
    fn test_rfc2617_vector() {
        let credentials = Credentials::new("Mufasa", "Circle Of Life");
        let response = digest_response(
            &credentials,
            "testrealm@host.com",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "GET",
            "/dir/index.html",
            Some(("auth", "00000001", "0a4f113b")),
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_answers_proxy_challenge() {
        let register = request(Method::Register, "z9hG4bK1");
        let mut challenge = response_to(&register, 407, Some("proxy"));
        challenge.headers.append(
            HeaderName::ProxyAuthenticate,
            r#"Digest realm="atlanta.example.com", nonce="84a4cc6f3082121f32b42a2187831a9e", qop="auth""#,
        );
        let credentials = Credentials::new("alice", "secret");

        let (name, value) = authorization_for(&challenge, &register, &credentials).unwrap();
        assert_eq!(name, HeaderName::ProxyAuthorization);
        let parsed: DigestAuthorization = value.parse().unwrap();
        assert_eq!(parsed.realm, "atlanta.example.com");
        assert_eq!(parsed.qop.as_deref(), Some("auth"));
        assert_eq!(parsed.nc.as_deref(), Some("00000001"));
        let expected = digest_response(
            &credentials,
            "atlanta.example.com",
            "84a4cc6f3082121f32b42a2187831a9e",
            "REGISTER",
            "sip:bob@biloxi.example.com",
            Some(("auth", "00000001", parsed.cnonce.as_deref().unwrap())),
        );
        assert_eq!(parsed.response, expected);
    }

    #[test]
    fn test_realm_mismatch_and_missing_challenge() {
        let invite = request(Method::Invite, "z9hG4bK1");
        let mut challenge = response_to(&invite, 401, Some("uas"));
        let credentials = Credentials::new("alice", "secret").with_realm("other.example.com");
        assert!(authorization_for(&challenge, &invite, &credentials).is_none());

        challenge
            .headers
            .append(HeaderName::WwwAuthenticate, r#"Digest realm="biloxi.example.com", nonce="abc""#);
        assert!(authorization_for(&challenge, &invite, &credentials).is_none());

        let (name, value) = authorization_for(&challenge, &invite, &Credentials::new("alice", "secret")).unwrap();
        assert_eq!(name, HeaderName::Authorization);
        assert!(!value.contains("qop"));
    }
}
