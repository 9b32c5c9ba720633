//! SIP request builders (RFC 3261 §8.1.1, §9.1, §17.1.1.3)

use sipflow_sip_core::prelude::*;

/// Maximum hop count written into every request we originate
pub const MAX_FORWARDS: &str = "70";

/// ACK for a non-2xx final response (RFC 3261 §17.1.1.3).
///
/// Same Request-URI, Call-ID, From and CSeq number as the INVITE, the To
/// of the response, only the INVITE's top Via, and its Route set.
pub fn create_ack_from_invite(invite: &Request, response: &Response) -> Request {
    let mut headers = MessageHeaders::new(
        invite.headers.from.clone(),
        response.headers.to.clone(),
        invite.call_id(),
        CSeq::new(invite.cseq().seq, Method::Ack),
    );
    headers.via = invite.headers.top_via().cloned().into_iter().collect();
    headers.route = invite.headers.route.clone();
    headers.set(HeaderName::MaxForwards, MAX_FORWARDS);
    Request::new(Method::Ack, invite.uri.clone(), headers)
}

/// CANCEL for a pending request (RFC 3261 §9.1).
///
/// Request-URI, Call-ID, From, To, CSeq number, top Via (same branch) and
/// Route set are all those of the request being cancelled.
pub fn create_cancel(request: &Request) -> Request {
    let mut headers = MessageHeaders::new(
        request.headers.from.clone(),
        request.headers.to.clone(),
        request.call_id(),
        CSeq::new(request.cseq().seq, Method::Cancel),
    );
    headers.via = request.headers.top_via().cloned().into_iter().collect();
    headers.route = request.headers.route.clone();
    headers.set(HeaderName::MaxForwards, MAX_FORWARDS);
    Request::new(Method::Cancel, request.uri.clone(), headers)
}

/// Fields of a new out-of-dialog request (RFC 3261 §8.1.1)
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    pub method: Method,
    pub request_uri: Uri,
    pub from: NameAddr,
    pub to: NameAddr,
    pub contact: Option<NameAddr>,
    /// Preloaded route set
    pub route_set: Vec<NameAddr>,
    pub cseq: u32,
    pub user_agent: Option<String>,
}

/// Builds a request with a fresh Call-ID and From-tag.
///
/// The Via is left empty: the client transaction adds it together with the branch.
pub fn create_request(template: RequestTemplate) -> Request {
    let mut from = template.from;
    if from.tag().is_none() {
        from.set_tag(generate_tag());
    }
    let mut to = template.to;
    to.params.remove("tag");

    let mut headers = MessageHeaders::new(
        from,
        to,
        generate_call_id(),
        CSeq::new(template.cseq, template.method.clone()),
    );
    headers.route = template.route_set;
    headers.contact = template.contact.into_iter().collect();
    headers.set(HeaderName::MaxForwards, MAX_FORWARDS);
    if let Some(user_agent) = template.user_agent {
        headers.set(HeaderName::UserAgent, user_agent);
    }
    Request::new(template.method, template.request_uri, headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{invite, response_to};

    #[test]
    fn test_cancel_mirrors_invite() {
        let mut invite = invite("z9hG4bKc");
        invite.headers.via.push(Via::new("UDP", "proxy.example.com", None, "z9hG4bKproxy"));
        invite.headers.route.push("<sip:p1.example.com;lr>".parse().unwrap());

        let cancel = create_cancel(&invite);
        assert_eq!(cancel.method, Method::Cancel);
        assert_eq!(cancel.uri, invite.uri);
        assert_eq!(cancel.headers.via.len(), 1);
        assert_eq!(cancel.branch(), Some("z9hG4bKc"));
        assert_eq!(cancel.cseq(), &CSeq::new(1, Method::Cancel));
        assert_eq!(cancel.headers.route, invite.headers.route);
        assert!(!cancel.has_body());
    }

    #[test]
    fn test_ack_takes_to_from_response() {
        let invite = invite("z9hG4bKa");
        let ack = create_ack_from_invite(&invite, &response_to(&invite, 404, Some("remote")));
        assert_eq!(ack.to_tag(), Some("remote"));
        assert_eq!(ack.from_tag(), invite.from_tag());
        assert_eq!(ack.cseq().seq, invite.cseq().seq);
    }

    #[test]
    fn test_create_request_generates_identifiers() {
        let request = create_request(RequestTemplate {
            method: Method::Message,
            request_uri: "sip:bob@biloxi.example.com".parse().unwrap(),
            from: "<sip:alice@atlanta.example.com>".parse().unwrap(),
            to: "<sip:bob@biloxi.example.com>;tag=stale".parse().unwrap(),
            contact: None,
            route_set: Vec::new(),
            cseq: 7,
            user_agent: Some("sipflow".into()),
        });
        assert!(request.from_tag().is_some());
        assert!(request.to_tag().is_none());
        assert_eq!(request.call_id().len(), 32);
        assert_eq!(request.cseq(), &CSeq::new(7, Method::Message));
        assert_eq!(request.headers.get(&HeaderName::UserAgent), Some("sipflow"));
        assert!(request.headers.via.is_empty());
    }
}
