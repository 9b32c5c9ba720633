//! SIP response builders (RFC 3261 §8.2.6)

use sipflow_sip_core::prelude::*;

/// Response to `request`, adding `to_tag` to the To header when the
/// request carried none. 100 Trying never gets a tag.
pub fn create_response(request: &Request, status: StatusCode, to_tag: Option<&str>) -> Response {
    let mut response = Response::for_request(status, request);
    if status != StatusCode::TRYING && response.headers.to_tag().is_none() {
        if let Some(tag) = to_tag {
            response.headers.to.set_tag(tag);
        }
    }
    response
}

/// Response sent outside any transaction, with a fresh To-tag if needed
pub fn create_stateless_response(request: &Request, status: StatusCode) -> Response {
    create_response(request, status, Some(&generate_tag()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::request;

    #[test]
    fn test_tag_added_only_when_missing() {
        let req = request(Method::Options, "z9hG4bK1");
        let resp = create_response(&req, StatusCode::OK, Some("mine"));
        assert_eq!(resp.to_tag(), Some("mine"));

        let trying = create_response(&req, StatusCode::TRYING, Some("mine"));
        assert_eq!(trying.to_tag(), None);

        let mut in_dialog = req.clone();
        in_dialog.headers.to.set_tag("existing");
        assert_eq!(create_stateless_response(&in_dialog, StatusCode::SERVER_INTERNAL_ERROR).to_tag(), Some("existing"));
    }
}
