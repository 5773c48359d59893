//! Request rewriting
//!
//! The sanity checks and header surgery applied to every request before
//! it may travel to the device: hop-by-hop headers vanish, `Host` is
//! forced to the listener's address, and the request forms the device can
//! never answer are rejected up front.

use crate::http::message::HeaderMap;

/// Hop-by-hop headers per RFC 7230 §6.1, plus the de-facto
/// `Proxy-Connection`.
const HOP_BY_HOP: [&str; 8] = [
    "Connection",
    "Keep-Alive",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "Proxy-Connection",
    "Te",
    "Trailer",
    "Transfer-Encoding",
];

/// Remove hop-by-hop headers: the fixed RFC 7230 §6.1 set and anything
/// named in the message's own `Connection` header.
pub fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all("Connection")
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();
    for name in named {
        headers.remove(&name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Force the Host header to the device's pseudo-host.
pub fn force_host(headers: &mut HeaderMap, host: &str) {
    headers.set("Host", host);
}

/// Reject requests the device-side protocol cannot express. Returns the
/// status and message for the error response.
pub fn check_request(method: &str, target: &str, headers: &HeaderMap) -> Option<(u16, &'static str)> {
    if method.eq_ignore_ascii_case("CONNECT") {
        return Some((405, "CONNECT not allowed"));
    }
    if headers.contains("Upgrade") {
        return Some((503, "Protocol upgrade is not implemented"));
    }
    if is_absolute_form(target) {
        return Some((503, "Absolute URL not allowed"));
    }
    None
}

/// Absolute-form request target (`http://host/...`), as opposed to the
/// origin-form (`/path`) and asterisk-form (`*`) we accept.
fn is_absolute_form(target: &str) -> bool {
    !target.starts_with('/') && target != "*"
}
