use http::HeaderMap;
use std::net::IpAddr;

pub const HEADER_FORWARDED_FOR: &str = "x-forwarded-for";
pub const HEADER_REAL_IP: &str = "x-real-ip";
pub const HEADER_REQUEST_PRIORITY: &str = "x-request-priority";
pub const HEADER_USER_ID: &str = "x-user-id";
pub const HEADER_TENANT_ID: &str = "x-tenant-id";
pub const HEADER_AUTHORIZATION: &str = "authorization";
pub const HEADER_CORRELATION_ID: &str = "x-correlation-id";

pub const PRIORITY_HIGHEST: u8 = 0;
pub const PRIORITY_NORMAL: u8 = 5;
pub const PRIORITY_LOWEST: u8 = 9;

/// Who is calling and how urgently. Extracted once per request and
/// immutable afterwards; every subsystem keys off these fields.
#[derive(Debug, Clone)]
pub struct RequestIdentity {
    pub client_ip: IpAddr,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub path: String,
    pub method: String,
    /// 0 (highest) to 9 (lowest).
    pub priority: u8,
    pub correlation_id: String,
    /// An Authorization header was present. Token verification happens
    /// upstream of the core.
    pub authenticated: bool,
}

impl RequestIdentity {
    pub fn ip_string(&self) -> String {
        self.client_ip.to_string()
    }
}

/// Derive the request identity from headers and the socket peer.
pub fn extract(headers: &HeaderMap, peer_ip: IpAddr, path: &str, method: &str) -> RequestIdentity {
    RequestIdentity {
        client_ip: client_ip(headers, peer_ip),
        user_id: header_str(headers, HEADER_USER_ID).map(str::to_owned),
        tenant_id: header_str(headers, HEADER_TENANT_ID).map(str::to_owned),
        path: path.to_string(),
        method: method.to_string(),
        priority: priority(headers, path),
        correlation_id: header_str(headers, HEADER_CORRELATION_ID)
            .map(str::to_owned)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        authenticated: headers.contains_key(HEADER_AUTHORIZATION),
    }
}

/// The real client IP: first `X-Forwarded-For` entry (a trusted reverse
/// proxy in front is assumed), then `X-Real-IP`, then the TCP peer.
fn client_ip(headers: &HeaderMap, peer_ip: IpAddr) -> IpAddr {
    if let Some(xff) = header_str(headers, HEADER_FORWARDED_FOR) {
        if let Some(first) = xff.split(',').next() {
            if let Ok(ip) = first.trim().parse::<IpAddr>() {
                return ip;
            }
        }
    }
    if let Some(real) = header_str(headers, HEADER_REAL_IP) {
        if let Ok(ip) = real.trim().parse::<IpAddr>() {
            return ip;
        }
    }
    peer_ip
}

/// Explicit priority header wins; otherwise the path prefix decides.
fn priority(headers: &HeaderMap, path: &str) -> u8 {
    if let Some(v) = header_str(headers, HEADER_REQUEST_PRIORITY) {
        if let Ok(p) = v.trim().parse::<u8>() {
            return p.min(PRIORITY_LOWEST);
        }
    }
    if path.starts_with("/important/") {
        PRIORITY_HIGHEST
    } else if path.starts_with("/normal/") {
        PRIORITY_NORMAL
    } else {
        PRIORITY_LOWEST
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
