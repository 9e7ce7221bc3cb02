use std::net::IpAddr;

/// Admin Gate: PIN/token auth plus a loopback bypass for HTTP endpoints
/// (spec §6 "Admin Gate"). The WebSocket admin check never consults this —
/// it uses the bound session's `isAdmin` flag directly (spec §4.5 "Admin
/// gating").
pub struct AdminGate {
    pin: Option<String>,
    token: Option<String>,
}

impl AdminGate {
    pub fn new(pin: Option<String>, token: Option<String>) -> Self {
        Self { pin, token }
    }

    /// Loopback origins are trusted even without a PIN — a deliberate,
    /// first-class check (Design Notes "Admin localhost bypass"), not an
    /// afterthought bolted onto the token check.
    pub fn is_authorized(&self, remote_addr: Option<IpAddr>, pin: Option<&str>, bearer: Option<&str>) -> bool {
        if let Some(addr) = remote_addr {
            if is_loopback(addr) {
                return true;
            }
        }
        if let (Some(expected), Some(given)) = (&self.pin, pin) {
            if expected == given {
                return true;
            }
        }
        if let (Some(expected), Some(given)) = (&self.token, bearer) {
            if expected == given {
                return true;
            }
        }
        false
    }
}

fn is_loopback(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_bypasses_pin() {
        let gate = AdminGate::new(Some("1234".into()), None);
        assert!(gate.is_authorized(Some("127.0.0.1".parse().unwrap()), None, None));
    }

    #[test]
    fn remote_needs_matching_pin() {
        let gate = AdminGate::new(Some("1234".into()), None);
        let remote = Some("10.0.0.5".parse().unwrap());
        assert!(!gate.is_authorized(remote, None, None));
        assert!(!gate.is_authorized(remote, Some("0000"), None));
        assert!(gate.is_authorized(remote, Some("1234"), None));
    }

    #[test]
    fn token_also_authorizes_remote() {
        let gate = AdminGate::new(None, Some("secret-token".into()));
        let remote = Some("10.0.0.5".parse().unwrap());
        assert!(gate.is_authorized(remote, None, Some("secret-token")));
        assert!(!gate.is_authorized(remote, None, Some("wrong")));
    }
}
