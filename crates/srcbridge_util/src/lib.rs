#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	/// Parsed `host:port` endpoint (optionally written as `tcp://host:port` / `udp://host:port`).
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct HostPort {
		pub host: String,
		pub port: u16,
	}

	impl HostPort {
		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Convert to `SocketAddr` only if the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("host must be an IP literal (DNS names not supported here): {}", self.host))
		}

		/// Parse `host:port`, accepting an optional `tcp://` or `udp://` scheme.
		///
		/// A missing port falls back to `default_port` when one is given.
		pub fn parse_with_default(s: &str, default_port: Option<u16>) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected host:port)".to_string());
			}

			let rest = s
				.strip_prefix("tcp://")
				.or_else(|| s.strip_prefix("udp://"))
				.unwrap_or(s);

			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!("invalid endpoint (expected host:port without path/query/fragment): {s}"));
			}

			let bracketed_v6_without_port = rest.starts_with('[') && rest.ends_with(']');
			let (host, port_str) = match rest.rsplit_once(':') {
				Some((h, p)) if !bracketed_v6_without_port && !h.is_empty() && !(h.contains(':') && !h.ends_with(']')) => {
					(h, Some(p))
				}
				_ => (rest, None),
			};

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid endpoint host (expected host:port): {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!(
					"invalid endpoint host (IPv6 must be bracketed like [::1]:27015): {s}"
				));
			}

			let port: u16 = match (port_str, default_port) {
				(Some(p), _) => p
					.trim()
					.parse()
					.map_err(|_| format!("invalid endpoint port (expected 1..=65535): {s}"))?,
				(None, Some(p)) => p,
				(None, None) => return Err(format!("invalid endpoint (missing :port, expected host:port): {s}")),
			};

			if port == 0 {
				return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
			}

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}

		/// Parse `host:port` with a mandatory port.
		pub fn parse(s: &str) -> Result<Self, String> {
			Self::parse_with_default(s, None)
		}
	}

}

pub mod time {
	use std::time::{Duration, SystemTime, UNIX_EPOCH};

	/// Current Unix time in milliseconds.
	#[inline]
	pub fn unix_ms_now() -> i64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or(Duration::from_secs(0))
			.as_millis() as i64
	}
}
