#![forbid(unsafe_code)]

use std::net::SocketAddr;

/// Port used when an endpoint omits one.
pub const DEFAULT_PORT: u16 = 18420;

/// Parsed `quic://host[:port]` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuicEndpoint {
	pub host: String,
	pub port: u16,
}

impl QuicEndpoint {
	/// Returns `host:port` (IPv6 hosts stay bracketed).
	pub fn hostport(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}

	/// Host without IPv6 brackets, suitable for TLS server names.
	pub fn server_name(&self) -> &str {
		self.host
			.strip_prefix('[')
			.and_then(|h| h.strip_suffix(']'))
			.unwrap_or(&self.host)
	}

	/// Convert to `SocketAddr` only if the host is an IP literal.
	pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, String> {
		self.hostport()
			.parse()
			.map_err(|_| format!("host must be an IP literal (DNS names not supported here): {}", self.host))
	}

	/// Parse `quic://host:port`; the port may be omitted and defaults to [`DEFAULT_PORT`].
	pub fn parse(s: &str) -> Result<Self, String> {
		let s = s.trim();
		if s.is_empty() {
			return Err("endpoint must be non-empty (expected quic://host[:port])".to_string());
		}

		let rest = s
			.strip_prefix("quic://")
			.ok_or_else(|| format!("invalid endpoint (expected quic://host[:port]): {s}"))?;

		if rest.contains('/') || rest.contains('?') || rest.contains('#') {
			return Err(format!("invalid endpoint (path/query/fragment not allowed): {s}"));
		}

		let (host, port) = split_host_port(rest).map_err(|e| format!("{e}: {s}"))?;

		if host.is_empty() {
			return Err(format!("invalid endpoint host: {s}"));
		}

		Ok(Self {
			host: host.to_string(),
			port,
		})
	}
}

fn split_host_port(rest: &str) -> Result<(&str, u16), &'static str> {
	// Bracketed IPv6, with or without a port.
	if rest.starts_with('[') {
		let close = rest.find(']').ok_or("unterminated IPv6 bracket")?;
		let host = &rest[..=close];
		let tail = &rest[close + 1..];
		if tail.is_empty() {
			return Ok((host, DEFAULT_PORT));
		}
		let port = tail.strip_prefix(':').ok_or("unexpected characters after IPv6 host")?;
		return Ok((host, parse_port(port)?));
	}

	match rest.rsplit_once(':') {
		Some((host, _)) if host.contains(':') => Err("IPv6 hosts must be bracketed like quic://[::1]:18420"),
		Some((host, port)) => Ok((host.trim(), parse_port(port)?)),
		None => Ok((rest.trim(), DEFAULT_PORT)),
	}
}

fn parse_port(s: &str) -> Result<u16, &'static str> {
	match s.trim().parse::<u16>() {
		Ok(0) | Err(_) => Err("invalid port (expected 1..=65535)"),
		Ok(p) => Ok(p),
	}
}
