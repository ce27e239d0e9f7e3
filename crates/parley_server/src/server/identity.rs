#![forbid(unsafe_code)]

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use parley_domain::UserId;
use parley_util::SecretString;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

/// Who a connection belongs to, fixed at handshake time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
	pub user_id: UserId,
	pub display_name: String,
}

#[derive(Debug, Error)]
pub enum IdentityError {
	#[error("invalid credential format")]
	Malformed,
	#[error("invalid credential signature")]
	BadSignature,
	#[error("credential expired")]
	Expired,
	#[error("credential has an empty subject")]
	EmptySubject,
	#[error("credential claims: {0}")]
	Claims(#[from] serde_json::Error),
	#[error("hmac key rejected")]
	Key,
}

/// Verifies the credential presented in `Hello`.
pub trait IdentityVerifier: Send + Sync {
	fn verify(&self, credential: &str) -> Result<Identity, IdentityError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityClaims {
	pub sub: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	/// Expiry, unix seconds.
	pub exp: u64,
}

/// Stateless `v1.<payload>.<signature>` tokens signed with HMAC-SHA256.
pub struct HmacIdentityVerifier {
	secret: SecretString,
}

impl HmacIdentityVerifier {
	pub fn new(secret: SecretString) -> Self {
		Self { secret }
	}

	pub fn mint(&self, claims: &IdentityClaims) -> Result<String, IdentityError> {
		let payload = serde_json::to_vec(claims)?;
		let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
		let sig = sign(payload_b64.as_bytes(), self.secret.expose().as_bytes())?;
		Ok(format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
	}

	fn verify_at(&self, token: &str, now_unix_secs: u64) -> Result<Identity, IdentityError> {
		let mut parts = token.trim().split('.');
		let (Some("v1"), Some(payload_b64), Some(sig_b64), None) = (parts.next(), parts.next(), parts.next(), parts.next())
		else {
			return Err(IdentityError::Malformed);
		};

		let expected_sig = sign(payload_b64.as_bytes(), self.secret.expose().as_bytes())?;
		let provided_sig = URL_SAFE_NO_PAD
			.decode(sig_b64)
			.map_err(|_| IdentityError::Malformed)?;

		if !constant_time_eq(&expected_sig, &provided_sig) {
			return Err(IdentityError::BadSignature);
		}

		let payload = URL_SAFE_NO_PAD
			.decode(payload_b64)
			.map_err(|_| IdentityError::Malformed)?;
		let claims: IdentityClaims = serde_json::from_slice(&payload)?;
		if claims.exp <= now_unix_secs {
			return Err(IdentityError::Expired);
		}

		let user_id = UserId::new(claims.sub).map_err(|_| IdentityError::EmptySubject)?;
		let display_name = claims
			.name
			.filter(|n| !n.trim().is_empty())
			.unwrap_or_else(|| user_id.to_string());

		Ok(Identity { user_id, display_name })
	}
}

impl IdentityVerifier for HmacIdentityVerifier {
	fn verify(&self, credential: &str) -> Result<Identity, IdentityError> {
		let now = (parley_util::unix_ms_now() / 1000).max(0) as u64;
		self.verify_at(credential, now)
	}
}

/// Trusts `user_id[:display name]` as-is. Local development only.
pub struct DevIdentityVerifier;

impl IdentityVerifier for DevIdentityVerifier {
	fn verify(&self, credential: &str) -> Result<Identity, IdentityError> {
		let (id, name) = match credential.split_once(':') {
			Some((id, name)) => (id.trim(), name.trim()),
			None => (credential.trim(), ""),
		};
		let user_id = UserId::new(id).map_err(|_| IdentityError::EmptySubject)?;
		let display_name = if name.is_empty() { id.to_string() } else { name.to_string() };
		Ok(Identity { user_id, display_name })
	}
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Result<Vec<u8>, IdentityError> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|_| IdentityError::Key)?;
	mac.update(payload_b64);
	Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	fn verifier() -> HmacIdentityVerifier {
		HmacIdentityVerifier::new(SecretString::new("test-secret"))
	}

	fn claims(exp: u64) -> IdentityClaims {
		IdentityClaims {
			sub: "alice".to_string(),
			name: Some("Alice".to_string()),
			exp,
		}
	}

	#[test]
	fn minted_token_verifies() {
		let v = verifier();
		let token = v.mint(&claims(2_000)).unwrap();
		let id = v.verify_at(&token, 1_000).unwrap();
		assert_eq!(id.user_id.as_str(), "alice");
		assert_eq!(id.display_name, "Alice");
	}

	#[test]
	fn expired_token_is_rejected() {
		let v = verifier();
		let token = v.mint(&claims(1_000)).unwrap();
		assert!(matches!(v.verify_at(&token, 1_000), Err(IdentityError::Expired)));
	}

	#[test]
	fn foreign_signature_is_rejected() {
		let other = HmacIdentityVerifier::new(SecretString::new("other"));
		let token = other.mint(&claims(u64::MAX)).unwrap();
		assert!(matches!(verifier().verify(&token), Err(IdentityError::BadSignature)));
	}

	#[test]
	fn malformed_tokens() {
		let v = verifier();
		for t in ["", "v1.a", "v2.a.b", "v1.a.b.c", "v1.!!.??"] {
			assert!(v.verify(t).is_err(), "{t} should fail");
		}
	}

	#[test]
	fn dev_verifier_splits_display_name() {
		let id = DevIdentityVerifier.verify("bob:Bob B").unwrap();
		assert_eq!(id.user_id.as_str(), "bob");
		assert_eq!(id.display_name, "Bob B");

		let id = DevIdentityVerifier.verify("carol").unwrap();
		assert_eq!(id.display_name, "carol");

		assert!(DevIdentityVerifier.verify("  :x").is_err());
	}
}
