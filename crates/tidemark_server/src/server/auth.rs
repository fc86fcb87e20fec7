#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Claims carried by a `v1.<payload>.<sig>` access token. `sub` is the
/// stable user id the connection registers under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub exp: u64,
}

pub fn verify_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
	if claims.exp <= now {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

/// Mint a signed token for `sub`, valid for `ttl_secs`. Used by ops tooling
/// and tests.
pub fn mint_token(sub: &str, ttl_secs: u64, secret: &str) -> anyhow::Result<String> {
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
	let claims = AuthClaims {
		sub: sub.to_string(),
		exp: now.saturating_add(ttl_secs),
	};

	let payload = serde_json::to_vec(&claims).context("serialize token claims")?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let sig_b64 = URL_SAFE_NO_PAD.encode(sig);

	Ok(format!("v1.{payload_b64}.{sig_b64}"))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
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

	#[test]
	fn mint_then_verify_roundtrip() {
		let token = mint_token("u1", 600, "secret").unwrap();
		let claims = verify_token(&token, "secret").unwrap();
		assert_eq!(claims.sub, "u1");
	}

	#[test]
	fn rejects_wrong_secret() {
		let token = mint_token("u1", 600, "secret").unwrap();
		assert!(verify_token(&token, "other").is_err());
	}

	#[test]
	fn rejects_expired() {
		let token = mint_token("u1", 0, "secret").unwrap();
		assert!(verify_token(&token, "secret").is_err());
	}

	#[test]
	fn rejects_malformed() {
		assert!(verify_token("", "secret").is_err());
		assert!(verify_token("v2.a.b", "secret").is_err());
		assert!(verify_token("v1.not-base64!.sig", "secret").is_err());
	}

	#[test]
	fn rejects_tampered_payload() {
		let token = mint_token("u1", 600, "secret").unwrap();
		let mut parts = token.split('.').map(str::to_string).collect::<Vec<_>>();
		parts[1] = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(br#"{"sub":"admin","exp":99999999999}"#);
		assert!(verify_token(&parts.join("."), "secret").is_err());
	}
}
