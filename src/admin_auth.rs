//! Optional authentication for the admin endpoints (`/_status*`,
//! `/_metrics`). The scheme is fixed at server construction; credential
//! comparison is constant-time.

use crate::config::AdminAuthConfig;
use base64_decode::decode_standard;
use hyper::header::AUTHORIZATION;
use hyper::HeaderMap;
use subtle::ConstantTimeEq;

/// The configured admin authentication scheme, selected once at startup.
#[derive(Debug, Clone)]
pub enum AdminAuth {
    None,
    Basic { username: String, password: String },
    Bearer { token: String },
}

impl AdminAuth {
    /// Builds the variant from a validated config section.
    pub fn from_config(cfg: &AdminAuthConfig) -> Self {
        match cfg.method.as_str() {
            "basic" => AdminAuth::Basic {
                username: cfg.username.clone(),
                password: cfg.password.clone(),
            },
            "bearer" => AdminAuth::Bearer {
                token: cfg.token.clone(),
            },
            _ => AdminAuth::None,
        }
    }

    /// Checks the request's Authorization header against the configured
    /// scheme.
    pub fn check(&self, headers: &HeaderMap) -> bool {
        match self {
            AdminAuth::None => true,
            AdminAuth::Basic { username, password } => {
                check_basic(headers, username, password)
            }
            AdminAuth::Bearer { token } => check_bearer(headers, token),
        }
    }

    /// The `WWW-Authenticate` challenge to attach to a 401, if any.
    pub fn challenge(&self) -> Option<&'static str> {
        match self {
            AdminAuth::Basic { .. } => Some("Basic realm=\"Wakegate Admin\""),
            _ => None,
        }
    }
}

fn check_basic(headers: &HeaderMap, want_user: &str, want_pass: &str) -> bool {
    let Some(auth) = header_str(headers) else {
        return false;
    };
    let Some(encoded) = auth.strip_prefix("Basic ") else {
        return false;
    };
    let Some(decoded) = decode_standard(encoded) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, pass)) = decoded.split_once(':') else {
        return false;
    };

    let user_ok = user.as_bytes().ct_eq(want_user.as_bytes());
    let pass_ok = pass.as_bytes().ct_eq(want_pass.as_bytes());
    bool::from(user_ok & pass_ok)
}

fn check_bearer(headers: &HeaderMap, want_token: &str) -> bool {
    let Some(auth) = header_str(headers) else {
        return false;
    };
    let Some(token) = auth.strip_prefix("Bearer ") else {
        return false;
    };
    bool::from(token.as_bytes().ct_eq(want_token.as_bytes()))
}

fn header_str(headers: &HeaderMap) -> Option<&str> {
    headers.get(AUTHORIZATION)?.to_str().ok()
}

/// Minimal standard-alphabet base64 decoder for the Basic scheme.
mod base64_decode {
    const ALPHABET: &[u8; 64] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    fn value(b: u8) -> Option<u32> {
        ALPHABET.iter().position(|&c| c == b).map(|p| p as u32)
    }

    pub fn decode_standard(s: &str) -> Option<Vec<u8>> {
        let s = s.trim_end_matches('=');
        let mut out = Vec::with_capacity(s.len() * 3 / 4);
        for chunk in s.as_bytes().chunks(4) {
            if chunk.len() == 1 {
                return None;
            }
            let mut acc: u32 = 0;
            for &b in chunk {
                acc = (acc << 6) | value(b)?;
            }
            acc <<= 6 * (4 - chunk.len()) as u32;
            let bytes = acc.to_be_bytes();
            out.extend_from_slice(&bytes[1..chunk.len()]);
        }
        Some(out)
    }
}
