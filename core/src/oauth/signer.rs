/*
 * signer.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Fetchpool, an HTTP request orchestration library.
 *
 * Fetchpool is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Fetchpool is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Fetchpool.  If not, see <http://www.gnu.org/licenses/>.
 */

//! OAuth 1.0a request signing with HMAC-SHA1 (RFC 5849).

use std::fmt;

use base64::Engine;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha1::Sha1;

use crate::params::{encode_component, encode_params, UrlParams};

type HmacSha1 = Hmac<Sha1>;

const MIN_NONCE_LENGTH: usize = 15;
const MAX_NONCE_LENGTH: usize = 30;
const NONCE_CHARACTERS: &[u8] =
    b"abcdefghijklmnopqrstuvwyzABCDEFGHIJKLMNOPQRSTUVWYZ0123456789_";

/// Consumer and token credentials for a signed request.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct OAuthCredentials {
    pub app_key: String,
    pub app_secret: String,
    pub token: String,
    pub token_secret: String,
}

impl OAuthCredentials {
    pub fn new(
        app_key: impl Into<String>,
        app_secret: impl Into<String>,
        token: impl Into<String>,
        token_secret: impl Into<String>,
    ) -> Self {
        Self {
            app_key: app_key.into(),
            app_secret: app_secret.into(),
            token: token.into(),
            token_secret: token_secret.into(),
        }
    }

    fn signing_key(&self) -> String {
        format!("{}&{}", self.app_secret, self.token_secret)
    }
}

impl fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field("app_key", &self.app_key)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

/// Sign a request with a fresh nonce and the current time. Adds the `oauth_*`
/// protocol parameters and `oauth_signature` to `params`.
pub fn sign_request(credentials: &OAuthCredentials, url: &str, method: &str, params: &mut UrlParams) {
    let nonce = generate_nonce();
    let timestamp = chrono::Utc::now().timestamp().to_string();
    sign_request_with(credentials, url, method, params, &nonce, &timestamp);
}

/// Deterministic signing with a caller-chosen nonce and timestamp. Returns the signature base string.
pub fn sign_request_with(
    credentials: &OAuthCredentials,
    url: &str,
    method: &str,
    params: &mut UrlParams,
    nonce: &str,
    timestamp: &str,
) -> String {
    params.insert("oauth_nonce".into(), nonce.to_string());
    params.insert("oauth_timestamp".into(), timestamp.to_string());
    params.insert("oauth_consumer_key".into(), credentials.app_key.clone());
    params.insert("oauth_token".into(), credentials.token.clone());
    params.insert("oauth_version".into(), "1.0".into());
    params.insert("oauth_signature_method".into(), "HMAC-SHA1".into());

    let base = signature_base_string(method, url, params);
    let signature = hmac_sha1_base64(credentials.signing_key().as_bytes(), base.as_bytes());
    params.insert("oauth_signature".into(), signature);
    base
}

/// `METHOD&enc(url)&enc(k1=v1&k2=v2...)`.
pub fn signature_base_string(method: &str, url: &str, params: &UrlParams) -> String {
    format!(
        "{}&{}&{}",
        method,
        encode_component(url),
        encode_component(&encode_params(params))
    )
}

/// Random nonce of 15 to 30 characters.
pub fn generate_nonce() -> String {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(MIN_NONCE_LENGTH..=MAX_NONCE_LENGTH);
    (0..len)
        .map(|_| NONCE_CHARACTERS[rng.gen_range(0..NONCE_CHARACTERS.len())] as char)
        .collect()
}

fn hmac_sha1_base64(key: &[u8], data: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha1::new_from_slice(key) {
        Ok(m) => m,
        Err(_) => return String::new(),
    };
    mac.update(data);
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}
