//! Shared-secret signing for outbound lookup requests.
//!
//! Canonical string: keys sorted lexicographically (the token key excluded),
//! concatenated as `k=v&`, secret appended, MD5, lower-case hex. The digest
//! rides along under the token key and the whole mapping is sent as a
//! percent-encoded query string, again in key order.

use std::collections::BTreeMap;

use md5::{Digest, Md5};

use crate::error::Error;

/// Reserved key carrying the signature.
pub const TOKEN_KEY: &str = "token";

/// An ordered string->scalar form mapping.
#[derive(Debug, Clone, Default)]
pub struct FormData {
    fields: BTreeMap<String, String>,
}

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl ToString) -> &mut Self {
        self.fields.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Parse a percent-encoded query string. Later duplicates win.
    pub fn from_query(query: &str) -> Self {
        let mut form = Self::new();
        for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
            form.set(&k, v);
        }
        form
    }

    /// Compute the signature over every non-token field.
    pub fn sign(&self, secret: &str) -> String {
        let mut canonical = String::new();
        for (k, v) in &self.fields {
            if k == TOKEN_KEY {
                continue;
            }
            canonical.push_str(k);
            canonical.push('=');
            canonical.push_str(v);
            canonical.push('&');
        }
        canonical.push_str(secret);

        let digest = Md5::digest(canonical.as_bytes());
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Verify the presented token against a recomputed signature.
    pub fn check(&self, secret: &str) -> bool {
        match self.get(TOKEN_KEY) {
            Some(presented) => presented == self.sign(secret),
            None => false,
        }
    }

    /// `check`, as a fallible operation.
    pub fn verify(&self, secret: &str) -> Result<(), Error> {
        match self.get(TOKEN_KEY) {
            None => Err(Error::Auth("missing token".into())),
            Some(presented) if presented == self.sign(secret) => Ok(()),
            Some(_) => Err(Error::Auth("mismatched token".into())),
        }
    }

    /// Sign the mapping and render it as a percent-encoded query string.
    pub fn signed_query(mut self, secret: &str) -> String {
        let token = self.sign(secret);
        self.set(TOKEN_KEY, token);
        self.url_encode()
    }

    /// Percent-encode all fields in key order.
    pub fn url_encode(&self) -> String {
        let mut ser = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &self.fields {
            ser.append_pair(k, v);
        }
        ser.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_check_agree() {
        let form = FormData::new().with("username", "ada").with("uid", 42);
        let token = form.sign("s3cret");
        let signed = form.clone().with(TOKEN_KEY, &token);
        assert!(signed.check("s3cret"));
    }

    #[test]
    fn tampering_flips_check() {
        let token = FormData::new().with("username", "ada").sign("s3cret");
        let signed = FormData::new().with("username", "ada").with(TOKEN_KEY, &token);

        // Changed value
        let mut tampered = signed.clone();
        tampered.set("username", "eve");
        assert!(!tampered.check("s3cret"));

        // Added key
        let tampered = signed.clone().with("role", "root");
        assert!(!tampered.check("s3cret"));

        // Wrong secret
        assert!(!signed.check("other"));
    }

    #[test]
    fn missing_token_fails() {
        assert!(!FormData::new().with("username", "ada").check("s3cret"));
    }

    #[test]
    fn token_key_excluded_from_canonical_string() {
        let plain = FormData::new().with("a", 1).with("b", 2);
        let with_stale_token = plain.clone().with(TOKEN_KEY, "garbage");
        assert_eq!(plain.sign("s"), with_stale_token.sign("s"));
    }

    #[test]
    fn url_encode_sorted_and_escaped() {
        let form = FormData::new()
            .with("cmd", "/usr/lib/ssh/sftp-server")
            .with("b", "x y")
            .with("a", "1");
        assert_eq!(
            form.url_encode(),
            "a=1&b=x+y&cmd=%2Fusr%2Flib%2Fssh%2Fsftp-server"
        );
    }

    #[test]
    fn from_query_roundtrip() {
        let q = FormData::new()
            .with("username", "ada")
            .signed_query("s3cret");
        let parsed = FormData::from_query(&q);
        assert!(parsed.check("s3cret"));
        assert_eq!(parsed.get("username"), Some("ada"));
    }
}
