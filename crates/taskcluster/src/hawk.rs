//! Hawk request signing as used by the task platform.

use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use url::Url;

pub struct Credentials<'a> {
    pub id: &'a str,
    pub key: &'a str,
}

/// Build an `Authorization` header value for `method` on `url`.
pub fn authorization(
    credentials: &Credentials<'_>,
    method: &str,
    url: &Url,
    ts: i64,
    nonce: &str,
    ext: Option<&str>,
) -> String {
    let resource = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    let port = url.port_or_known_default().unwrap_or(443);
    let ext_value = ext.unwrap_or_default();
    let normalized = format!(
        "hawk.1.header\n{ts}\n{nonce}\n{}\n{resource}\n{host}\n{port}\n\n{ext_value}\n",
        method.to_ascii_uppercase()
    );
    let mut mac = Hmac::<Sha256>::new_from_slice(credentials.key.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(normalized.as_bytes());
    let mac = STANDARD.encode(mac.finalize().into_bytes());
    let mut header = format!(r#"Hawk id="{}", ts="{ts}", nonce="{nonce}""#, credentials.id);
    if let Some(ext) = ext {
        header.push_str(&format!(r#", ext="{ext}""#));
    }
    header.push_str(&format!(r#", mac="{mac}""#));
    header
}
