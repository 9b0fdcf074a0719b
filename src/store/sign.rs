//! AWS SigV4 request signing for stores that require signed requests.
//!
//! Credentials come from the ambient environment: `AWS_ACCESS_KEY_ID`,
//! `AWS_SECRET_ACCESS_KEY`, optional `AWS_SESSION_TOKEN`, and `AWS_REGION`
//! (falling back to `AWS_DEFAULT_REGION`).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "es";

/// Signs outgoing store requests with the SigV4 scheme.
pub struct SigV4Signer {
    access_key: String,
    secret_key: String,
    session_token: Option<String>,
    region: String,
}

impl SigV4Signer {
    /// Builds a signer from environment credentials.
    pub fn from_env() -> Result<Self> {
        let access_key =
            std::env::var("AWS_ACCESS_KEY_ID").context("AWS_ACCESS_KEY_ID is not set")?;
        let secret_key =
            std::env::var("AWS_SECRET_ACCESS_KEY").context("AWS_SECRET_ACCESS_KEY is not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();
        let region = std::env::var("AWS_REGION")
            .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
            .context("AWS_REGION is not set")?;

        Ok(Self {
            access_key,
            secret_key,
            session_token,
            region,
        })
    }

    /// Adds `x-amz-date`, `host`, optional session-token and `authorization`
    /// headers to the request.
    pub fn sign(&self, request: &mut reqwest::Request) -> Result<()> {
        self.sign_at(request, Utc::now())
    }

    fn sign_at(&self, request: &mut reqwest::Request, now: DateTime<Utc>) -> Result<()> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let host = request
            .url()
            .host_str()
            .context("store request URL has no host")?
            .to_string();
        let host = match request.url().port() {
            Some(port) => format!("{host}:{port}"),
            None => host,
        };

        let payload = request
            .body()
            .and_then(reqwest::Body::as_bytes)
            .unwrap_or_default();
        let payload_hash = hex::encode(Sha256::digest(payload));

        let canonical_uri = if request.url().path().is_empty() {
            "/"
        } else {
            request.url().path()
        };
        let canonical_query = canonical_query_string(request.url());

        let mut header_pairs = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(token) = &self.session_token {
            header_pairs.push(("x-amz-security-token".to_string(), token.clone()));
        }
        header_pairs.sort();

        let canonical_headers: String = header_pairs
            .iter()
            .map(|(k, v)| format!("{k}:{v}\n"))
            .collect();
        let signed_headers = header_pairs
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            request.method().as_str(),
            canonical_uri,
            canonical_query,
            canonical_headers,
            signed_headers,
            payload_hash,
        );

        let scope = format!("{date}/{}/{SERVICE}/aws4_request", self.region);
        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes())),
        );

        let signing_key = self.signing_key(&date);
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.access_key,
        );

        let headers = request.headers_mut();
        headers.insert("host", host.parse().context("host header value")?);
        headers.insert("x-amz-date", amz_date.parse().context("date header value")?);
        if let Some(token) = &self.session_token {
            headers.insert(
                "x-amz-security-token",
                token.parse().context("token header value")?,
            );
        }
        headers.insert(
            reqwest::header::AUTHORIZATION,
            authorization.parse().context("authorization header value")?,
        );

        Ok(())
    }

    fn signing_key(&self, date: &str) -> Vec<u8> {
        let k_date = hmac_sha256(
            format!("AWS4{}", self.secret_key).as_bytes(),
            date.as_bytes(),
        );
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, SERVICE.as_bytes());
        hmac_sha256(&k_service, b"aws4_request")
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Query parameters sorted by encoded name, strictly RFC 3986 encoded.
fn canonical_query_string(url: &reqwest::Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (uri_encode(&k), uri_encode(&v)))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn uri_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn signer() -> SigV4Signer {
        SigV4Signer {
            access_key: "AKIDEXAMPLE".to_string(),
            secret_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            session_token: None,
            region: "us-east-1".to_string(),
        }
    }

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap()
    }

    fn build_request(url: &str) -> reqwest::Request {
        reqwest::Client::new().get(url).build().unwrap()
    }

    #[test]
    fn test_sign_sets_expected_headers() {
        let mut request = build_request("http://search.example.com:9200/billing");
        signer().sign_at(&mut request, fixed_time()).unwrap();

        assert_eq!(
            request.headers().get("x-amz-date").unwrap(),
            "20150830T123600Z"
        );
        assert_eq!(
            request.headers().get("host").unwrap(),
            "search.example.com:9200"
        );

        let auth = request
            .headers()
            .get(reqwest::header::AUTHORIZATION)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(auth.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/es/aws4_request"
        ));
        assert!(auth.contains("SignedHeaders=host;x-amz-date"));
        assert!(auth.contains("Signature="));
    }

    #[test]
    fn test_sign_is_deterministic() {
        let mut a = build_request("http://search.example.com/billing");
        let mut b = build_request("http://search.example.com/billing");
        signer().sign_at(&mut a, fixed_time()).unwrap();
        signer().sign_at(&mut b, fixed_time()).unwrap();
        assert_eq!(
            a.headers().get(reqwest::header::AUTHORIZATION),
            b.headers().get(reqwest::header::AUTHORIZATION)
        );
    }

    #[test]
    fn test_session_token_joins_signed_headers() {
        let signer = SigV4Signer {
            session_token: Some("SESSIONTOKEN".to_string()),
            ..signer()
        };
        let mut request = build_request("http://search.example.com/billing");
        signer.sign_at(&mut request, fixed_time()).unwrap();

        assert_eq!(
            request.headers().get("x-amz-security-token").unwrap(),
            "SESSIONTOKEN"
        );
        let auth = request
            .headers()
            .get(reqwest::header::AUTHORIZATION)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(auth.contains("SignedHeaders=host;x-amz-date;x-amz-security-token"));
    }

    #[test]
    fn test_canonical_query_is_sorted_and_encoded() {
        let url = reqwest::Url::parse("http://h/p?b=2&a=1&q=RecordId:42").unwrap();
        assert_eq!(canonical_query_string(&url), "a=1&b=2&q=RecordId%3A42");
    }

    #[test]
    fn test_uri_encode_keeps_unreserved() {
        assert_eq!(uri_encode("abc-XYZ_0.9~"), "abc-XYZ_0.9~");
        assert_eq!(uri_encode("a b/c"), "a%20b%2Fc");
    }
}
