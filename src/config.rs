use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hyper::header::HeaderValue;
use thiserror::Error;

use crate::auth::nt_hash;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("basic credentials must look like login:password")]
    MalformedBasicCredentials,
    #[error("NTLM_CREDENTIALS must look like domain\\user:hex-nt-hash")]
    MalformedNtlmCredentials,
    #[error("the NT hash must be 32 hex digits")]
    MalformedNtHash,
}

/// NTLM account material. Only the NT hash of the password is kept in
/// memory; the cleartext is dropped as soon as the hash is computed.
#[derive(Clone)]
pub struct NtlmCredentials {
    pub domain: String,
    pub username: String,
    pub nt_hash: [u8; 16],
}

impl NtlmCredentials {
    pub fn from_password(domain: &str, username: &str, password: &str) -> Self {
        NtlmCredentials {
            domain: domain.to_string(),
            username: username.to_string(),
            nt_hash: nt_hash(password),
        }
    }

    /// Parses the `NTLM_CREDENTIALS` environment variable format,
    /// `domain\user:hex-nt-hash`, for non-interactive use.
    pub fn from_env_value(value: &str) -> Result<Self, ConfigError> {
        let (identity, hash) = value
            .rsplit_once(':')
            .ok_or(ConfigError::MalformedNtlmCredentials)?;
        let (domain, username) = identity
            .split_once('\\')
            .ok_or(ConfigError::MalformedNtlmCredentials)?;
        if domain.is_empty() || username.is_empty() {
            return Err(ConfigError::MalformedNtlmCredentials);
        }
        Ok(NtlmCredentials {
            domain: domain.to_string(),
            username: username.to_string(),
            nt_hash: decode_nt_hash(hash)?,
        })
    }
}

/// Basic credentials, pre-encoded into the header value sent on the wire.
#[derive(Clone)]
pub struct BasicCredentials {
    header: HeaderValue,
}

impl BasicCredentials {
    /// Parses a `login:password` pair.
    pub fn parse(credentials: &str) -> Result<Self, ConfigError> {
        if !credentials.contains(':') {
            return Err(ConfigError::MalformedBasicCredentials);
        }
        let encoded = format!("Basic {}", BASE64.encode(credentials));
        let header =
            HeaderValue::from_str(&encoded).map_err(|_| ConfigError::MalformedBasicCredentials)?;
        Ok(BasicCredentials { header })
    }

    pub fn header_value(&self) -> HeaderValue {
        self.header.clone()
    }
}

fn decode_nt_hash(hex: &str) -> Result<[u8; 16], ConfigError> {
    if hex.len() != 32 || !hex.is_ascii() {
        return Err(ConfigError::MalformedNtHash);
    }
    let mut hash = [0u8; 16];
    for (i, byte) in hash.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16)
            .map_err(|_| ConfigError::MalformedNtHash)?;
    }
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_credentials_encoding() {
        let credentials = BasicCredentials::parse("aladdin:opensesame").unwrap();
        assert_eq!(credentials.header_value(), "Basic YWxhZGRpbjpvcGVuc2VzYW1l");
        assert!(BasicCredentials::parse("no-colon").is_err());
    }

    #[test]
    fn test_ntlm_credentials_from_env_value() {
        let credentials =
            NtlmCredentials::from_env_value("CORP\\alice:a4f49c406510bdcab6824ee7c30fd852")
                .unwrap();
        assert_eq!(credentials.domain, "CORP");
        assert_eq!(credentials.username, "alice");
        assert_eq!(credentials.nt_hash, nt_hash("Password"));
    }

    #[test]
    fn test_ntlm_credentials_round_trip_with_password_hash() {
        let from_password = NtlmCredentials::from_password("CORP", "alice", "Password");
        let from_env =
            NtlmCredentials::from_env_value("CORP\\alice:a4f49c406510bdcab6824ee7c30fd852")
                .unwrap();
        assert_eq!(from_password.nt_hash, from_env.nt_hash);
    }

    #[test]
    fn test_malformed_ntlm_credentials_are_rejected() {
        assert!(NtlmCredentials::from_env_value("no-separator").is_err());
        assert!(NtlmCredentials::from_env_value("CORP\\alice:shorthash").is_err());
        assert!(
            NtlmCredentials::from_env_value("\\alice:a4f49c406510bdcab6824ee7c30fd852").is_err()
        );
        assert!(
            NtlmCredentials::from_env_value("CORPalice:a4f49c406510bdcab6824ee7c30fd852").is_err()
        );
    }
}
