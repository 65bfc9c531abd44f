use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use hyper::header::{HeaderValue, PROXY_AUTHENTICATE};
use hyper::{HeaderMap, Response, StatusCode};
use md4::{Digest, Md4};
use md5::Md5;
use tracing::debug;

use crate::auth::{drain, AuthError};
use crate::config::NtlmCredentials;
use crate::proxy::transport::{Body, ProxyRequest, RoundTripper};

type HmacMd5 = Hmac<Md5>;

/// NTLMv2 proxy authentication per [MS-NLMP].
///
/// The handshake is connection-bound: the Type 1 message provokes a 407
/// carrying the Type 2 challenge, and the Type 3 response must be sent on
/// the same TCP connection. The caller provides that guarantee by handing
/// us a round-tripper pinned to a single socket.
pub struct NtlmAuthenticator {
    credentials: NtlmCredentials,
}

impl NtlmAuthenticator {
    pub fn new(credentials: NtlmCredentials) -> Self {
        NtlmAuthenticator { credentials }
    }

    pub(crate) async fn authenticate<R: RoundTripper>(
        &self,
        request: &ProxyRequest,
        transport: &mut R,
    ) -> Result<Response<Body>, AuthError> {
        let negotiate = authorization_value(&negotiate_message());
        let response = transport
            .round_trip(request.to_request(Some(negotiate))?)
            .await?;
        if response.status() != StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            return Ok(response);
        }
        let Some(token) = challenge_token(response.headers()) else {
            // 407 without an NTLM challenge: nothing more we can do here,
            // let the chain decide.
            return Ok(response);
        };
        let raw = BASE64
            .decode(token)
            .map_err(|e| AuthError::BadChallenge(format!("undecodable Type 2 message: {e}")))?;
        let challenge = parse_challenge(&raw)?;
        debug!("received NTLM challenge, sending Type 3 message");

        // Drain the interim 407 so the pinned connection is free to carry
        // the Type 3 message.
        drain(response).await;

        let client_nonce: [u8; 8] = rand::random();
        let authenticate = authenticate_message(
            &self.credentials,
            &challenge,
            &client_nonce,
            filetime_now(),
        );
        let response = transport
            .round_trip(request.to_request(Some(authorization_value(&authenticate)))?)
            .await?;
        Ok(response)
    }
}

fn authorization_value(message: &[u8]) -> HeaderValue {
    let encoded = format!("NTLM {}", BASE64.encode(message));
    HeaderValue::from_str(&encoded).expect("base64 is always a valid header value")
}

/// Extracts the base64 Type 2 blob from a `Proxy-Authenticate: NTLM <...>`
/// header, if present.
fn challenge_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(PROXY_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| {
            let rest = value.trim().strip_prefix("NTLM ")?;
            let token = rest.trim();
            (!token.is_empty()).then_some(token)
        })
}

// -- [MS-NLMP] wire messages ----------------------------------------------

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

mod flags {
    pub const UNICODE: u32 = 0x0000_0001;
    pub const REQUEST_TARGET: u32 = 0x0000_0004;
    pub const NTLM: u32 = 0x0000_0200;
    pub const ALWAYS_SIGN: u32 = 0x0000_8000;
    pub const EXTENDED_SESSION_SECURITY: u32 = 0x0008_0000;
    pub const KEY_128: u32 = 0x2000_0000;
    pub const KEY_56: u32 = 0x8000_0000;
}

const NEGOTIATE_FLAGS: u32 = flags::UNICODE
    | flags::REQUEST_TARGET
    | flags::NTLM
    | flags::ALWAYS_SIGN
    | flags::EXTENDED_SESSION_SECURITY
    | flags::KEY_128
    | flags::KEY_56;

/// Type 1 (NEGOTIATE) message with empty domain and workstation fields.
pub(crate) fn negotiate_message() -> Vec<u8> {
    let mut msg = Vec::with_capacity(32);
    msg.extend_from_slice(SIGNATURE);
    msg.extend_from_slice(&1u32.to_le_bytes());
    msg.extend_from_slice(&NEGOTIATE_FLAGS.to_le_bytes());
    put_security_buffer(&mut msg, 0, 32); // domain
    put_security_buffer(&mut msg, 0, 32); // workstation
    msg
}

pub(crate) struct Challenge {
    pub server_challenge: [u8; 8],
    pub target_info: Vec<u8>,
}

/// Parses a Type 2 (CHALLENGE) message: signature, message type, server
/// challenge, and the target info block NTLMv2 echoes back.
pub(crate) fn parse_challenge(data: &[u8]) -> Result<Challenge, AuthError> {
    if data.len() < 48 {
        return Err(AuthError::BadChallenge(format!(
            "Type 2 message too short ({} bytes)",
            data.len()
        )));
    }
    if &data[..8] != SIGNATURE {
        return Err(AuthError::BadChallenge("bad NTLMSSP signature".to_string()));
    }
    if read_u32(data, 8) != 2 {
        return Err(AuthError::BadChallenge(format!(
            "expected a Type 2 message, got type {}",
            read_u32(data, 8)
        )));
    }
    let mut server_challenge = [0u8; 8];
    server_challenge.copy_from_slice(&data[24..32]);

    let info_len = read_u16(data, 40) as usize;
    let info_offset = read_u32(data, 44) as usize;
    let Some(target_info) = data.get(info_offset..info_offset + info_len) else {
        return Err(AuthError::BadChallenge(
            "target info extends past end of message".to_string(),
        ));
    };

    Ok(Challenge {
        server_challenge,
        target_info: target_info.to_vec(),
    })
}

/// Type 3 (AUTHENTICATE) message carrying the NTLMv2 responses.
pub(crate) fn authenticate_message(
    credentials: &NtlmCredentials,
    challenge: &Challenge,
    client_nonce: &[u8; 8],
    timestamp: u64,
) -> Vec<u8> {
    let domain = utf16le(&credentials.domain);
    let user = utf16le(&credentials.username);
    let ntowf = ntowf_v2(
        &credentials.nt_hash,
        &credentials.username,
        &credentials.domain,
    );
    let (lm_response, nt_response) = ntlm_v2_responses(
        &ntowf,
        &challenge.server_challenge,
        client_nonce,
        timestamp,
        &challenge.target_info,
    );

    const HEADER_LEN: u32 = 64;
    let domain_offset = HEADER_LEN;
    let user_offset = domain_offset + domain.len() as u32;
    let workstation_offset = user_offset + user.len() as u32;
    let lm_offset = workstation_offset; // workstation is empty
    let nt_offset = lm_offset + lm_response.len() as u32;
    let session_key_offset = nt_offset + nt_response.len() as u32;

    let mut msg = Vec::with_capacity(session_key_offset as usize);
    msg.extend_from_slice(SIGNATURE);
    msg.extend_from_slice(&3u32.to_le_bytes());
    put_security_buffer(&mut msg, lm_response.len(), lm_offset);
    put_security_buffer(&mut msg, nt_response.len(), nt_offset);
    put_security_buffer(&mut msg, domain.len(), domain_offset);
    put_security_buffer(&mut msg, user.len(), user_offset);
    put_security_buffer(&mut msg, 0, workstation_offset);
    put_security_buffer(&mut msg, 0, session_key_offset);
    msg.extend_from_slice(&NEGOTIATE_FLAGS.to_le_bytes());
    msg.extend_from_slice(&domain);
    msg.extend_from_slice(&user);
    msg.extend_from_slice(&lm_response);
    msg.extend_from_slice(&nt_response);
    msg
}

/// `NTOWFv2 = HMAC-MD5(NT hash, UTF-16LE(uppercase(user) + domain))`.
fn ntowf_v2(nt_hash: &[u8; 16], username: &str, domain: &str) -> [u8; 16] {
    let identity = format!("{}{}", username.to_uppercase(), domain);
    hmac_md5(nt_hash, &utf16le(&identity))
}

/// LMv2 and NTv2 responses per [MS-NLMP] 3.3.2.
fn ntlm_v2_responses(
    ntowf: &[u8; 16],
    server_challenge: &[u8; 8],
    client_nonce: &[u8; 8],
    timestamp: u64,
    target_info: &[u8],
) -> (Vec<u8>, Vec<u8>) {
    let mut blob = Vec::with_capacity(28 + target_info.len() + 4);
    blob.extend_from_slice(&[1, 1, 0, 0]); // responder version
    blob.extend_from_slice(&[0; 4]);
    blob.extend_from_slice(&timestamp.to_le_bytes());
    blob.extend_from_slice(client_nonce);
    blob.extend_from_slice(&[0; 4]);
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&[0; 4]);

    let mut proof_input = Vec::with_capacity(8 + blob.len());
    proof_input.extend_from_slice(server_challenge);
    proof_input.extend_from_slice(&blob);
    let nt_proof = hmac_md5(ntowf, &proof_input);

    let mut nt_response = Vec::with_capacity(16 + blob.len());
    nt_response.extend_from_slice(&nt_proof);
    nt_response.extend_from_slice(&blob);

    let mut lm_input = Vec::with_capacity(16);
    lm_input.extend_from_slice(server_challenge);
    lm_input.extend_from_slice(client_nonce);
    let mut lm_response = Vec::with_capacity(24);
    lm_response.extend_from_slice(&hmac_md5(ntowf, &lm_input));
    lm_response.extend_from_slice(client_nonce);

    (lm_response, nt_response)
}

/// The NT hash of a password: `MD4(UTF-16LE(password))`.
pub fn nt_hash(password: &str) -> [u8; 16] {
    let mut hasher = Md4::new();
    hasher.update(utf16le(password));
    hasher.finalize().into()
}

fn hmac_md5(key: &[u8], data: &[u8]) -> [u8; 16] {
    let mut mac = HmacMd5::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Windows FILETIME: 100 ns intervals since 1601-01-01.
fn filetime_now() -> u64 {
    const UNIX_EPOCH_AS_FILETIME_SECS: u64 = 11_644_473_600;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (UNIX_EPOCH_AS_FILETIME_SECS + now.as_secs()) * 10_000_000 + u64::from(now.subsec_nanos()) / 100
}

fn put_security_buffer(msg: &mut Vec<u8>, len: usize, offset: u32) {
    msg.extend_from_slice(&(len as u16).to_le_bytes());
    msg.extend_from_slice(&(len as u16).to_le_bytes());
    msg.extend_from_slice(&offset.to_le_bytes());
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Builds a minimal valid Type 2 message; shared by the unit tests here and
/// the end-to-end proxy tests.
#[cfg(test)]
pub(crate) fn challenge_message(server_challenge: &[u8; 8], target_info: &[u8]) -> Vec<u8> {
    let mut msg = Vec::new();
    msg.extend_from_slice(SIGNATURE);
    msg.extend_from_slice(&2u32.to_le_bytes());
    put_security_buffer(&mut msg, 0, 48); // target name
    msg.extend_from_slice(&NEGOTIATE_FLAGS.to_le_bytes());
    msg.extend_from_slice(server_challenge);
    msg.extend_from_slice(&[0; 8]); // reserved
    put_security_buffer(&mut msg, target_info.len(), 48);
    msg.extend_from_slice(target_info);
    msg
}
