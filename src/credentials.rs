//! ISP1 credentials of the SLE operations.
//!
//! The credentials of an operation consist of the time of generation, a random number and
//! the protected part, which is a hash over the DER encoding of
//!
//! ```text
//! HashInput ::= SEQUENCE {
//!     time          OCTET STRING (SIZE (8)),
//!     randomNumber  INTEGER (0 .. 2147483647),
//!     userName      VisibleString,
//!     passWord      OCTET STRING
//! }
//! ```
//!
//! The [AuthenticationGate] decides which PDUs of an association carry credentials, based on
//! the authentication mode configured for the remote peer.
use crate::config::{AuthenticationMode, HashFunction, PeerConfiguration};
use crate::pdu::PduKind;
use crate::time::{CdsTimestamp, TimestampError};
use core::time::Duration;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Length of the protected part for the SHA-1 hash function.
pub const SHA1_PROTECTED_LEN: usize = 20;
/// Length of the protected part for the SHA-256 hash function. Only the first 30 octets of
/// the digest are transmitted.
pub const SHA256_PROTECTED_LEN: usize = 30;

const DER_TAG_INTEGER: u8 = 0x02;
const DER_TAG_OCTET_STRING: u8 = 0x04;
const DER_TAG_VISIBLE_STRING: u8 = 0x1a;
const DER_TAG_SEQUENCE: u8 = 0x30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Isp1Credentials {
    pub time: CdsTimestamp,
    pub random_number: i32,
    pub protected: Vec<u8>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Credentials {
    #[default]
    Unused,
    Used(Isp1Credentials),
}

impl Credentials {
    #[inline]
    pub fn is_used(&self) -> bool {
        matches!(self, Credentials::Used(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthenticationError {
    #[error("no remote peer configured with identifier {0}")]
    UnknownPeer(String),
    #[error("credentials required but not present")]
    MissingCredentials,
    #[error("credential time outside of the accepted delay of {0:?}")]
    OutsideTimeWindow(Duration),
    #[error("protected part of credentials has invalid length {found}, expected {expected}")]
    InvalidProtectedLength { found: usize, expected: usize },
    #[error("protected part of credentials does not match")]
    ProtectedMismatch,
    #[error("timestamp error: {0}")]
    Timestamp(#[from] TimestampError),
}

impl HashFunction {
    pub fn protected_len(&self) -> usize {
        match self {
            HashFunction::Sha1 => SHA1_PROTECTED_LEN,
            HashFunction::Sha256 => SHA256_PROTECTED_LEN,
        }
    }
}

fn der_write_len(buf: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        buf.push(len as u8);
        return;
    }
    let len_bytes = (len as u64).to_be_bytes();
    let first_non_zero = len_bytes
        .iter()
        .position(|byte| *byte != 0)
        .unwrap_or(len_bytes.len() - 1);
    let significant = &len_bytes[first_non_zero..];
    buf.push(0x80 | significant.len() as u8);
    buf.extend_from_slice(significant);
}

fn der_write_tlv(buf: &mut Vec<u8>, tag: u8, value: &[u8]) {
    buf.push(tag);
    der_write_len(buf, value.len());
    buf.extend_from_slice(value);
}

/// Minimal two's complement big endian encoding of a DER INTEGER.
fn der_integer_content(value: i32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

/// DER encoding of the `HashInput` sequence.
pub fn hash_input(time: &CdsTimestamp, random_number: i32, user_name: &str, password: &[u8]) -> Vec<u8> {
    let mut content = Vec::with_capacity(32 + user_name.len() + password.len());
    der_write_tlv(&mut content, DER_TAG_OCTET_STRING, &time.to_vec());
    der_write_tlv(&mut content, DER_TAG_INTEGER, &der_integer_content(random_number));
    der_write_tlv(&mut content, DER_TAG_VISIBLE_STRING, user_name.as_bytes());
    der_write_tlv(&mut content, DER_TAG_OCTET_STRING, password);
    let mut sequence = Vec::with_capacity(content.len() + 4);
    der_write_tlv(&mut sequence, DER_TAG_SEQUENCE, &content);
    sequence
}

fn protected_part(hash: HashFunction, input: &[u8]) -> Vec<u8> {
    match hash {
        HashFunction::Sha1 => Sha1::digest(input).to_vec(),
        HashFunction::Sha256 => Sha256::digest(input)[..SHA256_PROTECTED_LEN].to_vec(),
    }
}

/// Generate ISP1 credentials for the given identity, stamped with the current time.
pub fn generate_credentials(
    id: &str,
    password: &[u8],
    hash: HashFunction,
) -> Result<Isp1Credentials, AuthenticationError> {
    let time = CdsTimestamp::from_now()?;
    // The ASN.1 type restricts the random number to non-negative values.
    let random_number = rand::thread_rng().gen_range(0..=i32::MAX);
    let protected = protected_part(hash, &hash_input(&time, random_number, id, password));
    Ok(Isp1Credentials {
        time,
        random_number,
        protected,
    })
}

/// Verify received ISP1 credentials against the configured identity of the sender.
pub fn verify_credentials(
    credentials: &Isp1Credentials,
    id: &str,
    password: &[u8],
    hash: HashFunction,
    acceptable_delay: Duration,
) -> Result<(), AuthenticationError> {
    let now = CdsTimestamp::from_now()?;
    if now.abs_diff(&credentials.time) > acceptable_delay {
        return Err(AuthenticationError::OutsideTimeWindow(acceptable_delay));
    }
    let expected_len = hash.protected_len();
    if credentials.protected.len() != expected_len {
        return Err(AuthenticationError::InvalidProtectedLength {
            found: credentials.protected.len(),
            expected: expected_len,
        });
    }
    let expected = protected_part(
        hash,
        &hash_input(&credentials.time, credentials.random_number, id, password),
    );
    if bool::from(expected.ct_eq(&credentials.protected)) {
        Ok(())
    } else {
        Err(AuthenticationError::ProtectedMismatch)
    }
}

/// Credential handling for one association between the local and a remote peer.
#[derive(Debug, Clone)]
pub struct AuthenticationGate {
    mode: AuthenticationMode,
    hash: HashFunction,
    local_id: String,
    local_password: Vec<u8>,
    remote_id: String,
    remote_password: Vec<u8>,
    acceptable_delay: Duration,
}

impl AuthenticationGate {
    pub fn new(peers: &PeerConfiguration, remote_id: &str) -> Result<Self, AuthenticationError> {
        let remote = peers
            .remote_peer(remote_id)
            .ok_or_else(|| AuthenticationError::UnknownPeer(remote_id.to_string()))?;
        Ok(Self {
            mode: remote.authentication_mode,
            hash: remote.authentication_hash,
            local_id: peers.local_id.clone(),
            local_password: peers.local_password.clone(),
            remote_id: remote.id.clone(),
            remote_password: remote.password.clone(),
            acceptable_delay: peers.authentication_delay(),
        })
    }

    #[inline]
    pub fn mode(&self) -> AuthenticationMode {
        self.mode
    }

    #[inline]
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// Whether PDUs of the given kind are authenticated on this association.
    pub fn requires_credentials(&self, kind: PduKind) -> bool {
        match self.mode {
            AuthenticationMode::None => false,
            AuthenticationMode::Bind => kind.is_bind_operation(),
            AuthenticationMode::All => true,
        }
    }

    /// Credentials for an outgoing PDU of the given kind.
    pub fn stamp(&self, kind: PduKind) -> Result<Credentials, AuthenticationError> {
        if !self.requires_credentials(kind) {
            return Ok(Credentials::Unused);
        }
        generate_credentials(&self.local_id, &self.local_password, self.hash).map(Credentials::Used)
    }

    /// Check the credentials of an incoming PDU of the given kind.
    pub fn check(&self, kind: PduKind, credentials: &Credentials) -> Result<(), AuthenticationError> {
        if !self.requires_credentials(kind) {
            return Ok(());
        }
        match credentials {
            Credentials::Unused => Err(AuthenticationError::MissingCredentials),
            Credentials::Used(isp1) => verify_credentials(
                isp1,
                &self.remote_id,
                &self.remote_password,
                self.hash,
                self.acceptable_delay,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemotePeer;
    use crate::time::SubmillisPrecision;

    fn peers(local_id: &str, remote_id: &str, mode: AuthenticationMode, hash: HashFunction) -> PeerConfiguration {
        PeerConfiguration {
            local_id: local_id.to_string(),
            local_password: format!("{local_id}-pw").into_bytes(),
            remote_peers: vec![RemotePeer {
                id: remote_id.to_string(),
                authentication_mode: mode,
                authentication_hash: hash,
                password: format!("{remote_id}-pw").into_bytes(),
            }],
            authentication_delay: 60,
        }
    }

    #[test]
    fn test_der_integer() {
        assert_eq!(der_integer_content(0), vec![0x00]);
        assert_eq!(der_integer_content(127), vec![0x7f]);
        assert_eq!(der_integer_content(128), vec![0x00, 0x80]);
        assert_eq!(der_integer_content(256), vec![0x01, 0x00]);
        assert_eq!(der_integer_content(-1), vec![0xff]);
        assert_eq!(der_integer_content(-129), vec![0xff, 0x7f]);
        assert_eq!(der_integer_content(i32::MAX), vec![0x7f, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn test_der_long_length() {
        let mut buf = Vec::new();
        der_write_len(&mut buf, 0x7f);
        assert_eq!(buf, vec![0x7f]);
        buf.clear();
        der_write_len(&mut buf, 0x80);
        assert_eq!(buf, vec![0x81, 0x80]);
        buf.clear();
        der_write_len(&mut buf, 0x1234);
        assert_eq!(buf, vec![0x82, 0x12, 0x34]);
    }

    #[test]
    fn test_hash_input_layout() {
        let time = CdsTimestamp::new(1, 2, SubmillisPrecision::Microseconds(3)).unwrap();
        let encoded = hash_input(&time, 5, "ab", &[0xaa]);
        assert_eq!(
            encoded,
            vec![
                0x30, 0x14, // sequence
                0x04, 0x08, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x03, // time
                0x02, 0x01, 0x05, // random number
                0x1a, 0x02, b'a', b'b', // user name
                0x04, 0x01, 0xaa, // password
            ]
        );
    }

    #[test]
    fn test_generate_and_verify_sha1() {
        let creds = generate_credentials("MCS", b"secret", HashFunction::Sha1).unwrap();
        assert_eq!(creds.protected.len(), SHA1_PROTECTED_LEN);
        assert!(creds.random_number >= 0);
        verify_credentials(&creds, "MCS", b"secret", HashFunction::Sha1, Duration::from_secs(5))
            .unwrap();
    }

    #[test]
    fn test_generate_and_verify_sha256() {
        let creds = generate_credentials("MCS", b"secret", HashFunction::Sha256).unwrap();
        assert_eq!(creds.protected.len(), SHA256_PROTECTED_LEN);
        verify_credentials(&creds, "MCS", b"secret", HashFunction::Sha256, Duration::from_secs(5))
            .unwrap();
    }

    #[test]
    fn test_wrong_password_rejected() {
        let creds = generate_credentials("MCS", b"secret", HashFunction::Sha1).unwrap();
        assert_eq!(
            verify_credentials(&creds, "MCS", b"other", HashFunction::Sha1, Duration::from_secs(5)),
            Err(AuthenticationError::ProtectedMismatch)
        );
        assert_eq!(
            verify_credentials(&creds, "GS", b"secret", HashFunction::Sha1, Duration::from_secs(5)),
            Err(AuthenticationError::ProtectedMismatch)
        );
    }

    #[test]
    fn test_wrong_hash_rejected() {
        let creds = generate_credentials("MCS", b"secret", HashFunction::Sha1).unwrap();
        assert_eq!(
            verify_credentials(&creds, "MCS", b"secret", HashFunction::Sha256, Duration::from_secs(5)),
            Err(AuthenticationError::InvalidProtectedLength {
                found: SHA1_PROTECTED_LEN,
                expected: SHA256_PROTECTED_LEN
            })
        );
    }

    #[test]
    fn test_stale_credentials_rejected() {
        let mut creds = generate_credentials("MCS", b"secret", HashFunction::Sha1).unwrap();
        let old = creds.time.ccsds_days() - 1;
        creds.time = CdsTimestamp::new(old, creds.time.ms_of_day(), creds.time.submillis()).unwrap();
        assert_eq!(
            verify_credentials(&creds, "MCS", b"secret", HashFunction::Sha1, Duration::from_secs(60)),
            Err(AuthenticationError::OutsideTimeWindow(Duration::from_secs(60)))
        );
    }

    #[test]
    fn test_gate_unknown_peer() {
        let config = peers("MCS", "GS", AuthenticationMode::All, HashFunction::Sha1);
        assert_eq!(
            AuthenticationGate::new(&config, "XYZ").unwrap_err(),
            AuthenticationError::UnknownPeer("XYZ".to_string())
        );
    }

    #[test]
    fn test_gate_bind_mode() {
        let user = AuthenticationGate::new(
            &peers("MCS", "GS", AuthenticationMode::Bind, HashFunction::Sha256),
            "GS",
        )
        .unwrap();
        let provider = AuthenticationGate::new(
            &peers("GS", "MCS", AuthenticationMode::Bind, HashFunction::Sha256),
            "MCS",
        )
        .unwrap();
        let bind_creds = user.stamp(PduKind::BindInvocation).unwrap();
        assert!(bind_creds.is_used());
        provider.check(PduKind::BindInvocation, &bind_creds).unwrap();
        assert_eq!(user.stamp(PduKind::StartInvocation).unwrap(), Credentials::Unused);
        provider
            .check(PduKind::StartInvocation, &Credentials::Unused)
            .unwrap();
        assert_eq!(
            provider.check(PduKind::BindInvocation, &Credentials::Unused),
            Err(AuthenticationError::MissingCredentials)
        );
    }

    #[test]
    fn test_gate_all_mode() {
        let user = AuthenticationGate::new(
            &peers("MCS", "GS", AuthenticationMode::All, HashFunction::Sha1),
            "GS",
        )
        .unwrap();
        let provider = AuthenticationGate::new(
            &peers("GS", "MCS", AuthenticationMode::All, HashFunction::Sha1),
            "MCS",
        )
        .unwrap();
        let creds = provider.stamp(PduKind::TransferBuffer).unwrap();
        user.check(PduKind::TransferBuffer, &creds).unwrap();
        assert_eq!(
            user.check(PduKind::StopReturn, &Credentials::Unused),
            Err(AuthenticationError::MissingCredentials)
        );
        // Credentials of the wrong side never validate.
        let own = user.stamp(PduKind::StartInvocation).unwrap();
        assert!(user.check(PduKind::StartReturn, &own).is_err());
    }

    #[test]
    fn test_gate_none_mode() {
        let gate = AuthenticationGate::new(
            &peers("MCS", "GS", AuthenticationMode::None, HashFunction::Sha1),
            "GS",
        )
        .unwrap();
        assert_eq!(gate.stamp(PduKind::BindInvocation).unwrap(), Credentials::Unused);
        gate.check(PduKind::BindReturn, &Credentials::Unused).unwrap();
    }
}
