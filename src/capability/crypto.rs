/// Crypto capability: hashing, CSPRNG, password KDF and Ed25519.
///
/// Pure functions, no allowlist. Outputs are fixed-size arrays or
/// caller-provided buffers, never caller-chosen lengths.
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};

use super::CapError;

type HmacSha256 = Hmac<Sha256>;
const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD_NO_PAD;

/// PBKDF2 iteration count for new password hashes.
pub const PBKDF2_ITERATIONS: u32 = 210_000;

/// Refuse to verify hashes claiming absurd work factors.
const MAX_PBKDF2_ITERATIONS: u32 = 10_000_000;

const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;
const PASSWORD_SCHEME: &str = "pbkdf2-sha256";

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn sha512(data: &[u8]) -> [u8; 64] {
    Sha512::digest(data).into()
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], CapError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| CapError::InvalidArgument(format!("hmac key: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Fills `buf` from the operating system CSPRNG.
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CapError> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| CapError::Io(format!("random source: {e}")))
}

/// Compares two byte strings in time independent of where they differ.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Hashes a password as `pbkdf2-sha256$<iterations>$<salt>$<hash>`.
pub fn hash_password(password: &str) -> Result<String, CapError> {
    hash_password_with_iterations(password, PBKDF2_ITERATIONS)
}

pub fn hash_password_with_iterations(password: &str, iterations: u32) -> Result<String, CapError> {
    if iterations == 0 {
        return Err(CapError::InvalidArgument("iterations must be positive".into()));
    }
    let mut salt = [0u8; SALT_LEN];
    random_bytes(&mut salt)?;
    let mut hash = [0u8; HASH_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut hash);
    Ok(format!(
        "{PASSWORD_SCHEME}${iterations}${}${}",
        B64.encode(salt),
        B64.encode(hash)
    ))
}

/// Verifies a password against a hash produced by [`hash_password`].
pub fn verify_password(password: &str, encoded: &str) -> Result<bool, CapError> {
    let invalid = || CapError::InvalidArgument("malformed password hash".into());

    let mut parts = encoded.split('$');
    let (Some(scheme), Some(iterations), Some(salt), Some(expected), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return Err(invalid());
    };
    if scheme != PASSWORD_SCHEME {
        return Err(invalid());
    }
    let iterations: u32 = iterations.parse().map_err(|_| invalid())?;
    if iterations == 0 || iterations > MAX_PBKDF2_ITERATIONS {
        return Err(invalid());
    }
    let salt = B64.decode(salt).map_err(|_| invalid())?;
    let expected = B64.decode(expected).map_err(|_| invalid())?;
    if expected.len() != HASH_LEN {
        return Err(invalid());
    }

    let mut actual = [0u8; HASH_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut actual);
    Ok(constant_time_eq(&actual, &expected))
}

/// Generates an Ed25519 key pair as (secret seed, public key).
pub fn ed25519_keypair() -> Result<([u8; 32], [u8; 32]), CapError> {
    let mut seed = [0u8; 32];
    random_bytes(&mut seed)?;
    let public = SigningKey::from_bytes(&seed).verifying_key().to_bytes();
    Ok((seed, public))
}

pub fn sign(seed: &[u8; 32], message: &[u8]) -> [u8; 64] {
    SigningKey::from_bytes(seed).sign(message).to_bytes()
}

/// Strict Ed25519 verification; malformed keys verify as false.
pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let signature = Signature::from_bytes(signature);
    key.verify(message, &signature).is_ok() && key.verify_strict(message, &signature).is_ok()
}

/// Decodes a hex string into a fixed-size array.
pub fn parse_hex_array<const N: usize>(hex_str: &str, what: &str) -> Result<[u8; N], CapError> {
    let bytes = hex::decode(hex_str.trim())
        .map_err(|e| CapError::InvalidArgument(format!("{what}: invalid hex ({e})")))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        CapError::InvalidArgument(format!("{what}: expected {N} bytes, got {}", b.len()))
    })
}
