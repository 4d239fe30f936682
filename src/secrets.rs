//! Secret containers with guaranteed zeroization
//!
//! Memory safety for sensitive material:
//! - Zeroization on drop and on explicit wipe
//! - Wipe-on-scope-exit guard for signing paths
//! - Constant-time credential comparison
//! - Redacting Debug implementations

use std::fmt;
use std::ops::{Deref, DerefMut};

use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

// =============================================================================
// Secret Buffers
// =============================================================================

/// A byte buffer that zeroizes its contents on drop.
///
/// Wiping overwrites in place (volatile writes followed by a compiler fence,
/// via the zeroize crate) so the length stays observable after the contents
/// are gone.
pub struct SecretBuffer {
    data: Vec<u8>,
    wiped: bool,
}

impl SecretBuffer {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            wiped: false,
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data, wiped: false }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow the raw bytes. After a wipe this is all zeros.
    pub fn expose(&self) -> &[u8] {
        &self.data
    }

    /// Overwrite the contents with zeros
    pub fn wipe(&mut self) {
        self.data.as_mut_slice().zeroize();
        self.wiped = true;
    }

    pub fn is_wiped(&self) -> bool {
        self.wiped
    }
}

impl Clone for SecretBuffer {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            wiped: self.wiped,
        }
    }
}

impl Drop for SecretBuffer {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl fmt::Debug for SecretBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBuffer")
            .field("len", &self.data.len())
            .field("wiped", &self.wiped)
            .finish()
    }
}

// =============================================================================
// Master Secret
// =============================================================================

/// The master seed (or raw entropy) for one signing operation.
///
/// Exclusively owned, never cloned. Every code path that takes one must wipe
/// it before returning; `WipeGuard` makes that automatic.
pub struct MasterSecret {
    buffer: SecretBuffer,
}

impl MasterSecret {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            buffer: SecretBuffer::from_bytes(bytes),
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            buffer: SecretBuffer::from_vec(data),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn expose(&self) -> &[u8] {
        self.buffer.expose()
    }

    pub fn wipe(&mut self) {
        self.buffer.wipe();
    }

    pub fn is_wiped(&self) -> bool {
        self.buffer.is_wiped()
    }
}

impl fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterSecret")
            .field("len", &self.buffer.len())
            .field("wiped", &self.buffer.is_wiped())
            .finish()
    }
}

/// Wipes the guarded master secret when the scope exits, on normal return,
/// early return, and panic unwind alike.
pub struct WipeGuard<'a> {
    secret: &'a mut MasterSecret,
}

impl<'a> WipeGuard<'a> {
    pub fn new(secret: &'a mut MasterSecret) -> Self {
        Self { secret }
    }
}

impl Deref for WipeGuard<'_> {
    type Target = MasterSecret;

    fn deref(&self) -> &Self::Target {
        self.secret
    }
}

impl DerefMut for WipeGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.secret
    }
}

impl Drop for WipeGuard<'_> {
    fn drop(&mut self) {
        self.secret.wipe();
    }
}

// =============================================================================
// Unlock Credentials
// =============================================================================

/// Opaque vault-unlock credential.
///
/// The engine never inspects it beyond passing it to the vault KDF and to the
/// enclave; comparisons are constant time and Debug output reveals nothing.
pub struct UnlockCredential {
    inner: SecretString,
}

impl UnlockCredential {
    pub fn new(credential: impl Into<String>) -> Self {
        Self {
            inner: SecretString::from(credential.into()),
        }
    }

    pub fn expose(&self) -> &str {
        self.inner.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.expose_secret().is_empty()
    }

    /// Constant-time equality check
    pub fn matches(&self, other: &UnlockCredential) -> bool {
        secure_compare(
            self.inner.expose_secret().as_bytes(),
            other.inner.expose_secret().as_bytes(),
        )
    }
}

impl Clone for UnlockCredential {
    fn clone(&self) -> Self {
        Self::new(self.inner.expose_secret().to_string())
    }
}

impl fmt::Debug for UnlockCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UnlockCredential([REDACTED])")
    }
}

/// Constant-time comparison. Length mismatch returns false immediately;
/// equal-length content never short-circuits.
pub fn secure_compare(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
