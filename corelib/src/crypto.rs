use byteorder::{LittleEndian, WriteBytesExt};
use libsodium_sys;
use ctor::ctor;

pub const MAC_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_ABYTES as usize;
pub const KEY_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_KEYBYTES as usize;
pub const NONCE_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_NPUBBYTES as usize;

const NONCE_OFFSET: usize = NONCE_SIZE - 8;

/// Initialize the sodium infrastructure
#[ctor]
fn INIT_SODIUM() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("Cryptography initialization failed")
        }
    }
}

#[inline]
fn nonce_to_bytes(nonce: u64) -> [u8; NONCE_SIZE] {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    (&mut nonce_bytes[NONCE_OFFSET..])
        .write_u64::<LittleEndian>(nonce)
        .expect("Error creating nonce");
    nonce_bytes
}

/// Encrypts the provided plain text into the cipher buffer. The encrypted message size will be the plain
/// text size plus the MAC size (24 bytes). The function will fail if the cipher slice is not large enough.
///
/// The additional data, nonce and key must match those used during encryption, the decryption will fail
/// otherwise.
#[inline]
pub fn encrypt(
    cipher: &mut [u8],
    plain: &[u8],
    additional_data: &[u8],
    nonce: u64,
    key: &[u8; KEY_SIZE],
) -> bool {
    let nonce_bytes = nonce_to_bytes(nonce);

    if cipher.len() != plain.len() + MAC_SIZE {
        panic!(
            "Encryption: cipher data length ({}) must be plain data length ({}) + MAC size ({})",
            cipher.len(),
            plain.len(),
            MAC_SIZE
        )
    }

    unsafe {
        let result = libsodium_sys::crypto_aead_chacha20poly1305_ietf_encrypt(
            cipher.as_mut_ptr(),
            ::std::ptr::null_mut(),
            plain.as_ptr(),
            plain.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            ::std::ptr::null(),
            nonce_bytes.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Decrypts the provided ciphertext into the plain buffer. The decoded message size is equal to the cipher
/// text length minus the MAC (24 bytes). The function will fail if the sizes do not match.
///
/// The additional data, nonce and key must match those used during encryption, the decryption will fail
/// otherwise.
#[inline]
pub fn decrypt(
    plain: &mut [u8],
    cipher: &[u8],
    additional_data: &[u8],
    nonce: u64,
    key: &[u8; KEY_SIZE],
) -> bool {
    let nonce_bytes = nonce_to_bytes(nonce);

    if cipher.len() != plain.len() + MAC_SIZE {
        panic!(
            "Decryption: cipher data length ({}) must be plain data length ({}) + MAC size ({})",
            cipher.len(),
            plain.len(),
            MAC_SIZE
        )
    }

    unsafe {
        let result = libsodium_sys::crypto_aead_chacha20poly1305_ietf_decrypt(
            plain.as_mut_ptr(),
            ::std::ptr::null_mut(),
            ::std::ptr::null_mut(),
            cipher.as_ptr(),
            cipher.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            nonce_bytes.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Fills the provided buffer with cryptographically secure random bytes
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut ::std::ffi::c_void, out.len());
    }
}

/// Security mode negotiated for a SecureChannel. `Invalid` is only legal
/// during the handshake; a channel may not remain open in that mode.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SecurityMode {
    Invalid,
    Sign,
    SignAndEncrypt,
}

/// Opaque key material bound to a channel's current token. Handed to the
/// channel by `SecureChannel::set_encryption_keys` once a token has been
/// negotiated; never inspected outside the policy implementation.
#[derive(Clone)]
pub struct EncryptionKeys {
    pub signing_key: Vec<u8>,
    pub encrypting_key: Vec<u8>,
    pub key_nonce: Vec<u8>,
    pub token_id: u32,
}

/// The capability interface the SecureChannel layer consumes. Concrete
/// cryptographic algorithms (AES, RSA certificate signing, ...) live outside
/// the core; this crate only ships the interface plus a couple of
/// policies simple enough to exercise the core's framing logic in tests.
pub trait SecurityPolicy: Send + Sync {
    /// The `SecurityPolicyUri` identifying this policy on the wire.
    fn uri(&self) -> &'static str;

    /// Size in bytes of a detached signature/MAC produced by `sign`.
    fn signature_size(&self) -> usize;

    fn new_key_context(&self, mode: SecurityMode) -> EncryptionKeys;

    fn sign(&self, keys: &EncryptionKeys, data: &[u8]) -> Vec<u8>;
    fn verify(&self, keys: &EncryptionKeys, data: &[u8], signature: &[u8]) -> bool;

    fn encrypt(&self, keys: &EncryptionKeys, sequence: u64, plain: &[u8], additional_data: &[u8]) -> Vec<u8>;
    fn decrypt(
        &self,
        keys: &EncryptionKeys,
        sequence: u64,
        cipher: &[u8],
        additional_data: &[u8],
    ) -> Option<Vec<u8>>;
}

/// `http://opcfoundation.org/UA/SecurityPolicy#None`: no signing, no
/// encryption. Legal only while `SecurityMode::Invalid` is in force.
pub struct PolicyNone;

impl SecurityPolicy for PolicyNone {
    fn uri(&self) -> &'static str {
        "http://opcfoundation.org/UA/SecurityPolicy#None"
    }

    fn signature_size(&self) -> usize {
        0
    }

    fn new_key_context(&self, _mode: SecurityMode) -> EncryptionKeys {
        EncryptionKeys {
            signing_key: Vec::new(),
            encrypting_key: Vec::new(),
            key_nonce: Vec::new(),
            token_id: 0,
        }
    }

    fn sign(&self, _keys: &EncryptionKeys, _data: &[u8]) -> Vec<u8> {
        Vec::new()
    }

    fn verify(&self, _keys: &EncryptionKeys, _data: &[u8], signature: &[u8]) -> bool {
        signature.is_empty()
    }

    fn encrypt(&self, _keys: &EncryptionKeys, _sequence: u64, plain: &[u8], _additional_data: &[u8]) -> Vec<u8> {
        plain.to_vec()
    }

    fn decrypt(
        &self,
        _keys: &EncryptionKeys,
        _sequence: u64,
        cipher: &[u8],
        _additional_data: &[u8],
    ) -> Option<Vec<u8>> {
        Some(cipher.to_vec())
    }
}

/// A concrete, usable policy exercising the sign+encrypt path end to end in
/// tests, built on the same ChaCha20-Poly1305 AEAD the channel buffer
/// encryption above uses. Not an OPC UA-standardized policy URI.
pub struct PolicyChaCha20Poly1305;

impl SecurityPolicy for PolicyChaCha20Poly1305 {
    fn uri(&self) -> &'static str {
        "http://opcfoundation.org/UA/SecurityPolicy#ChaCha20Poly1305-Test"
    }

    fn signature_size(&self) -> usize {
        MAC_SIZE
    }

    fn new_key_context(&self, _mode: SecurityMode) -> EncryptionKeys {
        let mut key = vec![0u8; KEY_SIZE];
        random_bytes(&mut key);
        let mut nonce = vec![0u8; NONCE_SIZE];
        random_bytes(&mut nonce);
        EncryptionKeys {
            signing_key: key.clone(),
            encrypting_key: key,
            key_nonce: nonce,
            token_id: 0,
        }
    }

    fn sign(&self, keys: &EncryptionKeys, data: &[u8]) -> Vec<u8> {
        let mut cipher = vec![0u8; data.len() + MAC_SIZE];
        let key: &[u8; KEY_SIZE] = keys.signing_key[..KEY_SIZE].try_into().expect("signing key size");
        encrypt(&mut cipher, data, &[], 0, key);
        cipher[data.len()..].to_vec()
    }

    fn verify(&self, keys: &EncryptionKeys, data: &[u8], signature: &[u8]) -> bool {
        if signature.len() != MAC_SIZE {
            return false;
        }
        self.sign(keys, data) == signature
    }

    fn encrypt(&self, keys: &EncryptionKeys, sequence: u64, plain: &[u8], additional_data: &[u8]) -> Vec<u8> {
        let mut cipher = vec![0u8; plain.len() + MAC_SIZE];
        let key: &[u8; KEY_SIZE] = keys.encrypting_key[..KEY_SIZE].try_into().expect("encrypting key size");
        encrypt(&mut cipher, plain, additional_data, sequence, key);
        cipher
    }

    fn decrypt(
        &self,
        keys: &EncryptionKeys,
        sequence: u64,
        cipher: &[u8],
        additional_data: &[u8],
    ) -> Option<Vec<u8>> {
        if cipher.len() < MAC_SIZE {
            return None;
        }
        let mut plain = vec![0u8; cipher.len() - MAC_SIZE];
        let key: &[u8; KEY_SIZE] = keys.encrypting_key[..KEY_SIZE].try_into().ok()?;
        if decrypt(&mut plain, cipher, additional_data, sequence, key) {
            Some(plain)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_policy_is_transparent() {
        let policy = PolicyNone;
        let keys = policy.new_key_context(SecurityMode::Invalid);
        let cipher = policy.encrypt(&keys, 0, b"hello", b"ad");
        assert_eq!(cipher, b"hello");
        assert_eq!(policy.decrypt(&keys, 0, &cipher, b"ad").unwrap(), b"hello");
    }

    #[test]
    fn chacha_policy_roundtrips() {
        let policy = PolicyChaCha20Poly1305;
        let keys = policy.new_key_context(SecurityMode::SignAndEncrypt);
        let plain = b"OpenSecureChannelRequest payload";
        let ad = b"additional-data";

        let cipher = policy.encrypt(&keys, 7, plain, ad);
        assert_ne!(&cipher[..plain.len()], &plain[..]);

        let decrypted = policy.decrypt(&keys, 7, &cipher, ad).unwrap();
        assert_eq!(decrypted, plain);

        // Wrong sequence number must fail to decrypt (AEAD nonce mismatch).
        assert!(policy.decrypt(&keys, 8, &cipher, ad).is_none());
    }

    #[test]
    fn chacha_signatures_are_verifiable() {
        let policy = PolicyChaCha20Poly1305;
        let keys = policy.new_key_context(SecurityMode::Sign);
        let sig = policy.sign(&keys, b"payload");
        assert!(policy.verify(&keys, b"payload", &sig));
        assert!(!policy.verify(&keys, b"tampered", &sig));
    }
}
