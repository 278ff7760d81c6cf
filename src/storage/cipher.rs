use std::collections::HashMap;

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::types::error::{DatabaseError, Result};
use crate::types::{CIPHER_RESERVED_BYTES, PAGE_SIZE, PageId};

pub const KEY_LENGTH: usize = 32;
pub const IV_LENGTH: usize = 12;
pub const TAG_LENGTH: usize = 16;
pub const SALT_LENGTH: usize = 16;

/// External key storage boundary. The engine obtains and stores key
/// material through this interface but never implements secure storage
/// itself.
pub trait KeyProvider {
    fn get_key(&self, identifier: &str) -> Result<Option<Vec<u8>>>;
    fn put_key(&mut self, identifier: &str, key: &[u8]) -> Result<()>;
    fn delete_key(&mut self, identifier: &str) -> Result<()>;
}

/// In-memory key provider for tests and embedded callers.
#[derive(Default)]
pub struct MemoryKeyProvider {
    keys: HashMap<String, Vec<u8>>,
}

impl MemoryKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyProvider for MemoryKeyProvider {
    fn get_key(&self, identifier: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.keys.get(identifier).cloned())
    }

    fn put_key(&mut self, identifier: &str, key: &[u8]) -> Result<()> {
        self.keys.insert(identifier.to_string(), key.to_vec());
        Ok(())
    }

    fn delete_key(&mut self, identifier: &str) -> Result<()> {
        self.keys.remove(identifier);
        Ok(())
    }
}

/// Generate a fresh random cipher salt.
///
/// # Panics
///
/// Panics if the OS CSPRNG fails (catastrophic system error).
pub fn generate_salt() -> [u8; SALT_LENGTH] {
    let mut salt = [0u8; SALT_LENGTH];
    getrandom::fill(&mut salt).expect("CSPRNG failure");
    salt
}

/// Per-page AES-256-GCM cipher.
///
/// Each page is encrypted independently with a fresh random IV stored in
/// the page's reserved tail region, and the page number bound as
/// associated data so a ciphertext cannot be replayed at another page
/// position. Page 0 is never passed through this layer.
///
/// On-disk encrypted page layout:
/// ```text
/// ┌──────────────────────────┬────────────┬──────────────┐
/// │  ciphertext              │  IV (12)   │  tag (16)    │
/// │  [0..PAGE_SIZE-28]       │            │              │
/// └──────────────────────────┴────────────┴──────────────┘
/// ```
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PageCipher {
    key: [u8; KEY_LENGTH],
    #[zeroize(skip)]
    salt: [u8; SALT_LENGTH],
}

impl PageCipher {
    /// Derive the page key from the user key and the database salt.
    pub fn derive(user_key: &[u8], salt: [u8; SALT_LENGTH]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(user_key);
        let user_digest = hasher.finalize();

        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(user_digest);
        let derived = hasher.finalize();

        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&derived);
        Self { key, salt }
    }

    pub fn salt(&self) -> [u8; SALT_LENGTH] {
        self.salt
    }

    /// Encrypt one usable-size plaintext page into a raw page image.
    pub fn encrypt_page(&self, page_id: PageId, plaintext: &[u8]) -> Result<Vec<u8>> {
        let usable = PAGE_SIZE - CIPHER_RESERVED_BYTES;
        if plaintext.len() != usable {
            return Err(DatabaseError::InvalidPageSize {
                expected: usable,
                actual: plaintext.len(),
            });
        }

        let mut iv = [0u8; IV_LENGTH];
        getrandom::fill(&mut iv).expect("CSPRNG failure");

        let cipher = Aes256Gcm::new_from_slice(&self.key).expect("KEY_LENGTH is always valid");
        let aad = page_id.to_le_bytes();
        let sealed = cipher
            .encrypt(
                &iv.into(),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| DatabaseError::Cipher {
                reason: format!("page {} encryption failed", page_id),
            })?;
        debug_assert_eq!(sealed.len(), usable + TAG_LENGTH);

        let mut image = Vec::with_capacity(PAGE_SIZE);
        image.extend_from_slice(&sealed[..usable]);
        image.extend_from_slice(&iv);
        image.extend_from_slice(&sealed[usable..]);
        Ok(image)
    }

    /// Decrypt a raw page image back to its usable-size plaintext.
    ///
    /// A failure means a wrong key or a tampered page; the tag check does
    /// not distinguish the two.
    pub fn decrypt_page(&self, page_id: PageId, raw: &[u8]) -> Result<Vec<u8>> {
        if raw.len() != PAGE_SIZE {
            return Err(DatabaseError::InvalidPageSize {
                expected: PAGE_SIZE,
                actual: raw.len(),
            });
        }
        let usable = PAGE_SIZE - CIPHER_RESERVED_BYTES;
        let ciphertext = &raw[..usable];
        let iv: [u8; IV_LENGTH] = raw[usable..usable + IV_LENGTH]
            .try_into()
            .expect("IV slice length");
        let tag = &raw[usable + IV_LENGTH..];

        let mut sealed = Vec::with_capacity(usable + TAG_LENGTH);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        let cipher = Aes256Gcm::new_from_slice(&self.key).expect("KEY_LENGTH is always valid");
        let aad = page_id.to_le_bytes();
        cipher
            .decrypt(
                &iv.into(),
                Payload {
                    msg: &sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| DatabaseError::Cipher {
                reason: format!("page {} decryption failed (wrong key or corrupted page)", page_id),
            })
    }
}
