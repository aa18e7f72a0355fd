//! Secure Storage Module
//!
//! Encrypted key-value files using Windows DPAPI, and the credential store
//! the session controller persists logins through.

use std::path::PathBuf;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{info, debug, warn};

use crate::auth::Credentials;

#[cfg(windows)]
use windows::Win32::Security::Cryptography::{
    CryptProtectData, CryptUnprotectData, CRYPTPROTECT_UI_FORBIDDEN,
};
#[cfg(windows)]
use windows::Win32::Security::Cryptography::CRYPT_INTEGER_BLOB;

const CREDENTIALS_KEY: &str = "credentials";

/// Persists the single saved login
pub trait CredentialStore: Send + Sync {
    fn save(&self, credentials: &Credentials) -> Result<(), StorageError>;

    /// `Ok(None)` when nothing is saved (fresh install or after logout)
    fn load(&self) -> Result<Option<Credentials>, StorageError>;

    fn clear(&self) -> Result<(), StorageError>;
}

/// Secure storage using Windows DPAPI for encryption
pub struct SecureStorage {
    storage_path: PathBuf,
}

impl SecureStorage {
    /// Create storage under the application data directory
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        let storage_path = storage_path.into();

        if let Err(e) = std::fs::create_dir_all(&storage_path) {
            warn!("Failed to create storage directory: {}", e);
        }

        debug!("Secure storage initialized at: {:?}", storage_path);

        Self { storage_path }
    }

    /// Encrypt and write a value. The file is replaced atomically.
    pub fn save<T: Serialize>(&self, key: &str, data: &T) -> Result<(), StorageError> {
        let json = serde_json::to_vec(data)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let encrypted = self.encrypt(&json)?;

        let file_path = self.file_path(key);
        let tmp_path = self.storage_path.join(format!("{}.dat.tmp", key));
        std::fs::write(&tmp_path, encrypted)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        std::fs::rename(&tmp_path, &file_path)
            .map_err(|e| StorageError::Io(e.to_string()))?;

        info!("Saved encrypted data for key: {}", key);
        Ok(())
    }

    /// Read and decrypt a value, `Ok(None)` if the key was never written
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let file_path = self.file_path(key);

        let encrypted = match std::fs::read(&file_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::Io(e.to_string())),
        };

        let decrypted = self.decrypt(&encrypted)?;

        serde_json::from_slice(&decrypted)
            .map(Some)
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// Delete stored data
    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        let file_path = self.file_path(key);

        match std::fs::remove_file(&file_path) {
            Ok(()) => {
                info!("Deleted stored data for key: {}", key);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e.to_string())),
        }
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.storage_path.join(format!("{}.dat", key))
    }

    #[cfg(windows)]
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        use std::ptr::null_mut;

        let input = CRYPT_INTEGER_BLOB {
            cbData: data.len() as u32,
            pbData: data.as_ptr() as *mut u8,
        };

        let mut output = CRYPT_INTEGER_BLOB {
            cbData: 0,
            pbData: null_mut(),
        };

        unsafe {
            let result = CryptProtectData(
                &input,
                None,
                None,
                None,
                None,
                CRYPTPROTECT_UI_FORBIDDEN,
                &mut output,
            );

            if result.is_err() {
                return Err(StorageError::Encryption("DPAPI encryption failed".into()));
            }

            let encrypted = std::slice::from_raw_parts(
                output.pbData,
                output.cbData as usize,
            ).to_vec();

            windows::Win32::Foundation::LocalFree(
                windows::Win32::Foundation::HLOCAL(output.pbData as *mut std::ffi::c_void)
            );

            Ok(encrypted)
        }
    }

    #[cfg(windows)]
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        use std::ptr::null_mut;

        let input = CRYPT_INTEGER_BLOB {
            cbData: data.len() as u32,
            pbData: data.as_ptr() as *mut u8,
        };

        let mut output = CRYPT_INTEGER_BLOB {
            cbData: 0,
            pbData: null_mut(),
        };

        unsafe {
            let result = CryptUnprotectData(
                &input,
                None,
                None,
                None,
                None,
                CRYPTPROTECT_UI_FORBIDDEN,
                &mut output,
            );

            if result.is_err() {
                return Err(StorageError::Decryption("DPAPI decryption failed".into()));
            }

            let decrypted = std::slice::from_raw_parts(
                output.pbData,
                output.cbData as usize,
            ).to_vec();

            windows::Win32::Foundation::LocalFree(
                windows::Win32::Foundation::HLOCAL(output.pbData as *mut std::ffi::c_void)
            );

            Ok(decrypted)
        }
    }

    // Plain files on other platforms
    #[cfg(not(windows))]
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        Ok(data.to_vec())
    }

    #[cfg(not(windows))]
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        Ok(data.to_vec())
    }
}

impl CredentialStore for SecureStorage {
    fn save(&self, credentials: &Credentials) -> Result<(), StorageError> {
        SecureStorage::save(self, CREDENTIALS_KEY, credentials)
    }

    fn load(&self) -> Result<Option<Credentials>, StorageError> {
        let stored = SecureStorage::load::<Credentials>(self, CREDENTIALS_KEY)?;
        Ok(stored.filter(|c| {
            if !c.is_complete() {
                warn!("Ignoring incomplete stored credentials");
            }
            c.is_complete()
        }))
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.delete(CREDENTIALS_KEY)
    }
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),
}
