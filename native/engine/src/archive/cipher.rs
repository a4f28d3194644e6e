use std::{fmt, sync::Arc};

use anyhow::{Result, bail};
use derive_more::Debug;

use crate::{
    config::EngineConfig,
    transport::{ReadStream, WriteStream},
};

/// Password-based stream encryption supplied by the embedding application
pub trait StreamCipher: fmt::Debug + Send + Sync {
    /// Name stored in the manifest's `cipherType`
    fn cipher_type(&self) -> &str;

    fn encrypt(&self, sink: WriteStream, password: &str, salt: &[u8]) -> Result<WriteStream>;

    fn decrypt(&self, source: ReadStream, password: &str, salt: &[u8]) -> Result<ReadStream>;
}

/// A cipher bound to the configured password and salt
#[derive(Debug, Clone)]
pub struct Encryption {
    cipher: Arc<dyn StreamCipher>,
    #[debug(skip)]
    password: String,
    #[debug(skip)]
    salt: Vec<u8>,
}

impl Encryption {
    pub fn new(cipher: Arc<dyn StreamCipher>, password: impl Into<String>, salt: Vec<u8>) -> Self {
        Self { cipher, password: password.into(), salt }
    }

    /// Binds `cipher` to the configured password and salt.
    ///
    /// Returns `None` when no password is set. A password without a cipher is an error, so
    /// archives are never written in plain text by accident.
    pub fn from_config(
        config: &EngineConfig,
        cipher: Option<Arc<dyn StreamCipher>>,
    ) -> Result<Option<Self>> {
        if !config.is_encrypted() {
            return Ok(None);
        }
        let Some(cipher) = cipher else {
            bail!("A password is configured, but no stream cipher is available");
        };
        let password = config.password.clone().unwrap_or_default();
        let salt = config.crypto_salt.as_deref().unwrap_or_default().as_bytes().to_vec();
        Ok(Some(Self::new(cipher, password, salt)))
    }

    pub fn cipher_type(&self) -> &str {
        self.cipher.cipher_type()
    }

    pub fn encrypt(&self, sink: WriteStream) -> Result<WriteStream> {
        self.cipher.encrypt(sink, &self.password, &self.salt)
    }

    pub fn decrypt(&self, source: ReadStream) -> Result<ReadStream> {
        self.cipher.decrypt(source, &self.password, &self.salt)
    }
}
