use crate::error::{LedgerError, Result};
use crate::util::Saveable;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{Signature as RsaSignature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::io::{Error as IoError, ErrorKind as IoErrorKind, Read, Result as IoResult, Write};

pub const DEFAULT_KEY_BITS: usize = 2048;

#[derive(Clone, Debug)]
pub struct PrivateKey(RsaPrivateKey);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey(RsaPublicKey);

/// RSA PKCS#1 v1.5 signature over the SHA-256 digest of a payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature(Vec<u8>);

impl PrivateKey {
    pub fn new_key() -> Result<Self> {
        Self::generate(DEFAULT_KEY_BITS)
    }
    pub fn generate(bits: usize) -> Result<Self> {
        let mut rng = rand::thread_rng();
        RsaPrivateKey::new(&mut rng, bits)
            .map(PrivateKey)
            .map_err(|e| LedgerError::InvalidKey(e.to_string()))
    }
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.to_public_key())
    }
    // PKCS#8 is what we write, PKCS#1 is accepted for keys produced elsewhere
    pub fn from_pem(pem: &str) -> Result<Self> {
        RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map(PrivateKey)
            .map_err(|e| LedgerError::InvalidKey(e.to_string()))
    }
    pub fn to_pem(&self) -> Result<String> {
        self.0
            .to_pkcs8_pem(LineEnding::LF)
            .map(|pem| pem.as_str().to_owned())
            .map_err(|e| LedgerError::InvalidKey(e.to_string()))
    }
}

impl PublicKey {
    pub fn from_pem(pem: &str) -> Result<Self> {
        RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map(PublicKey)
            .map_err(|e| LedgerError::InvalidKey(e.to_string()))
    }
    pub fn from_pem_bytes(bytes: &[u8]) -> Result<Self> {
        let pem = std::str::from_utf8(bytes)
            .map_err(|_| LedgerError::InvalidKey("key is not valid UTF-8".into()))?;
        Self::from_pem(pem.trim())
    }
    pub fn to_pem(&self) -> Result<String> {
        self.0
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| LedgerError::InvalidKey(e.to_string()))
    }
}

impl Signature {
    pub fn sign(data: &[u8], private_key: &PrivateKey) -> Result<Self> {
        let signing_key = SigningKey::<Sha256>::new(private_key.0.clone());
        signing_key
            .try_sign(data)
            .map(|signature| Signature(signature.to_vec()))
            .map_err(|_| LedgerError::InvalidSignature)
    }
    pub fn verify(&self, data: &[u8], public_key: &PublicKey) -> bool {
        let Ok(signature) = RsaSignature::try_from(self.0.as_slice()) else {
            return false;
        };
        VerifyingKey::<Sha256>::new(public_key.0.clone())
            .verify(data, &signature)
            .is_ok()
    }
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Signature(bytes)
    }
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

fn read_pem<I: Read>(mut reader: I) -> IoResult<String> {
    let mut pem = String::new();
    reader.read_to_string(&mut pem)?;
    Ok(pem)
}

impl Saveable for PrivateKey {
    fn load<I: Read>(reader: I) -> IoResult<Self> {
        let pem = read_pem(reader)?;
        Self::from_pem(&pem)
            .map_err(|_| IoError::new(IoErrorKind::InvalidData, "Failed to parse PrivateKey"))
    }
    fn save<O: Write>(&self, mut writer: O) -> IoResult<()> {
        let pem = self
            .to_pem()
            .map_err(|_| IoError::new(IoErrorKind::InvalidData, "Failed to serialize PrivateKey"))?;
        writer.write_all(pem.as_bytes())
    }
}

impl Saveable for PublicKey {
    fn load<I: Read>(reader: I) -> IoResult<Self> {
        let pem = read_pem(reader)?;
        Self::from_pem(&pem)
            .map_err(|_| IoError::new(IoErrorKind::InvalidData, "Failed to parse PublicKey"))
    }
    fn save<O: Write>(&self, mut writer: O) -> IoResult<()> {
        let pem = self
            .to_pem()
            .map_err(|_| IoError::new(IoErrorKind::InvalidData, "Failed to serialize PublicKey"))?;
        writer.write_all(pem.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_verify_only_against_the_signed_bytes_and_key() {
        let key = PrivateKey::generate(1024).unwrap();
        let other = PrivateKey::generate(1024).unwrap();
        let signature = Signature::sign(b"open bet", &key).unwrap();
        assert_eq!(signature.as_bytes().len(), 128);
        assert!(signature.verify(b"open bet", &key.public_key()));
        assert!(!signature.verify(b"open bet!", &key.public_key()));
        assert!(!signature.verify(b"open bet", &other.public_key()));
        assert!(!Signature::from_bytes(vec![1, 2, 3]).verify(b"open bet", &key.public_key()));
    }

    #[test]
    fn keys_survive_pem() {
        let key = PrivateKey::generate(1024).unwrap();
        let reloaded = PrivateKey::from_pem(&key.to_pem().unwrap()).unwrap();
        assert_eq!(reloaded.public_key(), key.public_key());

        let public_pem = key.public_key().to_pem().unwrap();
        assert!(public_pem.starts_with("-----BEGIN PUBLIC KEY-----"));
        let public = PublicKey::from_pem_bytes(public_pem.as_bytes()).unwrap();
        assert_eq!(public, key.public_key());
        assert!(PublicKey::from_pem("not a key").is_err());
    }
}
