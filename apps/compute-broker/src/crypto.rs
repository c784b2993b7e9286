//! Credential exchange with agents.
//!
//! Each commit uses a fresh X25519 key pair. The public half travels to the
//! agent, which seals its access credentials to it; the private half never
//! leaves the broker process and is dropped once the grant is assembled.
//! Sealed blobs are `base64(encapped_key || ciphertext)`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hpke::aead::ChaCha20Poly1305;
use hpke::kdf::HkdfSha256;
use hpke::kem::X25519HkdfSha256;
use hpke::{Deserializable, Kem, OpModeR, OpModeS, Serializable};
use serde::{Deserialize, Serialize};

type BrokerKem = X25519HkdfSha256;
type BrokerKdf = HkdfSha256;
type BrokerAead = ChaCha20Poly1305;

const INFO: &[u8] = b"compute-broker credential exchange";
const ENCAPPED_KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("credential blob is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("credential blob too short ({0} bytes)")]
    Truncated(usize),
    #[error("invalid key material: {0}")]
    Key(String),
    #[error("hpke failure: {0}")]
    Hpke(String),
    #[error("credential payload malformed: {0}")]
    Payload(#[from] serde_json::Error),
}

pub struct KeyPair {
    private: <BrokerKem as Kem>::PrivateKey,
    public: <BrokerKem as Kem>::PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let (private, public) = BrokerKem::gen_keypair(&mut rng);
        Self { private, public }
    }

    /// Base64 public key, as sent to agents and stored on the grant.
    pub fn public_key(&self) -> String {
        BASE64.encode(self.public.to_bytes())
    }

    pub fn decrypt(&self, blob: &str) -> Result<Vec<u8>, CryptoError> {
        let raw = BASE64.decode(blob.trim())?;
        if raw.len() <= ENCAPPED_KEY_LEN {
            return Err(CryptoError::Truncated(raw.len()));
        }
        let (encapped, ciphertext) = raw.split_at(ENCAPPED_KEY_LEN);
        let encapped = <BrokerKem as Kem>::EncappedKey::from_bytes(encapped)
            .map_err(|e| CryptoError::Key(format!("{e:?}")))?;
        hpke::single_shot_open::<BrokerAead, BrokerKdf, BrokerKem>(
            &OpModeR::Base,
            &self.private,
            &encapped,
            INFO,
            ciphertext,
            b"",
        )
        .map_err(|e| CryptoError::Hpke(format!("{e:?}")))
    }

    pub fn decrypt_credentials(&self, blob: &str) -> Result<Credentials, CryptoError> {
        let plaintext = self.decrypt(blob)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

/// Seals `plaintext` to a base64 public key. Agents do this on their side;
/// the broker uses it for tests and tooling.
pub fn encrypt(public_key: &str, plaintext: &[u8]) -> Result<String, CryptoError> {
    let bytes = BASE64.decode(public_key.trim())?;
    let public = <BrokerKem as Kem>::PublicKey::from_bytes(&bytes)
        .map_err(|e| CryptoError::Key(format!("{e:?}")))?;
    let mut rng = rand::thread_rng();
    let (encapped, ciphertext) = hpke::single_shot_seal::<BrokerAead, BrokerKdf, BrokerKem, _>(
        &OpModeS::Base,
        &public,
        INFO,
        plaintext,
        b"",
        &mut rng,
    )
    .map_err(|e| CryptoError::Hpke(format!("{e:?}")))?;
    let mut sealed = Vec::with_capacity(ENCAPPED_KEY_LEN + ciphertext.len());
    sealed.extend_from_slice(&encapped.to_bytes());
    sealed.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(sealed))
}

/// Access credentials an agent returns on a successful commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub port: u16,
}
