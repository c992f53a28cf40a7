//! Ed25519 signing handler
//!
//! A participant's address is `0x` followed by the hex of its Ed25519
//! verifying key, so a counterparty can check a signature knowing only the
//! signer's address.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use tandem_core::effects::SigningEffects;
use tandem_core::identifiers::{from_prefixed_hex, to_prefixed_hex};
use tandem_core::{Address, Digest, Signature, TandemError};

/// Ed25519 key custody for one participant
pub struct Ed25519SigningHandler {
    signing_key: SigningKey,
    address: Address,
}

impl Ed25519SigningHandler {
    /// Create a handler from a 32-byte secret key
    pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&secret);
        let address = address_of(&signing_key.verifying_key());
        Self {
            signing_key,
            address,
        }
    }

    /// Verifying key of this participant
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl std::fmt::Debug for Ed25519SigningHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519SigningHandler")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Address derived from a verifying key
pub fn address_of(key: &VerifyingKey) -> Address {
    Address::new(to_prefixed_hex(key.as_bytes()))
}

fn verifying_key_for(address: &Address) -> Result<VerifyingKey, TandemError> {
    let bytes = from_prefixed_hex(address.as_str())?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
        TandemError::crypto(format!("{address} is not an Ed25519 address"))
    })?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| TandemError::crypto(format!("{address} is not a valid key: {e}")))
}

impl SigningEffects for Ed25519SigningHandler {
    fn address(&self) -> Address {
        self.address.clone()
    }

    fn sign(&self, digest: &Digest) -> Result<Signature, TandemError> {
        let signature = self.signing_key.sign(digest.as_bytes());
        Ok(Signature::from_bytes(signature.to_bytes().to_vec()))
    }

    fn verify(
        &self,
        signer: &Address,
        digest: &Digest,
        signature: &Signature,
    ) -> Result<bool, TandemError> {
        let key = verifying_key_for(signer)?;
        let signature = match ed25519_dalek::Signature::from_slice(signature.as_bytes()) {
            Ok(signature) => signature,
            Err(_) => return Ok(false),
        };
        Ok(key.verify(digest.as_bytes(), &signature).is_ok())
    }
}
