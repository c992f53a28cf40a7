//! Signing with the local participant key

use crate::errors::TandemError;
use crate::identifiers::{Address, Digest, Signature};

/// Key custody for one participant
///
/// Verification must work from an address alone, so a signer's address is
/// derived from its public key.
pub trait SigningEffects: Send + Sync {
    /// Address of the local participant
    fn address(&self) -> Address;

    /// Sign a digest with the local key
    fn sign(&self, digest: &Digest) -> Result<Signature, TandemError>;

    /// Check that `signer` produced `signature` over `digest`
    fn verify(
        &self,
        signer: &Address,
        digest: &Digest,
        signature: &Signature,
    ) -> Result<bool, TandemError>;
}
