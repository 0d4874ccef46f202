//! Signing and verification capabilities.
//!
//! The relay machinery only needs to ask "is this event authentic?" and
//! callers only need "turn this draft into a signed event". Both are traits so
//! remote signers or test doubles can stand in for the local secp256k1 ones.

use async_trait::async_trait;
use nostr::secp256k1::{schnorr, Keypair, Message};

use crate::{Error, FullKeypair, Note, Result, UnsignedNote};

#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, note: UnsignedNote) -> Result<Note>;
}

pub trait Verifier: Send + Sync {
    /// `Ok(false)` means the event is well formed but not authentic.
    fn verify(&self, note: &Note) -> Result<bool>;
}

#[async_trait]
impl Signer for FullKeypair {
    async fn sign(&self, note: UnsignedNote) -> Result<Note> {
        if note.pubkey != self.pubkey {
            return Err(Error::InvalidPublicKey);
        }

        let id = note.id()?;
        let keypair = Keypair::from_secret_key(&nostr::SECP256K1, &self.secret_key);
        let sig =
            nostr::SECP256K1.sign_schnorr_no_aux_rand(&Message::from_digest(*id.bytes()), &keypair);

        Ok(note.into_signed(id, hex::encode(sig.serialize())))
    }
}

/// Checks the id commitment and the BIP-340 signature.
#[derive(Debug, Default, Clone, Copy)]
pub struct SchnorrVerifier;

impl Verifier for SchnorrVerifier {
    #[profiling::function]
    fn verify(&self, note: &Note) -> Result<bool> {
        if note.compute_id()? != note.id {
            return Ok(false);
        }

        let pubkey = note.pubkey.x_only()?;
        let sig = schnorr::Signature::from_slice(&note.sig_bytes()?)?;
        let msg = Message::from_digest(*note.id.bytes());

        Ok(nostr::SECP256K1.verify_schnorr(&sig, &msg, &pubkey).is_ok())
    }
}
