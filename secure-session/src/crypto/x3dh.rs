//! X3DH (Extended Triple Diffie-Hellman) Key Agreement
//!
//! Lets two parties establish a shared secret while one of them is offline.
//!
//! ## Protocol Overview
//!
//! 1. Bob publishes his pre-key bundle (identity key, signed pre-key, one-time pre-keys)
//! 2. Alice fetches Bob's bundle from the key directory
//! 3. Alice performs the X3DH calculations:
//!    - DH1 = DH(IK_A, SPK_B)
//!    - DH2 = DH(EK_A, IK_B)
//!    - DH3 = DH(EK_A, SPK_B)
//!    - DH4 = DH(EK_A, OPK_B) [optional, if a one-time pre-key was available]
//! 4. Alice derives SK = KDF(F || DH1 || DH2 || DH3 || DH4)
//! 5. Alice's first message carries her identity and ephemeral public keys
//!    in a [`PreKeyHeader`]
//! 6. Bob performs the mirrored DH calculations to derive the same SK

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};
use zeroize::Zeroize;

use crate::crypto::keys::{
    identity_dh_public, parse_curve_key, parse_identity_key, Curve25519KeyPair, IdentityKeyPair,
    OneTimePreKey, SignedPreKey, KEY_LENGTH, SIGNATURE_LENGTH,
};
use crate::error::{SessionError, SessionResult};

const X3DH_INFO: &[u8] = b"SecureSession X3DH v1";

/// Result of X3DH key agreement (initiator side)
pub struct X3dhResult {
    /// The derived shared secret
    pub shared_secret: [u8; 32],
    /// The ephemeral public key to send to the responder
    pub ephemeral_public: Vec<u8>,
    /// The ID of the signed pre-key that was used
    pub signed_pre_key_id: u32,
    /// The ID of the one-time pre-key that was used (if any)
    pub used_one_time_pre_key: Option<u32>,
}

impl Drop for X3dhResult {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
    }
}

/// Pre-key bundle as published to and fetched from the key directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyBundle {
    /// The responder's identity public key (Ed25519)
    #[serde(with = "crate::util::serde_b64")]
    pub identity_key: Vec<u8>,
    /// The responder's registration id
    pub registration_id: u32,
    /// The responder's device id
    pub device_id: u32,
    /// The responder's current signed pre-key
    pub signed_pre_key: SignedPreKey,
    /// Optional one-time pre-key (absent once the pool is exhausted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_pre_key: Option<OneTimePreKey>,
}

impl PreKeyBundle {
    /// Check field presence and key sizes
    pub fn validate(&self) -> SessionResult<()> {
        if self.identity_key.len() != KEY_LENGTH {
            return Err(SessionError::MalformedBundle(format!(
                "identity key is {} bytes, expected {}",
                self.identity_key.len(),
                KEY_LENGTH
            )));
        }
        if self.registration_id == 0 {
            return Err(SessionError::MalformedBundle("registration id missing".to_string()));
        }
        if self.signed_pre_key.public_key.len() != KEY_LENGTH {
            return Err(SessionError::MalformedBundle(
                "signed pre-key has wrong length".to_string(),
            ));
        }
        if self.signed_pre_key.signature.len() != SIGNATURE_LENGTH {
            return Err(SessionError::MalformedBundle(
                "signed pre-key signature has wrong length".to_string(),
            ));
        }
        if let Some(otk) = &self.one_time_pre_key {
            if otk.public_key.len() != KEY_LENGTH {
                return Err(SessionError::MalformedBundle(format!(
                    "one-time pre-key {} has wrong length",
                    otk.key_id
                )));
            }
        }
        Ok(())
    }

    /// Get the identity key as Ed25519PublicKey
    pub fn get_identity_key(&self) -> SessionResult<Ed25519PublicKey> {
        parse_identity_key(&self.identity_key)
            .map_err(|e| SessionError::MalformedBundle(e.to_string()))
    }

    /// Verify that the signed pre-key carries a valid signature from the identity key
    pub fn verify(&self) -> SessionResult<()> {
        let identity_key = self.get_identity_key()?;
        self.signed_pre_key.verify(&identity_key)
    }
}

/// Key agreement material carried by first-contact envelopes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyHeader {
    /// Initiator's identity public key
    #[serde(with = "crate::util::serde_b64")]
    pub identity_key: Vec<u8>,
    /// Initiator's registration id
    pub registration_id: u32,
    /// Initiator's ephemeral public key (the session's base key)
    #[serde(with = "crate::util::serde_b64")]
    pub ephemeral_key: Vec<u8>,
    /// ID of the signed pre-key that was used
    pub signed_pre_key_id: u32,
    /// ID of the one-time pre-key that was used (if any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_pre_key_id: Option<u32>,
}

impl PreKeyHeader {
    /// Check key sizes
    pub fn validate(&self) -> SessionResult<()> {
        if self.identity_key.len() != KEY_LENGTH || self.ephemeral_key.len() != KEY_LENGTH {
            return Err(SessionError::MalformedEnvelope(
                "pre-key header keys must be 32 bytes".to_string(),
            ));
        }
        Ok(())
    }
}

/// Perform X3DH key agreement (initiator side)
///
/// Verifies the bundle, generates an ephemeral key pair and derives the
/// shared secret from the responder's published keys.
pub fn x3dh_initiate(
    our_identity: &IdentityKeyPair,
    their_bundle: &PreKeyBundle,
) -> SessionResult<X3dhResult> {
    their_bundle.verify()?;

    let ephemeral = Curve25519KeyPair::generate();

    let their_identity = their_bundle.get_identity_key()?;
    let their_identity_curve = identity_dh_public(&their_identity)?;
    let their_signed_pre_key = their_bundle.signed_pre_key.get_public_key()?;
    let our_identity_curve = our_identity.to_curve25519();

    let mut dh1 = our_identity_curve.diffie_hellman(&their_signed_pre_key);
    let mut dh2 = ephemeral.diffie_hellman(&their_identity_curve);
    let mut dh3 = ephemeral.diffie_hellman(&their_signed_pre_key);

    let (mut dh4, used_otk_id) = match &their_bundle.one_time_pre_key {
        Some(otk) => {
            let their_otk = otk.get_public_key()?;
            (Some(ephemeral.diffie_hellman(&their_otk)), Some(otk.key_id))
        }
        None => (None, None),
    };

    let shared_secret = kdf_x3dh(&dh1, &dh2, &dh3, dh4.as_ref());

    dh1.zeroize();
    dh2.zeroize();
    dh3.zeroize();
    if let Some(dh4) = dh4.as_mut() {
        dh4.zeroize();
    }

    Ok(X3dhResult {
        shared_secret: shared_secret?,
        ephemeral_public: ephemeral.public_key_bytes(),
        signed_pre_key_id: their_bundle.signed_pre_key.key_id,
        used_one_time_pre_key: used_otk_id,
    })
}

/// Perform X3DH key agreement (responder side)
///
/// Uses our signed pre-key and, when the initiator consumed one, our
/// one-time pre-key to derive the secret the initiator computed.
pub fn x3dh_respond(
    our_identity: &IdentityKeyPair,
    our_signed_pre_key: &Curve25519KeyPair,
    our_one_time_pre_key: Option<&Curve25519KeyPair>,
    their_identity: &Ed25519PublicKey,
    their_ephemeral: &Curve25519PublicKey,
) -> SessionResult<[u8; 32]> {
    let their_identity_curve = identity_dh_public(their_identity)?;
    let our_identity_curve = our_identity.to_curve25519();

    let mut dh1 = our_signed_pre_key.diffie_hellman(&their_identity_curve);
    let mut dh2 = our_identity_curve.diffie_hellman(their_ephemeral);
    let mut dh3 = our_signed_pre_key.diffie_hellman(their_ephemeral);
    let mut dh4 = our_one_time_pre_key.map(|otk| otk.diffie_hellman(their_ephemeral));

    let shared_secret = kdf_x3dh(&dh1, &dh2, &dh3, dh4.as_ref());

    dh1.zeroize();
    dh2.zeroize();
    dh3.zeroize();
    if let Some(dh4) = dh4.as_mut() {
        dh4.zeroize();
    }

    shared_secret
}

/// Responder-side convenience: parse the header keys then respond
pub fn x3dh_respond_to_header(
    our_identity: &IdentityKeyPair,
    our_signed_pre_key: &Curve25519KeyPair,
    our_one_time_pre_key: Option<&Curve25519KeyPair>,
    header: &PreKeyHeader,
) -> SessionResult<[u8; 32]> {
    let their_identity = parse_identity_key(&header.identity_key)?;
    let their_ephemeral = parse_curve_key(&header.ephemeral_key)?;
    x3dh_respond(
        our_identity,
        our_signed_pre_key,
        our_one_time_pre_key,
        &their_identity,
        &their_ephemeral,
    )
}

/// KDF combining the X3DH DH outputs into a shared secret
///
/// HKDF-SHA256 over 32 bytes of 0xFF padding followed by the DH outputs.
fn kdf_x3dh(
    dh1: &[u8; 32],
    dh2: &[u8; 32],
    dh3: &[u8; 32],
    dh4: Option<&[u8; 32]>,
) -> SessionResult<[u8; 32]> {
    let mut input = zeroize::Zeroizing::new(Vec::with_capacity(if dh4.is_some() { 160 } else { 128 }));

    input.extend_from_slice(&[0xFF; 32]);
    input.extend_from_slice(dh1);
    input.extend_from_slice(dh2);
    input.extend_from_slice(dh3);
    if let Some(dh4_bytes) = dh4 {
        input.extend_from_slice(dh4_bytes);
    }

    let hkdf = Hkdf::<Sha256>::new(None, &input);
    let mut output = [0u8; 32];
    hkdf.expand(X3DH_INFO, &mut output)
        .map_err(|e| SessionError::KeyExchangeFailed(format!("HKDF expansion failed: {}", e)))?;

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::SignedPreKeyRecord;

    fn bundle_for(
        identity: &IdentityKeyPair,
        signed: &SignedPreKeyRecord,
        otk: Option<(u32, &Curve25519KeyPair)>,
    ) -> PreKeyBundle {
        PreKeyBundle {
            identity_key: identity.public_key_bytes(),
            registration_id: 42,
            device_id: 1,
            signed_pre_key: signed.public(),
            one_time_pre_key: otk.map(|(id, kp)| OneTimePreKey::new(id, kp)),
        }
    }

    #[test]
    fn test_x3dh_key_agreement() {
        let alice_identity = IdentityKeyPair::generate();
        let bob_identity = IdentityKeyPair::generate();
        let bob_signed = SignedPreKeyRecord::generate(1, &bob_identity);
        let bob_otk = Curve25519KeyPair::generate();

        let bob_bundle = bundle_for(&bob_identity, &bob_signed, Some((7, &bob_otk)));
        let alice_result = x3dh_initiate(&alice_identity, &bob_bundle).unwrap();

        let alice_ephemeral = parse_curve_key(&alice_result.ephemeral_public).unwrap();
        let bob_secret = x3dh_respond(
            &bob_identity,
            &bob_signed.key_pair,
            Some(&bob_otk),
            &alice_identity.public,
            &alice_ephemeral,
        )
        .unwrap();

        assert_eq!(alice_result.shared_secret, bob_secret);
        assert_eq!(alice_result.used_one_time_pre_key, Some(7));
        assert_eq!(alice_result.signed_pre_key_id, 1);
    }

    #[test]
    fn test_x3dh_without_one_time_pre_key() {
        let alice_identity = IdentityKeyPair::generate();
        let bob_identity = IdentityKeyPair::generate();
        let bob_signed = SignedPreKeyRecord::generate(1, &bob_identity);

        let bob_bundle = bundle_for(&bob_identity, &bob_signed, None);
        let alice_result = x3dh_initiate(&alice_identity, &bob_bundle).unwrap();

        let header = PreKeyHeader {
            identity_key: alice_identity.public_key_bytes(),
            registration_id: 9,
            ephemeral_key: alice_result.ephemeral_public.clone(),
            signed_pre_key_id: 1,
            one_time_pre_key_id: None,
        };
        let bob_secret =
            x3dh_respond_to_header(&bob_identity, &bob_signed.key_pair, None, &header).unwrap();

        assert_eq!(alice_result.shared_secret, bob_secret);
        assert_eq!(alice_result.used_one_time_pre_key, None);
    }

    #[test]
    fn test_missing_one_time_key_on_responder_diverges() {
        let alice_identity = IdentityKeyPair::generate();
        let bob_identity = IdentityKeyPair::generate();
        let bob_signed = SignedPreKeyRecord::generate(1, &bob_identity);
        let bob_otk = Curve25519KeyPair::generate();

        let bob_bundle = bundle_for(&bob_identity, &bob_signed, Some((1, &bob_otk)));
        let alice_result = x3dh_initiate(&alice_identity, &bob_bundle).unwrap();
        let alice_ephemeral = parse_curve_key(&alice_result.ephemeral_public).unwrap();

        let bob_secret = x3dh_respond(
            &bob_identity,
            &bob_signed.key_pair,
            None,
            &alice_identity.public,
            &alice_ephemeral,
        )
        .unwrap();

        assert_ne!(alice_result.shared_secret, bob_secret);
    }

    #[test]
    fn test_bundle_verification() {
        let identity = IdentityKeyPair::generate();
        let signed = SignedPreKeyRecord::generate(1, &identity);
        let bundle = bundle_for(&identity, &signed, None);

        assert!(bundle.validate().is_ok());
        assert!(bundle.verify().is_ok());

        let mut bad_bundle = bundle.clone();
        bad_bundle.signed_pre_key.signature[0] ^= 0xFF;
        assert!(matches!(bad_bundle.verify(), Err(SessionError::InvalidSignature(_))));

        let alice = IdentityKeyPair::generate();
        assert!(matches!(
            x3dh_initiate(&alice, &bad_bundle),
            Err(SessionError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_bundle_validation_rejects_partial_bundles() {
        let identity = IdentityKeyPair::generate();
        let signed = SignedPreKeyRecord::generate(1, &identity);
        let bundle = bundle_for(&identity, &signed, None);

        let mut short_identity = bundle.clone();
        short_identity.identity_key.truncate(10);
        assert!(matches!(short_identity.validate(), Err(SessionError::MalformedBundle(_))));

        let mut no_signature = bundle.clone();
        no_signature.signed_pre_key.signature.clear();
        assert!(matches!(no_signature.validate(), Err(SessionError::MalformedBundle(_))));

        let mut no_registration = bundle;
        no_registration.registration_id = 0;
        assert!(matches!(no_registration.validate(), Err(SessionError::MalformedBundle(_))));
    }

    #[test]
    fn test_bundle_json_shape() {
        let identity = IdentityKeyPair::generate();
        let signed = SignedPreKeyRecord::generate(3, &identity);
        let bundle = bundle_for(&identity, &signed, None);

        let json = serde_json::to_value(&bundle).unwrap();
        assert!(json.get("identityKey").unwrap().is_string());
        assert_eq!(json["signedPreKey"]["keyId"], 3);
        assert!(json.get("oneTimePreKey").is_none());

        let parsed: PreKeyBundle = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, bundle);
    }
}
