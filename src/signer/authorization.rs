//! EIP-7702 delegation authorizations

use crate::crypto::{checksum_address, keccak256, EthSignature};
use rlp::RlpStream;
use serde::{Deserialize, Serialize};

/// Magic prefix of the authorization signing payload
const AUTHORIZATION_MAGIC: u8 = 0x05;

/// Delegation of the signing account to `address` on `chain_id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub chain_id: u64,
    pub address: [u8; 20],
    pub nonce: u64,
}

impl Authorization {
    pub fn new(chain_id: u64, address: [u8; 20], nonce: u64) -> Self {
        Self {
            chain_id,
            address,
            nonce,
        }
    }

    /// `keccak256(0x05 || rlp([chain_id, address, nonce]))`
    pub fn signing_hash(&self) -> [u8; 32] {
        let mut stream = RlpStream::new_list(3);
        stream.append(&self.chain_id);
        stream.append(&self.address.as_slice());
        stream.append(&self.nonce);

        let mut payload = vec![AUTHORIZATION_MAGIC];
        payload.extend(stream.out());
        keccak256(&payload)
    }

    pub fn into_signed(self, signature: &EthSignature) -> SignedAuthorization {
        SignedAuthorization {
            chain_id: self.chain_id,
            address: checksum_address(&self.address),
            nonce: self.nonce,
            y_parity: signature.v,
            r: format!("0x{}", hex::encode(signature.r)),
            s: format!("0x{}", hex::encode(signature.s)),
        }
    }
}

/// Signed authorization tuple as returned to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedAuthorization {
    pub chain_id: u64,
    pub address: String,
    pub nonce: u64,
    pub y_parity: u8,
    pub r: String,
    pub s: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EthKeyPair;
    use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
    use k256::elliptic_curve::sec1::ToEncodedPoint;

    #[test]
    fn test_signing_payload_layout() {
        let auth = Authorization::new(1, [0x11; 20], 0);
        let mut stream = RlpStream::new_list(3);
        stream.append(&1u64);
        stream.append(&[0x11u8; 20].as_slice());
        stream.append(&0u64);
        let mut expected = vec![0x05];
        expected.extend(stream.out());
        assert_eq!(auth.signing_hash(), keccak256(&expected));

        // chain id and nonce are part of the digest
        assert_ne!(auth.signing_hash(), Authorization::new(2, [0x11; 20], 0).signing_hash());
        assert_ne!(auth.signing_hash(), Authorization::new(1, [0x11; 20], 1).signing_hash());
    }

    #[test]
    fn test_signed_authorization_recovers_signer() {
        let keypair = EthKeyPair::generate();
        let auth = Authorization::new(8453, [0x22; 20], 7);
        let hash = auth.signing_hash();
        let signature = keypair.sign_hash(&hash).unwrap();
        let signed = auth.into_signed(&signature);

        assert_eq!(signed.chain_id, 8453);
        assert_eq!(signed.nonce, 7);
        assert!(signed.y_parity <= 1);

        let mut rs = [0u8; 64];
        rs[..32].copy_from_slice(&signature.r);
        rs[32..].copy_from_slice(&signature.s);
        let recovered = VerifyingKey::recover_from_prehash(
            &hash,
            &Signature::from_slice(&rs).unwrap(),
            RecoveryId::from_byte(signed.y_parity).unwrap(),
        )
        .unwrap();
        let encoded = recovered.to_encoded_point(false);
        let address = &keccak256(&encoded.as_bytes()[1..])[12..];
        assert_eq!(address, keypair.address().as_slice());

        let json = serde_json::to_value(&signed).unwrap();
        assert!(json.get("yParity").is_some());
        assert!(json.get("chainId").is_some());
    }
}
