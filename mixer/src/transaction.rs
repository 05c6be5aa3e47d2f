use serde::{Deserialize, Serialize};
use umbra_common::crypto::{Ed25519KeyPair, Ed25519Signature, PublicKey};

// Body of a transfer, signed as canonical JSON bytes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferPayload {
    pub from: PublicKey,
    pub to: PublicKey,
    // native units delivered to `to`
    pub amount: u64,
    // compute unit price attached to the transfer
    pub priority_fee: u64,
    pub recent_blockhash: String,
    // pays the transaction fee when different from `from`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_payer: Option<PublicKey>,
}

// Envelope submitted to the ledger: payload plus every signature over
// its canonical bytes, sender first
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TransferEnvelope {
    signatures: Vec<Ed25519Signature>,
    payload: TransferPayload,
}

// A transfer ready for submission
//
// The sender signature doubles as the on-chain transaction id.
#[derive(Debug, Clone)]
pub struct SignedTransfer {
    pub payload: TransferPayload,
    pub signature: Ed25519Signature,
    encoded: String,
}

impl SignedTransfer {
    // Base58 wire encoding expected by send_transaction
    pub fn encoded(&self) -> &str {
        &self.encoded
    }
}

// Build and sign a transfer from `keypair` to `to`
//
// When a separate fee payer is provided it co-signs the envelope and
// the ledger charges the transaction fee to it instead of the sender.
pub fn build_transfer(
    keypair: &Ed25519KeyPair,
    fee_payer: Option<&Ed25519KeyPair>,
    to: &PublicKey,
    amount: u64,
    priority_fee: u64,
    recent_blockhash: &str,
) -> SignedTransfer {
    let payload = TransferPayload {
        from: keypair.public_key(),
        to: *to,
        amount,
        priority_fee,
        recent_blockhash: recent_blockhash.to_owned(),
        fee_payer: fee_payer.map(|fp| fp.public_key()),
    };

    // serde_json over a struct keeps field order stable, both sides
    // sign and verify the exact same bytes
    let message = serde_json::to_vec(&payload).expect("payload is always serializable");
    let signature = keypair.sign(&message);

    let mut signatures = vec![signature];
    if let Some(fee_payer) = fee_payer {
        signatures.push(fee_payer.sign(&message));
    }

    let envelope = TransferEnvelope {
        signatures,
        payload: payload.clone(),
    };
    let encoded = bs58::encode(
        serde_json::to_vec(&envelope).expect("envelope is always serializable"),
    )
    .into_string();

    SignedTransfer {
        payload,
        signature,
        encoded,
    }
}

// Decode a wire transfer back into its payload, verifying signatures
//
// Used by the stub ledger in tests and kept next to the encoder so the
// two stay in sync.
pub fn decode_transfer(encoded: &str) -> Option<(TransferPayload, Ed25519Signature)> {
    let bytes = bs58::decode(encoded).into_vec().ok()?;
    let envelope: TransferEnvelope = serde_json::from_slice(&bytes).ok()?;

    let message = serde_json::to_vec(&envelope.payload).ok()?;
    let sender = envelope.signatures.first()?;
    envelope
        .payload
        .from
        .verify(&message, sender)
        .ok()?;

    if let Some(fee_payer) = &envelope.payload.fee_payer {
        let co_signature = envelope.signatures.get(1)?;
        fee_payer.verify(&message, co_signature).ok()?;
    }

    Some((envelope.payload, *sender))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_decode() {
        let sender = Ed25519KeyPair::generate();
        let receiver = Ed25519KeyPair::generate().public_key();

        let transfer = build_transfer(&sender, None, &receiver, 42_000, 1_000_000, "HASH");
        let (payload, signature) = decode_transfer(transfer.encoded()).unwrap();

        assert_eq!(payload.from, sender.public_key());
        assert_eq!(payload.to, receiver);
        assert_eq!(payload.amount, 42_000);
        assert_eq!(payload.priority_fee, 1_000_000);
        assert_eq!(payload.recent_blockhash, "HASH");
        assert_eq!(signature, transfer.signature);
    }

    #[test]
    fn test_separate_fee_payer_co_signs() {
        let sender = Ed25519KeyPair::generate();
        let fee_payer = Ed25519KeyPair::generate();
        let receiver = Ed25519KeyPair::generate().public_key();

        let transfer = build_transfer(&sender, Some(&fee_payer), &receiver, 1, 0, "HASH");
        let (payload, _) = decode_transfer(transfer.encoded()).unwrap();
        assert_eq!(payload.fee_payer, Some(fee_payer.public_key()));
    }

    #[test]
    fn test_tampered_envelope_rejected() {
        let sender = Ed25519KeyPair::generate();
        let receiver = Ed25519KeyPair::generate().public_key();

        let transfer = build_transfer(&sender, None, &receiver, 42_000, 0, "HASH");

        let mut bytes = bs58::decode(transfer.encoded()).into_vec().unwrap();
        // bump the amount inside the serialized payload
        let needle = b"\"amount\":42000";
        let pos = bytes
            .windows(needle.len())
            .position(|w| w == needle)
            .unwrap();
        bytes[pos + needle.len() - 1] = b'1';

        let tampered = bs58::encode(bytes).into_string();
        assert!(decode_transfer(&tampered).is_none());
    }
}
