use crate::types::{Opcode, Subscription};
use base64::Engine;
use sha2::{Digest, Sha256};

/// Protocol tag. First byte of every canonical payload.
pub const PROTOCOL_TAG: u8 = 0x01;

/// Reserved opcode bytes for admin transfers from the canister's own address.
/// These share the envelope but are never produced by the scheduler.
pub const OPCODE_WITHDRAW_SOL: u8 = 0x10;
pub const OPCODE_WITHDRAW_TOKEN: u8 = 0x11;

/// Canonical opcode payload, byte-exact:
///
/// ```text
/// tag(1) | opcode(1) | len16(sub_id) sub_id | len16(contract) contract |
/// len16(mint) mint | amount_hint be64 | interval_seconds be64 | nonce(8)
/// ```
///
/// This layout is the wire contract with every deployed settlement contract.
/// Do not reorder or re-encode fields.
pub fn encode_payment_payload(sub: &Subscription, opcode: Opcode) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        2 + 6
            + sub.sub_id.len()
            + sub.settlement_contract.len()
            + sub.token_mint.len()
            + 8
            + 8
            + 8,
    );
    out.push(PROTOCOL_TAG);
    out.push(opcode.wire_byte());
    put_len_prefixed(&mut out, &sub.sub_id);
    put_len_prefixed(&mut out, &sub.settlement_contract);
    put_len_prefixed(&mut out, &sub.token_mint);
    out.extend_from_slice(&sub.amount_hint.to_be_bytes());
    out.extend_from_slice(&sub.interval_seconds.to_be_bytes());
    out.extend_from_slice(&derive_nonce(
        &sub.sub_id,
        sub.trigger_count + 1,
        opcode.wire_byte(),
    ));
    out
}

/// One-off transfer payload for admin withdrawals. Same envelope, reserved
/// opcode range; `mint` is empty for native transfers.
pub fn encode_transfer_payload(
    opcode_byte: u8,
    recipient: &str,
    mint: Option<&str>,
    amount: u64,
    nonce_seed: i64,
) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(PROTOCOL_TAG);
    out.push(opcode_byte);
    put_len_prefixed(&mut out, recipient);
    put_len_prefixed(&mut out, mint.unwrap_or(""));
    out.extend_from_slice(&amount.to_be_bytes());
    out.extend_from_slice(&derive_nonce(
        recipient,
        nonce_seed.unsigned_abs(),
        opcode_byte,
    ));
    out
}

/// Nonce bound to `(sub_id, trigger_count + 1, opcode)`: the first 8 bytes of
/// SHA-256 over `sub_id || 0x00 || be64(seq) || opcode`. Retries within one
/// payment period reuse the nonce; the settlement contract's own counter
/// bounds duplicate damage.
pub fn derive_nonce(sub_id: &str, seq: u64, opcode_byte: u8) -> [u8; 8] {
    let mut hasher = Sha256::new();
    hasher.update(sub_id.as_bytes());
    hasher.update([0x00]);
    hasher.update(seq.to_be_bytes());
    hasher.update([opcode_byte]);
    let digest = hasher.finalize();
    let mut nonce = [0u8; 8];
    nonce.copy_from_slice(&digest[..8]);
    nonce
}

/// Submission blob: `payload || signature(64) || public_key(32)`, base64.
pub fn assemble_blob(payload: &[u8], signature: &[u8; 64], public_key: &[u8; 32]) -> String {
    let mut blob = Vec::with_capacity(payload.len() + 96);
    blob.extend_from_slice(payload);
    blob.extend_from_slice(signature);
    blob.extend_from_slice(public_key);
    base64::engine::general_purpose::STANDARD.encode(blob)
}

fn put_len_prefixed(out: &mut Vec<u8>, s: &str) {
    // Field lengths are validated far upstream (64 chars max for ids, 44 for
    // addresses); the u16 prefix cannot overflow.
    let bytes = s.as_bytes();
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
}
