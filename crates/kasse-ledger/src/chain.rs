//! Hash-chain primitives: canonical serialization, hashing, and verification.
//!
//! Hash input layout for canonical version 1 (bytes, in order):
//!   1. the domain tag `kasse-ledger/v1`
//!   2. a single NUL byte
//!   3. previous_hash as UTF-8 bytes (64 ASCII hex chars)
//!   4. compact JSON of `CanonicalV1`
//!
//! `CanonicalV1` lists its fields in a fixed order, and `serde_json` objects
//! inside `payload` and `device_response` serialize with sorted keys as long
//! as the `preserve_order` feature stays disabled.  Timestamps are rendered
//! as RFC 3339 UTC with microsecond precision, so the ledger stores them
//! truncated to microseconds.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use kasse_contracts::{
    error::{KasseError, KasseResult},
    ids::{ActorId, ChainId, OperationId},
    ledger::{
        BreakKind, ChainBreak, ChainRange, ChainVerification, EventType, LedgerEntry,
    },
};

/// `previous_hash` of the first entry on every chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Canonicalization written by this build.
pub const CANONICAL_VERSION: u16 = 1;

const DOMAIN_TAG_V1: &[u8] = b"kasse-ledger/v1";

/// Every hashed field of an entry, borrowed.
///
/// Both appends (from a draft) and verification (from a stored entry) go
/// through this view, so the two can never disagree about what is hashed.
#[derive(Debug, Clone, Copy)]
pub struct EntryFields<'a> {
    pub chain: ChainId,
    pub sequence: u64,
    pub event_type: EventType,
    pub timestamp_utc: DateTime<Utc>,
    pub transaction_number: Option<u64>,
    pub actor_id: Option<&'a ActorId>,
    pub operation_id: Option<&'a OperationId>,
    pub payload: &'a serde_json::Value,
    pub device_response: &'a serde_json::Value,
}

impl<'a> EntryFields<'a> {
    pub fn of(entry: &'a LedgerEntry) -> Self {
        Self {
            chain: entry.chain,
            sequence: entry.sequence,
            event_type: entry.event_type,
            timestamp_utc: entry.timestamp_utc,
            transaction_number: entry.transaction_number,
            actor_id: entry.actor_id.as_ref(),
            operation_id: entry.operation_id.as_ref(),
            payload: &entry.payload,
            device_response: &entry.device_response,
        }
    }
}

#[derive(Serialize)]
struct CanonicalV1<'a> {
    chain: &'static str,
    sequence: u64,
    event_type: &'static str,
    timestamp_utc: String,
    transaction_number: Option<u64>,
    actor_id: Option<&'a str>,
    operation_id: Option<&'a str>,
    payload: &'a serde_json::Value,
    device_response: &'a serde_json::Value,
}

/// Truncate a timestamp to the precision the canonical form keeps.
pub fn canonical_timestamp(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

fn canonical_bytes(version: u16, fields: &EntryFields<'_>) -> KasseResult<Vec<u8>> {
    match version {
        1 => {
            let canonical = CanonicalV1 {
                chain: fields.chain.as_str(),
                sequence: fields.sequence,
                event_type: fields.event_type.as_str(),
                timestamp_utc: fields.timestamp_utc.to_rfc3339_opts(SecondsFormat::Micros, true),
                transaction_number: fields.transaction_number,
                actor_id: fields.actor_id.map(ActorId::as_str),
                operation_id: fields.operation_id.map(OperationId::as_str),
                payload: fields.payload,
                device_response: fields.device_response,
            };
            Ok(serde_json::to_vec(&canonical)?)
        }
        other => Err(KasseError::Integrity {
            chain: fields.chain.to_string(),
            reason: format!("unsupported canonical version {}", other),
        }),
    }
}

/// Hash `fields` linked to `previous_hash` under canonical `version`.
///
/// Returns a lowercase 64-character hex string.
///
/// # Errors
///
/// `Integrity` for a version this build cannot evaluate.
pub fn compute_versioned(
    version: u16,
    previous_hash: &str,
    fields: &EntryFields<'_>,
) -> KasseResult<String> {
    let body = canonical_bytes(version, fields)?;

    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_TAG_V1);
    hasher.update([0u8]);
    hasher.update(previous_hash.as_bytes());
    hasher.update(&body);

    Ok(hex::encode(hasher.finalize()))
}

/// Hash `fields` under the current canonical version.
pub fn compute(previous_hash: &str, fields: &EntryFields<'_>) -> KasseResult<String> {
    compute_versioned(CANONICAL_VERSION, previous_hash, fields)
}

/// `true` when `entry` links to `previous_hash` and its stored hash
/// recomputes from its own fields.
pub fn verify(entry: &LedgerEntry, previous_hash: &str) -> bool {
    if entry.previous_hash != previous_hash {
        return false;
    }
    compute_versioned(entry.canonical_version, &entry.previous_hash, &EntryFields::of(entry))
        .map(|recomputed| recomputed == entry.current_hash)
        .unwrap_or(false)
}

fn check_entry(
    chain: ChainId,
    position: u64,
    entry: &LedgerEntry,
    previous: Option<&LedgerEntry>,
) -> Option<BreakKind> {
    if entry.chain != chain {
        return Some(BreakKind::ForeignChain);
    }
    if entry.sequence != position {
        return Some(BreakKind::SequenceGap);
    }
    let expected_prev = previous.map_or(GENESIS_HASH, |p| p.current_hash.as_str());
    if entry.previous_hash != expected_prev {
        return Some(BreakKind::LinkMismatch);
    }
    if entry.canonical_version != CANONICAL_VERSION {
        return Some(BreakKind::UnsupportedCanonicalVersion);
    }
    if !verify(entry, expected_prev) {
        return Some(BreakKind::HashMismatch);
    }
    if previous.is_some_and(|p| entry.timestamp_utc < p.timestamp_utc) {
        return Some(BreakKind::TimestampRegression);
    }
    None
}

/// Walk `entries` (the whole chain, in stored order) and report the first
/// break within `range`.
///
/// Entries before `range.from` are not checked themselves but still provide
/// the link for the first checked entry.  An empty chain is valid.
pub fn verify_entries(chain: ChainId, entries: &[LedgerEntry], range: ChainRange) -> ChainVerification {
    let mut checked = 0u64;
    let mut previous: Option<&LedgerEntry> = None;

    for (position, entry) in entries.iter().enumerate() {
        let position = position as u64;
        if range.to.is_some_and(|to| position > to) {
            break;
        }
        if range.contains(position) {
            checked += 1;
            if let Some(kind) = check_entry(chain, position, entry, previous) {
                return ChainVerification::broken(
                    chain,
                    checked,
                    ChainBreak { log_id: entry.log_id, sequence: position, kind },
                );
            }
        }
        previous = Some(entry);
    }

    ChainVerification::intact(chain, checked)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use kasse_contracts::{
        ids::{ActorId, ChainId, LogId, OperationId},
        ledger::{BreakKind, ChainRange, EventType, LedgerEntry},
    };

    use super::*;

    fn entry(sequence: u64, previous_hash: &str, total: i64) -> LedgerEntry {
        let mut e = LedgerEntry {
            log_id: LogId::new(),
            chain: ChainId::Fiscal,
            sequence,
            timestamp_utc: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, sequence as u32).unwrap(),
            event_type: EventType::TransactionClosed,
            transaction_number: Some(sequence + 100),
            actor_id: Some(ActorId::new("cashier-1")),
            operation_id: Some(OperationId::new(format!("op-{}", sequence))),
            payload: json!({ "total_cents": total, "items": ["a", "b"] }),
            device_response: json!({ "signature": "abc" }),
            canonical_version: CANONICAL_VERSION,
            previous_hash: previous_hash.to_string(),
            current_hash: String::new(),
        };
        e.current_hash = compute(previous_hash, &EntryFields::of(&e)).unwrap();
        e
    }

    fn chain_of(n: u64) -> Vec<LedgerEntry> {
        let mut entries: Vec<LedgerEntry> = Vec::new();
        for seq in 0..n {
            let prev = entries.last().map_or(GENESIS_HASH.to_string(), |e| e.current_hash.clone());
            entries.push(entry(seq, &prev, 100 * seq as i64));
        }
        entries
    }

    #[test]
    fn test_genesis_is_64_zeros() {
        assert_eq!(GENESIS_HASH.len(), 64);
        assert!(GENESIS_HASH.chars().all(|c| c == '0'));
    }

    /// Same fields and link always hash to the same lowercase hex digest.
    #[test]
    fn test_hash_is_deterministic() {
        let e = entry(0, GENESIS_HASH, 1990);
        let again = compute(GENESIS_HASH, &EntryFields::of(&e)).unwrap();
        assert_eq!(e.current_hash, again);
        assert_eq!(again.len(), 64);
        assert!(again.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    /// Object key order inside the payload does not change the hash.
    #[test]
    fn test_payload_key_order_is_irrelevant() {
        let mut a = entry(0, GENESIS_HASH, 5);
        let mut b = a.clone();
        a.payload = serde_json::from_str(r#"{"x":1,"y":{"b":2,"a":1}}"#).unwrap();
        b.payload = serde_json::from_str(r#"{"y":{"a":1,"b":2},"x":1}"#).unwrap();
        assert_eq!(
            compute(GENESIS_HASH, &EntryFields::of(&a)).unwrap(),
            compute(GENESIS_HASH, &EntryFields::of(&b)).unwrap()
        );
    }

    /// Sub-microsecond digits are not part of the hash.
    #[test]
    fn test_timestamp_hashed_at_microseconds() {
        let base = entry(0, GENESIS_HASH, 5);
        let mut nanos = base.clone();
        nanos.timestamp_utc = base.timestamp_utc + chrono::Duration::nanoseconds(999);
        assert_eq!(
            compute(GENESIS_HASH, &EntryFields::of(&base)).unwrap(),
            compute(GENESIS_HASH, &EntryFields::of(&nanos)).unwrap()
        );
        let mut micros = base.clone();
        micros.timestamp_utc = base.timestamp_utc + chrono::Duration::microseconds(1);
        assert_ne!(
            compute(GENESIS_HASH, &EntryFields::of(&base)).unwrap(),
            compute(GENESIS_HASH, &EntryFields::of(&micros)).unwrap()
        );
    }

    #[test]
    fn test_previous_hash_changes_digest() {
        let e = entry(0, GENESIS_HASH, 5);
        let other = compute(&"1".repeat(64), &EntryFields::of(&e)).unwrap();
        assert_ne!(e.current_hash, other);
    }

    #[test]
    fn test_intact_chain_verifies() {
        let entries = chain_of(4);
        let report = verify_entries(ChainId::Fiscal, &entries, ChainRange::all());
        assert!(report.valid);
        assert_eq!(report.checked, 4);
        assert!(report.broken_at.is_none());
    }

    #[test]
    fn test_empty_chain_is_valid() {
        let report = verify_entries(ChainId::Operational, &[], ChainRange::all());
        assert!(report.valid);
        assert_eq!(report.checked, 0);
    }

    /// Changing one stored payload is reported at exactly that entry.
    #[test]
    fn test_tampered_payload_reported_at_entry() {
        let mut entries = chain_of(5);
        entries[2].payload = json!({ "total_cents": 1 });
        let report = verify_entries(ChainId::Fiscal, &entries, ChainRange::all());
        assert!(!report.valid);
        let at = report.broken_at.unwrap();
        assert_eq!(at.sequence, 2);
        assert_eq!(at.log_id, entries[2].log_id);
        assert_eq!(at.kind, BreakKind::HashMismatch);
    }

    /// Rewriting an entry's hash breaks the link of its successor.
    #[test]
    fn test_rehashed_entry_breaks_successor_link() {
        let mut entries = chain_of(3);
        entries[1].payload = json!({ "total_cents": 1 });
        let prev = entries[0].current_hash.clone();
        entries[1].current_hash = compute(&prev, &EntryFields::of(&entries[1])).unwrap();

        let at = verify_entries(ChainId::Fiscal, &entries, ChainRange::all()).broken_at.unwrap();
        assert_eq!(at.sequence, 2);
        assert_eq!(at.kind, BreakKind::LinkMismatch);
    }

    #[test]
    fn test_deleted_entry_is_a_sequence_gap() {
        let mut entries = chain_of(4);
        entries.remove(1);
        let at = verify_entries(ChainId::Fiscal, &entries, ChainRange::all()).broken_at.unwrap();
        assert_eq!(at.sequence, 1);
        assert_eq!(at.kind, BreakKind::SequenceGap);
    }

    #[test]
    fn test_unknown_canonical_version_is_reported() {
        let mut entries = chain_of(2);
        entries[1].canonical_version = 9;
        let at = verify_entries(ChainId::Fiscal, &entries, ChainRange::all()).broken_at.unwrap();
        assert_eq!(at.kind, BreakKind::UnsupportedCanonicalVersion);
        assert!(compute_versioned(9, GENESIS_HASH, &EntryFields::of(&entries[0])).is_err());
    }

    #[test]
    fn test_entry_from_other_chain_is_reported() {
        let entries = chain_of(2);
        let at = verify_entries(ChainId::Operational, &entries, ChainRange::all())
            .broken_at
            .unwrap();
        assert_eq!(at.sequence, 0);
        assert_eq!(at.kind, BreakKind::ForeignChain);
    }

    /// A range only checks its own entries but links against the one before.
    #[test]
    fn test_range_limits_checked_entries() {
        let mut entries = chain_of(6);
        entries[0].payload = json!("tampered outside the range");

        let report = verify_entries(
            ChainId::Fiscal,
            &entries,
            ChainRange { from: Some(2), to: Some(4) },
        );
        assert!(report.valid);
        assert_eq!(report.checked, 3);

        entries[3].payload = json!("tampered inside the range");
        let report = verify_entries(
            ChainId::Fiscal,
            &entries,
            ChainRange { from: Some(2), to: Some(4) },
        );
        assert_eq!(report.broken_at.unwrap().sequence, 3);
    }

    #[test]
    fn test_verify_single_entry() {
        let entries = chain_of(2);
        assert!(verify(&entries[0], GENESIS_HASH));
        assert!(verify(&entries[1], &entries[0].current_hash));
        assert!(!verify(&entries[1], GENESIS_HASH));
    }
}
