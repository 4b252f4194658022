//! Bucket entry records and their canonical ordering.
//!
//! A bucket holds a sorted stream of [`BucketEntry`] records. Each record
//! is one of four kinds:
//!
//! | Kind       | Payload       | Meaning                                   |
//! |------------|---------------|-------------------------------------------|
//! | `Metadata` | format info   | Sentinel; sorts first; at most one        |
//! | `Init`     | `LedgerEntry` | First appearance of a key (creation)      |
//! | `Live`     | `LedgerEntry` | Update or re-creation; authoritative value|
//! | `Dead`     | `LedgerKey`   | Tombstone                                 |
//!
//! `Init` and `Metadata` only exist at protocol versions at or after
//! [`FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY`](crate::FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY).
//!
//! # Ordering
//!
//! Within a bucket, entries are strictly ascending by key with META (if
//! present) first. Keys order by entry-type discriminant first, then by
//! the type-specific fields in XDR declaration order. This ordering must
//! be identical across every node or bucket hashes diverge.

use std::cmp::Ordering;

use stellar_xdr::curr::{
    BucketEntry as XdrBucketEntry, BucketEntryType, BucketMetadata, LedgerEntry, LedgerEntryData,
    LedgerEntryType, LedgerKey, Limits, ReadXdr, WriteXdr,
};

use crate::{BucketError, Result};

/// A single record in a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketEntry {
    /// An active ledger entry: the authoritative value for its key.
    Live(LedgerEntry),
    /// An entry created within the current merge window. Carries the
    /// same payload as `Live` but reconciles differently against
    /// tombstones during merges.
    Init(LedgerEntry),
    /// A tombstone recording that the key was deleted.
    Dead(LedgerKey),
    /// Bucket format metadata (the protocol version the bucket was
    /// written at). Present iff the bucket was written at or after the
    /// INIT/META protocol gate.
    Metadata(BucketMetadata),
}

impl BucketEntry {
    /// Decode one entry from XDR bytes.
    pub fn from_xdr(bytes: &[u8]) -> Result<Self> {
        let xdr = XdrBucketEntry::from_xdr(bytes, Limits::none())
            .map_err(|e| BucketError::BucketCorrupt(format!("unparseable entry: {e}")))?;
        Ok(Self::from_xdr_entry(xdr))
    }

    pub fn from_xdr_entry(xdr: XdrBucketEntry) -> Self {
        match xdr {
            XdrBucketEntry::Liveentry(entry) => BucketEntry::Live(entry),
            XdrBucketEntry::Initentry(entry) => BucketEntry::Init(entry),
            XdrBucketEntry::Deadentry(key) => BucketEntry::Dead(key),
            XdrBucketEntry::Metaentry(meta) => BucketEntry::Metadata(meta),
        }
    }

    pub fn to_xdr_entry(&self) -> XdrBucketEntry {
        match self {
            BucketEntry::Live(entry) => XdrBucketEntry::Liveentry(entry.clone()),
            BucketEntry::Init(entry) => XdrBucketEntry::Initentry(entry.clone()),
            BucketEntry::Dead(key) => XdrBucketEntry::Deadentry(key.clone()),
            BucketEntry::Metadata(meta) => XdrBucketEntry::Metaentry(meta.clone()),
        }
    }

    /// Encode to XDR bytes.
    pub fn to_xdr(&self) -> Result<Vec<u8>> {
        self.to_xdr_entry()
            .to_xdr(Limits::none())
            .map_err(|e| BucketError::Serialization(format!("entry encode failed: {e}")))
    }

    /// The ledger key this entry is about. `None` for metadata.
    pub fn key(&self) -> Option<LedgerKey> {
        match self {
            BucketEntry::Live(entry) | BucketEntry::Init(entry) => Some(ledger_entry_key(entry)),
            BucketEntry::Dead(key) => Some(key.clone()),
            BucketEntry::Metadata(_) => None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, BucketEntry::Live(_))
    }

    pub fn is_init(&self) -> bool {
        matches!(self, BucketEntry::Init(_))
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, BucketEntry::Dead(_))
    }

    pub fn is_metadata(&self) -> bool {
        matches!(self, BucketEntry::Metadata(_))
    }

    pub fn entry_type(&self) -> BucketEntryType {
        match self {
            BucketEntry::Live(_) => BucketEntryType::Liveentry,
            BucketEntry::Init(_) => BucketEntryType::Initentry,
            BucketEntry::Dead(_) => BucketEntryType::Deadentry,
            BucketEntry::Metadata(_) => BucketEntryType::Metaentry,
        }
    }

    /// The payload for live and init entries.
    pub fn ledger_entry(&self) -> Option<&LedgerEntry> {
        match self {
            BucketEntry::Live(entry) | BucketEntry::Init(entry) => Some(entry),
            _ => None,
        }
    }
}

/// Project a `LedgerEntry` to the `LedgerKey` that identifies it.
pub fn ledger_entry_key(entry: &LedgerEntry) -> LedgerKey {
    use stellar_xdr::curr::*;

    match &entry.data {
        LedgerEntryData::Account(account) => LedgerKey::Account(LedgerKeyAccount {
            account_id: account.account_id.clone(),
        }),
        LedgerEntryData::Trustline(trustline) => LedgerKey::Trustline(LedgerKeyTrustLine {
            account_id: trustline.account_id.clone(),
            asset: trustline.asset.clone(),
        }),
        LedgerEntryData::Offer(offer) => LedgerKey::Offer(LedgerKeyOffer {
            seller_id: offer.seller_id.clone(),
            offer_id: offer.offer_id,
        }),
        LedgerEntryData::Data(data) => LedgerKey::Data(LedgerKeyData {
            account_id: data.account_id.clone(),
            data_name: data.data_name.clone(),
        }),
        LedgerEntryData::ClaimableBalance(cb) => {
            LedgerKey::ClaimableBalance(LedgerKeyClaimableBalance {
                balance_id: cb.balance_id.clone(),
            })
        }
        LedgerEntryData::LiquidityPool(pool) => LedgerKey::LiquidityPool(LedgerKeyLiquidityPool {
            liquidity_pool_id: pool.liquidity_pool_id.clone(),
        }),
        LedgerEntryData::ContractData(cd) => LedgerKey::ContractData(LedgerKeyContractData {
            contract: cd.contract.clone(),
            key: cd.key.clone(),
            durability: cd.durability,
        }),
        LedgerEntryData::ContractCode(cc) => LedgerKey::ContractCode(LedgerKeyContractCode {
            hash: cc.hash.clone(),
        }),
        LedgerEntryData::ConfigSetting(cs) => LedgerKey::ConfigSetting(LedgerKeyConfigSetting {
            config_setting_id: cs.discriminant(),
        }),
        LedgerEntryData::Ttl(ttl) => LedgerKey::Ttl(LedgerKeyTtl {
            key_hash: ttl.key_hash.clone(),
        }),
    }
}

fn key_type(key: &LedgerKey) -> LedgerEntryType {
    match key {
        LedgerKey::Account(_) => LedgerEntryType::Account,
        LedgerKey::Trustline(_) => LedgerEntryType::Trustline,
        LedgerKey::Offer(_) => LedgerEntryType::Offer,
        LedgerKey::Data(_) => LedgerEntryType::Data,
        LedgerKey::ClaimableBalance(_) => LedgerEntryType::ClaimableBalance,
        LedgerKey::LiquidityPool(_) => LedgerEntryType::LiquidityPool,
        LedgerKey::ContractData(_) => LedgerEntryType::ContractData,
        LedgerKey::ContractCode(_) => LedgerEntryType::ContractCode,
        LedgerKey::ConfigSetting(_) => LedgerEntryType::ConfigSetting,
        LedgerKey::Ttl(_) => LedgerEntryType::Ttl,
    }
}

/// Total order over ledger keys: entry-type discriminant first, then the
/// type-specific fields. Every node must agree on this order exactly.
pub fn compare_keys(a: &LedgerKey, b: &LedgerKey) -> Ordering {
    match key_type(a).cmp(&key_type(b)) {
        Ordering::Equal => compare_keys_same_type(a, b),
        other => other,
    }
}

fn compare_keys_same_type(a: &LedgerKey, b: &LedgerKey) -> Ordering {
    match (a, b) {
        (LedgerKey::Account(a), LedgerKey::Account(b)) => a.account_id.cmp(&b.account_id),
        (LedgerKey::Trustline(a), LedgerKey::Trustline(b)) => a
            .account_id
            .cmp(&b.account_id)
            .then_with(|| a.asset.cmp(&b.asset)),
        (LedgerKey::Offer(a), LedgerKey::Offer(b)) => a
            .seller_id
            .cmp(&b.seller_id)
            .then_with(|| a.offer_id.cmp(&b.offer_id)),
        (LedgerKey::Data(a), LedgerKey::Data(b)) => a
            .account_id
            .cmp(&b.account_id)
            .then_with(|| a.data_name.cmp(&b.data_name)),
        (LedgerKey::ClaimableBalance(a), LedgerKey::ClaimableBalance(b)) => {
            a.balance_id.cmp(&b.balance_id)
        }
        (LedgerKey::LiquidityPool(a), LedgerKey::LiquidityPool(b)) => {
            a.liquidity_pool_id.cmp(&b.liquidity_pool_id)
        }
        (LedgerKey::ContractData(a), LedgerKey::ContractData(b)) => a
            .contract
            .cmp(&b.contract)
            .then_with(|| a.key.cmp(&b.key))
            .then_with(|| a.durability.cmp(&b.durability)),
        (LedgerKey::ContractCode(a), LedgerKey::ContractCode(b)) => a.hash.cmp(&b.hash),
        (LedgerKey::ConfigSetting(a), LedgerKey::ConfigSetting(b)) => {
            a.config_setting_id.cmp(&b.config_setting_id)
        }
        (LedgerKey::Ttl(a), LedgerKey::Ttl(b)) => a.key_hash.cmp(&b.key_hash),
        _ => Ordering::Equal,
    }
}

/// Order two entries: META sorts before everything, otherwise by key.
pub fn compare_entries(a: &BucketEntry, b: &BucketEntry) -> Ordering {
    match (a.key(), b.key()) {
        (Some(ka), Some(kb)) => compare_keys(&ka, &kb),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
