//! # Phonon Validation
//!
//! After a transfer, the receiver can ask whether the phonon's public key
//! really controls the value it claims. [`PhononValidator`] is that
//! question; [`LedgerValidator`] answers it from an address-indexed
//! transaction history.
//!
//! Balance is computed the way a UTXO indexer reports it: every output paying
//! one of the key's addresses adds, every input spending a coin held at one
//! of them subtracts. Histories are paged [`TRANSACTION_PAGE_LIMIT`] at a
//! time, continuing with an `after` cursor while pages come back full.
//!
//! A transfer checked this way carries a batch of [`PhononClaim`]s. A
//! [`SoftCard`](crate::soft_card::SoftCard) built with a validator refuses
//! the whole transfer if any claim in it is unbacked.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::TRANSACTION_PAGE_LIMIT;
use crate::wire::{decode_payload, encode_payload, WireError};

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("transaction source: {0}")]
    Source(String),

    #[error("no addresses derivable from public key")]
    NoAddresses,
}

/// Decides whether a phonon is economically backed.
#[async_trait]
pub trait PhononValidator: Send + Sync {
    async fn validate(&self, public_key: &[u8], claimed_value: u64) -> Result<bool, ValidatorError>;
}

/// One phonon in a transfer: the key that controls it and the value it
/// claims to hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhononClaim {
    pub public_key: Vec<u8>,
    pub value: u64,
}

impl PhononClaim {
    pub fn encode_batch(claims: &[PhononClaim]) -> Result<Vec<u8>, WireError> {
        encode_payload(&claims)
    }

    pub fn decode_batch(bytes: &[u8]) -> Result<Vec<PhononClaim>, WireError> {
        decode_payload(bytes)
    }

    /// Leading bytes of the key, hex encoded, for log and error text.
    pub fn short_key(&self) -> String {
        hex::encode(&self.public_key[..self.public_key.len().min(8)])
    }
}

// ---------------------------------------------------------------------------
// Ledger Model
// ---------------------------------------------------------------------------

/// An amount at an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub value: i64,
    #[serde(default)]
    pub address: String,
}

/// A transaction input; `coin` is the output it spends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    #[serde(default)]
    pub coin: Option<Coin>,
}

/// Shaped like an indexer's `/tx/address` entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub hash: String,
    #[serde(default)]
    pub inputs: Vec<TxInput>,
    #[serde(default)]
    pub outputs: Vec<Coin>,
}

/// Where transaction history comes from.
#[async_trait]
pub trait TransactionSource: Send + Sync {
    /// Every address encoding the key may have received funds at.
    fn addresses_for(&self, public_key: &[u8]) -> Result<Vec<String>, ValidatorError>;

    /// Up to `limit` transactions touching `address`, oldest first,
    /// starting after the transaction with hash `after`.
    async fn transactions(
        &self,
        address: &str,
        limit: usize,
        after: Option<&str>,
    ) -> Result<Vec<LedgerTransaction>, ValidatorError>;
}

/// Net value the transactions move into `addresses`.
///
/// A transaction listed under several of the addresses counts once.
pub fn aggregate_balance(transactions: &[LedgerTransaction], addresses: &[String]) -> i64 {
    let ours: HashSet<&str> = addresses.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    let mut balance: i64 = 0;

    for tx in transactions {
        if !seen.insert(tx.hash.as_str()) {
            continue;
        }
        for coin in tx.inputs.iter().filter_map(|input| input.coin.as_ref()) {
            if ours.contains(coin.address.as_str()) {
                balance = balance.saturating_sub(coin.value);
            }
        }
        for output in &tx.outputs {
            if ours.contains(output.address.as_str()) {
                balance = balance.saturating_add(output.value);
            }
        }
    }
    balance
}

// ---------------------------------------------------------------------------
// Ledger Validator
// ---------------------------------------------------------------------------

pub struct LedgerValidator<S> {
    source: S,
    page_limit: usize,
}

impl<S: TransactionSource> LedgerValidator<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            page_limit: TRANSACTION_PAGE_LIMIT,
        }
    }

    pub fn with_page_limit(mut self, page_limit: usize) -> Self {
        self.page_limit = page_limit.max(1);
        self
    }

    /// Full history for each address, following the `after` cursor while
    /// pages come back full.
    pub async fn history(&self, addresses: &[String]) -> Result<Vec<LedgerTransaction>, ValidatorError> {
        let mut all = Vec::new();
        for address in addresses {
            let mut after: Option<String> = None;
            loop {
                let page = self
                    .source
                    .transactions(address, self.page_limit, after.as_deref())
                    .await?;
                let full = page.len() == self.page_limit;
                after = page.last().map(|tx| tx.hash.clone());
                all.extend(page);
                if !full {
                    break;
                }
            }
        }
        Ok(all)
    }

    /// Net balance across every address the key maps to.
    pub async fn balance(&self, public_key: &[u8]) -> Result<i64, ValidatorError> {
        let addresses = self.source.addresses_for(public_key)?;
        if addresses.is_empty() {
            return Err(ValidatorError::NoAddresses);
        }
        let history = self.history(&addresses).await?;
        let balance = aggregate_balance(&history, &addresses);
        debug!(addresses = addresses.len(), transactions = history.len(), balance, "balance computed");
        Ok(balance)
    }
}

#[async_trait]
impl<S: TransactionSource> PhononValidator for LedgerValidator<S> {
    async fn validate(&self, public_key: &[u8], claimed_value: u64) -> Result<bool, ValidatorError> {
        let balance = self.balance(public_key).await?;
        Ok(balance > 0 && balance as u64 >= claimed_value)
    }
}
