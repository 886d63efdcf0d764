//! In-memory UTXO set with atomic per-block apply and revert.
//!
//! The chain manager is the only writer; everyone else reads snapshots.
//! [`UtxoSet::apply_block`] is all-or-nothing: the first failing input rolls
//! back every change the block made, so a half-applied block can never leak
//! into the set. The emitted [`BlockDeltas`] double as the WAL record that
//! makes the block reversible.

use std::collections::HashMap;

use crate::codec::{Encodable, Reader, Writer};
use crate::error::{CodecError, UtxoError};
use crate::merkle;
use crate::types::{Block, Hash256, OutPoint, UtxoEntry};

/// The reversible effect of one block on the UTXO set.
///
/// `spent` and `created` are ordered as the block's transactions consumed and
/// produced them; reverting walks them backwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockDeltas {
    /// The block these deltas belong to.
    pub block_hash: Hash256,
    /// Entries removed by the block, in consumption order.
    pub spent: Vec<(OutPoint, UtxoEntry)>,
    /// Entries created by the block, in production order.
    pub created: Vec<(OutPoint, UtxoEntry)>,
}

impl Encodable for (OutPoint, UtxoEntry) {
    fn encode_into(&self, w: &mut Writer) {
        self.0.encode_into(w);
        self.1.encode_into(w);
    }
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok((OutPoint::decode_from(r)?, UtxoEntry::decode_from(r)?))
    }
}

impl Encodable for BlockDeltas {
    fn encode_into(&self, w: &mut Writer) {
        self.block_hash.encode_into(w);
        w.put_vec(&self.spent);
        w.put_vec(&self.created);
    }
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            block_hash: Hash256::decode_from(r)?,
            spent: r.get_vec()?,
            created: r.get_vec()?,
        })
    }
}

/// The set of unspent transaction outputs.
#[derive(Clone, Debug, Default)]
pub struct UtxoSet {
    entries: HashMap<OutPoint, UtxoEntry>,
    /// Sum of all entry amounts; checked against minted supply by audits.
    total_amount: u64,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&UtxoEntry> {
        self.entries.get(outpoint)
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.entries.contains_key(outpoint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all unspent amounts.
    pub fn total_amount(&self) -> u64 {
        self.total_amount
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OutPoint, &UtxoEntry)> {
        self.entries.iter()
    }

    /// Atomically consume `inputs` at `spend_height`.
    ///
    /// Either every input is present and mature and all are removed, or the
    /// set is untouched and the first failure is returned.
    pub fn consume(
        &mut self,
        inputs: &[OutPoint],
        spend_height: u64,
        maturity: u64,
    ) -> Result<Vec<(OutPoint, UtxoEntry)>, UtxoError> {
        for outpoint in inputs {
            let entry = self
                .entries
                .get(outpoint)
                .ok_or_else(|| UtxoError::Missing(outpoint.to_string()))?;
            if !entry.is_mature(spend_height, maturity) {
                return Err(UtxoError::Immature {
                    outpoint: outpoint.to_string(),
                    created: entry.height,
                    height: spend_height,
                });
            }
        }

        let mut removed = Vec::with_capacity(inputs.len());
        for outpoint in inputs {
            let entry = self.entries.remove(outpoint).expect("validated above");
            self.total_amount -= entry.amount;
            removed.push((*outpoint, entry));
        }
        Ok(removed)
    }

    /// Insert new entries. Fails without modification if any outpoint is
    /// already present.
    pub fn produce(&mut self, outputs: &[(OutPoint, UtxoEntry)]) -> Result<(), UtxoError> {
        for (outpoint, _) in outputs {
            if self.entries.contains_key(outpoint) {
                return Err(UtxoError::DuplicateOutpoint(outpoint.to_string()));
            }
        }
        for (outpoint, entry) in outputs {
            self.total_amount += entry.amount;
            self.entries.insert(*outpoint, entry.clone());
        }
        Ok(())
    }

    /// Apply a whole block in transaction order, all-or-nothing.
    ///
    /// Later transactions may spend outputs created earlier in the same
    /// block. On the first failure every change already made by this call is
    /// rolled back before the error is returned.
    pub fn apply_block(&mut self, block: &Block, maturity: u64) -> Result<BlockDeltas, UtxoError> {
        let height = block.header.height;
        let mut spent: Vec<(OutPoint, UtxoEntry)> = Vec::new();
        let mut created: Vec<(OutPoint, UtxoEntry)> = Vec::new();

        let result = (|| {
            for tx in &block.transactions {
                let removed = self.consume(&tx.inputs, height, maturity)?;
                spent.extend(removed);

                let txid = tx.txid();
                let outputs: Vec<(OutPoint, UtxoEntry)> = tx
                    .outputs
                    .iter()
                    .enumerate()
                    .map(|(vout, out)| {
                        (
                            OutPoint { txid, vout: vout as u32 },
                            UtxoEntry {
                                address: out.address,
                                amount: out.amount,
                                height,
                                coinbase: tx.is_coinbase(),
                            },
                        )
                    })
                    .collect();
                self.produce(&outputs)?;
                created.extend(outputs);
            }
            Ok(())
        })();

        match result {
            Ok(()) => Ok(BlockDeltas { block_hash: block.hash(), spent, created }),
            Err(e) => {
                // Roll back partial changes in reverse order.
                for (outpoint, entry) in created.iter().rev() {
                    if self.entries.remove(outpoint).is_some() {
                        self.total_amount -= entry.amount;
                    }
                }
                for (outpoint, entry) in spent.iter().rev() {
                    self.total_amount += entry.amount;
                    self.entries.insert(*outpoint, entry.clone());
                }
                Err(e)
            }
        }
    }

    /// Undo a block's deltas: remove what it created, restore what it spent.
    pub fn revert_deltas(&mut self, deltas: &BlockDeltas) {
        for (outpoint, entry) in deltas.created.iter().rev() {
            if self.entries.remove(outpoint).is_some() {
                self.total_amount -= entry.amount;
            }
        }
        for (outpoint, entry) in deltas.spent.iter().rev() {
            self.total_amount += entry.amount;
            self.entries.insert(*outpoint, entry.clone());
        }
    }

    /// Merkle root over the canonical encodings of all entries, sorted by
    /// outpoint. Computed at checkpoints for audit.
    pub fn utxo_root(&self) -> Hash256 {
        let mut outpoints: Vec<&OutPoint> = self.entries.keys().collect();
        outpoints.sort();
        let leaves: Vec<Hash256> = outpoints
            .into_iter()
            .map(|op| {
                let entry = &self.entries[op];
                let mut w = Writer::with_capacity(64);
                op.encode_into(&mut w);
                entry.encode_into(&mut w);
                crate::crypto::sha256d(&w.into_bytes())
            })
            .collect();
        merkle::merkle_root(&leaves)
    }
}
