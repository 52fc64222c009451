//! Balance and transaction creation
//!
//! Outputs spent by a proposal that can still reach its threshold are
//! reserved: they never show up as spendable, so two proposals do not
//! race for the same coins.

use crate::blockchain::UnspentOutput;
use crate::multisig::{
    select_coins, Address, HdPath, KeyRingError, Proposal, Spendable, TxBuilder, TxInput,
};
use crate::network::Recipients;
use crate::wallet::error::WalletError;
use crate::wallet::events::{Dirty, ProposalEventKind, WalletEvent};
use crate::wallet::identity::ConfigurationError;
use crate::wallet::wallet::Wallet;
use chrono::Utc;
use std::collections::BTreeMap;

/// Serialized size of an input outside its script-sig
const INPUT_OVERHEAD: usize = 41;

/// Addresses per unspent-outputs query
const ADDRESS_QUERY_CHUNK: usize = 100;

/// Wallet balance in satoshis
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Balance {
    /// Everything the chain reports
    pub total: u64,
    /// What new proposals may spend
    pub safe: u64,
    pub by_address: BTreeMap<String, u64>,
}

impl Wallet {
    /// Unspent outputs of the wallet as `(safe, all)`
    pub async fn get_unspent(
        &mut self,
    ) -> Result<(Vec<UnspentOutput>, Vec<UnspentOutput>), WalletError> {
        if !self.keyring.is_complete() {
            return Ok((Vec::new(), Vec::new()));
        }
        let paths: Vec<HdPath> = self.keyring.address_paths().collect();
        let mut all = Vec::new();
        for chunk in paths.chunks(ADDRESS_QUERY_CHUNK) {
            let mut addresses = Vec::with_capacity(chunk.len());
            for path in chunk {
                addresses.push(self.keyring.address_at(*path)?);
            }
            all.extend(self.blockchain.get_unspent(&addresses).await?);
        }

        let reserved = self
            .proposals
            .reserved_outpoints(self.keyring.required(), self.keyring.total());
        let min_confirmations = if self.identity.spend_unconfirmed {
            0
        } else {
            self.config.min_confirmations
        };
        let safe = all
            .iter()
            .filter(|u| !reserved.contains(&u.outpoint()))
            .filter(|u| u.confirmations >= min_confirmations)
            .cloned()
            .collect();
        Ok((safe, all))
    }

    pub async fn get_balance(&mut self) -> Result<Balance, WalletError> {
        let (safe, all) = self.get_unspent().await?;
        let mut balance = Balance {
            safe: safe.iter().map(UnspentOutput::amount_sat).sum(),
            ..Default::default()
        };
        for output in &all {
            let amount = output.amount_sat();
            balance.total += amount;
            *balance.by_address.entry(output.address.clone()).or_default() += amount;
        }
        Ok(balance)
    }

    /// Draft, sign and announce a proposal paying `amount` to `to`
    pub async fn create_tx(
        &mut self,
        to: &str,
        amount: u64,
        comment: Option<String>,
    ) -> Result<String, WalletError> {
        self.create_tx_with_change(to, amount, comment, None).await
    }

    /// Like `create_tx`; change goes to `change` instead of a fresh
    /// address on our change chain
    pub async fn create_tx_with_change(
        &mut self,
        to: &str,
        amount: u64,
        comment: Option<String>,
        change: Option<Address>,
    ) -> Result<String, WalletError> {
        let destination = Address::parse(to)?;
        let networks = std::iter::once(destination.network).chain(change.as_ref().map(|a| a.network));
        for network in networks {
            if network != self.keyring.network() {
                return Err(ConfigurationError::NetworkMismatch {
                    expected: self.keyring.network(),
                    found: network,
                }
                .into());
            }
        }
        if !self.keyring.is_complete() {
            return Err(KeyRingError::Incomplete.into());
        }
        if let Some(comment) = &comment {
            let len = comment.chars().count();
            if len > self.config.max_comment_len {
                return Err(WalletError::CommentTooLong {
                    len,
                    max: self.config.max_comment_len,
                });
            }
        }

        let (safe, _) = self.get_unspent().await?;
        let change_index = self.keyring.index_for(&self.copayer_id, true);
        let ntxid = self.create_tx_sync(to, amount, comment, change.as_ref(), &safe)?;
        let used_change = self.keyring.index_for(&self.copayer_id, true) != change_index;

        let mut dirty = Dirty::PROPOSALS;
        if used_change {
            dirty |= Dirty::KEY_RING;
        }
        self.commit(dirty).await?;
        log::info!("Created proposal {} for {} to {}", ntxid, amount, to);
        self.emit(WalletEvent::TxProposalEvent {
            kind: ProposalEventKind::New,
            ntxid: ntxid.clone(),
            copayer_id: self.copayer_id.clone(),
        });

        if used_change {
            self.send_indexes(Recipients::All).await?;
        }
        self.send_tx_proposal(&ntxid, Recipients::All).await?;
        Ok(ntxid)
    }

    /// Build and sign a proposal from the given outputs
    ///
    /// Nothing is persisted or sent; the change index only advances once
    /// the proposal is in the set, and only when no `change` was given.
    pub fn create_tx_sync(
        &mut self,
        to: &str,
        amount: u64,
        comment: Option<String>,
        change: Option<&Address>,
        unspent: &[UnspentOutput],
    ) -> Result<String, WalletError> {
        let cosigner = self
            .keyring
            .cosigner_index(&self.copayer_id)
            .ok_or_else(|| KeyRingError::UnknownCopayer(self.copayer_id.clone()))?;
        let input_size = self
            .keyring
            .redeem_script_for(&HdPath::new(cosigner, false, 0))?
            .estimated_script_sig_size()
            + INPUT_OVERHEAD;

        let candidates: Vec<Spendable> = unspent
            .iter()
            .map(|u| Spendable {
                outpoint: u.outpoint(),
                address: u.address.clone(),
                amount: u.amount_sat(),
                confirmations: u.confirmations,
            })
            .collect();
        let selection = select_coins(&candidates, amount, self.config.fee_per_kb, input_size)?;

        let mut builder = TxBuilder::new().fee_per_kb(self.config.fee_per_kb);
        let mut paths = Vec::with_capacity(selection.selected.len());
        for coin in selection.selected {
            let path = self
                .keyring
                .path_for_address(&coin.address)?
                .ok_or_else(|| KeyRingError::UnknownAddress(coin.address.clone()))?;
            let script = self.keyring.redeem_script_for(&path)?;
            builder = builder.add_input(TxInput::new(coin.outpoint, coin.amount, coin.address, script));
            paths.push(path);
        }
        builder = builder.add_output(to, amount);

        let change_path = HdPath::new(
            cosigner,
            true,
            self.keyring.index_for(&self.copayer_id, true),
        );
        let derive_change = selection.change > 0 && change.is_none();
        if selection.change > 0 {
            let change_address = match change {
                Some(address) => address.to_string(),
                None => self.keyring.derive_address(&change_path)?,
            };
            builder = builder.change(&change_address, selection.change);
        }
        let tx = builder.build()?;

        let now = Utc::now();
        let keys = self.signer.keys_for_paths(&paths)?;
        let mut proposal = Proposal::new(self.copayer_id.clone(), tx, paths, comment, now);
        if !proposal.sign(&self.copayer_id, &keys, now)? {
            return Err(WalletError::SigningFailed);
        }
        proposal.set_seen(&self.copayer_id, now);
        let ntxid = self.proposals.add(proposal)?;

        if derive_change {
            self.keyring
                .advance_index(&self.copayer_id, true, change_path.index + 1);
        }
        Ok(ntxid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::encode_check;
    use crate::multisig::BuildError;
    use crate::network::Payload;
    use crate::wallet::wallet::tests::{complete_wallets, TestWallet};

    fn utxo(address: &str, txid_byte: &str, amount: f64, confirmations: u32) -> UnspentOutput {
        UnspentOutput {
            address: address.to_string(),
            txid: txid_byte.repeat(32),
            vout: 0,
            amount,
            confirmations,
            script_pub_key: None,
        }
    }

    async fn funded(t: &mut TestWallet, outputs: &[(&str, f64, u32)]) -> String {
        let address = t.wallet.generate_address(false).await.unwrap();
        for (txid, amount, confirmations) in outputs {
            t.chain
                .add_unspent(utxo(&address, txid, *amount, *confirmations))
                .await;
        }
        address
    }

    #[tokio::test]
    async fn test_balance_rounds_per_output() {
        let mut wallets = complete_wallets(2, 3).await;
        let address = funded(
            &mut wallets[0],
            &[("01", 0.0001, 1), ("02", 0.00012345, 1), ("03", 0.0004, 0)],
        )
        .await;

        let balance = wallets[0].wallet.get_balance().await.unwrap();
        assert_eq!(balance.total, 62_345);
        assert_eq!(balance.safe, 22_345);
        assert_eq!(balance.by_address.get(&address), Some(&62_345));
    }

    #[tokio::test]
    async fn test_spend_unconfirmed() {
        let mut wallets = complete_wallets(1, 1).await;
        wallets[0].wallet.identity.spend_unconfirmed = true;
        funded(&mut wallets[0], &[("01", 0.001, 0)]).await;

        let (safe, all) = wallets[0].wallet.get_unspent().await.unwrap();
        assert_eq!(safe.len(), 1);
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_reserved_until_finally_rejected() {
        let mut wallets = complete_wallets(2, 3).await;
        let address = funded(&mut wallets[0], &[("01", 0.01, 6), ("02", 0.002, 6)]).await;

        let ntxid = wallets[0]
            .wallet
            .create_tx(&address, 600_000, Some("pay".to_string()))
            .await
            .unwrap();
        let (safe, all) = wallets[0].wallet.get_unspent().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(safe.len(), 1);
        assert_eq!(safe[0].txid, "02".repeat(32));

        // Two of three rejecting leaves too few signers
        let now = Utc::now();
        let others: Vec<String> = wallets[1..]
            .iter()
            .map(|w| w.wallet.copayer_id().to_string())
            .collect();
        let proposal = wallets[0].wallet.proposals.get_mut(&ntxid).unwrap();
        assert!(proposal.set_rejected(&others[0], now).unwrap());
        let (safe, _) = wallets[0].wallet.get_unspent().await.unwrap();
        assert_eq!(safe.len(), 1);

        let proposal = wallets[0].wallet.proposals.get_mut(&ntxid).unwrap();
        assert!(proposal.set_rejected(&others[1], now).unwrap());
        let (safe, _) = wallets[0].wallet.get_unspent().await.unwrap();
        assert_eq!(safe.len(), 2);
    }

    #[tokio::test]
    async fn test_create_tx() {
        let mut wallets = complete_wallets(2, 3).await;
        let _rx = wallets[0].wallet.start_network().await.unwrap();
        let address = funded(&mut wallets[0], &[("01", 0.01, 6)]).await;
        let to = wallets[1].wallet.generate_address(false).await.unwrap();
        let mut events = wallets[0].wallet.subscribe();

        let ntxid = wallets[0].wallet.create_tx(&to, 400_000, None).await.unwrap();
        let proposal = wallets[0].wallet.proposals().get(&ntxid).unwrap();
        let me = wallets[0].wallet.copayer_id().to_string();
        assert_eq!(proposal.creator, me);
        assert!(proposal.signed_by.contains_key(&me));
        assert!(proposal.seen_by.contains_key(&me));
        assert_eq!(proposal.tx.inputs[0].address, address);
        assert_eq!(proposal.tx.outputs.len(), 2);
        assert_eq!(
            proposal.tx.input_total(),
            400_000 + proposal.tx.outputs[1].amount + proposal.tx.fee()
        );
        assert_eq!(wallets[0].wallet.keyring().index_for(&me, true), 1);

        assert_eq!(events.try_recv().unwrap(), WalletEvent::PublicKeyRingUpdated);
        assert_eq!(events.try_recv().unwrap(), WalletEvent::TxProposalsUpdated);
        let sent = wallets[0].network.sent().await;
        let kinds: Vec<&str> = sent.iter().map(|(_, m)| m.type_name()).collect();
        assert_eq!(&kinds[kinds.len() - 2..], &["indexes", "txProposal"]);
        assert!(matches!(sent.last().unwrap().1.payload, Payload::TxProposal { .. }));
    }

    #[tokio::test]
    async fn test_create_tx_preconditions() {
        let mut wallets = complete_wallets(2, 3).await;
        let address = funded(&mut wallets[0], &[("01", 0.01, 6)]).await;
        let writes = wallets[0].storage.write_count();

        let mut livenet = vec![0x05u8];
        livenet.extend_from_slice(&[7u8; 20]);
        let result = wallets[0]
            .wallet
            .create_tx(&encode_check(&livenet), 100_000, None)
            .await;
        assert!(matches!(
            result,
            Err(WalletError::Configuration(ConfigurationError::NetworkMismatch { .. }))
        ));

        let result = wallets[0]
            .wallet
            .create_tx(&address, 100_000, Some("x".repeat(101)))
            .await;
        assert!(matches!(result, Err(WalletError::CommentTooLong { len: 101, max: 100 })));

        let result = wallets[0].wallet.create_tx(&address, 5_000_000, None).await;
        assert!(matches!(
            result,
            Err(WalletError::Build(BuildError::InsufficientFunds { .. }))
        ));
        assert!(wallets[0].wallet.proposals().is_empty());
        assert_eq!(wallets[0].storage.write_count(), writes);
    }

    #[tokio::test]
    async fn test_unknown_output_address() {
        let mut wallets = complete_wallets(1, 1).await;
        let to = wallets[0].wallet.generate_address(false).await.unwrap();
        let mut foreign = vec![0xc4u8];
        foreign.extend_from_slice(&[9u8; 20]);
        let unspent = [utxo(&encode_check(&foreign), "01", 0.01, 6)];

        let result = wallets[0].wallet.create_tx_sync(&to, 100_000, None, None, &unspent);
        assert!(matches!(
            result,
            Err(WalletError::KeyRing(KeyRingError::UnknownAddress(_)))
        ));
        assert!(wallets[0].wallet.proposals().is_empty());
        let me = wallets[0].wallet.copayer_id().to_string();
        assert_eq!(wallets[0].wallet.keyring().index_for(&me, true), 0);
    }

    #[tokio::test]
    async fn test_create_tx_to_supplied_change() {
        let mut wallets = complete_wallets(2, 3).await;
        funded(&mut wallets[0], &[("01", 0.01, 6)]).await;
        let to = wallets[1].wallet.generate_address(false).await.unwrap();
        let change = wallets[2].wallet.generate_address(false).await.unwrap();
        let me = wallets[0].wallet.copayer_id().to_string();

        let mut livenet = vec![0x05u8];
        livenet.extend_from_slice(&[7u8; 20]);
        let foreign = Address::parse(&encode_check(&livenet)).unwrap();
        let result = wallets[0]
            .wallet
            .create_tx_with_change(&to, 400_000, None, Some(foreign))
            .await;
        assert!(matches!(
            result,
            Err(WalletError::Configuration(ConfigurationError::NetworkMismatch { .. }))
        ));

        let ntxid = wallets[0]
            .wallet
            .create_tx_with_change(&to, 400_000, None, Some(Address::parse(&change).unwrap()))
            .await
            .unwrap();
        let proposal = wallets[0].wallet.proposals().get(&ntxid).unwrap();
        assert_eq!(proposal.tx.outputs.len(), 2);
        assert_eq!(proposal.tx.outputs[1].address, change);
        assert_eq!(wallets[0].wallet.keyring().index_for(&me, true), 0);
    }

    #[tokio::test]
    async fn test_create_tx_amount_overflow() {
        let mut wallets = complete_wallets(2, 3).await;
        let address = funded(&mut wallets[0], &[("01", 0.01, 6)]).await;
        let writes = wallets[0].storage.write_count();

        let result = wallets[0].wallet.create_tx(&address, u64::MAX - 10, None).await;
        assert!(matches!(
            result,
            Err(WalletError::Build(BuildError::AmountTooLarge(_)))
        ));
        assert!(wallets[0].wallet.proposals().is_empty());
        assert_eq!(wallets[0].storage.write_count(), writes);
    }
}
