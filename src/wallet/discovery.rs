//! Address discovery
//!
//! Finds how far each copayer's branches have been used on chain by
//! scanning windows of derived addresses, keeping a trailing gap of unused
//! addresses behind the last active one.

use crate::multisig::{HdPath, KeyRingError, MAX_BRANCH_INDEX};
use crate::network::Recipients;
use crate::wallet::error::WalletError;
use crate::wallet::events::Dirty;
use crate::wallet::wallet::Wallet;
use futures::{stream, StreamExt, TryStreamExt};

impl Wallet {
    /// Last index with on-chain activity on one branch, or -1
    ///
    /// Scanning starts at `start` with a window of `gap` addresses. After
    /// an active window the next one is sized so that exactly `gap`
    /// addresses past the last active index get checked. Nothing at or
    /// past `MAX_BRANCH_INDEX` is scanned.
    pub async fn index_discovery(
        &self,
        start: u32,
        change: bool,
        cosigner: u32,
        gap: u32,
    ) -> Result<i64, WalletError> {
        let mut last_active = None;
        let mut scan = start.min(MAX_BRANCH_INDEX);
        let mut window = gap;

        loop {
            let end = scan.saturating_add(window).min(MAX_BRANCH_INDEX);
            if end <= scan {
                break;
            }
            let indexes: Vec<u32> = (scan..end).collect();
            let mut addresses = Vec::with_capacity(indexes.len());
            for index in &indexes {
                let path = HdPath::new(cosigner, change, *index);
                addresses.push(self.keyring.derive_address(&path)?);
            }

            let activity = self.blockchain.check_activity(&addresses).await?;
            let Some(offset) = activity.iter().rposition(|active| *active) else {
                break;
            };
            let Some(&active) = indexes.get(offset) else {
                break;
            };
            last_active = Some(active);
            scan = end;
            window = active.saturating_add(gap).saturating_add(1).saturating_sub(scan);
        }
        Ok(last_active.map_or(-1, i64::from))
    }

    /// Advance every branch index to just past its last active address
    ///
    /// All branches are scanned concurrently; any failure leaves every
    /// index where it was. Returns whether anything advanced.
    pub async fn update_indexes(&mut self) -> Result<bool, WalletError> {
        if !self.keyring.is_complete() {
            return Err(KeyRingError::Incomplete.into());
        }
        let gap = self.config.scan_window;
        let concurrency = self.config.discovery_concurrency.max(1);

        let mut branches = Vec::new();
        for copayer_id in self.keyring.copayer_ids() {
            let cosigner = self
                .keyring
                .cosigner_index(&copayer_id)
                .ok_or_else(|| KeyRingError::UnknownCopayer(copayer_id.clone()))?;
            for change in [false, true] {
                let start = self.keyring.index_for(&copayer_id, change);
                branches.push((copayer_id.clone(), cosigner, change, start));
            }
        }

        let this = &*self;
        let found: Vec<(String, bool, i64)> = stream::iter(branches)
            .map(|(copayer_id, cosigner, change, start)| async move {
                let last = this.index_discovery(start, change, cosigner, gap).await?;
                Ok::<_, WalletError>((copayer_id, change, last))
            })
            .buffer_unordered(concurrency)
            .try_collect()
            .await?;

        let mut changed = false;
        for (copayer_id, change, last) in found {
            if let Ok(last) = u32::try_from(last) {
                changed |= self
                    .keyring
                    .advance_index(&copayer_id, change, last.saturating_add(1));
            }
        }
        if changed {
            log::info!("Discovered used addresses in wallet {}", self.identity.id);
            self.commit(Dirty::KEY_RING).await?;
            self.send_indexes(Recipients::All).await?;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::wallet::tests::complete_wallets;

    #[tokio::test]
    async fn test_trailing_gap() {
        let wallets = complete_wallets(1, 1).await;
        let t = &wallets[0];
        for index in [5, 17] {
            let address = t
                .wallet
                .keyring()
                .derive_address(&HdPath::new(0, false, index))
                .unwrap();
            t.chain.mark_active(&address).await;
        }

        let last = t.wallet.index_discovery(0, false, 0, 20).await.unwrap();
        assert_eq!(last, 17);
        assert_eq!(t.chain.activity_query_count().await, 2);

        assert_eq!(t.wallet.index_discovery(0, true, 0, 20).await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_scan_stops_at_index_limit() {
        let wallets = complete_wallets(1, 1).await;
        let t = &wallets[0];
        let address = t
            .wallet
            .keyring()
            .derive_address(&HdPath::new(0, false, MAX_BRANCH_INDEX - 1))
            .unwrap();
        t.chain.mark_active(&address).await;

        let last = t
            .wallet
            .index_discovery(MAX_BRANCH_INDEX - 5, false, 0, 20)
            .await
            .unwrap();
        assert_eq!(last, i64::from(MAX_BRANCH_INDEX - 1));
        assert_eq!(t.chain.activity_query_count().await, 1);

        assert_eq!(
            t.wallet.index_discovery(u32::MAX, false, 0, u32::MAX).await.unwrap(),
            -1
        );
        assert_eq!(t.chain.activity_query_count().await, 1);
    }

    #[tokio::test]
    async fn test_update_indexes() {
        let mut wallets = complete_wallets(2, 2).await;
        let bob = wallets[1].wallet.copayer_id().to_string();
        let cosigner = wallets[0].wallet.keyring().cosigner_index(&bob).unwrap();
        let address = wallets[0]
            .wallet
            .keyring()
            .derive_address(&HdPath::new(cosigner, true, 3))
            .unwrap();
        wallets[0].chain.mark_active(&address).await;

        assert!(wallets[0].wallet.update_indexes().await.unwrap());
        assert_eq!(wallets[0].wallet.keyring().index_for(&bob, true), 4);
        assert_eq!(wallets[0].wallet.keyring().index_for(&bob, false), 0);

        // Nothing new the second time
        assert!(!wallets[0].wallet.update_indexes().await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_scan_changes_nothing() {
        let mut wallets = complete_wallets(2, 2).await;
        let alice = wallets[0].wallet.copayer_id().to_string();
        let cosigner = wallets[0].wallet.keyring().cosigner_index(&alice).unwrap();
        let address = wallets[0]
            .wallet
            .keyring()
            .derive_address(&HdPath::new(cosigner, false, 1))
            .unwrap();
        wallets[0].chain.mark_active(&address).await;
        wallets[0].chain.set_offline(true).await;
        let writes = wallets[0].storage.write_count();

        assert!(wallets[0].wallet.update_indexes().await.is_err());
        assert_eq!(wallets[0].wallet.keyring().index_for(&alice, false), 0);
        assert_eq!(wallets[0].storage.write_count(), writes);
    }

    #[tokio::test]
    async fn test_incomplete_ring() {
        let mut wallets = complete_wallets(1, 1).await;
        wallets[0].wallet.keyring = crate::multisig::KeyRing::new(
            wallets[0].wallet.network_kind(),
            1,
            2,
        )
        .unwrap();
        assert!(matches!(
            wallets[0].wallet.update_indexes().await,
            Err(WalletError::KeyRing(KeyRingError::Incomplete))
        ));
    }
}
