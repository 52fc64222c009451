//! Insight API client

use crate::blockchain::{Blockchain, ChainError, UnspentOutput};
use crate::multisig::PartialTx;
use async_trait::async_trait;
use futures::future::try_join_all;
use log::{debug, warn};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Timeout for service requests
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct SendResponse {
    txid: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddressSummary {
    #[serde(default, rename = "txApperances")]
    tx_appearances: u64,
    #[serde(default, rename = "unconfirmedTxApperances")]
    unconfirmed_tx_appearances: u64,
}

/// Client for an Insight blockchain explorer
#[derive(Debug, Clone)]
pub struct InsightClient {
    client: reqwest::Client,
    base_url: String,
}

impl InsightClient {
    pub fn new(base_url: &str) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn address_active(&self, address: &str) -> Result<bool, ChainError> {
        let response = self
            .client
            .get(self.url(&format!("/api/addr/{}?noTxList=1", address)))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ChainError::Status(response.status().as_u16()));
        }
        let summary: AddressSummary = response.json().await?;
        Ok(summary.tx_appearances + summary.unconfirmed_tx_appearances > 0)
    }
}

#[async_trait]
impl Blockchain for InsightClient {
    async fn get_unspent(&self, addresses: &[String]) -> Result<Vec<UnspentOutput>, ChainError> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(self.url("/api/addrs/utxo"))
            .json(&json!({ "addrs": addresses.join(",") }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ChainError::Status(response.status().as_u16()));
        }

        let unspent: Vec<UnspentOutput> = response.json().await?;
        debug!("{} unspent outputs for {} addresses", unspent.len(), addresses.len());
        Ok(unspent)
    }

    async fn check_accepted(&self, tx: &PartialTx) -> Result<Option<String>, ChainError> {
        let txid = tx.txid()?;
        let response = self
            .client
            .get(self.url(&format!("/api/tx/{}", txid)))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(txid)),
            status => Err(ChainError::Status(status.as_u16())),
        }
    }

    async fn broadcast(&self, raw_tx: &str) -> Result<Option<String>, ChainError> {
        let response = self
            .client
            .post(self.url("/api/tx/send"))
            .json(&json!({ "rawtx": raw_tx }))
            .send()
            .await?;

        if response.status().is_client_error() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("Broadcast rejected ({}): {}", status, body);
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ChainError::Status(response.status().as_u16()));
        }

        let sent: SendResponse = response
            .json()
            .await
            .map_err(|e| ChainError::InvalidResponse(e.to_string()))?;
        Ok(Some(sent.txid))
    }

    async fn check_activity(&self, addresses: &[String]) -> Result<Vec<bool>, ChainError> {
        try_join_all(addresses.iter().map(|a| self.address_active(a))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalized() {
        let client = InsightClient::new("https://insight.example.org/").unwrap();
        assert_eq!(
            client.url("/api/tx/send"),
            "https://insight.example.org/api/tx/send"
        );
    }

    #[test]
    fn test_address_summary_format() {
        let summary: AddressSummary =
            serde_json::from_str(r#"{"addrStr":"2N","txApperances":2,"unconfirmedTxApperances":0}"#)
                .unwrap();
        assert_eq!(summary.tx_appearances, 2);

        let empty: AddressSummary = serde_json::from_str(r#"{"addrStr":"2N"}"#).unwrap();
        assert_eq!(empty.tx_appearances + empty.unconfirmed_tx_appearances, 0);
    }
}
