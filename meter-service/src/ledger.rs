//! External ledger the settlement flow mints and burns energy tokens on.

use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("ledger transport error: {0}")]
    Transport(String),
    #[error("ledger rejected call: {0}")]
    Rejected(String),
    #[error("invalid ledger response: {0}")]
    InvalidResponse(String),
    #[error("ledger call timed out after {0:?}")]
    Timeout(Duration),
}

/// Outcome of a previously submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxReceipt {
    Confirmed,
    Reverted,
    Unknown,
}

#[async_trait::async_trait]
pub trait LedgerClient: Send + Sync {
    async fn get_token_balance(&self, address: &str, token_address: &str) -> Result<f64, LedgerError>;

    async fn get_min_settlement_wh(&self) -> Result<f64, LedgerError>;

    /// Token units for `wh` watt-hours at the current conversion rate.
    async fn calculate_etk_amount(&self, wh: f64) -> Result<f64, LedgerError>;

    async fn is_meter_authorized(&self, address: &str) -> Result<bool, LedgerError>;

    async fn is_meter_id_authorized(&self, meter_id: &str) -> Result<bool, LedgerError>;

    async fn authorize_meter(&self, owner: &str, meter_id: &str, meter_address: &str) -> Result<String, LedgerError>;

    /// Mint (positive `net_wh`) or burn (negative) and return the transaction hash.
    async fn process_energy_settlement(
        &self,
        owner: &str,
        meter_id: &str,
        user_address: &str,
        net_wh: i64,
        settlement_id: &str,
    ) -> Result<String, LedgerError>;

    async fn transaction_receipt(&self, tx_hash: &str) -> Result<TxReceipt, LedgerError>;
}

/// Token amount for `wh` whose sign always follows `wh`.
///
/// The rate function is applied to the magnitude so a ledger that only handles
/// non-negative input cannot flip the economic direction of a settlement.
pub async fn signed_etk_amount(ledger: &dyn LedgerClient, wh: f64) -> Result<f64, LedgerError> {
    if wh == 0.0 {
        return Ok(0.0);
    }
    let magnitude = ledger.calculate_etk_amount(wh.abs()).await?.abs();
    Ok(magnitude.copysign(wh))
}

/// JSON-RPC client for the ledger gateway.
#[derive(Clone)]
pub struct HttpLedgerClient {
    http: reqwest::Client,
    rpc_url: String,
}

impl HttpLedgerClient {
    pub fn new(rpc_url: impl Into<String>, timeout: Duration) -> Result<Self, LedgerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| LedgerError::Transport(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            rpc_url: rpc_url.into(),
        })
    }

    async fn rpc_call<T: DeserializeOwned>(&self, method: &str, params: serde_json::Value) -> Result<T, LedgerError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let started = std::time::Instant::now();
        let response = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LedgerError::Transport(format!("{method}: request failed: {e}")))?;
        metrics::histogram!("ledger_rpc_latency_seconds", "method" => method.to_string())
            .record(started.elapsed().as_secs_f64());

        if !response.status().is_success() {
            return Err(LedgerError::Transport(format!(
                "{method}: gateway returned HTTP {}",
                response.status()
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LedgerError::InvalidResponse(format!("{method}: {e}")))?;

        if let Some(err) = json.get("error").filter(|e| !e.is_null()) {
            let msg = err
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            return Err(LedgerError::Rejected(format!("{method}: {msg}")));
        }

        let result = json
            .get("result")
            .cloned()
            .ok_or_else(|| LedgerError::InvalidResponse(format!("{method}: missing result")))?;
        serde_json::from_value(result).map_err(|e| LedgerError::InvalidResponse(format!("{method}: {e}")))
    }
}

#[async_trait::async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn get_token_balance(&self, address: &str, token_address: &str) -> Result<f64, LedgerError> {
        self.rpc_call(
            "getTokenBalance",
            serde_json::json!({ "address": address, "tokenAddress": token_address }),
        )
        .await
    }

    async fn get_min_settlement_wh(&self) -> Result<f64, LedgerError> {
        self.rpc_call("getMinSettlementWh", serde_json::json!({})).await
    }

    async fn calculate_etk_amount(&self, wh: f64) -> Result<f64, LedgerError> {
        self.rpc_call("calculateEtkAmount", serde_json::json!({ "wh": wh })).await
    }

    async fn is_meter_authorized(&self, address: &str) -> Result<bool, LedgerError> {
        self.rpc_call("isMeterAuthorized", serde_json::json!({ "address": address }))
            .await
    }

    async fn is_meter_id_authorized(&self, meter_id: &str) -> Result<bool, LedgerError> {
        self.rpc_call("isMeterIdAuthorized", serde_json::json!({ "meterId": meter_id }))
            .await
    }

    async fn authorize_meter(&self, owner: &str, meter_id: &str, meter_address: &str) -> Result<String, LedgerError> {
        self.rpc_call(
            "authorizeMeter",
            serde_json::json!({ "owner": owner, "meterId": meter_id, "meterAddress": meter_address }),
        )
        .await
    }

    async fn process_energy_settlement(
        &self,
        owner: &str,
        meter_id: &str,
        user_address: &str,
        net_wh: i64,
        settlement_id: &str,
    ) -> Result<String, LedgerError> {
        self.rpc_call(
            "processEnergySettlement",
            serde_json::json!({
                "owner": owner,
                "meterId": meter_id,
                "userAddress": user_address,
                "netWh": net_wh,
                "settlementId": settlement_id,
            }),
        )
        .await
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> Result<TxReceipt, LedgerError> {
        self.rpc_call("getTransactionReceipt", serde_json::json!({ "txHash": tx_hash }))
            .await
    }
}
