// Copyright (C) 2026 BiscaArena
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Outbound calls to the platform REST API. The engine consumes identity and
//! pushes final results; accounts, coin ledger and leaderboards live over
//! there.

use anyhow::Context;
use async_trait::async_trait;
use bisca_common::PlayerId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedIdentity {
    pub user_id: PlayerId,
    pub name: String,
    pub balance: i64,
}

/// Resolves an opaque client token to a platform identity.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> anyhow::Result<VerifiedIdentity>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatResult {
    pub player_id: PlayerId,
    pub name: String,
    pub is_bot: bool,
    pub score: u32,
    pub marks: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchReport {
    pub match_id: String,
    pub game_id: String,
    pub winner: Option<PlayerId>,
    pub forfeit: bool,
    pub games_played: u32,
    pub seats: Vec<SeatResult>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceChange {
    pub user_id: PlayerId,
    pub balance: i64,
}

/// Records a decided match against the platform, returning the settled coin
/// balances for the human participants.
#[async_trait]
pub trait MatchRecorder: Send + Sync {
    async fn record_match(&self, report: &MatchReport) -> anyhow::Result<Vec<BalanceChange>>;
}

#[derive(Debug, Deserialize)]
struct SettlementResponse {
    balances: Vec<BalanceChange>,
}

/// reqwest-backed client for both collaborator calls.
pub struct HttpPlatformClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPlatformClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpPlatformClient {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl IdentityVerifier for HttpPlatformClient {
    async fn verify(&self, token: &str) -> anyhow::Result<VerifiedIdentity> {
        let url = self.endpoint("internal/auth/verify");
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
            .context("failed to call the identity endpoint")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<response body unavailable>".to_string());
            anyhow::bail!("identity endpoint returned {status}: {body}");
        }

        response
            .json::<VerifiedIdentity>()
            .await
            .context("failed to decode identity response")
    }
}

#[async_trait]
impl MatchRecorder for HttpPlatformClient {
    async fn record_match(&self, report: &MatchReport) -> anyhow::Result<Vec<BalanceChange>> {
        let url = self.endpoint(&format!("internal/matches/{}/result", report.match_id));
        let response = self
            .client
            .post(url)
            .json(report)
            .send()
            .await
            .context("failed to call the match result endpoint")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<response body unavailable>".to_string());
            anyhow::bail!("match result endpoint returned {status}: {body}");
        }

        let settlement = response
            .json::<SettlementResponse>()
            .await
            .context("failed to decode settlement response")?;
        Ok(settlement.balances)
    }
}
