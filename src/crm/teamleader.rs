//! Teamleader Focus deals API client.
//!
//! Every endpoint is an RPC-style `POST /<resource>.<action>` with a JSON
//! body. A 401 rotates the OAuth tokens once and is then reported as
//! [`CrmError::Unauthorized`]; the request itself is not replayed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::crm::{CrmApi, DealUpdate};
use crate::error::CrmError;
use crate::oauth::CrmOAuth;
use crate::pipeline::deal::{CompanyRef, CustomFieldValue, Deal, NewDeal};

// --- Wire types ---

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireRef {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireLead {
    customer: WireRef,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMoney {
    #[serde(with = "rust_decimal::serde::float")]
    amount: Decimal,
    #[serde(default)]
    currency: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireFieldDefinition {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireCustomField {
    definition: WireFieldDefinition,
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WireDeal {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    lead: Option<WireLead>,
    #[serde(default)]
    estimated_value: Option<WireMoney>,
    #[serde(default)]
    estimated_probability: Option<f64>,
    #[serde(default)]
    estimated_closing_date: Option<String>,
    #[serde(default)]
    current_phase: Option<WireRef>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    custom_fields: Vec<WireCustomField>,
}

impl From<WireDeal> for Deal {
    fn from(wire: WireDeal) -> Self {
        let estimated_closing_date = wire
            .estimated_closing_date
            .as_deref()
            .and_then(|raw| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok());
        let created_at = wire
            .created_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let (estimated_value, currency) = match wire.estimated_value {
            Some(money) => (Some(money.amount), money.currency),
            None => (None, None),
        };
        Deal {
            id: wire.id,
            title: wire.title,
            company: wire.lead.map(|lead| CompanyRef {
                kind: lead.customer.kind,
                id: lead.customer.id,
                name: lead.customer.name,
            }),
            created_at,
            estimated_closing_date,
            phase_id: wire.current_phase.map(|p| p.id),
            estimated_probability: wire.estimated_probability,
            estimated_value,
            currency,
            custom_fields: wire
                .custom_fields
                .into_iter()
                .map(|f| CustomFieldValue {
                    id: f.definition.id,
                    value: f.value,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreatedRef {
    id: String,
}

fn new_deal_body(deal: &NewDeal) -> serde_json::Value {
    let mut body = json!({
        "title": deal.title,
        "phase_id": deal.phase_id,
        "custom_fields": deal
            .custom_fields
            .iter()
            .map(|f| json!({ "id": f.id, "value": f.value }))
            .collect::<Vec<_>>(),
    });
    if let Some(company) = &deal.company {
        body["lead"] = json!({ "customer": { "type": company.kind, "id": company.id } });
    }
    if let Some(date) = deal.estimated_closing_date {
        body["estimated_closing_date"] = json!(date.format("%Y-%m-%d").to_string());
    }
    if let Some(probability) = deal.estimated_probability {
        body["estimated_probability"] = json!(probability);
    }
    if let Some(amount) = deal.estimated_value {
        body["estimated_value"] = json!(WireMoney {
            amount,
            currency: deal.currency.clone(),
        });
    }
    body
}

pub struct TeamleaderClient {
    http: reqwest::Client,
    api_url: String,
    oauth: Arc<CrmOAuth>,
    page_size: u32,
}

impl TeamleaderClient {
    pub fn new(api_url: &str, oauth: Arc<CrmOAuth>, page_size: u32) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            oauth,
            page_size: page_size.max(1),
        }
    }

    async fn call(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, CrmError> {
        let token = self.oauth.access_token().await?;
        let url = format!("{}/{}", self.api_url, endpoint);
        let response = self
            .http
            .post(&url)
            .bearer_auth(token.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| CrmError::Network {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            tracing::info!("CRM rejected the access token on {}, rotating", endpoint);
            self.oauth.refresh().await?;
            return Err(CrmError::Unauthorized(format!(
                "{endpoint} rejected the access token; session refreshed, retry the action"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("CRM call {} failed with {}: {}", endpoint, status, body);
            return Err(CrmError::Api {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn call_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<T, CrmError> {
        self.call(endpoint, body)
            .await?
            .json::<T>()
            .await
            .map_err(|e| CrmError::Parse {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl CrmApi for TeamleaderClient {
    async fn deals_list(&self) -> Result<Vec<Deal>, CrmError> {
        let mut deals = Vec::new();
        let mut page = 1u32;
        loop {
            let body = json!({ "page": { "size": self.page_size, "number": page } });
            let batch: DataEnvelope<Vec<WireDeal>> = self.call_json("deals.list", &body).await?;
            let count = batch.data.len();
            deals.extend(batch.data.into_iter().map(Deal::from));
            if count < self.page_size as usize {
                break;
            }
            page += 1;
        }
        tracing::debug!("Fetched {} deals from the CRM", deals.len());
        Ok(deals)
    }

    async fn deals_info(&self, id: &str) -> Result<Deal, CrmError> {
        let envelope: DataEnvelope<WireDeal> =
            self.call_json("deals.info", &json!({ "id": id })).await?;
        Ok(envelope.data.into())
    }

    async fn deals_update(&self, update: &DealUpdate) -> Result<(), CrmError> {
        let body = json!({
            "id": update.id,
            "custom_fields": update
                .custom_fields
                .iter()
                .map(|f| json!({ "id": f.id, "value": f.value }))
                .collect::<Vec<_>>(),
        });
        self.call("deals.update", &body).await.map(|_| ())
    }

    async fn deals_create(&self, deal: &NewDeal) -> Result<String, CrmError> {
        let envelope: DataEnvelope<CreatedRef> =
            self.call_json("deals.create", &new_deal_body(deal)).await?;
        tracing::info!("Created CRM deal {}", envelope.data.id);
        Ok(envelope.data.id)
    }

    async fn deals_move(&self, id: &str, phase_id: &str) -> Result<(), CrmError> {
        self.call("deals.move", &json!({ "id": id, "phase_id": phase_id }))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrmConfig;
    use crate::oauth::{TokenSet, TokenStore};
    use crate::pipeline::phase::PhaseMap;
    use chrono::Duration;
    use mockito::Matcher;
    use secrecy::SecretString;

    fn client_for(server: &mockito::ServerGuard, page_size: u32) -> TeamleaderClient {
        let config = CrmConfig {
            api_url: server.url(),
            auth_url: server.url(),
            client_id: "client".to_string(),
            client_secret: SecretString::from("secret".to_string()),
            redirect_uri: "http://localhost/cb".to_string(),
            grouping_field_id: "ref".to_string(),
            assignee_field_id: "assignee".to_string(),
            phases: PhaseMap::default(),
            page_size,
        };
        let tokens = Arc::new(TokenStore::with_tokens(TokenSet {
            access_token: SecretString::from("access".to_string()),
            refresh_token: SecretString::from("refresh".to_string()),
            expires_at: Utc::now() + Duration::hours(1),
        }));
        let oauth = Arc::new(CrmOAuth::new(&config, tokens));
        TeamleaderClient::new(&server.url(), oauth, page_size)
    }

    const DEAL_JSON: &str = r#"{
        "id": "d1",
        "title": "Java developer (Alice)",
        "lead": {"customer": {"type": "company", "id": "c1", "name": "Acme"}},
        "estimated_value": {"amount": 1200.5, "currency": "EUR"},
        "estimated_probability": 0.25,
        "estimated_closing_date": "2026-11-30",
        "current_phase": {"type": "dealPhase", "id": "ph-opp"},
        "created_at": "2026-10-01T09:30:00+00:00",
        "custom_fields": [
            {"definition": {"type": "customFieldDefinition", "id": "ref"}, "value": "R-1"}
        ]
    }"#;

    #[tokio::test]
    async fn deals_list_follows_pages_and_maps_fields() {
        let mut server = mockito::Server::new_async().await;
        let page1 = server
            .mock("POST", "/deals.list")
            .match_header("authorization", "Bearer access")
            .match_body(Matcher::PartialJson(json!({"page": {"number": 1}})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(r#"{{"data": [{DEAL_JSON}]}}"#))
            .create_async()
            .await;
        let page2 = server
            .mock("POST", "/deals.list")
            .match_body(Matcher::PartialJson(json!({"page": {"number": 2}})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data": []}"#)
            .create_async()
            .await;

        let deals = client_for(&server, 1).deals_list().await.expect("deals");
        page1.assert_async().await;
        page2.assert_async().await;

        assert_eq!(deals.len(), 1);
        let deal = &deals[0];
        assert_eq!(deal.company_label(), Some("Acme"));
        assert_eq!(deal.phase_id.as_deref(), Some("ph-opp"));
        assert_eq!(deal.closing_date_label(), "2026-11-30");
        assert_eq!(deal.custom_field_text("ref").as_deref(), Some("R-1"));
        assert_eq!(deal.estimated_value, Some(Decimal::new(12005, 1)));
        assert!(deal.created_at.is_some());
    }

    #[tokio::test]
    async fn deals_info_reads_one_deal() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/deals.info")
            .match_body(Matcher::Json(json!({"id": "d1"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(r#"{{"data": {DEAL_JSON}}}"#))
            .create_async()
            .await;

        let deal = client_for(&server, 100).deals_info("d1").await.expect("deal");
        mock.assert_async().await;
        assert_eq!(deal.id, "d1");
        assert_eq!(deal.title, "Java developer (Alice)");
        assert_eq!(deal.custom_field_text("ref").as_deref(), Some("R-1"));
    }

    #[tokio::test]
    async fn deals_create_sends_clone_and_returns_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/deals.create")
            .match_body(Matcher::PartialJson(json!({
                "title": "Java developer (Bob)",
                "phase_id": "ph-prop",
                "lead": {"customer": {"type": "company", "id": "c1"}},
                "custom_fields": [{"id": "ref", "value": "R-1"}, {"id": "assignee", "value": "bob@corp.test"}]
            })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data": {"type": "deal", "id": "d-new"}}"#)
            .create_async()
            .await;

        let template: Deal = serde_json::from_str::<WireDeal>(DEAL_JSON)
            .expect("wire deal")
            .into();
        let new = NewDeal::cloned_from(&template, "ph-prop", "assignee", "bob@corp.test", "Bob");
        let id = client_for(&server, 100)
            .deals_create(&new)
            .await
            .expect("created");
        assert_eq!(id, "d-new");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unauthorized_rotates_tokens_and_reports_auth_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/deals.move")
            .with_status(401)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/oauth2/access_token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"a2","refresh_token":"r2","expires_in":3600}"#)
            .create_async()
            .await;

        let err = client_for(&server, 100)
            .deals_move("d1", "ph-prop")
            .await
            .expect_err("401");
        assert!(matches!(err, CrmError::Unauthorized(_)));
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn server_error_is_an_api_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/deals.update")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let err = client_for(&server, 100)
            .deals_update(&DealUpdate {
                id: "d1".to_string(),
                custom_fields: Vec::new(),
            })
            .await
            .expect_err("500");
        assert!(matches!(err, CrmError::Api { status: 500, .. }));
    }
}
