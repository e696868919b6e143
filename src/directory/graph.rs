use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use crate::config::DirectoryConfig;
use crate::directory::DirectoryApi;
use crate::error::DirectoryError;
use crate::pipeline::employee::DirectoryEntry;

/// Graph caps JSON batches at 20 requests.
const BATCH_LIMIT: usize = 20;
const NAME_FIELD: &str = "Title";
const EMAIL_FIELD: &str = "Email";

#[derive(Debug, Deserialize)]
struct ListItemsPage {
    #[serde(default)]
    value: Vec<ListItem>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListItem {
    id: String,
    #[serde(default)]
    fields: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    responses: Vec<BatchItem>,
}

#[derive(Debug, Deserialize)]
struct BatchItem {
    id: String,
    status: u16,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<serde_json::Value>,
}

fn item_to_entry(item: ListItem) -> Option<DirectoryEntry> {
    let text = |v: &serde_json::Value| match v {
        serde_json::Value::String(s) => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    };
    let name = item.fields.get(NAME_FIELD).and_then(text)?;
    let email = item.fields.get(EMAIL_FIELD).and_then(text).unwrap_or_default();
    let fields: BTreeMap<String, String> = item
        .fields
        .iter()
        .filter(|(k, _)| !k.starts_with('@') && k.as_str() != NAME_FIELD && k.as_str() != EMAIL_FIELD)
        .filter_map(|(k, v)| text(v).filter(|s| !s.is_empty()).map(|s| (k.to_ascii_lowercase(), s)))
        .collect();
    Some(DirectoryEntry {
        id: item.id,
        name,
        email,
        fields,
        photo: None,
    })
}

pub struct GraphClient {
    http: reqwest::Client,
    base_url: String,
    site_id: String,
    list_id: String,
    access_token: SecretString,
    status_filter: Option<String>,
}

impl GraphClient {
    pub fn new(config: &DirectoryConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.api_url.trim_end_matches('/').to_string(),
            site_id: config.site_id.clone(),
            list_id: config.list_id.clone(),
            access_token: config.access_token.clone(),
            status_filter: config.status_filter.clone(),
        }
    }

    fn items_url(&self) -> String {
        let mut url = format!(
            "{}/sites/{}/lists/{}/items?$expand=fields",
            self.base_url, self.site_id, self.list_id
        );
        if let Some(status) = self.status_filter.as_deref() {
            let filter = format!("fields/Status eq '{}'", status.replace('\'', "''"));
            url.push_str("&$filter=");
            url.push_str(&urlencoding::encode(&filter));
        }
        url
    }

    async fn get_page(&self, url: &str) -> Result<ListItemsPage, DirectoryError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(self.access_token.expose_secret())
            .header("Prefer", "HonorNonIndexedQueriesWarningMayFailRandomly")
            .send()
            .await
            .map_err(|e| DirectoryError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DirectoryError::Api {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        response
            .json()
            .await
            .map_err(|e| DirectoryError::Parse(e.to_string()))
    }

    async fn photo_batch(
        &self,
        chunk: &[DirectoryEntry],
    ) -> Result<HashMap<String, String>, DirectoryError> {
        let requests: Vec<serde_json::Value> = chunk
            .iter()
            .enumerate()
            .map(|(i, e)| {
                json!({
                    "id": i.to_string(),
                    "method": "GET",
                    "url": format!("/users/{}/photos/48x48/$value", urlencoding::encode(&e.email)),
                })
            })
            .collect();

        let response = self
            .http
            .post(format!("{}/$batch", self.base_url))
            .bearer_auth(self.access_token.expose_secret())
            .json(&json!({ "requests": requests }))
            .send()
            .await
            .map_err(|e| DirectoryError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DirectoryError::Api {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let batch: BatchResponse = response
            .json()
            .await
            .map_err(|e| DirectoryError::Parse(e.to_string()))?;

        let mut photos = HashMap::new();
        for item in batch.responses {
            if item.status != 200 {
                continue;
            }
            let Some(entry) = item.id.parse::<usize>().ok().and_then(|i| chunk.get(i)) else {
                continue;
            };
            let Some(serde_json::Value::String(body)) = item.body else {
                continue;
            };
            let content_type = item
                .headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
                .map(|(_, v)| v.as_str())
                .unwrap_or("image/jpeg");
            photos.insert(
                entry.id.clone(),
                format!("data:{content_type};base64,{body}"),
            );
        }
        Ok(photos)
    }
}

#[async_trait]
impl DirectoryApi for GraphClient {
    async fn list_employees(&self) -> Result<Vec<DirectoryEntry>, DirectoryError> {
        let mut entries = Vec::new();
        let mut next = Some(self.items_url());
        while let Some(url) = next {
            let page = self.get_page(&url).await?;
            entries.extend(page.value.into_iter().filter_map(item_to_entry));
            next = page.next_link;
        }
        tracing::debug!("Fetched {} directory entries", entries.len());
        Ok(entries)
    }

    async fn fetch_photos(
        &self,
        employees: &[DirectoryEntry],
    ) -> Result<HashMap<String, String>, DirectoryError> {
        let with_email: Vec<DirectoryEntry> = employees
            .iter()
            .filter(|e| !e.email.is_empty())
            .cloned()
            .collect();
        let batches = with_email
            .chunks(BATCH_LIMIT)
            .map(|chunk| self.photo_batch(chunk));
        let mut photos = HashMap::new();
        for result in futures::future::join_all(batches).await {
            match result {
                Ok(found) => photos.extend(found),
                Err(e) => tracing::warn!("Photo batch failed, leaving avatars empty: {}", e),
            }
        }
        Ok(photos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client(server: &mockito::ServerGuard, status_filter: Option<&str>) -> GraphClient {
        GraphClient::new(&DirectoryConfig {
            api_url: server.url(),
            site_id: "site".to_string(),
            list_id: "list".to_string(),
            access_token: SecretString::from("graph-token".to_string()),
            status_filter: status_filter.map(str::to_string),
        })
    }

    #[tokio::test]
    async fn list_employees_follows_next_link_and_maps_fields() {
        let mut server = mockito::Server::new_async().await;
        let next = format!("{}/page2", server.url());
        let first = server
            .mock("GET", "/sites/site/lists/list/items")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("$expand".into(), "fields".into()),
                Matcher::UrlEncoded("$filter".into(), "fields/Status eq 'Active'".into()),
            ]))
            .match_header("authorization", "Bearer graph-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "value": [
                        {"id": "1", "fields": {"@odata.etag": "x", "Title": "Ann", "Email": "ann@corp.test", "City": "Ghent", "Status": "Active"}},
                        {"id": "2", "fields": {"Email": "nameless@corp.test"}}
                    ],
                    "@odata.nextLink": next,
                })
                .to_string(),
            )
            .create_async()
            .await;
        let second = server
            .mock("GET", "/page2")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"value": [{"id": "3", "fields": {"Title": "Bo"}}]}"#)
            .create_async()
            .await;

        let entries = client(&server, Some("Active"))
            .list_employees()
            .await
            .expect("entries");
        first.assert_async().await;
        second.assert_async().await;

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "Ann");
        assert_eq!(entries[0].fields.get("city").map(String::as_str), Some("Ghent"));
        assert!(!entries[0].fields.contains_key("@odata.etag"));
        assert_eq!(entries[1].email, "");
    }

    #[tokio::test]
    async fn photos_come_back_as_data_uris_and_failures_are_skipped() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/$batch")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"responses": [
                    {"id": "0", "status": 200, "headers": {"Content-Type": "image/png"}, "body": "iVBORw0KGgo="},
                    {"id": "1", "status": 404, "body": {"error": {"code": "ImageNotFound"}}}
                ]}"#,
            )
            .create_async()
            .await;

        let entries = vec![
            DirectoryEntry {
                id: "1".to_string(),
                name: "Ann".to_string(),
                email: "ann@corp.test".to_string(),
                fields: BTreeMap::new(),
                photo: None,
            },
            DirectoryEntry {
                id: "2".to_string(),
                name: "Bo".to_string(),
                email: "bo@corp.test".to_string(),
                fields: BTreeMap::new(),
                photo: None,
            },
        ];
        let photos = client(&server, None)
            .fetch_photos(&entries)
            .await
            .expect("photos");
        assert_eq!(photos.len(), 1);
        assert_eq!(
            photos.get("1").map(String::as_str),
            Some("data:image/png;base64,iVBORw0KGgo=")
        );
    }
}
