//! End-to-end tests for the board gateway.
//!
//! These start a real Axum server on a random port, backed by an in-memory
//! CRM, directory and store, and drive it over HTTP:
//! - public health check, bearer auth on the board routes
//! - board snapshot with grouped opportunities
//! - drag start/end: create-on-assign, removal, illegal drop, forward phase move
//! - bug report relay and its rate limit

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};

use pipeboard::channels::web::server::{GatewayState, RateLimiter, start_server};
use pipeboard::crm::{CrmApi, DealUpdate};
use pipeboard::db::{Database, EmployeeStore};
use pipeboard::db::memory::MemoryStore;
use pipeboard::directory::DirectoryApi;
use pipeboard::error::{CrmError, DirectoryError, MailError};
use pipeboard::mail::{BugReport, BugReportMailer};
use pipeboard::pipeline::deal::{CompanyRef, CustomFieldValue, Deal, NewDeal};
use pipeboard::pipeline::employee::DirectoryEntry;
use pipeboard::pipeline::{Board, BoardHandle, BoardRules, BoardService, Phase, PhaseMap};

const AUTH_TOKEN: &str = "test-token-12345";

// ==================== Fakes ====================

#[derive(Default)]
struct InMemoryCrm {
    deals: Mutex<Vec<Deal>>,
    moves: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl CrmApi for InMemoryCrm {
    async fn deals_list(&self) -> Result<Vec<Deal>, CrmError> {
        Ok(self.deals.lock().unwrap().clone())
    }

    async fn deals_info(&self, id: &str) -> Result<Deal, CrmError> {
        self.deals
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| CrmError::Api {
                endpoint: "deals.info".to_string(),
                status: 404,
                body: id.to_string(),
            })
    }

    async fn deals_update(&self, update: &DealUpdate) -> Result<(), CrmError> {
        let mut deals = self.deals.lock().unwrap();
        if let Some(deal) = deals.iter_mut().find(|d| d.id == update.id) {
            for field in &update.custom_fields {
                *deal = deal.clone().with_custom_field(&field.id, field.value.clone());
            }
        }
        Ok(())
    }

    async fn deals_create(&self, new: &NewDeal) -> Result<String, CrmError> {
        let mut deals = self.deals.lock().unwrap();
        let id = format!("created-{}", deals.len() + 1);
        deals.push(Deal {
            id: id.clone(),
            title: new.title.clone(),
            company: new.company.clone(),
            created_at: None,
            estimated_closing_date: new.estimated_closing_date,
            phase_id: Some(new.phase_id.clone()),
            estimated_probability: new.estimated_probability,
            estimated_value: new.estimated_value,
            currency: new.currency.clone(),
            custom_fields: new.custom_fields.clone(),
        });
        Ok(id)
    }

    async fn deals_move(&self, id: &str, phase_id: &str) -> Result<(), CrmError> {
        self.moves
            .lock()
            .unwrap()
            .push((id.to_string(), phase_id.to_string()));
        if let Some(deal) = self.deals.lock().unwrap().iter_mut().find(|d| d.id == id) {
            deal.phase_id = Some(phase_id.to_string());
        }
        Ok(())
    }
}

struct StaticDirectory {
    entries: Vec<DirectoryEntry>,
}

#[async_trait]
impl DirectoryApi for StaticDirectory {
    async fn list_employees(&self) -> Result<Vec<DirectoryEntry>, DirectoryError> {
        Ok(self.entries.clone())
    }

    async fn fetch_photos(
        &self,
        _employees: &[DirectoryEntry],
    ) -> Result<HashMap<String, String>, DirectoryError> {
        Ok(HashMap::new())
    }
}

#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl BugReportMailer for RecordingMailer {
    async fn send(&self, report: &BugReport) -> Result<(), MailError> {
        self.sent.lock().unwrap().push(report.subject.clone());
        Ok(())
    }
}

// ==================== Harness ====================

fn phase_id(phase: Phase) -> String {
    format!("ph-{}", phase.env_suffix())
}

fn rules() -> BoardRules {
    BoardRules {
        phases: PhaseMap::new(Phase::ALL.iter().map(|p| (*p, phase_id(*p)))),
        grouping_field_id: "ref".to_string(),
        assignee_field_id: "assignee".to_string(),
    }
}

fn seed_deal() -> Deal {
    Deal {
        id: "d1".to_string(),
        title: "Backend developer (Bob)".to_string(),
        company: Some(CompanyRef {
            kind: "company".to_string(),
            id: "c1".to_string(),
            name: Some("Acme".to_string()),
        }),
        created_at: None,
        estimated_closing_date: "2026-12-01".parse().ok(),
        phase_id: Some(phase_id(Phase::Proposed)),
        estimated_probability: Some(0.5),
        estimated_value: None,
        currency: None,
        custom_fields: vec![
            CustomFieldValue {
                id: "ref".to_string(),
                value: json!("REQ-7"),
            },
            CustomFieldValue {
                id: "assignee".to_string(),
                value: json!("bob@corp.test"),
            },
        ],
    }
}

fn directory() -> StaticDirectory {
    let entry = |id: &str, name: &str| DirectoryEntry {
        id: id.to_string(),
        name: name.to_string(),
        email: format!("{id}@corp.test"),
        fields: [("title".to_string(), "Consultant".to_string())].into(),
        photo: None,
    };
    StaticDirectory {
        entries: vec![entry("ann", "Ann"), entry("bob", "Bob")],
    }
}

struct TestGateway {
    addr: SocketAddr,
    crm: Arc<InMemoryCrm>,
    store: Arc<MemoryStore>,
    mailer: Option<Arc<RecordingMailer>>,
    client: reqwest::Client,
}

impl TestGateway {
    async fn start(with_mailer: bool, bug_report_limit: u64) -> Self {
        let crm = Arc::new(InMemoryCrm {
            deals: Mutex::new(vec![seed_deal()]),
            ..InMemoryCrm::default()
        });
        let store = Arc::new(MemoryStore::new());
        let service = Arc::new(BoardService::new(
            BoardHandle::spawn(Board::new(rules())),
            crm.clone(),
            Arc::new(directory()),
            store.clone() as Arc<dyn Database>,
            rules(),
        ));
        service.refresh_employees().await.expect("employees load");
        service.refresh_deals().await.expect("deals load");

        let mailer = with_mailer.then(|| Arc::new(RecordingMailer::default()));
        let state = Arc::new(GatewayState {
            service,
            oauth: None,
            mailer: mailer
                .clone()
                .map(|m| m as Arc<dyn BugReportMailer>),
            bug_report_limiter: RateLimiter::new(bug_report_limit, 600),
            shutdown_tx: tokio::sync::RwLock::new(None),
            startup_time: std::time::Instant::now(),
        });

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let addr = start_server(addr, state, AUTH_TOKEN.to_string())
            .await
            .expect("Failed to start test server");

        Self {
            addr,
            crm,
            store,
            mailer,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .bearer_auth(AUTH_TOKEN)
            .send()
            .await
            .unwrap()
    }

    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .bearer_auth(AUTH_TOKEN)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn board(&self) -> Value {
        let resp = self.get("/api/board").await;
        assert_eq!(resp.status(), 200);
        resp.json().await.unwrap()
    }

    async fn drag(&self, event: Value) -> reqwest::Response {
        self.post("/api/drag", json!({ "client_id": "tab-1", "event": event }))
            .await
    }

    /// Start and end one drag, returning the drop's response body.
    async fn drag_and_drop(&self, employee: &str, source: &str, target: &str) -> Value {
        let started = self
            .drag(json!({ "type": "start", "employee_id": employee, "source": source }))
            .await;
        assert_eq!(started.status(), 200);
        let started: Value = started.json().await.unwrap();
        assert_eq!(started["status"], "pending");

        let dropped = self.drag(json!({ "type": "end", "target": target })).await;
        assert_eq!(dropped.status(), 200);
        dropped.json().await.unwrap()
    }
}

fn employee<'a>(board: &'a Value, id: &str) -> &'a Value {
    board["employees"]
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["id"] == id)
        .unwrap()
}

// ==================== Tests ====================

#[tokio::test]
async fn health_is_public_and_board_requires_token() {
    let gw = TestGateway::start(false, 5).await;

    let health: Value = gw
        .client
        .get(gw.url("/api/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["crm_connected"], false);

    let anonymous = gw.client.get(gw.url("/api/board")).send().await.unwrap();
    assert_eq!(anonymous.status(), 401);

    let wrong = gw
        .client
        .get(gw.url("/api/board"))
        .bearer_auth("not-the-token")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);
}

#[tokio::test]
async fn snapshot_shows_grouped_opportunity_and_derived_placement() {
    let gw = TestGateway::start(false, 5).await;
    let board = gw.board().await;

    let opportunities = board["opportunities"].as_array().unwrap();
    assert_eq!(opportunities.len(), 1);
    let opportunity = &opportunities[0];
    assert_eq!(opportunity["title"], "Backend developer");
    assert_eq!(opportunity["company"], "Acme");
    assert_eq!(opportunity["closing_date"], "2026-12-01");
    assert_eq!(opportunity["rows"].as_array().unwrap().len(), 5);

    assert_eq!(opportunity["deals"][0]["phase"], "Proposed");
    assert_eq!(opportunity["deals"][0]["assignee"], "bob@corp.test");

    // Nothing stored yet: everyone starts in the pool.
    let bob = employee(&board, "bob");
    assert_eq!(bob["rows"], json!(["0"]));
    assert_eq!(bob["title"], "Consultant");
    assert_eq!(bob["city"], "N/A");
}

#[tokio::test]
async fn drag_from_pool_creates_deal_then_advances_it() {
    let gw = TestGateway::start(false, 5).await;
    let board = gw.board().await;
    let key = board["opportunities"][0]["key"].as_str().unwrap().to_string();

    let assigned = gw
        .drag_and_drop("ann", "0", &format!("{key}/Opportunities"))
        .await;
    assert_eq!(assigned["status"], "applied");
    assert_eq!(assigned["plan"], "create_deal");
    let created = assigned["created_deal_id"].as_str().unwrap().to_string();

    let board = gw.board().await;
    let ann = employee(&board, "ann");
    assert_eq!(ann["rows"], json!([format!("{key}/Opportunities")]));
    assert_eq!(ann["deals"], json!([created.clone()]));
    let member_ids: Vec<&str> = board["opportunities"][0]["deals"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|d| d["id"].as_str())
        .collect();
    assert!(member_ids.contains(&created.as_str()));

    let advanced = gw
        .drag_and_drop(
            "ann",
            &format!("{key}/Opportunities"),
            &format!("{key}/Proposed"),
        )
        .await;
    assert_eq!(advanced["status"], "applied");
    assert_eq!(advanced["plan"], "move_deal");
    assert_eq!(
        gw.crm.moves.lock().unwrap().clone(),
        vec![(created, phase_id(Phase::Proposed))]
    );
}

#[tokio::test]
async fn dropping_back_on_the_pool_forgets_the_placement() {
    let gw = TestGateway::start(false, 5).await;
    let board = gw.board().await;
    let key = board["opportunities"][0]["key"].as_str().unwrap().to_string();
    let opportunities = format!("{key}/Opportunities");

    let assigned = gw.drag_and_drop("ann", "0", &opportunities).await;
    assert_eq!(assigned["plan"], "create_deal");

    let removed = gw.drag_and_drop("ann", &opportunities, "0").await;
    assert_eq!(removed["status"], "applied");
    assert_eq!(removed["plan"], "forget_placement");

    let board = gw.board().await;
    let ann = employee(&board, "ann");
    assert_eq!(ann["rows"], json!(["0"]));
    assert_eq!(ann["deals"], json!([]));

    let stored = gw.store.get_placement("ann").await.unwrap().unwrap();
    assert!(stored.rows.iter().all(|r| r.is_unassigned()));
    assert!(stored.deal_ids.is_empty());
    // Removal never deletes the CRM deal.
    assert_eq!(gw.crm.deals.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn illegal_drop_returns_notification_and_leaves_board_alone() {
    let gw = TestGateway::start(false, 5).await;
    let board = gw.board().await;
    let key = board["opportunities"][0]["key"].as_str().unwrap().to_string();

    let rejected = gw
        .drag_and_drop("ann", "0", &format!("{key}/Retained"))
        .await;
    assert_eq!(rejected["status"], "rejected");
    assert_eq!(rejected["notification"]["kind"], "move_not_allowed");
    assert_eq!(rejected["notification"]["reason"], "entry_phase_required");

    let after = gw.board().await;
    assert_eq!(employee(&after, "ann")["rows"], json!(["0"]));
    assert_eq!(gw.crm.deals.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn drag_without_client_id_is_rejected() {
    let gw = TestGateway::start(false, 5).await;
    let resp = gw
        .post(
            "/api/drag",
            json!({ "client_id": " ", "event": { "type": "cancel" } }),
        )
        .await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["notification"]["kind"], "sync_failed");
}

#[tokio::test]
async fn bug_report_needs_a_configured_mailer() {
    let gw = TestGateway::start(false, 5).await;
    let resp = gw
        .post(
            "/api/bug-report",
            json!({ "subject": "Board froze", "description": "After dragging Ann" }),
        )
        .await;
    assert_eq!(resp.status(), 503);
}

#[tokio::test]
async fn bug_reports_are_relayed_and_rate_limited() {
    let gw = TestGateway::start(true, 1).await;

    let invalid = gw
        .post(
            "/api/bug-report",
            json!({ "subject": "", "description": "x" }),
        )
        .await;
    assert_eq!(invalid.status(), 400);

    // The invalid report above spent the only slot of the window.
    let limited = gw
        .post(
            "/api/bug-report",
            json!({ "subject": "Board froze", "description": "After dragging Ann" }),
        )
        .await;
    assert_eq!(limited.status(), 429);

    let sent = gw.mailer.as_ref().unwrap().sent.lock().unwrap().clone();
    assert!(sent.is_empty());
}

#[tokio::test]
async fn bug_report_is_sent_through_the_mailer() {
    let gw = TestGateway::start(true, 5).await;
    let resp = gw
        .post(
            "/api/bug-report",
            json!({
                "reporter": "ann@corp.test",
                "subject": "Board froze",
                "description": "After dragging Ann",
                "page": "board"
            }),
        )
        .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "sent");
    assert_eq!(
        gw.mailer.as_ref().unwrap().sent.lock().unwrap().clone(),
        vec!["Board froze".to_string()]
    );
}
