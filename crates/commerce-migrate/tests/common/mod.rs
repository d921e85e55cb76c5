//! In-process fakes for the source and destination adapters.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use commerce_migrate::destination::{
    has_tag, CustomerRequest, DestinationApi, OrderRequest, SubscriptionRecordRequest,
};
use commerce_migrate::model::DestinationId;
use commerce_migrate::{
    EntityKind, MigrateError, Result, RetryPolicy, SourceApi, SourcePage, SqliteStagingStore,
    StagingStore,
};

pub fn memory_store() -> Arc<dyn StagingStore> {
    Arc::new(SqliteStagingStore::in_memory().expect("in-memory store"))
}

/// Retry policy with millisecond delays so failure tests stay fast.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(3)
        .with_delays(Duration::from_millis(1), Duration::from_millis(5))
        .with_timeout(Duration::from_secs(5))
}

#[derive(Default)]
struct SourceState {
    pages: HashMap<(EntityKind, i64), Vec<Value>>,
    reported: HashMap<EntityKind, u64>,
    /// Remaining transient failures per page.
    flaky: HashMap<(EntityKind, i64), u32>,
    broken: HashSet<(EntityKind, i64)>,
    calls: Vec<(EntityKind, i64)>,
}

/// Page-addressable fake source. Pages not set are empty.
#[derive(Clone, Default)]
pub struct FakeSource {
    state: Arc<Mutex<SourceState>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_page(&self, kind: EntityKind, page: i64, records: Vec<Value>) {
        self.state.lock().unwrap().pages.insert((kind, page), records);
    }

    pub fn set_reported_total(&self, kind: EntityKind, total: u64) {
        self.state.lock().unwrap().reported.insert(kind, total);
    }

    /// Fail `page` with a 503-style error `times` times before serving it.
    pub fn fail_page(&self, kind: EntityKind, page: i64, times: u32) {
        self.state.lock().unwrap().flaky.insert((kind, page), times);
    }

    /// Fail `page` with a transient error forever.
    pub fn break_page(&self, kind: EntityKind, page: i64) {
        self.state.lock().unwrap().broken.insert((kind, page));
    }

    pub fn calls(&self) -> Vec<(EntityKind, i64)> {
        self.state.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl SourceApi for FakeSource {
    async fn list_page(&self, kind: EntityKind, page: i64, _page_size: usize) -> Result<SourcePage> {
        let mut state = self.state.lock().unwrap();
        state.calls.push((kind, page));

        if state.broken.contains(&(kind, page)) {
            return Err(MigrateError::transient("list page", "HTTP 503"));
        }
        if let Some(remaining) = state.flaky.get_mut(&(kind, page)) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(MigrateError::transient("list page", "HTTP 503"));
            }
        }

        Ok(SourcePage {
            records: state.pages.get(&(kind, page)).cloned().unwrap_or_default(),
            reported_total: state.reported.get(&kind).copied(),
        })
    }
}

#[derive(Default)]
struct DestinationState {
    next_id: DestinationId,
    customers: BTreeMap<DestinationId, CustomerRequest>,
    orders: BTreeMap<DestinationId, (DestinationId, OrderRequest)>,
    records: BTreeMap<DestinationId, (DestinationId, SubscriptionRecordRequest)>,
    customer_creates: usize,
    customer_updates: usize,
    rejected_emails: HashSet<String>,
    auth_revoked: bool,
    /// Answer 401 once this many customers were created.
    revoke_after_creates: Option<usize>,
}

/// In-memory destination that assigns sequential ids.
#[derive(Clone, Default)]
pub struct FakeDestination {
    state: Arc<Mutex<DestinationState>>,
}

impl FakeDestination {
    pub fn new() -> Self {
        let fake = Self::default();
        fake.state.lock().unwrap().next_id = 5000;
        fake
    }

    /// Answer 422 for customers with this email.
    pub fn reject_email(&self, email: &str) {
        self.state
            .lock()
            .unwrap()
            .rejected_emails
            .insert(email.to_string());
    }

    /// Stop answering 422 for this email.
    pub fn accept_email(&self, email: &str) {
        self.state.lock().unwrap().rejected_emails.remove(email);
    }

    /// Answer 401 to every call from now on.
    pub fn revoke_auth(&self) {
        self.state.lock().unwrap().auth_revoked = true;
    }

    /// Answer 401 to every call once `creates` customers exist.
    pub fn revoke_auth_after(&self, creates: usize) {
        self.state.lock().unwrap().revoke_after_creates = Some(creates);
    }

    pub fn customers(&self) -> BTreeMap<DestinationId, CustomerRequest> {
        self.state.lock().unwrap().customers.clone()
    }

    pub fn customer(&self, id: DestinationId) -> Option<CustomerRequest> {
        self.state.lock().unwrap().customers.get(&id).cloned()
    }

    pub fn order_count(&self) -> usize {
        self.state.lock().unwrap().orders.len()
    }

    pub fn orders_of(&self, customer: DestinationId) -> Vec<OrderRequest> {
        self.state
            .lock()
            .unwrap()
            .orders
            .values()
            .filter(|(owner, _)| *owner == customer)
            .map(|(_, order)| order.clone())
            .collect()
    }

    pub fn subscription_record_count(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }

    pub fn customer_creates(&self) -> usize {
        self.state.lock().unwrap().customer_creates
    }

    pub fn customer_updates(&self) -> usize {
        self.state.lock().unwrap().customer_updates
    }

    fn check_auth(state: &DestinationState, operation: &str) -> Result<()> {
        let budget_spent = state
            .revoke_after_creates
            .is_some_and(|limit| state.customer_creates >= limit);
        if state.auth_revoked || budget_spent {
            return Err(MigrateError::Auth {
                operation: operation.to_string(),
                message: "HTTP 401: invalid access token".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DestinationApi for FakeDestination {
    async fn create_customer(&self, request: &CustomerRequest) -> Result<DestinationId> {
        let mut state = self.state.lock().unwrap();
        Self::check_auth(&state, "create customer")?;
        if state.rejected_emails.contains(&request.email) {
            return Err(MigrateError::validation(
                "create customer",
                "HTTP 422: email is invalid",
            ));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.customers.insert(id, request.clone());
        state.customer_creates += 1;
        Ok(id)
    }

    async fn update_customer(&self, id: DestinationId, request: &CustomerRequest) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_auth(&state, "update customer")?;
        let Some(existing) = state.customers.get_mut(&id) else {
            return Err(MigrateError::Api {
                operation: "update customer".into(),
                status: 404,
                message: "not found".into(),
            });
        };
        existing.email = request.email.clone();
        existing.first_name = request.first_name.clone();
        existing.last_name = request.last_name.clone();
        state.customer_updates += 1;
        Ok(())
    }

    async fn find_customer_by_ref(&self, external_ref: &str) -> Result<Option<DestinationId>> {
        let state = self.state.lock().unwrap();
        Self::check_auth(&state, "find customer")?;
        Ok(state
            .customers
            .iter()
            .find(|(_, c)| has_tag(&c.tags.join(", "), external_ref))
            .map(|(id, _)| *id))
    }

    async fn create_order(
        &self,
        customer_id: DestinationId,
        request: &OrderRequest,
    ) -> Result<DestinationId> {
        let mut state = self.state.lock().unwrap();
        Self::check_auth(&state, "create order")?;
        state.next_id += 1;
        let id = state.next_id;
        state.orders.insert(id, (customer_id, request.clone()));
        Ok(id)
    }

    async fn find_order_by_ref(
        &self,
        customer_id: DestinationId,
        external_ref: &str,
    ) -> Result<Option<DestinationId>> {
        let state = self.state.lock().unwrap();
        Self::check_auth(&state, "find order")?;
        Ok(state
            .orders
            .iter()
            .find(|(_, (owner, o))| *owner == customer_id && o.tags.iter().any(|t| t == external_ref))
            .map(|(id, _)| *id))
    }

    async fn create_subscription_record(
        &self,
        customer_id: DestinationId,
        request: &SubscriptionRecordRequest,
    ) -> Result<DestinationId> {
        let mut state = self.state.lock().unwrap();
        Self::check_auth(&state, "create subscription record")?;
        state.next_id += 1;
        let id = state.next_id;
        state.records.insert(id, (customer_id, request.clone()));
        Ok(id)
    }

    async fn find_subscription_record(
        &self,
        customer_id: DestinationId,
        namespace: &str,
        key: &str,
    ) -> Result<Option<DestinationId>> {
        let state = self.state.lock().unwrap();
        Self::check_auth(&state, "find subscription record")?;
        Ok(state
            .records
            .iter()
            .find(|(_, (owner, r))| {
                *owner == customer_id && r.metafield.namespace == namespace && r.metafield.key == key
            })
            .map(|(id, _)| *id))
    }

    async fn health_check(&self) -> Result<()> {
        let state = self.state.lock().unwrap();
        Self::check_auth(&state, "health check")
    }
}
