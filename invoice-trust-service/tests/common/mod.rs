#![allow(dead_code)]

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use invoice_trust_service::models::{
    BuyerSnapshot, Channel, IntegrationSettings, Invoice, NewInvoice, NewLineItem, PlanTier,
    Tenant, TenantSettings,
};
use invoice_trust_service::services::{DeliveryRouter, InMemoryStore, MockChannel, TrustStore};
use invoice_trust_service::startup::{build_router, AppState, EngineSettings};
use rust_decimal::Decimal;
use secrecy::SecretString;
use service_core::middleware::client_ip::TrustedProxies;
use service_core::middleware::rate_limit::{LocalCounterStore, RateLimiter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use uuid::Uuid;

pub const TEST_SECRET: &str = "test-verification-secret-0123456789";
pub const INTERNAL_KEY: &str = "test-internal-key";

/// Knobs for a test application.
pub struct TestOptions {
    pub plan: PlanTier,
    pub settings: TenantSettings,
    pub email: MockChannel,
    pub whatsapp: Option<MockChannel>,
    pub internal_key: Option<String>,
    pub verify_limit: u64,
    /// The test client connects from loopback, acting as the edge proxy.
    pub trusted_proxies: TrustedProxies,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            plan: PlanTier::Professional,
            settings: TenantSettings::default(),
            email: MockChannel::new(Channel::Email),
            whatsapp: None,
            internal_key: Some(INTERNAL_KEY.to_string()),
            verify_limit: 1000,
            trusted_proxies: "127.0.0.1, 10.0.0.1"
                .parse()
                .expect("Invalid proxy list"),
        }
    }
}

pub struct TestApp {
    pub address: String,
    pub state: AppState,
    pub store: Arc<InMemoryStore>,
    pub email: Arc<MockChannel>,
    pub whatsapp: Option<Arc<MockChannel>>,
    pub tenant_id: Uuid,
    pub other_tenant_id: Uuid,
    pub client: reqwest::Client,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(TestOptions::default()).await
    }

    pub async fn spawn_with(options: TestOptions) -> Self {
        let store = Arc::new(InMemoryStore::new());

        let tenant_id = Uuid::new_v4();
        let other_tenant_id = Uuid::new_v4();
        store
            .insert_tenant(tenant(tenant_id, "Acme Ltd", options.plan, options.settings))
            .expect("Failed to insert tenant");
        store
            .insert_tenant(tenant(
                other_tenant_id,
                "Other Co",
                PlanTier::Professional,
                TenantSettings::default(),
            ))
            .expect("Failed to insert tenant");

        let email = Arc::new(options.email);
        let whatsapp = options.whatsapp.map(Arc::new);
        let mut router = DeliveryRouter::new(Duration::from_secs(5)).with_channel(email.clone());
        if let Some(channel) = &whatsapp {
            router = router.with_channel(channel.clone());
        }

        let limiter = Arc::new(
            RateLimiter::new(
                Arc::new(LocalCounterStore::new()),
                "test:verify",
                options.verify_limit,
                Duration::from_secs(60),
            )
            .with_trusted_proxies(options.trusted_proxies.clone()),
        );

        let mut settings = EngineSettings::new(SecretString::new(TEST_SECRET.to_string()));
        settings.public_base_url = "https://trust.test".to_string();
        settings.internal_api_key = options.internal_key.map(SecretString::new);
        settings.trusted_proxies = options.trusted_proxies;

        let state = AppState::new(
            settings,
            store.clone() as Arc<dyn TrustStore>,
            Arc::new(router),
            limiter,
        );

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let port = listener.local_addr().expect("No local addr").port();
        let app = build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .ok();
        });

        TestApp {
            address: format!("http://127.0.0.1:{}", port),
            state,
            store,
            email,
            whatsapp,
            tenant_id,
            other_tenant_id,
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    /// Issue an invoice for the primary tenant through the service layer.
    pub async fn issue(&self, input: NewInvoice) -> Invoice {
        self.state
            .invoices
            .issue(self.tenant_id, input)
            .await
            .expect("Failed to issue invoice")
    }
}

pub fn tenant(tenant_id: Uuid, name: &str, plan: PlanTier, settings: TenantSettings) -> Tenant {
    Tenant {
        tenant_id,
        name: name.to_string(),
        plan,
        settings,
        created_utc: Utc::now(),
    }
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

pub fn days_from_today(days: i64) -> NaiveDate {
    today() + ChronoDuration::days(days)
}

/// A two line invoice totalling 374.00 USD, due `due_in_days` from today.
pub fn sample_invoice(number: &str, due_in_days: Option<i64>) -> NewInvoice {
    let due_date = due_in_days.map(days_from_today);
    let issue_date = match due_date {
        Some(due) if due < today() => due - ChronoDuration::days(14),
        _ => today(),
    };

    NewInvoice {
        invoice_number: number.to_string(),
        issuer_name: "Acme Ltd".to_string(),
        buyer: BuyerSnapshot {
            name: "Globex Corp".to_string(),
            email: Some("ap@globex.test".to_string()),
            phone: Some("+919876543210".to_string()),
            address: None,
            tax_id: None,
        },
        currency: "USD".to_string(),
        issue_date,
        due_date,
        line_items: vec![
            NewLineItem {
                description: "Design work".to_string(),
                quantity: Decimal::from(2),
                unit_price: Decimal::from(150),
                tax_rate: Decimal::from(18),
            },
            NewLineItem {
                description: "Hosting".to_string(),
                quantity: Decimal::from(1),
                unit_price: Decimal::from(20),
                tax_rate: Decimal::ZERO,
            },
        ],
        template_id: None,
        payment_status: None,
    }
}

pub fn whatsapp_settings(whatsapp_enabled: bool) -> TenantSettings {
    let mut settings = TenantSettings::default();
    settings.reminders.channel = Channel::Whatsapp;
    settings.integrations = IntegrationSettings {
        whatsapp_enabled,
        ..IntegrationSettings::default()
    };
    settings
}
