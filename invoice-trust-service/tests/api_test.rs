mod common;

use common::{days_from_today, sample_invoice, today, TestApp, TestOptions, INTERNAL_KEY};
use invoice_trust_service::models::PlanTier;
use service_core::middleware::client_ip::TrustedProxies;
use serde_json::{json, Value};

fn invoice_body(number: &str) -> Value {
    json!({
        "invoice_number": number,
        "issuer_name": "Acme Ltd",
        "buyer": {
            "name": "Globex Corp",
            "email": "ap@globex.test",
            "phone": "+919876543210",
            "address": null,
            "tax_id": null
        },
        "currency": "usd",
        "issue_date": today(),
        "due_date": days_from_today(30),
        "line_items": [
            { "description": "Design work", "quantity": "2", "unit_price": "150.00", "tax_rate": "18" },
            { "description": "Hosting", "quantity": "1", "unit_price": "20.00" }
        ]
    })
}

#[tokio::test]
async fn health_check_works() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .get(app.url("/health"))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());
    let body: Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "invoice-trust-service");
}

#[tokio::test]
async fn health_checks_report_storage_outage() {
    let app = TestApp::spawn().await;

    let ready = app.client.get(app.url("/ready")).send().await.unwrap();
    assert_eq!(ready.status().as_u16(), 200);

    app.store.set_unavailable(true);
    let health = app.client.get(app.url("/health")).send().await.unwrap();
    assert_eq!(health.status().as_u16(), 503);
    let ready = app.client.get(app.url("/ready")).send().await.unwrap();
    assert_eq!(ready.status().as_u16(), 503);
}

#[tokio::test]
async fn metrics_endpoint_is_exposed() {
    let app = TestApp::spawn().await;
    let response = app.client.get(app.url("/metrics")).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
}

#[tokio::test]
async fn tenant_routes_require_tenant_header() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .post(app.url("/invoices"))
        .json(&invoice_body("INV-500"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);

    let response = app
        .client
        .get(app.url("/quota"))
        .header("X-Tenant-ID", "not-a-uuid")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn issue_get_and_verify_over_http() {
    let app = TestApp::spawn().await;
    let tenant = app.tenant_id.to_string();

    let response = app
        .client
        .post(app.url("/invoices"))
        .header("X-Tenant-ID", &tenant)
        .json(&invoice_body("INV-501"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 201);
    let invoice: Value = response.json().await.unwrap();
    assert_eq!(invoice["currency"], "USD");
    assert_eq!(invoice["payment_status"], "PENDING");
    assert!(invoice.get("sealed_hash").is_none());
    let invoice_id = invoice["invoice_id"].as_str().unwrap().to_string();
    let code = invoice["verification_code"].as_str().unwrap().to_string();

    let response = app
        .client
        .get(app.url(&format!("/invoices/{}", invoice_id)))
        .header("X-Tenant-ID", &tenant)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let response = app
        .client
        .get(app.url(&format!("/invoices/{}", invoice_id)))
        .header("X-Tenant-ID", app.other_tenant_id.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);

    let response = app
        .client
        .get(app.url(&format!("/invoices/{}", uuid::Uuid::new_v4())))
        .header("X-Tenant-ID", &tenant)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);

    let response = app
        .client
        .get(app.url(&format!("/verify/{}", code)))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "VALID");
}

#[tokio::test]
async fn duplicate_invoice_number_conflicts() {
    let app = TestApp::spawn().await;
    let tenant = app.tenant_id.to_string();

    for expected in [201, 409] {
        let response = app
            .client
            .post(app.url("/invoices"))
            .header("X-Tenant-ID", &tenant)
            .json(&invoice_body("INV-502"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), expected);
    }
}

#[tokio::test]
async fn invalid_invoice_is_rejected() {
    let app = TestApp::spawn().await;
    let mut body = invoice_body("INV-503");
    body["currency"] = json!("DOLLARS");

    let response = app
        .client
        .post(app.url("/invoices"))
        .header("X-Tenant-ID", app.tenant_id.to_string())
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 422);

    let mut body = invoice_body("INV-504");
    body["due_date"] = json!(days_from_today(-1));
    let response = app
        .client
        .post(app.url("/invoices"))
        .header("X-Tenant-ID", app.tenant_id.to_string())
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn exhausted_quota_returns_payment_required_with_upgrade_link() {
    let app = TestApp::spawn_with(TestOptions {
        plan: PlanTier::Free,
        ..TestOptions::default()
    })
    .await;
    let tenant = app.tenant_id.to_string();

    for n in 0..10 {
        let response = app
            .client
            .post(app.url("/invoices"))
            .header("X-Tenant-ID", &tenant)
            .json(&invoice_body(&format!("INV-6{:02}", n)))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 201);
    }

    let response = app
        .client
        .post(app.url("/invoices"))
        .header("X-Tenant-ID", &tenant)
        .json(&invoice_body("INV-610"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 402);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["feature"], "invoices");
    assert_eq!(body["upgrade_url"], "/billing/plans");

    let response = app
        .client
        .get(app.url("/quota"))
        .header("X-Tenant-ID", &tenant)
        .send()
        .await
        .unwrap();
    let usage: Value = response.json().await.unwrap();
    assert_eq!(usage["plan"], "FREE");
    assert_eq!(usage["invoices"]["used"], 10);
    assert_eq!(usage["invoices"]["limit"], 10);
}

#[tokio::test]
async fn quota_check_endpoints() {
    let app = TestApp::spawn_with(TestOptions {
        plan: PlanTier::Starter,
        ..TestOptions::default()
    })
    .await;
    let tenant = app.tenant_id.to_string();

    let response = app
        .client
        .get(app.url("/quota/emailIntegration"))
        .header("X-Tenant-ID", &tenant)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["feature"], "email_integration");
    assert_eq!(body["allowed"], false);

    let response = app
        .client
        .get(app.url("/quota/ocr"))
        .header("X-Tenant-ID", &tenant)
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["allowed"], true);

    let response = app
        .client
        .get(app.url("/quota/storage"))
        .header("X-Tenant-ID", &tenant)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    let response = app
        .client
        .get(app.url("/quota/templates/modern"))
        .header("X-Tenant-ID", &tenant)
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["template_id"], "modern");
    assert_eq!(body["allowed"], true);
}

#[tokio::test]
async fn reminder_routes_over_http() {
    let app = TestApp::spawn().await;
    let tenant = app.tenant_id.to_string();
    let invoice = app.issue(common::sample_invoice("INV-700", Some(30))).await;

    let response = app
        .client
        .get(app.url(&format!("/invoices/{}/reminders", invoice.invoice_id)))
        .header("X-Tenant-ID", &tenant)
        .send()
        .await
        .unwrap();
    let reminders: Vec<Value> = response.json().await.unwrap();
    assert_eq!(reminders.len(), 6);
    assert!(reminders[0].get("claimed_until").is_none());

    let response = app
        .client
        .post(app.url(&format!("/invoices/{}/reminders", invoice.invoice_id)))
        .header("X-Tenant-ID", &tenant)
        .json(&json!({ "reminder_type": "AFTER_DUE", "days_offset": 14, "channel": "EMAIL" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 201);
    let created: Value = response.json().await.unwrap();
    assert_eq!(created["days_offset"], 14);
    assert_eq!(created["status"], "PENDING");

    let response = app
        .client
        .post(app.url(&format!(
            "/invoices/{}/reminders/cancel",
            invoice.invoice_id
        )))
        .header("X-Tenant-ID", &tenant)
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["cancelled"], 7);

    let response = app
        .client
        .post(app.url(&format!(
            "/invoices/{}/reminders/default",
            invoice.invoice_id
        )))
        .header("X-Tenant-ID", &tenant)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 201);
    let pending: Vec<Value> = response.json().await.unwrap();
    assert_eq!(pending.len(), 6);
}

#[tokio::test]
async fn status_update_needs_a_field() {
    let app = TestApp::spawn().await;
    let invoice = app.issue(common::sample_invoice("INV-701", Some(30))).await;

    let response = app
        .client
        .patch(app.url(&format!("/invoices/{}/status", invoice.invoice_id)))
        .header("X-Tenant-ID", app.tenant_id.to_string())
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    let response = app
        .client
        .patch(app.url(&format!("/invoices/{}/status", invoice.invoice_id)))
        .header("X-Tenant-ID", app.tenant_id.to_string())
        .json(&json!({ "delivery_status": "VIEWED" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["delivery_status"], "VIEWED");
    assert_eq!(body["payment_status"], "PENDING");
}

#[tokio::test]
async fn internal_dispatch_requires_key() {
    let app = TestApp::spawn().await;
    app.issue(common::sample_invoice("INV-702", Some(-8))).await;

    let response = app
        .client
        .post(app.url("/internal/reminders/dispatch"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);

    let response = app
        .client
        .post(app.url("/internal/reminders/dispatch"))
        .header("x-internal-api-key", "wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
    assert_eq!(app.email.send_count(), 0);

    let response = app
        .client
        .post(app.url("/internal/reminders/dispatch"))
        .header("x-internal-api-key", INTERNAL_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let summary: Value = response.json().await.unwrap();
    assert_eq!(summary["sent"], 6);
    assert_eq!(summary["failed"], 0);
    assert_eq!(summary["skipped"], 0);
}

#[tokio::test]
async fn internal_dispatch_is_closed_without_configured_key() {
    let app = TestApp::spawn_with(TestOptions {
        internal_key: None,
        ..TestOptions::default()
    })
    .await;

    let response = app
        .client
        .post(app.url("/internal/reminders/dispatch"))
        .header("x-internal-api-key", "")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn verification_is_rate_limited_per_ip() {
    let app = TestApp::spawn_with(TestOptions {
        verify_limit: 2,
        ..TestOptions::default()
    })
    .await;

    for _ in 0..2 {
        let response = app
            .client
            .get(app.url("/verify/some-code"))
            .header("x-forwarded-for", "198.51.100.4")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
    }

    let response = app
        .client
        .get(app.url("/verify/some-code"))
        .header("x-forwarded-for", "198.51.100.4")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 429);
    assert!(response.headers().get("retry-after").is_some());

    // A different client is unaffected.
    let response = app
        .client
        .get(app.url("/verify/some-code"))
        .header("x-forwarded-for", "198.51.100.5")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
}

#[tokio::test]
async fn forwarded_header_is_ignored_without_a_trusted_proxy() {
    let app = TestApp::spawn_with(TestOptions {
        verify_limit: 2,
        trusted_proxies: TrustedProxies::none(),
        ..TestOptions::default()
    })
    .await;
    let invoice = app.issue(sample_invoice("INV-700", Some(30))).await;

    let mut statuses = Vec::new();
    for spoofed in ["198.51.100.10", "198.51.100.11", "198.51.100.12"] {
        let response = app
            .client
            .get(app.url(&format!("/verify/{}", invoice.verification_code)))
            .header("x-forwarded-for", spoofed)
            .send()
            .await
            .unwrap();
        statuses.push(response.status().as_u16());
    }
    assert_eq!(statuses, vec![200, 200, 429]);

    let entries = app
        .state
        .engine
        .list_verifications(app.tenant_id, invoice.invoice_id, 10)
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries
        .iter()
        .all(|e| e.ip_address.as_deref() == Some("127.0.0.1")));
}
