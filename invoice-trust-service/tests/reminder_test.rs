mod common;

use chrono::{Duration, Utc};
use common::{days_from_today, sample_invoice, TestApp, TestOptions};
use invoice_trust_service::models::{
    Channel, CreateReminderRequest, PaymentStatus, PlanTier, ReminderStatus, ReminderType,
    StatusUpdate, TenantSettings,
};
use invoice_trust_service::services::reminders::schedule_time;
use service_core::error::AppError;

fn pending_offsets(reminders: &[invoice_trust_service::models::Reminder]) -> Vec<i32> {
    let mut offsets: Vec<i32> = reminders
        .iter()
        .filter(|r| r.status == ReminderStatus::Pending && r.reminder_type.is_relative())
        .map(|r| r.days_offset)
        .collect();
    offsets.sort_unstable();
    offsets
}

#[tokio::test]
async fn issuing_with_due_date_schedules_default_set() {
    let app = TestApp::spawn().await;
    let invoice = app.issue(sample_invoice("INV-200", Some(30))).await;
    let due = invoice.due_date.unwrap();

    let reminders = app
        .state
        .scheduler
        .list(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap();

    assert_eq!(reminders.len(), 6);
    assert_eq!(pending_offsets(&reminders), vec![-3, -1, 0, 1, 3, 7]);
    for reminder in &reminders {
        assert_eq!(reminder.status, ReminderStatus::Pending);
        assert_eq!(reminder.channel, Channel::Email);
        assert_eq!(
            reminder.scheduled_for,
            schedule_time(due, reminder.days_offset, 9).unwrap()
        );
        let expected_type = match reminder.days_offset {
            d if d < 0 => ReminderType::BeforeDue,
            0 => ReminderType::OnDue,
            _ => ReminderType::AfterDue,
        };
        assert_eq!(reminder.reminder_type, expected_type);
    }
}

#[tokio::test]
async fn default_set_is_not_additive() {
    let app = TestApp::spawn().await;
    let invoice = app.issue(sample_invoice("INV-201", Some(30))).await;

    let first = app
        .state
        .scheduler
        .create_default_set(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap();
    let second = app
        .state
        .scheduler
        .create_default_set(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap();

    assert_eq!(first.len(), 6);
    assert_eq!(second.len(), 6);
    let all = app
        .state
        .scheduler
        .list(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap();
    assert_eq!(all.len(), 6);
}

#[tokio::test]
async fn default_set_after_cancel_all_replaces_cancelled_rows() {
    let app = TestApp::spawn().await;
    let invoice = app.issue(sample_invoice("INV-202", Some(30))).await;

    let cancelled = app
        .state
        .scheduler
        .cancel_all_for_invoice(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap();
    assert_eq!(cancelled, 6);

    let pending = app
        .state
        .scheduler
        .create_default_set(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap();
    assert_eq!(pending.len(), 6);

    let all = app
        .state
        .scheduler
        .list(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap();
    assert_eq!(all.len(), 6);
    assert!(all.iter().all(|r| r.status == ReminderStatus::Pending));
}

#[tokio::test]
async fn reminders_disabled_in_settings_skips_automatic_set() {
    let mut settings = TenantSettings::default();
    settings.reminders.enabled = false;
    let app = TestApp::spawn_with(TestOptions {
        settings,
        ..TestOptions::default()
    })
    .await;

    let invoice = app.issue(sample_invoice("INV-203", Some(30))).await;
    let reminders = app
        .state
        .scheduler
        .list(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap();
    assert!(reminders.is_empty());

    // An explicit request still works.
    let created = app
        .state
        .scheduler
        .create_default_set(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap();
    assert_eq!(created.len(), 6);
}

#[tokio::test]
async fn invoice_without_due_date_cannot_get_default_set() {
    let app = TestApp::spawn().await;
    let invoice = app.issue(sample_invoice("INV-204", None)).await;

    let reminders = app
        .state
        .scheduler
        .list(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap();
    assert!(reminders.is_empty());

    let err = app
        .state
        .scheduler
        .create_default_set(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));
}

#[tokio::test]
async fn paying_an_invoice_cancels_pending_reminders() {
    let app = TestApp::spawn().await;
    let invoice = app.issue(sample_invoice("INV-205", Some(30))).await;

    app.state
        .invoices
        .update_status(
            app.tenant_id,
            invoice.invoice_id,
            StatusUpdate {
                payment_status: Some(PaymentStatus::Paid),
                delivery_status: None,
            },
        )
        .await
        .unwrap();

    let reminders = app
        .state
        .scheduler
        .list(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap();
    assert_eq!(reminders.len(), 6);
    assert!(reminders
        .iter()
        .all(|r| r.status == ReminderStatus::Cancelled));

    let err = app
        .state
        .scheduler
        .create_default_set(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));
}

#[tokio::test]
async fn cancelled_invoice_cannot_be_reopened() {
    let app = TestApp::spawn().await;
    let invoice = app.issue(sample_invoice("INV-206", Some(30))).await;
    let update = |status| StatusUpdate {
        payment_status: Some(status),
        delivery_status: None,
    };

    app.state
        .invoices
        .update_status(app.tenant_id, invoice.invoice_id, update(PaymentStatus::Cancelled))
        .await
        .unwrap();
    let err = app
        .state
        .invoices
        .update_status(app.tenant_id, invoice.invoice_id, update(PaymentStatus::Pending))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));
}

#[tokio::test]
async fn custom_reminder_requires_a_date() {
    let app = TestApp::spawn().await;
    let invoice = app.issue(sample_invoice("INV-207", Some(30))).await;

    let err = app
        .state
        .scheduler
        .create_single(
            app.tenant_id,
            invoice.invoice_id,
            CreateReminderRequest {
                reminder_type: ReminderType::Custom,
                days_offset: 0,
                channel: None,
                custom_date: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    let when = Utc::now() + Duration::days(10);
    let reminder = app
        .state
        .scheduler
        .create_single(
            app.tenant_id,
            invoice.invoice_id,
            CreateReminderRequest {
                reminder_type: ReminderType::Custom,
                days_offset: -20,
                channel: Some(Channel::Sms),
                custom_date: Some(when),
            },
        )
        .await
        .unwrap();
    assert_eq!(reminder.status, ReminderStatus::Pending);
    assert_eq!(reminder.scheduled_for, when);
    assert_eq!(reminder.channel, Channel::Sms);
    assert_eq!(reminder.days_offset, -20);
}

#[tokio::test]
async fn single_reminder_normalises_offset_and_rejects_duplicate_slot() {
    let app = TestApp::spawn().await;
    let invoice = app.issue(sample_invoice("INV-208", Some(30))).await;
    let request = |days_offset| CreateReminderRequest {
        reminder_type: ReminderType::BeforeDue,
        days_offset,
        channel: None,
        custom_date: None,
    };

    let reminder = app
        .state
        .scheduler
        .create_single(app.tenant_id, invoice.invoice_id, request(5))
        .await
        .unwrap();
    assert_eq!(reminder.days_offset, -5);
    assert_eq!(
        reminder.scheduled_for,
        schedule_time(invoice.due_date.unwrap(), -5, 9).unwrap()
    );

    // D-3 is already in the default set.
    let err = app
        .state
        .scheduler
        .create_single(app.tenant_id, invoice.invoice_id, request(3))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let err = app
        .state
        .scheduler
        .create_single(app.tenant_id, invoice.invoice_id, request(400))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ValidationError(_)));
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let app = TestApp::spawn().await;
    let invoice = app.issue(sample_invoice("INV-209", Some(30))).await;
    let reminders = app
        .state
        .scheduler
        .list(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap();
    let target = reminders[0].reminder_id;

    let cancelled = app.state.scheduler.cancel(app.tenant_id, target).await.unwrap();
    assert_eq!(cancelled.status, ReminderStatus::Cancelled);

    let again = app.state.scheduler.cancel(app.tenant_id, target).await.unwrap();
    assert_eq!(again.status, ReminderStatus::Cancelled);

    let remaining = app
        .state
        .scheduler
        .cancel_all_for_invoice(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap();
    assert_eq!(remaining, 5);
}

#[tokio::test]
async fn cancel_does_not_touch_sent_reminders() {
    let app = TestApp::spawn().await;
    let invoice = app.issue(sample_invoice("INV-210", Some(30))).await;
    let reminders = app
        .state
        .scheduler
        .list(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap();
    let target = reminders[0].reminder_id;

    app.store
        .modify_reminder(target, |r| r.status = ReminderStatus::Sent)
        .unwrap();

    let result = app.state.scheduler.cancel(app.tenant_id, target).await.unwrap();
    assert_eq!(result.status, ReminderStatus::Sent);
}

#[tokio::test]
async fn due_date_change_rebuilds_relative_reminders_only() {
    let app = TestApp::spawn().await;
    let invoice = app.issue(sample_invoice("INV-211", Some(30))).await;

    let custom_at = Utc::now() + Duration::days(5);
    let custom = app
        .state
        .scheduler
        .create_single(
            app.tenant_id,
            invoice.invoice_id,
            CreateReminderRequest {
                reminder_type: ReminderType::Custom,
                days_offset: 0,
                channel: None,
                custom_date: Some(custom_at),
            },
        )
        .await
        .unwrap();

    let new_due = days_from_today(45);
    let updated = app
        .state
        .invoices
        .change_due_date(app.tenant_id, invoice.invoice_id, new_due)
        .await
        .unwrap();
    assert_eq!(updated.due_date, Some(new_due));

    let reminders = app
        .state
        .scheduler
        .list(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap();
    assert_eq!(pending_offsets(&reminders), vec![-3, -1, 0, 1, 3, 7]);
    for reminder in reminders.iter().filter(|r| r.reminder_type.is_relative()) {
        assert_eq!(
            reminder.scheduled_for,
            schedule_time(new_due, reminder.days_offset, 9).unwrap()
        );
    }

    let kept = reminders
        .iter()
        .find(|r| r.reminder_id == custom.reminder_id)
        .expect("custom reminder kept");
    assert_eq!(kept.status, ReminderStatus::Pending);
    assert_eq!(kept.scheduled_for, custom_at);
}

#[tokio::test]
async fn due_date_before_issue_date_is_rejected() {
    let app = TestApp::spawn().await;
    let invoice = app.issue(sample_invoice("INV-212", Some(30))).await;

    let err = app
        .state
        .invoices
        .change_due_date(
            app.tenant_id,
            invoice.invoice_id,
            invoice.issue_date - Duration::days(1),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
}

#[tokio::test]
async fn free_plan_gets_no_automated_reminders() {
    let app = TestApp::spawn_with(TestOptions {
        plan: PlanTier::Free,
        ..TestOptions::default()
    })
    .await;
    let invoice = app.issue(sample_invoice("INV-213", Some(30))).await;

    let reminders = app
        .state
        .scheduler
        .list(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap();
    assert!(reminders.is_empty());

    let err = app
        .state
        .scheduler
        .create_default_set(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap_err();
    assert!(
        matches!(err, AppError::QuotaExceeded { ref feature } if feature == "automated_reminders")
    );
}

#[tokio::test]
async fn other_tenants_reminders_are_unauthorized() {
    let app = TestApp::spawn().await;
    let invoice = app.issue(sample_invoice("INV-214", Some(30))).await;
    let reminders = app
        .state
        .scheduler
        .list(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap();

    let err = app
        .state
        .scheduler
        .list(app.other_tenant_id, invoice.invoice_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Unauthorized(_)));

    let err = app
        .state
        .scheduler
        .cancel(app.other_tenant_id, reminders[0].reminder_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Unauthorized(_)));
}

#[tokio::test]
async fn send_now_rejects_cancelled_reminder() {
    let app = TestApp::spawn().await;
    let invoice = app.issue(sample_invoice("INV-215", Some(30))).await;
    let reminders = app
        .state
        .scheduler
        .list(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap();
    let target = reminders[0].reminder_id;
    app.state.scheduler.cancel(app.tenant_id, target).await.unwrap();

    let err = app
        .state
        .scheduler
        .send_now(app.tenant_id, target)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));
}
