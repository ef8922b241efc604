//! Periodic reminder dispatch.

use crate::config::DispatchConfig;
use crate::models::{ClaimScope, DispatchOutcome, PlanCatalog, Reminder};
use crate::services::delivery::{DeliveryError, DeliveryRouter};
use crate::services::message::{MessageRenderer, SenderIdentity};
use crate::services::metrics::{record_dispatch_run, record_reminder_transition};
use crate::services::store::TrustStore;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub sent: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl DispatchSummary {
    fn record(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Sent { .. } => self.sent += 1,
            DispatchOutcome::Failed { .. } => self.failed += 1,
            DispatchOutcome::Skipped { .. } => self.skipped += 1,
        }
    }
}

pub struct ReminderDispatchWorker {
    store: Arc<dyn TrustStore>,
    router: Arc<DeliveryRouter>,
    renderer: MessageRenderer,
    catalog: PlanCatalog,
    config: DispatchConfig,
    run_lock: Mutex<()>,
}

impl ReminderDispatchWorker {
    pub fn new(
        store: Arc<dyn TrustStore>,
        router: Arc<DeliveryRouter>,
        renderer: MessageRenderer,
        catalog: PlanCatalog,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            router,
            renderer,
            catalog,
            config,
            run_lock: Mutex::new(()),
        }
    }

    pub async fn run(&self) -> Result<DispatchSummary, AppError> {
        self.run_at(Utc::now()).await
    }

    /// Dispatch every due reminder once. A run that finds another run in
    /// progress in this process returns an empty summary.
    #[instrument(skip(self))]
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<DispatchSummary, AppError> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            info!("Dispatch run already in progress, skipping");
            return Ok(DispatchSummary::default());
        };

        let started = Instant::now();
        let due = self
            .store
            .list_due_reminders(now, self.config.batch_size.max(1))
            .await?;
        debug!(due = due.len(), "Loaded due reminders");

        let results: Vec<(Uuid, Result<Option<DispatchOutcome>, AppError>)> = stream::iter(due)
            .map(|reminder| async move {
                let id = reminder.reminder_id;
                (id, self.process(id, ClaimScope::Due, now).await)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut summary = DispatchSummary::default();
        for (reminder_id, result) in results {
            match result {
                Ok(Some(outcome)) => summary.record(&outcome),
                Ok(None) => debug!(reminder_id = %reminder_id, "Reminder claimed elsewhere"),
                Err(e) => error!(
                    reminder_id = %reminder_id,
                    error = %e,
                    "Reminder dispatch errored, lease will expire"
                ),
            }
        }

        record_dispatch_run(
            started.elapsed().as_secs_f64(),
            summary.sent,
            summary.failed,
            summary.skipped,
        );
        info!(
            sent = summary.sent,
            failed = summary.failed,
            skipped = summary.skipped,
            "Dispatch run completed"
        );
        Ok(summary)
    }

    /// Claim and dispatch one reminder. `None` when it could not be claimed.
    #[instrument(skip(self), fields(reminder_id = %reminder_id))]
    pub async fn dispatch_one(
        &self,
        reminder_id: Uuid,
        scope: ClaimScope,
    ) -> Result<Option<Reminder>, AppError> {
        let now = Utc::now();
        let Some(claimed) = self
            .store
            .claim_reminder(reminder_id, scope, now, self.config.claim_lease())
            .await?
        else {
            return Ok(None);
        };

        let outcome = self.deliver(&claimed).await?;
        self.complete(reminder_id, &outcome).await
    }

    async fn process(
        &self,
        reminder_id: Uuid,
        scope: ClaimScope,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchOutcome>, AppError> {
        let Some(claimed) = self
            .store
            .claim_reminder(reminder_id, scope, now, self.config.claim_lease())
            .await?
        else {
            return Ok(None);
        };

        let outcome = self.deliver(&claimed).await?;
        Ok(self.complete(reminder_id, &outcome).await?.map(|_| outcome))
    }

    /// Record the outcome, retrying storage errors for up to
    /// `completion_retry`. A delivered reminder whose outcome is never
    /// recorded stays marked as attempted and is not sent again by
    /// scheduled runs.
    async fn complete(
        &self,
        reminder_id: Uuid,
        outcome: &DispatchOutcome,
    ) -> Result<Option<Reminder>, AppError> {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(2),
            max_elapsed_time: Some(self.config.completion_retry()),
            ..Default::default()
        };

        let updated = retry(policy, move || async move {
            self.store
                .complete_reminder(reminder_id, outcome, Utc::now())
                .await
                .map_err(|e| {
                    warn!(reminder_id = %reminder_id, error = %e, "Failed to record outcome, retrying");
                    backoff::Error::transient(e)
                })
        })
        .await
        .map_err(|e| {
            error!(
                reminder_id = %reminder_id,
                status = outcome.status().as_str(),
                error = %e,
                "Outcome not recorded, reminder held for manual review"
            );
            e
        })?;
        if updated.is_some() {
            record_reminder_transition(outcome.status().as_str(), 1);
        } else {
            warn!(reminder_id = %reminder_id, "Claim was lost before completion");
        }
        Ok(updated)
    }

    /// Decide and perform delivery for a claimed reminder. Storage errors
    /// propagate and leave the claim to expire.
    async fn deliver(&self, reminder: &Reminder) -> Result<DispatchOutcome, AppError> {
        let Some(invoice) = self.store.get_invoice(reminder.invoice_id).await? else {
            return Ok(DispatchOutcome::Skipped {
                reason: "Invoice no longer exists".to_string(),
            });
        };
        if invoice.payment_status.is_settled() {
            return Ok(DispatchOutcome::Skipped {
                reason: format!("Invoice is {}", invoice.payment_status.as_str()),
            });
        }

        let Some(tenant) = self.store.get_tenant(reminder.tenant_id).await? else {
            return Ok(DispatchOutcome::Skipped {
                reason: "Tenant no longer exists".to_string(),
            });
        };

        let integrations = &tenant.settings.integrations;
        if !integrations.channel_enabled(reminder.channel) {
            let error = DeliveryError::NotEnabled(format!(
                "{} integration is not enabled for this tenant",
                reminder.channel.as_str()
            ));
            return Ok(DispatchOutcome::Failed {
                error: error.to_string(),
            });
        }

        let Some(recipient) = self.renderer.recipient(reminder.channel, &invoice) else {
            let error = DeliveryError::InvalidRecipient(format!(
                "buyer has no address for {}",
                reminder.channel.as_str()
            ));
            return Ok(DispatchOutcome::Failed {
                error: error.to_string(),
            });
        };

        let branded = integrations.email_enabled
            && self
                .catalog
                .limits(tenant.plan)
                .map(|l| l.email_integration)
                .unwrap_or(false);
        let sender = if branded {
            SenderIdentity {
                name: integrations.sender_name.clone(),
                reply_to: integrations.reply_to.clone(),
            }
        } else {
            SenderIdentity::default()
        };

        let message = self.renderer.render(reminder, &invoice, &sender);
        if !self
            .store
            .mark_delivery_attempt(reminder.reminder_id, Utc::now())
            .await?
        {
            return Err(AppError::InvalidState(anyhow::anyhow!(
                "Claim on reminder lapsed before delivery"
            )));
        }

        let result = self
            .router
            .send(reminder.channel, recipient, &message)
            .await;

        Ok(if result.success {
            DispatchOutcome::Sent {
                provider_message_id: result.provider_message_id,
            }
        } else {
            DispatchOutcome::Failed {
                error: result
                    .error
                    .unwrap_or_else(|| "Delivery failed".to_string()),
            }
        })
    }

    /// Run on the configured interval until `shutdown` is cancelled.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                interval_secs = self.config.interval().as_secs(),
                "Reminder dispatch worker started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Reminder dispatch worker stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.run().await {
                            error!(error = %e, "Dispatch run failed");
                        }
                    }
                }
            }
        })
    }
}
