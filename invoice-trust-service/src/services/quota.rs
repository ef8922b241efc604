//! Plan limits and rolling usage quotas.

use crate::models::{Feature, PlanCatalog, PlanLimits, QuotaCounter, QuotaUsage, Tenant, UsageLine};
use crate::services::metrics::record_quota_rejection;
use crate::services::store::TrustStore;
use chrono::{DateTime, Duration, Utc};
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;

pub struct QuotaGate {
    store: Arc<dyn TrustStore>,
    catalog: PlanCatalog,
    window: Duration,
}

impl QuotaGate {
    pub fn new(store: Arc<dyn TrustStore>, catalog: PlanCatalog, window: Duration) -> Self {
        Self {
            store,
            catalog,
            window,
        }
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    /// Whether the tenant may use `feature` once more. Fails closed.
    pub async fn check_limit(&self, tenant_id: Uuid, feature: Feature) -> bool {
        self.check_limit_at(tenant_id, feature, Utc::now()).await
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, feature = feature.as_str()))]
    pub async fn check_limit_at(
        &self,
        tenant_id: Uuid,
        feature: Feature,
        now: DateTime<Utc>,
    ) -> bool {
        match self.evaluate(tenant_id, feature, now).await {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!(error = %e, "Quota check failed, denying");
                false
            }
        }
    }

    /// Like `check_limit`, but rejects with `QuotaExceeded`.
    pub async fn require(&self, tenant_id: Uuid, feature: Feature) -> Result<(), AppError> {
        if self.check_limit(tenant_id, feature).await {
            Ok(())
        } else {
            record_quota_rejection(&tenant_id.to_string(), feature.as_str());
            Err(AppError::QuotaExceeded {
                feature: feature.as_str().to_string(),
            })
        }
    }

    /// Whether the tenant's plan includes `template_id`. Fails closed.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn can_use_template(&self, tenant_id: Uuid, template_id: &str) -> bool {
        match self.tenant_limits(tenant_id).await {
            Ok(Some((_, limits))) => limits.allows_template(template_id),
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "Template check failed, denying");
                false
            }
        }
    }

    /// Check and increment a windowed counter in one storage operation.
    pub async fn try_consume(
        &self,
        tenant_id: Uuid,
        feature: Feature,
        amount: i64,
    ) -> Result<QuotaCounter, AppError> {
        self.try_consume_at(tenant_id, feature, amount, Utc::now())
            .await
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, feature = feature.as_str()))]
    pub async fn try_consume_at(
        &self,
        tenant_id: Uuid,
        feature: Feature,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<QuotaCounter, AppError> {
        let kind = feature.counter().ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!(
                "Feature '{}' is not metered",
                feature.as_str()
            ))
        })?;
        if amount <= 0 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Amount must be positive"
            )));
        }

        let (_, limits) = self
            .tenant_limits(tenant_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Tenant not found")))?;
        let limit = limits.numeric(feature).and_then(|l| l.as_max());

        match self
            .store
            .try_increment(tenant_id, kind, amount, limit, now, self.window)
            .await?
        {
            Some(counter) => Ok(counter),
            None => {
                record_quota_rejection(&tenant_id.to_string(), feature.as_str());
                Err(AppError::QuotaExceeded {
                    feature: feature.as_str().to_string(),
                })
            }
        }
    }

    /// Current window usage against plan limits.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn usage(&self, tenant_id: Uuid) -> Result<QuotaUsage, AppError> {
        let now = Utc::now();
        let (tenant, limits) = self
            .tenant_limits(tenant_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Tenant not found")))?;

        let counter = self.store.load_counter(tenant_id, now, self.window).await?;
        let members = self.store.count_team_members(tenant_id).await?;

        Ok(QuotaUsage {
            tenant_id,
            plan: tenant.plan,
            window_started: counter.last_reset_date,
            window_ends: counter.last_reset_date + self.window,
            invoices: UsageLine {
                used: counter.invoices_count,
                limit: limits.invoices,
            },
            pdf_api: UsageLine {
                used: counter.pdf_api_usage,
                limit: limits.pdf_api,
            },
            ocr: UsageLine {
                used: counter.ocr_usage,
                limit: limits.ocr,
            },
            team_members: UsageLine {
                used: members,
                limit: limits.team_members,
            },
        })
    }

    async fn tenant_limits(&self, tenant_id: Uuid) -> Result<Option<(Tenant, PlanLimits)>, AppError> {
        let Some(tenant) = self.store.get_tenant(tenant_id).await? else {
            return Ok(None);
        };
        let Some(limits) = self.catalog.limits(tenant.plan).cloned() else {
            warn!(plan = tenant.plan.as_str(), "No limits configured for plan");
            return Ok(None);
        };
        Ok(Some((tenant, limits)))
    }

    async fn evaluate(
        &self,
        tenant_id: Uuid,
        feature: Feature,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let Some((_, limits)) = self.tenant_limits(tenant_id).await? else {
            return Ok(false);
        };

        if let Some(enabled) = limits.flag(feature) {
            return Ok(enabled);
        }

        let Some(limit) = limits.numeric(feature) else {
            return Ok(false);
        };

        let used = match feature.counter() {
            Some(kind) => self
                .store
                .load_counter(tenant_id, now, self.window)
                .await?
                .get(kind),
            None => self.store.count_team_members(tenant_id).await?,
        };

        Ok(limit.allows(used, 1))
    }
}
