//! Subscription plans and their limits.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanTier {
    Free,
    Starter,
    Professional,
    Enterprise,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Starter => "starter",
            PlanTier::Professional => "professional",
            PlanTier::Enterprise => "enterprise",
        }
    }
}

impl FromStr for PlanTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(PlanTier::Free),
            "starter" => Ok(PlanTier::Starter),
            "professional" | "pro" => Ok(PlanTier::Professional),
            "enterprise" => Ok(PlanTier::Enterprise),
            _ => Err(format!("Invalid plan: {}", s)),
        }
    }
}

/// A metered feature or capability flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Invoices,
    PdfApi,
    Ocr,
    TeamMembers,
    Inventory,
    EmailIntegration,
    AutomatedReminders,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Invoices => "invoices",
            Feature::PdfApi => "pdf_api",
            Feature::Ocr => "ocr",
            Feature::TeamMembers => "team_members",
            Feature::Inventory => "inventory",
            Feature::EmailIntegration => "email_integration",
            Feature::AutomatedReminders => "automated_reminders",
        }
    }

    /// The rolling counter backing this feature, if it is window metered.
    pub fn counter(&self) -> Option<CounterKind> {
        match self {
            Feature::Invoices => Some(CounterKind::Invoices),
            Feature::PdfApi => Some(CounterKind::PdfApi),
            Feature::Ocr => Some(CounterKind::Ocr),
            _ => None,
        }
    }
}

impl FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invoices" => Ok(Feature::Invoices),
            "pdf_api" | "pdfApi" => Ok(Feature::PdfApi),
            "ocr" => Ok(Feature::Ocr),
            "team_members" | "teamMembers" => Ok(Feature::TeamMembers),
            "inventory" => Ok(Feature::Inventory),
            "email_integration" | "emailIntegration" => Ok(Feature::EmailIntegration),
            "automated_reminders" | "automatedReminders" => Ok(Feature::AutomatedReminders),
            _ => Err(format!("Unknown feature: {}", s)),
        }
    }
}

/// Windowed usage counters kept per tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    Invoices,
    PdfApi,
    Ocr,
}

impl CounterKind {
    pub fn column(&self) -> &'static str {
        match self {
            CounterKind::Invoices => "invoices_count",
            CounterKind::PdfApi => "pdf_api_usage",
            CounterKind::Ocr => "ocr_usage",
        }
    }
}

/// Numeric plan limit. Serialises as a number, or `null` when unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Limit {
    Max(i64),
    Unlimited,
}

impl Limit {
    /// Whether `used + amount` stays within the limit.
    pub fn allows(&self, used: i64, amount: i64) -> bool {
        match self {
            Limit::Unlimited => true,
            Limit::Max(max) => used.saturating_add(amount) <= *max,
        }
    }

    pub fn as_max(&self) -> Option<i64> {
        match self {
            Limit::Max(max) => Some(*max),
            Limit::Unlimited => None,
        }
    }
}

pub const ALL_TEMPLATES: &str = "all";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanLimits {
    pub invoices: Limit,
    pub pdf_api: Limit,
    pub ocr: Limit,
    pub team_members: Limit,
    pub inventory: bool,
    pub email_integration: bool,
    pub automated_reminders: bool,
    /// Allowed template ids; `"all"` permits any.
    pub templates: Vec<String>,
}

impl PlanLimits {
    pub fn numeric(&self, feature: Feature) -> Option<Limit> {
        match feature {
            Feature::Invoices => Some(self.invoices),
            Feature::PdfApi => Some(self.pdf_api),
            Feature::Ocr => Some(self.ocr),
            Feature::TeamMembers => Some(self.team_members),
            _ => None,
        }
    }

    pub fn flag(&self, feature: Feature) -> Option<bool> {
        match feature {
            Feature::Inventory => Some(self.inventory),
            Feature::EmailIntegration => Some(self.email_integration),
            Feature::AutomatedReminders => Some(self.automated_reminders),
            _ => None,
        }
    }

    pub fn allows_template(&self, template_id: &str) -> bool {
        self.templates
            .iter()
            .any(|t| t == ALL_TEMPLATES || t == template_id)
    }
}

/// Plan limits by tier.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: HashMap<PlanTier, PlanLimits>,
}

fn templates(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

impl Default for PlanCatalog {
    fn default() -> Self {
        let mut plans = HashMap::new();
        plans.insert(
            PlanTier::Free,
            PlanLimits {
                invoices: Limit::Max(10),
                pdf_api: Limit::Max(0),
                ocr: Limit::Max(0),
                team_members: Limit::Max(1),
                inventory: false,
                email_integration: false,
                automated_reminders: false,
                templates: templates(&["classic"]),
            },
        );
        plans.insert(
            PlanTier::Starter,
            PlanLimits {
                invoices: Limit::Max(100),
                pdf_api: Limit::Max(50),
                ocr: Limit::Max(20),
                team_members: Limit::Max(3),
                inventory: true,
                email_integration: false,
                automated_reminders: true,
                templates: templates(&["classic", "modern", "minimal"]),
            },
        );
        plans.insert(
            PlanTier::Professional,
            PlanLimits {
                invoices: Limit::Max(1000),
                pdf_api: Limit::Max(500),
                ocr: Limit::Max(200),
                team_members: Limit::Max(10),
                inventory: true,
                email_integration: true,
                automated_reminders: true,
                templates: templates(&[ALL_TEMPLATES]),
            },
        );
        plans.insert(
            PlanTier::Enterprise,
            PlanLimits {
                invoices: Limit::Unlimited,
                pdf_api: Limit::Unlimited,
                ocr: Limit::Unlimited,
                team_members: Limit::Unlimited,
                inventory: true,
                email_integration: true,
                automated_reminders: true,
                templates: templates(&[ALL_TEMPLATES]),
            },
        );
        Self { plans }
    }
}

impl PlanCatalog {
    pub fn limits(&self, tier: PlanTier) -> Option<&PlanLimits> {
        self.plans.get(&tier)
    }

    /// Replace the limits of one tier.
    pub fn with_plan(mut self, tier: PlanTier, limits: PlanLimits) -> Self {
        self.plans.insert(tier, limits);
        self
    }
}
