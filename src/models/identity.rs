use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Subscription tier, totally ordered from least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl Plan {
    pub fn as_str(self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Starter => "starter",
            Plan::Pro => "pro",
            Plan::Enterprise => "enterprise",
        }
    }

    /// Whether this plan meets or exceeds `required`.
    pub fn satisfies(self, required: Plan) -> bool {
        self >= required
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Plan::Free),
            "starter" => Ok(Plan::Starter),
            "pro" => Ok(Plan::Pro),
            "enterprise" => Ok(Plan::Enterprise),
            other => Err(format!("unknown plan '{other}'")),
        }
    }
}

/// Caller identity resolved from a bearer credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub user_id: String,
    pub plan: Plan,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, plan: Plan) -> Self {
        Self {
            user_id: user_id.into(),
            plan,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_total_order() {
        assert!(Plan::Free < Plan::Starter);
        assert!(Plan::Starter < Plan::Pro);
        assert!(Plan::Pro < Plan::Enterprise);
        assert!(Plan::Enterprise.satisfies(Plan::Pro));
        assert!(Plan::Pro.satisfies(Plan::Pro));
        assert!(!Plan::Free.satisfies(Plan::Pro));
    }

    #[test]
    fn test_plan_parse() {
        assert_eq!("PRO".parse::<Plan>().unwrap(), Plan::Pro);
        assert_eq!(" starter ".parse::<Plan>().unwrap(), Plan::Starter);
        assert!("platinum".parse::<Plan>().is_err());
    }

    #[test]
    fn test_plan_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Plan::Enterprise).unwrap(), "\"enterprise\"");
    }
}
