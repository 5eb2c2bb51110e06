use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

/// Admission-control bucket for a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserCategory {
    Anonymous,
    Registered,
    Api,
}

impl Display for UserCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            UserCategory::Anonymous => write!(f, "anonymous"),
            UserCategory::Registered => write!(f, "registered"),
            UserCategory::Api => write!(f, "api"),
        }
    }
}

impl FromStr for UserCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anonymous" => Ok(UserCategory::Anonymous),
            "registered" => Ok(UserCategory::Registered),
            "api" => Ok(UserCategory::Api),
            _ => Err(anyhow::anyhow!("Invalid user category: {}", s)),
        }
    }
}

/// Identity of whoever triggered a request, as asserted by the upstream gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
    pub role_level: i32,
    pub api_key_id: Option<Uuid>,
    pub category: UserCategory,
}

impl Caller {
    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            email: None,
            role_level: 0,
            api_key_id: None,
            category: UserCategory::Anonymous,
        }
    }

    pub fn registered(user_id: Uuid) -> Self {
        Self {
            user_id: Some(user_id),
            email: None,
            role_level: 1,
            api_key_id: None,
            category: UserCategory::Registered,
        }
    }

    /// Only callers with a user identity may spend dispatch quota.
    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }

    pub fn email_domain(&self) -> Option<&str> {
        self.email
            .as_deref()
            .and_then(|e| e.rsplit_once('@'))
            .map(|(_, domain)| domain)
    }
}

/// `requests` allowed per `duration_seconds`, evaluated as a sliding log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub requests: usize,
    pub duration_seconds: i64,
}

impl RateLimitRule {
    pub fn new(requests: usize, duration_seconds: i64) -> Self {
        Self {
            requests,
            duration_seconds,
        }
    }
}

impl FromStr for RateLimitRule {
    type Err = anyhow::Error;

    /// Parses `"<requests>/<seconds>"`, e.g. `"5/60"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (requests, seconds) = s
            .split_once('/')
            .ok_or_else(|| anyhow::anyhow!("Invalid rate limit rule '{}': expected requests/seconds", s))?;
        Ok(Self {
            requests: requests.trim().parse()?,
            duration_seconds: seconds.trim().parse()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_domain() {
        let mut caller = Caller::registered(Uuid::new_v4());
        caller.email = Some("analyst@newsroom.org".to_string());
        assert_eq!(caller.email_domain(), Some("newsroom.org"));
        assert!(Caller::anonymous().email_domain().is_none());
    }

    #[test]
    fn test_rate_limit_rule_parse() {
        let rule: RateLimitRule = "5/60".parse().unwrap();
        assert_eq!(rule, RateLimitRule::new(5, 60));
        assert!("5".parse::<RateLimitRule>().is_err());
        assert!("x/60".parse::<RateLimitRule>().is_err());
    }
}
