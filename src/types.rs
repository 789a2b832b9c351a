use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Backoff policy applied between delivery attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// Delay grows linearly with the attempt index.
    Linear,
    /// Delay doubles with every attempt.
    Exponential,
    /// Fixed delay between attempts.
    #[default]
    Constant,
}

/// Delivery behavior for a trigger's target.
///
/// `backoff_delay` is an ISO-8601 period (e.g. `PT1S`). It is parsed once
/// per reconciliation, not per dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliveryOptions {
    /// Number of retry attempts after the initial attempt. 0 disables retries.
    pub retry: Option<u32>,

    /// Backoff policy between attempts.
    pub backoff_policy: Option<BackoffPolicy>,

    /// ISO-8601 period between attempts.
    pub backoff_delay: Option<String>,

    /// Secondary destination for events that exhausted delivery.
    #[serde(rename = "deadLetterURL")]
    pub dead_letter_url: Option<String>,
}

impl DeliveryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retry count.
    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set the backoff policy and delay period.
    pub fn with_backoff(mut self, policy: BackoffPolicy, delay: impl Into<String>) -> Self {
        self.backoff_policy = Some(policy);
        self.backoff_delay = Some(delay.into());
        self
    }

    /// Set the dead-letter URL.
    pub fn with_dead_letter_url(mut self, url: impl Into<String>) -> Self {
        self.dead_letter_url = Some(url.into());
        self
    }
}

/// Destination for event delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Target URL for delivery.
    pub url: String,

    /// Optional delivery options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_options: Option<DeliveryOptions>,
}

impl Target {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            delivery_options: None,
        }
    }

    pub fn with_delivery_options(mut self, options: DeliveryOptions) -> Self {
        self.delivery_options = Some(options);
        self
    }
}

/// Declarative filter expression.
///
/// Exact, Prefix and Suffix carry a single attribute/value pair; the map
/// shape mirrors the configuration schema and is validated at
/// materialization time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterExpr {
    /// Attribute equals value, byte-exact.
    Exact(HashMap<String, String>),
    /// Attribute starts with value.
    Prefix(HashMap<String, String>),
    /// Attribute ends with value.
    Suffix(HashMap<String, String>),
    /// All sub-expressions pass. Empty list passes.
    All(Vec<FilterExpr>),
    /// At least one sub-expression passes. Empty list fails.
    Any(Vec<FilterExpr>),
    /// Negation of the sub-expression.
    Not(Box<FilterExpr>),
    /// CloudEvents SQL boolean expression.
    Cesql(String),
}

impl FilterExpr {
    /// Convenience constructor for an exact-match expression.
    pub fn exact(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        FilterExpr::Exact(HashMap::from([(attribute.into(), value.into())]))
    }

    /// Convenience constructor for a prefix-match expression.
    pub fn prefix(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        FilterExpr::Prefix(HashMap::from([(attribute.into(), value.into())]))
    }

    /// Convenience constructor for a suffix-match expression.
    pub fn suffix(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        FilterExpr::Suffix(HashMap::from([(attribute.into(), value.into())]))
    }
}

/// Named binding of filters, target and delivery options.
///
/// The trigger name is the key in the configuration snapshot. Triggers are
/// immutable per revision; reconciliation compares them structurally to
/// decide whether a subscriber needs recompilation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    /// Filter expressions, AND-combined.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FilterExpr>,

    /// Delivery target.
    pub target: Target,
}

impl Trigger {
    pub fn new(target: Target) -> Self {
        Self {
            filters: Vec::new(),
            target,
        }
    }

    pub fn with_filter(mut self, filter: FilterExpr) -> Self {
        self.filters.push(filter);
        self
    }
}

/// Authentication required of ingest clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IngestAuth {
    /// No authentication.
    #[default]
    None,
    /// Bearer token.
    Token { token: String },
    /// HTTP basic authentication.
    Basic { username: String, password: String },
}

/// Ingest server parameters carried in the configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub auth: IngestAuth,
}

/// Full configuration snapshot delivered by the watcher.
///
/// Trigger names are unique by construction (map keys); ordering is
/// irrelevant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub triggers: HashMap<String, Trigger>,
    pub ingest: IngestConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_decodes_from_yaml() {
        let yaml = r#"
triggers:
  orders:
    filters:
      - exact:
          type: com.example.order.created
    target:
      url: https://example.com/orders
      deliveryOptions:
        retry: 3
        backoffPolicy: constant
        backoffDelay: PT1S
        deadLetterURL: https://example.com/dlq
"#;
        let config: BrokerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.triggers.len(), 1);

        let trigger = &config.triggers["orders"];
        assert_eq!(trigger.filters.len(), 1);
        assert_eq!(
            trigger.filters[0],
            FilterExpr::exact("type", "com.example.order.created")
        );
        assert_eq!(trigger.target.url, "https://example.com/orders");

        let options = trigger.target.delivery_options.as_ref().unwrap();
        assert_eq!(options.retry, Some(3));
        assert_eq!(options.backoff_policy, Some(BackoffPolicy::Constant));
        assert_eq!(options.backoff_delay.as_deref(), Some("PT1S"));
        assert_eq!(
            options.dead_letter_url.as_deref(),
            Some("https://example.com/dlq")
        );
    }

    #[test]
    fn test_nested_filter_expressions_decode() {
        let yaml = r#"
filters:
  - any:
      - exact:
          type: a
      - not:
          prefix:
            source: internal/
  - cesql: "type = 'a' AND source = 'b'"
target:
  url: https://example.com/t
"#;
        let trigger: Trigger = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(trigger.filters.len(), 2);
        assert!(matches!(trigger.filters[0], FilterExpr::Any(ref inner) if inner.len() == 2));
        assert!(matches!(trigger.filters[1], FilterExpr::Cesql(_)));
    }

    #[test]
    fn test_ingest_auth_decodes() {
        let yaml = r#"
ingest:
  auth:
    type: token
    token: s3cr3t
"#;
        let config: BrokerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.ingest.auth,
            IngestAuth::Token {
                token: "s3cr3t".to_string()
            }
        );
    }

    #[test]
    fn test_empty_snapshot_defaults() {
        let config: BrokerConfig = serde_yaml::from_str("{}").unwrap();
        assert!(config.triggers.is_empty());
        assert_eq!(config.ingest.auth, IngestAuth::None);
    }

    #[test]
    fn test_trigger_structural_equality() {
        let a = Trigger::new(Target::new("https://example.com/t"))
            .with_filter(FilterExpr::exact("type", "x"));
        let b = a.clone();
        assert_eq!(a, b);

        let mut c = a.clone();
        c.target.url = "https://example.com/other".to_string();
        assert_ne!(a, c);
    }
}
