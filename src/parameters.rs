//! Job parameters and the job identity derived from them.
//!
//! Two launches with the same job name and the same *identifying* parameters
//! refer to the same [`JobInstance`](crate::execution::JobInstance). Identity is
//! the [`JobKey`], a SHA-256 digest over a canonical encoding of the identifying
//! parameters, so it does not depend on insertion order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterValue {
    String(String),
    Long(i64),
    Double(f64),
    Timestamp(DateTime<Utc>),
}

impl ParameterValue {
    fn type_tag(&self) -> &'static str {
        match self {
            ParameterValue::String(_) => "string",
            ParameterValue::Long(_) => "long",
            ParameterValue::Double(_) => "double",
            ParameterValue::Timestamp(_) => "timestamp",
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::String(s) => f.write_str(s),
            ParameterValue::Long(v) => write!(f, "{v}"),
            // Bit pattern keeps -0.0 / NaN payloads distinct in the key.
            ParameterValue::Double(v) => write!(f, "{:016x}", v.to_bits()),
            ParameterValue::Timestamp(t) => write!(f, "{}", t.timestamp_millis()),
        }
    }
}

/// A parameter value plus whether it contributes to job identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameter {
    pub value: ParameterValue,
    pub identifying: bool,
}

/// Immutable set of named parameters for one launch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobParameters {
    params: BTreeMap<String, JobParameter>,
}

impl JobParameters {
    #[must_use]
    pub fn builder() -> JobParametersBuilder {
        JobParametersBuilder::default()
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.params.get(name).map(|p| &p.value)
    }

    #[must_use]
    pub fn get_string(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            ParameterValue::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_long(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            ParameterValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_double(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            ParameterValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_timestamp(&self, name: &str) -> Option<DateTime<Utc>> {
        match self.get(name)? {
            ParameterValue::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &JobParameter)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Identity digest over the identifying parameters, in key order.
    #[must_use]
    pub fn key(&self) -> JobKey {
        let mut hasher = Sha256::new();
        for (name, param) in self.params.iter().filter(|(_, p)| p.identifying) {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(param.value.type_tag().as_bytes());
            hasher.update(b":");
            hasher.update(param.value.to_string().as_bytes());
            hasher.update(b";");
        }
        JobKey(format!("{:x}", hasher.finalize()))
    }
}

/// Hex SHA-256 digest identifying a job instance's parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey(pub String);

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0[..self.0.len().min(16)])
    }
}

/// Fluent builder for [`JobParameters`]. Later additions under the same name win.
#[derive(Debug, Default)]
pub struct JobParametersBuilder {
    params: BTreeMap<String, JobParameter>,
}

impl JobParametersBuilder {
    fn add(mut self, name: impl Into<String>, value: ParameterValue, identifying: bool) -> Self {
        self.params
            .insert(name.into(), JobParameter { value, identifying });
        self
    }

    #[must_use]
    pub fn add_string(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add(name, ParameterValue::String(value.into()), true)
    }

    #[must_use]
    pub fn add_long(self, name: impl Into<String>, value: i64) -> Self {
        self.add(name, ParameterValue::Long(value), true)
    }

    #[must_use]
    pub fn add_double(self, name: impl Into<String>, value: f64) -> Self {
        self.add(name, ParameterValue::Double(value), true)
    }

    #[must_use]
    pub fn add_timestamp(self, name: impl Into<String>, value: DateTime<Utc>) -> Self {
        self.add(name, ParameterValue::Timestamp(value), true)
    }

    /// Adds a parameter that is passed to the run but does not change its identity.
    #[must_use]
    pub fn add_non_identifying(self, name: impl Into<String>, value: ParameterValue) -> Self {
        self.add(name, value, false)
    }

    #[must_use]
    pub fn build(self) -> JobParameters {
        JobParameters {
            params: self.params,
        }
    }
}

/// Checks required and permitted parameter names before a launch.
///
/// With an empty `optional` set any extra key is accepted.
#[derive(Debug, Clone, Default)]
pub struct ParametersValidator {
    required: BTreeSet<String>,
    optional: BTreeSet<String>,
}

impl ParametersValidator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn required<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required.extend(keys.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn optional<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional.extend(keys.into_iter().map(Into::into));
        self
    }

    /// # Errors
    ///
    /// Returns a description of every missing or unexpected key.
    pub fn validate(&self, params: &JobParameters) -> Result<(), String> {
        let missing: Vec<&str> = self
            .required
            .iter()
            .filter(|k| params.get(k).is_none())
            .map(String::as_str)
            .collect();

        let unexpected: Vec<&str> = if self.optional.is_empty() {
            Vec::new()
        } else {
            params
                .iter()
                .map(|(k, _)| k)
                .filter(|k| !self.required.contains(*k) && !self.optional.contains(*k))
                .collect()
        };

        let mut problems = Vec::new();
        if !missing.is_empty() {
            problems.push(format!("missing required keys {missing:?}"));
        }
        if !unexpected.is_empty() {
            problems.push(format!("unexpected keys {unexpected:?}"));
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn key_ignores_insertion_order() {
        let a = JobParameters::builder()
            .add_long("startAt", 1_700_000_000_000)
            .add_string("file", "customers.csv")
            .build();
        let b = JobParameters::builder()
            .add_string("file", "customers.csv")
            .add_long("startAt", 1_700_000_000_000)
            .build();
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn key_depends_on_values_and_types() {
        let long = JobParameters::builder().add_long("run", 1).build();
        let string = JobParameters::builder().add_string("run", "1").build();
        let other = JobParameters::builder().add_long("run", 2).build();
        assert_ne!(long.key(), string.key());
        assert_ne!(long.key(), other.key());
    }

    #[test]
    fn non_identifying_parameters_do_not_change_key() {
        let base = JobParameters::builder().add_long("run", 1).build();
        let extra = JobParameters::builder()
            .add_long("run", 1)
            .add_non_identifying("trace", ParameterValue::String("on".into()))
            .build();
        assert_eq!(base.key(), extra.key());
        assert_eq!(extra.get_string("trace"), Some("on"));
    }

    #[test]
    fn typed_getters() {
        let at = Utc.timestamp_millis_opt(1_000).single().unwrap();
        let p = JobParameters::builder()
            .add_timestamp("at", at)
            .add_double("ratio", 0.5)
            .build();
        assert_eq!(p.get_timestamp("at"), Some(at));
        assert_eq!(p.get_double("ratio"), Some(0.5));
        assert_eq!(p.get_long("ratio"), None);
    }

    #[test]
    fn validator_reports_missing_and_unexpected() {
        let v = ParametersValidator::new()
            .required(["input"])
            .optional(["startAt"]);
        let ok = JobParameters::builder()
            .add_string("input", "a.csv")
            .add_long("startAt", 1)
            .build();
        assert!(v.validate(&ok).is_ok());

        let bad = JobParameters::builder().add_long("other", 1).build();
        let err = v.validate(&bad).unwrap_err();
        assert!(err.contains("missing required keys [\"input\"]"));
        assert!(err.contains("unexpected keys [\"other\"]"));
    }
}
