use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::identity::SEPARATOR;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParameterError {
    #[error("{field} must not be empty")]
    EmptyField { field: &'static str },
    #[error("{field} '{value}' contains the run-name separator '_'")]
    SeparatorInField { field: &'static str, value: String },
    #[error("{field} '{value}' is not a plain directory name (no '/', '\\' or leading '.')")]
    UnsafeName { field: &'static str, value: String },
    #[error("attack rate {0} is outside 0..=100")]
    AttackRateOutOfRange(u32),
    #[error("trust-enabled runs need both lambda and gamma (lambda={lambda:?}, gamma={gamma:?})")]
    MissingTrustWeights {
        lambda: Option<u32>,
        gamma: Option<u32>,
    },
    #[error("trust-disabled runs must not carry lambda/gamma (lambda={lambda:?}, gamma={gamma:?})")]
    UnexpectedTrustWeights {
        lambda: Option<u32>,
        gamma: Option<u32>,
    },
}

/// One point of the sweep design. Fields are private so every tuple in
/// circulation has passed [`ParameterTuple::new`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ParameterTuple {
    topology: String,
    scenario: String,
    attack_rate: u32,
    trust_enabled: bool,
    lambda: Option<u32>,
    gamma: Option<u32>,
    seed: u64,
}

impl ParameterTuple {
    pub fn new(
        topology: impl Into<String>,
        scenario: impl Into<String>,
        attack_rate: u32,
        trust_enabled: bool,
        lambda: Option<u32>,
        gamma: Option<u32>,
        seed: u64,
    ) -> Result<Self, ParameterError> {
        let topology = topology.into();
        let scenario = scenario.into();
        check_name("topology", &topology)?;
        check_name("scenario", &scenario)?;
        if attack_rate > 100 {
            return Err(ParameterError::AttackRateOutOfRange(attack_rate));
        }
        if trust_enabled && (lambda.is_none() || gamma.is_none()) {
            return Err(ParameterError::MissingTrustWeights { lambda, gamma });
        }
        if !trust_enabled && (lambda.is_some() || gamma.is_some()) {
            return Err(ParameterError::UnexpectedTrustWeights { lambda, gamma });
        }
        Ok(Self {
            topology,
            scenario,
            attack_rate,
            trust_enabled,
            lambda,
            gamma,
            seed,
        })
    }

    pub fn trust_off(
        topology: impl Into<String>,
        scenario: impl Into<String>,
        attack_rate: u32,
        seed: u64,
    ) -> Result<Self, ParameterError> {
        Self::new(topology, scenario, attack_rate, false, None, None, seed)
    }

    pub fn trust_on(
        topology: impl Into<String>,
        scenario: impl Into<String>,
        attack_rate: u32,
        lambda: u32,
        gamma: u32,
        seed: u64,
    ) -> Result<Self, ParameterError> {
        Self::new(
            topology,
            scenario,
            attack_rate,
            true,
            Some(lambda),
            Some(gamma),
            seed,
        )
    }

    pub fn topology(&self) -> &str {
        &self.topology
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn attack_rate(&self) -> u32 {
        self.attack_rate
    }

    pub fn trust_enabled(&self) -> bool {
        self.trust_enabled
    }

    pub fn lambda(&self) -> Option<u32> {
        self.lambda
    }

    pub fn gamma(&self) -> Option<u32> {
        self.gamma
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn condition(&self) -> ConditionKey {
        ConditionKey {
            topology: self.topology.clone(),
            attack_rate: self.attack_rate,
            trust_enabled: self.trust_enabled,
            lambda: self.lambda,
            gamma: self.gamma,
        }
    }
}

/// Topology and scenario names end up inside run directory names, so they
/// must stay a single path component.
pub fn check_name(field: &'static str, value: &str) -> Result<(), ParameterError> {
    if value.is_empty() {
        return Err(ParameterError::EmptyField { field });
    }
    if value.contains(SEPARATOR) {
        return Err(ParameterError::SeparatorInField {
            field,
            value: value.to_string(),
        });
    }
    if value.starts_with('.') || value.contains(['/', '\\']) {
        return Err(ParameterError::UnsafeName {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Experimental condition: everything in a tuple except the seed (and the
/// scenario label, which is a function of the attack rate).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConditionKey {
    pub topology: String,
    pub attack_rate: u32,
    pub trust_enabled: bool,
    pub lambda: Option<u32>,
    pub gamma: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Planned,
    Completed,
    Timeout,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Planned => "planned",
            RunStatus::Completed => "completed",
            RunStatus::Timeout => "timeout",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Planned)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "planned" => Ok(RunStatus::Planned),
            "completed" => Ok(RunStatus::Completed),
            "timeout" => Ok(RunStatus::Timeout),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// Renders an optional trust weight the way tables and run names store it.
pub fn na_or<T: fmt::Display>(value: Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "NA".to_string(),
    }
}

pub fn parse_na(raw: &str) -> Option<Option<u32>> {
    let raw = raw.trim();
    if raw == "NA" {
        return Some(None);
    }
    raw.parse::<u32>().ok().map(Some)
}

/// serde adapter for `Option<u32>` columns stored as a number or `NA`.
pub mod na_option {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u32>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::na_or(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_na(&raw)
            .ok_or_else(|| de::Error::custom(format!("expected integer or NA, got '{}'", raw)))
    }
}

/// serde adapter for booleans stored as `0`/`1`.
pub mod flag01 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        let raw = String::deserialize(d)?;
        match raw.trim() {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(de::Error::custom(format!("expected 0 or 1, got '{}'", other))),
        }
    }
}
