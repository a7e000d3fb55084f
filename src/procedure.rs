//! Stored procedure calls.
//!
//! A call addresses its parameters either by name or by position. Which one is decided by the first registration;
//! registering a parameter of the other kind afterwards is rejected.

use std::collections::BTreeMap;
use std::fmt::Display;

use crate::error::OrmError;
use crate::error::Result;
use crate::types::Datum;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParameterKey {
    Named(String),
    /// One-based position.
    Positional(usize),
}

impl Display for ParameterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParameterKey::Named(name) => write!(f, ":{name}"),
            ParameterKey::Positional(pos) => write!(f, "?{pos}"),
        }
    }
}

impl From<&str> for ParameterKey {
    fn from(value: &str) -> Self {
        ParameterKey::Named(value.to_string())
    }
}

impl From<usize> for ParameterKey {
    fn from(value: usize) -> Self {
        ParameterKey::Positional(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParameterMode {
    In,
    Out,
    InOut,
}

impl ParameterMode {
    #[inline]
    pub fn accepts_input(&self) -> bool {
        matches!(self, ParameterMode::In | ParameterMode::InOut)
    }

    #[inline]
    pub fn produces_output(&self) -> bool {
        matches!(self, ParameterMode::Out | ParameterMode::InOut)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ParameterStrategy {
    #[default]
    Unknown,
    Named,
    Positional,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParameterRegistration {
    key:   ParameterKey,
    mode:  ParameterMode,
    value: Option<Datum>,
}

impl ParameterRegistration {
    #[inline]
    pub fn key(&self) -> &ParameterKey {
        &self.key
    }

    #[inline]
    pub fn mode(&self) -> ParameterMode {
        self.mode
    }

    #[inline]
    pub fn value(&self) -> Option<&Datum> {
        self.value.as_ref()
    }
}

#[derive(Clone, Debug)]
pub struct ProcedureCall {
    name:       String,
    strategy:   ParameterStrategy,
    parameters: Vec<ParameterRegistration>,
}

impl ProcedureCall {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name:       name.into(),
            strategy:   ParameterStrategy::Unknown,
            parameters: Vec::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn strategy(&self) -> ParameterStrategy {
        self.strategy
    }

    #[inline]
    pub fn parameters(&self) -> &[ParameterRegistration] {
        &self.parameters
    }

    pub fn register_parameter(&mut self, name: impl Into<String>, mode: ParameterMode) -> Result<&mut Self> {
        self.register(ParameterKey::Named(name.into()), mode)
    }

    pub fn register_positional_parameter(&mut self, position: usize, mode: ParameterMode) -> Result<&mut Self> {
        if position == 0 {
            return Err(OrmError::IllegalArgument(
                "procedure parameter positions start at 1".to_string(),
            ));
        }
        self.register(ParameterKey::Positional(position), mode)
    }

    fn register(&mut self, key: ParameterKey, mode: ParameterMode) -> Result<&mut Self> {
        let strategy = match key {
            ParameterKey::Named(_) => ParameterStrategy::Named,
            ParameterKey::Positional(_) => ParameterStrategy::Positional,
        };
        if self.strategy == ParameterStrategy::Unknown {
            self.strategy = strategy;
        }
        else if self.strategy != strategy {
            return Err(OrmError::IllegalArgument(format!(
                "cannot mix named and positional parameters in call to '{}'",
                self.name
            )));
        }
        if self.parameters.iter().any(|p| p.key == key) {
            return Err(OrmError::IllegalArgument(format!(
                "parameter {key} of '{}' is already registered",
                self.name
            )));
        }
        self.parameters.push(ParameterRegistration { key, mode, value: None });
        Ok(self)
    }

    /// Binds an input value to a registered parameter.
    pub fn bind(&mut self, key: impl Into<ParameterKey>, value: impl Into<Datum>) -> Result<&mut Self> {
        let key = key.into();
        let name = self.name.clone();
        let registration = self
            .parameters
            .iter_mut()
            .find(|p| p.key == key)
            .ok_or_else(|| OrmError::IllegalArgument(format!("parameter {key} of '{name}' is not registered")))?;
        if !registration.mode.accepts_input() {
            return Err(OrmError::IllegalArgument(format!(
                "parameter {key} of '{name}' is an output parameter"
            )));
        }
        registration.value = Some(value.into());
        Ok(self)
    }

    /// Fails when an input parameter has no value.
    pub fn validate(&self) -> Result<()> {
        match self.parameters.iter().find(|p| p.mode.accepts_input() && p.value.is_none()) {
            Some(p) => Err(OrmError::IllegalState(format!(
                "input parameter {} of '{}' has no value bound",
                p.key, self.name
            ))),
            None => Ok(()),
        }
    }
}

/// What a procedure execution returned.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProcedureOutputs {
    pub outputs:      BTreeMap<ParameterKey, Datum>,
    pub rows:         Vec<Vec<Datum>>,
    pub update_count: Option<u64>,
}

impl ProcedureOutputs {
    pub fn output(&self, key: impl Into<ParameterKey>) -> Result<&Datum> {
        let key = key.into();
        self.outputs
            .get(&key)
            .ok_or_else(|| OrmError::IllegalArgument(format!("no output parameter {key}")))
    }
}
