//! GRBL `$` settings parsed from the stage startup file.
//!
//! The controller reports its configuration as `$<id>=<value>` lines. Only
//! the identifiers the host actually cares about are kept; everything else
//! in the file is passed over. Values stay "unset" until a matching line is
//! seen, and reads of unset values fail rather than defaulting.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ParamError {
    #[error("stage parameter '{0}' was not set by the startup configuration")]
    ParameterNotSet(String),
}

/// One named stage setting with its fixed GRBL identifier.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: &'static str,
    pub id: u16,
    pub value: Option<f64>,
}

/// Identifiers are GRBL's own and must never collide.
const KNOWN_PARAMETERS: &[(&str, u16)] = &[
    ("stepPulseLength", 0),
    ("stepIdleDelay", 1),
    ("axisDirection", 3),
    ("statusReport", 10),
    ("feedbackUnits", 13),
    ("xStepsPerMm", 100),
    ("yStepsPerMm", 101),
    ("xMaxRate", 110),
    ("yMaxRate", 111),
    ("xMaxAccel", 120),
    ("yMaxAccel", 121),
];

/// Read-only after [`ParameterStore::load`]; the dispatcher only ever reads.
#[derive(Debug, Clone)]
pub struct ParameterStore {
    parameters: Vec<Parameter>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self {
            parameters: KNOWN_PARAMETERS
                .iter()
                .map(|&(name, id)| Parameter {
                    name,
                    id,
                    value: None,
                })
                .collect(),
        }
    }

    /// Consume `$<id>=<value>` lines from startup/configuration text.
    ///
    /// Lines that do not match a known identifier, or whose value does not
    /// parse as a number, are ignored. Loading the same text twice lands on
    /// the same values.
    pub fn load(&mut self, text: &str) {
        for line in text.lines() {
            let line = line.trim();
            let Some(rest) = line.strip_prefix('$') else {
                continue;
            };
            let Some((id_str, value_str)) = rest.split_once('=') else {
                continue;
            };
            let Ok(id) = id_str.trim().parse::<u16>() else {
                continue;
            };
            let Ok(value) = value_str.trim().parse::<f64>() else {
                continue;
            };
            if let Some(param) = self.parameters.iter_mut().find(|p| p.id == id) {
                tracing::debug!("stage parameter {} ({}) = {}", param.name, id, value);
                param.value = Some(value);
            }
        }
    }

    /// Look up a parameter by name, failing if the configuration never
    /// populated it.
    pub fn get(&self, name: &str) -> Result<f64, ParamError> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .and_then(|p| p.value)
            .ok_or_else(|| ParamError::ParameterNotSet(name.to_string()))
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.get(name).is_ok()
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }
}

impl Default for ParameterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STARTUP: &str = "\
; machine defaults
$0=10
$110=800.0
$120=200
$999=42
not a setting
G90
";

    #[test]
    fn load_populates_matching_ids_only() {
        let mut store = ParameterStore::new();
        store.load(STARTUP);
        assert_eq!(store.get("stepPulseLength"), Ok(10.0));
        assert_eq!(store.get("xMaxRate"), Ok(800.0));
        assert_eq!(store.get("xMaxAccel"), Ok(200.0));
        assert!(!store.is_set("yMaxRate"));
    }

    #[test]
    fn get_before_load_fails() {
        let store = ParameterStore::new();
        assert_eq!(
            store.get("xMaxRate"),
            Err(ParamError::ParameterNotSet("xMaxRate".to_string()))
        );
    }

    #[test]
    fn load_is_idempotent() {
        let mut store = ParameterStore::new();
        store.load(STARTUP);
        let first: Vec<Option<f64>> = store.parameters().iter().map(|p| p.value).collect();
        store.load(STARTUP);
        let second: Vec<Option<f64>> = store.parameters().iter().map(|p| p.value).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn identifiers_are_unique() {
        let store = ParameterStore::new();
        for (i, a) in store.parameters().iter().enumerate() {
            for b in store.parameters().iter().skip(i + 1) {
                assert_ne!(a.id, b.id, "{} and {} share an id", a.name, b.name);
            }
        }
    }
}
