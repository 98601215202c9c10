use super::config::ConfigError;
use phf::phf_map;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DebugMode {
    Nan,
    InputChange,
    LinearizeDataChange,
    MinMaxGrad,
    MinMaxCouplings,
}

static DEBUG_MODES: phf::Map<&'static str, DebugMode> = phf_map! {
    "nan" => DebugMode::Nan,
    "input_change" => DebugMode::InputChange,
    "linearize_data_change" => DebugMode::LinearizeDataChange,
    "min_max_grad" => DebugMode::MinMaxGrad,
    "min_max_couplings" => DebugMode::MinMaxCouplings,
};

impl DebugMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DebugMode::Nan => "nan",
            DebugMode::InputChange => "input_change",
            DebugMode::LinearizeDataChange => "linearize_data_change",
            DebugMode::MinMaxGrad => "min_max_grad",
            DebugMode::MinMaxCouplings => "min_max_couplings",
        }
    }
}

/// Extra runtime checks enabled on a discipline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugFlags {
    pub nan: bool,
    pub input_change: bool,
    pub linearize_data_change: bool,
    pub min_max_grad: bool,
    pub min_max_couplings: bool,
}

impl DebugFlags {
    pub fn all() -> Self {
        Self {
            nan: true,
            input_change: true,
            linearize_data_change: true,
            min_max_grad: true,
            min_max_couplings: true,
        }
    }

    /// Parses a debug mode name. An empty name or `"all"` enables every check.
    pub fn from_mode(mode: &str) -> Result<Self, ConfigError> {
        if mode.is_empty() || mode == "all" {
            return Ok(Self::all());
        }
        let parsed = DEBUG_MODES
            .get(mode)
            .copied()
            .ok_or_else(|| ConfigError::UnknownDebugMode(mode.to_string()))?;
        let mut flags = Self::default();
        flags.enable(parsed);
        Ok(flags)
    }

    pub fn enable(&mut self, mode: DebugMode) {
        match mode {
            DebugMode::Nan => self.nan = true,
            DebugMode::InputChange => self.input_change = true,
            DebugMode::LinearizeDataChange => self.linearize_data_change = true,
            DebugMode::MinMaxGrad => self.min_max_grad = true,
            DebugMode::MinMaxCouplings => self.min_max_couplings = true,
        }
    }

    pub fn union(self, other: Self) -> Self {
        Self {
            nan: self.nan || other.nan,
            input_change: self.input_change || other.input_change,
            linearize_data_change: self.linearize_data_change || other.linearize_data_change,
            min_max_grad: self.min_max_grad || other.min_max_grad,
            min_max_couplings: self.min_max_couplings || other.min_max_couplings,
        }
    }

    pub fn any(&self) -> bool {
        *self != Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_modes_enable_a_single_check() {
        let flags = DebugFlags::from_mode("nan").unwrap();
        assert!(flags.nan);
        assert!(!flags.input_change);
        assert!(flags.any());
    }

    #[test]
    fn empty_mode_enables_everything() {
        assert_eq!(DebugFlags::from_mode("").unwrap(), DebugFlags::all());
        assert_eq!(DebugFlags::from_mode("all").unwrap(), DebugFlags::all());
    }

    #[test]
    fn unknown_mode_is_a_configuration_error() {
        assert!(matches!(
            DebugFlags::from_mode("verbose"),
            Err(ConfigError::UnknownDebugMode(m)) if m == "verbose"
        ));
    }
}
