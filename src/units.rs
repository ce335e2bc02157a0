//! Unit conversion between measurement systems.
//!
//! Sensor types name the conversion used to display a value in the other
//! measurement system. The set of conversions is closed; each stored name maps
//! to exactly one variant.

use serde::{Deserialize, Serialize};

use crate::model::text_enum;

/// A named value conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conversion {
    #[default]
    Identity,
    CelsiusToFahrenheit,
    FahrenheitToCelsius,
}

text_enum!(Conversion, "conversion" {
    Identity => "identity",
    CelsiusToFahrenheit => "celsius_to_fahrenheit",
    FahrenheitToCelsius => "fahrenheit_to_celsius",
});

impl Conversion {
    pub fn apply(&self, x: f64) -> f64 {
        match self {
            Conversion::Identity => x,
            Conversion::CelsiusToFahrenheit => x * 9.0 / 5.0 + 32.0,
            Conversion::FahrenheitToCelsius => (x - 32.0) * 5.0 / 9.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temperature_conversions() {
        assert_eq!(Conversion::CelsiusToFahrenheit.apply(0.0), 32.0);
        assert_eq!(Conversion::CelsiusToFahrenheit.apply(-40.0), -40.0);
        assert_eq!(Conversion::FahrenheitToCelsius.apply(212.0), 100.0);
        assert_eq!(Conversion::Identity.apply(17.25), 17.25);
    }

    #[test]
    fn test_conversion_names() {
        assert_eq!(
            "celsius_to_fahrenheit".parse::<Conversion>().unwrap(),
            Conversion::CelsiusToFahrenheit
        );
        assert!("kelvin_to_rankine".parse::<Conversion>().is_err());
    }
}
