use once_cell::sync::Lazy;
use rand::Rng;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing_unwrap::OptionExt;

/// `$name` placeholders in a command prototype
static TEMPLATE_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)").expect("hardcoded pattern"));

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Template uses {flag} but is missing the required variable ${variable}")]
    MissingVariable {
        flag: &'static str,
        variable: &'static str,
    },
}

/// Sampling bounds for every calibration parameter the prototype may use.
pub const PARAMETER_RANGES: [(&str, f64, f64); 12] = [
    ("s1", 0.01, 20.0),
    ("s2", 1.0, 150.0),
    ("s3", 0.1, 10.0),
    ("sv1", 0.01, 20.0),
    ("sv2", 1.0, 150.0),
    ("gw1", 0.001, 0.3),
    ("gw2", 0.01, 0.9),
    ("vgsen1", 0.5, 2.0),
    ("vgsen2", 0.5, 2.0),
    ("vgsen3", 1.0, 1.0),
    ("svalt1", 0.5, 2.0),
    ("svalt2", 0.5, 2.0),
];

fn bounds(name: &str) -> (f64, f64) {
    let (_, low, high) = PARAMETER_RANGES
        .iter()
        .find(|(entry, _, _)| *entry == name)
        .unwrap_or_log();

    (*low, *high)
}

/// Calibration parameters enabled by a command prototype.
///
/// A model flag only counts when its required variables are present, the
/// optional third members (`$s3`, `$vgsen3`) are tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParamSpec {
    pub s: bool,
    pub s3: bool,
    pub sv: bool,
    pub gw: bool,
    pub vgsen: bool,
    pub vgsen3: bool,
    pub svalt: bool,
    /// reuse the horizontal decay parameters for the vertical ones
    pub sv_mirrors_s: bool,
}

fn require(
    variables: &BTreeSet<&str>,
    flag: &'static str,
    variable: &'static str,
) -> Result<(), TemplateError> {
    if variables.contains(variable) {
        Ok(())
    } else {
        Err(TemplateError::MissingVariable { flag, variable })
    }
}

impl ParamSpec {
    /// Scan a command prototype for the model flags it passes and check that
    /// each flag brings the variables it needs.
    pub fn from_template(template: &str, sv_mirrors_s: bool) -> Result<Self, TemplateError> {
        let flags: BTreeSet<&str> = template.split_whitespace().collect();
        let variables: BTreeSet<&str> = TEMPLATE_VAR
            .captures_iter(template)
            .filter_map(|captures| captures.get(1).map(|variable| variable.as_str()))
            .collect();

        let spec = Self {
            s: flags.contains("-s"),
            s3: flags.contains("-s") && variables.contains("s3"),
            sv: flags.contains("-sv"),
            gw: flags.contains("-gw"),
            vgsen: flags.contains("-vgsen"),
            vgsen3: flags.contains("-vgsen") && variables.contains("vgsen3"),
            svalt: flags.contains("-svalt"),
            sv_mirrors_s,
        };

        if spec.s {
            require(&variables, "-s", "s1")?;
            require(&variables, "-s", "s2")?;
        }
        if spec.sv {
            require(&variables, "-sv", "sv1")?;
            require(&variables, "-sv", "sv2")?;
        }
        if spec.gw {
            require(&variables, "-gw", "gw1")?;
            require(&variables, "-gw", "gw2")?;
        }
        if spec.vgsen {
            require(&variables, "-vgsen", "vgsen1")?;
            require(&variables, "-vgsen", "vgsen2")?;
        }
        if spec.svalt {
            require(&variables, "-svalt", "svalt1")?;
            require(&variables, "-svalt", "svalt2")?;
        }

        Ok(spec)
    }

    /// Draw one value set for the enabled parameters.
    pub fn generate<R: Rng>(&self, rng: &mut R) -> CalibrationValues {
        let mut draw = |name: &str| {
            let (low, high) = bounds(name);

            Some(rng.random_range(low..=high))
        };

        let mut values = CalibrationValues::default();

        if self.s {
            values.s1 = draw("s1");
            values.s2 = draw("s2");

            if self.s3 {
                values.s3 = draw("s3");
            }
        }
        if self.sv {
            if self.sv_mirrors_s && self.s {
                values.sv1 = values.s1;
                values.sv2 = values.s2;
            } else {
                values.sv1 = draw("sv1");
                values.sv2 = draw("sv2");
            }
        }
        if self.gw {
            values.gw1 = draw("gw1");
            values.gw2 = draw("gw2");
        }
        if self.vgsen {
            values.vgsen1 = draw("vgsen1");
            values.vgsen2 = draw("vgsen2");

            if self.vgsen3 {
                values.vgsen3 = draw("vgsen3");
            }
        }
        if self.svalt {
            values.svalt1 = draw("svalt1");
            values.svalt2 = draw("svalt2");
        }

        values
    }
}

/// One drawn parameter set, `None` for parameters the prototype does not use.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CalibrationValues {
    pub s1: Option<f64>,
    pub s2: Option<f64>,
    pub s3: Option<f64>,
    pub sv1: Option<f64>,
    pub sv2: Option<f64>,
    pub gw1: Option<f64>,
    pub gw2: Option<f64>,
    pub vgsen1: Option<f64>,
    pub vgsen2: Option<f64>,
    pub vgsen3: Option<f64>,
    pub svalt1: Option<f64>,
    pub svalt2: Option<f64>,
}

impl CalibrationValues {
    /// Variable map for template substitution, skipping unset parameters.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        {
            let mut push = |name: &str, value: Option<f64>| {
                if let Some(value) = value {
                    map.insert(name.to_owned(), value.to_string());
                }
            };

            push("s1", self.s1);
            push("s2", self.s2);
            push("s3", self.s3);
            push("sv1", self.sv1);
            push("sv2", self.sv2);
            push("gw1", self.gw1);
            push("gw2", self.gw2);
            push("vgsen1", self.vgsen1);
            push("vgsen2", self.vgsen2);
            push("vgsen3", self.vgsen3);
            push("svalt1", self.svalt1);
            push("svalt2", self.svalt2);
        }

        map
    }
}

/// Replace every `$name` occurrence found in the map, leaving unknown
/// variables untouched for a later substitution pass.
pub fn substitute(template: &str, variables: &BTreeMap<String, String>) -> String {
    TEMPLATE_VAR
        .replace_all(template, |captures: &Captures| {
            let name = &captures[1];

            match variables.get(name) {
                Some(value) => value.clone(),
                None => captures[0].to_owned(),
            }
        })
        .into_owned()
}
