//! # Solver Options
//!
//! Every solver is configured by a [`SolverOptions`] value. Options can be set in code through the
//! `with_*` builders, by name through [`SolverOptions::set_option`] (values given as strings, as
//! they come from a scene description), or deserialized with serde; missing fields take their
//! default value. Out-of-range numeric values are rejected by [`SolverOptions::validate`], which
//! runs on deserialization and at the start of every `invert`.
//!
//! | name | default | description |
//! |---|---|---|
//! | `ordering` | `library` | fill-reducing ordering: `library`, `identity` or `amd` |
//! | `tolerance` | `0.001` | LU threshold-pivoting tolerance in `(0, 1]` |
//! | `pivot_threshold` | `1e-14` | smallest accepted relative pivot for Cholesky and LDLT |
//! | `verbose` | `false` | log diagnostic state on every `invert` |
//! | `wait_for_async_task` | `false` | asynchronous LDLT: block until the new factor is ready |
//! | `solver` | `cholesky` | solver variant: `cholesky`, `ldlt`, `lu` or `async_ldlt` |

use serde::{Deserialize, Serialize};

use crate::E;
use crate::linalg::ordering::OrderingMethod;
use crate::linalg::solver::{SolverError, SolverKind};

/// Name, default value and description of a registered option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionDescriptor {
    pub name: &'static str,
    pub default: &'static str,
    pub description: &'static str,
}

pub const OPTIONS: &[OptionDescriptor] = &[
    OptionDescriptor {
        name: "ordering",
        default: "library",
        description: "Fill-reducing ordering method",
    },
    OptionDescriptor {
        name: "tolerance",
        default: "0.001",
        description: "Threshold-pivoting tolerance of the LU factorization",
    },
    OptionDescriptor {
        name: "pivot_threshold",
        default: "1e-14",
        description: "Smallest accepted relative pivot of the Cholesky and LDLT factorizations",
    },
    OptionDescriptor {
        name: "verbose",
        default: "false",
        description: "Log diagnostic state on every invert",
    },
    OptionDescriptor {
        name: "wait_for_async_task",
        default: "false",
        description: "Block until the background factorization finished",
    },
    OptionDescriptor {
        name: "solver",
        default: "cholesky",
        description: "Direct solver variant",
    },
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "UncheckedOptions")]
pub struct SolverOptions {
    pub ordering: OrderingMethod,
    pub tolerance: E,
    pub pivot_threshold: E,
    pub verbose: bool,
    pub wait_for_async_task: bool,
    pub solver: SolverKind,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            ordering: OrderingMethod::Library,
            tolerance: 1e-3,
            pivot_threshold: 1e-14,
            verbose: false,
            wait_for_async_task: false,
            solver: SolverKind::Cholesky,
        }
    }
}

/// Deserialized fields before range checks.
#[derive(Deserialize)]
#[serde(default)]
struct UncheckedOptions {
    ordering: OrderingMethod,
    tolerance: E,
    pivot_threshold: E,
    verbose: bool,
    wait_for_async_task: bool,
    solver: SolverKind,
}

impl Default for UncheckedOptions {
    fn default() -> Self {
        let SolverOptions {
            ordering,
            tolerance,
            pivot_threshold,
            verbose,
            wait_for_async_task,
            solver,
        } = SolverOptions::default();
        Self {
            ordering,
            tolerance,
            pivot_threshold,
            verbose,
            wait_for_async_task,
            solver,
        }
    }
}

impl TryFrom<UncheckedOptions> for SolverOptions {
    type Error = SolverError;

    fn try_from(raw: UncheckedOptions) -> Result<Self, Self::Error> {
        let options = Self {
            ordering: raw.ordering,
            tolerance: raw.tolerance,
            pivot_threshold: raw.pivot_threshold,
            verbose: raw.verbose,
            wait_for_async_task: raw.wait_for_async_task,
            solver: raw.solver,
        };
        options.validate()?;
        Ok(options)
    }
}

fn valid_tolerance(tolerance: E) -> bool {
    tolerance > 0.0 && tolerance <= 1.0
}

fn valid_pivot_threshold(threshold: E) -> bool {
    threshold.is_finite() && threshold >= 0.0
}

impl SolverOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks the numeric options: `tolerance` in `(0, 1]`, `pivot_threshold` finite and
    /// non-negative.
    pub fn validate(&self) -> Result<(), SolverError> {
        let invalid = |name: &str, value: E| SolverError::InvalidOptionValue {
            name: name.to_string(),
            value: format!("{value:?}"),
        };
        if !valid_tolerance(self.tolerance) {
            return Err(invalid("tolerance", self.tolerance));
        }
        if !valid_pivot_threshold(self.pivot_threshold) {
            return Err(invalid("pivot_threshold", self.pivot_threshold));
        }
        Ok(())
    }

    pub fn with_ordering(mut self, ordering: OrderingMethod) -> Self {
        self.ordering = ordering;
        self
    }

    /// Values outside `(0, 1]` make the next `invert` fail with
    /// [`SolverError::InvalidOptionValue`].
    pub fn with_tolerance(mut self, tolerance: E) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Negative or non-finite values make the next `invert` fail with
    /// [`SolverError::InvalidOptionValue`].
    pub fn with_pivot_threshold(mut self, pivot_threshold: E) -> Self {
        self.pivot_threshold = pivot_threshold;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_wait_for_async_task(mut self, wait: bool) -> Self {
        self.wait_for_async_task = wait;
        self
    }

    pub fn with_solver(mut self, solver: SolverKind) -> Self {
        self.solver = solver;
        self
    }

    /// Sets an option from its textual value.
    ///
    /// The options are left untouched when the name is unknown or the value does not parse.
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<(), SolverError> {
        let invalid = || SolverError::InvalidOptionValue {
            name: name.to_string(),
            value: value.to_string(),
        };

        match name {
            "ordering" => self.ordering = value.parse().map_err(|_| invalid())?,
            "tolerance" => {
                let tolerance: E = value.trim().parse().map_err(|_| invalid())?;
                if !valid_tolerance(tolerance) {
                    return Err(invalid());
                }
                self.tolerance = tolerance;
            }
            "pivot_threshold" => {
                let threshold: E = value.trim().parse().map_err(|_| invalid())?;
                if !valid_pivot_threshold(threshold) {
                    return Err(invalid());
                }
                self.pivot_threshold = threshold;
            }
            "verbose" => self.verbose = parse_bool(value).ok_or_else(invalid)?,
            "wait_for_async_task" => {
                self.wait_for_async_task = parse_bool(value).ok_or_else(invalid)?
            }
            "solver" => self.solver = value.parse().map_err(|_| invalid())?,
            _ => {
                return Err(SolverError::UnknownOption {
                    name: name.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Current value of an option, formatted the way [`SolverOptions::set_option`] accepts it.
    pub fn get_option(&self, name: &str) -> Option<String> {
        let value = match name {
            "ordering" => self.ordering.to_string(),
            // Debug formatting switches to scientific notation for tiny values
            "tolerance" => format!("{:?}", self.tolerance),
            "pivot_threshold" => format!("{:?}", self.pivot_threshold),
            "verbose" => self.verbose.to_string(),
            "wait_for_async_task" => self.wait_for_async_task.to_string(),
            "solver" => self.solver.to_string(),
            _ => return None,
        };
        Some(value)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
