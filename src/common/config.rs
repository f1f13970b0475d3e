//! Optimizer Configuration
//!
//! Named properties supplied by the embedding system and read while planning.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::query::executor::result::{QueryError, QueryResult};

/// What to do with a column that is neither grouped nor aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImplicitAggregate {
    /// Reject the statement.
    #[default]
    Error,
    /// Wrap the column in FIRST().
    First,
    /// Add the column as a grouping key when a unique index makes that
    /// harmless, otherwise reject.
    FirstIfUnique,
}

impl FromStr for ImplicitAggregate {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(ImplicitAggregate::Error),
            "first" => Ok(ImplicitAggregate::First),
            "firstIfUnique" => Ok(ImplicitAggregate::FirstIfUnique),
            _ => Err(QueryError::InvalidOptimizerProperty {
                name: "implicitAggregate".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for ImplicitAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImplicitAggregate::Error => write!(f, "error"),
            ImplicitAggregate::First => write!(f, "first"),
            ImplicitAggregate::FirstIfUnique => write!(f, "firstIfUnique"),
        }
    }
}

/// Planner settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptimizerConfig {
    /// Policy for ungrouped, unaggregated columns
    pub implicit_aggregate: ImplicitAggregate,
    /// Estimated row count at which an index intersection switches to skip scan
    pub skip_scan_min_count: u64,
    /// Lookahead quantum handed to ancestor/branch lookup operators
    pub group_lookup_lookahead_quantum: u32,
    /// Whether nested loops may run pipelined
    pub map_enabled: bool,
    /// Whether bloom-filter join implementations are honored
    pub bloom_filter_enabled: bool,
    /// Upper bound on constant-folding passes
    pub max_fold_iterations: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            implicit_aggregate: ImplicitAggregate::Error,
            skip_scan_min_count: 1000,
            group_lookup_lookahead_quantum: 1,
            map_enabled: false,
            bloom_filter_enabled: true,
            max_fold_iterations: 64,
        }
    }
}

impl OptimizerConfig {
    /// Build a configuration from named string properties. Unknown names are
    /// ignored so that the embedding system can pass its full property set.
    pub fn from_properties(properties: &HashMap<String, String>) -> QueryResult<Self> {
        let mut config = OptimizerConfig::default();
        for (name, value) in properties {
            match name.as_str() {
                "implicitAggregate" => config.implicit_aggregate = value.parse()?,
                "skipScanMinCount" => config.skip_scan_min_count = parse_property(name, value)?,
                "groupLookupLookaheadQuantum" => {
                    config.group_lookup_lookahead_quantum = parse_property(name, value)?
                }
                "mapEnabled" => config.map_enabled = parse_property(name, value)?,
                "bloomFilterEnabled" => config.bloom_filter_enabled = parse_property(name, value)?,
                _ => log::trace!("ignoring optimizer property {}", name),
            }
        }
        Ok(config)
    }

    pub fn with_implicit_aggregate(mut self, policy: ImplicitAggregate) -> Self {
        self.implicit_aggregate = policy;
        self
    }

    pub fn with_skip_scan_min_count(mut self, count: u64) -> Self {
        self.skip_scan_min_count = count;
        self
    }

    pub fn with_map_enabled(mut self, enabled: bool) -> Self {
        self.map_enabled = enabled;
        self
    }
}

fn parse_property<T: FromStr>(name: &str, value: &str) -> QueryResult<T> {
    value.trim().parse().map_err(|_| QueryError::InvalidOptimizerProperty {
        name: name.to_string(),
        value: value.to_string(),
    })
}
