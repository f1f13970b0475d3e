// Plan Context
//
// Everything one statement's compilation shares across the rule pipeline:
// the plan graph itself plus the collaborators rules consult.

use crate::catalog::Catalog;
use crate::common::config::OptimizerConfig;
use crate::query::executor::result::QueryResult;
use crate::query::planner::cost_model::CostEstimator;
use crate::query::planner::plan::PlanGraph;
use crate::query::types::registry::TypesRegistry;
use crate::query::types::TypeInstance;

/// One shared type-inference cell per positional parameter
#[derive(Debug, Clone, Default)]
pub struct ParametersSync {
    /// Types declared by the client, used as inference seeds
    declared: Vec<Option<TypeInstance>>,
    inferred: Vec<Option<TypeInstance>>,
}

impl ParametersSync {
    pub fn new(declared: Vec<Option<TypeInstance>>) -> Self {
        let inferred = declared.clone();
        ParametersSync { declared, inferred }
    }

    pub fn len(&self) -> usize {
        self.inferred.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inferred.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<&TypeInstance> {
        self.inferred.get(position).and_then(|t| t.as_ref())
    }

    pub fn is_declared(&self, position: usize) -> bool {
        matches!(self.declared.get(position), Some(Some(_)))
    }

    fn ensure(&mut self, position: usize) {
        if self.inferred.len() <= position {
            self.inferred.resize(position + 1, None);
        }
    }

    /// Note a use of the parameter where a value of type `ty` is expected.
    /// The cell widens to the common type of all uses; declared types win.
    pub fn unify(&mut self, position: usize, ty: &TypeInstance, types: &dyn TypesRegistry) -> QueryResult<TypeInstance> {
        self.ensure(position);
        if self.is_declared(position) {
            if let Some(declared) = &self.inferred[position] {
                return Ok(declared.clone());
            }
        }
        let unified = match &self.inferred[position] {
            Some(current) => types.common_type(current, ty)?.with_nullable(true),
            None => ty.with_nullable(true),
        };
        self.inferred[position] = Some(unified.clone());
        Ok(unified)
    }

    /// Record that the parameter exists even when no use constrains it
    pub fn touch(&mut self, position: usize) {
        self.ensure(position);
    }

    /// Final SQL type of each parameter by position
    pub fn sql_types(&self) -> Vec<Option<TypeInstance>> {
        self.inferred.clone()
    }
}

pub struct PlanContext<'a> {
    pub plan: PlanGraph,
    pub catalog: &'a Catalog,
    pub types: &'a dyn TypesRegistry,
    pub config: &'a OptimizerConfig,
    pub cost_estimator: &'a dyn CostEstimator,
    pub parameters: ParametersSync,
    /// Set once every expression carries a type
    pub types_resolved: bool,
}

impl<'a> PlanContext<'a> {
    pub fn new(
        plan: PlanGraph,
        catalog: &'a Catalog,
        types: &'a dyn TypesRegistry,
        config: &'a OptimizerConfig,
        cost_estimator: &'a dyn CostEstimator,
    ) -> Self {
        PlanContext {
            plan,
            catalog,
            types,
            config,
            cost_estimator,
            parameters: ParametersSync::default(),
            types_resolved: false,
        }
    }

    /// Seed parameter inference with client-declared types
    pub fn with_parameter_types(mut self, declared: Vec<Option<TypeInstance>>) -> Self {
        self.parameters = ParametersSync::new(declared);
        self
    }
}
