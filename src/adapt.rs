//! Parameter synthesis for the global-context variant.
//!
//! The global-context branch is never trained on its own: its stage-5
//! weights and its second batch-norm start out as copies of the stage-4
//! weights and the first batch-norm of the checkpoint. The routing is kept in
//! [`GLOBAL_CONTEXT_RULES`] and resolved into an [`AdaptationPlan`] before
//! anything in the store is touched.

use crate::{
    config::Variant,
    error::{Error, Result},
    network::NetworkDeclaration,
    params::{ParamKind, ParameterStore},
};

pub const STAGE5_MARKER: &str = "stage5";
pub const STAGE4_MARKER: &str = "stage4";

/// Which names a rule produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetPattern {
    /// Every declared name containing the token.
    Contains(&'static str),
    /// Exactly this name, whether declared or not.
    Exact(&'static str),
}

/// Where a produced name copies its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRule {
    /// The target name with `from` replaced by `to`.
    Replace {
        from: &'static str,
        to: &'static str,
    },
    /// A fixed donor name.
    Fixed(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptationRule {
    pub kind: ParamKind,
    pub target: TargetPattern,
    pub source: SourceRule,
}

const STAGE5_FROM_STAGE4: SourceRule = SourceRule::Replace {
    from: STAGE5_MARKER,
    to: STAGE4_MARKER,
};

/// Rules applied, in order, when the global-context branch is enabled.
pub const GLOBAL_CONTEXT_RULES: &[AdaptationRule] = &[
    AdaptationRule {
        kind: ParamKind::Argument,
        target: TargetPattern::Contains(STAGE5_MARKER),
        source: STAGE5_FROM_STAGE4,
    },
    AdaptationRule {
        kind: ParamKind::Argument,
        target: TargetPattern::Exact("bn2_gamma"),
        source: SourceRule::Fixed("bn1_gamma"),
    },
    AdaptationRule {
        kind: ParamKind::Argument,
        target: TargetPattern::Exact("bn2_beta"),
        source: SourceRule::Fixed("bn1_beta"),
    },
    AdaptationRule {
        kind: ParamKind::Auxiliary,
        target: TargetPattern::Contains(STAGE5_MARKER),
        source: STAGE5_FROM_STAGE4,
    },
    AdaptationRule {
        kind: ParamKind::Auxiliary,
        target: TargetPattern::Exact("bn2_moving_mean"),
        source: SourceRule::Fixed("bn1_moving_mean"),
    },
    AdaptationRule {
        kind: ParamKind::Auxiliary,
        target: TargetPattern::Exact("bn2_moving_var"),
        source: SourceRule::Fixed("bn1_moving_var"),
    },
];

/// A single resolved copy: `target <- source` within one half of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub kind: ParamKind,
    pub target: String,
    pub source: String,
}

/// Every copy an adaptation will perform, in application order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdaptationPlan {
    pub assignments: Vec<Assignment>,
}

impl AdaptationPlan {
    /// Resolves `rules` against the names `network` declares.
    pub fn resolve(rules: &[AdaptationRule], network: &dyn NetworkDeclaration) -> Self {
        let arguments = network.list_arguments();
        let auxiliary_states = network.list_auxiliary_states();
        let mut assignments = Vec::new();

        for rule in rules {
            let declared = match rule.kind {
                ParamKind::Argument => &arguments,
                ParamKind::Auxiliary => &auxiliary_states,
            };

            let targets: Vec<String> = match rule.target {
                TargetPattern::Contains(token) => declared
                    .iter()
                    .filter(|name| name.contains(token))
                    .cloned()
                    .collect(),
                TargetPattern::Exact(name) => vec![name.to_string()],
            };

            for target in targets {
                let source = match rule.source {
                    SourceRule::Replace { from, to } => target.replace(from, to),
                    SourceRule::Fixed(name) => name.to_string(),
                };
                assignments.push(Assignment {
                    kind: rule.kind,
                    target,
                    source,
                });
            }
        }

        Self { assignments }
    }

    /// Performs every copy. Stops at the first missing donor.
    pub fn apply(&self, store: &mut ParameterStore) -> Result<()> {
        for a in self.assignments.iter() {
            let value = store
                .get(a.kind, &a.source)
                .cloned()
                .ok_or_else(|| Error::MissingSourceParameter(a.source.clone()))?;

            tracing::debug!("{:?} {} <- {}", a.kind, a.target, a.source);
            store.insert(a.kind, a.target.clone(), value)?;
        }

        Ok(())
    }
}

/// Synthesizes the global-context parameters a checkpoint was trained without.
#[derive(Debug, Clone)]
pub struct ParameterAdapter {
    rules: &'static [AdaptationRule],
}

impl ParameterAdapter {
    /// The adapter for `variant`, or `None` when the variant needs no adaptation.
    pub fn for_variant(variant: Variant) -> Option<Self> {
        variant.uses_global_context().then_some(Self {
            rules: GLOBAL_CONTEXT_RULES,
        })
    }

    pub fn plan(&self, network: &dyn NetworkDeclaration) -> AdaptationPlan {
        AdaptationPlan::resolve(self.rules, network)
    }

    /// Resolves and applies the plan, returning it for logging.
    pub fn adapt(
        &self,
        store: &mut ParameterStore,
        network: &dyn NetworkDeclaration,
    ) -> Result<AdaptationPlan> {
        let plan = self.plan(network);
        plan.apply(store)?;

        tracing::info!(
            "global context: synthesized {} parameters from existing branches",
            plan.assignments.len()
        );

        Ok(plan)
    }
}
