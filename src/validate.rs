use crate::{
    error::{Error, Result},
    network::{LABEL_MARKER, NetworkDeclaration, ShapeSpec},
    params::{ParamKind, ParameterStore},
};

/// What a successful validation looked at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub checked_arguments: usize,
    pub checked_auxiliary_states: usize,
    /// Input placeholders and labels, which the checkpoint does not provide.
    pub skipped: Vec<String>,
}

/// Checks that `store` holds every parameter `network` needs, each with the
/// shape inference produced for the bound `inputs`.
///
/// Arguments bound as inputs and arguments whose name contains `label` are
/// skipped; auxiliary states are always checked.
pub fn validate_shapes(
    store: &ParameterStore,
    network: &dyn NetworkDeclaration,
    inputs: &[ShapeSpec],
) -> Result<ValidationReport> {
    let inferred = network.infer_shape(inputs)?;
    let mut report = ValidationReport::default();

    for name in network.list_arguments() {
        if inputs.iter().any(|s| s.name == name) || name.contains(LABEL_MARKER) {
            report.skipped.push(name);
            continue;
        }

        let expected = inferred.arguments.get(&name).ok_or_else(|| {
            Error::Configuration(format!("shape inference produced no shape for {name}"))
        })?;
        check(store, ParamKind::Argument, &name, expected)?;
        report.checked_arguments += 1;
    }

    for name in network.list_auxiliary_states() {
        let expected = inferred.auxiliary_states.get(&name).ok_or_else(|| {
            Error::Configuration(format!("shape inference produced no shape for {name}"))
        })?;
        check(store, ParamKind::Auxiliary, &name, expected)?;
        report.checked_auxiliary_states += 1;
    }

    tracing::debug!(
        "validated {} arguments and {} auxiliary states, skipped {:?}",
        report.checked_arguments,
        report.checked_auxiliary_states,
        report.skipped
    );

    Ok(report)
}

fn check(store: &ParameterStore, kind: ParamKind, name: &str, expected: &[usize]) -> Result<()> {
    let provided = store
        .shape(kind, name)
        .ok_or_else(|| Error::MissingParameter(name.to_string()))?;

    if provided != expected {
        return Err(Error::ShapeMismatch {
            name: name.to_string(),
            inferred: expected.to_vec(),
            provided: provided.to_vec(),
        });
    }

    Ok(())
}
