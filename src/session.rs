use crate::{
    engine::ExecutionEngine,
    error::{Error, Result},
    network::{NetworkDeclaration, ShapeSpec},
    params::ParameterStore,
};

/// Everything needed to bind one predictor for a test run.
pub struct SessionRequest<'a> {
    pub network: &'a dyn NetworkDeclaration,
    /// Validated parameters, moved into the predictor.
    pub store: ParameterStore,
    pub data_names: Vec<String>,
    /// Always empty at test time.
    pub label_names: Vec<String>,
    /// Largest input shapes the predictor must accept.
    pub max_shapes: Vec<ShapeSpec>,
    pub provide_data: Vec<ShapeSpec>,
    pub provide_label: Vec<ShapeSpec>,
}

/// Whether `shape` fits inside `envelope`: same rank, no axis larger.
pub fn fits(shape: &[usize], envelope: &[usize]) -> bool {
    shape.len() == envelope.len() && shape.iter().zip(envelope).all(|(s, e)| s <= e)
}

/// Checks every input named in `envelope` against its maximum shape.
pub fn check_envelope(inputs: &[ShapeSpec], envelope: &[ShapeSpec]) -> Result<()> {
    for input in inputs {
        let Some(max) = envelope.iter().find(|e| e.name == input.name) else {
            continue;
        };
        if !fits(&input.shape, &max.shape) {
            return Err(Error::BindFailure(format!(
                "{} shape {:?} exceeds the bound maximum {:?}",
                input.name, input.shape, max.shape
            )));
        }
    }

    Ok(())
}

/// Binds exactly one predictor that serves every input shape within
/// `request.max_shapes`.
///
/// Fails with [`Error::BindFailure`] when labels are requested, when a data
/// name has no provided shape, or when a provided shape exceeds the envelope.
pub fn build_session<E: ExecutionEngine>(
    engine: &E,
    request: SessionRequest<'_>,
) -> Result<E::Predictor> {
    if !request.label_names.is_empty() || !request.provide_label.is_empty() {
        return Err(Error::BindFailure(format!(
            "test sessions take no labels, got {:?}",
            request.label_names
        )));
    }

    if let Some(name) = request
        .data_names
        .iter()
        .find(|n| !request.provide_data.iter().any(|s| &s.name == *n))
    {
        return Err(Error::BindFailure(format!("data '{name}' has no provided shape")));
    }

    check_envelope(&request.provide_data, &request.max_shapes)?;

    tracing::debug!(
        "binding {} with max shapes {:?}",
        request.network.entry_point(),
        request.max_shapes
    );

    engine.bind(request)
}
