use thiserror::Error;

/// Every failure a test run can hit. None are recovered locally; any of them
/// ends the run.
#[derive(Debug, Error)]
pub enum Error {
    /// The global-context adaptation could not find the donor tensor.
    #[error("cannot synthesize parameter: source `{0}` is missing from the checkpoint")]
    MissingSourceParameter(String),

    #[error("{0} not initialized")]
    MissingParameter(String),

    #[error("shape inconsistent for {name} inferred {inferred:?} provided {provided:?}")]
    ShapeMismatch {
        name: String,
        inferred: Vec<usize>,
        provided: Vec<usize>,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to bind predictor: {0}")]
    BindFailure(String),

    #[error("evaluation failed: {0}")]
    EvaluationFailure(String),

    #[error("malformed checkpoint: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_message_names_both_shapes() {
        let err = Error::ShapeMismatch {
            name: "conv1_weight".into(),
            inferred: vec![64, 3, 7, 7],
            provided: vec![64, 3, 3, 3],
        };

        assert_eq!(
            err.to_string(),
            "shape inconsistent for conv1_weight inferred [64, 3, 7, 7] provided [64, 3, 3, 3]"
        );
    }

    #[test]
    fn test_missing_parameter_message() {
        assert_eq!(
            Error::MissingParameter("fc_weight".into()).to_string(),
            "fc_weight not initialized"
        );
    }
}
