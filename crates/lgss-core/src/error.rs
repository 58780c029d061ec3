//! Error types for linear-Gaussian state space estimation

use thiserror::Error;

/// Estimation error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Supplied parameters imply conflicting state/observation dimensions.
    #[error("Dimension mismatch in {field}: expected {expected}, found {found}")]
    DimensionMismatch {
        /// Parameter (or dimension) that disagreed with the inferred value.
        field: String,
        /// Dimension fixed by an earlier parameter.
        expected: usize,
        /// Dimension implied by `field`.
        found: usize,
    },

    /// A covariance that must be inverted is not positive definite.
    #[error(
        "Singular covariance{}: {matrix} is not invertible",
        .timestep.map(|t| format!(" at timestep {t}")).unwrap_or_default()
    )]
    SingularCovariance {
        /// Timestep at which the failure happened; `None` for a standalone online update.
        timestep: Option<usize>,
        /// Which matrix failed (e.g. "innovation covariance").
        matrix: String,
    },

    /// Unknown EM parameter name.
    #[error("Invalid EM selector: {0}")]
    InvalidEmSelector(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_context() {
        let e =
            Error::SingularCovariance { timestep: Some(7), matrix: "innovation covariance".into() };
        let msg = e.to_string();
        assert!(msg.contains("timestep 7"), "{msg}");
        assert!(msg.contains("innovation covariance"), "{msg}");

        let e = Error::SingularCovariance { timestep: None, matrix: "innovation covariance".into() };
        assert_eq!(
            e.to_string(),
            "Singular covariance: innovation covariance is not invertible"
        );

        let e = Error::DimensionMismatch {
            field: "observation_offsets".into(),
            expected: 3,
            found: 2,
        };
        assert_eq!(e.to_string(), "Dimension mismatch in observation_offsets: expected 3, found 2");
    }
}
