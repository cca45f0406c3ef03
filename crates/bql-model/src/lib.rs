//! BQL models - typed datasets and CrossCat-style latent structure
//!
//! Each model is one posterior sample of a partition of the columns into
//! views and, within every view, of the rows into clusters. Queries average
//! over all models of a btable through [`Ensemble`].

use thiserror::Error;

pub mod component;
mod query;
mod state;
mod types;

pub use query::{Ensemble, Imputation, AGREEMENT_TOLERANCE};
pub use state::{Diagnostics, LatentState, View, CRP_ALPHA};
pub use types::*;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Dataset shape error: {0}")]
    DatasetShape(String),

    #[error("Invalid model state: {0}")]
    InvalidState(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("No models in ensemble")]
    EmptyEnsemble,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_state_serializes_as_json() {
        let data = Dataset::new(
            vec!["x".into()],
            vec![DataColumn::Continuous(vec![Some(1.0), None, Some(3.0)])],
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let mut state = LatentState::initialize(&data, ModelKind::CrossCat, &mut rng);
        state.analyze(&data, 2, None, &mut rng);

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"kind\":\"crosscat\""));
        let back: LatentState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.column_view, state.column_view);
        assert_eq!(back.views, state.views);
        assert_eq!(back.iterations, 2);
        back.validate(&data).unwrap();
    }
}
