//! # massfit
//!
//! `massfit` performs repeated unbinned maximum-likelihood fits of a dimuon
//! invariant-mass spectrum containing the three Υ(nS) resonances on top of a
//! smooth combinatorial background. The same model is fit to many kinematic
//! sub-selections of one dataset (bins in |cosθ| in the helicity frame, cuts
//! on charged multiplicity, windows in transverse momentum), and each fit's
//! subset, result, and parameter snapshot are stored under the selection's
//! name in a [`Workspace`] which can be serialized to a single file.
//!
//! The minimization itself is delegated to [`ganesh`]'s L-BFGS-B
//! implementation; this crate defines the model, the selection naming scheme,
//! and the sequential fit driver. Fits are intentionally warm-started: the
//! model's parameters are mutated in place by each fit, so every fit begins
//! from the previous fit's converged values. Use [`Model::reset`] between
//! calls if independent fits are required.
#![warn(clippy::perf, clippy::style)]

use thiserror::Error;

/// Methods for loading and filtering [`Event`]-based data.
pub mod data;
/// The external minimizer interface and the batch fit driver.
pub mod fit;
/// The three-peak-plus-background mass model and its parameters.
pub mod model;
/// Typed selection predicates and the bin/cut naming scheme.
pub mod selection;
/// A named container for datasets, fit results, and parameter snapshots.
pub mod workspace;

pub use crate::data::{open_parquet, Dataset, Event};
pub use crate::fit::{fit, fit_one, run_batch, FitOptions, FitParameter, FitResult};
pub use crate::model::{Model, Observable};
pub use crate::selection::{
    abs_costh_bins, format_edge, nch_pt_windows, nch_thresholds, Predicate, Selection, Variable,
};
pub use crate::workspace::{ImportMode, Snapshot, Workspace};

/// The floating-point type used throughout this crate.
pub type Float = f64;

pub type MassFitResult<T> = Result<T, MassFitError>;

/// The error type used by all `massfit` internal methods
#[derive(Error, Debug)]
pub enum MassFitError {
    /// An alias for [`std::io::Error`].
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),
    /// An alias for [`parquet::errors::ParquetError`].
    #[error("Parquet Error: {0}")]
    ParquetError(#[from] parquet::errors::ParquetError),
    /// An alias for [`arrow::error::ArrowError`].
    #[error("Arrow Error: {0}")]
    ArrowError(#[from] arrow::error::ArrowError),
    /// An alias for [`shellexpand::LookupError`].
    #[error("Failed to expand path: {0}")]
    LookupError(#[from] shellexpand::LookupError<std::env::VarError>),
    /// An error returned by the (de)serializer when reading or writing a
    /// [`Workspace`] artifact.
    #[error("Serialization error: {0}")]
    SerdeError(#[from] bincode::Error),
    /// An error which occurs when the user tries to import two objects under
    /// the same name into a [`Workspace`].
    #[error("An object by the name \"{name}\" is already registered in this workspace!")]
    RegistrationError {
        /// Name which is already registered
        name: String,
    },
    /// An error which occurs when a named object is requested from a
    /// [`Workspace`] which does not contain it.
    #[error("No registered object with name \"{name}\"!")]
    NotFoundError {
        /// Name which failed lookup
        name: String,
    },
    /// An error which occurs when a selection's predicate rejects every event
    /// in the dataset it is applied to.
    #[error("Selection \"{name}\" produced an empty subset!")]
    EmptySelection {
        /// Name of the offending selection
        name: String,
    },
    /// An error which occurs when a bin index lies outside `[1, n_edges - 1]`.
    #[error("Bin index {index} is out of range for a binning with {n_edges} edges!")]
    BinIndexError {
        /// The requested bin index
        index: usize,
        /// The number of edges in the binning
        n_edges: usize,
    },
    /// An error which occurs when a window selection's edges are not ordered.
    #[error("Invalid window edges: low ({low}) must be less than high ({high})!")]
    EdgeOrderError {
        /// Lower edge
        low: Float,
        /// Upper edge
        high: Float,
    },
    /// An error which occurs when the free mixture fractions sum above unity,
    /// leaving no room for the implied third-peak fraction.
    #[error("Free fractions sum to {sum}, leaving a negative implied fraction!")]
    FractionError {
        /// Sum of the free fractions
        sum: Float,
    },
    /// An error which occurs when an expected column is absent from the input
    /// file or its type is not a floating-point type.
    #[error("Missing or non-float column \"{name}\" in input data!")]
    ColumnError {
        /// Name of the missing column
        name: String,
    },
    /// An error which occurs when an observable's fit sub-range extends
    /// beyond its declared range.
    #[error("Fit range ({fit_min}, {fit_max}) is not contained in the declared range ({min}, {max})!")]
    RangeError {
        /// Declared lower bound
        min: Float,
        /// Declared upper bound
        max: Float,
        /// Fit sub-range lower bound
        fit_min: Float,
        /// Fit sub-range upper bound
        fit_max: Float,
    },
    /// An error type for [`rayon`] thread pools
    #[cfg(feature = "rayon")]
    #[error("Error building thread pool: {0}")]
    ThreadPoolError(#[from] rayon::ThreadPoolBuildError),
    /// A custom fallback error for errors too complex or too infrequent to warrant their own error
    /// category.
    #[error("{0}")]
    Custom(String),
}
