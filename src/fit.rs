use std::{convert::Infallible, sync::Arc};

use accurate::{sum::Klein, traits::*};
use ganesh::{algorithms::LBFGSB, Algorithm, Function, Minimizer, Observer, Status};
use nalgebra::DMatrix;
use parking_lot::RwLock;
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    data::Dataset, model::Model, selection::Selection, workspace::Workspace, Float, MassFitError,
    MassFitResult,
};

/// Finite stand-in objective value for parameter points where the density is
/// not evaluable (implied fraction negative, degenerate shape, non-positive
/// density at a data point).
const PENALTY: Float = 1e10;

/// The extended set of options passed through to one minimization.
#[derive(Debug, Clone)]
pub struct FitOptions {
    /// Worker-thread hint forwarded to the minimizer's likelihood
    /// evaluation (the `NumCPU` pass-through). Ignored without the `rayon`
    /// feature.
    pub num_threads: usize,
    /// Maximum number of minimizer steps.
    pub max_steps: usize,
    /// Print the position and objective value at every step.
    pub verbose: bool,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            num_threads: num_cpus::get(),
            max_steps: 4000,
            verbose: false,
        }
    }
}

/// One fitted parameter: its name, fitted value, and the error derived from
/// the covariance matrix when available.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitParameter {
    /// The parameter's name.
    pub name: String,
    /// The fitted value.
    pub value: Float,
    /// The parabolic error, if the minimizer produced one.
    pub error: Option<Float>,
}

/// An immutable record of one minimization outcome.
///
/// Status and covariance-quality codes are recorded verbatim and never
/// interpreted: a poor fit is data, not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitResult {
    /// The name of the selection (or dataset) this fit belongs to.
    pub name: String,
    /// 0 if the minimizer converged, 1 otherwise.
    pub status: i32,
    /// Covariance quality: 3 full accurate, 2 non-positive-definite
    /// diagonal, 1 non-finite entries, -1 not produced.
    pub cov_quality: i32,
    /// The objective value (-2 log L) at the minimum.
    pub fx: Float,
    /// The number of events entering the fit.
    pub n_events: usize,
    /// Whether the minimizer reported convergence.
    pub converged: bool,
    /// The minimizer's termination message.
    pub message: String,
    /// Fitted values and errors, in the model's parameter order.
    pub parameters: Vec<FitParameter>,
}

impl FitResult {
    /// Look up a fitted parameter by name.
    pub fn parameter(&self, name: &str) -> Option<&FitParameter> {
        self.parameters
            .iter()
            .find(|parameter| parameter.name == name)
    }
}

/// Grade the covariance matrix produced by the minimizer.
fn covariance_quality(cov: Option<&DMatrix<Float>>) -> i32 {
    match cov {
        None => -1,
        Some(matrix) if matrix.iter().any(|value| !value.is_finite()) => 1,
        Some(matrix) if (0..matrix.nrows()).any(|index| matrix[(index, index)] <= 0.0) => 2,
        Some(_) => 3,
    }
}

/// The extended unbinned negative log-likelihood of the mass model over one
/// subset, restricted to the model's fit sub-range.
struct Nll<'a> {
    model: &'a Model,
    masses: Vec<Float>,
}

impl<'a> Nll<'a> {
    fn new(model: &'a Model, dataset: &Dataset) -> Nll<'a> {
        let masses = dataset
            .iter()
            .map(|event| event.mass)
            .filter(|&mass| model.observable().in_fit_range(mass))
            .collect();
        Nll { model, masses }
    }
}

impl Function<(), Infallible> for Nll<'_> {
    fn evaluate(&self, parameters: &[Float], _user_data: &mut ()) -> Result<Float, Infallible> {
        let terms = match self.model.terms(parameters) {
            Ok(terms) => terms,
            Err(_) => return Ok(PENALTY),
        };
        #[cfg(feature = "rayon")]
        let log_sum: Float = self
            .masses
            .par_iter()
            .map(|&mass| {
                let density = terms.density(mass);
                if density > 0.0 {
                    density.ln()
                } else {
                    Float::NEG_INFINITY
                }
            })
            .parallel_sum_with_accumulator::<Klein<Float>>();
        #[cfg(not(feature = "rayon"))]
        let log_sum: Float = self
            .masses
            .iter()
            .map(|&mass| {
                let density = terms.density(mass);
                if density > 0.0 {
                    density.ln()
                } else {
                    Float::NEG_INFINITY
                }
            })
            .sum_with_accumulator::<Klein<Float>>();
        if !log_sum.is_finite() {
            return Ok(PENALTY);
        }
        Ok(-2.0 * log_sum)
    }
}

struct VerboseObserver;

impl Observer<()> for VerboseObserver {
    fn callback(&mut self, step: usize, status: &mut Status, _user_data: &mut ()) -> bool {
        println!("Step: {}", step);
        println!("Current Best Position: {}", status.x.transpose());
        println!("Current Best Value: {}", status.fx);
        true
    }
}

fn minimize(
    nll: &Nll<'_>,
    p0: &[Float],
    bounds: Vec<(Float, Float)>,
    options: &FitOptions,
) -> Status {
    let algorithm: Box<dyn Algorithm<(), Infallible>> = Box::new(LBFGSB::default());
    let mut observers: Vec<Arc<RwLock<dyn Observer<()>>>> = Vec::new();
    if options.verbose {
        observers.push(Arc::new(RwLock::new(VerboseObserver)));
    }
    let mut minimizer = Minimizer::new(algorithm, p0.len())
        .with_bounds(Some(bounds))
        .with_max_steps(options.max_steps);
    for observer in observers {
        minimizer = minimizer.with_observer(observer);
    }
    minimizer
        .minimize(nll, p0, &mut ())
        .unwrap_or_else(|never| match never {});
    minimizer.status
}

/// Fit the model to a dataset over the model's fit sub-range, using the
/// external L-BFGS-B minimizer.
///
/// The fit starts from the model's *current* parameter values and writes the
/// converged values back into the model, so consecutive calls are
/// warm-started. Call [`Model::reset`] first for an independent fit.
///
/// # Errors
///
/// Returns a [`MassFitError::EmptySelection`] if no event falls inside the
/// fit sub-range; minimizer quality problems are recorded on the
/// [`FitResult`], never returned as errors.
pub fn fit(model: &mut Model, dataset: &Dataset, options: &FitOptions) -> MassFitResult<FitResult> {
    let p0 = model.values();
    let bounds = model.bounds();
    let names = model.names();
    let nll = Nll::new(model, dataset);
    let n_events = nll.masses.len();
    if n_events == 0 {
        return Err(MassFitError::EmptySelection {
            name: dataset.name().to_string(),
        });
    }
    #[cfg(feature = "rayon")]
    let status = {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.num_threads)
            .build()?;
        pool.install(|| minimize(&nll, &p0, bounds, options))
    };
    #[cfg(not(feature = "rayon"))]
    let status = minimize(&nll, &p0, bounds, options);
    model.set_values(status.x.as_slice());
    let cov_quality = covariance_quality(status.cov.as_ref());
    let parameters = names
        .into_iter()
        .enumerate()
        .map(|(index, name)| FitParameter {
            name,
            value: status.x[index],
            error: status.err.as_ref().map(|err| err[index]),
        })
        .collect();
    Ok(FitResult {
        name: dataset.name().to_string(),
        status: if status.converged { 0 } else { 1 },
        cov_quality,
        fx: status.fx,
        n_events,
        converged: status.converged,
        message: status.message,
        parameters,
    })
}

/// Process one [`Selection`]: subset the full dataset, fit the shared model,
/// snapshot its parameters, and register all three under the selection's
/// name (`data_<name>`, `fitResult_<name>`, `snap_<name>`).
///
/// # Errors
///
/// Returns a [`MassFitError::EmptySelection`] if the predicate rejects every
/// event and a [`MassFitError::RegistrationError`] if the selection's name
/// was already used in this workspace.
pub fn fit_one(
    workspace: &mut Workspace,
    model: &mut Model,
    full_data: &Arc<Dataset>,
    selection: &Selection,
    options: &FitOptions,
) -> MassFitResult<FitResult> {
    let subset = full_data.filter(selection.predicate(), format!("data_{}", selection.name()));
    if subset.is_empty() {
        return Err(MassFitError::EmptySelection {
            name: selection.name().to_string(),
        });
    }
    info!(
        selection = selection.name(),
        n_events = subset.len(),
        cut = %selection.expr(),
        "fitting selection"
    );
    let mut result = fit(model, &subset, options)?;
    result.name = selection.name().to_string();
    if result.status != 0 || result.cov_quality < 3 {
        warn!(
            selection = selection.name(),
            status = result.status,
            cov_quality = result.cov_quality,
            "fit quality is degraded; recording as-is"
        );
    }
    let snapshot = model.snapshot(format!("snap_{}", selection.name()));
    workspace.import_dataset(subset)?;
    workspace.import_fit_result(format!("fitResult_{}", selection.name()), result.clone())?;
    workspace.save_snapshot(snapshot)?;
    Ok(result)
}

/// Fit every selection in order against the shared model and dataset.
///
/// Order matters: the model is never reset between fits, so each fit is
/// seeded by the previous fit's converged values. The batch aborts on the
/// first structural error (empty subset, name collision) without processing
/// later selections; a poorly converged fit never aborts the batch.
pub fn run_batch(
    workspace: &mut Workspace,
    model: &mut Model,
    full_data: &Arc<Dataset>,
    selections: &[Selection],
    options: &FitOptions,
) -> MassFitResult<Vec<(String, FitResult)>> {
    let mut results = Vec::with_capacity(selections.len());
    for selection in selections {
        let result = fit_one(workspace, model, full_data, selection, options)?;
        results.push((selection.name().to_string(), result));
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Observable;
    use nalgebra::DMatrix;

    #[test]
    fn covariance_quality_grading() {
        assert_eq!(covariance_quality(None), -1);
        let good = DMatrix::from_diagonal_element(2, 2, 1.0);
        assert_eq!(covariance_quality(Some(&good)), 3);
        let non_finite = DMatrix::from_element(2, 2, Float::NAN);
        assert_eq!(covariance_quality(Some(&non_finite)), 1);
        let mut non_positive = DMatrix::from_diagonal_element(2, 2, 1.0);
        non_positive[(1, 1)] = -0.5;
        assert_eq!(covariance_quality(Some(&non_positive)), 2);
    }

    #[test]
    fn nll_penalizes_invalid_fractions() {
        let model = Model::new(Observable::dimuon_mass());
        let dataset = Dataset::new("penaltyData", vec![crate::data::tests::test_event(9.5, 10.0, 12.0)]);
        let nll = Nll::new(&model, &dataset);
        let mut values = model.values();
        let index = model.names().iter().position(|name| name == "fBkg").unwrap();
        values[index] = 0.99;
        let fx = Function::evaluate(&nll, &values, &mut ()).unwrap();
        assert_eq!(fx, PENALTY);
    }

    #[test]
    fn n_events_counts_only_the_fitted_sample() {
        let mut model = Model::new(Observable::dimuon_mass());
        // three events inside the fit sub-range, one below it
        let dataset = Dataset::new(
            "mixedRange",
            vec![
                crate::data::tests::test_event(9.46, 10.0, 12.0),
                crate::data::tests::test_event(10.02, 10.0, 12.0),
                crate::data::tests::test_event(10.36, 10.0, 12.0),
                crate::data::tests::test_event(8.45, 10.0, 12.0),
            ],
        );
        let options = FitOptions {
            max_steps: 20,
            ..Default::default()
        };
        let result = fit(&mut model, &dataset, &options).unwrap();
        assert_eq!(result.n_events, 3);
    }

    #[test]
    fn fit_requires_events_in_the_fit_range() {
        let mut model = Model::new(Observable::dimuon_mass());
        let dataset = Dataset::new(
            "outOfRange",
            vec![crate::data::tests::test_event(8.45, 10.0, 12.0)],
        );
        assert!(matches!(
            fit(&mut model, &dataset, &FitOptions::default()),
            Err(MassFitError::EmptySelection { .. })
        ));
    }
}
