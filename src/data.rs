use std::{fs::File, path::Path, sync::Arc};

use arrow::{
    array::{Float32Array, Float64Array},
    record_batch::RecordBatch,
};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{selection::Predicate, Float, MassFitError, MassFitResult};

/// The columns every input file must provide, in the order they appear in
/// [`Event`].
pub const COLUMNS: [&str; 7] = ["pT", "mass", "Nch", "costh_HX", "phi_HX", "ctau", "ctauErr"];

/// A single reconstructed dimuon candidate.
///
/// Only `mass`, `n_ch`, `p_t`, and `costh_hx` are consumed by the model and
/// the selections; the remaining fields are carried through unchanged into
/// any derived subset.
#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize)]
pub struct Event {
    /// Transverse momentum (GeV).
    pub p_t: Float,
    /// Dimuon invariant mass (GeV), the fit observable.
    pub mass: Float,
    /// Charged-track multiplicity.
    pub n_ch: Float,
    /// cos(θ) of the positive muon in the helicity frame.
    pub costh_hx: Float,
    /// φ of the positive muon in the helicity frame (degrees).
    pub phi_hx: Float,
    /// Pseudo-proper decay length (passthrough).
    pub ctau: Float,
    /// Uncertainty on `ctau` (passthrough).
    pub ctau_err: Float,
}

/// A named, ordered, immutable collection of [`Event`]s.
///
/// Datasets are shared as [`Arc<Dataset>`]; a subset produced by
/// [`Dataset::filter`] is a new, independent dataset whose lifetime is not
/// tied to its parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    name: String,
    events: Vec<Event>,
}

impl Dataset {
    /// Create a new [`Dataset`] from a name and a list of [`Event`]s.
    pub fn new<T: AsRef<str>>(name: T, events: Vec<Event>) -> Self {
        Self {
            name: name.as_ref().to_string(),
            events,
        }
    }

    /// The name under which this dataset is registered.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return a copy of this dataset registered under a different name.
    pub fn with_name<T: AsRef<str>>(&self, name: T) -> Self {
        Self {
            name: name.as_ref().to_string(),
            events: self.events.clone(),
        }
    }

    /// The number of [`Event`]s in the [`Dataset`].
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Checks if the [`Dataset`] is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The [`Event`]s contained in the [`Dataset`].
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// An iterator over the [`Event`]s in the [`Dataset`].
    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.events.iter()
    }

    /// A parallelized iterator over the [`Event`]s in the [`Dataset`].
    #[cfg(feature = "rayon")]
    pub fn par_iter(&self) -> rayon::slice::Iter<'_, Event> {
        self.events.par_iter()
    }

    /// Apply a [`Predicate`] to every [`Event`], producing a new [`Dataset`]
    /// containing only the accepted events, registered under `name`.
    ///
    /// The subset may be empty; callers which require a non-empty subset
    /// (e.g. the fit driver) must check [`Dataset::is_empty`] themselves.
    pub fn filter<T: AsRef<str>>(&self, predicate: &Predicate, name: T) -> Arc<Dataset> {
        #[cfg(feature = "rayon")]
        let events: Vec<Event> = self
            .events
            .par_iter()
            .filter(|event| predicate.accepts(event))
            .copied()
            .collect();
        #[cfg(not(feature = "rayon"))]
        let events: Vec<Event> = self
            .events
            .iter()
            .filter(|event| predicate.accepts(event))
            .copied()
            .collect();
        Arc::new(Dataset::new(name, events))
    }
}

enum FloatColumn<'a> {
    F32(&'a Float32Array),
    F64(&'a Float64Array),
}

impl FloatColumn<'_> {
    fn value(&self, row: usize) -> Float {
        match self {
            Self::F32(array) => array.value(row) as Float,
            Self::F64(array) => array.value(row),
        }
    }
}

fn float_column<'a>(batch: &'a RecordBatch, name: &str) -> MassFitResult<FloatColumn<'a>> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| MassFitError::ColumnError {
            name: name.to_string(),
        })?;
    if let Some(array) = column.as_any().downcast_ref::<Float64Array>() {
        return Ok(FloatColumn::F64(array));
    }
    if let Some(array) = column.as_any().downcast_ref::<Float32Array>() {
        return Ok(FloatColumn::F32(array));
    }
    Err(MassFitError::ColumnError {
        name: name.to_string(),
    })
}

/// Load a [`Dataset`] from a Parquet file.
///
/// The file must contain the columns listed in [`COLUMNS`], each of a
/// floating-point type. The returned dataset is registered under `name`.
///
/// # Errors
///
/// Returns a [`MassFitError::ColumnError`] if a required column is missing or
/// not a float column, and propagates I/O and Parquet decoding errors.
pub fn open_parquet<T: AsRef<str>>(file_path: &str, name: T) -> MassFitResult<Arc<Dataset>> {
    let path = Path::new(&*shellexpand::full(file_path)?).canonicalize()?;
    let file = File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let total_rows = builder.metadata().file_metadata().num_rows() as usize;
    let reader = builder.build()?;
    let mut events = Vec::with_capacity(total_rows);
    for batch in reader {
        let batch = batch?;
        let columns: Vec<FloatColumn<'_>> = COLUMNS
            .iter()
            .map(|column_name| float_column(&batch, column_name))
            .collect::<Result<_, _>>()?;
        for row in 0..batch.num_rows() {
            events.push(Event {
                p_t: columns[0].value(row),
                mass: columns[1].value(row),
                n_ch: columns[2].value(row),
                costh_hx: columns[3].value(row),
                phi_hx: columns[4].value(row),
                ctau: columns[5].value(row),
                ctau_err: columns[6].value(row),
            });
        }
    }
    Ok(Arc::new(Dataset::new(name, events)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::selection::{Selection, Variable};

    pub(crate) fn test_event(mass: Float, n_ch: Float, p_t: Float) -> Event {
        Event {
            p_t,
            mass,
            n_ch,
            costh_hx: 0.2,
            phi_hx: 45.0,
            ctau: 0.01,
            ctau_err: 0.002,
        }
    }

    pub(crate) fn test_dataset() -> Dataset {
        Dataset::new(
            "testData",
            vec![
                test_event(9.46, 10.0, 12.0),
                test_event(10.02, 30.0, 18.0),
                test_event(10.36, 100.0, 25.0),
                test_event(9.80, 5.0, 11.0),
            ],
        )
    }

    #[test]
    fn filter_produces_independent_named_subset() {
        let dataset = test_dataset();
        let selection = Selection::bin(Variable::Pt, &[15.0, 70.0], 1).unwrap();
        let subset = dataset.filter(selection.predicate(), "data_highPt");
        assert_eq!(subset.name(), "data_highPt");
        assert_eq!(subset.len(), 2);
        assert!(subset.iter().all(|event| event.p_t > 15.0));
        drop(dataset);
        // subset remains valid after the parent is gone
        assert_eq!(subset.len(), 2);
    }

    #[test]
    fn filter_preserves_passthrough_fields() {
        let dataset = test_dataset();
        let selection = Selection::threshold(Variable::Nch, 20.0);
        let subset = dataset.filter(selection.predicate(), "data_sub");
        assert_eq!(subset.len(), 2);
        for event in subset.iter() {
            assert_eq!(event.phi_hx, 45.0);
            assert_eq!(event.ctau, 0.01);
            assert_eq!(event.ctau_err, 0.002);
        }
    }

    #[test]
    fn filter_may_be_empty() {
        let dataset = test_dataset();
        let selection = Selection::threshold(Variable::Nch, 1000.0);
        let subset = dataset.filter(selection.predicate(), "data_none");
        assert!(subset.is_empty());
    }
}
