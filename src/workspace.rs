use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
    sync::Arc,
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{data::Dataset, fit::FitResult, model::Model, Float, MassFitError, MassFitResult};

/// A complete set of model parameter values captured at one point in time,
/// retrievable by name (e.g. to redraw a fit's curve without refitting).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    name: String,
    values: IndexMap<String, Float>,
}

impl Snapshot {
    /// Create a snapshot from a name and a parameter-value map.
    pub fn new<T: AsRef<str>>(name: T, values: IndexMap<String, Float>) -> Self {
        Self {
            name: name.as_ref().to_string(),
            values,
        }
    }

    /// The name this snapshot is stored under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up one parameter value.
    pub fn value(&self, parameter: &str) -> Option<Float> {
        self.values.get(parameter).copied()
    }

    /// The stored parameter values in capture order.
    pub fn values(&self) -> &IndexMap<String, Float> {
        &self.values
    }
}

/// Behavior of an import when the target name is already taken.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ImportMode {
    /// Fail with a [`MassFitError::RegistrationError`] on a name collision.
    #[default]
    Unique,
    /// Silently replace the existing object.
    Replace,
}

/// A named container for everything one batch run produces: the full dataset,
/// every named subset, every fit result, and every parameter snapshot.
///
/// Objects are registered under unique names (the default [`ImportMode`])
/// and retrieved by name; the whole container serializes to a single file at
/// the end of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workspace {
    name: String,
    datasets: IndexMap<String, Arc<Dataset>>,
    fit_results: IndexMap<String, FitResult>,
    snapshots: IndexMap<String, Snapshot>,
}

fn insert<T>(
    map: &mut IndexMap<String, T>,
    name: String,
    value: T,
    mode: ImportMode,
) -> MassFitResult<()> {
    if mode == ImportMode::Unique && map.contains_key(&name) {
        return Err(MassFitError::RegistrationError { name });
    }
    map.insert(name, value);
    Ok(())
}

impl Workspace {
    /// Create an empty workspace.
    pub fn new<T: AsRef<str>>(name: T) -> Self {
        Self {
            name: name.as_ref().to_string(),
            ..Default::default()
        }
    }

    /// The workspace's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Import a dataset under its own name, failing on a collision.
    pub fn import_dataset(&mut self, dataset: Arc<Dataset>) -> MassFitResult<()> {
        self.import_dataset_as(dataset, ImportMode::Unique)
    }

    /// Import a dataset under its own name with explicit collision behavior.
    pub fn import_dataset_as(
        &mut self,
        dataset: Arc<Dataset>,
        mode: ImportMode,
    ) -> MassFitResult<()> {
        insert(&mut self.datasets, dataset.name().to_string(), dataset, mode)
    }

    /// Import a fit result under `name`, failing on a collision.
    pub fn import_fit_result<T: AsRef<str>>(
        &mut self,
        name: T,
        result: FitResult,
    ) -> MassFitResult<()> {
        self.import_fit_result_as(name, result, ImportMode::Unique)
    }

    /// Import a fit result under `name` with explicit collision behavior.
    pub fn import_fit_result_as<T: AsRef<str>>(
        &mut self,
        name: T,
        result: FitResult,
        mode: ImportMode,
    ) -> MassFitResult<()> {
        insert(
            &mut self.fit_results,
            name.as_ref().to_string(),
            result,
            mode,
        )
    }

    /// Store a snapshot under its own name, failing on a collision.
    pub fn save_snapshot(&mut self, snapshot: Snapshot) -> MassFitResult<()> {
        self.save_snapshot_as(snapshot, ImportMode::Unique)
    }

    /// Store a snapshot under its own name with explicit collision behavior.
    pub fn save_snapshot_as(&mut self, snapshot: Snapshot, mode: ImportMode) -> MassFitResult<()> {
        insert(
            &mut self.snapshots,
            snapshot.name().to_string(),
            snapshot,
            mode,
        )
    }

    /// Retrieve a dataset by name.
    pub fn dataset(&self, name: &str) -> Option<&Arc<Dataset>> {
        self.datasets.get(name)
    }

    /// Retrieve a fit result by name.
    pub fn fit_result(&self, name: &str) -> Option<&FitResult> {
        self.fit_results.get(name)
    }

    /// Retrieve a snapshot by name.
    pub fn snapshot(&self, name: &str) -> Option<&Snapshot> {
        self.snapshots.get(name)
    }

    /// Restore a stored snapshot into a model's current parameter state.
    ///
    /// # Errors
    ///
    /// Returns a [`MassFitError::NotFoundError`] if no snapshot exists under
    /// `name` or the snapshot does not cover the model's parameters.
    pub fn load_snapshot(&self, model: &mut Model, name: &str) -> MassFitResult<()> {
        let snapshot = self
            .snapshots
            .get(name)
            .ok_or_else(|| MassFitError::NotFoundError {
                name: name.to_string(),
            })?;
        model.load_snapshot(snapshot)
    }

    /// Names of all registered datasets, in import order.
    pub fn dataset_names(&self) -> Vec<&str> {
        self.datasets.keys().map(String::as_str).collect()
    }

    /// Names of all registered fit results, in import order.
    pub fn fit_result_names(&self) -> Vec<&str> {
        self.fit_results.keys().map(String::as_str).collect()
    }

    /// Names of all stored snapshots, in import order.
    pub fn snapshot_names(&self) -> Vec<&str> {
        self.snapshots.keys().map(String::as_str).collect()
    }

    /// Serialize the whole container to a single file.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> MassFitResult<()> {
        let file = File::create(path)?;
        bincode::serialize_into(BufWriter::new(file), self)?;
        Ok(())
    }

    /// Read a container back from a file produced by [`Workspace::write`].
    pub fn read<P: AsRef<Path>>(path: P) -> MassFitResult<Self> {
        let file = File::open(path)?;
        Ok(bincode::deserialize_from(BufReader::new(file))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::test_dataset;
    use crate::model::Observable;

    #[test]
    fn duplicate_names_are_rejected() {
        let mut workspace = Workspace::new("workspace");
        let dataset = Arc::new(test_dataset());
        workspace.import_dataset(dataset.clone()).unwrap();
        assert!(matches!(
            workspace.import_dataset(dataset.clone()),
            Err(MassFitError::RegistrationError { .. })
        ));
        workspace
            .import_dataset_as(dataset, ImportMode::Replace)
            .unwrap();
        assert_eq!(workspace.dataset_names(), vec!["testData"]);
    }

    #[test]
    fn snapshots_restore_model_state() {
        let mut workspace = Workspace::new("workspace");
        let mut model = Model::new(Observable::dimuon_mass());
        let mut shifted = model.values();
        shifted[3] += 0.02;
        model.set_values(&shifted);
        workspace.save_snapshot(model.snapshot("snap_shifted")).unwrap();
        model.reset();
        assert_ne!(model.values(), shifted);
        workspace.load_snapshot(&mut model, "snap_shifted").unwrap();
        assert_eq!(model.values(), shifted);
        assert!(matches!(
            workspace.load_snapshot(&mut model, "snap_missing"),
            Err(MassFitError::NotFoundError { .. })
        ));
    }

    #[test]
    fn round_trips_through_a_file() {
        let mut workspace = Workspace::new("workspace");
        let dataset = Arc::new(test_dataset());
        workspace.import_dataset(dataset).unwrap();
        let model = Model::new(Observable::dimuon_mass());
        workspace.save_snapshot(model.snapshot("snap_seed")).unwrap();
        let path = std::env::temp_dir().join(format!("massfit_ws_{}.bin", std::process::id()));
        workspace.write(&path).unwrap();
        let restored = Workspace::read(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(restored.name(), "workspace");
        assert_eq!(restored.dataset("testData").unwrap().len(), 4);
        assert_eq!(
            restored.snapshot("snap_seed").unwrap().value("mean1S"),
            Some(crate::model::M_1S)
        );
    }
}
