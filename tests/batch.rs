use std::sync::Arc;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use massfit::{
    fit, run_batch, Dataset, Event, FitOptions, MassFitError, Model, Observable, Selection,
    Variable, Workspace,
};

/// Masses drawn from a model with known fractions, attached to alternating
/// multiplicity/momentum values so selections split the sample predictably.
fn toy_dataset(n: usize, seed: u64) -> (Arc<Dataset>, Vec<f64>) {
    let mut model = Model::new(Observable::dimuon_mass());
    // a0 a1 a2 mean1S sigma1S alpha n fBkg f1S f2S
    let truth = vec![0.3, -0.1, 0.0, 9.46, 0.08, 1.33, 6.6, 0.4, 0.3, 0.15];
    model.set_values(&truth);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let masses = model.sample(n, &mut rng).unwrap();
    let events = masses
        .iter()
        .enumerate()
        .map(|(index, &mass)| Event {
            p_t: if index % 2 == 0 { 12.0 } else { 25.0 },
            mass,
            n_ch: if index % 3 == 0 { 10.0 } else { 50.0 },
            costh_hx: 0.1,
            phi_hx: 0.0,
            ctau: 0.0,
            ctau_err: 0.001,
        })
        .collect();
    (Arc::new(Dataset::new("fitData", events)), truth)
}

fn quiet_options() -> FitOptions {
    FitOptions {
        num_threads: 2,
        ..Default::default()
    }
}

#[test]
fn fit_recovers_toy_fractions() {
    // A linear background keeps the Chebyshev coefficients and the Crystal
    // Ball tail distinguishable; with the cubic model and a few thousand
    // events the two are degenerate and the background fraction drifts far
    // beyond its parabolic error.
    let n = 25_000;
    let mut generator = Model::with_background_order(Observable::dimuon_mass(), 1);
    // a0 mean1S sigma1S alpha n fBkg f1S f2S
    let truth = vec![0.3, 9.46, 0.08, 1.33, 6.6, 0.4, 0.3, 0.15];
    generator.set_values(&truth);
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    let events: Vec<Event> = generator
        .sample(n, &mut rng)
        .unwrap()
        .into_iter()
        .map(|mass| Event {
            mass,
            ..Default::default()
        })
        .collect();
    let data = Dataset::new("fitData", events);
    let mut model = Model::with_background_order(Observable::dimuon_mass(), 1);
    let result = fit(&mut model, &data, &quiet_options()).unwrap();
    assert_eq!(result.n_events, n);
    let f_bkg = result.parameter("fBkg").unwrap().value;
    assert!(
        (f_bkg - truth[5]).abs() < 0.05,
        "fBkg = {f_bkg}, expected about {}",
        truth[5]
    );
    let mean = result.parameter("mean1S").unwrap().value;
    assert!((mean - 9.46).abs() < 0.02, "mean1S = {mean}");
}

#[test]
fn batch_registers_every_selection_in_order() {
    let (data, _) = toy_dataset(1500, 2);
    let mut workspace = Workspace::new("fitResults");
    let mut model = Model::new(Observable::dimuon_mass());
    let edges = [0.0, 20.0, 180.0];
    let selections = vec![
        Selection::bin(Variable::Nch, &edges, 1).unwrap(),
        Selection::bin(Variable::Nch, &edges, 2).unwrap(),
    ];
    let results = run_batch(
        &mut workspace,
        &mut model,
        &data,
        &selections,
        &quiet_options(),
    )
    .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, "Nch_0p0to20p0");
    assert_eq!(results[1].0, "Nch_20p0to180p0");
    for (name, result) in &results {
        assert!(workspace.dataset(&format!("data_{name}")).is_some());
        let stored = workspace.fit_result(&format!("fitResult_{name}")).unwrap();
        assert_eq!(stored.n_events, result.n_events);
        let snapshot = workspace.snapshot(&format!("snap_{name}")).unwrap();
        // the snapshot is the fit's converged state
        for parameter in &result.parameters {
            assert_eq!(snapshot.value(&parameter.name), Some(parameter.value));
        }
    }
    // subsets partition the sample
    let n_low = workspace.dataset("data_Nch_0p0to20p0").unwrap().len();
    let n_high = workspace.dataset("data_Nch_20p0to180p0").unwrap().len();
    assert_eq!(n_low + n_high, data.len());
}

#[test]
fn later_fits_start_from_the_previous_converged_state() {
    let (data, _) = toy_dataset(1500, 3);
    let mut workspace = Workspace::new("fitResults");
    let mut model = Model::new(Observable::dimuon_mass());
    let first = Selection::threshold(Variable::Nch, 0.0);
    let selections = vec![first.clone()];
    run_batch(
        &mut workspace,
        &mut model,
        &data,
        &selections,
        &quiet_options(),
    )
    .unwrap();
    // the model now carries the first fit's converged values, which seed any
    // subsequent fit
    let snapshot = workspace
        .snapshot(&format!("snap_{}", first.name()))
        .unwrap();
    for (name, value) in model
        .names()
        .into_iter()
        .zip(model.values())
    {
        assert_eq!(snapshot.value(&name), Some(value));
    }
    assert_ne!(model.values(), Model::new(Observable::dimuon_mass()).values());
}

#[test]
fn batch_aborts_on_an_empty_subset() {
    let (data, _) = toy_dataset(300, 4);
    let mut workspace = Workspace::new("fitResults");
    let mut model = Model::new(Observable::dimuon_mass());
    let edges = [0.0, 180.0];
    let selections = vec![
        Selection::bin(Variable::Nch, &edges, 1).unwrap(),
        Selection::threshold(Variable::Nch, 1.0e6),
        Selection::bin(Variable::Pt, &[15.0, 70.0], 1).unwrap(),
    ];
    let error = run_batch(
        &mut workspace,
        &mut model,
        &data,
        &selections,
        &quiet_options(),
    )
    .unwrap_err();
    assert!(matches!(error, MassFitError::EmptySelection { .. }));
    // the first selection was processed, the one after the failure was not
    assert!(workspace.fit_result("fitResult_Nch_0p0to180p0").is_some());
    assert!(workspace.fit_result("fitResult_pT_15p0to70p0").is_none());
}

#[test]
fn name_collisions_abort_the_batch() {
    let (data, _) = toy_dataset(300, 5);
    let mut workspace = Workspace::new("fitResults");
    let mut model = Model::new(Observable::dimuon_mass());
    let selection = Selection::bin(Variable::Pt, &[10.0, 70.0], 1).unwrap();
    let selections = vec![selection.clone(), selection];
    let error = run_batch(
        &mut workspace,
        &mut model,
        &data,
        &selections,
        &quiet_options(),
    )
    .unwrap_err();
    assert!(matches!(error, MassFitError::RegistrationError { .. }));
}
