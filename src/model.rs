use indexmap::IndexMap;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{workspace::Snapshot, Float, MassFitError, MassFitResult};

/// PDG mass of the Υ(1S) resonance (GeV).
pub const M_1S: Float = 9.460;
/// PDG mass of the Υ(2S) resonance (GeV).
pub const M_2S: Float = 10.023;
/// PDG mass of the Υ(3S) resonance (GeV).
pub const M_3S: Float = 10.355;

/// Fixed scale ratio m(2S)/m(1S) linking the 2S peak to the 1S peak.
pub const R_2S_1S: Float = M_2S / M_1S;
/// Fixed scale ratio m(3S)/m(1S) linking the 3S peak to the 1S peak.
pub const R_3S_1S: Float = M_3S / M_1S;

/// Width and tail parameters below this value make the peak shape
/// degenerate; the likelihood treats such points as invalid.
const SHAPE_EPS: Float = 1e-9;

/// A named, bounded scalar observable with a fit sub-range.
///
/// The sub-range restricts both the likelihood evaluation and the component
/// normalizations; events outside it do not enter any fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observable {
    name: String,
    min: Float,
    max: Float,
    fit_min: Float,
    fit_max: Float,
}

impl Observable {
    /// Create an observable over `range` with a fit sub-range.
    ///
    /// # Errors
    ///
    /// Returns a [`MassFitError::RangeError`] unless
    /// `range.0 <= fit_range.0 < fit_range.1 <= range.1`.
    pub fn new<T: AsRef<str>>(
        name: T,
        range: (Float, Float),
        fit_range: (Float, Float),
    ) -> MassFitResult<Self> {
        let (min, max) = range;
        let (fit_min, fit_max) = fit_range;
        if !(min <= fit_min && fit_min < fit_max && fit_max <= max) {
            return Err(MassFitError::RangeError {
                min,
                max,
                fit_min,
                fit_max,
            });
        }
        Ok(Self {
            name: name.as_ref().to_string(),
            min,
            max,
            fit_min,
            fit_max,
        })
    }

    /// The dimuon invariant mass observable: declared range
    /// (8.4, 11.6) GeV, fit sub-range (8.6, 11.4) GeV.
    pub fn dimuon_mass() -> Self {
        Self::new("mass", (8.4, 11.6), (8.6, 11.4)).expect("default ranges are valid")
    }

    /// The observable's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared full range.
    pub fn range(&self) -> (Float, Float) {
        (self.min, self.max)
    }

    /// The fit sub-range used for likelihood evaluation.
    pub fn fit_range(&self) -> (Float, Float) {
        (self.fit_min, self.fit_max)
    }

    /// Checks whether a value lies inside the fit sub-range.
    pub fn in_fit_range(&self, value: Float) -> bool {
        value >= self.fit_min && value <= self.fit_max
    }
}

/// A single free parameter: its current value, the seed it resets to, and
/// its box bounds for the minimizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    name: String,
    value: Float,
    seed: Float,
    min: Float,
    max: Float,
}

impl Parameter {
    fn new(name: &str, seed: Float, min: Float, max: Float) -> Self {
        Self {
            name: name.to_string(),
            value: seed,
            seed,
            min,
            max,
        }
    }

    /// The parameter's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The parameter's current value.
    pub fn value(&self) -> Float {
        self.value
    }

    /// The value the parameter was seeded with (restored by [`Model::reset`]).
    pub fn seed(&self) -> Float {
        self.seed
    }

    /// The parameter's box bounds.
    pub fn bounds(&self) -> (Float, Float) {
        (self.min, self.max)
    }
}

/// The composite Υ(nS) mass model: a Chebyshev background plus three Crystal
/// Ball peaks sharing one set of shape parameters.
///
/// Only the 1S mean and width are free; the 2S and 3S peaks reuse them scaled
/// by the fixed PDG mass ratios [`R_2S_1S`] and [`R_3S_1S`], which halves the
/// effective free-parameter count versus independent peaks. The mixture is
/// parametrized by three free fractions (`fBkg`, `f1S`, `f2S`); the 3S
/// fraction is implied by normalization and validated explicitly.
///
/// The model owns its parameters' current values and is mutated in place by
/// every fit, so sequential fits are warm-started. Call [`Model::reset`] to
/// return every parameter to its seed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    observable: Observable,
    parameters: IndexMap<String, Parameter>,
    background_order: usize,
}

impl Model {
    /// Build the model over `observable` with the default cubic background
    /// (three free Chebyshev coefficients).
    pub fn new(observable: Observable) -> Self {
        Self::with_background_order(observable, 3)
    }

    /// Build the model with a background polynomial of the given order
    /// (`background_order` free Chebyshev coefficients, each bounded to
    /// [-1, 1]).
    pub fn with_background_order(observable: Observable, background_order: usize) -> Self {
        let (obs_min, obs_max) = observable.range();
        let mut parameters = IndexMap::new();
        for index in 0..background_order {
            let name = format!("a{index}");
            let seed = if index == 0 { 0.5 } else { 0.0 };
            parameters.insert(name.clone(), Parameter::new(&name, seed, -1.0, 1.0));
        }
        for parameter in [
            Parameter::new("mean1S", M_1S, obs_min, obs_max),
            Parameter::new("sigma1S", 0.1, 0.0, 2.5),
            Parameter::new("alpha", 1.33, 0.0, 2.5),
            Parameter::new("n", 6.6, 0.0, 10.0),
            Parameter::new("fBkg", 0.5, 0.0, 1.0),
            Parameter::new("f1S", 0.2, 0.0, 1.0),
            Parameter::new("f2S", 0.15, 0.0, 1.0),
        ] {
            parameters.insert(parameter.name.clone(), parameter);
        }
        Self {
            observable,
            parameters,
            background_order,
        }
    }

    /// The observable this model is defined over.
    pub fn observable(&self) -> &Observable {
        &self.observable
    }

    /// The number of free Chebyshev background coefficients.
    pub fn background_order(&self) -> usize {
        self.background_order
    }

    /// The number of free parameters.
    pub fn n_parameters(&self) -> usize {
        self.parameters.len()
    }

    /// Parameter names in the order used by [`Model::values`] and the
    /// minimizer.
    pub fn names(&self) -> Vec<String> {
        self.parameters.keys().cloned().collect()
    }

    /// Look up a parameter by name.
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.get(name)
    }

    /// The current parameter values, in registration order.
    pub fn values(&self) -> Vec<Float> {
        self.parameters
            .values()
            .map(|parameter| parameter.value)
            .collect()
    }

    /// The box bounds for every parameter, in registration order.
    pub fn bounds(&self) -> Vec<(Float, Float)> {
        self.parameters
            .values()
            .map(|parameter| (parameter.min, parameter.max))
            .collect()
    }

    /// Overwrite the current parameter values (the warm-start state observed
    /// by the next fit).
    pub fn set_values(&mut self, values: &[Float]) {
        debug_assert_eq!(values.len(), self.parameters.len());
        for (parameter, &value) in self.parameters.values_mut().zip(values) {
            parameter.value = value;
        }
    }

    /// Restore every parameter to its seed value.
    ///
    /// Fits warm-start from the model's current values; callers requiring
    /// independent fits must call this between fits explicitly.
    pub fn reset(&mut self) {
        for parameter in self.parameters.values_mut() {
            parameter.value = parameter.seed;
        }
    }

    /// Capture the complete current parameter state under `name`.
    pub fn snapshot<T: AsRef<str>>(&self, name: T) -> Snapshot {
        Snapshot::new(
            name,
            self.parameters
                .iter()
                .map(|(name, parameter)| (name.clone(), parameter.value))
                .collect(),
        )
    }

    /// Restore the parameter state captured in a [`Snapshot`].
    ///
    /// # Errors
    ///
    /// Returns a [`MassFitError::NotFoundError`] if the snapshot does not
    /// provide a value for every model parameter.
    pub fn load_snapshot(&mut self, snapshot: &Snapshot) -> MassFitResult<()> {
        for (name, parameter) in self.parameters.iter_mut() {
            parameter.value = snapshot
                .value(name)
                .ok_or_else(|| MassFitError::NotFoundError { name: name.clone() })?;
        }
        Ok(())
    }

    fn index(&self, name: &str) -> usize {
        self.parameters
            .get_index_of(name)
            .expect("model parameters are fixed at construction")
    }

    /// Compute the implied 3S fraction `1 - fBkg - f1S - f2S` from a
    /// parameter vector.
    ///
    /// # Errors
    ///
    /// Returns a [`MassFitError::FractionError`] if the free fractions sum
    /// above unity.
    pub fn implied_fraction(&self, values: &[Float]) -> MassFitResult<Float> {
        let sum = values[self.index("fBkg")] + values[self.index("f1S")] + values[self.index("f2S")];
        if sum > 1.0 {
            return Err(MassFitError::FractionError { sum });
        }
        Ok(1.0 - sum)
    }

    /// Resolve a parameter vector into the per-component terms of the
    /// density: coefficients, derived peak positions and widths, component
    /// normalizations over the fit sub-range, and all four fractions.
    ///
    /// # Errors
    ///
    /// Returns a [`MassFitError::FractionError`] if the free fractions sum
    /// above unity, and a [`MassFitError::Custom`] if a shape parameter or a
    /// component normalization is degenerate.
    pub fn terms(&self, values: &[Float]) -> MassFitResult<ModelTerms> {
        let f3s = self.implied_fraction(values)?;
        let coefficients = (0..self.background_order)
            .map(|index| values[self.index(&format!("a{index}"))])
            .collect::<Vec<Float>>();
        let mean = values[self.index("mean1S")];
        let sigma = values[self.index("sigma1S")];
        let alpha = values[self.index("alpha")];
        let n = values[self.index("n")];
        if sigma < SHAPE_EPS || alpha < SHAPE_EPS {
            return Err(MassFitError::Custom(format!(
                "degenerate peak shape: sigma = {sigma}, alpha = {alpha}"
            )));
        }
        let (obs_min, obs_max) = self.observable.range();
        let (fit_min, fit_max) = self.observable.fit_range();
        let half_width = 0.5 * (obs_max - obs_min);
        let xp = |x: Float| (2.0 * x - (obs_min + obs_max)) / (obs_max - obs_min);
        let background_norm =
            half_width * chebyshev_integral(&coefficients, xp(fit_min), xp(fit_max));
        if !background_norm.is_finite() || background_norm <= 0.0 {
            return Err(MassFitError::Custom(format!(
                "background normalization is not positive: {background_norm}"
            )));
        }
        let mut peaks = [Peak::default(); 3];
        for (peak, ratio) in peaks.iter_mut().zip([1.0, R_2S_1S, R_3S_1S]) {
            let peak_mean = mean * ratio;
            let peak_sigma = sigma * ratio;
            let z_lo = (fit_min - peak_mean) / peak_sigma;
            let z_hi = (fit_max - peak_mean) / peak_sigma;
            let norm = peak_sigma * crystal_ball_integral(z_lo, z_hi, alpha, n);
            if !norm.is_finite() || norm <= 0.0 {
                return Err(MassFitError::Custom(format!(
                    "peak normalization is not positive: {norm}"
                )));
            }
            *peak = Peak {
                mean: peak_mean,
                sigma: peak_sigma,
                norm,
            };
        }
        Ok(ModelTerms {
            observable_range: (obs_min, obs_max),
            fit_range: (fit_min, fit_max),
            coefficients,
            background_norm,
            alpha,
            n,
            peaks,
            fractions: [
                values[self.index("fBkg")],
                values[self.index("f1S")],
                values[self.index("f2S")],
                f3s,
            ],
        })
    }

    /// Evaluate the normalized density at `x` for the given parameter
    /// vector. Normalization is over the fit sub-range.
    pub fn pdf(&self, values: &[Float], x: Float) -> MassFitResult<Float> {
        Ok(self.terms(values)?.density(x))
    }

    /// Draw `n` observable values from the model's current parameter state by
    /// rejection sampling over the fit sub-range.
    ///
    /// Intended for toy studies and closure tests.
    pub fn sample<R: Rng>(&self, n: usize, rng: &mut R) -> MassFitResult<Vec<Float>> {
        let terms = self.terms(&self.values())?;
        let (fit_min, fit_max) = self.observable.fit_range();
        let n_grid = 512;
        let ceiling = (0..=n_grid)
            .map(|index| {
                let x = fit_min + (fit_max - fit_min) * index as Float / n_grid as Float;
                terms.density(x)
            })
            .fold(0.0, Float::max)
            * 1.1;
        if !ceiling.is_finite() || ceiling <= 0.0 {
            return Err(MassFitError::Custom(format!(
                "cannot sample from a density with ceiling {ceiling}"
            )));
        }
        let mut samples = Vec::with_capacity(n);
        while samples.len() < n {
            let x = rng.gen_range(fit_min..fit_max);
            let u: Float = rng.gen_range(0.0..ceiling);
            if u < terms.density(x) {
                samples.push(x);
            }
        }
        Ok(samples)
    }
}

/// One resolved peak: derived mean and width plus its normalization integral
/// over the fit sub-range.
#[derive(Debug, Copy, Clone, Default)]
pub struct Peak {
    /// The peak position (1S value times the fixed ratio).
    pub mean: Float,
    /// The peak width (1S value times the fixed ratio).
    pub sigma: Float,
    /// The normalization integral of the unnormalized shape.
    pub norm: Float,
}

/// A parameter vector resolved into evaluable density components.
///
/// Building the terms once per parameter vector keeps the per-event density
/// evaluation free of validation and normalization work.
#[derive(Debug, Clone)]
pub struct ModelTerms {
    observable_range: (Float, Float),
    fit_range: (Float, Float),
    coefficients: Vec<Float>,
    background_norm: Float,
    alpha: Float,
    n: Float,
    peaks: [Peak; 3],
    fractions: [Float; 4],
}

impl ModelTerms {
    /// The resolved peaks (1S, 2S, 3S).
    pub fn peaks(&self) -> &[Peak; 3] {
        &self.peaks
    }

    /// The mixture fractions `[fBkg, f1S, f2S, f3S]` (the last implied).
    pub fn fractions(&self) -> &[Float; 4] {
        &self.fractions
    }

    /// Evaluate the normalized mixture density at `x`.
    ///
    /// The value may be non-positive if the background polynomial dips below
    /// zero at `x`; the likelihood treats such points as invalid.
    pub fn density(&self, x: Float) -> Float {
        let (obs_min, obs_max) = self.observable_range;
        let xp = (2.0 * x - (obs_min + obs_max)) / (obs_max - obs_min);
        let background = chebyshev_value(&self.coefficients, xp) / self.background_norm;
        let mut density = self.fractions[0] * background;
        for (peak, fraction) in self.peaks.iter().zip(&self.fractions[1..]) {
            let z = (x - peak.mean) / peak.sigma;
            density += fraction * crystal_ball_value(z, self.alpha, self.n) / peak.norm;
        }
        density
    }

    /// The fit sub-range the terms are normalized over.
    pub fn fit_range(&self) -> (Float, Float) {
        self.fit_range
    }
}

/// The unnormalized Chebyshev background shape `1 + Σ c_k T_k(xp)` with `xp`
/// in [-1, 1].
fn chebyshev_value(coefficients: &[Float], xp: Float) -> Float {
    let mut value = 1.0;
    let mut t_prev = 1.0;
    let mut t = xp;
    for &coefficient in coefficients {
        value += coefficient * t;
        let t_next = 2.0 * xp * t - t_prev;
        t_prev = t;
        t = t_next;
    }
    value
}

/// Antiderivative of `T_k` evaluated at `t`, for `k` from 0 upward.
fn chebyshev_antiderivative(k: usize, t: Float) -> Float {
    match k {
        0 => t,
        1 => 0.5 * t * t,
        _ => {
            // ∫ T_k = (T_{k+1} / (k+1) - T_{k-1} / (k-1)) / 2
            let mut t_prev = 1.0;
            let mut t_curr = t;
            for _ in 1..k {
                let t_next = 2.0 * t * t_curr - t_prev;
                t_prev = t_curr;
                t_curr = t_next;
            }
            // t_prev = T_{k-1}(t), t_curr = T_k(t)
            let t_next = 2.0 * t * t_curr - t_prev;
            0.5 * (t_next / (k + 1) as Float - t_prev / (k - 1) as Float)
        }
    }
}

/// Integral of the unnormalized Chebyshev shape over `[lo, hi]` in the
/// mapped coordinate.
fn chebyshev_integral(coefficients: &[Float], lo: Float, hi: Float) -> Float {
    let mut integral = hi - lo;
    for (index, &coefficient) in coefficients.iter().enumerate() {
        let k = index + 1;
        integral += coefficient * (chebyshev_antiderivative(k, hi) - chebyshev_antiderivative(k, lo));
    }
    integral
}

/// The unnormalized Crystal Ball shape in the standardized coordinate
/// `z = (x - mean) / sigma`: a Gaussian core with a power-law low-side tail.
fn crystal_ball_value(z: Float, alpha: Float, n: Float) -> Float {
    if z > -alpha {
        (-0.5 * z * z).exp()
    } else {
        let a = (n / alpha).powf(n) * (-0.5 * alpha * alpha).exp();
        let b = n / alpha - alpha;
        a * (b - z).powf(-n)
    }
}

/// Integral of the unnormalized Crystal Ball shape over `[z_lo, z_hi]`.
fn crystal_ball_integral(z_lo: Float, z_hi: Float, alpha: Float, n: Float) -> Float {
    use std::f64::consts::PI;
    let mut integral = 0.0;
    // Gaussian core above -alpha.
    let core_lo = z_lo.max(-alpha);
    if z_hi > core_lo {
        integral +=
            (0.5 * PI).sqrt() * (erf(z_hi / Float::sqrt(2.0)) - erf(core_lo / Float::sqrt(2.0)));
    }
    // Power-law tail below -alpha.
    let tail_hi = z_hi.min(-alpha);
    if tail_hi > z_lo {
        let a = (n / alpha).powf(n) * (-0.5 * alpha * alpha).exp();
        let b = n / alpha - alpha;
        if (n - 1.0).abs() < 1e-6 {
            integral += a * ((b - z_lo) / (b - tail_hi)).ln();
        } else {
            integral +=
                a / (n - 1.0) * ((b - tail_hi).powf(1.0 - n) - (b - z_lo).powf(1.0 - n));
        }
    }
    integral
}

/// Approximate error function (Abramowitz & Stegun 7.1.26, |ε| < 2.5e-5).
fn erf(x: Float) -> Float {
    if x < 0.0 {
        return -erf(-x);
    }
    let t = 1.0 / (1.0 + 0.47047 * x);
    let poly = t * (0.3480242 + t * (-0.0958798 + t * 0.7478556));
    1.0 - poly * (-x * x).exp()
}
