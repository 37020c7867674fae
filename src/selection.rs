use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::{data::Event, Float, MassFitError, MassFitResult};

/// A numeric field of an [`Event`] that selections may cut on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Variable {
    /// Transverse momentum `pT`.
    Pt,
    /// Invariant mass `mass`.
    Mass,
    /// Charged multiplicity `Nch`.
    Nch,
    /// Helicity-frame cos(θ), `costh_HX`.
    CosthHX,
    /// |cos(θ)| in the helicity frame; binning variable for angular bins.
    AbsCosthHX,
    /// Helicity-frame φ, `phi_HX`.
    PhiHX,
    /// Pseudo-proper decay length `ctau`.
    Ctau,
    /// Uncertainty on `ctau`.
    CtauErr,
}

impl Variable {
    /// Evaluate this variable on an [`Event`].
    pub fn value(&self, event: &Event) -> Float {
        match self {
            Self::Pt => event.p_t,
            Self::Mass => event.mass,
            Self::Nch => event.n_ch,
            Self::CosthHX => event.costh_hx,
            Self::AbsCosthHX => event.costh_hx.abs(),
            Self::PhiHX => event.phi_hx,
            Self::Ctau => event.ctau,
            Self::CtauErr => event.ctau_err,
        }
    }

    /// The name used when rendering cut expressions.
    pub fn expr_name(&self) -> &'static str {
        match self {
            Self::Pt => "pT",
            Self::Mass => "mass",
            Self::Nch => "Nch",
            Self::CosthHX => "costh_HX",
            Self::AbsCosthHX => "abs(costh_HX)",
            Self::PhiHX => "phi_HX",
            Self::Ctau => "ctau",
            Self::CtauErr => "ctauErr",
        }
    }

    /// The name used when deriving selection names (identifier-safe, so
    /// `AbsCosthHX` drops the function-call syntax of its expression name).
    pub fn label(&self) -> &'static str {
        match self {
            Self::AbsCosthHX => "absCosth",
            Self::CosthHX => "costh",
            Self::PhiHX => "phi",
            other => other.expr_name(),
        }
    }
}

/// A boolean predicate over the numeric fields of an [`Event`].
///
/// Predicates form a small closed set of typed variants rather than strings:
/// an open-interval window, a strictly-greater-than threshold, and logical
/// AND of two predicates. The [`Display`] implementation renders the
/// conventional cut-expression string, e.g.
/// `(Nch > 0 && Nch < 180) && (pT > 15 && pT < 70)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// `low < var < high`, both bounds exclusive.
    Window {
        /// The variable being cut on.
        var: Variable,
        /// Exclusive lower edge.
        low: Float,
        /// Exclusive upper edge.
        high: Float,
    },
    /// `var > min`. Strictly-greater-than is the only threshold variant;
    /// there is no upper-bound-only counterpart (a deliberately preserved
    /// limitation of the selection scheme).
    GreaterThan {
        /// The variable being cut on.
        var: Variable,
        /// Exclusive lower bound.
        min: Float,
    },
    /// Both predicates must accept, evaluated left then right.
    And(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    /// Check whether an [`Event`] satisfies this predicate.
    pub fn accepts(&self, event: &Event) -> bool {
        match self {
            Self::Window { var, low, high } => {
                let value = var.value(event);
                value > *low && value < *high
            }
            Self::GreaterThan { var, min } => var.value(event) > *min,
            Self::And(lhs, rhs) => lhs.accepts(event) && rhs.accepts(event),
        }
    }

    /// Combine two predicates with logical AND, preserving order.
    pub fn and(self, other: Predicate) -> Predicate {
        Predicate::And(Box::new(self), Box::new(other))
    }
}

impl Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Window { var, low, high } => {
                let name = var.expr_name();
                write!(f, "({name} > {low} && {name} < {high})")
            }
            Self::GreaterThan { var, min } => write!(f, "{} > {min}", var.expr_name()),
            Self::And(lhs, rhs) => write!(f, "{lhs} && {rhs}"),
        }
    }
}

/// Format a numeric edge for use inside an identifier or filename.
///
/// Every value renders with at least one fractional digit, and the decimal
/// point becomes the literal character `p` (`0.5` → `0p5`, `15.0` → `15p0`),
/// since identifiers and filenames must not contain `.`. Distinct fractional
/// parts therefore never collide (`0.1` → `0p1`, `0.15` → `0p15`). The sign
/// of a negative value is kept as-is.
pub fn format_edge(value: Float) -> String {
    // Debug formatting of a float always includes the decimal point.
    format!("{value:?}").replace('.', "p")
}

/// A named boolean selection over one or more [`Event`] fields.
///
/// Names are derived deterministically from the cut edges and must be unique
/// within a batch; the fit driver enforces uniqueness at registration time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    name: String,
    predicate: Predicate,
}

impl Selection {
    /// Create a selection for bin `index` of `edges` on `var`, named
    /// `<label>_<low>to<high>` with [`format_edge`] rendering.
    ///
    /// Bins are numbered from 1, so `index` must lie in
    /// `[1, edges.len() - 1]` and the bin spans
    /// `(edges[index - 1], edges[index])`, both edges exclusive.
    ///
    /// # Errors
    ///
    /// Returns a [`MassFitError::BinIndexError`] for an out-of-range index
    /// and a [`MassFitError::EdgeOrderError`] if the edges are not ordered.
    pub fn bin(var: Variable, edges: &[Float], index: usize) -> MassFitResult<Self> {
        if index == 0 || index >= edges.len() {
            return Err(MassFitError::BinIndexError {
                index,
                n_edges: edges.len(),
            });
        }
        let (low, high) = (edges[index - 1], edges[index]);
        if low >= high {
            return Err(MassFitError::EdgeOrderError { low, high });
        }
        Ok(Self {
            name: format!(
                "{}_{}to{}",
                var.label(),
                format_edge(low),
                format_edge(high)
            ),
            predicate: Predicate::Window { var, low, high },
        })
    }

    /// Create a strictly-greater-than threshold selection on `var`, named
    /// `<label>_<value>`.
    ///
    /// Only lower-bound thresholds exist; see [`Predicate::GreaterThan`].
    pub fn threshold(var: Variable, value: Float) -> Self {
        Self {
            name: format!("{}_{}", var.label(), format_edge(value)),
            predicate: Predicate::GreaterThan { var, min: value },
        }
    }

    /// Combine two selections: predicates joined with AND, names joined with
    /// `_`, this selection's cut first.
    pub fn and(self, other: Selection) -> Selection {
        Selection {
            name: format!("{}_{}", self.name, other.name),
            predicate: self.predicate.and(other.predicate),
        }
    }

    /// The deterministic, identifier-safe name of this selection.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The typed predicate defining this selection.
    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    /// The selection's predicate rendered as a cut-expression string.
    pub fn expr(&self) -> String {
        self.predicate.to_string()
    }
}

/// The nine |cosθ| bins used for the angular scan
/// (edges 0.0, 0.1, …, 0.8, 1.0).
pub fn abs_costh_bins() -> Vec<Selection> {
    const EDGES: [Float; 10] = [0.0, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 1.0];
    (1..EDGES.len())
        .map(|index| {
            Selection::bin(Variable::AbsCosthHX, &EDGES, index)
                .expect("indices are constructed in range")
        })
        .collect()
}

/// The six multiplicity thresholds used for the Nch scan.
pub fn nch_thresholds() -> Vec<Selection> {
    const CUTS: [Float; 6] = [2.0, 4.0, 5.0, 6.0, 8.0, 10.0];
    CUTS.iter()
        .map(|&cut| Selection::threshold(Variable::Nch, cut))
        .collect()
}

/// The combined multiplicity/transverse-momentum windows fitted in the
/// Nch × pT scan. The Nch cut always comes first in the combined name.
pub fn nch_pt_windows() -> MassFitResult<Vec<Selection>> {
    const WINDOWS: [([Float; 2], [Float; 2]); 9] = [
        ([15.0, 70.0], [0.0, 180.0]),
        ([10.0, 70.0], [23.0, 180.0]),
        ([10.0, 70.0], [20.0, 180.0]),
        ([10.0, 15.0], [0.0, 20.0]),
        ([10.0, 12.0], [0.0, 20.0]),
        ([12.0, 15.0], [0.0, 20.0]),
        ([15.0, 70.0], [20.0, 180.0]),
        ([15.0, 70.0], [0.0, 20.0]),
        ([15.0, 70.0], [0.0, 23.0]),
    ];
    WINDOWS
        .iter()
        .map(|(p_t, n_ch)| {
            Ok(Selection::bin(Variable::Nch, n_ch, 1)?
                .and(Selection::bin(Variable::Pt, p_t, 1)?))
        })
        .collect()
}
