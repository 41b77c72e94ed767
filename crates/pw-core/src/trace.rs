//! Read-only execution-trace records consumed by the estimator.
//!
//! A `Trace` is produced by the surrounding program executor: one `Site` per
//! recorded statement, carrying the frame stack it ran under, its
//! score-function term, and its enumeration configuration. This module only
//! models and validates those records; it never executes anything.

use crate::{Frame, Value};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteKind {
    /// A random-choice statement.
    Sample,
    /// A learned-parameter statement; contributes no correction weight.
    Param,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Enumerate {
    /// The choice is marginalized by re-running the program once per value;
    /// the recounted probability mass needs a denominator correction.
    Sequential,
    /// The choice is marginalized in-band along a dedicated axis; no
    /// denominator correction is needed here.
    Parallel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferConfig {
    pub enumerate: Option<Enumerate>,
    /// Total enumerated-value count; required when `enumerate` is
    /// `Sequential`.
    pub enum_total: Option<u64>,
}

impl InferConfig {
    #[must_use]
    pub fn monte_carlo() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sequential(enum_total: u64) -> Self {
        Self {
            enumerate: Some(Enumerate::Sequential),
            enum_total: Some(enum_total),
        }
    }

    #[must_use]
    pub fn parallel() -> Self {
        Self {
            enumerate: Some(Enumerate::Parallel),
            enum_total: None,
        }
    }
}

/// One recorded statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub name: String,
    pub kind: SiteKind,
    /// Subsample-index bookkeeping sites are excluded from estimation
    /// entirely.
    pub subsample: bool,
    /// The gradient-carrying log-probability contribution, or the scalar
    /// exact-zero sentinel when the site has none (e.g. fully
    /// reparameterized choices).
    pub score_function: Value,
    pub infer: InferConfig,
    /// Innermost-last stack of the batch contexts this site ran under.
    pub frames: SmallVec<[Frame; 4]>,
}

impl Site {
    #[must_use]
    pub fn sample(
        name: impl Into<String>,
        score_function: Value,
        frames: impl IntoIterator<Item = Frame>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: SiteKind::Sample,
            subsample: false,
            score_function,
            infer: InferConfig::monte_carlo(),
            frames: frames.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn with_infer(mut self, infer: InferConfig) -> Self {
        self.infer = infer;
        self
    }

    #[must_use]
    pub fn as_subsample(mut self) -> Self {
        self.subsample = true;
        self
    }

    /// Vectorized frames of this site's stack, innermost last.
    #[must_use]
    pub fn vectorized_frames(&self) -> Vec<Frame> {
        self.frames.iter().filter(|f| f.vectorized).cloned().collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    sites: Vec<Site>,
}

impl Trace {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, site: Site) {
        self.sites.push(site);
    }

    #[must_use]
    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    #[must_use]
    pub fn site(&self, name: &str) -> Option<&Site> {
        self.sites.iter().find(|s| s.name == name)
    }

    /// Structural validation, surfaced before any estimation touches the
    /// trace. Catches the caller bugs the estimator would otherwise turn
    /// into wrong numbers: duplicate site names, sequential enumeration
    /// without its total, vectorized frames without a usable axis.
    pub fn validate(&self) -> Result<(), TraceError> {
        let mut seen = BTreeSet::new();
        for site in &self.sites {
            if !seen.insert(site.name.as_str()) {
                return Err(TraceError::DuplicateSite {
                    name: site.name.clone(),
                });
            }

            if site.infer.enumerate == Some(Enumerate::Sequential)
                && site.infer.enum_total.is_none()
            {
                return Err(TraceError::MissingEnumTotal {
                    site: site.name.clone(),
                });
            }

            for frame in &site.frames {
                if !frame.vectorized {
                    continue;
                }
                match frame.dim {
                    None => {
                        return Err(TraceError::MissingFrameAxis {
                            site: site.name.clone(),
                            frame: frame.name.clone(),
                        });
                    }
                    Some(dim) if dim >= 0 => {
                        return Err(TraceError::NonNegativeFrameAxis {
                            site: site.name.clone(),
                            frame: frame.name.clone(),
                            axis: dim,
                        });
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }
}

/// Classify every non-subsample sample site by its vectorized frame stack.
/// This is the map callers iterate when turning per-site quantities into
/// context-keyed cost entries.
#[must_use]
pub fn plate_stacks(trace: &Trace) -> BTreeMap<String, Vec<Frame>> {
    trace
        .sites()
        .iter()
        .filter(|site| site.kind == SiteKind::Sample && !site.subsample)
        .map(|site| (site.name.clone(), site.vectorized_frames()))
        .collect()
}

// ── Trace errors ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceError {
    DuplicateSite {
        name: String,
    },
    MissingEnumTotal {
        site: String,
    },
    MissingFrameAxis {
        site: String,
        frame: String,
    },
    NonNegativeFrameAxis {
        site: String,
        frame: String,
        axis: i32,
    },
}

impl std::fmt::Display for TraceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateSite { name } => {
                write!(f, "duplicate site name: {name}")
            }
            Self::MissingEnumTotal { site } => {
                write!(
                    f,
                    "sequentially enumerated site {site} is missing its enumeration total"
                )
            }
            Self::MissingFrameAxis { site, frame } => {
                write!(f, "vectorized frame {frame} at site {site} has no axis")
            }
            Self::NonNegativeFrameAxis { site, frame, axis } => {
                write!(
                    f,
                    "vectorized frame {frame} at site {site} has non-negative axis {axis}"
                )
            }
        }
    }
}

impl std::error::Error for TraceError {}

#[cfg(test)]
mod tests {
    use super::{Enumerate, InferConfig, Site, SiteKind, Trace, TraceError, plate_stacks};
    use crate::{Frame, Value};

    fn two_plate_trace() -> Trace {
        let outer = Frame::vectorized("outer", -2, 3);
        let inner = Frame::vectorized("inner", -1, 4);

        let mut trace = Trace::new();
        trace.push(Site::sample("top", Value::scalar(-0.5), []));
        trace.push(Site::sample(
            "middle",
            Value::vector(&[-0.1, -0.2, -0.3]).expect("vector should build"),
            [outer.clone()],
        ));
        trace.push(Site::sample(
            "leaf",
            Value::tensor(&[3, 4], vec![-0.1; 12]).expect("tensor should build"),
            [outer, inner],
        ));
        trace
    }

    #[test]
    fn validate_accepts_well_formed_trace() {
        two_plate_trace().validate().expect("trace should validate");
    }

    #[test]
    fn validate_rejects_duplicate_names() {
        let mut trace = two_plate_trace();
        trace.push(Site::sample("top", Value::scalar(0.0), []));
        let err = trace.validate().expect_err("duplicate should be rejected");
        assert_eq!(
            err,
            TraceError::DuplicateSite {
                name: "top".to_owned()
            }
        );
    }

    #[test]
    fn validate_rejects_sequential_without_total() {
        let mut trace = Trace::new();
        let mut infer = InferConfig::sequential(3);
        infer.enum_total = None;
        trace.push(Site::sample("choice", Value::scalar(-1.0), []).with_infer(infer));
        let err = trace.validate().expect_err("missing total should be rejected");
        assert!(matches!(err, TraceError::MissingEnumTotal { site } if site == "choice"));
    }

    #[test]
    fn validate_rejects_non_negative_axes() {
        let mut trace = Trace::new();
        trace.push(Site::sample(
            "bad",
            Value::scalar(-1.0),
            [Frame::vectorized("batch", 0, 5)],
        ));
        let err = trace.validate().expect_err("axis 0 should be rejected");
        assert!(matches!(err, TraceError::NonNegativeFrameAxis { axis: 0, .. }));
    }

    #[test]
    fn plate_stacks_keeps_vectorized_frames_of_sample_sites() {
        let mut trace = two_plate_trace();
        trace.push(
            Site::sample("inner_index", Value::scalar(0.0), [])
                .as_subsample(),
        );
        let mut param = Site::sample("weights", Value::scalar(0.0), []);
        param.kind = SiteKind::Param;
        trace.push(param);

        let stacks = plate_stacks(&trace);
        assert_eq!(stacks.len(), 3);
        assert_eq!(stacks["top"], vec![]);
        assert_eq!(stacks["leaf"].len(), 2);
        assert!(!stacks.contains_key("inner_index"));
        assert!(!stacks.contains_key("weights"));
    }

    #[test]
    fn infer_config_serde_round_trip() {
        let infer = InferConfig::sequential(4);
        let encoded = serde_json::to_string(&infer).expect("serialize should work");
        let decoded: InferConfig = serde_json::from_str(&encoded).expect("deserialize should work");
        assert_eq!(decoded.enumerate, Some(Enumerate::Sequential));
        assert_eq!(decoded.enum_total, Some(4));
    }
}
