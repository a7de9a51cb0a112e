//! Client half of the sync core: prediction, reconciliation, interpolation
//! and the read-only mirror, driven by [`session::ClientSession`].

pub mod interpolation;
pub mod mirror;
pub mod predictor;
pub mod reconciliation;
pub mod session;

pub use interpolation::{EntityInterpolator, InterpolatedPose};
pub use mirror::{FeedbackEvent, RemoteMirror};
pub use predictor::{ClientPredictor, InputIntent, PredictedPlayer};
pub use reconciliation::{CorrectionTier, Reconciliation, ReconciliationEngine};
pub use session::ClientSession;
