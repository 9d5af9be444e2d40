//! Session behavioral engine: persistent session lifecycle plus the pure
//! multi-signal risk scorer that drives mid-session termination.

pub mod behavior;
pub mod store;

pub use behavior::{BehaviorAssessment, BehaviorScorer, RiskBand, TxnObservation};
pub use store::{Session, SessionEvent, SessionStore};
