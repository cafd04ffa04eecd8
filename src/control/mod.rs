//! Control plane - on-demand bootstrap metadata issuance.
//!
//! Runs orthogonally to the data path: nothing here is triggered by frame
//! completion, only by session start or a downstream consumer needing to
//! (re)bootstrap.

mod issuer;

pub use issuer::{DescriptorIssuer, EqMeta, Labelling, StaticMeta, TimingMeta};
