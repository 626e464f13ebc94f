//! Tiered access: which slice of the data a caller sees and which counts
//! are suppressed.

mod mediator;
mod redact;

pub use mediator::{Decision, Outcome, TierRequest, TieredAccessMediator};
pub use redact::{RedactionPolicy, REDACTED};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AccessLevel {
    /// No interception.
    Libre,
    /// Disclose everything, redact small out-of-scope counts.
    Regular,
    /// Site-wide only: defer to each index's own level.
    Granular,
    /// Only accessible data exists for the caller.
    Private,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Accessibility {
    #[default]
    All,
    Accessible,
    Unaccessible,
}
