//! # Orchestration
//!
//! Turns uploads into resize work.
//!
//! - [`PresetCatalog`]: the ordered, validated list of output sizes
//! - [`derive_target_uri`]: pure naming rule `{stem}_{width}x{height}{.ext}`
//! - [`FanOutOrchestrator`]: `image-uploaded` → N × `image-resize`

pub mod fan_out;
pub mod presets;

pub use fan_out::{FanOutOrchestrator, FanOutOutcome};
pub use presets::{derive_target_uri, file_stem, PresetCatalog, PresetError, ResizePreset};
