//! Format Catalog
//!
//! Lists the formats a device offers for a given subtype.

use shutter_common::FormatDescriptor;
use tracing::debug;

use super::device::{CaptureDevice, SourceKind};

/// Enumerate the formats of all colour sources of `device` whose subtype
/// matches `subtype` (ASCII case-insensitive), in source order.
pub fn list_formats(device: &dyn CaptureDevice, subtype: &str) -> Vec<FormatDescriptor> {
    let formats: Vec<FormatDescriptor> = device
        .sources()
        .iter()
        .filter(|source| source.kind() == SourceKind::Color)
        .flat_map(|source| source.supported_formats())
        .filter(|format| format.has_subtype(subtype))
        .collect();

    debug!(
        device = %device.info().id,
        subtype,
        count = formats.len(),
        "Enumerated capture formats"
    );
    formats
}
