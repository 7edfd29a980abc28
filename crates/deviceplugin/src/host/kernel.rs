use thiserror::Error;

/// Reasons a kernel release string has no ordinal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KernelVersionError {
    #[error("kernel version {0:?} does not start with a version number")]
    Malformed(String),
    #[error("kernel version {0:?} needs at least a major and a minor component")]
    TooShort(String),
    #[error("kernel version {version:?} component {component:?} is out of range")]
    OutOfRange { version: String, component: String },
}

const COMPONENT_BITS: u32 = 16;
const COMPONENT_MAX: u64 = (1 << COMPONENT_BITS) - 1;

/// Packs `major.minor.patch` into one integer that orders like the version.
///
/// Anything after the numeric prefix (`-91-generic`, `+`, `-rc3`) is ignored,
/// a missing patch component counts as zero and components past the third are
/// dropped. Each component must fit in 16 bits.
pub fn kernel_version_ordinal(version: &str) -> Result<u64, KernelVersionError> {
    let trimmed = version.trim();
    let numeric_end = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let numeric = trimmed[..numeric_end].trim_end_matches('.');

    if numeric.is_empty() {
        return Err(KernelVersionError::Malformed(version.to_string()));
    }

    let components = numeric.split('.').take(3).collect::<Vec<_>>();
    if components.len() < 2 {
        return Err(KernelVersionError::TooShort(version.to_string()));
    }

    let mut ordinal = 0u64;
    for index in 0..3 {
        let value = match components.get(index) {
            Some(component) => parse_component(version, component)?,
            None => 0,
        };
        ordinal = (ordinal << COMPONENT_BITS) | value;
    }
    Ok(ordinal)
}

fn parse_component(version: &str, component: &str) -> Result<u64, KernelVersionError> {
    if component.is_empty() {
        return Err(KernelVersionError::Malformed(version.to_string()));
    }
    component
        .parse::<u64>()
        .ok()
        .filter(|value| *value <= COMPONENT_MAX)
        .ok_or_else(|| KernelVersionError::OutOfRange {
            version: version.to_string(),
            component: component.to_string(),
        })
}
