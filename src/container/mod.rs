//! Container model: immutable launch specs, the supervisor-side container
//! state machine and the pod/handle registry.

pub mod container;
pub mod registry;
pub mod spec;

pub use container::{Container, ContainerStatus};
pub use registry::{NamespaceHandle, Registry};
pub use spec::{
    CgroupLimits, ContainerSpec, ExecutionMode, FsConfig, NamespaceConfig, NamespaceType,
    ShareSpec, WorkloadSpec,
};

pub const ID_PREFIX: &str = "bctor-";

/// Splits `bctor-<letter><index>` into its pod letter and member index.
pub fn split_container_id(id: &str) -> Option<(char, u32)> {
    let rest = id.strip_prefix(ID_PREFIX)?;
    let mut chars = rest.chars();
    let letter = chars.next()?;
    if !letter.is_ascii_lowercase() {
        return None;
    }
    let digits: String = chars.collect();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(|index| (letter, index))
}

/// Accepts both `a1` and `bctor-a1` and returns the canonical id.
pub fn canonical_id(input: &str) -> String {
    if input.starts_with(ID_PREFIX) {
        input.to_string()
    } else {
        format!("{}{}", ID_PREFIX, input)
    }
}

/// Builds the canonical id of a pod member.
pub fn member_id(letter: char, index: u32) -> String {
    format!("{}{}{}", ID_PREFIX, letter, index)
}

/// Extracts the pod letter from a bare letter, a short member id or a
/// canonical one.
pub fn pod_letter_from(input: &str) -> Option<char> {
    let mut chars = input.chars();
    if let (Some(letter), None) = (chars.next(), chars.next()) {
        if letter.is_ascii_lowercase() {
            return Some(letter);
        }
    }
    split_container_id(&canonical_id(input)).map(|(letter, _)| letter)
}
