use crate::models::CommandSpec;
use sha2::{Digest, Sha256};

pub fn sha256_hex(input: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_ref());
    hex::encode(hasher.finalize())
}

/// Digest of the resolved configuration a run would execute with.
///
/// A non-empty `mode_tag` replaces the command tuple entirely.
pub fn mode_hash(spec: &CommandSpec, mode_tag: Option<&str>) -> String {
    if let Some(tag) = mode_tag.map(str::trim).filter(|tag| !tag.is_empty()) {
        return sha256_hex(tag);
    }
    let args = spec.args.join(" ");
    let mut parts = vec![
        spec.agent.clone(),
        spec.role.clone(),
        spec.model.clone(),
        spec.reasoning.clone(),
        spec.cmd.clone(),
        args,
        spec.cwd.clone(),
    ];
    // BTreeMap iteration keeps env pairs sorted by key.
    parts.extend(spec.env.iter().map(|(key, value)| format!("{}={}", key, value)));
    sha256_hex(parts.join("|"))
}

pub fn prompt_hash(prompt: &str) -> String {
    if prompt.is_empty() {
        return String::new();
    }
    sha256_hex(prompt)
}
