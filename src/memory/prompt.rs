use crate::errors::{AppError, AppResult};
use crate::memory::store::{normalize_key, MemoryStore};

pub const SHARED_KEY: &str = "shared";
pub const ROLE_KEY_PREFIX: &str = "role:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectMode {
    Prepend,
    Append,
}

impl InjectMode {
    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "prepend" | "prefix" => Ok(Self::Prepend),
            "append" | "suffix" => Ok(Self::Append),
            other => Err(AppError::InvalidInput(format!("unknown memory mode: {}", other))),
        }
    }
}

/// `role` if set, else `agent`, else `unknown`.
pub fn memory_label(agent: &str, role: &str) -> String {
    [role, agent]
        .iter()
        .map(|value| value.trim())
        .find(|value| !value.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

fn memory_block(key: &str, value: &str) -> String {
    format!("[shared-memory:{}]\n{}\n[/shared-memory]", key, value)
}

fn role_block(label: &str, value: &str) -> String {
    format!("[role:{}]\n{}\n[/role]", label, value)
}

pub fn apply_shared_memory(store: &MemoryStore, prompt: &str) -> String {
    let Some(entry) = store.get(SHARED_KEY) else {
        return prompt.to_string();
    };
    let value = entry.value.trim();
    if value.is_empty() {
        return prompt.to_string();
    }
    format!("{}\n\n{}", memory_block(SHARED_KEY, value), prompt)
}

/// Wraps the entry under `key` around `prompt`. A blank key leaves the
/// prompt untouched.
pub fn apply_memory_to_prompt(
    store: &MemoryStore,
    prompt: &str,
    key: &str,
    mode: &str,
) -> AppResult<String> {
    if key.is_empty() {
        return Ok(prompt.to_string());
    }
    let key = normalize_key(key)?;
    let mode = InjectMode::parse(mode)?;
    let entry = store
        .get(&key)
        .ok_or_else(|| AppError::NotFound(format!("memory not found: {}", key)))?;
    let block = memory_block(&key, &entry.value);
    Ok(match mode {
        InjectMode::Prepend => format!("{}\n\n{}", block, prompt),
        InjectMode::Append => format!("{}\n\n{}", prompt, block),
    })
}

/// Broadcasts an agent's output under its role key and into `shared`.
pub fn remember_output(store: &MemoryStore, agent: &str, role: &str, output: &str) {
    let output = output.trim();
    if output.is_empty() {
        return;
    }
    let label = memory_label(agent, role);
    let role_key = format!("{}{}", ROLE_KEY_PREFIX, label);
    if let Err(error) = store.append_auto(&role_key, output, None) {
        tracing::warn!(key = %role_key, error = %error, "remembering role output failed");
    }
    if let Err(error) = store.append_auto(SHARED_KEY, &role_block(&label, output), None) {
        tracing::warn!(key = SHARED_KEY, error = %error, "remembering shared output failed");
    }
}
