use std::fmt::{Debug, Formatter};

pub mod sync;

pub struct DebugStr(pub String);

impl Debug for DebugStr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Formats an IL offset the way disassemblers print labels.
pub fn il_label(offset: usize) -> DebugStr {
    DebugStr(format!("IL_{:04x}", offset))
}

/// Parses a boolean-ish environment flag (`1` or `true`).
pub fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Parses a numeric environment setting, falling back to `default` when unset or malformed.
pub fn env_number<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_il_label() {
        assert_eq!(format!("{:?}", il_label(0x1f)), "IL_001f");
    }

    #[test]
    fn test_env_number_fallback() {
        assert_eq!(env_number("CIL_VM_SURELY_UNSET_SETTING", 42u64), 42);
    }
}
