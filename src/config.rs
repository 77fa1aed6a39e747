//! JIT configuration
//!
//! Every knob has a default so a partial JSON document (or none at all) yields
//! a usable configuration. Inlining thresholds are the base values from which
//! each work item derives its own `InliningThresholds`.

use crate::error::{Error, Result};
use crate::jit::lower::machine::Arch;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level JIT configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    /// Master switch; when off every function stays interpreted
    pub enabled: bool,
    /// Compile on a background thread instead of at the triggering call
    pub background: bool,
    /// Route compilation through the out-of-process compile server
    pub out_of_process: bool,
    /// Target machine description used by the lowerer
    pub arch: Arch,
    /// Maximum interpreter/compiled call depth
    pub max_call_depth: usize,
    pub tiers: TierConfig,
    pub inlining: InliningConfig,
    pub security: SecurityConfig,
    pub codegen: CodegenConfig,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            background: true,
            out_of_process: false,
            arch: Arch::host(),
            max_call_depth: 512,
            tiers: TierConfig::default(),
            inlining: InliningConfig::default(),
            security: SecurityConfig::default(),
            codegen: CodegenConfig::default(),
        }
    }
}

/// Tier promotion thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    pub simple_jit_enabled: bool,
    pub full_jit_enabled: bool,
    /// Calls before a function is queued for SimpleJIT
    pub simple_jit_call_threshold: u64,
    /// Calls before a function is queued for FullJIT
    pub full_jit_call_threshold: u64,
    /// Loop iterations (summed over the function) before SimpleJIT
    pub simple_jit_loop_threshold: u64,
    /// Loop iterations before FullJIT
    pub full_jit_loop_threshold: u64,
    /// Iterations of one interpreted loop before its body is compiled alone
    pub loop_body_threshold: u64,
    /// Bailouts at one site before the function is recompiled at the same tier
    pub rejit_bailout_threshold: u32,
    /// Cap on same-tier recompilations per function
    pub max_rejit_attempts: u32,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            simple_jit_enabled: true,
            full_jit_enabled: true,
            simple_jit_call_threshold: 64,
            full_jit_call_threshold: 256,
            simple_jit_loop_threshold: 1_000,
            full_jit_loop_threshold: 4_000,
            loop_body_threshold: 1_000,
            rejit_bailout_threshold: 8,
            max_rejit_attempts: 2,
        }
    }
}

/// Base inlining thresholds, measured in non-load bytecode instructions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InliningConfig {
    pub enabled: bool,
    pub allow_recursive: bool,
    pub inline_threshold: u32,
    pub constructor_threshold: u32,
    pub outside_loop_threshold: u32,
    pub leaf_threshold: u32,
    pub loop_threshold: u32,
    pub polymorphic_threshold: u32,
    pub constant_argument_threshold: u32,
    pub max_inlinees_with_loops: u32,
    pub inline_count_max: u32,
    pub loop_body_inline_count_max: u32,
    pub aggressive_threshold: u32,
    pub aggressive_inline_count_max: u32,
    /// Monomorphic hits a call site needs before aggressive thresholds apply
    pub aggressive_call_site_hits: u32,
    pub recursive_inline_threshold: u32,
    pub inline_depth_max: u32,
}

impl Default for InliningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_recursive: true,
            inline_threshold: 35,
            constructor_threshold: 21,
            outside_loop_threshold: 16,
            leaf_threshold: 60,
            loop_threshold: 25,
            polymorphic_threshold: 35,
            constant_argument_threshold: 157,
            max_inlinees_with_loops: 40,
            inline_count_max: 1200,
            loop_body_inline_count_max: 500,
            aggressive_threshold: 80,
            aggressive_inline_count_max: 8000,
            aggressive_call_site_hits: 10_000,
            recursive_inline_threshold: 2,
            inline_depth_max: 8,
        }
    }
}

impl InliningConfig {
    /// Inlining turned off entirely
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Constant blinding and NOP insertion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub constant_blinding: bool,
    /// Constants with fewer "interesting" bytes than this stay in the clear
    pub min_set_bytes: u32,
    pub nop_insertion: bool,
    /// One NOP on average every this many safe boundaries
    pub nop_frequency: u32,
    /// Longest NOP emitted, in bytes
    pub max_nop_length: u8,
    /// Fixed cookie; a random one is drawn per context when unset
    pub cookie: Option<u64>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            constant_blinding: true,
            min_set_bytes: 2,
            nop_insertion: true,
            nop_frequency: 8,
            max_nop_length: 8,
            cookie: None,
        }
    }
}

impl SecurityConfig {
    /// No hardening at all (used by disassembly and some tests)
    pub fn disabled() -> Self {
        Self {
            constant_blinding: false,
            nop_insertion: false,
            ..Self::default()
        }
    }
}

/// Executable memory limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodegenConfig {
    pub page_size: usize,
    /// Upper bound on live executable bytes
    pub max_code_bytes: usize,
    /// Pages reserved up front for code (control-flow-guard style); 0 disables
    pub reserve_pages: usize,
}

impl Default for CodegenConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            max_code_bytes: 64 * 1024 * 1024,
            reserve_pages: 0,
        }
    }
}

impl JitConfig {
    /// Compile synchronously at the triggering call; deterministic tiering
    pub fn synchronous() -> Self {
        Self {
            background: false,
            ..Self::default()
        }
    }

    /// Never compile
    pub fn interpreter_only() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Parse a JSON configuration document
    pub fn from_json(text: &str) -> Result<Self> {
        let config: JitConfig =
            serde_json::from_str(text).map_err(|e| Error::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::ConfigError(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let tiers = &self.tiers;
        if tiers.simple_jit_call_threshold == 0 || tiers.full_jit_call_threshold == 0 {
            return Err(Error::ConfigError("call thresholds must be positive".into()));
        }
        if tiers.simple_jit_enabled && tiers.full_jit_call_threshold < tiers.simple_jit_call_threshold {
            return Err(Error::ConfigError(format!(
                "full_jit_call_threshold ({}) is below simple_jit_call_threshold ({})",
                tiers.full_jit_call_threshold, tiers.simple_jit_call_threshold
            )));
        }
        if tiers.rejit_bailout_threshold == 0 {
            return Err(Error::ConfigError("rejit_bailout_threshold must be positive".into()));
        }
        if self.security.max_nop_length == 0 {
            return Err(Error::ConfigError("max_nop_length must be at least 1".into()));
        }
        if self.security.nop_frequency == 0 {
            return Err(Error::ConfigError("nop_frequency must be positive".into()));
        }
        if !self.codegen.page_size.is_power_of_two() {
            return Err(Error::ConfigError(format!(
                "page_size {} is not a power of two",
                self.codegen.page_size
            )));
        }
        if self.max_call_depth == 0 {
            return Err(Error::ConfigError("max_call_depth must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        assert!(JitConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = JitConfig::from_json(r#"{ "background": false, "tiers": { "simple_jit_call_threshold": 2, "full_jit_call_threshold": 4 } }"#)
            .unwrap();
        assert!(!config.background);
        assert_eq!(config.tiers.simple_jit_call_threshold, 2);
        assert_eq!(config.tiers.loop_body_threshold, 1_000);
        assert_eq!(config.inlining, InliningConfig::default());
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let err = JitConfig::from_json(r#"{ "tiers": { "simple_jit_call_threshold": 100, "full_jit_call_threshold": 10 } }"#)
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "out_of_process": true, "codegen": {{ "max_code_bytes": 8192 }} }}"#).unwrap();
        let config = JitConfig::load(file.path()).unwrap();
        assert!(config.out_of_process);
        assert_eq!(config.codegen.max_code_bytes, 8192);
    }

    #[test]
    fn test_json_round_trip() {
        let mut config = JitConfig::synchronous();
        config.security.cookie = Some(0xdead_beef);
        let text = config.to_json().unwrap();
        assert_eq!(JitConfig::from_json(&text).unwrap(), config);
    }
}
