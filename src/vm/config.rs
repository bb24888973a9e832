use crate::error::EngineError;
use clap::ValueEnum;
use std::{env, str::FromStr};

/// How arguments reach the callee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CallingConvention {
    /// Words on the evaluation stack, run by an [`Interpreter`](super::Interpreter).
    #[default]
    Interpreter,
    /// Pointer array handed to a [`NativeBackend`](super::NativeBackend).
    Native,
}

/// Where an object's lock word lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LockMode {
    /// In the object header.
    #[default]
    Header,
    /// In the weakly keyed side table.
    Thin,
}

fn parse_enum<T: ValueEnum>(var: &str, value: &str) -> Result<T, EngineError> {
    T::from_str(value, true).map_err(|_| EngineError::Config(format!("{var}={value}")))
}

fn parse_num<T: FromStr>(var: &str, value: &str) -> Result<T, EngineError> {
    value
        .parse()
        .map_err(|_| EngineError::Config(format!("{var}={value}")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub convention: CallingConvention,
    pub lock_mode: LockMode,
    /// Evaluation stack size of every engine thread, in words.
    pub stack_words: usize,
    /// Frames preallocated per thread before overflow growth kicks in.
    pub initial_frames: usize,
    pub max_frames: usize,
    /// Native entry points take the executing thread as a leading argument.
    pub thread_in_signature: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            convention: CallingConvention::default(),
            lock_mode: LockMode::default(),
            stack_words: 64 * 1024,
            initial_frames: 16,
            max_frames: 4096,
            thread_in_signature: true,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `DOTNET_ENGINE_*` variables.
    pub fn from_env() -> Result<Self, EngineError> {
        let mut config = Self::default();
        for (var, value) in env::vars().filter(|(k, _)| k.starts_with("DOTNET_ENGINE_")) {
            match var.as_str() {
                "DOTNET_ENGINE_CONVENTION" => config.convention = parse_enum(&var, &value)?,
                "DOTNET_ENGINE_LOCK_MODE" => config.lock_mode = parse_enum(&var, &value)?,
                "DOTNET_ENGINE_STACK_WORDS" => config.stack_words = parse_num(&var, &value)?,
                "DOTNET_ENGINE_MAX_FRAMES" => config.max_frames = parse_num(&var, &value)?,
                _ => {}
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_convention(mut self, convention: CallingConvention) -> Self {
        self.convention = convention;
        self
    }

    pub fn with_lock_mode(mut self, lock_mode: LockMode) -> Self {
        self.lock_mode = lock_mode;
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.stack_words == 0 {
            return Err(EngineError::Config("stack_words must be positive".into()));
        }
        if self.max_frames == 0 || self.initial_frames > self.max_frames {
            return Err(EngineError::Config(format!(
                "frame limits {}/{} are inconsistent",
                self.initial_frames, self.max_frames
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_helpers() {
        assert_eq!(
            parse_enum::<LockMode>("DOTNET_ENGINE_LOCK_MODE", "thin"),
            Ok(LockMode::Thin)
        );
        assert_eq!(
            parse_enum::<CallingConvention>("DOTNET_ENGINE_CONVENTION", "Native"),
            Ok(CallingConvention::Native)
        );
        assert!(parse_enum::<LockMode>("DOTNET_ENGINE_LOCK_MODE", "fat").is_err());
        assert!(parse_num::<usize>("DOTNET_ENGINE_STACK_WORDS", "-3").is_err());
    }

    #[test]
    fn test_validate_frame_limits() {
        let config = EngineConfig {
            initial_frames: 32,
            max_frames: 8,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(EngineConfig::default().validate().is_ok());
    }
}
