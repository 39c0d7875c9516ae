//! Engine executable discovery.
//!
//! Resolution order for the executable: explicit config, then each
//! environment variable the engine defines, then a PATH search over the
//! engine's candidate names. Flags come from config, then the flags
//! environment variable, then the engine defaults. The environment is read
//! once per call; nothing is cached between sessions.

use std::path::{Path, PathBuf};

use octbridge_core::SessionConfig;

use crate::{CommandBuilder, LaunchSpec, ProcessError, split_command_line};

/// Discovery defaults for one engine.
#[derive(Debug, Clone, Copy)]
pub struct EngineDefaults {
    /// Environment variables naming the executable, checked in order.
    pub executable_vars: &'static [&'static str],
    /// Environment variable holding default startup flags.
    pub flags_var: Option<&'static str>,
    /// Program names searched on PATH, in order.
    pub candidates: &'static [&'static str],
    /// Flags used when neither config nor environment provide any.
    pub flags: &'static [&'static str],
}

/// Resolve an executable by name or path.
///
/// Explicit paths (absolute or containing a separator) must name an existing
/// file; bare names are searched on the current PATH.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() || path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }

    which_async(executable).await
}

async fn which_async(executable: &str) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}

/// Resolve the launch command for a session from the process environment.
///
/// # Errors
/// Returns [`ProcessError::NotFound`] if no executable can be located, or a
/// build error if the flags variable cannot be parsed.
pub async fn locate_engine(
    config: &SessionConfig,
    defaults: &EngineDefaults,
) -> Result<LaunchSpec, ProcessError> {
    locate_engine_with(config, defaults, |key| std::env::var(key).ok()).await
}

/// Same as [`locate_engine`] with an explicit environment lookup.
///
/// # Errors
/// See [`locate_engine`].
pub async fn locate_engine_with<F>(
    config: &SessionConfig,
    defaults: &EngineDefaults,
    env: F,
) -> Result<LaunchSpec, ProcessError>
where
    F: Fn(&str) -> Option<String>,
{
    let program = find_program(config, defaults, &env).await?;

    let builder = CommandBuilder::new(program);
    let builder = if let Some(flags) = &config.flags {
        builder.params(flags.iter().cloned())
    } else if let Some(flags) = defaults
        .flags_var
        .and_then(&env)
        .filter(|s| !s.trim().is_empty())
    {
        builder.params(split_command_line(&flags)?)
    } else {
        builder.params(defaults.flags.iter().copied())
    };

    let spec = LaunchSpec::new(builder.build()?)
        .with_working_dir(config.working_dir.clone())
        .with_env(config.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    tracing::debug!(program = %spec.program.display(), args = ?spec.args, "located engine");
    Ok(spec)
}

async fn find_program<F>(
    config: &SessionConfig,
    defaults: &EngineDefaults,
    env: &F,
) -> Result<PathBuf, ProcessError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(explicit) = &config.executable {
        let name = explicit.to_string_lossy();
        return resolve_executable_path(&name)
            .await
            .ok_or_else(|| ProcessError::NotFound(format!("configured executable {name}")));
    }

    for var in defaults.executable_vars {
        let Some(value) = env(var).filter(|v| !v.trim().is_empty()) else {
            continue;
        };
        return resolve_executable_path(&value)
            .await
            .ok_or_else(|| ProcessError::NotFound(format!("{var}={value}")));
    }

    for candidate in defaults.candidates {
        if let Some(found) = resolve_executable_path(candidate).await {
            return Ok(found);
        }
    }

    Err(ProcessError::NotFound(format!(
        "none of {} on PATH; set {} to the engine executable",
        defaults.candidates.join(", "),
        defaults.executable_vars.first().copied().unwrap_or("the executable option")
    )))
}
