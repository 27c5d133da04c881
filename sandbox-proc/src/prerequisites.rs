use std::path::Path;

use sandbox::SandboxError;

use crate::config::ProcessFactoryConfig;

/// Verify that all required system prerequisites are present before the factory starts.
///
/// Checks the interpreter and the base directory.
/// Collects all failures and returns them in a single `BackendNotAvailable` error.
pub async fn check_prerequisites(config: &ProcessFactoryConfig) -> Result<(), SandboxError> {
    let mut errors = Vec::new();

    check_interpreter(&config.interpreter, &mut errors);
    check_base_dir(&config.base_dir, &mut errors).await;

    if errors.is_empty() {
        Ok(())
    } else {
        Err(SandboxError::BackendNotAvailable(errors.join("; ")))
    }
}

fn check_interpreter(interpreter: &[String], errors: &mut Vec<String>) {
    match interpreter.first() {
        None => errors.push("interpreter command is empty".to_string()),
        Some(program) => {
            if which::which(program).is_err() {
                errors.push(format!("interpreter not found: {program}"));
            }
        }
    }
}

async fn check_base_dir(base_dir: &Path, errors: &mut Vec<String>) {
    if let Err(e) = tokio::fs::create_dir_all(base_dir).await {
        errors.push(format!("base dir {} not usable: {e}", base_dir.display()));
    }
}
