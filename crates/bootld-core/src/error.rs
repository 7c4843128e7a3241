use std::path::PathBuf;

/// Failures that end a launch before the child's status is known.
#[derive(Debug)]
pub enum LaunchError {
    /// No candidate root accepted a scratch directory.
    ScratchUnavailable { checked: Vec<PathBuf> },
    /// The child could not be created.
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    /// The child was created but its status could not be collected.
    Wait { source: std::io::Error },
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::ScratchUnavailable { checked } => {
                write!(f, "cannot create temporary directory")?;
                if !checked.is_empty() {
                    write!(f, "\n\nlooked in:")?;
                    for p in checked {
                        write!(f, "\n  - {}", p.display())?;
                    }
                }
                Ok(())
            }
            LaunchError::Spawn { program, source } => {
                write!(f, "failed to start child {}: {source}", program.display())
            }
            LaunchError::Wait { source } => {
                write!(f, "failed to wait for child process: {source}")
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::ScratchUnavailable { .. } => None,
            LaunchError::Spawn { source, .. } | LaunchError::Wait { source } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_error_lists_candidates() {
        let err = LaunchError::ScratchUnavailable {
            checked: vec![PathBuf::from("/tmp"), PathBuf::from("/var/tmp")],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("cannot create temporary directory"));
        assert!(msg.contains("  - /tmp"));
        assert!(msg.contains("  - /var/tmp"));
    }

    #[test]
    fn downcasts_through_anyhow() {
        let err: anyhow::Error = LaunchError::Wait {
            source: std::io::Error::from_raw_os_error(libc::ECHILD),
        }
        .into();
        assert!(matches!(
            err.downcast_ref::<LaunchError>(),
            Some(LaunchError::Wait { .. })
        ));
    }
}
