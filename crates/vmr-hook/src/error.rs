#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("invalid hook definition: {message}")]
    InvalidEvent { message: String },
    #[error("hook command failed to start ({command}): {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed waiting on hook command ({command}): {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::HookError;
    use std::error::Error;

    #[test]
    fn invalid_event_variant_renders_message() {
        let err = HookError::InvalidEvent {
            message: "command must not be empty".to_string(),
        };

        assert!(err
            .to_string()
            .contains("invalid hook definition: command must not be empty"));
        assert!(err.source().is_none());
    }

    #[test]
    fn spawn_variant_includes_command_and_preserves_source() {
        let err = HookError::Spawn {
            command: "cmd.exe /c prepare.bat".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };

        let rendered = err.to_string();
        assert!(rendered.contains("hook command failed to start"));
        assert!(rendered.contains("(cmd.exe /c prepare.bat)"));
        assert!(rendered.contains("not found"));
        assert!(err.source().is_some());
    }
}
