use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("failed to load {path}: {message}")]
    Load { path: String, message: String },
    #[error("failed to write {path}: {message}")]
    Write { path: String, message: String },
    #[error("malformed ray cloud: {0}")]
    Format(String),
    #[error(
        "ray arrays have inconsistent lengths (starts {starts}, ends {ends}, times {times}, colours {colours})"
    )]
    InconsistentArrays {
        starts: usize,
        ends: usize,
        times: usize,
        colours: usize,
    },
    #[error("invalid settings: {0}")]
    Settings(String),
}

impl CloudError {
    pub(crate) fn load(path: &Path, message: impl ToString) -> Self {
        Self::Load {
            path: path.display().to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn write(path: &Path, message: impl ToString) -> Self {
        Self::Write {
            path: path.display().to_string(),
            message: message.to_string(),
        }
    }

    /// Attaches a file path to a format error raised while decoding it.
    pub(crate) fn in_file(self, path: &Path) -> Self {
        match self {
            Self::Format(message) => Self::load(path, message),
            other => other,
        }
    }
}
