use thiserror::Error;

/// 启动进程前即被拒绝的请求
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Bad stream name '{0}': use letters, digits, '_' or '-'")]
    BadName(String),

    #[error("Bad stream type '{0}': expected 'file' or 'network'")]
    BadSourceKind(String),

    #[error("No source URL provided for network stream")]
    MissingUrl,

    #[error("No file path provided for file stream")]
    MissingFile,

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Path is not a file: {0}")]
    NotAFile(String),

    #[error("Invalid file type for '{path}'. Allowed: {allowed}")]
    BadExtension { path: String, allowed: String },

    #[error("Bad resolution '{0}'")]
    BadResolution(String),

    #[error("Unsupported video codec '{0}'")]
    BadCodec(String),

    #[error("Bad duration '{0}': must be between 0 and 8760 hours")]
    BadDuration(String),
}

/// 编码器检测失败
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("No encoders available for {0}")]
    NoEncoderAvailable(String),
}

/// 监管器控制操作的错误
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("Stream '{0}' is already active")]
    AlreadyActive(String),

    /// 启动出错，或进程在启动确认窗口内退出
    #[error("{message}")]
    StartFailure { message: String, command: String },

    #[error("Could not resolve hosted video URL '{url}': {reason}")]
    SourceResolution { url: String, reason: String },

    #[error("Stream '{0}' is not actively managed and no PID file was found")]
    NotActive(String),

    #[error("Supervisor is shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// 已构建命令时返回尝试执行的命令行
    pub fn command(&self) -> Option<&str> {
        match self {
            SupervisorError::StartFailure { command, .. } => Some(command),
            _ => None,
        }
    }
}

/// 配置错误，存在时拒绝启动
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("Cannot prepare runtime directory {path}: {source}")]
    RuntimeDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
