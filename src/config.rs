use std::env;

/// Channel capacity (in chunks) for the streaming response body when neither
/// the environment nor the handler specifies one.
pub const DEFAULT_STREAM_HWM: usize = 16;

#[derive(Debug, Clone)]
pub struct Config {
    /// `host:port` of the local Runtime API endpoint.
    pub runtime_api: String,
    pub function_name: Option<String>,
    pub function_version: Option<String>,
    pub memory_size_mb: Option<u32>,
    pub log_group_name: Option<String>,
    /// High-water mark for the streaming response channel.
    pub stream_hwm: usize,
    /// When set, the process-wide panic hook is not installed.
    pub no_global_hooks: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let runtime_api = env::var("AWS_LAMBDA_RUNTIME_API")
            .map_err(|_| anyhow::anyhow!("missing AWS_LAMBDA_RUNTIME_API"))?;

        let stream_hwm = env::var("LAMBDA_RUNTIME_STREAM_HWM")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_STREAM_HWM);

        let no_global_hooks = env::var("LAMBDA_RUNTIME_NO_GLOBAL_HOOKS")
            .map(|v| is_truthy(&v))
            .unwrap_or(false);

        Ok(Self {
            runtime_api,
            function_name: env::var("AWS_LAMBDA_FUNCTION_NAME").ok(),
            function_version: env::var("AWS_LAMBDA_FUNCTION_VERSION").ok(),
            memory_size_mb: env::var("AWS_LAMBDA_FUNCTION_MEMORY_SIZE")
                .ok()
                .and_then(|v| v.trim().parse::<u32>().ok()),
            log_group_name: env::var("AWS_LAMBDA_LOG_GROUP_NAME").ok(),
            stream_hwm,
            no_global_hooks,
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.runtime_api)
    }
}

fn is_truthy(value: &str) -> bool {
    !matches!(value.trim(), "" | "0" | "false" | "FALSE" | "no")
}
