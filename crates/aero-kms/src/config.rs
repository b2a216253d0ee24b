use std::time::Duration;

use crate::{KmsError, Result};

/// Tunables of a display controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayConfig {
    /// Unsafe margin before vblank start in which double-buffered registers must not be written.
    pub vblank_evasion_usecs: u32,
    /// Upper bound of the evasion wait. Exceeding it is logged and counted, not fatal.
    pub vblank_evasion_timeout: Duration,
    /// Retries for the two-register legacy frame counter read.
    pub frame_counter_retries: u32,
    /// Poll timeout when waiting for a command buffer to go idle.
    pub command_buffer_timeout: Duration,
    /// Timeout when waiting for the command buffer completion interrupt.
    pub command_buffer_irq_timeout: Duration,
    /// Arm flips through the command buffer engine when the hardware has one.
    pub use_command_buffer: bool,
    /// Non-blocking flips wait for the fence of the new buffer before arming.
    pub async_fences: bool,
    /// Capacity of the bounded interrupt channel.
    pub irq_queue_depth: usize,
    /// Bytes of completion events the client may have outstanding.
    pub event_space: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            vblank_evasion_usecs: 50,
            vblank_evasion_timeout: Duration::from_millis(3),
            frame_counter_retries: 5,
            command_buffer_timeout: Duration::from_millis(1),
            command_buffer_irq_timeout: Duration::from_millis(1000),
            use_command_buffer: true,
            async_fences: true,
            irq_queue_depth: 64,
            event_space: 4096,
        }
    }
}

impl DisplayConfig {
    /// Defaults overridden by `AERO_KMS_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`DisplayConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(v) = parse_var(&lookup, "AERO_KMS_VBLANK_EVASION_USECS")? {
            cfg.vblank_evasion_usecs = v;
        }
        if let Some(v) = parse_var::<u64>(&lookup, "AERO_KMS_VBLANK_EVASION_TIMEOUT_US")? {
            cfg.vblank_evasion_timeout = Duration::from_micros(v);
        }
        if let Some(v) = parse_var(&lookup, "AERO_KMS_FRAME_COUNTER_RETRIES")? {
            cfg.frame_counter_retries = v;
        }
        if let Some(v) = parse_var::<u64>(&lookup, "AERO_KMS_COMMAND_BUFFER_TIMEOUT_US")? {
            cfg.command_buffer_timeout = Duration::from_micros(v);
        }
        if let Some(v) = parse_var::<u64>(&lookup, "AERO_KMS_COMMAND_BUFFER_IRQ_TIMEOUT_MS")? {
            cfg.command_buffer_irq_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_bool(&lookup, "AERO_KMS_USE_COMMAND_BUFFER")? {
            cfg.use_command_buffer = v;
        }
        if let Some(v) = parse_bool(&lookup, "AERO_KMS_ASYNC_FENCES")? {
            cfg.async_fences = v;
        }
        if let Some(v) = parse_var(&lookup, "AERO_KMS_IRQ_QUEUE_DEPTH")? {
            cfg.irq_queue_depth = v;
        }
        if let Some(v) = parse_var(&lookup, "AERO_KMS_EVENT_SPACE")? {
            cfg.event_space = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.irq_queue_depth == 0 {
            return Err(KmsError::InvalidConfig(
                "AERO_KMS_IRQ_QUEUE_DEPTH must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| KmsError::InvalidConfig(format!("invalid value for env var {key}: {raw:?}")))
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(KmsError::InvalidConfig(format!(
            "invalid value for env var {key}: {raw:?}"
        ))),
    }
}
